//! Match conditions for handles
//!
//! A condition is a conjunction of clauses of the form `lhs op rhs`. The
//! left side names a variable, the right side is a literal. Every clause
//! must hold for the condition to match.

use crate::context::RequestContext;
use crate::error::CompileError;
use crate::vars;
use regex::Regex;

#[derive(Debug, Clone)]
enum Op {
    Eq(String),
    Ne(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Regex(Regex),
}

/// Operators in scan order; two-character operators only
const OPERATORS: [&str; 6] = ["==", "!=", "^=", "$=", "*=", "~="];

#[derive(Debug, Clone)]
struct Clause {
    name: String,
    op: Op,
}

impl Clause {
    fn parse(text: &str) -> Result<Self, CompileError> {
        let (pos, op) = OPERATORS
            .iter()
            .filter_map(|op| text.find(op).map(|pos| (pos, *op)))
            .min_by_key(|(pos, _)| *pos)
            .ok_or_else(|| CompileError::Invalid(format!("filter `{}`: missing operator", text)))?;

        let name = text[..pos].trim();
        let value = unquote(text[pos + op.len()..].trim());
        if name.is_empty() {
            return Err(CompileError::Invalid(format!(
                "filter `{}`: missing variable name",
                text
            )));
        }

        let op = match op {
            "==" => Op::Eq(value),
            "!=" => Op::Ne(value),
            "^=" => Op::Prefix(value),
            "$=" => Op::Suffix(value),
            "*=" => Op::Contains(value),
            _ => Op::Regex(Regex::new(&value).map_err(|e| {
                CompileError::Invalid(format!("filter `{}`: {}", text, e))
            })?),
        };

        Ok(Self {
            name: name.to_string(),
            op,
        })
    }

    fn matches(&self, ctx: &RequestContext) -> bool {
        let Some(actual) = vars::resolve(ctx, &self.name) else {
            return matches!(self.op, Op::Ne(_));
        };
        match &self.op {
            Op::Eq(v) => actual == v.as_str(),
            Op::Ne(v) => actual != v.as_str(),
            Op::Prefix(v) => actual.starts_with(v.as_str()),
            Op::Suffix(v) => actual.ends_with(v.as_str()),
            Op::Contains(v) => actual.contains(v.as_str()),
            Op::Regex(re) => re.is_match(&actual),
        }
    }
}

fn unquote(value: &str) -> String {
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')));
    if quoted {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

/// A compiled match predicate
#[derive(Debug, Clone)]
pub struct Condition {
    clauses: Vec<Clause>,
}

impl Condition {
    /// Parse a list of clauses, all of which must hold
    pub fn parse<I, S>(clauses: I) -> Result<Self, CompileError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let clauses = clauses
            .into_iter()
            .map(|c| Clause::parse(c.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { clauses })
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, ctx: &RequestContext) -> bool {
        self.clauses.iter().all(|c| c.matches(ctx))
    }
}
