//! Placeholder templates for response bodies and access-log lines
//!
//! A format string such as `"hello ${host} ${uri}"` is compiled once into an
//! ordered list of literal and variable segments. Rendering walks the list
//! against a request context. A placeholder whose variable resolves to
//! nothing is rendered as the original `${name}` text so unresolved tokens
//! stay visible.

use crate::context::RequestContext;
use crate::vars;
use regex::Regex;
use std::sync::OnceLock;

/// Default access-log line
pub const DEFAULT_ACCESS_FORMAT: &str = "[${time}] - [${remote_port}] - ${server_addr}:${server_port} ${remote_addr} \
${method} [${scheme}] [${host}] ${uri} ${query} ${ua} ${referer} ${status} ${size} ${region_city}";

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([a-zA-Z0-9_]+)\}").expect("valid placeholder pattern"))
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Variable { name: String, placeholder: String },
}

impl Segment {
    fn push_to(&self, ctx: &RequestContext, out: &mut String) {
        match self {
            Segment::Literal(text) => out.push_str(text),
            Segment::Variable { name, placeholder } => match vars::resolve(ctx, name) {
                Some(value) => out.push_str(&value),
                None => out.push_str(placeholder),
            },
        }
    }
}

/// A compiled placeholder template
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn compile(format: &str) -> Self {
        let mut segments = Vec::new();
        let mut offset = 0;

        for caps in placeholder().captures_iter(format) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if whole.start() != offset {
                segments.push(Segment::Literal(format[offset..whole.start()].to_string()));
            }
            segments.push(Segment::Variable {
                name: name.as_str().to_string(),
                placeholder: whole.as_str().to_string(),
            });
            offset = whole.end();
        }

        if !segments.is_empty() && offset != format.len() {
            segments.push(Segment::Literal(format[offset..].to_string()));
        }

        Self {
            raw: format.to_string(),
            segments,
        }
    }

    /// True when the template has no placeholders and renders as a copy
    pub fn is_literal(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of the variables referenced, in order
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable { name, .. } => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Concatenate all segments
    pub fn render_line(&self, ctx: &RequestContext) -> String {
        if self.is_literal() {
            return self.raw.clone();
        }
        let mut out = String::with_capacity(self.raw.len() * 2);
        for segment in &self.segments {
            segment.push_to(ctx, &mut out);
        }
        out
    }

    /// Encode every segment's output as one element of a JSON array
    pub fn render_array(&self, ctx: &RequestContext) -> String {
        let items: Vec<String> = if self.is_literal() {
            vec![self.raw.clone()]
        } else {
            self.segments
                .iter()
                .map(|segment| {
                    let mut out = String::new();
                    segment.push_to(ctx, &mut out);
                    out
                })
                .collect()
        };
        serde_json::to_string(&items).unwrap_or_else(|_| "[]".to_string())
    }

    /// Write the rendered template to the response body
    ///
    /// A literal template replaces the body; one with placeholders appends,
    /// so non-terminal handles in a chain build the body up in order.
    pub fn render_body(&self, ctx: &mut RequestContext) {
        if self.is_literal() {
            ctx.say(self.raw.as_bytes());
            return;
        }
        let body = self.render_line(ctx);
        ctx.append(body);
    }
}

/// Field names rendered as a JSON object of `"field":"value"` pairs
#[derive(Debug, Clone, PartialEq)]
pub struct FieldList {
    fields: Vec<String>,
}

impl FieldList {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Absent variables are encoded as `null`
    pub fn render_object(&self, ctx: &RequestContext) -> String {
        let mut map = serde_json::Map::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match vars::resolve(ctx, field) {
                Some(v) => serde_json::Value::String(v.into_owned()),
                None => serde_json::Value::Null,
            };
            map.insert(field.clone(), value);
        }
        serde_json::Value::Object(map).to_string()
    }
}

/// How an access-log line is encoded
#[derive(Debug, Clone, PartialEq)]
pub enum AccessFormat {
    Line(Template),
    Json(Template),
    Dict(FieldList),
}

impl AccessFormat {
    pub fn render(&self, ctx: &RequestContext) -> String {
        match self {
            AccessFormat::Line(t) => t.render_line(ctx),
            AccessFormat::Json(t) => t.render_array(ctx),
            AccessFormat::Dict(f) => f.render_object(ctx),
        }
    }
}

impl Default for AccessFormat {
    fn default() -> Self {
        AccessFormat::Line(Template::compile(DEFAULT_ACCESS_FORMAT))
    }
}
