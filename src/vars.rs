//! Variable resolution over a request context
//!
//! `resolve` maps a symbolic name to its value for one request. It is used
//! by templates, filter conditions, `$`-prefixed user variables and the
//! region field. Missing headers, arguments and cookies resolve to an empty
//! string; names that mean nothing for the request resolve to `None`.

use crate::context::RequestContext;
use std::borrow::Cow;

/// Format of the `time` variable
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub fn resolve<'a>(ctx: &'a RequestContext, name: &str) -> Option<Cow<'a, str>> {
    let value = match name {
        "host" => Cow::Borrowed(ctx.header("host").unwrap_or("")),
        "addr" => Cow::Owned(ctx.client_ip().to_string()),
        "scheme" => Cow::Borrowed(scheme(ctx)),
        "method" => Cow::Borrowed(ctx.method().as_str()),
        "ua" => Cow::Borrowed(ctx.header("user-agent").unwrap_or("")),
        "remote_addr" => Cow::Owned(ctx.remote_addr().ip().to_string()),
        "remote_port" => Cow::Owned(ctx.remote_addr().port().to_string()),
        "server_addr" => Cow::Owned(ctx.local_addr().ip().to_string()),
        "server_port" => Cow::Owned(ctx.local_addr().port().to_string()),
        "time" => Cow::Owned(chrono::Local::now().format(TIME_FORMAT).to_string()),
        "uri" => Cow::Borrowed(ctx.path()),
        "full_uri" => Cow::Owned(full_uri(ctx)),
        "query" => Cow::Borrowed(ctx.uri().query().unwrap_or("")),
        "referer" => Cow::Borrowed(ctx.header("referer").unwrap_or("")),
        "content_length" => Cow::Owned(
            ctx.header("content-length")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
                .to_string(),
        ),
        "size" => Cow::Owned((raw_headers(ctx).len() + full_uri(ctx).len()).to_string()),
        "content_type" => Cow::Borrowed(ctx.header("content-type").unwrap_or("")),
        "status" => Cow::Owned(ctx.response().status.as_u16().to_string()),
        "sent" => Cow::Owned(ctx.response().body.len().to_string()),
        "region_raw" => Cow::Owned(
            ctx.enrichment()
                .geo
                .as_ref()
                .map(|g| g.to_json())
                .unwrap_or_default(),
        ),
        "header" | "header_raw" => Cow::Owned(raw_headers(ctx)),
        "cookie" | "cookie_raw" => Cow::Borrowed(ctx.header("cookie").unwrap_or("")),
        "body_raw" => String::from_utf8_lossy(ctx.body()),
        _ => return resolve_prefixed(ctx, name),
    };
    Some(value)
}

fn resolve_prefixed<'a>(ctx: &'a RequestContext, name: &str) -> Option<Cow<'a, str>> {
    if let Some(key) = name.strip_prefix("arg_") {
        let query = ctx.uri().query().unwrap_or("");
        return Some(Cow::Owned(form_value(query, key).unwrap_or_default()));
    }

    if let Some(key) = name.strip_prefix("post_") {
        let body = String::from_utf8_lossy(ctx.body());
        return Some(Cow::Owned(form_value(&body, key).unwrap_or_default()));
    }

    if let Some(key) = name.strip_prefix("http_") {
        let header = key.replace('_', "-");
        return Some(Cow::Owned(
            ctx.header(&header).unwrap_or("").to_string(),
        ));
    }

    if let Some(key) = name.strip_prefix("cookie_") {
        let cookies = ctx.header("cookie").unwrap_or("");
        return Some(Cow::Owned(cookie_value(cookies, key).unwrap_or_default()));
    }

    if let Some(key) = name.strip_prefix("region_") {
        return ctx.enrichment().geo.as_ref()?.field(key).map(Cow::Owned);
    }

    let enrichment = ctx.enrichment();
    if let Some(key) = name.strip_prefix("param_") {
        if let Some((_, v)) = enrichment.params.iter().find(|(k, _)| k == key) {
            return Some(Cow::Borrowed(v.as_str()));
        }
        return enrichment
            .variables
            .get(key)
            .map(|v| Cow::Borrowed(v.as_str()));
    }

    enrichment
        .variables
        .get(name)
        .map(|v| Cow::Borrowed(v.as_str()))
}

fn scheme(ctx: &RequestContext) -> &str {
    match ctx.uri().scheme_str() {
        Some(s) => s,
        None if ctx.is_tls() => "https",
        None => "http",
    }
}

fn full_uri(ctx: &RequestContext) -> String {
    let path = ctx
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let host = ctx
        .uri()
        .authority()
        .map(|a| a.as_str())
        .or_else(|| ctx.header("host"))
        .unwrap_or("");
    format!("{}://{}{}", scheme(ctx), host, path)
}

fn raw_headers(ctx: &RequestContext) -> String {
    let mut raw = String::new();
    for (name, value) in ctx.headers() {
        raw.push_str(name.as_str());
        raw.push_str(": ");
        raw.push_str(&String::from_utf8_lossy(value.as_bytes()));
        raw.push_str("\r\n");
    }
    raw
}

/// First value for `key` in an `application/x-www-form-urlencoded` string
fn form_value(raw: &str, key: &str) -> Option<String> {
    raw.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if decode(k) == key {
            Some(decode(v))
        } else {
            None
        }
    })
}

fn decode(s: &str) -> String {
    let s = s.replace('+', " ");
    urlencoding::decode(&s)
        .map(|c| c.into_owned())
        .unwrap_or(s)
}

fn cookie_value(raw: &str, key: &str) -> Option<String> {
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::geo::GeoInfo;
    use hyper::body::Bytes;
    use hyper::Request;

    fn value(ctx: &RequestContext, name: &str) -> Option<String> {
        resolve(ctx, name).map(|v| v.into_owned())
    }

    #[test]
    fn test_request_line_variables() {
        let ctx = context(
            "POST",
            "/a/b?x=1&name=J%C3%B6rg+M",
            &[("host", "example.com:8080"), ("user-agent", "curl/8")],
        );
        assert_eq!(value(&ctx, "host").as_deref(), Some("example.com:8080"));
        assert_eq!(value(&ctx, "method").as_deref(), Some("POST"));
        assert_eq!(value(&ctx, "uri").as_deref(), Some("/a/b"));
        assert_eq!(value(&ctx, "query").as_deref(), Some("x=1&name=J%C3%B6rg+M"));
        assert_eq!(value(&ctx, "ua").as_deref(), Some("curl/8"));
        assert_eq!(value(&ctx, "scheme").as_deref(), Some("http"));
        assert_eq!(
            value(&ctx, "full_uri").as_deref(),
            Some("http://example.com:8080/a/b?x=1&name=J%C3%B6rg+M")
        );
        assert_eq!(value(&ctx, "arg_x").as_deref(), Some("1"));
        assert_eq!(value(&ctx, "arg_name").as_deref(), Some("Jörg M"));
        assert_eq!(value(&ctx, "arg_missing").as_deref(), Some(""));
    }

    #[test]
    fn test_scheme_follows_tls() {
        let ctx = context("GET", "/p", &[("host", "h.com")]).with_tls(true);
        assert_eq!(value(&ctx, "scheme").as_deref(), Some("https"));
        assert_eq!(value(&ctx, "full_uri").as_deref(), Some("https://h.com/p"));
    }

    #[test]
    fn test_connection_variables() {
        let ctx = context("GET", "/", &[]);
        assert_eq!(value(&ctx, "remote_addr").as_deref(), Some("10.0.0.7"));
        assert_eq!(value(&ctx, "remote_port").as_deref(), Some("51000"));
        assert_eq!(value(&ctx, "server_addr").as_deref(), Some("127.0.0.1"));
        assert_eq!(value(&ctx, "server_port").as_deref(), Some("8080"));
        assert_eq!(value(&ctx, "addr").as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_header_and_cookie_variables() {
        let ctx = context(
            "GET",
            "/",
            &[("x-real-ip", "1.1.1.1"), ("cookie", "sid=abc; theme=dark")],
        );
        assert_eq!(value(&ctx, "http_x_real_ip").as_deref(), Some("1.1.1.1"));
        assert_eq!(value(&ctx, "http_x_missing").as_deref(), Some(""));
        assert_eq!(value(&ctx, "cookie_theme").as_deref(), Some("dark"));
        assert_eq!(value(&ctx, "cookie_sid").as_deref(), Some("abc"));
        assert_eq!(value(&ctx, "cookie").as_deref(), Some("sid=abc; theme=dark"));
        assert!(value(&ctx, "header").unwrap().contains("x-real-ip: 1.1.1.1\r\n"));
    }

    #[test]
    fn test_post_variables() {
        let req = Request::builder()
            .method("POST")
            .uri("/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Bytes::from_static(b"user=bob&pass=a%26b"))
            .unwrap();
        let ctx = RequestContext::new(
            req,
            "10.0.0.1:1".parse().unwrap(),
            "127.0.0.1:80".parse().unwrap(),
        );
        assert_eq!(value(&ctx, "post_user").as_deref(), Some("bob"));
        assert_eq!(value(&ctx, "post_pass").as_deref(), Some("a&b"));
        assert_eq!(value(&ctx, "body_raw").as_deref(), Some("user=bob&pass=a%26b"));
    }

    #[test]
    fn test_response_variables() {
        let mut ctx = context("GET", "/", &[]);
        ctx.set_status(hyper::StatusCode::CREATED);
        ctx.say("hello");
        assert_eq!(value(&ctx, "status").as_deref(), Some("201"));
        assert_eq!(value(&ctx, "sent").as_deref(), Some("5"));
    }

    #[test]
    fn test_region_variables() {
        let mut ctx = context("GET", "/", &[]);
        assert_eq!(value(&ctx, "region_city"), None);
        assert_eq!(value(&ctx, "region_raw").as_deref(), Some(""));

        ctx.enrichment_mut().geo = Some(GeoInfo {
            city: "Paris".into(),
            isp: "Orange".into(),
            ..Default::default()
        });
        assert_eq!(value(&ctx, "region_city").as_deref(), Some("Paris"));
        assert_eq!(value(&ctx, "region_isp").as_deref(), Some("Orange"));
        assert_eq!(value(&ctx, "region_unknown"), None);
    }

    #[test]
    fn test_params_and_user_variables() {
        let mut ctx = context("GET", "/", &[]);
        assert_eq!(value(&ctx, "nothing"), None);

        let e = ctx.enrichment_mut();
        e.params.push(("id".into(), "42".into()));
        e.variables.insert("env".into(), "prod".into());
        e.variables.insert("id".into(), "shadowed".into());

        assert_eq!(value(&ctx, "param_id").as_deref(), Some("42"));
        assert_eq!(value(&ctx, "param_env").as_deref(), Some("prod"));
        assert_eq!(value(&ctx, "env").as_deref(), Some("prod"));
        assert_eq!(value(&ctx, "param_none"), None);
    }
}
