//! Field-reference templates
//!
//! Strings such as `"%{host} - %{[user][name]}"` are parsed once into segments
//! and rendered against each event:
//! - `%{field}` / `%{[nested][field]}` substitute the field's value
//! - `%{+FORMAT}` formats the event's `@timestamp` (or now) with a strftime pattern
//!
//! References that cannot be resolved are left in the output verbatim.

use std::fmt::Write;
use std::sync::OnceLock;

use chrono::format::{Item, StrftimeItems};
use chrono::Utc;
use hc_common::Event;
use regex::Regex;
use serde_json::Value;

static REFERENCE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn reference_pattern() -> &'static Regex {
    REFERENCE_PATTERN
        .get_or_init(|| Regex::new(r"%\{([^}]+)\}").expect("field reference pattern is valid"))
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field { reference: String, raw: String },
    Time { format: String },
}

/// A parsed template string
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;

        for captures in reference_pattern().captures_iter(source) {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(source[last..whole.start()].to_string()));
            }

            let inner = inner.as_str();
            let segment = match inner.strip_prefix('+') {
                Some(format) if is_valid_time_format(format) => Segment::Time {
                    format: format.to_string(),
                },
                Some(_) => Segment::Literal(whole.as_str().to_string()),
                None => Segment::Field {
                    reference: inner.to_string(),
                    raw: whole.as_str().to_string(),
                },
            };
            segments.push(segment);
            last = whole.end();
        }

        if last < source.len() {
            segments.push(Segment::Literal(source[last..].to_string()));
        }

        Self { source: source.to_string(), segments }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template contains no references at all
    pub fn is_static(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn render(&self, event: &Event) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field { reference, raw } => match event.get_field(reference) {
                    Some(value) if !value.is_null() => out.push_str(&stringify(value)),
                    _ => out.push_str(raw),
                },
                Segment::Time { format } => {
                    let ts = event.timestamp().unwrap_or_else(Utc::now);
                    let _ = write!(out, "{}", ts.format(format));
                }
            }
        }
        out
    }
}

/// `render(template, event)` for one-off templates
pub fn render(template: &str, event: &Event) -> String {
    Template::parse(template).render(event)
}

/// Text form of a field value: strings verbatim, structures as compact JSON
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn is_valid_time_format(format: &str) -> bool {
    !format.is_empty() && StrftimeItems::new(format).all(|item| !matches!(item, Item::Error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Event {
        Event::from_value(json!({
            "foo": "bar",
            "baz": "bot",
            "count": 42,
            "ok": true,
            "nothing": null,
            "user": {"name": "alice", "tags": ["a", "b"]},
            "@timestamp": "2024-03-01T12:30:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn test_render_simple_fields() {
        assert_eq!(render("%{foo} AND %{baz}", &event()), "bar AND bot");
        assert_eq!(render("count=%{count} ok=%{ok}", &event()), "count=42 ok=true");
    }

    #[test]
    fn test_render_nested_fields() {
        assert_eq!(render("/users/%{[user][name]}", &event()), "/users/alice");
        assert_eq!(render("%{[user][tags]}", &event()), r#"["a","b"]"#);
        assert_eq!(render("%{[user][tags][0]}", &event()), "a");
    }

    #[test]
    fn test_missing_fields_left_verbatim() {
        assert_eq!(render("x-%{missing}-y", &event()), "x-%{missing}-y");
        assert_eq!(render("%{[user][email]}", &event()), "%{[user][email]}");
        assert_eq!(render("%{nothing}", &event()), "%{nothing}");
    }

    #[test]
    fn test_time_format() {
        assert_eq!(render("logs-%{+%Y.%m.%d}", &event()), "logs-2024.03.01");

        let rendered = render("%{+%Y}", &Event::new());
        assert_eq!(rendered.len(), 4);
        assert!(rendered.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_invalid_time_format_left_verbatim() {
        assert_eq!(render("%{+%}", &event()), "%{+%}");
    }

    #[test]
    fn test_static_template() {
        let template = Template::parse("http://localhost:8080/ingest");
        assert!(template.is_static());
        assert_eq!(template.render(&event()), "http://localhost:8080/ingest");
        assert!(!Template::parse("http://%{host}/").is_static());
    }

    #[test]
    fn test_unterminated_reference_is_literal() {
        assert_eq!(render("%{foo", &event()), "%{foo");
        assert_eq!(render("100%", &event()), "100%");
    }
}
