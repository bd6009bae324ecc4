//! Events and Routing Key Templates
//!
//! An `Event` is a JSON object with a timestamp. A `KeyTemplate` turns an
//! event into its routing key:
//!
//! | Reference      | Renders as                                   |
//! |----------------|----------------------------------------------|
//! | `%{type}`      | top level field `type`                       |
//! | `%{[a][b]}`    | nested field `b` inside object `a`           |
//! | `%{+%Y-%m-%d}` | event timestamp through a strftime format    |
//!
//! String values are inserted as they are, other values as JSON. A
//! reference that does not resolve stays in the key literally.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub const TIMESTAMP_FIELD: &str = "@timestamp";

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    fields: Map<String, Value>,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Timestamp comes from `@timestamp` when it is RFC 3339, else now
    pub fn new(fields: Map<String, Value>) -> Self {
        let timestamp = fields
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Event { fields, timestamp }
    }

    pub fn with_timestamp(fields: Map<String, Value>, timestamp: DateTime<Utc>) -> Self {
        Event { fields, timestamp }
    }

    /// A JSON object line becomes its fields, anything else is wrapped as
    /// `{"message": line}`
    pub fn from_line(line: &str) -> Self {
        match serde_json::from_str::<Map<String, Value>>(line) {
            Ok(fields) => Event::new(fields),
            Err(_) => {
                let mut fields = Map::new();
                fields.insert("message".to_string(), Value::String(line.to_string()));
                Event::new(fields)
            }
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Follow a path of nested object fields
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut value = self.fields.get(first.as_ref())?;
        for segment in rest {
            value = value.as_object()?.get(segment.as_ref())?;
        }
        Some(value)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field { raw: String, path: Vec<String> },
    Time { format: String },
}

/// Parsed routing key template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    /// Malformed references are kept as literal text
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(start) = rest.find("%{") {
            literal.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                literal.push_str(&rest[start..]);
                rest = "";
                break;
            };

            let raw = &rest[start..start + 2 + end + 1];
            match parse_reference(&after[..end], raw) {
                Some(segment) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                None => literal.push_str(raw),
            }
            rest = &after[end + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        KeyTemplate {
            source: source.to_string(),
            segments,
        }
    }

    /// True when the template has no references
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn render(&self, event: &Event) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field { raw, path } => match event.get_path(path) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => out.push_str(raw),
                    Some(other) => out.push_str(&other.to_string()),
                },
                Segment::Time { format } => {
                    out.push_str(&event.timestamp().format(format).to_string());
                }
            }
        }
        out
    }
}

fn parse_reference(inner: &str, raw: &str) -> Option<Segment> {
    if inner.is_empty() {
        return None;
    }

    if let Some(format) = inner.strip_prefix('+') {
        // Formatting an invalid strftime string would panic at render time
        let valid = !format.is_empty()
            && StrftimeItems::new(format).all(|item| !matches!(item, Item::Error));
        return valid.then(|| Segment::Time {
            format: format.to_string(),
        });
    }

    let path = if inner.starts_with('[') && inner.ends_with(']') && inner.len() > 2 {
        let parts: Vec<String> = inner[1..inner.len() - 1]
            .split("][")
            .map(str::to_string)
            .collect();
        if parts.iter().any(|p| p.is_empty() || p.contains(['[', ']'])) {
            return None;
        }
        parts
    } else {
        vec![inner.to_string()]
    };

    Some(Segment::Field {
        raw: raw.to_string(),
        path,
    })
}
