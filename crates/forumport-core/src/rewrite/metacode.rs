//! Structural normalisation of component markup.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::{Captures, Regex};
use serde_json::Value;

use super::{replace_innermost, RewriteContext, Rule};

/// A `<woltlab-metacode>` element.
#[derive(Debug, Clone, PartialEq)]
pub struct Metacode {
    pub name: String,
    pub attributes: Vec<Value>,
    pub body: String,
}

impl Metacode {
    fn from_captures(caps: &Captures<'_>) -> Self {
        Self {
            name: caps[1].to_string(),
            attributes: decode_attributes(&caps[2]),
            body: caps[3].to_string(),
        }
    }

    /// Render as a bracket tag, e.g. `[color='#f00']text[/color]`.
    pub fn render(&self) -> String {
        let attributes = if self.attributes.is_empty() {
            String::new()
        } else {
            let rendered: Vec<String> = self.attributes.iter().map(render_attribute).collect();
            format!("={}", rendered.join(","))
        };
        format!("[{name}{attributes}]{body}[/{name}]", name = self.name, body = self.body)
    }
}

/// Base64 JSON payload; anything undecodable yields no attributes.
fn decode_attributes(payload: &str) -> Vec<Value> {
    if payload.is_empty() {
        return Vec::new();
    }
    let parsed = STANDARD
        .decode(payload.trim())
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());
    match parsed {
        Some(Value::Array(values)) => values,
        Some(Value::Object(map)) => map.into_iter().map(|(_, v)| v).collect(),
        _ => Vec::new(),
    }
}

fn render_attribute(value: &Value) -> String {
    match value {
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "\\'")),
        Value::Number(n) => format!("'{n}'"),
        _ => "''".to_string(),
    }
}

/// A `<woltlab-spoiler>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spoiler {
    pub label: Option<String>,
    pub body: String,
}

impl Spoiler {
    pub fn render(&self) -> String {
        match self.label.as_deref().filter(|l| !l.is_empty()) {
            Some(label) => format!("[SPOILER={label}]{}[/SPOILER]", self.body),
            None => format!("[SPOILER]{}[/SPOILER]", self.body),
        }
    }
}

/// Converts metacode and spoiler elements into bracket tags.
pub struct MetacodeRule {
    metacode: Regex,
    spoiler: Regex,
}

impl MetacodeRule {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            metacode: Regex::new(
                r#"(?si)<woltlab-metacode data-name="([^"]*)" data-attributes="([^"]*)">(.*?)</woltlab-metacode>"#,
            )?,
            spoiler: Regex::new(
                r#"(?si)<woltlab-spoiler(?:\s+data-label="([^"]*)")?\s*>(.*?)</woltlab-spoiler>"#,
            )?,
        })
    }
}

impl Rule for MetacodeRule {
    fn name(&self) -> &'static str {
        "metacode"
    }

    fn apply(&self, content: &str, _ctx: &RewriteContext<'_>) -> String {
        if !content.to_ascii_lowercase().contains("<woltlab-") {
            return content.to_string();
        }
        let content = replace_innermost(content, "<woltlab-metacode", &self.metacode, |caps| {
            Metacode::from_captures(caps).render()
        });
        replace_innermost(&content, "<woltlab-spoiler", &self.spoiler, |caps| {
            Spoiler {
                label: caps.get(1).map(|m| m.as_str().to_string()),
                body: caps[2].to_string(),
            }
            .render()
        })
    }
}
