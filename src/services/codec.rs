//! Portal response decoding
//!
//! Portals answer with raw JSON, JSON wrapped in a function call
//! (`callback({...});`), JSON surrounded by junk, or plain text.
//! Decoding never fails: anything unrecognised comes back as
//! [`Decoded::Opaque`] and the caller moves on to its next fallback.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    /// `name(<payload>)` with an optional trailing semicolon
    static ref CALL_WRAPPER_REGEX: Regex =
        Regex::new(r"(?s)^\s*[A-Za-z_$][\w$.]*\s*\((.*)\)\s*;?\s*$").unwrap();
    /// Greedy first-brace-to-last-brace span
    static ref BRACE_REGEX: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
}

/// Decoded portal response body
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Json(Value),
    Opaque(String),
}

impl Decoded {
    pub fn json(&self) -> Option<&Value> {
        match self {
            Decoded::Json(v) => Some(v),
            Decoded::Opaque(_) => None,
        }
    }

    /// The `js` envelope when present, else the whole document
    pub fn payload(&self) -> Option<&Value> {
        let value = self.json()?;
        Some(value.get("js").unwrap_or(value))
    }

    /// Look a scalar up in the payload first, then at the top level
    pub fn find_str(&self, key: &str) -> Option<String> {
        let value = self.json()?;
        let from_payload = self.payload().and_then(|p| p.get(key)).and_then(scalar_string);
        from_payload.or_else(|| value.get(key).and_then(scalar_string))
    }

    /// Record array from `[...]`, `{data:[...]}` or `{js:{data:[...]}}`
    pub fn records(&self) -> Vec<Value> {
        let Some(payload) = self.payload() else {
            return Vec::new();
        };

        match payload {
            Value::Array(items) => items.clone(),
            Value::Object(map) => match map.get("data") {
                Some(Value::Array(items)) => items.clone(),
                _ => self
                    .json()
                    .and_then(|root| root.get("data"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            },
            _ => Vec::new(),
        }
    }

    /// Numeric field from the payload (`total_items`, `max_page_items`)
    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload()?.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }
}

/// Render a JSON scalar as a non-empty string
pub fn scalar_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn parse_object(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text.trim())
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

/// Decode a portal response body
pub fn decode(body: &str) -> Decoded {
    // 1. function-call wrapper
    if let Some(inner) = CALL_WRAPPER_REGEX
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_object(m.as_str()))
    {
        return Decoded::Json(inner);
    }

    // 2. greedy brace-delimited extraction
    if let Some(value) = BRACE_REGEX.find(body).and_then(|m| parse_object(m.as_str())) {
        return Decoded::Json(value);
    }

    // 3. direct parse (covers bare arrays)
    if let Some(value) = parse_object(body) {
        return Decoded::Json(value);
    }

    Decoded::Opaque(body.to_string())
}
