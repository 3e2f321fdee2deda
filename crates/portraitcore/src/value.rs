use serde::{Deserialize, Serialize};

/// A single node input as it appears in an API-format workflow graph.
///
/// Links are two-element arrays `["<node id>", <output index>]`; everything
/// else is a literal. Numbers keep their original JSON representation so a
/// graph that is read and written back is unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InputValue {
    Link(String, u32),
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Json(serde_json::Value),
}

impl InputValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            InputValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InputValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            InputValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            InputValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Source node of a link input
    pub fn as_link(&self) -> Option<(&str, u32)> {
        match self {
            InputValue::Link(node, slot) => Some((node, *slot)),
            _ => None,
        }
    }
}

impl From<String> for InputValue {
    fn from(s: String) -> Self {
        InputValue::String(s)
    }
}

impl From<&str> for InputValue {
    fn from(s: &str) -> Self {
        InputValue::String(s.to_string())
    }
}

impl From<bool> for InputValue {
    fn from(b: bool) -> Self {
        InputValue::Bool(b)
    }
}

impl From<u32> for InputValue {
    fn from(n: u32) -> Self {
        InputValue::Number(n.into())
    }
}

impl From<i64> for InputValue {
    fn from(n: i64) -> Self {
        InputValue::Number(n.into())
    }
}

impl From<f64> for InputValue {
    fn from(n: f64) -> Self {
        // Non-finite floats have no JSON form; the request layer never produces them
        serde_json::Number::from_f64(n)
            .map(InputValue::Number)
            .unwrap_or(InputValue::Json(serde_json::Value::Null))
    }
}
