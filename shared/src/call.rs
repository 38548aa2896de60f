//! Service call wire format.
//!
//! A call is one JSON object sent over TCP to the Thing's control port; the
//! inputs travel as a parenthesized literal list such as `(30,"kitchen",true)`.
//! Literals are built through [`Literal::encode`] so a value that does not fit
//! its declared type is rejected here rather than on the device.

use std::fmt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::protocol::{STATUS_SUCCESSFUL, TWEET_SERVICE_CALL};
use crate::types::{ParamType, Service};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiteralError {
    #[error("value is empty")]
    Empty,

    #[error("{value:?} is not a valid {ty}")]
    Invalid { ty: ParamType, value: String },
}

/// One encoded argument token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal(String);

impl Literal {
    pub fn encode(ty: ParamType, raw: &str) -> Result<Self, LiteralError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(LiteralError::Empty);
        }
        if value == "null" {
            return Ok(Literal("null".to_string()));
        }

        let invalid = || LiteralError::Invalid {
            ty,
            value: value.to_string(),
        };

        let token = match ty {
            ParamType::Int => value.parse::<i64>().map_err(|_| invalid())?.to_string(),
            ParamType::Float => {
                let f = value.parse::<f64>().map_err(|_| invalid())?;
                if !f.is_finite() {
                    return Err(invalid());
                }
                value.to_string()
            }
            ParamType::Bool => match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => "true".to_string(),
                "false" | "0" | "no" => "false".to_string(),
                _ => return Err(invalid()),
            },
            // raw (untrimmed) text is the value for strings
            ParamType::Str => quote(raw),
        };

        Ok(Literal(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Positional argument list, rendered as `(a,b,...)` and `()` when empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputList(Vec<Literal>);

impl InputList {
    pub fn new(literals: Vec<Literal>) -> Self {
        Self(literals)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for InputList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, lit) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(lit.as_str())?;
        }
        f.write_str(")")
    }
}

/// Request body of a service call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCall {
    #[serde(rename = "Tweet Type")]
    pub tweet_type: &'static str,
    #[serde(rename = "Thing ID")]
    pub thing_id: String,
    #[serde(rename = "Space ID")]
    pub space_id: String,
    #[serde(rename = "Service Name")]
    pub service_name: String,
    #[serde(rename = "Service Inputs")]
    pub service_inputs: String,
}

impl ServiceCall {
    pub fn new(service: &Service, inputs: &InputList) -> Self {
        Self {
            tweet_type: TWEET_SERVICE_CALL,
            thing_id: service.thing_id.clone(),
            space_id: service.space_id.clone(),
            service_name: service.name.clone(),
            service_inputs: inputs.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing plain strings cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Response body of a service call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CallResponse {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Service Result", default)]
    pub result: Option<Value>,
    #[serde(rename = "Status Description", default)]
    pub description: Option<String>,
}

impl CallResponse {
    pub fn is_successful(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case(STATUS_SUCCESSFUL)
    }
}

/// What one call produced, as recorded by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub success: bool,
    pub value: Option<Value>,
}

impl CallOutcome {
    pub fn failed() -> Self {
        Self {
            success: false,
            value: None,
        }
    }

    /// Decode a raw response; anything undecodable counts as a failed call.
    pub fn from_response(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_end_matches('\0').trim();

        match serde_json::from_str::<CallResponse>(text) {
            Ok(resp) => {
                if !resp.is_successful() {
                    if let Some(desc) = &resp.description {
                        tracing::debug!("Call reported {}: {}", resp.status, desc);
                    }
                }
                Self {
                    success: resp.is_successful(),
                    value: resp.result.filter(|v| !v.is_null()),
                }
            }
            Err(e) => {
                tracing::warn!("Undecodable call response {:?}: {}", text, e);
                Self::failed()
            }
        }
    }

    /// Result value rendered as an input value string
    pub fn value_text(&self) -> Option<String> {
        self.value.as_ref().map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}
