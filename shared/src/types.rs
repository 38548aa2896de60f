use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A discovered device.
/// Created from the first `Identity_Thing` announcement and never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thing {
    /// Stable id, e.g. "MySmartThing01"
    pub id: String,

    /// Address of the packet that announced the Thing (not self-reported)
    pub address: IpAddr,

    pub name: String,

    /// Logical deployment group, e.g. "MySmartSpace"
    pub space_id: String,

    pub model: String,
    pub owner: String,
    pub vendor: String,
    pub description: String,

    /// When the first announcement for this Thing arrived
    pub discovered_at: DateTime<Utc>,

    pub entities: Vec<Entity>,
}

impl Thing {
    pub fn entity(&self, entity_id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == entity_id)
    }

    pub fn entity_mut(&mut self, entity_id: &str) -> Option<&mut Entity> {
        self.entities.iter_mut().find(|e| e.id == entity_id)
    }
}

/// A logical sub-unit of a Thing that groups Services, e.g. a flame-alarm module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique within the owning Thing
    pub id: String,
    pub name: String,
    pub thing_id: String,
    pub thing_name: String,
    pub space_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub owner: String,
    pub vendor: String,
    pub description: String,
    pub services: Vec<Service>,
}

/// One remotely callable capability of an Entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub thing_id: String,
    pub thing_name: String,
    pub entity_id: String,
    pub space_id: String,

    #[serde(flatten)]
    pub signature: Signature,

    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub app_category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: String,

    /// Source address of the announcing packet; calls go to this IP
    #[serde(default)]
    pub address: Option<IpAddr>,
}

impl Service {
    pub fn endpoint(&self) -> &str {
        &self.signature.endpoint
    }

    pub fn input_params(&self) -> &[Param] {
        &self.signature.inputs
    }

    pub fn input_param(&self, name: &str) -> Option<&Param> {
        self.signature.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self) -> Option<&Param> {
        self.signature.output.as_ref()
    }

    pub fn requires_input(&self) -> bool {
        !self.signature.inputs.is_empty()
    }
}

/// A legacy descriptive edge between two Service names, for display only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub name: String,
    pub category: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub thing_id: String,
    pub space_id: String,
    pub owner: String,
    /// First service name
    pub src: String,
    /// Second service name
    pub dst: String,
}

/// Primitive type tag of a service parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Int,
    Float,
    Bool,
    Str,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Bool => "bool",
            ParamType::Str => "str",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamType {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int" => Ok(ParamType::Int),
            "float" => Ok(ParamType::Float),
            "bool" => Ok(ParamType::Bool),
            "str" => Ok(ParamType::Str),
            other => Err(SignatureError::UnknownType(other.to_string())),
        }
    }
}

/// A named, typed input or output of a Service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature does not match ENDPOINT:[INPUTS]:(OUTPUT): {0:?}")]
    Malformed(String),

    #[error("malformed parameter {0:?}")]
    Parameter(String),

    #[error("unknown parameter type {0:?}")]
    UnknownType(String),

    #[error("input parameter {0:?} declared twice")]
    DuplicateInput(String),
}

/// Parsed form of the compact service signature announced in the `API` field,
/// e.g. `ReadTemp:["mode",int,"NULL"]:("temp",float,"NULL")`.
///
/// Inputs keep their declared order: it is the positional order of the call's
/// argument list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub endpoint: String,
    #[serde(rename = "input_params", default)]
    pub inputs: Vec<Param>,
    #[serde(default)]
    pub output: Option<Param>,
}

fn signature_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\w+):\[([^\]]*)\]:\(([^)]*)\)$").expect("signature regex is valid")
    })
}

fn is_null(s: &str) -> bool {
    let s = unquote(s);
    s.is_empty() || s.eq_ignore_ascii_case("NULL")
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches('"').trim()
}

/// Parses `name,type[,default]` where the name may be quoted.
fn parse_param(raw: &str) -> Result<Param, SignatureError> {
    let parts: Vec<&str> = raw.split(',').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(SignatureError::Parameter(raw.trim().to_string()));
    }

    let name = unquote(parts[0]);
    if name.is_empty() || name.eq_ignore_ascii_case("NULL") {
        return Err(SignatureError::Parameter(raw.trim().to_string()));
    }

    Ok(Param {
        name: name.to_string(),
        ty: unquote(parts[1]).parse()?,
    })
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let caps = signature_regex()
            .captures(s)
            .ok_or_else(|| SignatureError::Malformed(s.to_string()))?;

        let endpoint = caps[1].to_string();

        let mut inputs: Vec<Param> = Vec::new();
        if !is_null(&caps[2]) {
            for raw in caps[2].split('|') {
                let param = parse_param(raw)?;
                if inputs.iter().any(|p| p.name == param.name) {
                    return Err(SignatureError::DuplicateInput(param.name));
                }
                inputs.push(param);
            }
        }

        let output = if is_null(&caps[3]) {
            None
        } else {
            Some(parse_param(&caps[3])?)
        };

        Ok(Signature { endpoint, inputs, output })
    }
}

impl fmt::Display for Signature {
    /// Renders the announcement form: `ENDPOINT:["a",int,"NULL"|...]:("out",type,"NULL")`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[", self.endpoint)?;
        if self.inputs.is_empty() {
            f.write_str("NULL")?;
        } else {
            for (i, p) in self.inputs.iter().enumerate() {
                if i > 0 {
                    f.write_str("|")?;
                }
                write!(f, "\"{}\",{},\"NULL\"", p.name, p.ty)?;
            }
        }
        f.write_str("]:(")?;
        match &self.output {
            Some(p) => write!(f, "\"{}\",{},\"NULL\"", p.name, p.ty)?,
            None => f.write_str("NULL")?,
        }
        f.write_str(")")
    }
}
