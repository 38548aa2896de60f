//! Relational conditions on `condition` edges: `OP INTEGER`, e.g. `"> 25"`.
//! One comparison against an integer literal; no boolean composition.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Lt,
    Eq,
    Ne,
    Ge,
    Le,
}

impl CmpOp {
    fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
        }
    }

    fn holds(&self, ord: Ordering) -> bool {
        match self {
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Ge => ord != Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed condition {0:?}, expected OP INTEGER with OP one of > < == != >= <=")]
pub struct ConditionError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condition {
    pub op: CmpOp,
    pub operand: i64,
}

fn condition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(>=|<=|==|!=|>|<)\s*(-?\d+)$").expect("condition regex is valid"))
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = condition_regex()
            .captures(s.trim())
            .ok_or_else(|| ConditionError(s.to_string()))?;

        let op = match &caps[1] {
            ">" => CmpOp::Gt,
            "<" => CmpOp::Lt,
            "==" => CmpOp::Eq,
            "!=" => CmpOp::Ne,
            ">=" => CmpOp::Ge,
            _ => CmpOp::Le,
        };
        let operand = caps[2].parse().map_err(|_| ConditionError(s.to_string()))?;

        Ok(Condition { op, operand })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.symbol(), self.operand)
    }
}

impl Condition {
    /// A value that does not coerce to an integer never satisfies the condition.
    pub fn holds(&self, value: &Value) -> bool {
        match coerce_int(value) {
            Some(v) => self.op.holds(v.cmp(&self.operand)),
            None => false,
        }
    }
}

/// Integer view of a call result, following the usual loose conversions:
/// floats truncate, booleans are 0/1, numeric strings parse.
pub fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Evaluate `condition` against a result value; malformed conditions are
/// logged and evaluate to false.
pub fn evaluate(value: &Value, condition: &str) -> bool {
    match condition.parse::<Condition>() {
        Ok(cond) => cond.holds(value),
        Err(e) => {
            tracing::warn!("{}", e);
            false
        }
    }
}
