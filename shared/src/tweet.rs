//! Announcement ("tweet") decoding.
//!
//! Things broadcast JSON objects tagged by a `"Tweet Type"` field. Decoding is
//! closed over the four kinds the coordinator understands; anything else comes
//! back as [`Tweet::Unrecognized`] so the caller decides how loudly to drop it.

use std::borrow::Cow;
use std::sync::OnceLock;
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use crate::protocol::{
    FIELD_TWEET_TYPE, TWEET_IDENTITY_ENTITY, TWEET_IDENTITY_THING, TWEET_RELATIONSHIP,
    TWEET_SERVICE,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThingTweet {
    #[serde(rename = "Thing ID")]
    pub thing_id: String,
    #[serde(rename = "Space ID")]
    pub space_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Model", default)]
    pub model: String,
    #[serde(rename = "Owner", default)]
    pub owner: String,
    #[serde(rename = "Vendor", default)]
    pub vendor: String,
    #[serde(rename = "Description", default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTweet {
    #[serde(rename = "Thing ID")]
    pub thing_id: String,
    #[serde(rename = "Space ID")]
    pub space_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub entity_id: String,
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Owner", default)]
    pub owner: String,
    #[serde(rename = "Vendor", default)]
    pub vendor: String,
    #[serde(rename = "Description", default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTweet {
    #[serde(rename = "Thing ID")]
    pub thing_id: String,
    #[serde(rename = "Entity ID")]
    pub entity_id: String,
    #[serde(rename = "Space ID")]
    pub space_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    /// Raw signature string, parsed when merged into the registry
    #[serde(rename = "API")]
    pub api: String,
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "AppCategory", default)]
    pub app_category: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "Keywords", default)]
    pub keywords: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipTweet {
    #[serde(rename = "Thing ID")]
    pub thing_id: String,
    #[serde(rename = "Space ID")]
    pub space_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Owner", default)]
    pub owner: String,
    #[serde(rename = "Category", default)]
    pub category: String,
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "FS name", default)]
    pub first_service: String,
    #[serde(rename = "SS name", default)]
    pub second_service: String,
}

/// A decoded announcement.
#[derive(Debug, Clone, PartialEq)]
pub enum Tweet {
    IdentityThing(ThingTweet),
    IdentityEntity(EntityTweet),
    Service(ServiceTweet),
    Relationship(RelationshipTweet),
    /// Well-formed JSON with a tweet type the coordinator does not model
    Unrecognized(String),
}

impl Tweet {
    pub fn kind(&self) -> &str {
        match self {
            Tweet::IdentityThing(_) => TWEET_IDENTITY_THING,
            Tweet::IdentityEntity(_) => TWEET_IDENTITY_ENTITY,
            Tweet::Service(_) => TWEET_SERVICE,
            Tweet::Relationship(_) => TWEET_RELATIONSHIP,
            Tweet::Unrecognized(kind) => kind,
        }
    }

    /// The announcing Thing, for every kind the coordinator models
    pub fn thing_id(&self) -> Option<&str> {
        match self {
            Tweet::IdentityThing(t) => Some(&t.thing_id),
            Tweet::IdentityEntity(e) => Some(&e.thing_id),
            Tweet::Service(s) => Some(&s.thing_id),
            Tweet::Relationship(r) => Some(&r.thing_id),
            Tweet::Unrecognized(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TweetError {
    #[error("announcement is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("announcement is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("announcement has no \"Tweet Type\" field")]
    MissingType,

    #[error("{kind} announcement has missing or invalid fields: {source}")]
    Fields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

fn api_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"("API"\s*:\s*")(\w+:\[[^\]]*\]:\([^)]*\))("\s*[,}])"#).expect("api field regex is valid")
    })
}

fn escape_bare_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    let mut after_backslash = false;
    for c in s.chars() {
        if c == '"' && !after_backslash {
            out.push('\\');
        }
        out.push(c);
        after_backslash = c == '\\' && !after_backslash;
    }
    out
}

/// Re-escapes raw double quotes inside the `API` field.
///
/// Some Things embed the signature verbatim, e.g.
/// `"API": "Read:["mode",int,"NULL"]:(NULL)"`, which is not JSON. Text that
/// already parses is returned as is. Otherwise only an `API` value shaped
/// like a signature is touched, so the match never runs into later fields.
pub fn repair(text: &str) -> Cow<'_, str> {
    if serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok() {
        return Cow::Borrowed(text);
    }
    api_field_regex().replace_all(text, |caps: &Captures| {
        format!("{}{}{}", &caps[1], escape_bare_quotes(&caps[2]), &caps[3])
    })
}

fn fields<T: DeserializeOwned>(kind: &str, value: serde_json::Value) -> Result<T, TweetError> {
    serde_json::from_value(value).map_err(|source| TweetError::Fields {
        kind: kind.to_string(),
        source,
    })
}

/// Decode one datagram into a [`Tweet`].
pub fn decode(bytes: &[u8]) -> Result<Tweet, TweetError> {
    let text = std::str::from_utf8(bytes)?;
    // Embedded senders pad the buffer with NULs
    let text = text.trim_end_matches('\0').trim();

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => serde_json::from_str(&repair(text))?,
    };
    let kind = value
        .get(FIELD_TWEET_TYPE)
        .and_then(serde_json::Value::as_str)
        .ok_or(TweetError::MissingType)?
        .to_string();

    let tweet = match kind.as_str() {
        TWEET_IDENTITY_THING => Tweet::IdentityThing(fields(&kind, value)?),
        TWEET_IDENTITY_ENTITY => Tweet::IdentityEntity(fields(&kind, value)?),
        TWEET_SERVICE => Tweet::Service(fields(&kind, value)?),
        TWEET_RELATIONSHIP => Tweet::Relationship(fields(&kind, value)?),
        _ => Tweet::Unrecognized(kind),
    };

    Ok(tweet)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROKEN_SERVICE: &str = r#"{"Tweet Type": "Service", "Name": "ReadTemp", "Thing ID": "T1", "Entity ID": "E1", "Space ID": "S", "API": "ReadTemp:["mode",int,"NULL"]:("temp",float,"NULL")", "Type": "Report"}"#;

    #[test]
    fn test_repair_escapes_raw_quotes_in_api_field() {
        let repaired = repair(BROKEN_SERVICE);
        assert!(repaired.contains(r#""API": "ReadTemp:[\"mode\",int,\"NULL\"]:(\"temp\",float,\"NULL\")", "Type""#));
    }

    #[test]
    fn test_repair_leaves_valid_json_unchanged() {
        let valid = r#"{"Tweet Type": "Service", "API": "Read:[\"a\",int,\"NULL\"]:(NULL)"}"#;
        assert_eq!(repair(valid), valid);

        let no_api = r#"{"Tweet Type": "Identity_Thing", "Name": "Pi"}"#;
        assert_eq!(repair(no_api), no_api);
    }

    #[test]
    fn test_repair_api_as_last_field() {
        let broken = r#"{"Tweet Type": "Service", "API": "Read:["a",int,"NULL"]:(NULL)"}"#;
        let value: serde_json::Value = serde_json::from_str(&repair(broken)).unwrap();
        assert_eq!(value["API"], r#"Read:["a",int,"NULL"]:(NULL)"#);
    }

    #[test]
    fn test_decode_repaired_service() {
        match decode(BROKEN_SERVICE.as_bytes()).unwrap() {
            Tweet::Service(s) => {
                assert_eq!(s.thing_id, "T1");
                assert_eq!(s.api, r#"ReadTemp:["mode",int,"NULL"]:("temp",float,"NULL")"#);
                assert_eq!(s.kind, "Report");
                assert_eq!(s.keywords, "");
            }
            other => panic!("expected service tweet, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_identity_thing_with_nul_padding() {
        let mut bytes = br#"{"Tweet Type": "Identity_Thing", "Thing ID": "T1", "Space ID": "S", "Name": "Pi", "Model": "4B"}"#.to_vec();
        bytes.extend_from_slice(&[0, 0, 0]);

        match decode(&bytes).unwrap() {
            Tweet::IdentityThing(t) => {
                assert_eq!(t.name, "Pi");
                assert_eq!(t.model, "4B");
                assert_eq!(t.owner, "");
            }
            other => panic!("expected thing tweet, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unrecognized_kind() {
        let tweet = decode(br#"{"Tweet Type": "Identity_Language", "Thing ID": "T1"}"#).unwrap();
        assert_eq!(tweet, Tweet::Unrecognized("Identity_Language".into()));
    }

    #[test]
    fn test_decode_failures() {
        assert!(matches!(decode(&[0xff, 0xfe]), Err(TweetError::Encoding(_))));
        assert!(matches!(decode(b"{not json"), Err(TweetError::Json(_))));
        assert!(matches!(decode(br#"{"Name": "x"}"#), Err(TweetError::MissingType)));
        assert!(matches!(
            decode(br#"{"Tweet Type": "Identity_Thing", "Name": "x"}"#),
            Err(TweetError::Fields { .. })
        ));
    }

    #[test]
    fn test_valid_service_with_parenthesized_fields_is_untouched() {
        let text = r#"{"Tweet Type": "Service", "Thing ID": "T1", "Entity ID": "E1", "Space ID": "S", "Name": "Read", "API": "Read:[NULL]:(NULL) ", "Description": "Temp (C)", "Keywords": "temp"}"#;
        assert_eq!(repair(text), text);

        match decode(text.as_bytes()).unwrap() {
            Tweet::Service(s) => {
                assert_eq!(s.api, "Read:[NULL]:(NULL) ");
                assert_eq!(s.description, "Temp (C)");
                assert_eq!(s.keywords, "temp");
            }
            other => panic!("expected service tweet, got {other:?}"),
        }
    }

    #[test]
    fn test_repair_stops_at_signature_end() {
        let broken = r#"{"Tweet Type": "Service", "Thing ID": "T1", "Entity ID": "E1", "Space ID": "S", "Name": "Read", "API": "Read:["a",int,"NULL"]:(NULL)", "Description": "Temp (C)"}"#;

        match decode(broken.as_bytes()).unwrap() {
            Tweet::Service(s) => {
                assert_eq!(s.api, r#"Read:["a",int,"NULL"]:(NULL)"#);
                assert_eq!(s.description, "Temp (C)");
            }
            other => panic!("expected service tweet, got {other:?}"),
        }
    }
}
