use crate::error::{Result, ServiceMapError};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

const TOP: &str = "top";

/// Pagination token for trace sampling.
///
/// `Top` marks that the first page has been served and the backend reported no
/// continuation. `After` wraps a base64-encoded composite aggregation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TraceSampleCursor {
    Top,
    After(String),
}

impl TraceSampleCursor {
    pub fn from_after_key(after_key: &Value) -> Result<Self> {
        let json = serde_json::to_vec(after_key)?;
        Ok(TraceSampleCursor::After(general_purpose::STANDARD.encode(json)))
    }

    /// The composite `after` key to send, if any. `Top` carries none.
    pub fn after_key(&self) -> Result<Option<Value>> {
        match self {
            TraceSampleCursor::Top => Ok(None),
            TraceSampleCursor::After(encoded) => {
                let bytes = general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| ServiceMapError::InvalidCursor(e.to_string()))?;
                let key: Value = serde_json::from_slice(&bytes)
                    .map_err(|e| ServiceMapError::InvalidCursor(e.to_string()))?;
                if !key.is_object() {
                    return Err(ServiceMapError::InvalidCursor(
                        "after key is not an object".into(),
                    ));
                }
                Ok(Some(key))
            }
        }
    }

    pub fn is_top(&self) -> bool {
        matches!(self, TraceSampleCursor::Top)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TraceSampleCursor::Top => TOP,
            TraceSampleCursor::After(encoded) => encoded,
        }
    }
}

impl fmt::Display for TraceSampleCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceSampleCursor {
    type Err = ServiceMapError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Err(ServiceMapError::InvalidCursor("empty cursor".into())),
            TOP => Ok(TraceSampleCursor::Top),
            other => {
                let cursor = TraceSampleCursor::After(other.to_string());
                cursor.after_key()?;
                Ok(cursor)
            }
        }
    }
}

impl Serialize for TraceSampleCursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TraceSampleCursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
