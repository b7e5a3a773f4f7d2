use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Opaque version token for one state of a remote object.
///
/// Compared byte-for-byte, quotes included, the way `If-Match` compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    pub fn new(value: impl Into<String>) -> Result<Self, ProtocolError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ProtocolError::EmptyETag);
        }
        Ok(Self(value))
    }

    /// Strong ETag for `value`, quoted: `"0x1"`.
    pub fn strong(value: impl fmt::Display) -> Self {
        Self(format!("\"{value}\""))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of creating (or truncating) the remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub etag: ETag,
    pub last_modified: DateTime<Utc>,
}

/// Result of staging one chunk of data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<ETag>,
    #[serde(default)]
    pub server_encrypted: bool,
}

/// Result of committing all staged data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushResponse {
    pub etag: ETag,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub content_length: u64,
}

/// Object metadata carried by a range-read response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectProperties {
    pub etag: ETag,
    pub last_modified: DateTime<Utc>,
    /// Full length of the object, not of the returned range.
    pub content_length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_etag_is_quoted() {
        assert_eq!(ETag::strong("0x1F").as_str(), "\"0x1F\"");
    }

    #[test]
    fn etag_rejects_empty() {
        assert_eq!(ETag::new(""), Err(ProtocolError::EmptyETag));
        assert_eq!(ETag::new("\"0x8D\"").unwrap().as_str(), "\"0x8D\"");
    }

    #[test]
    fn flush_response_camel_case() {
        let resp = FlushResponse {
            etag: ETag::new("\"v2\"").unwrap(),
            last_modified: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            content_length: 12,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["etag"], "\"v2\"");
        assert_eq!(json["contentLength"], 12);
        assert!(json.get("lastModified").is_some());

        let back: FlushResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn append_response_defaults() {
        let resp: AppendResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.etag.is_none());
        assert!(!resp.server_encrypted);
    }
}
