//! Upload metadata carried in the `Upload-Metadata` header.
//!
//! Encoding is strict: keys must be non-empty and free of whitespace and
//! commas. Decoding is lenient: a value that is not valid base64 (or not
//! valid text in the chosen encoding) is kept as the raw header text.

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Ordered key/value pairs attached to an upload.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata key `{0}` cannot be empty nor contain spaces or commas")]
    InvalidKey(String),
    #[error("metadata value for `{key}` cannot be represented in {encoding}")]
    Unencodable { key: String, encoding: &'static str },
}

/// Text encoding applied to values before base64.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MetadataEncoding {
    #[default]
    Utf8,
    /// ISO-8859-1: one byte per code point up to U+00FF.
    Latin1,
}

impl MetadataEncoding {
    pub fn name(self) -> &'static str {
        match self {
            MetadataEncoding::Utf8 => "utf-8",
            MetadataEncoding::Latin1 => "iso-8859-1",
        }
    }

    fn encode(self, value: &str) -> Option<Vec<u8>> {
        match self {
            MetadataEncoding::Utf8 => Some(value.as_bytes().to_vec()),
            MetadataEncoding::Latin1 => value
                .chars()
                .map(|c| u8::try_from(u32::from(c)).ok())
                .collect(),
        }
    }

    fn decode(self, bytes: Vec<u8>) -> Option<String> {
        match self {
            MetadataEncoding::Utf8 => String::from_utf8(bytes).ok(),
            MetadataEncoding::Latin1 => Some(bytes.into_iter().map(char::from).collect()),
        }
    }
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render as a header value: `key base64(value)` pairs joined by commas.
    ///
    /// Returns `Ok(None)` for empty metadata so callers can omit the header.
    pub fn encode(&self, encoding: MetadataEncoding) -> Result<Option<String>, MetadataError> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut pairs = Vec::with_capacity(self.len());
        for (key, value) in self.iter() {
            if !is_valid_key(key) {
                return Err(MetadataError::InvalidKey(key.to_string()));
            }
            let bytes = encoding
                .encode(value)
                .ok_or_else(|| MetadataError::Unencodable {
                    key: key.to_string(),
                    encoding: encoding.name(),
                })?;
            if bytes.is_empty() {
                pairs.push(key.to_string());
            } else {
                pairs.push(format!("{} {}", key, general_purpose::STANDARD.encode(bytes)));
            }
        }
        Ok(Some(pairs.join(",")))
    }

    /// Parse a header value. Never fails; see the module docs for fallbacks.
    pub fn decode(header: &str, encoding: MetadataEncoding) -> Self {
        let mut metadata = Metadata::new();
        for pair in header.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, raw) = match pair.split_once(' ') {
                Some((key, raw)) => (key, raw.trim()),
                None => (pair, ""),
            };
            if !is_valid_key(key) {
                debug!("skipping metadata entry with invalid key `{}`", key);
                continue;
            }
            let value = general_purpose::STANDARD
                .decode(raw)
                .ok()
                .and_then(|bytes| encoding.decode(bytes))
                .unwrap_or_else(|| raw.to_string());
            metadata.insert(key, value);
        }
        metadata
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Keys must be non-empty and contain neither whitespace nor commas.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.chars().any(|c| c.is_whitespace() || c == ',')
}
