//! Body codecs selected by `content_type`.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{PoolError, Result};

pub const TEXT_PLAIN: &str = "text/plain";
pub const APPLICATION_JSON: &str = "application/json";
pub const APPLICATION_GZIP: &str = "application/gzip";

/// Message payload, either raw or decoded
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Body {
    #[default]
    Empty,
    /// Already encoded bytes, passed through untouched
    Bytes(Vec<u8>),
    Text(String),
    Structured(serde_json::Value),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Text(text) => text.is_empty(),
            Self::Structured(value) => value.is_null(),
        }
    }

    /// Structured view of the body, parsing text when needed
    pub fn to_value(&self) -> Result<serde_json::Value> {
        match self {
            Self::Empty => Ok(serde_json::Value::Null),
            Self::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
            Self::Text(text) => Ok(serde_json::from_str(text)?),
            Self::Structured(value) => Ok(value.clone()),
        }
    }
}

fn ensure_supported(content_type: &str) -> Result<()> {
    match content_type {
        TEXT_PLAIN | APPLICATION_JSON | APPLICATION_GZIP => Ok(()),
        other => Err(PoolError::ContentType {
            content_type: other.to_string(),
        }),
    }
}

/// Serialize a body for the wire
pub fn encode(content_type: &str, body: &Body) -> Result<Vec<u8>> {
    ensure_supported(content_type)?;

    if let Body::Bytes(bytes) = body {
        return Ok(bytes.clone());
    }

    match content_type {
        TEXT_PLAIN => Ok(match body {
            Body::Empty => Vec::new(),
            Body::Text(text) => text.clone().into_bytes(),
            Body::Structured(serde_json::Value::String(text)) => text.clone().into_bytes(),
            Body::Structured(value) => value.to_string().into_bytes(),
            Body::Bytes(bytes) => bytes.clone(),
        }),
        APPLICATION_JSON => Ok(serde_json::to_vec(&body.to_json_value())?),
        _ => {
            let json = serde_json::to_vec(&body.to_json_value())?;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Parse a wire payload into a body
pub fn decode(content_type: &str, payload: &[u8]) -> Result<Body> {
    ensure_supported(content_type)?;

    if payload.is_empty() {
        return Ok(Body::Empty);
    }

    match content_type {
        TEXT_PLAIN => Ok(Body::Text(String::from_utf8_lossy(payload).into_owned())),
        APPLICATION_JSON => Ok(Body::Structured(serde_json::from_slice(payload)?)),
        _ => {
            let mut decoder = GzDecoder::new(payload);
            let mut json = Vec::new();
            decoder.read_to_end(&mut json)?;
            Ok(Body::Structured(serde_json::from_slice(&json)?))
        }
    }
}

impl Body {
    fn to_json_value(&self) -> serde_json::Value {
        match self {
            Self::Empty => serde_json::Value::Null,
            Self::Text(text) => serde_json::Value::String(text.clone()),
            Self::Structured(value) => value.clone(),
            Self::Bytes(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}
