//! Payload serialization.
//!
//! Frame codecs in [`protocol`](crate::protocol) only move opaque parameter
//! bytes around; turning application values into those bytes is the job of a
//! [`PayloadCodec`]. Two implementations ship with the crate:
//!
//! - [`JsonCodec`]: `serde_json`, the only format the dubbo-compatible framing
//!   accepts.
//! - [`BincodeCodec`]: compact big-endian `bincode`, the same configuration the
//!   standard framing uses for its metadata block.
//!
//! [`Serialization`] is the configuration-level selector between the two.
use std::{error::Error as StdError, fmt, str::FromStr};

use bincode::config::{BigEndian, Configuration, Fixint};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::config::ConfigError;

/// Bincode configuration shared by payloads and binary frame metadata.
pub(crate) fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    Serialize,
    Deserialize,
}

/// A payload could not be converted; fails the call, never the connection.
#[derive(Debug, Error)]
#[error("[{codec}][{kind:?}] {message}")]
pub struct CodecError {
    pub codec: &'static str,
    pub kind: CodecErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl CodecError {
    pub fn serialize(codec: &'static str, source: impl StdError + Send + Sync + 'static) -> Self {
        Self {
            codec,
            kind: CodecErrorKind::Serialize,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub fn deserialize(codec: &'static str, source: impl StdError + Send + Sync + 'static) -> Self {
        Self {
            codec,
            kind: CodecErrorKind::Deserialize,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Numeric code carried in logs and error responses.
    pub fn code(&self) -> u16 {
        match self.kind {
            CodecErrorKind::Serialize => 1001,
            CodecErrorKind::Deserialize => 1002,
        }
    }
}

pub trait PayloadCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::serialize(self.name(), e))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::deserialize(self.name(), e))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl PayloadCodec for BincodeCodec {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(value, wire_config())
            .map_err(|e| CodecError::serialize(self.name(), e))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, wire_config())
            .map_err(|e| CodecError::deserialize(self.name(), e))?;
        Ok(value)
    }
}

/// Payload format selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serialization {
    #[default]
    Json,
    Bincode,
}

impl Serialization {
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Serialization::Json => JsonCodec.serialize(value),
            Serialization::Bincode => BincodeCodec.serialize(value),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Serialization::Json => JsonCodec.deserialize(bytes),
            Serialization::Bincode => BincodeCodec.deserialize(bytes),
        }
    }
}

impl FromStr for Serialization {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Serialization::Json),
            "bincode" | "binary" => Ok(Serialization::Bincode),
            other => Err(ConfigError::UnknownSerialization(other.to_string())),
        }
    }
}

impl fmt::Display for Serialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Serialization::Json => write!(f, "json"),
            Serialization::Bincode => write!(f, "bincode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        to: String,
        times: u32,
    }

    #[test]
    fn json_payload() {
        let bytes = JsonCodec.serialize("hello world").unwrap();
        assert_eq!(bytes, br#""hello world""#);

        let back: String = JsonCodec.deserialize(&bytes).unwrap();
        assert_eq!(back, "hello world");
    }

    #[test]
    fn bincode_struct_payload() {
        let greeting = Greeting {
            to: "relay".into(),
            times: 3,
        };
        let bytes = BincodeCodec.serialize(&greeting).unwrap();
        let back: Greeting = BincodeCodec.deserialize(&bytes).unwrap();
        assert_eq!(back, greeting);
    }

    #[test]
    fn deserialize_failure_keeps_cause() {
        let err = JsonCodec.deserialize::<Greeting>(b"{not json").unwrap_err();
        assert_eq!(err.kind, CodecErrorKind::Deserialize);
        assert_eq!(err.code(), 1002);
        assert!(err.source().is_some());
    }

    #[test]
    fn serialization_from_str() {
        assert_eq!("JSON".parse::<Serialization>().unwrap(), Serialization::Json);
        assert_eq!(
            "bincode".parse::<Serialization>().unwrap(),
            Serialization::Bincode
        );
        assert!("xml".parse::<Serialization>().is_err());
    }
}
