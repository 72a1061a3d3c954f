//! Payload codecs
//!
//! Payloads travel as opaque bytes. A `Codec` turns them into the handler's
//! payload type; JSON is the default.

use crate::error::PipelineError;
use serde::{de::DeserializeOwned, Serialize};

/// Decodes inbound payloads and encodes outbound ones
pub trait Codec<T>: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<T, PipelineError>;

    fn encode(&self, value: &T) -> Result<Vec<u8>, PipelineError>;
}

/// JSON codec backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn decode(&self, bytes: &[u8]) -> Result<T, PipelineError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, PipelineError> {
        Ok(serde_json::to_vec(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct FibonacciData {
        iterations: u32,
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec;
        let bytes = codec.encode(&FibonacciData { iterations: 10 }).unwrap();
        assert_eq!(bytes, br#"{"iterations":10}"#);

        let decoded: FibonacciData = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, FibonacciData { iterations: 10 });
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let result: Result<FibonacciData, _> = JsonCodec.decode(b"not json");
        assert!(matches!(result, Err(PipelineError::Codec(_))));
    }
}
