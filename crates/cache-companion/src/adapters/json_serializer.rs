//! JSON value codec.

use crate::domain::CachedValue;
use crate::error::CompanionError;
use crate::ports::ValueSerializer;

/// Serializes values as JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonValueSerializer;

impl ValueSerializer for JsonValueSerializer {
    fn serialize(&self, value: &CachedValue) -> Result<Vec<u8>, CompanionError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<CachedValue, CompanionError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let value = CachedValue::new("i32", serde_json::json!(42)).with_created_at(7);
        let bytes = JsonValueSerializer.serialize(&value).unwrap();
        assert_eq!(JsonValueSerializer.deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            JsonValueSerializer.deserialize(b"not json"),
            Err(CompanionError::Codec(_))
        ));
    }
}
