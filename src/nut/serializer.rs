use crate::errors::TrunkResult;
use crate::nut::Nut;

/// Converts a nut to and from its byte representation. The full envelope is
/// always serialized, never just the payload, so a record on disk is
/// self-describing even without the keydir.
pub trait NutSerializer: Send + Sync {
    /// # Errors
    /// Returns an error if the nut cannot be encoded.
    fn serialize(&self, nut: &Nut) -> TrunkResult<Vec<u8>>;

    /// # Errors
    /// Returns an error if the bytes do not decode to a nut.
    fn deserialize(&self, bytes: &[u8]) -> TrunkResult<Nut>;
}

/// The default serializer: JSON over UTF-8.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl NutSerializer for JsonSerializer {
    fn serialize(&self, nut: &Nut) -> TrunkResult<Vec<u8>> {
        Ok(serde_json::to_vec(nut)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> TrunkResult<Nut> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
