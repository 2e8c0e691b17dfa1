//! Serde helpers for wire fields

/// Byte payloads travel as standard base64 strings.
///
/// A missing or `null` field decodes to an empty payload, which is how the
/// relay omits empty data.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{de, Deserialize, Deserializer, Serializer};

    /// Serialize bytes as a base64 string
    pub fn serialize<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    /// Deserialize bytes from an optional base64 string
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Bytes::from)
                .map_err(de::Error::custom),
            None => Ok(Bytes::new()),
        }
    }

    /// Skip empty payloads on the wire
    pub fn is_empty(data: &Bytes) -> bool {
        data.is_empty()
    }
}
