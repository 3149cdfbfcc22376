use serde::{Serialize, Deserialize, Serializer, Deserializer};
use std::time::Duration;

/// Serializes Duration as whole seconds
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    duration.as_secs().serialize(serializer)
}

/// Deserializes Duration from whole seconds
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

/// Serializes bytes as a lowercase hex string
pub fn serialize_hex<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    hex::encode(bytes).serialize(serializer)
}

/// Serializes a list of byte strings as lowercase hex strings
pub fn serialize_hex_list<S, B>(items: &[B], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    B: AsRef<[u8]>,
{
    use serde::ser::SerializeSeq;

    let mut seq = serializer.serialize_seq(Some(items.len()))?;
    for item in items {
        seq.serialize_element(&hex::encode(item))?;
    }
    seq.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json;

    #[test]
    fn test_duration_serialization() {
        #[derive(Serialize, Deserialize)]
        struct Test {
            #[serde(serialize_with = "serialize_duration")]
            #[serde(deserialize_with = "deserialize_duration")]
            timeout: Duration,
        }

        let serialized = serde_json::to_string(&Test { timeout: Duration::from_secs(300) }).unwrap();
        assert_eq!(serialized, r#"{"timeout":300}"#);

        let deserialized: Test = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_hex_serialization() {
        #[derive(Serialize)]
        struct Test {
            #[serde(serialize_with = "serialize_hex")]
            data: Vec<u8>,
        }

        let serialized = serde_json::to_string(&Test { data: vec![0x01, 0xab, 0xff] }).unwrap();
        assert_eq!(serialized, r#"{"data":"01abff"}"#);
    }

    #[test]
    fn test_hex_list_serialization() {
        #[derive(Serialize)]
        struct Test {
            #[serde(serialize_with = "serialize_hex_list")]
            records: Vec<Vec<u8>>,
        }

        let value = Test { records: vec![vec![0x10, 0x11], vec![], vec![0xde, 0xad, 0xbe, 0xef]] };
        let serialized = serde_json::to_string(&value).unwrap();
        assert_eq!(serialized, r#"{"records":["1011","","deadbeef"]}"#);
    }
}
