//! Serde helpers for byte blobs carried inside JSON documents
//!
//! JSON has no byte type, so announcements and transaction arbitrary data are
//! written as standard base64 strings.

/// `Vec<Vec<u8>>` as a list of base64 strings
pub mod blob_list {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(blobs: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(blobs.iter().map(|blob| STANDARD.encode(blob)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .into_iter()
            .map(|encoded| STANDARD.decode(encoded).map_err(D::Error::custom))
            .collect()
    }
}

/// `HashMap<K, Bytes>` as an object of base64 strings
pub mod blob_map {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::hash::Hash;

    pub fn serialize<K, S>(map: &HashMap<K, Bytes>, s: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        S: Serializer,
    {
        s.collect_map(map.iter().map(|(key, blob)| (key, STANDARD.encode(blob))))
    }

    pub fn deserialize<'de, K, D>(d: D) -> Result<HashMap<K, Bytes>, D::Error>
    where
        K: Deserialize<'de> + Eq + Hash,
        D: Deserializer<'de>,
    {
        HashMap::<K, String>::deserialize(d)?
            .into_iter()
            .map(|(key, encoded)| {
                STANDARD
                    .decode(encoded)
                    .map(|blob| (key, Bytes::from(blob)))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

/// `HashMap<K, Vec<Bytes>>` as an object of base64 string lists
pub mod blob_history {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::hash::Hash;

    pub fn serialize<K, S>(map: &HashMap<K, Vec<Bytes>>, s: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        S: Serializer,
    {
        s.collect_map(map.iter().map(|(key, blobs)| {
            let encoded: Vec<String> = blobs.iter().map(|blob| STANDARD.encode(blob)).collect();
            (key, encoded)
        }))
    }

    pub fn deserialize<'de, K, D>(d: D) -> Result<HashMap<K, Vec<Bytes>>, D::Error>
    where
        K: Deserialize<'de> + Eq + Hash,
        D: Deserializer<'de>,
    {
        HashMap::<K, Vec<String>>::deserialize(d)?
            .into_iter()
            .map(|(key, encoded)| {
                let blobs = encoded
                    .into_iter()
                    .map(|text| STANDARD.decode(text).map(Bytes::from))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(D::Error::custom)?;
                Ok((key, blobs))
            })
            .collect()
    }
}
