// Serde helpers for model fields that may be stored in more than one shape.

use serde::{Deserialize, Deserializer};

/// Deserializes a photo list that may be missing, `null`, or a single string.
pub fn deserialize_photos<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PhotosFormat {
        List(Vec<String>),
        Single(String),
    }

    let value = Option::<PhotosFormat>::deserialize(deserializer)?;
    match value {
        None => Ok(Vec::new()),
        Some(PhotosFormat::List(v)) => Ok(v),
        Some(PhotosFormat::Single(s)) if s.trim().is_empty() => Ok(Vec::new()),
        Some(PhotosFormat::Single(s)) => Ok(vec![s]),
    }
}

/// Deserializes a company id stored either as a number or a numeric string.
pub fn deserialize_lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdFormat {
        Number(i64),
        String(String),
    }

    match IdFormat::deserialize(deserializer)? {
        IdFormat::Number(n) => Ok(n),
        IdFormat::String(s) => s.trim().parse::<i64>().map_err(serde::de::Error::custom),
    }
}
