use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;

/// Sequence length accepted either as a plain token count or as a string
/// with a `k` suffix (`"8k"` = 8192), the notation the UI uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSize(u32);

impl ContextSize {
    pub fn new(size: u32) -> Self {
        ContextSize(size)
    }

    pub fn tokens(&self) -> u32 {
        self.0
    }
}

impl<'de> Deserialize<'de> for ContextSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ContextSizeVisitor)
    }
}

struct ContextSizeVisitor;

impl<'de> de::Visitor<'de> for ContextSizeVisitor {
    type Value = ContextSize;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a token count or a string ending with 'k'")
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v < 0 || v > u32::MAX as i64 {
            return Err(E::custom("sequence length out of range"));
        }
        Ok(ContextSize::new(v as u32))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v > u32::MAX as u64 {
            return Err(E::custom("sequence length out of range"));
        }
        Ok(ContextSize::new(v as u32))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.is_empty() {
            return Err(E::custom("sequence length string cannot be empty"));
        }

        let last_char = v.chars().last().unwrap();
        if last_char == 'k' || last_char == 'K' {
            let num_part = &v[..v.len() - 1];
            num_part
                .parse::<u32>()
                .map(|n| ContextSize::new(n * 1024))
                .map_err(|_| E::custom("invalid number in sequence length with 'k'"))
        } else {
            v.parse::<u32>()
                .map(ContextSize::new)
                .map_err(|_| E::custom("invalid sequence length string"))
        }
    }
}

impl Serialize for ContextSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if self.0 != 0 && self.0 % 1024 == 0 {
            let mut buffer = String::new();
            buffer.push_str(&(self.0 / 1024).to_string());
            buffer.push('k');
            serializer.serialize_str(&buffer)
        } else {
            serializer.serialize_u32(self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_plain_and_suffixed() {
        let v: ContextSize = serde_json::from_str("4096").unwrap();
        assert_eq!(v.tokens(), 4096);
        let v: ContextSize = serde_json::from_str("\"8k\"").unwrap();
        assert_eq!(v.tokens(), 8192);
        let v: ContextSize = serde_json::from_str("\"32K\"").unwrap();
        assert_eq!(v.tokens(), 32768);
        let v: ContextSize = serde_json::from_str("\"100\"").unwrap();
        assert_eq!(v.tokens(), 100);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(serde_json::from_str::<ContextSize>("\"\"").is_err());
        assert!(serde_json::from_str::<ContextSize>("\"abck\"").is_err());
        assert!(serde_json::from_str::<ContextSize>("-1").is_err());
    }

    #[test]
    fn test_serialize_compacts_multiples_of_1024() {
        assert_eq!(serde_json::to_string(&ContextSize::new(8192)).unwrap(), "\"8k\"");
        assert_eq!(serde_json::to_string(&ContextSize::new(100)).unwrap(), "100");
    }
}
