//! Cache key derivation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use crate::types::GenerationRequest;

/// Which model entry point a cache entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    Generate,
    Stream,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Generate => "generate",
            GenerationMode::Stream => "stream",
        }
    }
}

impl std::fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GenerationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generate" => Ok(GenerationMode::Generate),
            "stream" => Ok(GenerationMode::Stream),
            other => Err(format!("unknown generation mode: {}", other)),
        }
    }
}

/// SHA-256 fingerprint of `{mode, canonical(request)}`, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub mode: GenerationMode,
    pub hash: String,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.hash
    }

    /// Key as stored in the KV backend.
    pub fn storage_key(&self, prefix: Option<&str>) -> String {
        match prefix {
            Some(p) => format!("{}:{}:{}", p, self.mode, self.hash),
            None => format!("{}:{}", self.mode, self.hash),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.mode, self.hash)
    }
}

/// Deterministic, I/O-free key derivation.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyDeriver {
    salt: Option<String>,
}

impl CacheKeyDeriver {
    pub fn new() -> Self {
        Self { salt: None }
    }

    /// Mix a namespace into every key (e.g. to invalidate after a prompt change).
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn derive(&self, mode: GenerationMode, request: &GenerationRequest) -> CacheKey {
        let request = serde_json::to_value(request).unwrap_or(Value::Null);
        self.derive_from_value(mode, &request)
    }

    /// Derive from an already-serialized request. Object key order is irrelevant.
    pub fn derive_from_value(&self, mode: GenerationMode, request: &Value) -> CacheKey {
        let mut canonical = String::new();
        canonical.push_str("{\"mode\":\"");
        canonical.push_str(mode.as_str());
        canonical.push_str("\",\"request\":");
        write_canonical(request, &mut canonical);
        if let Some(ref s) = self.salt {
            canonical.push_str(",\"salt\":");
            write_canonical(&Value::String(s.clone()), &mut canonical);
        }
        canonical.push('}');

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash = hasher
            .finalize()
            .iter()
            .fold(String::with_capacity(64), |mut acc, b| {
                let _ = write!(acc, "{:02x}", b);
                acc
            });
        CacheKey { mode, hash }
    }
}

/// Compact JSON with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(&Value::String(k.clone()), out);
                out.push(':');
                write_canonical(&map[k], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, ToolDefinition};
    use serde_json::json;

    fn request() -> GenerationRequest {
        GenerationRequest::new("m1", vec![Message::user("hello")])
            .system("be brief")
            .temperature(0.2)
    }

    #[test]
    fn test_identical_requests_collide() {
        let d = CacheKeyDeriver::new();
        assert_eq!(
            d.derive(GenerationMode::Stream, &request()),
            d.derive(GenerationMode::Stream, &request())
        );
        assert_eq!(d.derive(GenerationMode::Stream, &request()).hash.len(), 64);
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let d = CacheKeyDeriver::new();
        let a = json!({"model": "m1", "messages": [], "tools": [{"name": "t", "parameters": {"a": 1, "b": 2}}]});
        let b = json!({"tools": [{"parameters": {"b": 2, "a": 1}, "name": "t"}], "messages": [], "model": "m1"});
        assert_eq!(
            d.derive_from_value(GenerationMode::Generate, &a),
            d.derive_from_value(GenerationMode::Generate, &b)
        );
    }

    #[test]
    fn test_modes_do_not_collide() {
        let d = CacheKeyDeriver::new();
        let g = d.derive(GenerationMode::Generate, &request());
        let s = d.derive(GenerationMode::Stream, &request());
        assert_ne!(g.hash, s.hash);
        assert_ne!(g.storage_key(None), s.storage_key(None));
    }

    #[test]
    fn test_any_field_change_changes_key() {
        let d = CacheKeyDeriver::new();
        let base = d.derive(GenerationMode::Stream, &request());
        let variants = vec![
            request().temperature(0.3),
            request().system("be verbose"),
            request().max_tokens(10),
            request().tools(vec![ToolDefinition::new("t", json!({}))]),
            GenerationRequest {
                model: "m2".into(),
                ..request()
            },
        ];
        for v in variants {
            assert_ne!(d.derive(GenerationMode::Stream, &v), base);
        }
    }

    #[test]
    fn test_salt_namespaces_keys() {
        let plain = CacheKeyDeriver::new().derive(GenerationMode::Stream, &request());
        let salted = CacheKeyDeriver::new()
            .with_salt("v2")
            .derive(GenerationMode::Stream, &request());
        assert_ne!(plain, salted);
    }

    #[test]
    fn test_storage_key_prefix() {
        let key = CacheKey {
            mode: GenerationMode::Generate,
            hash: "abc".into(),
        };
        assert_eq!(key.storage_key(Some("genflow")), "genflow:generate:abc");
        assert_eq!(key.to_string(), "generate:abc");
    }
}
