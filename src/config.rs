//! Crate configuration.
//!
//! One YAML document with a section per component. Every field has a
//! default, so an empty document is a valid configuration. Environment
//! variables override the document:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `GENFLOW_KV_URL` | `kv.url` (a `redis://` URL also selects the redis backend) |
//! | `GENFLOW_STREAM_TTL_SECS` | `cache.stream_ttl_secs` |
//! | `GENFLOW_GENERATE_TTL_SECS` | `cache.generate_ttl_secs` (`0` or `none` clears it) |
//! | `GENFLOW_REPLAY_CHUNK_DELAY_MS` | `replay.chunk_delay_ms` |
//! | `GENFLOW_CACHE_ENABLED` | `cache.enabled` |
//! | `GENFLOW_PROVIDER` | `provider.kind` |
//! | `GENFLOW_MODEL` | `provider.model` |

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::cache::{CacheConfig, KvBackendKind, KvConfig};
use crate::classify::ClassifierConfig;
use crate::drivers::{ProviderConfig, ProviderKind};
use crate::routing::RouterConfig;
use crate::stream::{ReplayPacing, MAX_CHUNK_DELAY};
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenflowConfig {
    pub cache: CacheConfig,
    pub kv: KvConfig,
    pub replay: ReplayPacing,
    pub classifier: ClassifierConfig,
    pub router: RouterConfig,
    pub provider: ProviderConfig,
}

impl GenflowConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read config: {}", e),
                ErrorContext::new().with_source(path.display().to_string()),
            )
        })?;
        Self::from_yaml_str(&text)
    }

    /// Apply `GENFLOW_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|k| std::env::var(k).ok())
    }

    /// Apply overrides from an arbitrary lookup. Unset and empty variables
    /// leave the field untouched.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = var("GENFLOW_KV_URL") {
            if url.starts_with("redis://") || url.starts_with("rediss://") {
                self.kv.backend = KvBackendKind::Redis;
            }
            self.kv.url = Some(url);
        }
        if let Some(v) = var("GENFLOW_STREAM_TTL_SECS") {
            self.cache.stream_ttl_secs = parse_env("GENFLOW_STREAM_TTL_SECS", &v)?;
        }
        if let Some(v) = var("GENFLOW_GENERATE_TTL_SECS") {
            self.cache.generate_ttl_secs = match v.to_ascii_lowercase().as_str() {
                "none" | "0" => None,
                _ => Some(parse_env("GENFLOW_GENERATE_TTL_SECS", &v)?),
            };
        }
        if let Some(v) = var("GENFLOW_REPLAY_CHUNK_DELAY_MS") {
            self.replay.chunk_delay_ms = parse_env("GENFLOW_REPLAY_CHUNK_DELAY_MS", &v)?;
        }
        if let Some(v) = var("GENFLOW_CACHE_ENABLED") {
            self.cache.enabled = match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(env_error("GENFLOW_CACHE_ENABLED", &v, "expected a boolean")),
            };
        }
        if let Some(v) = var("GENFLOW_PROVIDER") {
            self.provider.kind = v
                .parse::<ProviderKind>()
                .map_err(|e| env_error("GENFLOW_PROVIDER", &v, e))?;
        }
        if let Some(v) = var("GENFLOW_MODEL") {
            self.provider.model = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.stream_ttl_secs == 0 {
            return Err(invalid("cache.stream_ttl_secs", "stream TTL must be positive"));
        }
        if self.replay.chunk_delay_ms > MAX_CHUNK_DELAY.as_millis() as u64 {
            return Err(invalid(
                "replay.chunk_delay_ms",
                format!("replay delay must not exceed {} ms", MAX_CHUNK_DELAY.as_millis()),
            ));
        }
        if self.replay.initial_delay_ms > MAX_CHUNK_DELAY.as_millis() as u64 {
            return Err(invalid(
                "replay.initial_delay_ms",
                format!("replay delay must not exceed {} ms", MAX_CHUNK_DELAY.as_millis()),
            ));
        }
        if self.classifier.model.trim().is_empty() {
            return Err(invalid("classifier.model", "classifier model is required"));
        }
        if self.provider.model.trim().is_empty() {
            return Err(invalid("provider.model", "provider model is required"));
        }
        if self.kv.backend == KvBackendKind::Redis && self.kv.url.is_none() {
            warn!("redis backend configured without a url; the cache will run disabled");
        }
        self.router.validate()
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| env_error(name, value, e))
}

fn env_error(name: &str, value: &str, reason: impl std::fmt::Display) -> Error {
    Error::configuration_with_context(
        format!("invalid value {:?} for {}", value, name),
        ErrorContext::new()
            .with_field_path(name)
            .with_details(reason.to_string())
            .with_source("environment"),
    )
}

fn invalid(field: &str, message: impl Into<String>) -> Error {
    Error::validation_with_context(message, ErrorContext::new().with_field_path(field))
}
