//! Runtime configuration loaded from the environment.
//!
//! Env var names are the lower-cased field names (`database_url`, `addr`,
//! `embed_model`, …). Binaries call `dotenvy::from_filename(".env.local")`
//! before [`Config::from_env`] so dev setups can keep a local file;
//! production injects env vars directly.
//!
//! The canonical JSON + SHA-256 hash of the *redacted* config is exposed in
//! `/v1/status` so operators can tell two deployments apart without ever
//! seeing secret material.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Reserved replacement for secret values in redacted output.
pub const MASK: &str = "***";

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Postgres connection string. Required; init fails without it.
    pub database_url: String,
    /// Bind address for the HTTP surface.
    pub addr: String,
    pub port: u16,

    /// The embed model is immutable: delete paths must refuse it.
    pub embed_model: String,
    pub embed_provider: String,
    pub chat_model: String,
    pub chat_provider: String,
    pub task_model: String,
    pub task_provider: String,

    /// Admin token for the HTTP surface. Empty disables the check (dev).
    pub token: String,

    /// Per-attempt timeout for backend dials.
    pub backend_dial_timeout_secs: u64,
    /// Cadence of the lease-expiry reclamation cycle. Keep at or below the
    /// minimum lease duration handed out by workers.
    pub lease_reclaim_secs: u64,
    /// Cadence of the backend and download reconciliation cycles.
    pub cycle_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("database_url").map_err(|_| anyhow!("missing env var database_url"))?;

        Ok(Self {
            database_url,
            addr: env_or("addr", "127.0.0.1"),
            port: env_parsed("port", 8081)?,
            embed_model: env_or("embed_model", "nomic-embed-text:latest"),
            embed_provider: env_or("embed_provider", "ollama"),
            chat_model: env_or("chat_model", ""),
            chat_provider: env_or("chat_provider", "ollama"),
            task_model: env_or("task_model", ""),
            task_provider: env_or("task_provider", "ollama"),
            token: env_or("token", ""),
            backend_dial_timeout_secs: env_parsed("backend_dial_timeout_secs", 10)?,
            lease_reclaim_secs: env_parsed("lease_reclaim_secs", 5)?,
            cycle_interval_secs: env_parsed("cycle_interval_secs", 10)?,
        })
    }

    /// `addr:port` as a socket-address string.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Copy with all secret fields replaced by [`MASK`].
    pub fn redacted(&self) -> Config {
        let mut c = self.clone();
        if !c.token.is_empty() {
            c.token = MASK.to_string();
        }
        c.database_url = mask_url_credentials(&c.database_url);
        c
    }

    /// SHA-256 over the canonical (sorted-key, compact) JSON of the redacted
    /// config. Stable across field ordering and whitespace.
    pub fn config_hash(&self) -> Result<String> {
        let raw = serde_json::to_value(self.redacted()).context("serialize config failed")?;
        let canonical =
            serde_json::to_string(&sort_keys(&raw)).context("canonical json stringify failed")?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow!("invalid env var {key}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Strip `user:password@` userinfo from a URL-ish string.
fn mask_url_credentials(url: &str) -> String {
    match (url.find("://"), url.find('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}{}@{}", &url[..scheme_end + 3], MASK, &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

/// Sort object keys recursively so the hash does not depend on map order.
fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            database_url: "postgres://orq:hunter2@db:5432/orq".to_string(),
            addr: "127.0.0.1".to_string(),
            port: 8081,
            embed_model: "nomic-embed-text:latest".to_string(),
            embed_provider: "ollama".to_string(),
            chat_model: String::new(),
            chat_provider: "ollama".to_string(),
            task_model: String::new(),
            task_provider: "ollama".to_string(),
            token: "secret-token".to_string(),
            backend_dial_timeout_secs: 10,
            lease_reclaim_secs: 5,
            cycle_interval_secs: 10,
        }
    }

    #[test]
    fn redacted_masks_token_and_db_credentials() {
        let r = test_config().redacted();
        assert_eq!(r.token, MASK);
        assert_eq!(r.database_url, "postgres://***@db:5432/orq");
    }

    #[test]
    fn config_hash_is_stable_and_ignores_secret_value() {
        let a = test_config();
        let mut b = test_config();
        b.token = "some-other-token".to_string();

        // Both tokens redact to the same mask, so the hashes agree.
        assert_eq!(a.config_hash().unwrap(), b.config_hash().unwrap());

        let mut c = test_config();
        c.port = 9000;
        assert_ne!(a.config_hash().unwrap(), c.config_hash().unwrap());
    }

    #[test]
    fn mask_url_without_credentials_is_unchanged() {
        assert_eq!(
            mask_url_credentials("postgres://db:5432/orq"),
            "postgres://db:5432/orq"
        );
    }
}
