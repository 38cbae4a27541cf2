//! Layered runtime configuration: `config/default.toml`, overridden by
//! `LEDGER__*` environment variables, deserialized into [`Settings`].
//!
//! Signing seeds and the reveal MAC secret are kept as base64 strings on the
//! struct and decoded on demand via [`KeySeeds`] — that keeps `Settings`
//! itself plain-`Deserialize` and leaves byte-length validation to the
//! crypto crate's own constructors.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("{field} is not valid base64: {source}")]
    InvalidBase64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorMode {
    ImmutableNative,
    ImmutableCli,
    Fake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptBackend {
    ObjectStore,
    Local,
}

/// Base64-encoded role signing seeds and the reveal MAC secret. Decoded
/// lazily rather than at deserialize time so a malformed value surfaces as
/// a `SettingsError`, not a panic deep inside `ed25519_dalek`.
#[derive(Debug, Clone, Deserialize)]
pub struct KeySeeds {
    pub agent_signing_seed_b64: String,
    pub human_signing_seed_b64: String,
    pub auditor_signing_seed_b64: String,
    pub reveal_mac_secret_b64: String,
}

fn decode(field: &'static str, value: &str) -> Result<Vec<u8>, SettingsError> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, value)
        .map_err(|source| SettingsError::InvalidBase64 { field, source })
}

impl KeySeeds {
    pub fn agent_seed(&self) -> Result<Vec<u8>, SettingsError> {
        decode("agent_signing_seed_b64", &self.agent_signing_seed_b64)
    }

    pub fn human_seed(&self) -> Result<Vec<u8>, SettingsError> {
        decode("human_signing_seed_b64", &self.human_signing_seed_b64)
    }

    pub fn auditor_seed(&self) -> Result<Vec<u8>, SettingsError> {
        decode("auditor_signing_seed_b64", &self.auditor_signing_seed_b64)
    }

    pub fn reveal_mac_secret(&self) -> Result<Vec<u8>, SettingsError> {
        decode("reveal_mac_secret_b64", &self.reveal_mac_secret_b64)
    }
}

/// One opaque bearer key per role, for the HTTP/CLI auth layer gated by
/// `auth_enabled`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeys {
    pub agent: String,
    pub human: String,
    pub auditor: String,
    pub admin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub storage_path: String,
    pub anchor_mode: AnchorMode,
    pub anchor_strict: bool,
    pub anchor_timeout_ms: u64,
    pub receipt_backend: ReceiptBackend,
    pub reveal_token_ttl_seconds: i64,
    pub auth_enabled: bool,
    pub keys: KeySeeds,
    pub api_keys: ApiKeys,
}

/// Loads `config/default.toml` (if present) then applies `LEDGER__*`
/// environment overrides (double underscore separates nested keys, e.g.
/// `LEDGER__KEYS__AGENT_SIGNING_SEED_B64`).
pub fn load() -> Result<Settings, SettingsError> {
    let raw = config::Config::builder()
        .add_source(config::File::with_name("config/default").required(false))
        .add_source(config::Environment::with_prefix("LEDGER").separator("__"))
        .build()?;
    Ok(raw.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_from_environment_only_when_no_default_file_present() {
        std::env::set_var("LEDGER__DATABASE_URL", "sqlite://test.db");
        std::env::set_var("LEDGER__STORAGE_PATH", "/tmp/ledger-test");
        std::env::set_var("LEDGER__ANCHOR_MODE", "fake");
        std::env::set_var("LEDGER__ANCHOR_STRICT", "false");
        std::env::set_var("LEDGER__ANCHOR_TIMEOUT_MS", "2000");
        std::env::set_var("LEDGER__RECEIPT_BACKEND", "local");
        std::env::set_var("LEDGER__REVEAL_TOKEN_TTL_SECONDS", "3600");
        std::env::set_var("LEDGER__AUTH_ENABLED", "false");
        std::env::set_var("LEDGER__KEYS__AGENT_SIGNING_SEED_B64", "AA==");
        std::env::set_var("LEDGER__KEYS__HUMAN_SIGNING_SEED_B64", "AA==");
        std::env::set_var("LEDGER__KEYS__AUDITOR_SIGNING_SEED_B64", "AA==");
        std::env::set_var("LEDGER__KEYS__REVEAL_MAC_SECRET_B64", "AA==");
        std::env::set_var("LEDGER__API_KEYS__AGENT", "agent-key");
        std::env::set_var("LEDGER__API_KEYS__HUMAN", "human-key");
        std::env::set_var("LEDGER__API_KEYS__AUDITOR", "auditor-key");
        std::env::set_var("LEDGER__API_KEYS__ADMIN", "admin-key");

        let settings = load().unwrap();
        assert_eq!(settings.database_url, "sqlite://test.db");
        assert_eq!(settings.anchor_mode, AnchorMode::Fake);
        assert!(!settings.anchor_strict);
        assert_eq!(settings.reveal_token_ttl_seconds, 3600);
    }
}
