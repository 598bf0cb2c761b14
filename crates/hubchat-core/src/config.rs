//! Persisted device configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use hubchat_crypto::identity::DeviceKey;

use crate::errors::ConfigError;

pub const MAINNET_HUB_URL: &str = "wss://obyte.org/bb";
pub const TESTNET_HUB_URL: &str = "wss://obyte.org/bb-test";

fn default_recovery_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub identity_wif: String,
    pub temp_private_key_b64: String,
    #[serde(default)]
    pub previous_temp_private_key_b64: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default)]
    pub hub_url: Option<String>,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Temp key decryptions after which rotation is signalled.
    #[serde(default)]
    pub temp_key_rotation_hint: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            identity_wif: String::new(),
            temp_private_key_b64: String::new(),
            previous_temp_private_key_b64: None,
            display_name: "Unnamed device".to_string(),
            testnet: false,
            hub_url: None,
            recovery_timeout_ms: default_recovery_timeout_ms(),
            temp_key_rotation_hint: None,
        }
    }
}

impl DeviceConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;

        let config: DeviceConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        info!(path = %path.display(), testnet = config.testnet, "device config loaded");
        Ok(config)
    }

    /// Defaults overlaid with `HUBCHAT_*` environment variables.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(wif) = lookup("HUBCHAT_IDENTITY_WIF") {
            self.identity_wif = wif;
        }
        if let Some(key) = lookup("HUBCHAT_TEMP_PRIVATE_KEY") {
            self.temp_private_key_b64 = key;
        }
        if let Some(key) = lookup("HUBCHAT_PREVIOUS_TEMP_PRIVATE_KEY") {
            self.previous_temp_private_key_b64 = Some(key);
        }
        if let Some(name) = lookup("HUBCHAT_DISPLAY_NAME") {
            self.display_name = name;
        }
        if let Some(flag) = lookup("HUBCHAT_TESTNET") {
            self.testnet = matches!(flag.trim(), "1" | "true" | "yes");
        }
        if let Some(url) = lookup("HUBCHAT_HUB_URL") {
            self.hub_url = Some(url);
        }
        if let Some(ms) = lookup("HUBCHAT_RECOVERY_TIMEOUT_MS") {
            self.recovery_timeout_ms = ms.trim().parse().map_err(|_| {
                ConfigError::ParseError(format!("HUBCHAT_RECOVERY_TIMEOUT_MS: {ms:?}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_wif.trim().is_empty() {
            return Err(ConfigError::ValidationError("identity_wif is required".to_string()));
        }
        if self.temp_private_key_b64.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "temp_private_key_b64 is required".to_string(),
            ));
        }
        if self.display_name.trim().is_empty() {
            return Err(ConfigError::ValidationError("display_name must not be empty".to_string()));
        }
        if self.recovery_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "recovery_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.temp_key_rotation_hint == Some(0) {
            return Err(ConfigError::ValidationError(
                "temp_key_rotation_hint must be > 0".to_string(),
            ));
        }
        if let Some(url) = &self.hub_url {
            if !(url.starts_with("wss://") || url.starts_with("ws://")) {
                return Err(ConfigError::ValidationError(format!(
                    "hub_url must be a ws:// or wss:// url: {url}"
                )));
            }
        }
        Ok(())
    }

    pub fn hub_url(&self) -> &str {
        match &self.hub_url {
            Some(url) => url,
            None if self.testnet => TESTNET_HUB_URL,
            None => MAINNET_HUB_URL,
        }
    }

    /// Hub URL without its scheme, as carried in invites and payloads.
    pub fn hub_host(&self) -> String {
        hub_host(self.hub_url())
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Fresh configuration with newly generated keys.
    pub fn generate(display_name: impl Into<String>, testnet: bool) -> Self {
        Self {
            identity_wif: DeviceKey::generate().to_wif(testnet),
            temp_private_key_b64: DeviceKey::generate().to_base64().to_string(),
            previous_temp_private_key_b64: Some(DeviceKey::generate().to_base64().to_string()),
            display_name: display_name.into(),
            testnet,
            ..Self::default()
        }
    }
}

pub fn hub_host(url: &str) -> String {
    url.trim_start_matches("wss://").trim_start_matches("ws://").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const WIF: &str = "922Rnwdvd4Y88WnHcrGe5KrWwqBvH8Tf4HvENAhXpLe38Akmoqj";

    fn base() -> DeviceConfig {
        DeviceConfig {
            identity_wif: WIF.into(),
            temp_private_key_b64: DeviceKey::generate().to_base64().to_string(),
            testnet: true,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_hub_defaults() {
        let mut cfg = base();
        assert_eq!(cfg.hub_url(), TESTNET_HUB_URL);
        assert_eq!(cfg.hub_host(), "obyte.org/bb-test");

        cfg.testnet = false;
        assert_eq!(cfg.hub_host(), "obyte.org/bb");

        cfg.hub_url = Some("ws://localhost:6611".into());
        assert_eq!(cfg.hub_host(), "localhost:6611");
        assert_eq!(cfg.recovery_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_toml() {
        let text = format!(
            r#"
identity_wif = "{WIF}"
temp_private_key_b64 = "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE="
display_name = "kiosk"
testnet = true
temp_key_rotation_hint = 100
"#
        );
        let cfg: DeviceConfig = toml::from_str(&text).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.recovery_timeout_ms, 500);
        assert_eq!(cfg.temp_key_rotation_hint, Some(100));
        assert!(cfg.previous_temp_private_key_b64.is_none());
    }

    #[test]
    fn test_validate() {
        assert!(base().validate().is_ok());

        let mut cfg = base();
        cfg.identity_wif.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::ValidationError(_))));

        let mut cfg = base();
        cfg.hub_url = Some("https://obyte.org/bb".into());
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.temp_key_rotation_hint = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("HUBCHAT_IDENTITY_WIF", WIF),
            ("HUBCHAT_TEMP_PRIVATE_KEY", "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE="),
            ("HUBCHAT_TESTNET", "true"),
            ("HUBCHAT_RECOVERY_TIMEOUT_MS", "750"),
        ]
        .into_iter()
        .collect();

        let mut cfg = DeviceConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert!(cfg.validate().is_ok());
        assert!(cfg.testnet);
        assert_eq!(cfg.recovery_timeout_ms, 750);

        let mut cfg = DeviceConfig::default();
        let err = cfg.apply_overrides(|k| {
            (k == "HUBCHAT_RECOVERY_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(matches!(err, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_generate_is_valid() {
        let cfg = DeviceConfig::generate("fresh", false);
        assert!(cfg.validate().is_ok());
        assert!(DeviceKey::from_wif(&cfg.identity_wif, false).is_ok());
    }
}
