use hubchat_crypto::identity::{DeviceKey, TempKey};

use crate::config::DeviceConfig;
use crate::errors::ConfigError;

/// Permanent identity key plus the current and previous temp keys.
pub struct DeviceKeys {
    pub identity: DeviceKey,
    pub current: TempKey,
    pub previous: Option<TempKey>,
}

impl DeviceKeys {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        let identity = DeviceKey::from_wif(&config.identity_wif, config.testnet)?;
        let current = TempKey::new(DeviceKey::from_base64(&config.temp_private_key_b64)?);
        let previous = config
            .previous_temp_private_key_b64
            .as_deref()
            .map(DeviceKey::from_base64)
            .transpose()?
            .map(TempKey::new);
        Ok(Self { identity, current, previous })
    }

    /// Fresh random keys. (Persisting them is the caller's concern.)
    pub fn generate() -> Self {
        Self {
            identity: DeviceKey::generate(),
            current: TempKey::new(DeviceKey::generate()),
            previous: None,
        }
    }

    /// Temp keys in the order inbound packages should be tried.
    pub fn temp_keys(&self) -> impl Iterator<Item = &TempKey> {
        std::iter::once(&self.current).chain(self.previous.as_ref())
    }
}
