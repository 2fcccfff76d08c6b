use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use wallet_channel_core::DescriptorDefaults;

pub const ENV_PREFIX: &str = "WALLET_CHANNEL_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeProfile {
    #[default]
    Development,
    Production,
}

impl FromStr for RuntimeProfile {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::Invalid {
                key: "RUNTIME_PROFILE",
                value: other.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub handshake_timeout_ms: u64,
    pub close_poll_interval_ms: u64,
    pub popup_width: u32,
    pub popup_height: u32,
    pub request_timeout_ms: u64,
    pub runtime_profile: RuntimeProfile,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 30_000,
            close_poll_interval_ms: 500,
            popup_width: 400,
            popup_height: 600,
            request_timeout_ms: 60_000,
            runtime_profile: RuntimeProfile::Development,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Unset keys keep their default; unparseable ones are logged and ignored.
    pub fn from_lookup<L>(lookup: L) -> Self
    where
        L: Fn(&'static str) -> Option<String>,
    {
        let mut cfg = Self::default();
        override_with(&lookup, "HANDSHAKE_TIMEOUT_MS", &mut cfg.handshake_timeout_ms);
        override_with(&lookup, "CLOSE_POLL_INTERVAL_MS", &mut cfg.close_poll_interval_ms);
        override_with(&lookup, "POPUP_WIDTH", &mut cfg.popup_width);
        override_with(&lookup, "POPUP_HEIGHT", &mut cfg.popup_height);
        override_with(&lookup, "REQUEST_TIMEOUT_MS", &mut cfg.request_timeout_ms);
        override_with(&lookup, "RUNTIME_PROFILE", &mut cfg.runtime_profile);
        cfg
    }

    pub fn strict_runtime_required(&self) -> bool {
        self.runtime_profile == RuntimeProfile::Production
    }

    pub fn descriptor_defaults(&self) -> DescriptorDefaults {
        DescriptorDefaults {
            width: self.popup_width,
            height: self.popup_height,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            close_poll_interval: Duration::from_millis(self.close_poll_interval_ms.max(1)),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

fn override_with<L, T>(lookup: &L, key: &'static str, slot: &mut T)
where
    L: Fn(&'static str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring invalid config value"),
    }
}
