//! Konfiguration
//!
//! Reihenfolge: Umgebungsvariablen (`CALLCORE__SIGNALING__URL`, ...) >
//! TOML-Datei > Defaults.

use crate::call_engine::{CallSettings, DEFAULT_DISCONNECT_GRACE, DEFAULT_NEGOTIATION_TIMEOUT};
use crate::directory::ConversationDirectory;
use crate::media::CaptureProfile;
use crate::peer::default_stun_urls;
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "CALLCORE";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid signaling URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Eigene Teilnehmer-ID beim Relay
    pub participant_id: Option<String>,
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub capture: CaptureProfile,
    pub call: CallTimingConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub heartbeat_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5000".to_string(),
            heartbeat_secs: 25,
        }
    }
}

impl SignalingConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallTimingConfig {
    pub disconnect_grace_secs: u64,
    pub negotiation_timeout_secs: u64,
}

impl Default for CallTimingConfig {
    fn default() -> Self {
        Self {
            disconnect_grace_secs: DEFAULT_DISCONNECT_GRACE.as_secs(),
            negotiation_timeout_secs: DEFAULT_NEGOTIATION_TIMEOUT.as_secs(),
        }
    }
}

impl CallTimingConfig {
    pub fn settings(&self) -> CallSettings {
        CallSettings {
            disconnect_grace: Duration::from_secs(self.disconnect_grace_secs),
            negotiation_timeout: Duration::from_secs(self.negotiation_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub database_path: Option<PathBuf>,
}

impl DirectoryConfig {
    /// Konfigurierter Pfad oder der Plattform-Standard
    pub fn resolve_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(ConversationDirectory::default_path)
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl AppConfig {
    /// Lädt die Konfiguration aus Datei und Umgebung
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(path, None)
    }

    /// Standard-Pfad der Konfigurationsdatei
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "callcore").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn load_from(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(default) = Self::default_path() {
                    builder = builder.add_source(config::File::from(default).required(false));
                }
            }
        }

        let cfg = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("ice.stun_urls")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let app_config: AppConfig = cfg.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.signaling.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.signaling.url.clone(),
            reason: e.to_string(),
        })?;

        if self.signaling.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid(
                "signaling.heartbeat_secs must be positive".to_string(),
            ));
        }
        if self.call.negotiation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "call.negotiation_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::load_from(None, env(&[])).unwrap();

        assert_eq!(config.participant_id, None);
        assert_eq!(config.signaling.url, "ws://127.0.0.1:5000");
        assert_eq!(config.signaling.heartbeat(), Duration::from_secs(25));
        assert_eq!(config.ice.stun_urls.len(), 3);
        assert_eq!(config.capture, CaptureProfile::default());
        assert_eq!(config.call.settings(), CallSettings::default());
    }

    #[test]
    fn test_file_and_env_overrides() {
        let file = config_file(
            r#"
            participant_id = "U1"

            [signaling]
            url = "wss://relay.example.com"

            [capture]
            width = 1280
            height = 720

            [call]
            disconnect_grace_secs = 5
            "#,
        );

        let config = AppConfig::load_from(
            Some(file.path()),
            env(&[
                ("CALLCORE__SIGNALING__HEARTBEAT_SECS", "10"),
                ("CALLCORE__ICE__STUN_URLS", "stun:a.example:3478,stun:b.example:3478"),
            ]),
        )
        .unwrap();

        assert_eq!(config.participant_id.as_deref(), Some("U1"));
        assert_eq!(config.signaling.url, "wss://relay.example.com");
        assert_eq!(config.signaling.heartbeat_secs, 10);
        assert_eq!(
            config.ice.stun_urls,
            vec!["stun:a.example:3478", "stun:b.example:3478"]
        );
        assert_eq!(config.capture.width, 1280);
        assert_eq!(config.capture.frame_rate, 30);
        assert_eq!(
            config.call.settings().disconnect_grace,
            Duration::from_secs(5)
        );
        assert_eq!(
            config.call.settings().negotiation_timeout,
            DEFAULT_NEGOTIATION_TIMEOUT
        );
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load_from(Some(&dir.path().join("missing.toml")), env(&[]));

        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let result = AppConfig::load_from(
            None,
            env(&[("CALLCORE__SIGNALING__URL", "not a url")]),
        );

        assert!(matches!(result, Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn test_directory_path_override() {
        let config = AppConfig::load_from(
            None,
            env(&[("CALLCORE__DIRECTORY__DATABASE_PATH", "/tmp/calls.db")]),
        )
        .unwrap();

        assert_eq!(
            config.directory.resolve_path(),
            Some(PathBuf::from("/tmp/calls.db"))
        );
    }
}
