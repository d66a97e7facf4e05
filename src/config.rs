//! Environment-driven configuration for the whole service.
//!
//! Every knob has a default, so the service starts with no environment at
//! all (the remote tier then simply fails its connectivity probe). Secrets
//! and deployment-specific values are overridden through environment
//! variables, never through files baked into the image.

use serde::{Deserialize, Serialize};

/// Main configuration aggregate, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub settings: SettingsConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub name: String,
    pub version: String,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error.
    pub level: String,
    pub output_file_path: String,
}

/// Placement-policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    pub auto_stage_movement: bool,
    pub default_creation_stage: u32,
    pub persistence_stage: u32,
    pub stage_timeout_secs: u64,
    pub request_count_threshold: u32,
    pub auto_sync_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub memory: MemoryStorageConfig,
    pub local: LocalStorageConfig,
    pub remote: RemoteStorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStorageConfig {
    pub name: String,
    pub stage_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    pub name: String,
    pub stage_number: u32,
    pub directory_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStorageConfig {
    pub name: String,
    pub stage_number: u32,
    pub access_key_id: String,
    pub secret_key: String,
    pub bucket_name: String,
    pub endpoint: String,
    pub region: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 8080,
                name: "SQLite Backend API".to_string(),
                version: "1.0.0".to_string(),
                read_timeout_secs: 10,
                write_timeout_secs: 10,
                idle_timeout_secs: 15,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                output_file_path: "logs.log".to_string(),
            },
            settings: SettingsConfig {
                auto_stage_movement: true,
                default_creation_stage: 3,
                persistence_stage: 3,
                stage_timeout_secs: 300,
                request_count_threshold: 2,
                auto_sync_enabled: true,
            },
            storage: StorageConfig {
                memory: MemoryStorageConfig {
                    name: "Memory Storage".to_string(),
                    stage_number: 1,
                },
                local: LocalStorageConfig {
                    name: "Local Storage".to_string(),
                    stage_number: 2,
                    directory_path: "./storage".to_string(),
                },
                remote: RemoteStorageConfig {
                    name: "Remote Storage".to_string(),
                    stage_number: 3,
                    access_key_id: String::new(),
                    secret_key: String::new(),
                    bucket_name: String::new(),
                    endpoint: String::new(),
                    region: "auto".to_string(),
                },
            },
        }
    }
}

impl Config {
    /// Build the configuration from environment variables, falling back to
    /// the documented defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        config.server.port = env_parse("SERVER_PORT", config.server.port);
        config.server.name = env_string("SERVER_NAME", config.server.name);
        config.server.version = env_string("SERVER_VERSION", config.server.version);
        config.server.read_timeout_secs =
            env_parse("SERVER_READ_TIMEOUT_SECONDS", config.server.read_timeout_secs);
        config.server.write_timeout_secs = env_parse(
            "SERVER_WRITE_TIMEOUT_SECONDS",
            config.server.write_timeout_secs,
        );
        config.server.idle_timeout_secs =
            env_parse("SERVER_IDLE_TIMEOUT_SECONDS", config.server.idle_timeout_secs);

        config.logging.level = env_string("LOGGING_LEVEL", config.logging.level);
        config.logging.output_file_path =
            env_string("LOGGING_OUTPUT_FILE_PATH", config.logging.output_file_path);

        config.settings.auto_stage_movement = env_bool(
            "SETTINGS_AUTO_STAGE_MOVEMENT",
            config.settings.auto_stage_movement,
        );
        config.settings.default_creation_stage = env_parse(
            "SETTINGS_DEFAULT_DATABASE_CREATION_STAGE",
            config.settings.default_creation_stage,
        );
        config.settings.persistence_stage = env_parse(
            "SETTINGS_PERSISTENCE_STAGE",
            config.settings.persistence_stage,
        );
        config.settings.stage_timeout_secs = env_parse(
            "SETTINGS_STAGE_TIMEOUT_SECONDS",
            config.settings.stage_timeout_secs,
        );
        config.settings.request_count_threshold = env_parse(
            "SETTINGS_REQUEST_COUNT_THRESHOLD",
            config.settings.request_count_threshold,
        );
        config.settings.auto_sync_enabled = env_bool(
            "SETTINGS_AUTO_SYNC_ENABLED",
            config.settings.auto_sync_enabled,
        );

        config.storage.local.directory_path = env_string(
            "STORAGE_LOCAL_DIRECTORY_PATH",
            config.storage.local.directory_path,
        );

        config.storage.remote.access_key_id = env_string(
            "STORAGE_REMOTE_ACCESS_KEY_ID",
            config.storage.remote.access_key_id,
        );
        config.storage.remote.secret_key =
            env_string("STORAGE_REMOTE_SECRET_KEY", config.storage.remote.secret_key);
        config.storage.remote.bucket_name = env_string(
            "STORAGE_REMOTE_BUCKET_NAME",
            config.storage.remote.bucket_name,
        );
        config.storage.remote.endpoint =
            env_string("STORAGE_REMOTE_ENDPOINT", config.storage.remote.endpoint);
        config.storage.remote.region =
            env_string("STORAGE_REMOTE_REGION", config.storage.remote.region);

        config
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documentation() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.settings.default_creation_stage, 3);
        assert_eq!(config.settings.persistence_stage, 3);
        assert_eq!(config.settings.stage_timeout_secs, 300);
        assert_eq!(config.settings.request_count_threshold, 2);
        assert!(config.settings.auto_stage_movement);
        assert!(config.settings.auto_sync_enabled);
        assert_eq!(config.storage.memory.stage_number, 1);
        assert_eq!(config.storage.local.stage_number, 2);
        assert_eq!(config.storage.remote.stage_number, 3);
        assert_eq!(config.storage.remote.region, "auto");
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("SETTINGS_REQUEST_COUNT_THRESHOLD", "7");
        std::env::set_var("SETTINGS_AUTO_SYNC_ENABLED", "false");
        let config = Config::from_env();
        assert_eq!(config.settings.request_count_threshold, 7);
        assert!(!config.settings.auto_sync_enabled);
        std::env::remove_var("SETTINGS_REQUEST_COUNT_THRESHOLD");
        std::env::remove_var("SETTINGS_AUTO_SYNC_ENABLED");
    }
}
