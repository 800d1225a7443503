use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Market data feed consumer with preferred-host failover", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FEED_CONFIG_PATH", help = "Path to this consumer's own JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FEED_POLICY_PATH", help = "Path to the feed policy document (channels, warm standby, preferred host).")]
    pub feed_config_path: Option<PathBuf>,

    #[clap(long, env = "FEED_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FEED_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "FEED_PROXY_USER", help = "User name for tunneled channels behind an authenticating proxy.")]
    pub proxy_user: Option<String>,

    #[clap(long, env = "FEED_PROXY_PASSWORD", help = "Password for tunneled channels behind an authenticating proxy.")]
    pub proxy_password: Option<String>,

    #[clap(long, env = "FEED_STATUS_INTERVAL_SECONDS", help = "Seconds between channel status reports in the log; 0 disables them.")]
    pub status_interval_seconds: Option<u64>,
}

/// Fully resolved settings; every field has a value.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub feed_config_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub proxy_credentials: Option<(String, String)>,
    pub status_interval_seconds: u64,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            feed_config_path: other.feed_config_path.or(self.feed_config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            proxy_user: other.proxy_user.or(self.proxy_user),
            proxy_password: other.proxy_password.or(self.proxy_password),
            status_interval_seconds: other.status_interval_seconds.or(self.status_interval_seconds),
        }
    }

    fn defaults() -> Config {
        Config {
            feed_config_path: Some(PathBuf::from("feed.json")),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            status_interval_seconds: Some(60),
            ..Default::default()
        }
    }

    fn into_settings(self) -> Settings {
        let proxy_credentials = match (self.proxy_user, self.proxy_password) {
            (Some(user), password) => Some((user, password.unwrap_or_default())),
            (None, Some(_)) => {
                log::warn!("Proxy password given without a proxy user; ignoring it.");
                None
            }
            (None, None) => None,
        };

        Settings {
            feed_config_path: self.feed_config_path.unwrap_or_else(|| PathBuf::from("feed.json")),
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            proxy_credentials,
            status_interval_seconds: self.status_interval_seconds.unwrap_or(60),
        }
    }
}

fn read_file_config(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<Config>(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, then the JSON config file, then environment/CLI values.
pub fn resolve(cli: Config) -> Settings {
    // 1. Defaults
    let mut current = Config::defaults();

    // 2. Config file, whose path itself may come from the CLI
    let config_file_path = cli.config_path.clone().unwrap_or_else(|| PathBuf::from("server_consumer.conf"));
    if let Some(file_config) = read_file_config(&config_file_path) {
        current = current.merge(file_config);
    }

    // 3. Environment variables and CLI arguments (clap reads both)
    current.merge(cli).into_settings()
}

pub fn load_config() -> Settings {
    resolve(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_without_file() {
        let settings = resolve(Config {
            config_path: Some(PathBuf::from("/nonexistent/server_consumer.conf")),
            ..Default::default()
        });
        assert_eq!(settings.feed_config_path, PathBuf::from("feed.json"));
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.status_interval_seconds, 60);
        assert!(settings.proxy_credentials.is_none());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"feedConfigPath": "/etc/feed/prod.json", "logLevel": "debug", "proxyUser": "svc"}"#)
            .unwrap();

        let settings = resolve(Config {
            config_path: Some(file.path().to_path_buf()),
            log_level: Some("warn".to_string()),
            ..Default::default()
        });
        assert_eq!(settings.feed_config_path, PathBuf::from("/etc/feed/prod.json"));
        assert_eq!(settings.log_level, "warn");
        assert_eq!(settings.proxy_credentials, Some(("svc".to_string(), String::new())));
    }

    #[test]
    fn test_unparsable_file_is_ignored() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not json").unwrap();

        let settings = resolve(Config { config_path: Some(file.path().to_path_buf()), ..Default::default() });
        assert_eq!(settings.log_dir, PathBuf::from("./logs"));
    }
}
