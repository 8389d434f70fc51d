use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::Path,
    time::Duration,
};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

pub const DEFAULT_PORT: u16 = 8080;
pub const CONFIG_FILE: &str = "devgate.toml";
pub const ENV_PREFIX: &str = "DEVGATE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Applies to every request except downloads.
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// Frames buffered per device before senders wait.
    pub outbound_queue: usize,
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            request_timeout_secs: 30,
            download_timeout_secs: 300,
            outbound_queue: 64,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl Config {
    /// Loads `$CONFIG_DIR/devgate.toml`, writing the defaults there on first run.
    pub fn new() -> Result<Self> {
        let dirs = directories::BaseDirs::new().ok_or(GatewayError::NoHomeDir)?;
        let config_file = dirs.config_dir().join(CONFIG_FILE);

        if !config_file.exists() {
            log::info!("creating config file at {config_file:?}");
            if let Some(parent) = config_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&config_file, toml::to_string(&Config::default())?)?;
        }

        Self::from_path(&config_file)
    }

    /// Layers defaults, the TOML file (if present) and `DEVGATE_*` variables.
    pub fn from_path(path: &Path) -> Result<Self> {
        log::info!("reading config from {path:?}");
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)?; // boxed because the error size from figment is large

        log::debug!("using config: {config:?}");
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn file_and_env_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                    bind_addr = "127.0.0.1:9000"
                    request_timeout_secs = 5
                "#,
            )?;
            jail.set_env("DEVGATE_DOWNLOAD_TIMEOUT_SECS", "42");

            let config = Config::from_path(Path::new(CONFIG_FILE)).map_err(|e| e.to_string())?;
            assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
            assert_eq!(config.request_timeout(), Duration::from_secs(5));
            assert_eq!(config.download_timeout(), Duration::from_secs(42));
            assert_eq!(config.outbound_queue, Config::default().outbound_queue);
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let config = Config::from_path(Path::new("nope.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn bad_value_is_a_parse_error() {
        Jail::expect_with(|jail| {
            jail.create_file(CONFIG_FILE, r#"request_timeout_secs = "soon""#)?;
            assert!(matches!(
                Config::from_path(Path::new(CONFIG_FILE)),
                Err(GatewayError::ConfigParseError(_))
            ));
            Ok(())
        });
    }
}
