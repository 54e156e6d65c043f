//! TOML configuration.
//!
//! Key names match the configuration files the daemon has always shipped
//! with; a reload that fails to parse or validate keeps the previous
//! snapshot in place.
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Default banner served as the MOTD.
pub const DEFAULT_MOTD: &str = r#"
  _|_|                                  _|_|_|  _|_|_|      _|_|_|
_|    _|  _|_|_|      _|_|    _|_|_|      _|    _|    _|  _|
_|_|_|_|  _|    _|  _|    _|  _|    _|    _|    _|_|_|    _|
_|    _|  _|    _|  _|    _|  _|    _|    _|    _|    _|  _|
_|    _|  _|    _|    _|_|    _|    _|  _|_|_|  _|    _|    _|_|_|
"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "MOTD")]
    pub motd: String,
    #[serde(rename = "Salt")]
    pub salt: String,
    #[serde(rename = "DBDriver")]
    pub db_driver: String,
    #[serde(rename = "DBSource")]
    pub db_source: String,
    #[serde(rename = "SSLCert")]
    pub ssl_cert: String,
    #[serde(rename = "SSLKey")]
    pub ssl_key: String,
    #[serde(rename = "Narrative")]
    pub narrative: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            motd: DEFAULT_MOTD.trim_matches('\n').to_owned(),
            salt: String::new(),
            db_driver: String::new(),
            db_source: String::new(),
            ssl_cert: String::new(),
            ssl_key: String::new(),
            narrative: String::new(),
        }
    }
}

impl Config {
    /// TLS is enabled whenever a certificate is configured.
    pub fn tls_enabled(&self) -> bool {
        !self.ssl_cert.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.db_driver.is_empty() || self.db_source.is_empty() {
            bail!(
                "DBDriver and DBSource must be configured\nExample:\n\n\
                 DBDriver=\"sqlite3\"\nDBSource=\"/home/user/anonircd/anonircd.db\""
            );
        }
        if self.db_driver != "sqlite3" {
            bail!("unsupported DBDriver {:?}: only sqlite3 is available", self.db_driver);
        }
        Ok(())
    }
}

/// Load and validate a configuration file.
pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read configuration file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse configuration file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
