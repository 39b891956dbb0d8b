//! Credential resolution: environment, then `config.secrets.toml` beside the
//! config file, then the `[credentials]` section of the config itself.

use crate::config::CredentialsConfig;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const SECRETS_FILE_NAME: &str = "config.secrets.toml";

pub const ENV_WRDS_USERNAME: &str = "WRDS_USERNAME";
pub const ENV_WRDS_PASSWORD: &str = "WRDS_PASSWORD";
pub const ENV_ALPACA_API_KEY: &str = "ALPACA_API_KEY";
pub const ENV_ALPACA_SECRET_KEY: &str = "ALPACA_SECRET_KEY";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing {what}; set {env} or add it to config.secrets.toml")]
    Missing { what: &'static str, env: &'static str },
}

/// Resolved secrets. Never logged.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub wrds_username: Option<String>,
    pub wrds_password: Option<String>,
    pub alpaca_api_key: Option<String>,
    pub alpaca_secret_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("wrds_username", &self.wrds_username)
            .field("wrds_password", &mask(&self.wrds_password))
            .field("alpaca_api_key", &mask(&self.alpaca_api_key))
            .field("alpaca_secret_key", &mask(&self.alpaca_secret_key))
            .finish()
    }
}

impl Credentials {
    /// WRDS username and optional password (a `.pgpass` may supply it).
    pub fn wrds(&self) -> Result<(String, Option<String>), CredentialsError> {
        let user = self.wrds_username.clone().ok_or(CredentialsError::Missing {
            what: "WRDS username",
            env: ENV_WRDS_USERNAME,
        })?;
        Ok((user, self.wrds_password.clone()))
    }

    pub fn alpaca(&self) -> Result<(String, String), CredentialsError> {
        let key = self.alpaca_api_key.clone().ok_or(CredentialsError::Missing {
            what: "Alpaca API key",
            env: ENV_ALPACA_API_KEY,
        })?;
        let secret = self.alpaca_secret_key.clone().ok_or(CredentialsError::Missing {
            what: "Alpaca secret key",
            env: ENV_ALPACA_SECRET_KEY,
        })?;
        Ok((key, secret))
    }
}

#[derive(Debug, Default, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    credentials: CredentialsConfig,
}

/// `config.secrets.toml` in the config file's directory.
pub fn secrets_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(SECRETS_FILE_NAME)
}

fn read_secrets(path: &Path) -> Result<CredentialsConfig, CredentialsError> {
    if !path.is_file() {
        return Ok(CredentialsConfig::default());
    }
    let content = fs::read_to_string(path).map_err(|source| CredentialsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: SecretsFile = toml::from_str(&content).map_err(|source| CredentialsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "loaded secrets file");
    Ok(file.credentials)
}

/// Resolve from the process environment.
pub fn resolve(
    config_path: Option<&Path>,
    config: &CredentialsConfig,
) -> Result<Credentials, CredentialsError> {
    resolve_with(|name| std::env::var(name).ok(), config_path, config)
}

/// Resolve with an injectable environment lookup.
pub fn resolve_with<F>(
    env: F,
    config_path: Option<&Path>,
    config: &CredentialsConfig,
) -> Result<Credentials, CredentialsError>
where
    F: Fn(&str) -> Option<String>,
{
    let secrets = match config_path {
        Some(path) => read_secrets(&secrets_path(path))?,
        None => CredentialsConfig::default(),
    };
    let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let pick = |name: &str, from_secrets: &Option<String>, from_config: &Option<String>| {
        non_empty(env(name))
            .or_else(|| non_empty(from_secrets.clone()))
            .or_else(|| non_empty(from_config.clone()))
    };

    Ok(Credentials {
        wrds_username: pick(ENV_WRDS_USERNAME, &secrets.wrds_username, &config.wrds_username),
        wrds_password: pick(ENV_WRDS_PASSWORD, &secrets.wrds_password, &config.wrds_password),
        alpaca_api_key: pick(ENV_ALPACA_API_KEY, &secrets.alpaca_api_key, &config.alpaca_api_key),
        alpaca_secret_key: pick(
            ENV_ALPACA_SECRET_KEY,
            &secrets.alpaca_secret_key,
            &config.alpaca_secret_key,
        ),
    })
}
