use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 9999;
const DEFAULT_UPLOAD_DIR: &str = "./uploaded_images";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Runtime configuration, read once at startup from the environment
/// (a `.env` file is loaded first when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    /// Comma-delimited bearer token allow-list. Empty means nothing is accepted.
    pub api_tokens: String,
    pub index_auth_required: bool,
    pub vision_api_key: String,
    pub vision_base_url: String,
    pub vision_model: String,
    pub upstream_timeout: Duration,
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env_or("HOST", DEFAULT_HOST),
            port: parsed_env("PORT", DEFAULT_PORT)?,
            upload_dir: PathBuf::from(env_or("UPLOAD_DIR", DEFAULT_UPLOAD_DIR)),
            api_tokens: env::var("API_TOKENS").unwrap_or_default(),
            index_auth_required: parsed_env("INDEX_AUTH_REQUIRED", false)?,
            vision_api_key: env::var("VISION_API_KEY").context("VISION_API_KEY must be set")?,
            vision_base_url: env_or("VISION_BASE_URL", DEFAULT_BASE_URL),
            vision_model: env_or("VISION_MODEL", DEFAULT_MODEL),
            upstream_timeout: Duration::from_secs(parsed_env(
                "UPSTREAM_TIMEOUT_SECS",
                DEFAULT_UPSTREAM_TIMEOUT_SECS,
            )?),
            max_upload_bytes: parsed_env("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}
