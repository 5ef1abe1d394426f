use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub database_path: String,
    pub jwt_secret: Option<String>,
    pub allowed_origins: Vec<String>,
    /// Prefix for the result URL stamped on uploads that complete by progress
    /// or by their final chunk.
    pub public_base_url: String,
    pub max_file_size: i64,
    pub max_chunks: i64,
    pub max_retries: i64,
    pub cleanup_default_days: u32,
    /// Shared secret for `/api/maintenance/*`. Unset disables those routes.
    pub maintenance_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:22900".to_string(),
            database_path: "./uploads.sqlite3".to_string(),
            jwt_secret: None,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            public_base_url: "http://localhost:22900".to_string(),
            max_file_size: 5 * 1024 * 1024 * 1024,
            max_chunks: 10_000,
            max_retries: 3,
            cleanup_default_days: 30,
            maintenance_token: None,
        }
    }
}

impl Config {
    /// Reads `path`, writing the defaults out first if the file is missing.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
        } else {
            let default_config = Config::default();
            let toml_string = toml::to_string_pretty(&default_config)
                .context("failed to serialize default config")?;
            std::fs::write(path, toml_string)
                .with_context(|| format!("failed to write {}", path.display()))?;
            log::info!("wrote default config to {}", path.display());
            Ok(default_config)
        }
    }

    pub fn from_args_env() -> anyhow::Result<Self> {
        let path = std::env::var("UPLOADS_CONFIG").unwrap_or_else(|_| "config.toml".into());
        let mut final_cfg = Self::load(Path::new(&path))?;
        final_cfg.apply_env_overrides(|key| std::env::var(key).ok());

        if final_cfg.jwt_secret.is_none() {
            log::warn!("jwt_secret not set, generating an ephemeral one");
            final_cfg.jwt_secret = Some(uuid::Uuid::new_v4().to_string());
        }
        Ok(final_cfg)
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("UPLOADS_LISTEN") {
            self.listen = v;
        }
        if let Some(v) = var("UPLOADS_DATABASE") {
            self.database_path = v;
        }
        if let Some(v) = var("UPLOADS_JWT_SECRET") {
            self.jwt_secret = Some(v);
        }
        if let Some(v) = var("UPLOADS_MAINTENANCE_TOKEN") {
            self.maintenance_token = Some(v);
        }
    }

    pub fn jwt_secret_bytes(&self) -> &[u8] {
        self.jwt_secret.as_deref().unwrap_or_default().as_bytes()
    }
}
