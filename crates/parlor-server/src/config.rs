use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub attachment_dir: PathBuf,
    pub jwt_secret: String,
    pub rank_refresh: Duration,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = get("PARLOR_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!(
                "PARLOR_JWT_SECRET is unset or still a placeholder; \
                 it must match the secret the host application signs tokens with"
            );
        }

        let host = get("PARLOR_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = get("PARLOR_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("PARLOR_PORT must be a port number")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .context("PARLOR_HOST must be an IP address")?;

        let db_path = get("PARLOR_DB_PATH")
            .unwrap_or_else(|| "parlor.db".into())
            .into();
        let attachment_dir = get("PARLOR_ATTACHMENT_DIR")
            .unwrap_or_else(|| "./chat-attachments".into())
            .into();
        let rank_refresh_secs: u64 = get("PARLOR_RANK_REFRESH_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(300);

        Ok(Self {
            addr,
            db_path,
            attachment_dir,
            jwt_secret,
            rank_refresh: Duration::from_secs(rank_refresh_secs),
        })
    }
}
