//! Application configuration loaded from the environment.

/// Runtime configuration for the API server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP listener to.
    pub bind_address: String,
    /// Postgres connection string.
    pub database_url: String,
    /// Shared secret for billing webhook signature verification.
    pub webhook_secret: String,
    /// Comma-separated CORS origin allowlist.
    pub allowed_origins: String,
}

impl Config {
    /// Load configuration from environment variables. Fails fast on missing
    /// required values so a misconfigured deploy never serves traffic.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let webhook_secret = std::env::var("BILLING_WEBHOOK_SECRET")
            .map_err(|_| anyhow::anyhow!("BILLING_WEBHOOK_SECRET must be set"))?;

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url,
            webhook_secret,
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string()),
        })
    }
}
