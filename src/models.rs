//! Runtime configuration.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    /// Admin surface secret; `None` disables the admin endpoints entirely.
    pub admin_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./supermandi.db".to_string());
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);
        let admin_token = std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.trim().is_empty());

        Ok(Self {
            database_path,
            port,
            admin_token,
        })
    }
}
