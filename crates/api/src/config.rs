//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,

    // Identity provider (bearer token verification)
    pub identity_base_url: String,
    pub identity_api_key: String,

    // Generation backend
    pub generation_base_url: String,
    pub generation_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),

            // Redis
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            // Identity provider
            identity_base_url: env::var("IDENTITY_BASE_URL")
                .map_err(|_| ConfigError::Missing("IDENTITY_BASE_URL"))?,
            identity_api_key: env::var("IDENTITY_API_KEY")
                .map_err(|_| ConfigError::Missing("IDENTITY_API_KEY"))?,

            // Generation backend
            generation_base_url: env::var("GENERATION_BASE_URL")
                .map_err(|_| ConfigError::Missing("GENERATION_BASE_URL"))?,
            generation_timeout_ms: env::var("GENERATION_TIMEOUT_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .unwrap_or(30000),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("IDENTITY_BASE_URL", "http://identity.local");
        env::set_var("IDENTITY_API_KEY", "test-key");
        env::set_var("GENERATION_BASE_URL", "http://generation.local");
    }

    fn cleanup_config() {
        env::remove_var("DATABASE_URL");
        env::remove_var("IDENTITY_BASE_URL");
        env::remove_var("IDENTITY_API_KEY");
        env::remove_var("GENERATION_BASE_URL");
        env::remove_var("GENERATION_TIMEOUT_MS");
    }

    #[test]
    #[serial]
    fn missing_database_url_fails() {
        setup_minimal_config();
        env::remove_var("DATABASE_URL");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("DATABASE_URL"))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn defaults_apply_for_optional_values() {
        setup_minimal_config();
        env::remove_var("GENERATION_TIMEOUT_MS");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.generation_timeout_ms, 30000);
        assert_eq!(config.database_max_connections, 3);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn unparseable_timeout_falls_back_to_default() {
        setup_minimal_config();
        env::set_var("GENERATION_TIMEOUT_MS", "not-a-number");

        let config = Config::from_env().unwrap();
        assert_eq!(config.generation_timeout_ms, 30000);

        cleanup_config();
    }
}
