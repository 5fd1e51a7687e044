use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use super::schema::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("config is missing required field: {0}")]
    MissingField(&'static str),
}

/// Loads the TOML configuration from `path`, then applies the
/// `SHARED_SECRET` environment override (spec §6). Unrecognised
/// environment variables are ignored, matching the spec's ambient-env
/// contract; only the ones it names have an effect.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source: Box::new(source),
    })?;

    if let Ok(shared_secret) = std::env::var("SHARED_SECRET") {
        debug!("overriding gateway shared secret from SHARED_SECRET env var");
        config.gateway.shared_secret = shared_secret;
    }

    if config.gateway.shared_secret.is_empty() {
        return Err(ConfigError::MissingField("gateway.shared_secret"));
    }
    if config.chat.telegram_token.is_empty() {
        warn!("chat.telegram_token is empty; outbound notifications will fail until configured");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = r#"
        [gateway]
        shared_secret = "s3cr3t"

        [chat]
        chat_id = "12345"
    "#;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let file = write_temp_config(MINIMAL);
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.gateway.notify_port, 8080);
        assert_eq!(config.gateway.webhook_port, 8081);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn env_var_overrides_shared_secret() {
        let file = write_temp_config(MINIMAL);
        std::env::set_var("SHARED_SECRET", "from-env");
        let config = load_config(file.path()).unwrap();
        std::env::remove_var("SHARED_SECRET");
        assert_eq!(config.gateway.shared_secret, "from-env");
    }

    #[test]
    fn missing_shared_secret_is_rejected() {
        let file = write_temp_config(
            r#"
            [gateway]
            shared_secret = ""

            [chat]
            chat_id = "1"
            "#,
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }
}
