use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub postgres_dsn: String,
    pub encryption_secret: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

/// Loads CifraChat server configuration from filesystem and environment overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = override_env("CIFRACHAT_BIND", map.remove("server.bind"))?
        .unwrap_or_else(|| "0.0.0.0:3000".to_string());
    let postgres_dsn = required(override_env(
        "CIFRACHAT_PG_DSN",
        map.remove("storage.postgres_dsn"),
    )?)?;
    let encryption_secret = override_env(
        "CIFRACHAT_ENCRYPTION_SECRET",
        map.remove("crypto.secret"),
    )?;
    let tls_cert = override_env("CIFRACHAT_TLS_CERT", map.remove("server.tls_cert"))?;
    let tls_key = override_env("CIFRACHAT_TLS_KEY", map.remove("server.tls_key"))?;
    if tls_cert.is_some() != tls_key.is_some() {
        return Err(ConfigError::Invalid);
    }

    Ok(ServerConfig {
        bind,
        postgres_dsn,
        encryption_secret,
        tls_cert,
        tls_key,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("cifrachat_test_config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:3000\"\n[storage]\npostgres_dsn=\"postgres://\"\n[crypto]\nsecret=\"una-clave-secreta-de-treinta-y-dos!!\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:3000");
        assert_eq!(config.postgres_dsn, "postgres://");
        assert_eq!(
            config.encryption_secret.as_deref(),
            Some("una-clave-secreta-de-treinta-y-dos!!")
        );
        assert!(config.tls_cert.is_none());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn bind_defaults_when_absent() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("cifrachat_test_defaults.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"[storage]\npostgres_dsn=\"postgres://\"\n").unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "0.0.0.0:3000");
        assert!(config.encryption_secret.is_none());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn tls_requires_both_sides() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("cifrachat_test_tls.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\ntls_cert=\"cert.pem\"\n[storage]\npostgres_dsn=\"postgres://\"\n",
        )
        .unwrap();
        let result = load_configuration(&path);
        assert!(matches!(result, Err(ConfigError::Invalid)));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_dsn_is_rejected() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("cifrachat_test_missing.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"[server]\nbind=\"127.0.0.1:3000\"\n").unwrap();
        let result = load_configuration(&path);
        assert!(matches!(result, Err(ConfigError::Missing)));
        fs::remove_file(path).unwrap();
    }
}
