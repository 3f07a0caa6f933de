use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

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

#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    pub burst: u32,
    pub window: Duration,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub http: RateLimitSettings,
    pub register: RateLimitSettings,
    pub stream: RateLimitSettings,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub database_dsn: String,
    pub jwt_signing_key: String,
    pub server_rsa_priv_path: Option<String>,
    pub otp_expiry_minutes: i64,
    pub handoff_ttl_minutes: i64,
    pub session_ttl_hours: i64,
    pub match_queue_capacity: usize,
    pub matchmaker_tick_ms: u64,
    pub waiter_max_age_seconds: i64,
    pub rate_limit: RateLimitConfig,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

const PLACEHOLDER_SIGNING_KEYS: &[&str] = &["change_this_secret", "changeme"];

/// Loads server configuration from an optional file with environment
/// overrides. A missing file is not an error; every option then comes
/// from `SOTTO_*` variables or defaults.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(_) => return Err(ConfigError::Io),
    };
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

    let port = override_env("SOTTO_PORT", map.remove("server.port"))?
        .unwrap_or_else(|| "8080".to_string());
    let bind = override_env("SOTTO_BIND", map.remove("server.bind"))?
        .unwrap_or_else(|| format!("0.0.0.0:{}", port));
    let database_dsn = override_env("SOTTO_DATABASE_DSN", map.remove("storage.database_dsn"))?
        .unwrap_or_else(|| {
            "host=localhost user=sotto dbname=sotto sslmode=disable".to_string()
        });
    let jwt_signing_key = required(override_env(
        "SOTTO_JWT_SIGNING_KEY",
        map.remove("auth.jwt_signing_key"),
    )?)?;
    if jwt_signing_key.len() < 32 {
        return Err(ConfigError::Invalid);
    }
    if PLACEHOLDER_SIGNING_KEYS
        .iter()
        .any(|placeholder| jwt_signing_key.starts_with(placeholder))
    {
        return Err(ConfigError::Invalid);
    }
    let server_rsa_priv_path = override_env(
        "SOTTO_SERVER_RSA_PRIV_PATH",
        map.remove("auth.server_rsa_priv_path"),
    )?;
    let otp_expiry_minutes = parse_number(
        override_env("SOTTO_OTP_EXPIRY_MINUTES", map.remove("auth.otp_expiry_minutes"))?,
        10,
    )?;
    let handoff_ttl_minutes = parse_number(
        override_env("SOTTO_HANDOFF_TTL_MINUTES", map.remove("auth.handoff_ttl_minutes"))?,
        5,
    )?;
    let session_ttl_hours = parse_number(
        override_env("SOTTO_SESSION_TTL_HOURS", map.remove("auth.session_ttl_hours"))?,
        24,
    )?;
    let match_queue_capacity = parse_number(
        override_env("SOTTO_MATCH_QUEUE_CAPACITY", map.remove("match.queue_capacity"))?,
        1000,
    )? as usize;
    let matchmaker_tick_ms = parse_number(
        override_env("SOTTO_MATCH_TICK_MS", map.remove("match.tick_ms"))?,
        100,
    )? as u64;
    let waiter_max_age_seconds = parse_number(
        override_env("SOTTO_WAITER_MAX_AGE_SECONDS", map.remove("match.waiter_max_age_seconds"))?,
        300,
    )?;
    let rate_limit_requests = parse_number(
        override_env("SOTTO_RATE_LIMIT_REQUESTS", map.remove("limits.rate_limit_requests"))?,
        10,
    )? as u32;
    let rate_limit_window_seconds = parse_number(
        override_env(
            "SOTTO_RATE_LIMIT_WINDOW_SECONDS",
            map.remove("limits.rate_limit_window_seconds"),
        )?,
        60,
    )? as u64;
    let tls_cert_path = override_env("SOTTO_TLS_CERT", map.remove("server.tls_cert"))?;
    let tls_key_path = override_env("SOTTO_TLS_KEY", map.remove("server.tls_key"))?;

    if match_queue_capacity == 0 || matchmaker_tick_ms == 0 {
        return Err(ConfigError::Invalid);
    }

    let window = Duration::from_secs(rate_limit_window_seconds.max(1));
    let settings = RateLimitSettings {
        burst: rate_limit_requests.max(1),
        window,
    };
    let rate_limit = RateLimitConfig {
        http: settings.clone(),
        register: settings.clone(),
        stream: settings,
    };

    Ok(ServerConfig {
        bind,
        database_dsn,
        jwt_signing_key,
        server_rsa_priv_path,
        otp_expiry_minutes,
        handoff_ttl_minutes,
        session_ttl_hours,
        match_queue_capacity,
        matchmaker_tick_ms,
        waiter_max_age_seconds,
        rate_limit,
        tls_cert_path,
        tls_key_path,
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

fn parse_number(value: Option<String>, default: i64) -> Result<i64, ConfigError> {
    match value {
        Some(raw) => raw.parse::<i64>().map_err(|_| ConfigError::Invalid),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_config(name: &str, contents: &[u8]) -> PathBuf {
        let mut path = PathBuf::from(env::temp_dir());
        path.push(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn parse_configuration_minimal() {
        let path = write_config(
            "sotto_test_config.toml",
            b"[server]\nport=\"9090\"\n[auth]\njwt_signing_key=\"0123456789abcdef0123456789abcdef\"\n",
        );
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "0.0.0.0:9090");
        assert_eq!(config.otp_expiry_minutes, 10);
        assert_eq!(config.match_queue_capacity, 1000);
        assert_eq!(config.matchmaker_tick_ms, 100);
        assert_eq!(config.waiter_max_age_seconds, 300);
        assert_eq!(config.rate_limit.http.burst, 10);
        assert!(config.tls_cert_path.is_none());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_short_signing_key() {
        let path = write_config(
            "sotto_test_short_key.toml",
            b"[auth]\njwt_signing_key=\"short\"\n",
        );
        assert!(load_configuration(&path).is_err());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_placeholder_signing_key() {
        let path = write_config(
            "sotto_test_placeholder.toml",
            b"[auth]\njwt_signing_key=\"change_this_secret_change_this_secret\"\n",
        );
        assert!(load_configuration(&path).is_err());
        fs::remove_file(path).unwrap();
    }
}
