#[macro_use]
extern crate slog_scope;

pub mod wallet;

use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Values accepted by boolean-ish environment switches.
const TRUTHY: &[&str] = &["yes", "true", "1", "on"];
const FALSY: &[&str] = &["no", "false", "0", "off"];

/// Runtime configuration, read from the flat environment names that form the
/// deployment contract (`ORACLE_*`, `SENTINEL_*`, `OAUTH2_*`, ...).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Database / wallet
    pub oracle_tns_name: Option<String>,
    pub oracle_user: Option<String>,
    pub oracle_password: Option<String>,
    pub oracle_wallet_location: Option<String>,
    pub oracle_wallet_base64: Option<String>,
    /// Truthy/falsy string; anything else warns and defaults to enabled.
    pub oracle_ssl_server_dn_match: Option<String>,

    // Pool sizing
    pub oracle_pool_min_sessions: u32,
    pub oracle_pool_max_sessions: u32,
    pub oracle_pool_session_increment: u32,
    pub oracle_pool_ping_interval_seconds: u64,
    pub oracle_pool_wait_timeout_ms: u64,
    pub oracle_pool_max_lifetime_session_seconds: u64,

    // OAuth2 bearer validation
    pub oauth2_jwk_set_uri: Option<String>,
    pub oauth2_issuer_uri: Option<String>,
    pub oauth2_audience: String,
    /// Signature verification switch. Defaults to enforcing; disabling it is
    /// not implemented and validation then fails closed.
    pub oauth2_enforce_signature: bool,

    // Service
    pub sentinel_http_host: String,
    pub sentinel_http_port: u16,
    pub sentinel_worker_threads: usize,
    pub sentinel_queue_name: String,
    pub sentinel_log_batch_size: usize,
    pub sentinel_task_queue_capacity: usize,
    pub sentinel_task_timeout_ms: u64,
    pub sentinel_dequeue_wait_seconds: u64,
    pub sentinel_flush_interval_ms: u64,

    // Observability
    pub prometheus_metrics_port: u16,
    pub log_level: String,
    pub human_logs: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            oracle_tns_name: None,
            oracle_user: None,
            oracle_password: None,
            oracle_wallet_location: None,
            oracle_wallet_base64: None,
            oracle_ssl_server_dn_match: None,

            oracle_pool_min_sessions: 2,
            oracle_pool_max_sessions: 10,
            oracle_pool_session_increment: 1,
            oracle_pool_ping_interval_seconds: 60,
            oracle_pool_wait_timeout_ms: 5000,
            oracle_pool_max_lifetime_session_seconds: 3600,

            oauth2_jwk_set_uri: None,
            oauth2_issuer_uri: None,
            oauth2_audience: "clm-service".to_owned(),
            oauth2_enforce_signature: true,

            sentinel_http_host: "0.0.0.0".to_owned(),
            sentinel_http_port: 8090,
            sentinel_worker_threads: 4,
            sentinel_queue_name: "SENTINEL_QUEUE".to_owned(),
            sentinel_log_batch_size: 1000,
            sentinel_task_queue_capacity: 1024,
            sentinel_task_timeout_ms: 1000,
            sentinel_dequeue_wait_seconds: 5,
            sentinel_flush_interval_ms: 5000,

            prometheus_metrics_port: 9090,
            log_level: "info".to_owned(),
            human_logs: false,
        }
    }
}

impl Settings {
    /// Load the settings from the environment and validate the required set.
    pub fn with_env() -> Result<Self, ConfigError> {
        let loaded = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        match loaded.try_deserialize::<Self>() {
            Ok(settings) => {
                settings.validate()?;
                Ok(settings)
            }
            // Configuration errors are not very sysop friendly, try to make
            // them a bit more 3AM useful.
            Err(ConfigError::Message(v)) => {
                println!("Bad configuration: {:?}", &v);
                println!("Please set the value via an environment variable.");
                error!("Configuration error: Value undefined {:?}", &v);
                Err(ConfigError::NotFound(v))
            }
            Err(e) => {
                error!("Configuration error: Other: {:?}", &e);
                Err(e)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn required(name: &str, value: &Option<String>) -> Result<(), ConfigError> {
            match value {
                Some(v) if !v.is_empty() => Ok(()),
                _ => Err(ConfigError::NotFound(name.to_owned())),
            }
        }

        required("ORACLE_TNS_NAME", &self.oracle_tns_name)?;
        required("OAUTH2_JWK_SET_URI", &self.oauth2_jwk_set_uri)?;
        required("OAUTH2_ISSUER_URI", &self.oauth2_issuer_uri)?;

        let has_location = matches!(&self.oracle_wallet_location, Some(v) if !v.is_empty());
        let has_base64 = matches!(&self.oracle_wallet_base64, Some(v) if !v.is_empty());
        match (has_location, has_base64) {
            (true, false) | (false, true) => {}
            (false, false) => {
                return Err(ConfigError::Message(
                    "one of ORACLE_WALLET_LOCATION or ORACLE_WALLET_BASE64 is required".to_owned(),
                ))
            }
            (true, true) => {
                return Err(ConfigError::Message(
                    "ORACLE_WALLET_LOCATION and ORACLE_WALLET_BASE64 are mutually exclusive"
                        .to_owned(),
                ))
            }
        }

        if self.oracle_pool_min_sessions > self.oracle_pool_max_sessions {
            return Err(ConfigError::Message(
                "ORACLE_POOL_MIN_SESSIONS exceeds ORACLE_POOL_MAX_SESSIONS".to_owned(),
            ));
        }
        if self.sentinel_worker_threads == 0 {
            return Err(ConfigError::Message(
                "SENTINEL_WORKER_THREADS must be at least 1".to_owned(),
            ));
        }

        Ok(())
    }

    /// Whether the client should verify the server certificate DN.
    /// Unrecognized values warn and fall back to enabled.
    pub fn ssl_server_dn_match(&self) -> bool {
        match &self.oracle_ssl_server_dn_match {
            None => true,
            Some(raw) => match parse_bool_flag(raw) {
                Some(enabled) => enabled,
                None => {
                    warn!(
                        "unrecognized ORACLE_SSL_SERVER_DN_MATCH value {:?}; defaulting to enabled",
                        raw
                    );
                    true
                }
            },
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.sentinel_task_timeout_ms)
    }

    pub fn dequeue_wait(&self) -> Duration {
        Duration::from_secs(self.sentinel_dequeue_wait_seconds)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.sentinel_flush_interval_ms)
    }

    pub fn banner(&self) -> String {
        format!(
            "http://{}:{} queue={} pool={}..{}",
            self.sentinel_http_host,
            self.sentinel_http_port,
            self.sentinel_queue_name,
            self.oracle_pool_min_sessions,
            self.oracle_pool_max_sessions,
        )
    }
}

/// Maps the contract's truthy/falsy sets; `None` for anything else.
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    let normalized = raw.trim().to_ascii_lowercase();
    if TRUTHY.contains(&normalized.as_str()) {
        Some(true)
    } else if FALSY.contains(&normalized.as_str()) {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings() -> Settings {
        Settings {
            oracle_tns_name: Some("sentinel_high".to_owned()),
            oracle_wallet_location: Some("/wallet".to_owned()),
            oauth2_jwk_set_uri: Some("https://auth.example.com/jwks".to_owned()),
            oauth2_issuer_uri: Some("https://auth.example.com/".to_owned()),
            ..Settings::default()
        }
    }

    #[test]
    fn defaults_match_the_contract() {
        let settings = Settings::default();
        assert_eq!(settings.sentinel_http_port, 8090);
        assert_eq!(settings.sentinel_worker_threads, 4);
        assert_eq!(settings.sentinel_queue_name, "SENTINEL_QUEUE");
        assert_eq!(settings.sentinel_log_batch_size, 1000);
        assert_eq!(settings.oauth2_audience, "clm-service");
        assert_eq!(settings.oracle_pool_min_sessions, 2);
        assert_eq!(settings.oracle_pool_max_sessions, 10);
        assert_eq!(settings.oracle_pool_ping_interval_seconds, 60);
        assert_eq!(settings.oracle_pool_wait_timeout_ms, 5000);
        assert_eq!(settings.oracle_pool_max_lifetime_session_seconds, 3600);
        assert_eq!(settings.prometheus_metrics_port, 9090);
        assert_eq!(settings.log_level, "info");
        assert!(settings.oauth2_enforce_signature);
    }

    #[test]
    fn validation_requires_exactly_one_wallet_source() {
        let mut settings = valid_settings();
        settings.oracle_wallet_base64 = Some("UEsDBA==".to_owned());
        assert!(settings.validate().is_err());

        settings.oracle_wallet_location = None;
        assert!(settings.validate().is_ok());

        settings.oracle_wallet_base64 = None;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validation_requires_issuer_and_jwks() {
        let mut settings = valid_settings();
        settings.oauth2_issuer_uri = None;
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.oauth2_jwk_set_uri = Some(String::new());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn bool_flags_follow_the_truthy_falsy_sets() {
        for raw in ["yes", "TRUE", "1", "On"] {
            assert_eq!(parse_bool_flag(raw), Some(true), "{}", raw);
        }
        for raw in ["no", "False", "0", "OFF"] {
            assert_eq!(parse_bool_flag(raw), Some(false), "{}", raw);
        }
        assert_eq!(parse_bool_flag("maybe"), None);
    }

    #[test]
    fn unrecognized_dn_match_defaults_to_enabled() {
        // The unrecognized branch logs a warning, which needs a scoped logger.
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        slog_scope::scope(&logger, || {
            let mut settings = valid_settings();
            settings.oracle_ssl_server_dn_match = Some("sometimes".to_owned());
            assert!(settings.ssl_server_dn_match());

            settings.oracle_ssl_server_dn_match = Some("off".to_owned());
            assert!(!settings.ssl_server_dn_match());
        });
    }
}
