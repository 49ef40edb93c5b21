use ::config::{Config, ConfigBuilder, ConfigError as LoadError, Environment, File};
use ::config::builder::DefaultState;
use chrono::Duration;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

use crate::auth::{BcryptHasher, RateLimitConfig, RateLimitPolicy, MAX_TOKEN_DURATION_MINUTES};
use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
    /// Deadline for handling one request; 0 disables it.
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Empty selects the in-memory user store.
    #[serde(default)]
    pub url: String,
    pub max_connections: u32,
}

#[derive(Deserialize, Clone)]
pub struct AuthConfig {
    /// Key id -> HMAC secret.
    #[serde(default)]
    pub signing_keys: HashMap<String, String>,
    pub current_key_id: String,
    pub token_duration_minutes: i64,
    pub bcrypt_cost: u32,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kids: Vec<&String> = self.signing_keys.keys().collect();
        kids.sort();
        f.debug_struct("AuthConfig")
            .field("signing_keys", &kids)
            .field("current_key_id", &self.current_key_id)
            .field("token_duration_minutes", &self.token_duration_minutes)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    pub max_requests: usize,
    pub window_seconds: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    pub max_tracked_keys: usize,
    /// 0 disables the periodic sweep.
    pub prune_interval_seconds: u64,
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitSettings,
}

fn with_defaults(environment: &str) -> Result<ConfigBuilder<DefaultState>, LoadError> {
    Config::builder()
        .set_default("environment", environment)?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("server.workers", num_cpus::get() as i64)?
        .set_default("server.request_timeout_seconds", 10)?
        .set_default("database.url", "")?
        .set_default("database.max_connections", 5)?
        .set_default("auth.current_key_id", "key1")?
        .set_default("auth.token_duration_minutes", 15)?
        .set_default("auth.bcrypt_cost", 10)?
        .set_default("rate_limit.max_tracked_keys", 10_000)?
        .set_default("rate_limit.prune_interval_seconds", 60)?
        .set_default("rate_limit.policies.login.max_requests", 5)?
        .set_default("rate_limit.policies.login.window_seconds", 60)?
        .set_default("rate_limit.policies.register.max_requests", 3)?
        .set_default("rate_limit.policies.register.window_seconds", 600)
}

impl Settings {
    /// Defaults, then `config/default` and `config/{RUN_MODE}`, then `APP_*`
    /// environment variables. E.g. `APP_AUTH__SIGNING_KEYS__KEY1=...` sets the
    /// `key1` signing key.
    pub fn new() -> Result<Self, LoadError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = with_defaults("development")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("app")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        s.try_deserialize()
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, LoadError> {
        with_defaults("test")?
            .set_default("auth.signing_keys.key1", "test-signing-key-0123456789abcdefghij")?
            .set_default("auth.bcrypt_cost", 4)?
            .build()?
            .try_deserialize()
    }

    /// Reject settings that would otherwise fail later, or worse, run insecurely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_server()
            .and_then(|_| self.validate_auth())
            .and_then(|_| self.validate_rate_limit())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server port is required".into()));
        }
        if self.server.workers == 0 {
            return Err(ConfigError::Invalid("server workers must be greater than 0".into()));
        }
        if !self.database.url.trim().is_empty() && self.database.max_connections == 0 {
            return Err(ConfigError::Invalid("database max connections must be greater than 0".into()));
        }
        Ok(())
    }

    fn validate_auth(&self) -> Result<(), ConfigError> {
        if self.auth.signing_keys.is_empty() {
            return Err(ConfigError::EmptyKeyRing);
        }
        if let Some(kid) = self
            .auth
            .signing_keys
            .iter()
            .find(|(_, key)| key.trim().is_empty())
            .map(|(kid, _)| kid)
        {
            return Err(ConfigError::Invalid(format!("signing key '{kid}' is empty")));
        }
        if !self.auth.signing_keys.contains_key(&self.auth.current_key_id) {
            return Err(ConfigError::UnknownCurrentKey(self.auth.current_key_id.clone()));
        }
        if self.auth.token_duration_minutes <= 0 {
            return Err(ConfigError::NonPositiveDuration);
        }
        self.token_duration()?;
        BcryptHasher::new(self.auth.bcrypt_cost)?;
        Ok(())
    }

    fn validate_rate_limit(&self) -> Result<(), ConfigError> {
        for (resource, policy) in &self.rate_limit.policies {
            if policy.max_requests == 0 || policy.window_seconds <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate limit for '{resource}' needs positive max_requests and window_seconds"
                )));
            }
        }
        Ok(())
    }

    /// Signing keys with surrounding whitespace removed.
    pub fn signing_keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.auth
            .signing_keys
            .iter()
            .map(|(kid, key)| (kid.as_str(), key.trim()))
    }

    pub fn token_duration(&self) -> Result<Duration, ConfigError> {
        let too_long = ConfigError::DurationTooLong {
            maximum_minutes: MAX_TOKEN_DURATION_MINUTES,
        };
        if self.auth.token_duration_minutes > MAX_TOKEN_DURATION_MINUTES {
            return Err(too_long);
        }
        Duration::try_minutes(self.auth.token_duration_minutes).ok_or(too_long)
    }

    /// `None` when request deadlines are disabled.
    pub fn request_timeout(&self) -> Option<std::time::Duration> {
        (self.server.request_timeout_seconds > 0)
            .then(|| std::time::Duration::from_secs(self.server.request_timeout_seconds))
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            policies: self
                .rate_limit
                .policies
                .iter()
                .map(|(resource, p)| {
                    (resource.clone(), RateLimitPolicy::new(p.max_requests, Duration::seconds(p.window_seconds)))
                })
                .collect(),
            max_tracked_keys: self.rate_limit.max_tracked_keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::new_for_test().expect("Failed to load settings");
        assert_eq!(settings.environment, "test");
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.workers as usize, num_cpus::get());
        assert!(settings.database.url.is_empty());
        assert_eq!(settings.auth.current_key_id, "key1");
        assert_eq!(settings.token_duration(), Ok(Duration::minutes(15)));
        assert_eq!(settings.request_timeout(), Some(std::time::Duration::from_secs(10)));
        assert!(settings.validate().is_ok());

        let limits = settings.rate_limit_config();
        assert_eq!(limits.policies["login"], RateLimitPolicy::new(5, Duration::seconds(60)));
        assert_eq!(limits.policies["register"], RateLimitPolicy::new(3, Duration::seconds(600)));
    }

    #[test]
    fn test_environment_override() {
        // A prefix no other test touches, so parallel tests don't see these.
        env::set_var("CGTEST_OVR_SERVER__PORT", "9000");
        env::set_var("CGTEST_OVR_AUTH__SIGNING_KEYS__ROTATED", "  rotated-signing-key-0123456789abcdef  ");
        env::set_var("CGTEST_OVR_AUTH__CURRENT_KEY_ID", "rotated");
        env::set_var("CGTEST_OVR_AUTH__TOKEN_DURATION_MINUTES", "48");
        env::set_var("CGTEST_OVR_RATE_LIMIT__POLICIES__SEARCH__MAX_REQUESTS", "20");
        env::set_var("CGTEST_OVR_RATE_LIMIT__POLICIES__SEARCH__WINDOW_SECONDS", "1");

        let settings = with_defaults("test")
            .unwrap()
            .add_source(
                Environment::with_prefix("cgtest_ovr")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()
            .expect("Failed to build config")
            .try_deserialize::<Settings>()
            .expect("Failed to deserialize settings");

        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.auth.current_key_id, "rotated");
        assert_eq!(settings.auth.token_duration_minutes, 48);
        let keys: Vec<(&str, &str)> = settings.signing_keys().collect();
        assert_eq!(keys, vec![("rotated", "rotated-signing-key-0123456789abcdef")]);
        assert_eq!(
            settings.rate_limit_config().policies["search"],
            RateLimitPolicy::new(20, Duration::seconds(1))
        );
        assert!(settings.validate().is_ok());

        for var in [
            "CGTEST_OVR_SERVER__PORT",
            "CGTEST_OVR_AUTH__SIGNING_KEYS__ROTATED",
            "CGTEST_OVR_AUTH__CURRENT_KEY_ID",
            "CGTEST_OVR_AUTH__TOKEN_DURATION_MINUTES",
            "CGTEST_OVR_RATE_LIMIT__POLICIES__SEARCH__MAX_REQUESTS",
            "CGTEST_OVR_RATE_LIMIT__POLICIES__SEARCH__WINDOW_SECONDS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_invalid_port() {
        let result = with_defaults("test")
            .unwrap()
            .set_override("server.port", "invalid")
            .unwrap()
            .build()
            .and_then(|config| config.try_deserialize::<Settings>());

        assert!(result.is_err(), "Expected error for invalid port");
    }

    #[test]
    fn test_validate_rejects_insecure_auth() {
        let mut settings = Settings::new_for_test().unwrap();
        settings.auth.signing_keys.clear();
        assert_eq!(settings.validate(), Err(ConfigError::EmptyKeyRing));

        let mut settings = Settings::new_for_test().unwrap();
        settings.auth.signing_keys.insert("key2".into(), "   ".into());
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = Settings::new_for_test().unwrap();
        settings.auth.current_key_id = "missing".into();
        assert_eq!(settings.validate(), Err(ConfigError::UnknownCurrentKey("missing".into())));

        let mut settings = Settings::new_for_test().unwrap();
        settings.auth.token_duration_minutes = 0;
        assert_eq!(settings.validate(), Err(ConfigError::NonPositiveDuration));

        let mut settings = Settings::new_for_test().unwrap();
        settings.auth.token_duration_minutes = 1_000_000_000_000;
        let too_long = ConfigError::DurationTooLong { maximum_minutes: MAX_TOKEN_DURATION_MINUTES };
        assert_eq!(settings.validate(), Err(too_long.clone()));
        assert_eq!(settings.token_duration(), Err(too_long));

        let mut settings = Settings::new_for_test().unwrap();
        settings.auth.token_duration_minutes = i64::MAX;
        assert!(matches!(settings.validate(), Err(ConfigError::DurationTooLong { .. })));

        let mut settings = Settings::new_for_test().unwrap();
        settings.auth.bcrypt_cost = 40;
        assert!(matches!(settings.validate(), Err(ConfigError::InvalidCost { .. })));
    }

    #[test]
    fn test_validate_rejects_empty_policy() {
        let mut settings = Settings::new_for_test().unwrap();
        settings
            .rate_limit
            .policies
            .insert("login".into(), PolicyConfig { max_requests: 0, window_seconds: 60 });
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_debug_hides_signing_keys() {
        let settings = Settings::new_for_test().unwrap();
        let rendered = format!("{:?}", settings.auth);
        assert!(rendered.contains("key1"));
        assert!(!rendered.contains("0123456789"));
    }
}
