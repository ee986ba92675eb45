use gatekeep::{ApiKeyPolicy, ConfigError, IdentityMode};
use http::HeaderName;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_SEED_API_KEYS: &str = "goexpert-key:5";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error(transparent)]
    Limiter(#[from] ConfigError),
}

/// Where limiter state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSettings {
    Redis { url: String },
    /// Process-local; only meaningful for a single instance.
    Memory,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    /// Mode of the catch-all route.
    pub limit_type: IdentityMode,
    pub requests_limit: u32,
    pub client_block_time: Duration,
    pub store: StoreSettings,
    pub api_key_header: HeaderName,
    pub seed_api_keys: Vec<ApiKeyPolicy>,
    pub admin_token: Option<String>,
    pub fail_open: bool,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let listen_addr = parse(
            "LISTEN_ADDR",
            &var("LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.into()),
        )?;

        let limit_type = match var("DEFAULT_LIMIT_TYPE") {
            Some(raw) => raw.parse::<IdentityMode>()?,
            None => IdentityMode::default(),
        };

        let requests_limit: u32 =
            parse("DEFAULT_REQUESTS_LIMIT", &var("DEFAULT_REQUESTS_LIMIT").unwrap_or_else(|| "10".into()))?;
        let block_secs: u64 = parse(
            "DEFAULT_CLIENT_BLOCK_TIME",
            &var("DEFAULT_CLIENT_BLOCK_TIME").unwrap_or_else(|| "10".into()),
        )?;

        let store = match var("STORE_BACKEND").as_deref().unwrap_or("redis") {
            "memory" => StoreSettings::Memory,
            "redis" => StoreSettings::Redis {
                url: var("REDIS_URL").unwrap_or_else(|| {
                    redis_url(
                        &var("DB_HOST").unwrap_or_else(|| "localhost".into()),
                        &var("DB_PORT").unwrap_or_else(|| "6379".into()),
                        var("DB_PASSWORD").as_deref(),
                    )
                }),
            },
            other => {
                return Err(SettingsError::Invalid {
                    var: "STORE_BACKEND",
                    reason: format!("expected redis or memory, got {:?}", other),
                })
            }
        };

        let api_key_header = var("API_KEY_HEADER").unwrap_or_else(|| "API_KEY".into());
        let api_key_header = HeaderName::try_from(api_key_header.as_str()).map_err(|e| {
            SettingsError::Invalid { var: "API_KEY_HEADER", reason: e.to_string() }
        })?;

        let seed_api_keys = parse_api_keys(
            &lookup("SEED_API_KEYS").unwrap_or_else(|| DEFAULT_SEED_API_KEYS.into()),
        )?;

        let fail_open = match var("STORE_FAIL_OPEN") {
            Some(raw) => parse_bool("STORE_FAIL_OPEN", &raw)?,
            None => false,
        };

        Ok(Self {
            listen_addr,
            limit_type,
            requests_limit,
            client_block_time: Duration::from_secs(block_secs),
            store,
            api_key_header,
            seed_api_keys,
            admin_token: var("ADMIN_TOKEN"),
            fail_open,
        })
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, SettingsError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| SettingsError::Invalid { var, reason: e.to_string() })
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, SettingsError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SettingsError::Invalid { var, reason: format!("not a boolean: {:?}", other) }),
    }
}

fn redis_url(host: &str, port: &str, password: Option<&str>) -> String {
    match password {
        Some(password) => format!("redis://:{}@{}:{}", password, host, port),
        None => format!("redis://{}:{}", host, port),
    }
}

/// Parse `key:max,key:max`. An empty string yields no keys.
fn parse_api_keys(raw: &str) -> Result<Vec<ApiKeyPolicy>, SettingsError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, max) = entry.rsplit_once(':').ok_or_else(|| SettingsError::Invalid {
                var: "SEED_API_KEYS",
                reason: format!("expected key:max, got {:?}", entry),
            })?;
            let max: u32 = parse("SEED_API_KEYS", max.trim())?;
            Ok(ApiKeyPolicy::new(id.trim(), max)?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, SettingsError> {
        let env: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn defaults_match_legacy_deployment() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(s.limit_type, IdentityMode::IpOrApiKey);
        assert_eq!(s.store, StoreSettings::Redis { url: "redis://localhost:6379".into() });
        assert_eq!(s.api_key_header.as_str(), "api_key");
        assert_eq!(s.seed_api_keys, vec![ApiKeyPolicy::new("goexpert-key", 5).unwrap()]);
        assert!(s.admin_token.is_none());
        assert!(!s.fail_open);
    }

    #[test]
    fn reads_legacy_variables() {
        let s = settings(&[
            ("DEFAULT_LIMIT_TYPE", "0"),
            ("DEFAULT_REQUESTS_LIMIT", "3"),
            ("DEFAULT_CLIENT_BLOCK_TIME", "7"),
            ("DB_HOST", "redis"),
            ("DB_PORT", "6380"),
            ("DB_PASSWORD", "s3cret"),
            ("SEED_API_KEYS", "a:1, b:20"),
            ("STORE_FAIL_OPEN", "yes"),
        ])
        .unwrap();
        assert_eq!(s.limit_type, IdentityMode::IpOnly);
        assert_eq!(s.requests_limit, 3);
        assert_eq!(s.client_block_time, Duration::from_secs(7));
        assert_eq!(s.store, StoreSettings::Redis { url: "redis://:s3cret@redis:6380".into() });
        assert_eq!(s.seed_api_keys.len(), 2);
        assert_eq!(s.seed_api_keys[1].max_requests, 20);
        assert!(s.fail_open);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(settings(&[("DEFAULT_REQUESTS_LIMIT", "many")]).is_err());
        assert!(settings(&[("DEFAULT_LIMIT_TYPE", "9")]).is_err());
        assert!(settings(&[("STORE_BACKEND", "etcd")]).is_err());
        assert!(settings(&[("SEED_API_KEYS", "nocolon")]).is_err());
        assert!(settings(&[("SEED_API_KEYS", "k:0")]).is_err());
        assert!(settings(&[("STORE_FAIL_OPEN", "perhaps")]).is_err());
    }

    #[test]
    fn empty_seed_list_is_allowed() {
        let s = settings(&[("SEED_API_KEYS", ""), ("STORE_BACKEND", "memory")]).unwrap();
        assert!(s.seed_api_keys.is_empty());
        assert_eq!(s.store, StoreSettings::Memory);
    }
}
