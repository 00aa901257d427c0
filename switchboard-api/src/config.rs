use std::str::FromStr;

use envconfig::Envconfig;

use switchboard_common::config::RedisConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    #[envconfig(from = "API_LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(nested = true)]
    pub redis: RedisConfig,

    /// Which inventory backend to construct at startup.
    #[envconfig(from = "API_INVENTORY_TYPE", default = "yaml")]
    pub inventory_type: String,

    /// Which credential backend to use for the list endpoint.
    #[envconfig(from = "API_CREDENTIAL_PLUGIN", default = "yaml")]
    pub credential_plugin: String,

    #[envconfig(from = "API_AUTH_MODE", default = "none")]
    pub auth_mode: AuthModeName,

    /// Comma-separated accepted API keys.
    #[envconfig(from = "API_KEYS", default = "")]
    pub api_keys: CommaSeparated,

    /// Headers inspected for an API key, in order.
    #[envconfig(from = "API_KEY_HEADERS", default = "x-api-key")]
    pub api_key_headers: CommaSeparated,

    /// JSON array of JWT provider definitions; see `auth::jwt`.
    #[envconfig(from = "API_JWT_PROVIDERS", default = "[]")]
    pub jwt_providers: String,

    #[envconfig(from = "API_JWT_REQUIRE_HTTPS", default = "true")]
    pub jwt_require_https: bool,

    #[envconfig(from = "API_JWT_LEEWAY_S", default = "30")]
    pub jwt_leeway_s: u64,

    #[envconfig(from = "API_ALLOWED_USERS", default = "")]
    pub allowed_users: CommaSeparated,

    #[envconfig(from = "API_ALLOWED_DOMAINS", default = "")]
    pub allowed_domains: CommaSeparated,

    #[envconfig(from = "API_ALLOWED_USER_REGEX", default = "")]
    pub allowed_user_regex: CommaSeparated,

    #[envconfig(from = "CACHE_ENABLED", default = "true")]
    pub cache_enabled: bool,

    #[envconfig(from = "CACHE_DEFAULT_TTL", default = "300")]
    pub cache_default_ttl_s: u64,

    #[envconfig(from = "CACHE_MAX_TTL", default = "3600")]
    pub cache_max_ttl_s: u64,

    /// Directory of operator-supplied parser templates and index files.
    #[envconfig(from = "API_TEMPLATE_DIR", default = "templates")]
    pub template_dir: String,

    /// Default sync-mode wait deadline when the request does not set one.
    #[envconfig(from = "API_DEFAULT_TIMEOUT_S", default = "60")]
    pub default_timeout_s: u64,

    /// Default retry budget for submitted jobs.
    #[envconfig(from = "API_DEFAULT_RETRIES", default = "2")]
    pub default_retries: u32,

    /// Default bound on device-lease waiting.
    #[envconfig(from = "API_DEFAULT_MAX_QUEUE_WAIT_S", default = "30")]
    pub default_max_queue_wait_s: u64,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Global authentication mode for the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthModeName {
    None,
    ApiKey,
    Jwt,
    Hybrid,
}

impl AuthModeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthModeName::None => "none",
            AuthModeName::ApiKey => "api_key",
            AuthModeName::Jwt => "jwt",
            AuthModeName::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseAuthModeError(pub String);

impl FromStr for AuthModeName {
    type Err = ParseAuthModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(AuthModeName::None),
            "api_key" => Ok(AuthModeName::ApiKey),
            "jwt" => Ok(AuthModeName::Jwt),
            "hybrid" => Ok(AuthModeName::Hybrid),
            invalid => Err(ParseAuthModeError(invalid.to_owned())),
        }
    }
}

/// A comma-separated list env value, trimmed, empties dropped.
#[derive(Debug, Clone, Default)]
pub struct CommaSeparated(pub Vec<String>);

impl CommaSeparated {
    pub fn values(&self) -> &[String] {
        &self.0
    }
}

impl FromStr for CommaSeparated {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaSeparated(
            s.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_modes_parse_case_insensitively() {
        assert_eq!(AuthModeName::from_str("API_KEY"), Ok(AuthModeName::ApiKey));
        assert_eq!(AuthModeName::from_str("hybrid"), Ok(AuthModeName::Hybrid));
        assert!(AuthModeName::from_str("oauth").is_err());
    }

    #[test]
    fn comma_separated_values_are_trimmed() {
        let parsed = CommaSeparated::from_str("alpha, beta ,, gamma").unwrap();
        assert_eq!(parsed.values(), &["alpha", "beta", "gamma"]);

        let empty = CommaSeparated::from_str("").unwrap();
        assert!(empty.values().is_empty());
    }
}
