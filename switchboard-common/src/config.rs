use envconfig::Envconfig;

/// Connection settings for the shared Redis instance, nested into each
/// binary's own configuration.
#[derive(Envconfig, Clone)]
pub struct RedisConfig {
    #[envconfig(from = "REDIS_HOST", default = "127.0.0.1")]
    pub redis_host: String,

    #[envconfig(from = "REDIS_PORT", default = "6379")]
    pub redis_port: u16,

    #[envconfig(from = "REDIS_TLS", default = "false")]
    pub redis_tls: bool,

    #[envconfig(from = "REDIS_AUTH_TOKEN")]
    pub redis_auth_token: Option<String>,

    /// Key prefix segregating this deployment's keys.
    #[envconfig(from = "REDIS_KEY_PREFIX", default = "sb")]
    pub key_prefix: String,
}

impl RedisConfig {
    /// Produce a connection URL for the redis client.
    pub fn url(&self) -> String {
        let scheme = if self.redis_tls { "rediss" } else { "redis" };
        match &self.redis_auth_token {
            Some(token) => format!(
                "{}://:{}@{}:{}/",
                scheme, token, self.redis_host, self.redis_port
            ),
            None => format!("{}://{}:{}/", scheme, self.redis_host, self.redis_port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_reflects_tls_and_auth() {
        let mut config = RedisConfig {
            redis_host: "cache.internal".to_string(),
            redis_port: 6380,
            redis_tls: false,
            redis_auth_token: None,
            key_prefix: "sb".to_string(),
        };
        assert_eq!(config.url(), "redis://cache.internal:6380/");

        config.redis_tls = true;
        config.redis_auth_token = Some("tok".to_string());
        assert_eq!(config.url(), "rediss://:tok@cache.internal:6380/");
    }
}
