//! Request authentication and authorization for the controller surface.

pub mod api_key;
pub mod jwt;
pub mod policy;

use axum::http::HeaderMap;
use serde::Serialize;

use switchboard_common::error::ErrorKind;

use crate::api::ApiError;
use crate::config::{AuthModeName, Config};
use api_key::ApiKeyValidator;
use jwt::{Claims, Validator};
use policy::ProviderPolicy;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum AuthMethod {
    Anonymous,
    ApiKey,
    Jwt { provider: String },
}

/// The authenticated caller, attached to the request extensions by the
/// auth middleware.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub subject: String,
    #[serde(flatten)]
    pub method: AuthMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<Claims>,
}

impl Principal {
    fn anonymous() -> Self {
        Self {
            subject: "anonymous".to_owned(),
            method: AuthMethod::Anonymous,
            claims: None,
        }
    }

    fn api_key() -> Self {
        Self {
            subject: "api-key".to_owned(),
            method: AuthMethod::ApiKey,
            claims: None,
        }
    }
}

pub struct AuthState {
    pub mode: AuthModeName,
    api_keys: ApiKeyValidator,
    validators: Vec<Validator>,
    policy: ProviderPolicy,
}

impl AuthState {
    pub fn from_config(config: &Config) -> eyre::Result<Self> {
        let policy = ProviderPolicy::new(
            config.allowed_users.values(),
            config.allowed_domains.values(),
            config.allowed_user_regex.values(),
        )?;
        let validators = jwt::build_validators(
            &config.jwt_providers,
            config.jwt_leeway_s,
            config.jwt_require_https,
        )
        .map_err(|e| eyre::eyre!("{}", e))?;
        Ok(Self {
            mode: config.auth_mode,
            api_keys: ApiKeyValidator::new(
                config.api_keys.values(),
                config.api_key_headers.values(),
            ),
            validators,
            policy,
        })
    }

    #[cfg(test)]
    pub fn for_tests(
        mode: AuthModeName,
        api_keys: ApiKeyValidator,
        validators: Vec<Validator>,
        policy: ProviderPolicy,
    ) -> Self {
        Self {
            mode,
            api_keys,
            validators,
            policy,
        }
    }

    fn bearer_token(headers: &HeaderMap) -> Option<&str> {
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
    }

    async fn authenticate_jwt(&self, headers: &HeaderMap) -> Result<Principal, ApiError> {
        let token = Self::bearer_token(headers).ok_or_else(|| {
            ApiError::new(ErrorKind::AuthRequired, "missing bearer token")
        })?;

        let mut last_rejection = None;
        for validator in &self.validators {
            match validator.validate(token).await {
                Ok(claims) => {
                    let identity = claims
                        .identity()
                        .ok_or_else(|| {
                            ApiError::new(
                                ErrorKind::AuthRequired,
                                "token carries no usable identity claim",
                            )
                        })?
                        .to_owned();
                    // Authorization is distinct from authentication: a valid
                    // token for the wrong principal gets 403, not 401.
                    if !self.policy.allows(&identity) {
                        return Err(ApiError::new(
                            ErrorKind::AuthDenied,
                            format!("{} is not permitted by policy", identity),
                        ));
                    }
                    return Ok(Principal {
                        subject: identity,
                        method: AuthMethod::Jwt {
                            provider: validator.name().to_owned(),
                        },
                        claims: Some(claims),
                    });
                }
                Err(e) => last_rejection = Some(e),
            }
        }
        Err(ApiError::new(
            ErrorKind::AuthRequired,
            match last_rejection {
                Some(e) => format!("token rejected by all providers: {}", e),
                None => "no jwt providers are configured".to_owned(),
            },
        ))
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, ApiError> {
        match self.mode {
            AuthModeName::None => Ok(Principal::anonymous()),
            AuthModeName::ApiKey => match self.api_keys.check(headers) {
                Some(true) => Ok(Principal::api_key()),
                Some(false) => Err(ApiError::new(ErrorKind::AuthRequired, "invalid api key")),
                None => Err(ApiError::new(ErrorKind::AuthRequired, "missing api key")),
            },
            AuthModeName::Jwt => self.authenticate_jwt(headers).await,
            AuthModeName::Hybrid => match self.api_keys.check(headers) {
                Some(true) => Ok(Principal::api_key()),
                // A wrong key is still a miss for hybrid purposes; the
                // caller may be presenting a token instead.
                Some(false) | None => self.authenticate_jwt(headers).await,
            },
        }
    }
}
