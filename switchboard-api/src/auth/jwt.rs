//! JWT validation against a closed set of provider types: generic OIDC
//! (discovery + JWKS), Entra-style tenants (a thin specialization of the
//! same flow) and shared-secret HS256 for tests and air-gapped
//! deployments. The broker only validates presented tokens; it never
//! issues them.

use std::time::{Duration, Instant};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;

const JWKS_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum JwtError {
    #[error("token rejected: {0}")]
    Invalid(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("https required for {0}")]
    InsecureUrl(String),
}

/// Well-known token claims, typed, with everything else preserved in
/// `extra` for the debug endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// A string or an array of strings, depending on the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    /// The identity the authorization policy evaluates, in preference
    /// order: email, then the username claims, then the bare subject.
    pub fn identity(&self) -> Option<&str> {
        self.email
            .as_deref()
            .or(self.preferred_username.as_deref())
            .or(self.upn.as_deref())
            .or(self.sub.as_deref())
    }
}

/// Provider definitions, deserialized from the `API_JWT_PROVIDERS` JSON
/// document. The variant set is closed: adding a provider type means
/// adding a variant and rebuilding.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Oidc {
        name: String,
        issuer: String,
        #[serde(default)]
        audience: Option<String>,
        #[serde(default)]
        discovery_url: Option<String>,
    },
    Entra {
        name: String,
        tenant_id: String,
        #[serde(default)]
        audience: Option<String>,
    },
    Hmac {
        name: String,
        secret: String,
        #[serde(default)]
        issuer: Option<String>,
        #[serde(default)]
        audience: Option<String>,
    },
}

impl ProviderConfig {
    pub fn name(&self) -> &str {
        match self {
            ProviderConfig::Oidc { name, .. }
            | ProviderConfig::Entra { name, .. }
            | ProviderConfig::Hmac { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Discovery {
    pub issuer: String,
    pub jwks_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

struct CachedJwks {
    jwks: Jwks,
    issuer: String,
    fetched_at: Instant,
}

pub struct Validator {
    config: ProviderConfig,
    http: reqwest::Client,
    leeway_s: u64,
    require_https: bool,
    jwks: RwLock<Option<CachedJwks>>,
}

impl Validator {
    pub fn new(config: ProviderConfig, leeway_s: u64, require_https: bool) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            leeway_s,
            require_https,
            jwks: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    fn check_url(&self, url: &str) -> Result<(), JwtError> {
        if self.require_https && !url.starts_with("https://") {
            return Err(JwtError::InsecureUrl(url.to_owned()));
        }
        Ok(())
    }

    /// Fetch the provider's well-known document to learn its JWKS URI and
    /// canonical issuer. Shared-secret providers have nothing to discover.
    pub async fn discover(&self) -> Result<Discovery, JwtError> {
        let discovery_url = match &self.config {
            ProviderConfig::Oidc {
                issuer,
                discovery_url,
                ..
            } => discovery_url.clone().unwrap_or_else(|| {
                format!(
                    "{}/.well-known/openid-configuration",
                    issuer.trim_end_matches('/')
                )
            }),
            ProviderConfig::Entra { tenant_id, .. } => format!(
                "https://login.microsoftonline.com/{}/v2.0/.well-known/openid-configuration",
                tenant_id
            ),
            ProviderConfig::Hmac { issuer, .. } => {
                return Ok(Discovery {
                    issuer: issuer.clone().unwrap_or_default(),
                    jwks_uri: String::new(),
                });
            }
        };
        self.check_url(&discovery_url)?;

        let discovery = self
            .http
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| JwtError::Provider(format!("discovery fetch failed: {}", e)))?
            .json::<Discovery>()
            .await
            .map_err(|e| JwtError::Provider(format!("bad discovery document: {}", e)))?;
        Ok(discovery)
    }

    async fn jwks(&self) -> Result<(Jwks, String), JwtError> {
        {
            let cached = self.jwks.read().await;
            if let Some(cached) = cached.as_ref() {
                if cached.fetched_at.elapsed() < JWKS_CACHE_TTL {
                    return Ok((cached.jwks.clone(), cached.issuer.clone()));
                }
            }
        }

        let discovery = self.discover().await?;
        self.check_url(&discovery.jwks_uri)?;
        let jwks = self
            .http
            .get(&discovery.jwks_uri)
            .send()
            .await
            .map_err(|e| JwtError::Provider(format!("jwks fetch failed: {}", e)))?
            .json::<Jwks>()
            .await
            .map_err(|e| JwtError::Provider(format!("bad jwks document: {}", e)))?;

        let mut guard = self.jwks.write().await;
        *guard = Some(CachedJwks {
            jwks: jwks.clone(),
            issuer: discovery.issuer.clone(),
            fetched_at: Instant::now(),
        });
        Ok((jwks, discovery.issuer))
    }

    fn base_validation(&self, algorithm: Algorithm, issuer: Option<&str>) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.leeway_s;
        if let Some(issuer) = issuer {
            if !issuer.is_empty() {
                validation.set_issuer(&[issuer]);
            }
        }
        let audience = match &self.config {
            ProviderConfig::Oidc { audience, .. }
            | ProviderConfig::Entra { audience, .. }
            | ProviderConfig::Hmac { audience, .. } => audience.as_deref(),
        };
        match audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }

    /// Validate a presented token and return its claims.
    pub async fn validate(&self, token: &str) -> Result<Claims, JwtError> {
        if let ProviderConfig::Hmac { secret, issuer, .. } = &self.config {
            let key = DecodingKey::from_secret(secret.as_bytes());
            let validation = self.base_validation(Algorithm::HS256, issuer.as_deref());
            let data = decode::<Claims>(token, &key, &validation)
                .map_err(|e| JwtError::Invalid(e.to_string()))?;
            return Ok(data.claims);
        }

        let header = decode_header(token).map_err(|e| JwtError::Invalid(e.to_string()))?;
        if !matches!(header.alg, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) {
            return Err(JwtError::Invalid(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }

        let (jwks, issuer) = self.jwks().await?;
        let jwk = jwks
            .keys
            .iter()
            .filter(|key| key.kty == "RSA")
            .find(|key| match (&header.kid, &key.kid) {
                (Some(wanted), Some(kid)) => wanted == kid,
                (None, _) => true,
                (Some(_), None) => false,
            })
            .ok_or_else(|| JwtError::Invalid("no matching signing key".to_owned()))?;

        let (n, e) = match (&jwk.n, &jwk.e) {
            (Some(n), Some(e)) => (n, e),
            _ => return Err(JwtError::Provider("jwks key is missing modulus".to_owned())),
        };
        let key = DecodingKey::from_rsa_components(n, e)
            .map_err(|e| JwtError::Provider(format!("bad jwks key: {}", e)))?;
        let validation = self.base_validation(header.alg, Some(&issuer));
        let data =
            decode::<Claims>(token, &key, &validation).map_err(|e| JwtError::Invalid(e.to_string()))?;
        Ok(data.claims)
    }
}

/// Parse the provider list from its JSON config document and build one
/// validator per entry.
pub fn build_validators(
    providers_json: &str,
    leeway_s: u64,
    require_https: bool,
) -> Result<Vec<Validator>, JwtError> {
    let configs: Vec<ProviderConfig> = serde_json::from_str(providers_json)
        .map_err(|e| JwtError::Provider(format!("bad jwt_providers document: {}", e)))?;
    Ok(configs
        .into_iter()
        .map(|config| Validator::new(config, leeway_s, require_https))
        .collect())
}
