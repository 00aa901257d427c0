//! Credential plugins: resolve a credential id to a `(username, password)`
//! pair. One backend is selected by name at startup and runs for the
//! process lifetime; the controller only ever lists ids, the worker
//! resolves them at execution time and drops the secret with the session.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::timeout;

/// A secret string that never reaches logs: both `Debug` and `Display`
/// render as `***`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Hand out the underlying secret. Callers own keeping it off logs,
    /// metrics labels and cache keys.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: Secret,
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("credential {0} not found")]
    NotFound(String),
    #[error("credential backend timed out")]
    Timeout,
    #[error("credential backend failed: {0}")]
    Backend(String),
    #[error("unknown credential plugin {0}")]
    UnknownPlugin(String),
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, credential_id: &str) -> Result<Credential, CredentialError>;
    /// Names only; values are never listed.
    async fn list_ids(&self, wait: Duration) -> Result<Vec<String>, CredentialError>;
}

/// Select a backend by configuration name. Backends are linked statically;
/// adding one means adding a variant here and rebuilding.
pub fn credential_store(name: &str) -> Result<Box<dyn CredentialStore>, CredentialError> {
    match name {
        "yaml" => Ok(Box::new(YamlCredentials::from_env()?)),
        "env" => Ok(Box::new(EnvCredentials::new())),
        other => Err(CredentialError::UnknownPlugin(other.to_owned())),
    }
}

#[derive(Deserialize)]
struct YamlCredentialEntry {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct YamlCredentialFile {
    credentials: BTreeMap<String, YamlCredentialEntry>,
}

/// File-backed credentials: a YAML document mapping id -> username/password.
/// The file is re-read on every resolution so rotations apply without a
/// restart.
pub struct YamlCredentials {
    path: PathBuf,
}

impl YamlCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Plugin options use the `PLUGIN_<NAME>_<OPTION>` env convention.
    pub fn from_env() -> Result<Self, CredentialError> {
        let path = std::env::var("PLUGIN_YAML_CREDENTIALS_PATH")
            .map_err(|_| CredentialError::Backend("PLUGIN_YAML_CREDENTIALS_PATH is not set".to_owned()))?;
        Ok(Self::new(path))
    }

    async fn read(&self) -> Result<YamlCredentialFile, CredentialError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CredentialError::Backend(format!("{}: {}", self.path.display(), e)))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| CredentialError::Backend(format!("{}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl CredentialStore for YamlCredentials {
    async fn get(&self, credential_id: &str) -> Result<Credential, CredentialError> {
        let file = self.read().await?;
        let entry = file
            .credentials
            .get(credential_id)
            .ok_or_else(|| CredentialError::NotFound(credential_id.to_owned()))?;
        Ok(Credential {
            username: entry.username.clone(),
            password: Secret::new(entry.password.clone()),
        })
    }

    async fn list_ids(&self, wait: Duration) -> Result<Vec<String>, CredentialError> {
        let file = timeout(wait, self.read())
            .await
            .map_err(|_| CredentialError::Timeout)??;
        Ok(file.credentials.keys().cloned().collect())
    }
}

/// Environment-backed credentials: `PLUGIN_ENV_CRED_<ID>_USERNAME` and
/// `PLUGIN_ENV_CRED_<ID>_PASSWORD` pairs, for container deployments that
/// inject secrets as env vars.
pub struct EnvCredentials;

impl EnvCredentials {
    pub fn new() -> Self {
        Self
    }

    fn var_prefix(credential_id: &str) -> String {
        format!(
            "PLUGIN_ENV_CRED_{}_",
            credential_id.to_ascii_uppercase().replace('-', "_")
        )
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for EnvCredentials {
    async fn get(&self, credential_id: &str) -> Result<Credential, CredentialError> {
        let prefix = Self::var_prefix(credential_id);
        let username = std::env::var(format!("{}USERNAME", prefix))
            .map_err(|_| CredentialError::NotFound(credential_id.to_owned()))?;
        let password = std::env::var(format!("{}PASSWORD", prefix))
            .map_err(|_| CredentialError::NotFound(credential_id.to_owned()))?;
        Ok(Credential {
            username,
            password: Secret::new(password),
        })
    }

    async fn list_ids(&self, _wait: Duration) -> Result<Vec<String>, CredentialError> {
        let mut ids: Vec<String> = std::env::vars()
            .filter_map(|(k, _)| {
                k.strip_prefix("PLUGIN_ENV_CRED_")?
                    .strip_suffix("_USERNAME")
                    .map(|id| id.to_ascii_lowercase())
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let credential = Credential {
            username: "admin".to_string(),
            password: Secret::new("hunter2"),
        };
        let rendered = format!("{:?}", credential);
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }

    #[tokio::test]
    async fn yaml_backend_resolves_and_lists() {
        let dir = std::env::temp_dir().join(format!("sb-creds-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("credentials.yaml");
        std::fs::write(
            &path,
            "credentials:\n  lab:\n    username: admin\n    password: hunter2\n  core:\n    username: ops\n    password: trustno1\n",
        )
        .unwrap();

        let store = YamlCredentials::new(&path);
        let credential = store.get("lab").await.unwrap();
        assert_eq!(credential.username, "admin");
        assert_eq!(credential.password.expose(), "hunter2");

        assert!(matches!(
            store.get("missing").await,
            Err(CredentialError::NotFound(_))
        ));

        let ids = store.list_ids(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ids, vec!["core".to_string(), "lab".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn env_backend_reads_pairs() {
        std::env::set_var("PLUGIN_ENV_CRED_EDGE_USERNAME", "admin");
        std::env::set_var("PLUGIN_ENV_CRED_EDGE_PASSWORD", "hunter2");

        let store = EnvCredentials::new();
        let credential = store.get("edge").await.unwrap();
        assert_eq!(credential.username, "admin");
        assert_eq!(credential.password.expose(), "hunter2");

        let ids = store.list_ids(Duration::from_secs(1)).await.unwrap();
        assert!(ids.contains(&"edge".to_string()));

        std::env::remove_var("PLUGIN_ENV_CRED_EDGE_USERNAME");
        std::env::remove_var("PLUGIN_ENV_CRED_EDGE_PASSWORD");
    }
}
