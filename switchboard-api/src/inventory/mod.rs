//! Inventory plugins: resolve device names to connection descriptors and
//! export filtered device sets. One backend is selected by name at startup.

pub mod yaml;

use std::collections::BTreeMap;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use switchboard_common::job::Adapter;

fn default_port() -> u16 {
    22
}

/// The resolved connection information for one device. Produced on demand
/// by the active inventory plugin and never persisted by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub adapter: Adapter,
    pub adapter_driver: String,
    pub credential_id: String,
    #[serde(default)]
    pub adapter_options: Map<String, Value>,
}

/// A descriptor together with its inventory name, for export listings.
#[derive(Debug, Clone, Serialize)]
pub struct NamedDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub descriptor: DeviceDescriptor,
}

/// Field-to-regex constraints, combined by logical AND. A named filter, if
/// supplied, replaces the inline fields entirely.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub named: Option<String>,
    pub fields: Vec<(String, String)>,
}

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("named filter {0} is not defined")]
    UnknownFilter(String),
    #[error("invalid filter: {0}")]
    BadFilter(String),
    #[error("inventory backend failed: {0}")]
    Backend(String),
    #[error("unknown inventory plugin {0}")]
    UnknownPlugin(String),
}

#[async_trait]
pub trait Inventory: Send + Sync {
    async fn get_device(&self, name: &str) -> Result<DeviceDescriptor, InventoryError>;
    async fn list_devices(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Vec<NamedDescriptor>, InventoryError>;
    /// The plugin-native representation, for clients that want fields the
    /// descriptor does not carry.
    async fn list_raw(&self, filter: &DeviceFilter) -> Result<Vec<Value>, InventoryError>;
    async fn filterable_fields(&self) -> Result<Vec<String>, InventoryError>;
    async fn named_filters(&self) -> Result<BTreeMap<String, String>, InventoryError>;
}

/// Select a backend by configuration name. Backends are linked statically.
pub fn inventory(name: &str) -> Result<Box<dyn Inventory>, InventoryError> {
    match name {
        "yaml" => Ok(Box::new(yaml::YamlInventory::from_env()?)),
        other => Err(InventoryError::UnknownPlugin(other.to_owned())),
    }
}

/// Evaluate field constraints against a flattened record. Every constraint
/// must match (logical AND); matching is case-insensitive; a missing field
/// never matches.
pub(crate) fn record_matches(
    record: &BTreeMap<String, String>,
    fields: &[(String, String)],
) -> Result<bool, InventoryError> {
    for (field, pattern) in fields {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| InventoryError::BadFilter(format!("{}: {}", field, e)))?;
        match record.get(field) {
            Some(value) if regex.is_match(value) => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}
