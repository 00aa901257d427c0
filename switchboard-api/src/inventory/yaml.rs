//! The file-backed inventory: one YAML document of device records plus
//! optional named filters. The file is re-read per request so edits apply
//! without a restart.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{
    record_matches, DeviceDescriptor, DeviceFilter, Inventory, InventoryError, NamedDescriptor,
};

#[derive(Deserialize)]
struct NamedFilterEntry {
    #[serde(default)]
    description: String,
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct InventoryFile {
    devices: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    filters: BTreeMap<String, NamedFilterEntry>,
}

pub struct YamlInventory {
    path: PathBuf,
}

impl YamlInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_env() -> Result<Self, InventoryError> {
        let path = std::env::var("PLUGIN_YAML_INVENTORY_PATH").map_err(|_| {
            InventoryError::Backend("PLUGIN_YAML_INVENTORY_PATH is not set".to_owned())
        })?;
        Ok(Self::new(path))
    }

    async fn read(&self) -> Result<InventoryFile, InventoryError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| InventoryError::Backend(format!("{}: {}", self.path.display(), e)))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| InventoryError::Backend(format!("{}: {}", self.path.display(), e)))
    }

    /// Resolve a filter to its effective field constraints: a named filter
    /// replaces inline fields, otherwise the inline fields apply as-is.
    fn effective_fields(
        file: &InventoryFile,
        filter: &DeviceFilter,
    ) -> Result<Vec<(String, String)>, InventoryError> {
        match &filter.named {
            Some(name) => {
                let entry = file
                    .filters
                    .get(name)
                    .ok_or_else(|| InventoryError::UnknownFilter(name.clone()))?;
                Ok(entry
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect())
            }
            None => Ok(filter.fields.clone()),
        }
    }

    /// Flatten a device record into string fields for filter matching.
    /// Nested values participate as their JSON rendition.
    fn flatten(name: &str, record: &serde_yaml::Value) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_owned(), name.to_owned());
        if let serde_yaml::Value::Mapping(mapping) = record {
            for (key, value) in mapping {
                let Some(key) = key.as_str() else { continue };
                let rendered = match value {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    other => serde_json::to_string(&yaml_to_json(other)).unwrap_or_default(),
                };
                fields.insert(key.to_owned(), rendered);
            }
        }
        fields
    }

    fn descriptor(name: &str, record: &serde_yaml::Value) -> Result<DeviceDescriptor, InventoryError> {
        serde_yaml::from_value(record.clone())
            .map_err(|e| InventoryError::Backend(format!("device {}: {}", name, e)))
    }
}

fn yaml_to_json(value: &serde_yaml::Value) -> Value {
    serde_yaml::from_value::<Value>(value.clone()).unwrap_or(Value::Null)
}

#[async_trait]
impl Inventory for YamlInventory {
    async fn get_device(&self, name: &str) -> Result<DeviceDescriptor, InventoryError> {
        let file = self.read().await?;
        let record = file
            .devices
            .get(name)
            .ok_or_else(|| InventoryError::DeviceNotFound(name.to_owned()))?;
        Self::descriptor(name, record)
    }

    async fn list_devices(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Vec<NamedDescriptor>, InventoryError> {
        let file = self.read().await?;
        let fields = Self::effective_fields(&file, filter)?;

        let mut devices = Vec::new();
        for (name, record) in &file.devices {
            if record_matches(&Self::flatten(name, record), &fields)? {
                devices.push(NamedDescriptor {
                    name: name.clone(),
                    descriptor: Self::descriptor(name, record)?,
                });
            }
        }
        Ok(devices)
    }

    async fn list_raw(&self, filter: &DeviceFilter) -> Result<Vec<Value>, InventoryError> {
        let file = self.read().await?;
        let fields = Self::effective_fields(&file, filter)?;

        let mut records = Vec::new();
        for (name, record) in &file.devices {
            if record_matches(&Self::flatten(name, record), &fields)? {
                let mut rendered = yaml_to_json(record);
                if let Value::Object(object) = &mut rendered {
                    object.insert("name".to_owned(), Value::String(name.clone()));
                }
                records.push(rendered);
            }
        }
        Ok(records)
    }

    async fn filterable_fields(&self) -> Result<Vec<String>, InventoryError> {
        let file = self.read().await?;
        let mut fields = std::collections::BTreeSet::new();
        for (name, record) in &file.devices {
            fields.extend(Self::flatten(name, record).into_keys());
        }
        Ok(fields.into_iter().collect())
    }

    async fn named_filters(&self) -> Result<BTreeMap<String, String>, InventoryError> {
        let file = self.read().await?;
        Ok(file
            .filters
            .into_iter()
            .map(|(name, entry)| (name, entry.description))
            .collect())
    }
}
