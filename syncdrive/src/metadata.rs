// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Device metadata extraction. Field devices report in a handful of formats;
//! each format has a named parser and deployments can register their own at
//! runtime. Parsers are plain functions from the raw text to a
//! [`DeviceMetadata`]; no downcasting anywhere.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceMetadata {
    pub device_id: String,
    pub device_type: String,
    pub firmware_version: String,
    pub fields: BTreeMap<String, String>,
    pub parse_successful: bool,
}

pub type ParserFn = Box<dyn Fn(&str) -> DeviceMetadata + Send + Sync>;

pub struct MetadataRegistry {
    parsers: BTreeMap<String, ParserFn>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            parsers: BTreeMap::new(),
        };

        registry.register("typeA", parse_type_a);
        registry.register("typeB", parse_type_b);

        registry
    }

    /// Parse `raw` with the parser registered for `device_type`. An unknown
    /// type yields an unsuccessful result carrying the requested type.
    pub fn extract(&self, raw: &str, device_type: &str) -> DeviceMetadata {
        let Some(parser) = self.parsers.get(device_type) else {
            debug!("No parser registered for device type {device_type:?}");
            return DeviceMetadata {
                device_type: device_type.to_owned(),
                ..Default::default()
            };
        };

        let mut metadata = parser(raw);
        metadata.device_type = device_type.to_owned();
        metadata
    }

    /// Register a parser, replacing any previous one of the same name.
    pub fn register(
        &mut self,
        device_type: impl Into<String>,
        parser: impl Fn(&str) -> DeviceMetadata + Send + Sync + 'static,
    ) {
        self.parsers.insert(device_type.into(), Box::new(parser));
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.parsers.keys().cloned().collect()
    }
}

impl Default for MetadataRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Type A: `key=value`, one per line. `device_id` and `firmware_version` are
/// promoted to dedicated fields; everything else lands in the generic map.
fn parse_type_a(raw: &str) -> DeviceMetadata {
    let mut metadata = DeviceMetadata::default();
    let mut found_any = false;

    for line in raw.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        let key = key.trim();
        let value = value.trim();

        if key.is_empty() {
            continue;
        }

        match key {
            "device_id" => metadata.device_id = value.to_owned(),
            "firmware_version" => metadata.firmware_version = value.to_owned(),
            _ => {
                metadata.fields.insert(key.to_owned(), value.to_owned());
            }
        }

        found_any = true;
    }

    metadata.parse_successful = found_any && !metadata.device_id.is_empty();
    metadata
}

/// Type B: a flat JSON object with short keys (`id`, `fw`, and arbitrary
/// extras). Nested values are not expected and are stringified as-is.
fn parse_type_b(raw: &str) -> DeviceMetadata {
    let mut metadata = DeviceMetadata::default();

    let Ok(Value::Object(object)) = serde_json::from_str(raw) else {
        return metadata;
    };

    let mut found_any = false;

    for (key, value) in object {
        let value = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };

        match key.as_str() {
            "id" => metadata.device_id = value,
            "fw" => metadata.firmware_version = value,
            _ => {
                metadata.fields.insert(key, value);
            }
        }

        found_any = true;
    }

    metadata.parse_successful = found_any && !metadata.device_id.is_empty();
    metadata
}

#[cfg(test)]
mod tests {
    use super::{DeviceMetadata, MetadataRegistry};

    #[test]
    fn type_a_key_value_lines() {
        let registry = MetadataRegistry::new();

        let raw = "device_id = sensor-7\nfirmware_version=2.1.0\nbattery= 87\n\nnot a pair\n";
        let metadata = registry.extract(raw, "typeA");

        assert!(metadata.parse_successful);
        assert_eq!(metadata.device_id, "sensor-7");
        assert_eq!(metadata.device_type, "typeA");
        assert_eq!(metadata.firmware_version, "2.1.0");
        assert_eq!(metadata.fields["battery"], "87");
    }

    #[test]
    fn type_a_requires_device_id() {
        let registry = MetadataRegistry::new();

        let metadata = registry.extract("firmware_version=2.1.0\n", "typeA");
        assert!(!metadata.parse_successful);

        let metadata = registry.extract("", "typeA");
        assert!(!metadata.parse_successful);
    }

    #[test]
    fn type_b_json_object() {
        let registry = MetadataRegistry::new();

        let raw = r#"{"id": "sensor-9", "fw": "3.0.1", "uptime": 12345}"#;
        let metadata = registry.extract(raw, "typeB");

        assert!(metadata.parse_successful);
        assert_eq!(metadata.device_id, "sensor-9");
        assert_eq!(metadata.firmware_version, "3.0.1");
        assert_eq!(metadata.fields["uptime"], "12345");
    }

    #[test]
    fn type_b_rejects_non_objects() {
        let registry = MetadataRegistry::new();

        assert!(!registry.extract("not json", "typeB").parse_successful);
        assert!(!registry.extract("[1, 2, 3]", "typeB").parse_successful);
        assert!(!registry.extract(r#"{"fw": "1.0"}"#, "typeB").parse_successful);
    }

    #[test]
    fn unknown_type_and_custom_registration() {
        let mut registry = MetadataRegistry::new();

        let metadata = registry.extract("anything", "typeC");
        assert!(!metadata.parse_successful);
        assert_eq!(metadata.device_type, "typeC");

        registry.register("typeC", |raw| DeviceMetadata {
            device_id: raw.to_owned(),
            parse_successful: true,
            ..Default::default()
        });

        let metadata = registry.extract("custom-device", "typeC");
        assert!(metadata.parse_successful);
        assert_eq!(metadata.device_id, "custom-device");

        assert_eq!(registry.registered_types(), ["typeA", "typeB", "typeC"]);
    }
}
