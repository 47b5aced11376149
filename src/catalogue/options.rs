use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_OPTIONS_SET: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Flag(bool),
    Number(i64),
    Text(String),
}

impl OptionValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptionValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            OptionValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            OptionValue::Number(v) => Some(*v),
            OptionValue::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_arg(&self) -> String {
        match self {
            OptionValue::Flag(v) => v.to_string(),
            OptionValue::Number(v) => v.to_string(),
            OptionValue::Text(v) => v.clone(),
        }
    }
}

/// A named, shareable bag of downloader and post-processor settings.
///
/// Sets are never edited in place: `Catalogue::edit_options` stores a new
/// version, so snapshots taken by running jobs keep their values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsSet {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub values: BTreeMap<String, OptionValue>,
}

impl OptionsSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: OptionValue) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }
}

/// Options merged for one node at job-creation time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedOptions {
    /// `(set name, version)` for every layer that contributed, outermost first.
    pub sources: Vec<(String, u32)>,
    pub values: BTreeMap<String, OptionValue>,
}

impl ResolvedOptions {
    pub(crate) fn from_layers<'a>(layers: impl IntoIterator<Item = &'a OptionsSet>) -> Self {
        let mut sources = Vec::new();
        let mut values = BTreeMap::new();
        for layer in layers {
            sources.push((layer.name.clone(), layer.version));
            for (key, value) in &layer.values {
                values.insert(key.clone(), value.clone());
            }
        }
        Self { sources, values }
    }

    pub fn overlay(&self, extra: &OptionsSet) -> Self {
        let mut merged = self.clone();
        merged.sources.push((extra.name.clone(), extra.version));
        for (key, value) in &extra.values {
            merged.values.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn is_resolved(&self) -> bool {
        !self.sources.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(OptionValue::as_text)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(OptionValue::as_flag).unwrap_or(false)
    }

    pub fn number(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(OptionValue::as_number)
    }
}
