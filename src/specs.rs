//! Wire model of the specs document served to clients.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The full configuration ruleset fetched from the specs endpoint.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Specs {
    #[serde(default)]
    pub feature_gates: HashMap<String, TryParse<GateSpec>>,
    #[serde(default)]
    pub dynamic_configs: HashMap<String, TryParse<ConfigSpec>>,
    #[serde(default)]
    pub layer_configs: HashMap<String, TryParse<LayerSpec>>,
    #[serde(default = "default_has_updates")]
    pub has_updates: bool,
    /// Last config update time (ms since epoch).
    #[serde(default)]
    pub time: u64,
}

fn default_has_updates() -> bool {
    true
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}
impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}
impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSpec {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub value: bool,
    #[serde(rename = "ruleID", default = "default_rule_id")]
    pub rule_id: String,
    #[serde(default = "default_id_type")]
    pub id_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntity {
    Experiment,
    DynamicConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    pub name: String,
    pub enabled: bool,
    #[serde(default = "default_entity")]
    pub entity: ConfigEntity,
    #[serde(default)]
    pub value: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "ruleID", default = "default_rule_id")]
    pub rule_id: String,
    #[serde(default = "default_id_type")]
    pub id_type: String,
    #[serde(default)]
    pub group_name: Option<String>,
}

/// A layer: a parameter namespace shared by mutually exclusive experiments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerSpec {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub value: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "ruleID", default = "default_rule_id")]
    pub rule_id: String,
    #[serde(default = "default_id_type")]
    pub id_type: String,
    #[serde(default)]
    pub group_name: Option<String>,
    /// Experiment the user was allocated to within this layer, if any.
    #[serde(default)]
    pub allocated_experiment_name: Option<String>,
}

fn default_rule_id() -> String {
    "default".to_owned()
}

fn default_id_type() -> String {
    "userID".to_owned()
}

fn default_entity() -> ConfigEntity {
    ConfigEntity::DynamicConfig
}

impl Specs {
    /// Parse a specs document.
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Specs> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn gate(&self, name: &str) -> Option<&GateSpec> {
        self.feature_gates.get(name).and_then(Into::into)
    }

    pub fn config(&self, name: &str) -> Option<&ConfigSpec> {
        self.dynamic_configs.get(name).and_then(Into::into)
    }

    pub fn layer(&self, name: &str) -> Option<&LayerSpec> {
        self.layer_configs.get(name).and_then(Into::into)
    }

    /// Names of all gates that parsed successfully, sorted.
    pub fn gate_names(&self) -> Vec<&str> {
        sorted_names(&self.feature_gates)
    }

    /// Names of all dynamic configs and experiments that parsed successfully, sorted.
    pub fn config_names(&self) -> Vec<&str> {
        sorted_names(&self.dynamic_configs)
    }

    /// Names of all layers that parsed successfully, sorted.
    pub fn layer_names(&self) -> Vec<&str> {
        sorted_names(&self.layer_configs)
    }
}

fn sorted_names<T>(map: &HashMap<String, TryParse<T>>) -> Vec<&str> {
    let mut names = map
        .iter()
        .filter(|(_, spec)| matches!(spec, TryParse::Parsed(_)))
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>();
    names.sort_unstable();
    names
}
