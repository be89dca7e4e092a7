//! Evaluation of gates and configs against a user.
//!
//! The rule engine is an external capability: a [`Client`](crate::Client) delegates every
//! evaluation to an [`Evaluator`]. [`SpecsEvaluator`] is the bundled implementation that serves
//! the values the specs document already resolves.
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    specs::{ConfigEntity, Specs},
    specs_store::{SpecsSnapshot, SpecsSource},
    UserContext,
};

/// Outcome of evaluating a gate for a user.
#[derive(Debug, Clone, PartialEq)]
pub struct GateEvaluation {
    pub value: bool,
    pub rule_id: String,
    pub id_type: String,
}

/// Outcome of evaluating a dynamic config or experiment for a user.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEvaluation {
    pub value: Map<String, Value>,
    pub rule_id: String,
    pub id_type: String,
    pub group_name: Option<String>,
    pub is_experiment: bool,
}

/// Outcome of evaluating a layer for a user.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerEvaluation {
    pub value: Map<String, Value>,
    pub rule_id: String,
    pub id_type: String,
    pub group_name: Option<String>,
    pub allocated_experiment_name: Option<String>,
}

/// Rule engine used by a [`Client`](crate::Client).
///
/// `specs` is `None` until the client has received specs. Returning `None` means the name is not
/// known to the evaluator.
pub trait Evaluator: Send + Sync {
    fn check_gate(
        &self,
        specs: Option<&Specs>,
        user: &UserContext,
        name: &str,
    ) -> Option<GateEvaluation>;

    fn get_config(
        &self,
        specs: Option<&Specs>,
        user: &UserContext,
        name: &str,
    ) -> Option<ConfigEvaluation>;

    fn get_layer(
        &self,
        specs: Option<&Specs>,
        user: &UserContext,
        name: &str,
    ) -> Option<LayerEvaluation>;
}

/// Serves the resolved values carried by the specs document.
///
/// Disabled specs evaluate to `false`/empty with rule id `"disabled"`, and users that lack the
/// unit id a spec is keyed on evaluate to `false`/empty with rule id `"default"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpecsEvaluator;

const RULE_DISABLED: &str = "disabled";
const RULE_DEFAULT: &str = "default";

impl Evaluator for SpecsEvaluator {
    fn check_gate(
        &self,
        specs: Option<&Specs>,
        user: &UserContext,
        name: &str,
    ) -> Option<GateEvaluation> {
        let gate = specs?.gate(name)?;

        let (value, rule_id) = if !gate.enabled {
            (false, RULE_DISABLED)
        } else if user.unit_id(&gate.id_type).is_none() {
            (false, RULE_DEFAULT)
        } else {
            (gate.value, gate.rule_id.as_str())
        };

        Some(GateEvaluation {
            value,
            rule_id: rule_id.to_owned(),
            id_type: gate.id_type.clone(),
        })
    }

    fn get_config(
        &self,
        specs: Option<&Specs>,
        user: &UserContext,
        name: &str,
    ) -> Option<ConfigEvaluation> {
        let config = specs?.config(name)?;
        let is_experiment = config.entity == ConfigEntity::Experiment;

        let evaluation = if !config.enabled {
            ConfigEvaluation {
                value: Map::new(),
                rule_id: RULE_DISABLED.to_owned(),
                id_type: config.id_type.clone(),
                group_name: None,
                is_experiment,
            }
        } else if user.unit_id(&config.id_type).is_none() {
            ConfigEvaluation {
                value: Map::new(),
                rule_id: RULE_DEFAULT.to_owned(),
                id_type: config.id_type.clone(),
                group_name: None,
                is_experiment,
            }
        } else {
            ConfigEvaluation {
                value: config.value.clone(),
                rule_id: config.rule_id.clone(),
                id_type: config.id_type.clone(),
                group_name: config.group_name.clone(),
                is_experiment,
            }
        };
        Some(evaluation)
    }

    fn get_layer(
        &self,
        specs: Option<&Specs>,
        user: &UserContext,
        name: &str,
    ) -> Option<LayerEvaluation> {
        let layer = specs?.layer(name)?;

        let unassigned = |rule_id: &str| LayerEvaluation {
            value: Map::new(),
            rule_id: rule_id.to_owned(),
            id_type: layer.id_type.clone(),
            group_name: None,
            allocated_experiment_name: None,
        };
        let evaluation = if !layer.enabled {
            unassigned(RULE_DISABLED)
        } else if user.unit_id(&layer.id_type).is_none() {
            unassigned(RULE_DEFAULT)
        } else {
            LayerEvaluation {
                value: layer.value.clone(),
                rule_id: layer.rule_id.clone(),
                id_type: layer.id_type.clone(),
                group_name: layer.group_name.clone(),
                allocated_experiment_name: layer.allocated_experiment_name.clone(),
            }
        };
        Some(evaluation)
    }
}

/// Why an evaluation produced the value it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvaluationReason {
    /// The client had no specs yet.
    Uninitialized,
    /// Evaluated against specs fetched from the network.
    Network,
    /// Specs were available but the name is unknown.
    Unrecognized,
}

/// Metadata attached to every evaluation result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetails {
    pub reason: EvaluationReason,
    /// Last config update time of the specs used (ms since epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lcut: Option<u64>,
    /// When the specs used were received by this process.
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub received_at: Option<DateTime<Utc>>,
}

impl EvaluationDetails {
    pub(crate) fn new(snapshot: Option<&SpecsSnapshot>, recognized: bool) -> EvaluationDetails {
        match snapshot {
            None => EvaluationDetails {
                reason: EvaluationReason::Uninitialized,
                lcut: None,
                received_at: None,
            },
            Some(snapshot) => EvaluationDetails {
                reason: match (snapshot.source, recognized) {
                    (_, false) => EvaluationReason::Unrecognized,
                    (SpecsSource::Network, true) => EvaluationReason::Network,
                    (SpecsSource::Uninitialized, true) => EvaluationReason::Uninitialized,
                },
                lcut: Some(snapshot.specs.time),
                received_at: Some(snapshot.received_at),
            },
        }
    }
}

/// Result of evaluating a feature gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureGate {
    pub name: String,
    pub value: bool,
    pub rule_id: String,
    pub id_type: String,
    pub details: EvaluationDetails,
}

impl FeatureGate {
    pub(crate) fn new(
        name: &str,
        evaluation: Option<GateEvaluation>,
        details: EvaluationDetails,
    ) -> FeatureGate {
        let GateEvaluation {
            value,
            rule_id,
            id_type,
        } = evaluation.unwrap_or_else(|| GateEvaluation {
            value: false,
            rule_id: String::new(),
            id_type: String::new(),
        });
        FeatureGate {
            name: name.to_owned(),
            value,
            rule_id,
            id_type,
            details,
        }
    }
}

/// Result of evaluating an experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Experiment {
    pub name: String,
    pub value: Map<String, Value>,
    pub rule_id: String,
    pub id_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub details: EvaluationDetails,
}

impl Experiment {
    pub(crate) fn new(
        name: &str,
        evaluation: Option<ConfigEvaluation>,
        details: EvaluationDetails,
    ) -> Experiment {
        let evaluation = evaluation.unwrap_or_else(empty_config);
        Experiment {
            name: name.to_owned(),
            value: evaluation.value,
            rule_id: evaluation.rule_id,
            id_type: evaluation.id_type,
            group_name: evaluation.group_name,
            details,
        }
    }
}

/// Result of evaluating a dynamic config.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DynamicConfig {
    pub name: String,
    pub value: Map<String, Value>,
    pub rule_id: String,
    pub id_type: String,
    pub details: EvaluationDetails,
}

impl DynamicConfig {
    pub(crate) fn new(
        name: &str,
        evaluation: Option<ConfigEvaluation>,
        details: EvaluationDetails,
    ) -> DynamicConfig {
        let evaluation = evaluation.unwrap_or_else(empty_config);
        DynamicConfig {
            name: name.to_owned(),
            value: evaluation.value,
            rule_id: evaluation.rule_id,
            id_type: evaluation.id_type,
            details,
        }
    }
}

/// Result of evaluating a layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layer {
    pub name: String,
    pub value: Map<String, Value>,
    pub rule_id: String,
    pub id_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_experiment_name: Option<String>,
    pub details: EvaluationDetails,
}

impl Layer {
    pub(crate) fn new(
        name: &str,
        evaluation: Option<LayerEvaluation>,
        details: EvaluationDetails,
    ) -> Layer {
        let LayerEvaluation {
            value,
            rule_id,
            id_type,
            group_name,
            allocated_experiment_name,
        } = evaluation.unwrap_or_else(|| LayerEvaluation {
            value: Map::new(),
            rule_id: String::new(),
            id_type: String::new(),
            group_name: None,
            allocated_experiment_name: None,
        });
        Layer {
            name: name.to_owned(),
            value,
            rule_id,
            id_type,
            group_name,
            allocated_experiment_name,
            details,
        }
    }
}

fn empty_config() -> ConfigEvaluation {
    ConfigEvaluation {
        value: Map::new(),
        rule_id: String::new(),
        id_type: String::new(),
        group_name: None,
        is_experiment: false,
    }
}
