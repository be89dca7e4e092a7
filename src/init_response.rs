//! Client initialization payload: every gate and config evaluated for one user, serialized for a
//! client-side SDK to bootstrap from.
use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    evaluator::Evaluator, hashing::HashAlgorithm, sdk_metadata::SDK_METADATA,
    specs_store::SpecsSnapshot, Result, UserContext,
};

/// Options for [`ClientInitResponse::build`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientInitResponseOptions {
    /// Applied to every gate, config and layer name, both as map key and `name` field.
    pub hash_algorithm: HashAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateInitValue {
    pub name: String,
    pub value: bool,
    pub rule_id: String,
    pub id_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigInitValue {
    pub name: String,
    pub value: Map<String, Value>,
    pub rule_id: String,
    pub id_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub is_experiment: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerInitValue {
    pub name: String,
    pub value: Map<String, Value>,
    pub rule_id: String,
    pub id_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_experiment_name: Option<String>,
}

/// Identity keys the payload was evaluated for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluatedKeys<'a> {
    #[serde(rename = "userID", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<&'a str>,
    #[serde(rename = "customIDs", skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_ids: &'a BTreeMap<String, String>,
}

/// All values a client-side SDK needs for one user.
///
/// Maps are ordered, so serializing the same response twice yields identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInitResponse<'a> {
    pub feature_gates: BTreeMap<String, GateInitValue>,
    pub dynamic_configs: BTreeMap<String, ConfigInitValue>,
    pub layer_configs: BTreeMap<String, LayerInitValue>,
    pub has_updates: bool,
    pub time: u64,
    pub generator: &'static str,
    pub sdk_version: &'static str,
    pub hash_used: HashAlgorithm,
    pub evaluated_keys: EvaluatedKeys<'a>,
    pub user: &'a UserContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<&'a str>,
}

impl<'a> ClientInitResponse<'a> {
    /// Evaluate every known gate, config and layer in `snapshot` for `user`.
    pub fn build(
        snapshot: Option<&SpecsSnapshot>,
        evaluator: &dyn Evaluator,
        user: &'a UserContext,
        environment: Option<&'a str>,
        options: ClientInitResponseOptions,
    ) -> ClientInitResponse<'a> {
        let specs = snapshot.map(|snapshot| &snapshot.specs);
        let hash = |name: &str| options.hash_algorithm.hash(name);

        let mut feature_gates = BTreeMap::new();
        let mut dynamic_configs = BTreeMap::new();
        let mut layer_configs = BTreeMap::new();
        if let Some(specs) = specs {
            for name in specs.gate_names() {
                if let Some(gate) = evaluator.check_gate(Some(specs), user, name) {
                    feature_gates.insert(
                        hash(name),
                        GateInitValue {
                            name: hash(name),
                            value: gate.value,
                            rule_id: gate.rule_id,
                            id_type: gate.id_type,
                        },
                    );
                }
            }
            for name in specs.config_names() {
                if let Some(config) = evaluator.get_config(Some(specs), user, name) {
                    dynamic_configs.insert(
                        hash(name),
                        ConfigInitValue {
                            name: hash(name),
                            value: config.value,
                            rule_id: config.rule_id,
                            id_type: config.id_type,
                            group_name: config.group_name,
                            is_experiment: config.is_experiment,
                        },
                    );
                }
            }
            for name in specs.layer_names() {
                if let Some(layer) = evaluator.get_layer(Some(specs), user, name) {
                    layer_configs.insert(
                        hash(name),
                        LayerInitValue {
                            name: hash(name),
                            value: layer.value,
                            rule_id: layer.rule_id,
                            id_type: layer.id_type,
                            group_name: layer.group_name,
                            allocated_experiment_name: layer
                                .allocated_experiment_name
                                .as_deref()
                                .map(hash),
                        },
                    );
                }
            }
        }

        ClientInitResponse {
            feature_gates,
            dynamic_configs,
            layer_configs,
            has_updates: specs.is_some(),
            time: specs.map_or(0, |specs| specs.time),
            generator: SDK_METADATA.name,
            sdk_version: SDK_METADATA.version,
            hash_used: options.hash_algorithm,
            evaluated_keys: EvaluatedKeys {
                user_id: user.user_id(),
                custom_ids: user.custom_ids(),
            },
            user,
            environment,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Copy as much of `payload` as fits into `buffer` and return the full payload size.
///
/// No terminator is written. The copy is truncated whenever the returned size is greater than
/// `buffer.len()`, in which case the caller should retry with a buffer of at least that size.
pub fn copy_into(payload: &[u8], buffer: &mut [u8]) -> usize {
    let n = payload.len().min(buffer.len());
    buffer[..n].copy_from_slice(&payload[..n]);
    payload.len()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{copy_into, ClientInitResponse, ClientInitResponseOptions};
    use crate::{
        evaluator::SpecsEvaluator,
        hashing::HashAlgorithm,
        specs::Specs,
        specs_store::SpecsSnapshot,
        UserContext, UserFields,
    };

    fn snapshot() -> Arc<SpecsSnapshot> {
        let bytes = std::fs::read("tests/data/specs.json").unwrap();
        Arc::new(SpecsSnapshot::from_network(Specs::from_slice(&bytes).unwrap()))
    }

    #[test]
    fn copy_truncates_without_terminator() {
        let payload = b"{\"a\":1}";

        let mut empty: [u8; 0] = [];
        assert_eq!(copy_into(payload, &mut empty), payload.len());

        let mut small = [0xffu8; 3];
        assert_eq!(copy_into(payload, &mut small), payload.len());
        assert_eq!(&small, b"{\"a");

        let mut large = [0xffu8; 10];
        assert_eq!(copy_into(payload, &mut large), payload.len());
        assert_eq!(&large[..payload.len()], payload);
        assert_eq!(large[payload.len()], 0xff);
    }

    #[test]
    fn uninitialized_response_is_empty() {
        let user = UserContext::with_user_id("u1");
        let response = ClientInitResponse::build(
            None,
            &SpecsEvaluator,
            &user,
            None,
            ClientInitResponseOptions::default(),
        );
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["feature_gates"], json!({}));
        assert_eq!(value["has_updates"], json!(false));
        assert_eq!(value["evaluated_keys"], json!({"userID": "u1"}));
        assert!(value.get("environment").is_none());
    }

    #[test]
    fn response_contains_evaluated_values() {
        let snapshot = snapshot();
        let user = UserContext::from_fields(UserFields {
            user_id: Some("u1"),
            private_json: Some(r#"{"secret": true}"#),
            ..UserFields::default()
        })
        .unwrap();
        let response = ClientInitResponse::build(
            Some(&snapshot),
            &SpecsEvaluator,
            &user,
            Some("staging"),
            ClientInitResponseOptions::default(),
        );
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["feature_gates"]["my_gate"]["value"], json!(true));
        assert_eq!(value["feature_gates"]["company_gate"]["value"], json!(false));
        assert_eq!(
            value["dynamic_configs"]["checkout_experiment"]["is_experiment"],
            json!(true)
        );
        assert!(value["dynamic_configs"].get("broken_config").is_none());
        assert_eq!(
            value["layer_configs"]["checkout_layer"]["allocated_experiment_name"],
            json!("checkout_experiment")
        );
        assert_eq!(
            value["layer_configs"]["pricing_layer"]["rule_id"],
            json!("disabled")
        );
        assert_eq!(value["hash_used"], json!("none"));
        assert_eq!(value["time"], json!(1729300000000u64));
        assert_eq!(value["environment"], json!("staging"));
        assert_eq!(value["user"], json!({"userID": "u1"}));
    }

    #[test]
    fn serialization_is_deterministic() {
        let snapshot = snapshot();
        let user = UserContext::with_user_id("u1");
        let a = ClientInitResponse::build(
            Some(&snapshot),
            &SpecsEvaluator,
            &user,
            None,
            ClientInitResponseOptions::default(),
        )
        .to_json()
            .unwrap();
        let b = ClientInitResponse::build(
            Some(&snapshot),
            &SpecsEvaluator,
            &user,
            None,
            ClientInitResponseOptions::default(),
        )
        .to_json()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn names_are_hashed_with_the_requested_algorithm() {
        let snapshot = snapshot();
        let user = UserContext::with_user_id("u1");
        let build = |hash_algorithm| {
            let response = ClientInitResponse::build(
                Some(&snapshot),
                &SpecsEvaluator,
                &user,
                None,
                ClientInitResponseOptions { hash_algorithm },
            );
            serde_json::to_value(&response).unwrap()
        };

        let sha = build(HashAlgorithm::Sha256);
        let hashed_gate = HashAlgorithm::Sha256.hash("my_gate");
        assert_eq!(sha["hash_used"], json!("sha256"));
        assert!(sha["feature_gates"].get("my_gate").is_none());
        assert_eq!(sha["feature_gates"][&hashed_gate]["name"], json!(hashed_gate));
        assert_eq!(sha["feature_gates"][&hashed_gate]["value"], json!(true));

        let djb2 = build(HashAlgorithm::Djb2);
        let hashed_layer = HashAlgorithm::Djb2.hash("checkout_layer");
        assert_eq!(
            djb2["layer_configs"][&hashed_layer]["allocated_experiment_name"],
            json!(HashAlgorithm::Djb2.hash("checkout_experiment"))
        );
        assert_eq!(
            djb2["dynamic_configs"].as_object().unwrap().len(),
            build(HashAlgorithm::None)["dynamic_configs"]
                .as_object()
                .unwrap()
                .len()
        );
    }
}
