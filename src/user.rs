use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    handle::{HandleKind, HandleTarget},
    Error, Result,
};

/// Loosely-typed identity fields as they arrive from the caller.
///
/// Every field is optional; an empty string is treated the same as a missing one.
/// `custom_ids_json` must be a JSON object of strings, `custom_json` and `private_json` JSON
/// objects of arbitrary values.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserFields<'a> {
    pub user_id: Option<&'a str>,
    pub custom_ids_json: Option<&'a str>,
    pub email: Option<&'a str>,
    pub ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub country: Option<&'a str>,
    pub locale: Option<&'a str>,
    pub app_version: Option<&'a str>,
    pub custom_json: Option<&'a str>,
    pub private_json: Option<&'a str>,
}

/// Immutable bag of identity attributes evaluations are made for.
///
/// Serializes to the public user shape; private attributes are never serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    #[serde(rename = "userID", skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(rename = "customIDs", skip_serializing_if = "BTreeMap::is_empty")]
    custom_ids: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_version: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    custom: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    private_attributes: BTreeMap<String, serde_json::Value>,
}

impl UserContext {
    /// Create a user with the given primary id and no other attributes.
    pub fn with_user_id(user_id: impl Into<String>) -> UserContext {
        UserContext {
            user_id: Some(user_id.into()),
            ..UserContext::default()
        }
    }

    /// Build a user from caller-supplied fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if any of the JSON fields is not valid JSON or not a
    /// JSON object of the expected shape.
    pub fn from_fields(fields: UserFields<'_>) -> Result<UserContext> {
        Ok(UserContext {
            user_id: owned(fields.user_id),
            custom_ids: parse_object("custom_ids_json", fields.custom_ids_json)?,
            email: owned(fields.email),
            ip: owned(fields.ip),
            user_agent: owned(fields.user_agent),
            country: owned(fields.country),
            locale: owned(fields.locale),
            app_version: owned(fields.app_version),
            custom: parse_object("custom_json", fields.custom_json)?,
            private_attributes: parse_object("private_json", fields.private_json)?,
        })
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn custom_ids(&self) -> &BTreeMap<String, String> {
        &self.custom_ids
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn country(&self) -> Option<&str> {
        self.country.as_deref()
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn app_version(&self) -> Option<&str> {
        self.app_version.as_deref()
    }

    pub fn custom(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.custom
    }

    pub fn private_attributes(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.private_attributes
    }

    /// Look up the unit id used for the given id type. `"userID"` (case-insensitive) selects the
    /// primary id; anything else names a custom id namespace.
    pub fn unit_id(&self, id_type: &str) -> Option<&str> {
        if id_type.is_empty() || id_type.eq_ignore_ascii_case("userid") {
            return self.user_id();
        }
        self.custom_ids
            .get(id_type)
            .or_else(|| {
                self.custom_ids
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(id_type))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }

    /// Returns `true` if the user carries no identity at all.
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none() && self.custom_ids.is_empty()
    }
}

impl HandleTarget for UserContext {
    const KIND: HandleKind = HandleKind::User;
}

fn owned(value: Option<&str>) -> Option<String> {
    value.filter(|s| !s.is_empty()).map(str::to_owned)
}

fn parse_object<T: DeserializeOwned>(
    field: &'static str,
    json: Option<&str>,
) -> Result<BTreeMap<String, T>> {
    match json.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(BTreeMap::new()),
        Some(json) => serde_json::from_str(json).map_err(|err| {
            log::warn!(target: "evalbridge", field; "malformed user field: {err}");
            Error::malformed(field, err)
        }),
    }
}
