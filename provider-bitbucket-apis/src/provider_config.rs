use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Condition, ProviderConfigReference};

/// Connection settings shared by all managed resources referencing this
/// `ProviderConfig`.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "bitbucket.krateo.io",
    version = "v1alpha1",
    kind = "ProviderConfig",
    derive = "PartialEq",
    status = "ProviderConfigStatus",
    category = "provider",
    category = "bitbucket",
    printcolumn = r#"{"name":"USERS","type":"integer","jsonPath":".status.users"}"#,
    printcolumn = r#"{"name":"VERBOSE","type":"boolean","jsonPath":".spec.verbose","priority":1}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigSpec {
    /// Use HTTP basic auth with this user name and the token as password
    /// instead of bearer auth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// The base URL of the Bitbucket Server REST API.
    #[serde(default)]
    pub api_url: String,
    /// Credentials required to authenticate against the REST API.
    pub credentials: Credentials,
    /// Log every request and response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
    /// Skip TLS certificate verification (default: false).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
}

impl ProviderConfigSpec {
    pub fn verbose(&self) -> bool {
        self.verbose.unwrap_or(false)
    }

    pub fn insecure(&self) -> bool {
        self.insecure.unwrap_or(false)
    }
}

/// Where the REST API token comes from.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default, JsonSchema)]
pub enum CredentialsSource {
    #[default]
    None,
    Secret,
    InjectedIdentity,
    Environment,
    Filesystem,
}

impl fmt::Display for CredentialsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialsSource::None => "None",
            CredentialsSource::Secret => "Secret",
            CredentialsSource::InjectedIdentity => "InjectedIdentity",
            CredentialsSource::Environment => "Environment",
            CredentialsSource::Filesystem => "Filesystem",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub source: CredentialsSource,
    /// The secret holding the token, required if `source` is `Secret`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretKeySelector>,
}

/// Reference to a key of a namespaced secret.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct SecretKeySelector {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct ProviderConfigStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// Number of managed resources using this `ProviderConfig`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<i64>,
}

/// Records that a managed resource uses a `ProviderConfig`. Usages are owned
/// by the managed resource and garbage collected with it.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "bitbucket.krateo.io",
    version = "v1alpha1",
    kind = "ProviderConfigUsage",
    derive = "PartialEq",
    category = "provider",
    category = "bitbucket",
    printcolumn = r#"{"name":"CONFIG-NAME","type":"string","jsonPath":".spec.providerConfigRef.name"}"#,
    printcolumn = r#"{"name":"RESOURCE-KIND","type":"string","jsonPath":".spec.resourceRef.kind"}"#,
    printcolumn = r#"{"name":"RESOURCE-NAME","type":"string","jsonPath":".spec.resourceRef.name"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigUsageSpec {
    pub provider_config_ref: ProviderConfigReference,
    pub resource_ref: TypedReference,
}

/// Reference to a cluster scoped object of any kind.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TypedReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ProviderConfigStatus {
    pub fn update_condition(&mut self, c: Condition) {
        let mut status = crate::ResourceStatus {
            conditions: self.conditions.take(),
        };
        status.update_condition(c);
        self.conditions = status.conditions;
    }
}
