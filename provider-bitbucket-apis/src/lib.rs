use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::Resource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod provider_config;
mod repo;
mod repo_permission_user;

pub use provider_config::*;
pub use repo::*;
pub use repo_permission_user::*;

/// Annotation recording the Bitbucket identifier of the object a managed
/// resource represents.
pub const EXTERNAL_NAME_ANNOTATION: &'static str = "crossplane.io/external-name";

/// Label put on `ProviderConfigUsage` objects, its value is the name of the
/// referenced `ProviderConfig`.
pub const PROVIDER_CONFIG_LABEL: &'static str = "bitbucket.krateo.io/provider-config";

pub const READY: &'static str = "Ready";
pub const SYNCED: &'static str = "Synced";

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    #[serde(default)]
    pub message: String,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase, either Ready or Synced.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
        }
    }

    /// The external resource exists and is ready for use.
    pub fn available() -> Self {
        Self::new(READY, Some(true), "Available", String::new())
    }

    /// The external resource is being created.
    pub fn creating() -> Self {
        Self::new(READY, Some(false), "Creating", String::new())
    }

    /// The external resource is being deleted.
    pub fn deleting() -> Self {
        Self::new(READY, Some(false), "Deleting", String::new())
    }

    pub fn reconcile_success() -> Self {
        Self::new(SYNCED, Some(true), "ReconcileSuccess", String::new())
    }

    pub fn reconcile_error(message: String) -> Self {
        Self::new(SYNCED, Some(false), "ReconcileError", message)
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Reference to the `ProviderConfig` used to connect to Bitbucket.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
pub struct ProviderConfigReference {
    /// Name of the referenced `ProviderConfig`.
    pub name: String,
}

/// What happens to the Bitbucket object once its managed resource is deleted.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default, JsonSchema)]
pub enum DeletionPolicy {
    /// Delete the Bitbucket object.
    #[default]
    Delete,
    /// Leave the Bitbucket object untouched.
    Orphan,
}

/// Fields common to the spec of every managed resource.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// The `ProviderConfig` holding the Bitbucket endpoint and credentials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_config_ref: Option<ProviderConfigReference>,
    /// Defaults to `Delete`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
}

impl ResourceSpec {
    pub fn deletion_policy(&self) -> DeletionPolicy {
        self.deletion_policy.unwrap_or_default()
    }
}

/// Fields common to the status of every managed resource.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct ResourceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl ResourceStatus {
    /// Insert or replace the condition with the same type. The transition time
    /// is only bumped when the condition actually changes.
    pub fn update_condition(&mut self, mut c: Condition) {
        let mut conditions: Vec<Condition> = self.conditions.take().unwrap_or_default();
        match conditions.iter_mut().find(|e| e.type_ == c.type_) {
            Some(existing) if existing.same_state(&c) => (),
            Some(existing) => {
                c.last_transition_time = Some(now());
                *existing = c;
            }
            None => {
                c.last_transition_time = Some(now());
                conditions.push(c);
            }
        }
        self.conditions = Some(conditions);
    }

    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.conditions.iter().flatten().find(|c| c.type_ == tpe)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A Kubernetes object representing the desired state of a Bitbucket object.
pub trait ManagedResource: Resource<DynamicType = ()> {
    fn resource_spec(&self) -> &ResourceSpec;

    fn resource_status(&self) -> Option<&ResourceStatus>;

    fn resource_status_mut(&mut self) -> &mut ResourceStatus;

    fn provider_config_name(&self) -> Option<&str> {
        self.resource_spec()
            .provider_config_ref
            .as_ref()
            .map(|r| r.name.as_str())
    }

    /// The external name annotation, `None` if unset or empty.
    fn external_name(&self) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(EXTERNAL_NAME_ANNOTATION))
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    fn set_external_name(&mut self, name: String) {
        self.meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(EXTERNAL_NAME_ANNOTATION.to_string(), name);
    }

    fn set_conditions(&mut self, c: Condition) {
        self.resource_status_mut().update_condition(c);
    }

    fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.resource_status().and_then(|s| s.condition(tpe))
    }
}

macro_rules! managed_resource {
    ($kind:ty) => {
        impl $crate::ManagedResource for $kind {
            fn resource_spec(&self) -> &$crate::ResourceSpec {
                &self.spec.resource_spec
            }

            fn resource_status(&self) -> Option<&$crate::ResourceStatus> {
                self.status.as_ref().map(|s| &s.resource_status)
            }

            fn resource_status_mut(&mut self) -> &mut $crate::ResourceStatus {
                &mut self
                    .status
                    .get_or_insert_with(Default::default)
                    .resource_status
            }
        }
    };
}
pub(crate) use managed_resource;
