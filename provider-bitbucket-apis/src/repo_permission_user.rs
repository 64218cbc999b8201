use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ResourceSpec, ResourceStatus};

/// A user permission on a Bitbucket repository.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "bitbucket.krateo.io",
    version = "v1alpha1",
    kind = "RepoPermissionUser",
    derive = "PartialEq",
    status = "RepoPermissionUserStatus",
    category = "managed",
    category = "krateo",
    category = "bitbucket",
    printcolumn = r#"{"name":"PROJECT","type":"string","jsonPath":".status.atProvider.project"}"#,
    printcolumn = r#"{"name":"SLUG","type":"string","jsonPath":".status.atProvider.repoSlug"}"#,
    printcolumn = r#"{"name":"USER","type":"string","jsonPath":".status.atProvider.user"}"#,
    printcolumn = r#"{"name":"PERM","type":"string","jsonPath":".status.atProvider.permission"}"#,
    printcolumn = r#"{"name":"READY","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status","priority":1}"#,
    printcolumn = r#"{"name":"SYNCED","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status","priority":1}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RepoPermissionUserSpec {
    #[serde(flatten)]
    pub resource_spec: ResourceSpec,
    pub for_provider: RepoPermissionUserParams,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoPermissionUserParams {
    /// The project key.
    pub project: String,
    /// Slug of the repository.
    pub repo_slug: String,
    /// The user to grant the permission to.
    pub user: String,
    /// The permission granted to the user, one of `REPO_READ`, `REPO_WRITE`,
    /// `REPO_ADMIN` (the `REPO_` prefix may be omitted).
    #[schemars(regex(pattern = "(?i)^(repo_)?(read|write|admin)$"))]
    pub permission: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoPermissionUserObservation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// The permission currently granted, as reported by Bitbucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoPermissionUserStatus {
    #[serde(flatten)]
    pub resource_status: ResourceStatus,
    #[serde(default)]
    pub at_provider: RepoPermissionUserObservation,
}

crate::managed_resource!(RepoPermissionUser);

impl RepoPermissionUser {
    pub fn at_provider(&self) -> Option<&RepoPermissionUserObservation> {
        self.status.as_ref().map(|s| &s.at_provider)
    }

    pub fn at_provider_mut(&mut self) -> &mut RepoPermissionUserObservation {
        &mut self.status.get_or_insert_with(Default::default).at_provider
    }
}
