use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ResourceSpec, ResourceStatus};

/// A Bitbucket repository. The `forProvider` fields are immutable once the
/// repository has been created.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "bitbucket.krateo.io",
    version = "v1alpha1",
    kind = "Repo",
    derive = "PartialEq",
    status = "RepoStatus",
    category = "managed",
    category = "krateo",
    category = "bitbucket",
    printcolumn = r#"{"name":"PROJECT","type":"string","jsonPath":".status.atProvider.project"}"#,
    printcolumn = r#"{"name":"SLUG","type":"string","jsonPath":".status.atProvider.repoSlug"}"#,
    printcolumn = r#"{"name":"READY","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status","priority":1}"#,
    printcolumn = r#"{"name":"SYNCED","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status","priority":1}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    #[serde(flatten)]
    pub resource_spec: ResourceSpec,
    pub for_provider: RepoParams,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct RepoParams {
    /// The project key.
    pub project: String,
    /// The name of the repository.
    pub name: String,
    /// Whether the repository is private.
    #[serde(default)]
    pub private: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoObservation {
    /// The project key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// The repository name slug.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_slug: Option<String>,
    /// The repository state as reported by Bitbucket, e.g. `AVAILABLE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoStatus {
    #[serde(flatten)]
    pub resource_status: ResourceStatus,
    #[serde(default)]
    pub at_provider: RepoObservation,
}

crate::managed_resource!(Repo);

impl Repo {
    pub fn at_provider(&self) -> Option<&RepoObservation> {
        self.status.as_ref().map(|s| &s.at_provider)
    }

    pub fn at_provider_mut(&mut self) -> &mut RepoObservation {
        &mut self.status.get_or_insert_with(Default::default).at_provider
    }
}
