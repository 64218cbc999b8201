use async_trait::async_trait;
use kube::ResourceExt;
use provider_bitbucket_apis::{Condition, ManagedResource, Repo};

use crate::{
    bitbucket::{self, CreateRepoOpts, GetRepoOpts, RepoInitOpts},
    errors::ControllerError,
    managed::{ExternalClient, ExternalObservation},
};

pub(crate) const REPO_CONTROLLER: &'static str = "repo_controller";

/// Manages Bitbucket repositories. The external name of a [`Repo`] is
/// `{project}/{slug}`.
pub(crate) struct RepoExternal {
    client: bitbucket::Client,
}

impl RepoExternal {
    pub(crate) fn new(client: bitbucket::Client) -> Self {
        Self { client }
    }
}

/// Split an external name into project key and repository slug.
fn project_and_slug(external_name: &str) -> Option<(&str, &str)> {
    let mut parts = external_name.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(project), Some(slug), None) => Some((project, slug)),
        _ => None,
    }
}

#[async_trait]
impl ExternalClient<Repo> for RepoExternal {
    async fn observe(&self, cr: &mut Repo) -> Result<ExternalObservation, ControllerError> {
        let found = match cr.external_name().and_then(project_and_slug) {
            Some((project_key, repo_slug)) => {
                debug!(
                    "repo {}: external name exists, project {}, slug {}",
                    cr.name_any(),
                    project_key,
                    repo_slug
                );
                self.client
                    .repos()
                    .get(GetRepoOpts {
                        project_key,
                        repo_slug,
                    })
                    .await?
            }
            None => None,
        };

        match found {
            Some(repo) => {
                let project = cr.spec.for_provider.project.clone();
                let at_provider = cr.at_provider_mut();
                at_provider.project = Some(project);
                at_provider.repo_slug = Some(repo.slug);
                at_provider.state = Some(repo.state);
                cr.set_conditions(Condition::available());
                Ok(ExternalObservation {
                    resource_exists: true,
                    resource_up_to_date: true,
                })
            }
            None => {
                debug!(
                    "repo {}: {}/{} does not exist",
                    cr.name_any(),
                    cr.spec.for_provider.project,
                    cr.spec.for_provider.name
                );
                Ok(ExternalObservation {
                    resource_exists: false,
                    resource_up_to_date: true,
                })
            }
        }
    }

    async fn create(&self, cr: &mut Repo) -> Result<(), ControllerError> {
        cr.set_conditions(Condition::creating());
        let params = cr.spec.for_provider.clone();

        let repos = self.client.repos();
        let created = repos
            .create(CreateRepoOpts {
                project_key: &params.project,
                name: &params.name,
                public: !params.private,
                default_branch: None,
            })
            .await?;
        debug!(
            "repo {}: created {}/{} with slug {}",
            cr.name_any(),
            params.project,
            params.name,
            created.slug
        );

        repos
            .init(RepoInitOpts {
                project_key: &params.project,
                repo_slug: &created.slug,
                title: Some(&created.description),
            })
            .await?;
        debug!("repo {}: initialized {}/{}", cr.name_any(), params.project, created.slug);

        cr.set_external_name(format!("{}/{}", params.project, created.slug));
        Ok(())
    }

    async fn update(&self, _cr: &mut Repo) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn delete(&self, cr: &mut Repo) -> Result<(), ControllerError> {
        cr.set_conditions(Condition::deleting());
        let observed = cr.at_provider().and_then(|o| {
            o.project
                .as_deref()
                .zip(o.repo_slug.as_deref())
                .map(|(p, s)| (p.to_string(), s.to_string()))
        });
        let (project_key, repo_slug) = match observed {
            Some(observed) => observed,
            None => match cr.external_name().and_then(project_and_slug) {
                Some((p, s)) => (p.to_string(), s.to_string()),
                None => {
                    return Err(ControllerError::InvalidSpec(format!(
                        "repo {} has neither an observed slug nor a valid external name",
                        cr.name_any()
                    )));
                }
            },
        };
        Ok(self.client.repos().delete(&project_key, &repo_slug).await?)
    }
}
