use async_trait::async_trait;
use kube::ResourceExt;
use provider_bitbucket_apis::{Condition, ManagedResource, RepoPermissionUser};

use crate::{
    bitbucket::{self, RepoPermission, UserPermissionOpts},
    errors::ControllerError,
    managed::{ExternalClient, ExternalObservation},
};

pub(crate) const REPO_PERMISSION_USER_CONTROLLER: &'static str = "repo_permission_user_controller";

/// Manages the permission of a single user on a repository.
pub(crate) struct RepoPermissionUserExternal {
    client: bitbucket::Client,
}

impl RepoPermissionUserExternal {
    pub(crate) fn new(client: bitbucket::Client) -> Self {
        Self { client }
    }

    async fn set_permission(&self, cr: &RepoPermissionUser) -> Result<RepoPermission, ControllerError> {
        let params = &cr.spec.for_provider;
        let permission: RepoPermission = params.permission.parse()?;
        self.client
            .repos()
            .set_user_permission(
                UserPermissionOpts {
                    project_key: &params.project,
                    repo_slug: &params.repo_slug,
                    user: &params.user,
                },
                permission,
            )
            .await?;
        Ok(permission)
    }
}

#[async_trait]
impl ExternalClient<RepoPermissionUser> for RepoPermissionUserExternal {
    async fn observe(
        &self,
        cr: &mut RepoPermissionUser,
    ) -> Result<ExternalObservation, ControllerError> {
        let params = cr.spec.for_provider.clone();
        let found = self
            .client
            .repos()
            .get_user_permission(UserPermissionOpts {
                project_key: &params.project,
                repo_slug: &params.repo_slug,
                user: &params.user,
            })
            .await?;

        let Some(found) = found else {
            debug!(
                "repo permission user {}: {} has no permission on {}/{}",
                cr.name_any(),
                params.user,
                params.project,
                params.repo_slug
            );
            return Ok(ExternalObservation {
                resource_exists: false,
                resource_up_to_date: true,
            });
        };

        // An invalid level must not block deletion, update reports it.
        let resource_up_to_date = params
            .permission
            .parse::<RepoPermission>()
            .is_ok_and(|desired| desired.matches(&found.permission));
        let at_provider = cr.at_provider_mut();
        at_provider.project = Some(params.project);
        at_provider.repo_slug = Some(params.repo_slug);
        at_provider.user = Some(found.user.name);
        at_provider.permission = Some(found.permission);
        cr.set_conditions(Condition::available());
        Ok(ExternalObservation {
            resource_exists: true,
            resource_up_to_date,
        })
    }

    async fn create(&self, cr: &mut RepoPermissionUser) -> Result<(), ControllerError> {
        cr.set_conditions(Condition::creating());
        let permission = self.set_permission(cr).await?;
        debug!(
            "repo permission user {}: granted {} to {}",
            cr.name_any(),
            permission,
            cr.spec.for_provider.user
        );
        Ok(())
    }

    async fn update(&self, cr: &mut RepoPermissionUser) -> Result<(), ControllerError> {
        let permission = self.set_permission(cr).await?;
        debug!(
            "repo permission user {}: changed permission of {} to {}",
            cr.name_any(),
            cr.spec.for_provider.user,
            permission
        );
        Ok(())
    }

    async fn delete(&self, cr: &mut RepoPermissionUser) -> Result<(), ControllerError> {
        cr.set_conditions(Condition::deleting());
        let params = &cr.spec.for_provider;
        let observed = cr.at_provider().cloned().unwrap_or_default();
        let project_key = observed.project.as_deref().unwrap_or(&params.project);
        let repo_slug = observed.repo_slug.as_deref().unwrap_or(&params.repo_slug);
        let user = observed.user.as_deref().unwrap_or(&params.user);
        Ok(self
            .client
            .repos()
            .delete_user_permission(UserPermissionOpts {
                project_key,
                repo_slug,
                user,
            })
            .await?)
    }
}
