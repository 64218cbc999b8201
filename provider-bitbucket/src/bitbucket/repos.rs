use std::{fmt, str::FromStr};

use reqwest::{
    RequestBuilder, Url,
    multipart::{Form, Part},
};
use serde::Deserialize;
use serde_json::json;

use super::{API_PATH, Auth, Error, validator::error_handler};

const DEFAULT_BRANCH: &'static str = "main";

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Repository {
    pub name: String,
    #[serde(default)]
    pub scm_id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub project: ProjectRef,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct ProjectRef {
    pub key: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct UserPermission {
    pub user: UserRef,
    pub permission: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct UserRef {
    pub name: String,
}

#[derive(Deserialize, Debug, Default)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
}

/// Repository level permission of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RepoPermission {
    Read,
    Write,
    Admin,
}

impl RepoPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoPermission::Read => "REPO_READ",
            RepoPermission::Write => "REPO_WRITE",
            RepoPermission::Admin => "REPO_ADMIN",
        }
    }

    /// Whether a permission string reported by Bitbucket grants this level.
    pub fn matches(&self, observed: &str) -> bool {
        observed.ends_with(self.as_str())
    }
}

impl fmt::Display for RepoPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `read`, `write`, `admin` with or without the `REPO_` prefix, in
/// any case.
impl FromStr for RepoPermission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        match upper.strip_prefix("REPO_").unwrap_or(upper.as_str()) {
            "READ" => Ok(RepoPermission::Read),
            "WRITE" => Ok(RepoPermission::Write),
            "ADMIN" => Ok(RepoPermission::Admin),
            _ => Err(Error::InvalidPermission(s.to_string())),
        }
    }
}

pub(crate) struct GetRepoOpts<'a> {
    pub project_key: &'a str,
    pub repo_slug: &'a str,
}

pub(crate) struct CreateRepoOpts<'a> {
    pub project_key: &'a str,
    pub name: &'a str,
    pub public: bool,
    /// Defaults to `main`.
    pub default_branch: Option<&'a str>,
}

pub(crate) struct RepoInitOpts<'a> {
    pub project_key: &'a str,
    pub repo_slug: &'a str,
    /// README heading, defaults to the repository slug.
    pub title: Option<&'a str>,
}

pub(crate) struct UserPermissionOpts<'a> {
    pub project_key: &'a str,
    pub repo_slug: &'a str,
    pub user: &'a str,
}

/// Repository and repository permission endpoints.
#[derive(Clone)]
pub(crate) struct RepoService {
    client: reqwest::Client,
    api_base_url: String,
    auth: Auth,
    verbose: bool,
}

impl RepoService {
    pub(super) fn new(client: reqwest::Client, api_base_url: String, auth: Auth, verbose: bool) -> Self {
        Self {
            client,
            api_base_url,
            auth,
            verbose,
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = Url::parse(&self.api_base_url)
            .map_err(|e| Error::InvalidBaseUrl(format!("{}: {}", self.api_base_url, e)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| Error::InvalidBaseUrl(self.api_base_url.clone()))?;
            path.pop_if_empty().extend(API_PATH).extend(segments);
        }
        Ok(url)
    }

    fn repo_url(&self, project_key: &str, repo_slug: &str, rest: &[&str]) -> Result<Url, Error> {
        let mut segments = vec!["projects", project_key, "repos", repo_slug];
        segments.extend_from_slice(rest);
        self.url(&segments)
    }

    /// Send the request and return the response body if the status code is
    /// one of `accept`.
    async fn fetch(&self, request: RequestBuilder, accept: &[u16]) -> Result<Vec<u8>, Error> {
        let request = self.auth.apply(request).build()?;
        let method = request.method().clone();
        let url = request.url().clone();
        if self.verbose {
            info!("--> {} {}", method, url);
        }
        let response = self.client.execute(request).await?;
        let response = match error_handler(response, accept).await {
            Ok(response) => response,
            Err(e) => {
                if self.verbose {
                    info!("<-- {} {} {}: {}", e.code, method, url, e);
                }
                return Err(e.into());
            }
        };
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        if self.verbose {
            info!(
                "<-- {} {} {}: {}",
                status.as_u16(),
                method,
                url,
                String::from_utf8_lossy(&body)
            );
        }
        Ok(body)
    }

    /// Get a single repository, `None` if it does not exist.
    ///
    /// https://docs.atlassian.com/bitbucket-server/rest/7.6.13/bitbucket-rest.html#idp175
    pub async fn get(&self, opts: GetRepoOpts<'_>) -> Result<Option<Repository>, Error> {
        let url = self.repo_url(opts.project_key, opts.repo_slug, &[])?;
        match self.fetch(self.client.get(url), &[200]).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(Error::Status(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// https://docs.atlassian.com/bitbucket-server/rest/7.6.13/bitbucket-rest.html#idp174
    pub async fn create(&self, opts: CreateRepoOpts<'_>) -> Result<Repository, Error> {
        let url = self.url(&["projects", opts.project_key, "repos"])?;
        let body = json!({
            "name": opts.name,
            "public": opts.public,
            "defaultBranch": opts.default_branch.unwrap_or(DEFAULT_BRANCH),
        });
        let body = self.fetch(self.client.post(url).json(&body), &[201]).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Commit a `README.md` to the default branch so the repository is not
    /// empty.
    pub async fn init(&self, opts: RepoInitOpts<'_>) -> Result<(), Error> {
        let url = self.repo_url(opts.project_key, opts.repo_slug, &["browse", "README.md"])?;
        let title = opts.title.filter(|t| !t.is_empty()).unwrap_or(opts.repo_slug);
        let content = Part::bytes(format!("# {}", title).into_bytes())
            .file_name("README.md")
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text("message", "first commit")
            .text("branch", DEFAULT_BRANCH)
            .part("content", content);
        self.fetch(self.client.put(url).multipart(form), &[200, 201])
            .await?;
        Ok(())
    }

    /// Delete a repository, succeeds if it does not exist.
    pub async fn delete(&self, project_key: &str, repo_slug: &str) -> Result<(), Error> {
        let url = self.repo_url(project_key, repo_slug, &[])?;
        match self.fetch(self.client.delete(url), &[200, 202, 204]).await {
            Ok(_) => Ok(()),
            Err(Error::Status(e)) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// https://docs.atlassian.com/bitbucket-server/rest/7.6.13/bitbucket-rest.html#idp286
    pub async fn set_user_permission(
        &self,
        opts: UserPermissionOpts<'_>,
        permission: RepoPermission,
    ) -> Result<(), Error> {
        let url = self.repo_url(opts.project_key, opts.repo_slug, &["permissions", "users"])?;
        let request = self
            .client
            .put(url)
            .query(&[("name", opts.user), ("permission", permission.as_str())]);
        match self.fetch(request, &[200, 204]).await {
            Ok(_) => Ok(()),
            Err(Error::Status(e)) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The permission granted to exactly `opts.user`, `None` if the user has
    /// no explicit permission on the repository.
    pub async fn get_user_permission(
        &self,
        opts: UserPermissionOpts<'_>,
    ) -> Result<Option<UserPermission>, Error> {
        let url = self.repo_url(opts.project_key, opts.repo_slug, &["permissions", "users"])?;
        let request = self.client.get(url).query(&[("filter", opts.user)]);
        let page: Page<UserPermission> = match self.fetch(request, &[200]).await {
            Ok(body) => serde_json::from_slice(&body)?,
            Err(Error::Status(e)) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        // `filter` is a substring match
        Ok(page
            .values
            .into_iter()
            .find(|p| p.user.name.eq_ignore_ascii_case(opts.user)))
    }

    pub async fn delete_user_permission(&self, opts: UserPermissionOpts<'_>) -> Result<(), Error> {
        let url = self.repo_url(opts.project_key, opts.repo_slug, &["permissions", "users"])?;
        let request = self.client.delete(url).query(&[("name", opts.user)]);
        match self.fetch(request, &[200, 204]).await {
            Ok(_) => Ok(()),
            Err(Error::Status(e)) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
