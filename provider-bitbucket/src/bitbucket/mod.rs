//! A tiny Bitbucket Server REST client, just enough to manage repositories
//! and their user permissions.

mod repos;
mod validator;

pub(crate) use repos::*;
pub(crate) use validator::StatusError;

/// Path prefix of every REST call, relative to the API base URL.
const API_PATH: [&str; 3] = ["rest", "api", "1.0"];

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    /// Bitbucket answered with an unexpected status code.
    #[error(transparent)]
    Status(#[from] StatusError),
    /// Transport level failure.
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid API base URL {0}")]
    InvalidBaseUrl(String),
    #[error("invalid permission {0:?}, expected one of REPO_READ, REPO_WRITE, REPO_ADMIN")]
    InvalidPermission(String),
}

#[cfg_attr(test, derive(Debug))]
pub(crate) struct ClientOpts {
    pub api_base_url: String,
    pub token: String,
    /// Use basic auth with this user name instead of bearer auth.
    pub username: Option<String>,
    /// Log every request and response.
    pub verbose: bool,
    /// Defaults to a plain `reqwest::Client`.
    pub http_client: Option<reqwest::Client>,
}

#[derive(Clone)]
pub(crate) struct Client {
    repos: RepoService,
}

impl Client {
    pub fn new(opts: ClientOpts) -> Self {
        let http_client = opts.http_client.unwrap_or_default();
        let auth = match opts.username {
            Some(username) => Auth::Basic {
                username,
                password: opts.token,
            },
            None => Auth::Bearer(opts.token),
        };
        Self {
            repos: RepoService::new(http_client, opts.api_base_url, auth, opts.verbose),
        }
    }

    pub fn repos(&self) -> &RepoService {
        &self.repos
    }
}

#[derive(Clone)]
pub(crate) enum Auth {
    Bearer(String),
    Basic { username: String, password: String },
}

impl Auth {
    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }
}
