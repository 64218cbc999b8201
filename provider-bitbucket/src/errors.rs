use crate::bitbucket;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// The `ProviderConfig` is missing, invalid or refers to missing
    /// credentials. Fixing it needs a human, so retries are slowed down.
    #[error("{0}")]
    ProviderConfig(String),
    /// The managed resource spec cannot be turned into a Bitbucket request.
    #[error("{0}")]
    InvalidSpec(String),
    /// Bitbucket REST API error
    #[error("{0}")]
    Bitbucket(#[from] bitbucket::Error),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::ProviderConfig(_) | ControllerError::InvalidSpec(_) => false,
            ControllerError::Bitbucket(bitbucket::Error::InvalidBaseUrl(_))
            | ControllerError::Bitbucket(bitbucket::Error::InvalidPermission(_)) => false,
            _ => true,
        }
    }

    /// Short label used for the `reason` dimension of error metrics.
    pub(crate) fn metric_label(&self) -> &'static str {
        match self {
            ControllerError::ProviderConfig(_) => "provider_config",
            ControllerError::InvalidSpec(_) => "invalid_spec",
            ControllerError::Bitbucket(_) => "bitbucket",
            ControllerError::KubeApi(_) => "kube_api",
            ControllerError::Serde(_) => "serde",
            ControllerError::Any(_) => "other",
        }
    }
}
