use std::fmt;

use reqwest::Response;
use serde::Deserialize;

/// Error envelope returned by Bitbucket Server on failed requests.
#[derive(Deserialize, Debug, Default)]
struct BitbucketError {
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    exception_name: Option<String>,
}

/// A response with an unexpected HTTP status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusError {
    pub code: u16,
    /// The first error message reported by the server, if any.
    pub message: Option<String>,
}

impl StatusError {
    pub(crate) fn is_not_found(&self) -> bool {
        self.code == 404
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => f.write_str(message),
            None => write!(f, "unexpected status: {}", self.code),
        }
    }
}

impl std::error::Error for StatusError {}

/// Pass the response through if its status is one of `accept`, otherwise
/// turn it into a [`StatusError`] carrying the server supplied message.
pub(crate) async fn error_handler(
    response: Response,
    accept: &[u16],
) -> Result<Response, StatusError> {
    let code = response.status().as_u16();
    if accept.contains(&code) {
        return Ok(response);
    }
    match response.bytes().await {
        Ok(body) => Err(status_error(code, &body)),
        Err(e) => Err(StatusError {
            code,
            message: Some(e.to_string()),
        }),
    }
}

pub(crate) fn status_error(code: u16, body: &[u8]) -> StatusError {
    if body.is_empty() {
        return StatusError {
            code,
            message: None,
        };
    }
    let envelope: BitbucketError = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("status {} with undecodable error body: {}", code, e);
            return StatusError {
                code,
                message: None,
            };
        }
    };
    let message = envelope.errors.into_iter().next().and_then(|detail| {
        debug!(
            "status {}: {} (context: {}, exception: {})",
            code,
            detail.message.as_deref().unwrap_or(""),
            detail.context.as_deref().unwrap_or("-"),
            detail.exception_name.as_deref().unwrap_or("-"),
        );
        detail.message.filter(|m| !m.is_empty())
    });
    StatusError { code, message }
}
