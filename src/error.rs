//! Error taxonomy.
//!
//! Two layers of typed errors:
//!
//! | Type | Raised by | Meaning |
//! |------|-----------|---------|
//! | [`PortError`] | retrieval, language-model and rerank ports | one external call failed |
//! | [`PipelineError`] | [`Pipeline::process`](crate::pipeline::Pipeline::process) | the whole request failed |
//!
//! "Zero results" is never an error: ports return `Ok(vec![])` and the
//! pipeline returns a `DatasetResult` with status `no_answer`.
//!
//! Application code (config, CLI, server, tools) works in `anyhow::Result`;
//! both types convert into `anyhow::Error` at that boundary.

use thiserror::Error;

/// Failure of a single external call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PortError {
    /// The service could not be reached, refused credentials, or kept
    /// failing after the port's own retries.
    #[error("{service} unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    /// The call did not complete within the port's timeout.
    #[error("{service} request timed out")]
    Timeout { service: String },

    /// The service answered, but the payload could not be decoded or did
    /// not have the expected shape.
    #[error("{service} returned a malformed response: {reason}")]
    Malformed { service: String, reason: String },

    /// The service rejected the request (4xx other than auth/rate-limit).
    #[error("{service} rejected the request ({status}): {reason}")]
    Rejected {
        service: String,
        status: u16,
        reason: String,
    },
}

impl PortError {
    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        PortError::Unavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(service: impl Into<String>) -> Self {
        PortError::Timeout {
            service: service.into(),
        }
    }

    pub fn malformed(service: impl Into<String>, reason: impl Into<String>) -> Self {
        PortError::Malformed {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Name of the service that produced the error.
    pub fn service(&self) -> &str {
        match self {
            PortError::Unavailable { service, .. }
            | PortError::Timeout { service }
            | PortError::Malformed { service, .. }
            | PortError::Rejected { service, .. } => service,
        }
    }

    /// True when the service itself could not be used (as opposed to a bad
    /// payload for one particular call).
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            PortError::Unavailable { .. } | PortError::Timeout { .. }
        )
    }

    /// Classify a transport-level `reqwest` failure.
    pub fn from_reqwest(service: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            PortError::timeout(service)
        } else if err.is_decode() {
            PortError::malformed(service, err.to_string())
        } else {
            PortError::unavailable(service, err.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    ///
    /// 401/403/429 and 5xx mean the service cannot serve us right now;
    /// every other 4xx is a rejection of this specific request.
    pub fn from_status(service: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let reason = format!("HTTP {}: {}", status.as_u16(), truncate(body, 300));
        match status.as_u16() {
            401 | 403 | 429 => PortError::unavailable(service, reason),
            s if s >= 500 => PortError::unavailable(service, reason),
            s => PortError::Rejected {
                service: service.to_string(),
                status: s,
                reason,
            },
        }
    }
}

/// Failure of a whole `process` request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// Request configuration rejected before any external call.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A retrieval or model service could not be used.
    #[error("backend unavailable: {service}: {reason}")]
    BackendUnavailable { service: String, reason: String },

    /// A required external response could not be interpreted.
    #[error("malformed response from {service}: {reason}")]
    Malformed { service: String, reason: String },
}

impl From<PortError> for PipelineError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Malformed { service, reason } => {
                PipelineError::Malformed { service, reason }
            }
            PortError::Timeout { service } => PipelineError::BackendUnavailable {
                service,
                reason: "request timed out".to_string(),
            },
            PortError::Unavailable { service, reason } => {
                PipelineError::BackendUnavailable { service, reason }
            }
            PortError::Rejected {
                service,
                status,
                reason,
            } => PipelineError::BackendUnavailable {
                service,
                reason: format!("rejected ({}): {}", status, reason),
            },
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let e = PortError::from_status("llm", reqwest::StatusCode::TOO_MANY_REQUESTS, "slow");
        assert!(e.is_unreachable());
        let e = PortError::from_status("llm", reqwest::StatusCode::BAD_GATEWAY, "");
        assert!(e.is_unreachable());
        let e = PortError::from_status("llm", reqwest::StatusCode::BAD_REQUEST, "bad");
        assert!(matches!(e, PortError::Rejected { status: 400, .. }));
        assert!(!e.is_unreachable());
    }

    #[test]
    fn unavailable_maps_to_backend_unavailable() {
        let err: PipelineError = PortError::unavailable("retrieval", "connection refused").into();
        assert_eq!(
            err,
            PipelineError::BackendUnavailable {
                service: "retrieval".to_string(),
                reason: "connection refused".to_string(),
            }
        );
    }

    #[test]
    fn timeout_message_is_classifiable() {
        let e = PortError::timeout("llm");
        assert_eq!(e.service(), "llm");
        assert!(e.to_string().contains("timed out"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ab", 10), "ab");
    }
}
