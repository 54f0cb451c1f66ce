//! Crate error type

use std::fmt;

use thiserror::Error;

use crate::cloud::{CloudError, ResourceKind};

/// The pool an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    NodePool,
    HealthChecks,
    Backends,
    LoadBalancers,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NodePool => "node pool",
            Self::HealthChecks => "health checks",
            Self::Backends => "backends",
            Self::LoadBalancers => "load balancers",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{pool}: {operation} {kind} {resource}: {source}")]
    Cloud {
        pool: Pool,
        operation: &'static str,
        kind: ResourceKind,
        resource: String,
        #[source]
        source: CloudError,
    },

    /// A programming or ordering error; retrying will not help
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("sync cancelled before {0}")]
    Cancelled(String),

    #[error("sync deadline exceeded before {0}")]
    DeadlineExceeded(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("desired state error: {0}")]
    State(String),
}

impl Error {
    pub fn cloud(
        pool: Pool,
        operation: &'static str,
        kind: ResourceKind,
        resource: impl Into<String>,
        source: CloudError,
    ) -> Self {
        Self::Cloud {
            pool,
            operation,
            kind,
            resource: resource.into(),
            source,
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// The provider error behind this error, if any
    pub fn cloud_error(&self) -> Option<&CloudError> {
        match self {
            Self::Cloud { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.cloud_error().is_some_and(CloudError::is_not_found)
    }

    pub fn is_in_use(&self) -> bool {
        self.cloud_error().is_some_and(CloudError::is_in_use)
    }

    /// Whether a later attempt of the same cycle may succeed.
    ///
    /// Provider 4xx validation errors are surfaced verbatim and not retried,
    /// except NotFound and Conflict, which indicate a race with concurrent
    /// state and converge on the next attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cloud { source, .. } => {
                source.is_transient() || source.is_not_found() || source.is_conflict()
            }
            Self::DeadlineExceeded(_) => true,
            Self::InvariantViolation(_)
            | Self::Cancelled(_)
            | Self::Config(_)
            | Self::State(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
