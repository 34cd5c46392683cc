use artifact_reconciler::{EngineError, ReconcileError};
use permission_boundary::PolicyError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::graph::ResourceNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    TransientProvider,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
            Self::TransientProvider => write!(f, "transient_provider"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StackError {
    #[error("invalid input {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },
    #[error("resource graph has a cycle through {0:?}")]
    Cycle(Vec<ResourceNode>),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl StackError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } | Self::Cycle(_) => ErrorKind::Validation,
            Self::Policy(e) if e.is_conflict() => ErrorKind::Conflict,
            Self::Policy(_) => ErrorKind::Validation,
            Self::Reconcile(e) if e.is_conflict() => ErrorKind::Conflict,
            Self::Reconcile(e) if e.is_transient() => ErrorKind::TransientProvider,
            Self::Reconcile(_) => ErrorKind::Validation,
            Self::Engine(EngineError::Conflict(_)) => ErrorKind::Conflict,
            Self::Engine(EngineError::Transient(_)) => ErrorKind::TransientProvider,
        }
    }

    /// Errors caused by the declared input or a lost race, not by the provider.
    pub fn is_rejection(&self) -> bool {
        self.kind() != ErrorKind::TransientProvider
    }
}
