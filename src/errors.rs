use std::path::PathBuf;

use thiserror::Error;

use crate::hash::ObjectHash;

/// Errors surfaced by the versioning engine and the object store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("object {0} not found")]
    NotFound(ObjectHash),

    #[error("corrupt object {hash}: {reason}")]
    Corrupt { hash: ObjectHash, reason: String },

    #[error("repository at {} is locked by another process", .0.display())]
    Locked(PathBuf),

    #[error("merge left {0} unresolved conflict(s)")]
    MergeConflict(usize),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid operation: {0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn corrupt(hash: ObjectHash, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            hash,
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Error::Parse(reason.into())
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Error::Invalid(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
