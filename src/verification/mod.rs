//! domain ownership verification through DNS TXT challenges

pub mod challenge;
pub mod engine;
pub mod evidence;
pub mod machine;
pub mod notify;
pub mod scheduler;

use std::fmt;

use crate::store::model::VerificationStatus;
use crate::store::StoreError;

pub use self::engine::{
    AttemptOutcome, Challenge, Completion, EngineSettings, ExternalOutcome, ResetOutcome,
    VerificationEngine, VerificationRef,
};

#[derive(Debug)]
pub enum VerificationError {
    InvalidDomain(String),
    NotFound(String),
    ServiceMismatch,
    AlreadyTerminal(VerificationStatus),
    Store(StoreError),
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationError::InvalidDomain(domain) => write!(f, "invalid domain: {}", domain),
            VerificationError::NotFound(what) => write!(f, "{} not found", what),
            VerificationError::ServiceMismatch => {
                write!(f, "service id does not match the verification")
            }
            VerificationError::AlreadyTerminal(status) => {
                write!(f, "verification is already {}", status)
            }
            VerificationError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for VerificationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VerificationError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for VerificationError {
    fn from(e: StoreError) -> Self {
        VerificationError::Store(e)
    }
}

pub type Result<T> = std::result::Result<T, VerificationError>;
