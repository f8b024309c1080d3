//! durable state shared by the responder and the verification engine

pub mod memory;
pub mod model;

use std::fmt;

use uuid::Uuid;

pub use self::memory::MemoryStore;
pub use self::model::{Domain, Record, RecordType, ServiceType, Verification, VerificationStatus};

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "store I/O error: {}", e),
            StoreError::Serialization(e) => write!(f, "store snapshot is invalid: {}", e),
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::Conflict(what) => write!(f, "conflict: {}", what),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A TXT value ready to be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtAnswer {
    pub value: String,
    pub ttl: u32,
}

/// Records and domains. The responder only ever reads through this.
pub trait RecordStore: Send + Sync {
    /// Active TXT records whose fully qualified name equals `name`,
    /// compared case-insensitively and ignoring a trailing dot
    fn find_active_txt_records(&self, name: &str) -> Result<Vec<TxtAnswer>>;

    fn find_records_for_domain(&self, domain_id: Uuid) -> Result<Vec<Record>>;

    fn insert_record(&self, record: Record) -> Result<Record>;

    fn set_record_active(&self, record_id: Uuid, active: bool) -> Result<Record>;

    fn find_domain_by_name(&self, name: &str) -> Result<Option<Domain>>;

    /// Insert the domain unless one with the same name exists, returning the stored row
    fn insert_domain(&self, domain: Domain) -> Result<Domain>;

    fn list_domains(&self) -> Result<Vec<Domain>>;

    /// Set or clear the verified flag of a domain
    fn set_domain_verified(&self, name: &str, verified: bool) -> Result<Domain>;
}

/// Verification rows. Only the engine writes status and attempts.
pub trait VerificationStore: Send + Sync {
    fn get_verification(&self, id: Uuid) -> Result<Option<Verification>>;

    fn find_by_token(&self, token: &str) -> Result<Option<Verification>>;

    fn find_by_domain(&self, domain: &str) -> Result<Vec<Verification>>;

    /// Insert `candidate` as pending unless a pending verification already
    /// exists for the same (domain, service_id), in which case that one is
    /// returned untouched. The check and the insert are atomic.
    fn insert_pending_verification(&self, candidate: Verification) -> Result<Verification>;

    /// Insert a row as is, used for rows born terminal
    fn insert_verification(&self, verification: Verification) -> Result<Verification>;

    /// Replace the stored row with `new` only when its status and attempts
    /// still equal those of `expected`. Returns whether the swap happened.
    fn compare_and_swap_verification(
        &self,
        expected: &Verification,
        new: &Verification,
    ) -> Result<bool>;

    fn list_pending(&self) -> Result<Vec<Verification>>;

    /// Drop every verification of the domain, returning how many went away
    fn delete_for_domain(&self, domain: &str) -> Result<usize>;
}
