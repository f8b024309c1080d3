//! pdsdns
//!
//! Domain ownership verification through DNS TXT challenges, served by a
//! minimal authoritative TXT responder.
//!
//! # Architecture
//!
//! * `store` - Domains, records and verifications, in memory or on disk
//! * `verification` - Challenge issuing and the verification state machine
//! * `dns` - Wire protocol, TXT responder and outbound TXT lookups
//! * `config` - File and environment configuration
//! * `logging` - Log subscriber setup for the binaries

pub mod config;

/// DNS protocol, responder and client
pub mod dns;

pub mod logging;

/// Durable state
pub mod store;

/// Challenges, attempts and their outcomes
pub mod verification;
