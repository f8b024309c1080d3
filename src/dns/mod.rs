//! DNS Protocol Implementation
//!
//! This module provides the DNS side of the service:
//! * DNS packet parsing and serialization
//! * An authoritative responder answering TXT queries from the record store
//! * An outbound client used to look up published TXT records
//! * Both UDP and TCP transport protocols
//!
//! # Module Structure
//!
//! * `protocol` - DNS protocol definitions and packet handling
//! * `server` - UDP and TCP server implementations
//! * `responder` - Start/stop service wrapping both servers
//! * `client` - DNS client for outgoing queries
//! * `resolver` - TXT lookups on top of the client
//! * `context` - Server configuration and shared state
//! * `buffer` - Low-level packet buffer operations

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// DNS client for making outgoing queries
pub mod client;

/// Server configuration and shared state management
pub mod context;

/// Network utilities for DNS operations
pub mod netutil;

/// DNS protocol definitions, packet structures, and serialization
pub mod protocol;

/// Outbound TXT lookups
pub mod resolver;

/// Responder lifecycle
pub mod responder;

/// UDP and TCP DNS server implementations
pub mod server;
