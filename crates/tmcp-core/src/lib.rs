//! TMCP Core - the bridge between an RPC protocol and a trust transport.
//!
//! This crate implements:
//! - Identity store with key custody and durable backends
//! - DID document registry contract and a caching resolver
//! - Transport selection by advertised transport kind
//! - Envelope sealing, sender verification and in-order delivery
//! - Session state machine and session manager
//! - Message routing to a protocol handler

#![forbid(unsafe_code)]

// Core state machines
pub mod identity;
pub mod session;

// Services
pub mod resolver;
pub mod transport;
pub mod engine;
pub mod codec;
pub mod router;

// Infrastructure
pub mod did;
pub mod store;
pub mod file_store;
pub mod config;
pub mod shutdown;

// Supporting modules
pub mod errors;
pub mod types;
pub mod keys;
pub mod harness;

// Optional registry client
#[cfg(feature = "http-registry")]
pub mod http_registry;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

#[cfg(test)]
mod proptests;

pub use config::BridgeConfig;
pub use errors::{BridgeError, ErrorCategory, ErrorKind, SessionFailure};
pub use identity::IdentityStore;
pub use resolver::DidResolver;
pub use session::{Session, SessionManager};
pub use types::{Advertisement, Identity, KeyHandle, PeerDocument, SessionState};
