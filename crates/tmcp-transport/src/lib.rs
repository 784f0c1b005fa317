//! Transport abstractions for TMCP.
//!
//! A transport only moves opaque sealed envelopes between two endpoints. The
//! kind of transport a peer supports is advertised in its DID document and
//! selected at runtime through [`TransportKind`].

pub mod traits;
pub mod framing;
pub mod address;
pub mod testing;

pub use traits::*;
pub use framing::*;
pub use address::*;
pub use testing::*;
