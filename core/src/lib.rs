//! Core utilities and shared types for the exporter: daemon endpoints and the gauge model.

pub mod metrics;
pub mod transport;

pub use transport::{Connection, Endpoint, Scheme};

/// The standard antivirus test file; harmless, but every engine flags it.
pub const EICAR: &[u8] = br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
