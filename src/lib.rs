pub mod agent;
pub mod comms;
pub mod error;
pub mod security;
pub mod transport;
pub mod uma;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
