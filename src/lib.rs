pub mod analytics;
pub mod authorization;
pub mod security;
pub mod server;
pub mod store;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
