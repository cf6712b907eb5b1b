//! crates/domains/src/lib.rs
//!
//! The central domain types and interface definitions of the forum core.
//! No I/O lives here.

pub mod error;
pub mod ids;
pub mod ip_history;
pub mod models;
pub mod ports;
pub mod updates;

// Re-exporting for easier access in other crates
pub use error::*;
pub use ids::*;
pub use ip_history::*;
pub use models::*;
pub use ports::*;
pub use updates::*;
