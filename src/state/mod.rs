//! Persistent datasource state
//!
//! - Directory layout (`paths`)
//! - Customization marker files (`marker`)

pub mod marker;
pub mod paths;

pub use marker::MarkerStore;
pub use paths::OvfPaths;
