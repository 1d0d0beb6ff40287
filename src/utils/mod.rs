//! Utility modules.

pub mod debug;
pub mod subdomain;

pub use debug::{init_debug_logging, SLIPWAY_DEBUG_ENV};
pub use subdomain::{generate_subdomain, is_valid_subdomain, RESERVED_LABELS};
