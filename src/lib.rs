//! Slipway - single-node self-hosted deployment platform.
//!
//! Turns a git repository into a running, isolated, routable web service:
//! - Orchestrator: fetch -> build -> launch pipeline with supervision and
//!   restart-on-boot recovery
//! - Sandbox: dedicated low-privilege user, optional chroot jail, cgroup v2
//!   resource ceilings
//! - Proxy: dynamic `<subdomain>.<base-domain>` -> local-port reverse proxy
//! - Vault: AES-256-GCM project-scoped secrets injected at build and launch

pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod platform;
pub mod proxy;
pub mod sandbox;
pub mod store;
pub mod utils;
pub mod vault;

pub use config::{IsolationConfig, PlatformConfig, ProxyConfig};
pub use error::{ConfigError, Error, Outcome, Result};
pub use orchestrator::Orchestrator;
pub use platform::Platform;
pub use store::Store;
pub use vault::Vault;

/// Re-export commonly used items.
pub mod prelude {
    pub use crate::config::PlatformConfig;
    pub use crate::error::{Error, Outcome, Result};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::platform::{Platform, ProjectRequest};
    pub use crate::store::Store;
    pub use crate::vault::Vault;
}
