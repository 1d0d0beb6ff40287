//! Process sandbox builder.
//!
//! Produces the isolated execution context a deployed artifact runs under: a
//! dedicated low-privilege principal, a minimal environment, an optional
//! chroot jail, and cgroup resource ceilings. The concrete capability set is
//! probed once at startup; hosts without the full primitives degrade to
//! best-effort isolation and say so.

pub mod cgroup;
pub mod jail;
pub mod principal;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::IsolationConfig;
use crate::error::Result;

pub use cgroup::CgroupLimiter;
pub use jail::{Jail, JailBuilder};
pub use principal::{principal_name, Principal, PrincipalManager};

/// What the sandbox builder needs to know about one runnable artifact.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub project_id: i64,
    pub subdomain: String,
    /// The built workspace the process starts from.
    pub working_dir: PathBuf,
    pub port: u16,
    pub secrets_env: HashMap<String, String>,
}

/// Execution descriptor handed to the launcher.
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Credentials to run under; `None` means the current user (best-effort
    /// isolation only).
    pub credentials: Option<(u32, u32)>,
    /// Complete environment. Never inherits from the parent process.
    pub env: Vec<(String, String)>,
    /// Directory the process starts in (inside the jail when one is set).
    pub run_dir: PathBuf,
    /// Chroot root, when a jail was staged.
    pub chroot: Option<PathBuf>,
}

/// How strong the selected isolation backend is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationStrength {
    /// Dedicated principal, optional jail, resource ceilings.
    Full,
    /// Current-user execution with a minimal environment only.
    BestEffort,
}

impl IsolationStrength {
    pub fn name(&self) -> &'static str {
        match self {
            IsolationStrength::Full => "full",
            IsolationStrength::BestEffort => "best-effort",
        }
    }
}

/// Capability interface over host isolation primitives.
pub trait Isolation: Send + Sync {
    fn strength(&self) -> IsolationStrength;

    /// Build the execution context for one artifact. Idempotent; principal
    /// and jail from a prior deploy are reused or restaged.
    fn create_sandbox(&self, spec: &SandboxSpec) -> Result<ExecContext>;

    /// Apply resource ceilings to a launched process. Failures are logged,
    /// never raised.
    fn apply_resource_limits(&self, subdomain: &str, pid: u32);

    /// Remove the principal, home, jail, and cgroup for a subdomain.
    /// Failures are logged, never raised.
    fn teardown(&self, subdomain: &str);
}

/// The minimal environment every deployed process gets. Explicitly not the
/// parent environment: the vault key and other ambient credentials must not
/// leak into deployed processes.
fn minimal_env(spec: &SandboxSpec, home: &str, user: &str) -> Vec<(String, String)> {
    let mut env = vec![
        ("PATH".to_string(), "/usr/bin:/bin".to_string()),
        ("HOME".to_string(), home.to_string()),
        ("USER".to_string(), user.to_string()),
        ("SHELL".to_string(), "/bin/false".to_string()),
        ("PORT".to_string(), spec.port.to_string()),
        ("PROJECT_ID".to_string(), spec.project_id.to_string()),
        ("SUBDOMAIN".to_string(), spec.subdomain.clone()),
    ];

    let mut keys: Vec<&String> = spec.secrets_env.keys().collect();
    keys.sort();
    for key in keys {
        env.push((key.clone(), spec.secrets_env[key].clone()));
    }
    env
}

/// Full isolation: dedicated principal, optional chroot jail, cgroup limits.
pub struct FullIsolation {
    principals: PrincipalManager,
    jails: JailBuilder,
    limiter: CgroupLimiter,
    enable_jail: bool,
}

impl FullIsolation {
    pub fn new(config: &IsolationConfig) -> Self {
        Self {
            principals: PrincipalManager::new(config.base_uid, &config.users_dir),
            jails: JailBuilder::new(&config.jail_dir),
            limiter: CgroupLimiter::new(config),
            enable_jail: config.enable_jail,
        }
    }
}

impl Isolation for FullIsolation {
    fn strength(&self) -> IsolationStrength {
        IsolationStrength::Full
    }

    fn create_sandbox(&self, spec: &SandboxSpec) -> Result<ExecContext> {
        // Principal creation failure is fatal to the deployment.
        let principal = self.principals.ensure(&spec.subdomain)?;

        let env = minimal_env(spec, "/tmp", &principal.name);

        // Jail staging failure is fatal only because jails were requested.
        let (run_dir, chroot) = if self.enable_jail {
            let jail = self.jails.stage(&spec.subdomain, &spec.working_dir)?;
            (jail.run_dir, Some(jail.root))
        } else {
            (spec.working_dir.clone(), None)
        };

        Ok(ExecContext {
            credentials: Some((principal.uid, principal.gid)),
            env,
            run_dir,
            chroot,
        })
    }

    fn apply_resource_limits(&self, subdomain: &str, pid: u32) {
        if self.limiter.available() {
            self.limiter.apply(subdomain, pid);
        } else {
            tracing::warn!(
                "No cgroup v2 hierarchy; resource limits not applied for {}",
                subdomain
            );
        }
    }

    fn teardown(&self, subdomain: &str) {
        self.limiter.remove(subdomain);
        self.jails.remove(subdomain);
        self.principals.remove(subdomain);
    }
}

/// Best-effort isolation for hosts without principal/jail primitives: the
/// process still gets the minimal environment, but runs as the current user
/// with no jail and no ceilings.
pub struct BestEffortIsolation;

impl Isolation for BestEffortIsolation {
    fn strength(&self) -> IsolationStrength {
        IsolationStrength::BestEffort
    }

    fn create_sandbox(&self, spec: &SandboxSpec) -> Result<ExecContext> {
        tracing::debug!(
            "Best-effort sandbox for {}: current user, no jail",
            spec.subdomain
        );
        Ok(ExecContext {
            credentials: None,
            env: minimal_env(spec, "/tmp", "nobody"),
            run_dir: spec.working_dir.clone(),
            chroot: None,
        })
    }

    fn apply_resource_limits(&self, _subdomain: &str, _pid: u32) {}

    fn teardown(&self, _subdomain: &str) {}
}

/// Select an isolation backend from host capabilities. Called once at
/// startup; the result is shared by every deployment.
pub fn probe_isolation(config: &IsolationConfig) -> Arc<dyn Isolation> {
    let mut missing: Vec<&str> = Vec::new();

    if !nix::unistd::Uid::effective().is_root() {
        missing.push("not running as root");
    }
    if !command_exists("useradd") {
        missing.push("useradd not installed");
    }
    if cfg!(not(target_os = "linux")) && config.enable_jail {
        missing.push("chroot jails require Linux");
    }

    if missing.is_empty() {
        tracing::info!("Isolation: full (principal{} + cgroups)",
            if config.enable_jail { " + jail" } else { "" });
        Arc::new(FullIsolation::new(config))
    } else {
        tracing::warn!(
            "Isolation degraded to best-effort ({}); deployed processes share the platform's user",
            missing.join(", ")
        );
        Arc::new(BestEffortIsolation)
    }
}

fn command_exists(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}
