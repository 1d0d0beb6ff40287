//! Resource ceilings through cgroup v2, keyed by subdomain.
//!
//! All operations here are best-effort: a platform without a writable cgroup
//! hierarchy gets warnings, never deployment failures.

use std::path::{Path, PathBuf};

use crate::config::IsolationConfig;

/// Default unified hierarchy mount point.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Parent group holding all per-subdomain groups.
const GROUP_PARENT: &str = "slipway";

/// Applies memory/CPU/pids ceilings to running instances.
pub struct CgroupLimiter {
    root: PathBuf,
    memory_limit_bytes: u64,
    cpu_quota_us: u64,
    pids_limit: u32,
}

impl CgroupLimiter {
    pub fn new(config: &IsolationConfig) -> Self {
        Self::with_root(Path::new(CGROUP_ROOT), config)
    }

    /// Test hook: operate on an arbitrary directory instead of the real
    /// hierarchy.
    pub fn with_root(root: &Path, config: &IsolationConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            memory_limit_bytes: config.memory_limit_bytes,
            cpu_quota_us: config.cpu_quota_us,
            pids_limit: config.pids_limit,
        }
    }

    /// Whether a cgroup v2 hierarchy is present at the root.
    pub fn available(&self) -> bool {
        self.root.join("cgroup.controllers").exists()
    }

    fn group_path(&self, subdomain: &str) -> PathBuf {
        self.root.join(GROUP_PARENT).join(subdomain)
    }

    /// Create the subdomain's group, set ceilings, and attach the pid.
    pub fn apply(&self, subdomain: &str, pid: u32) {
        let group = self.group_path(subdomain);
        if let Err(e) = std::fs::create_dir_all(&group) {
            tracing::warn!("Failed to create cgroup {}: {}", group.display(), e);
            return;
        }

        // cpu.max takes "<quota> <period>"; period is the kernel default.
        let settings = [
            ("memory.max", self.memory_limit_bytes.to_string()),
            ("cpu.max", format!("{} 100000", self.cpu_quota_us)),
            ("pids.max", self.pids_limit.to_string()),
            ("cgroup.procs", pid.to_string()),
        ];

        for (file, value) in settings {
            let path = group.join(file);
            if let Err(e) = std::fs::write(&path, &value) {
                tracing::warn!("Failed to write {}: {}", path.display(), e);
            }
        }

        tracing::debug!("Applied resource limits for {} (pid {})", subdomain, pid);
    }

    /// Remove the subdomain's group. Best-effort; a group with live members
    /// cannot be removed and is logged.
    pub fn remove(&self, subdomain: &str) {
        let group = self.group_path(subdomain);
        // cgroup directories only respond to rmdir, not recursive deletion.
        if let Err(e) = std::fs::remove_dir(&group) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove cgroup {}: {}", group.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> IsolationConfig {
        IsolationConfig {
            memory_limit_bytes: 1024,
            cpu_quota_us: 25_000,
            pids_limit: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_writes_settings() {
        let root = tempfile::tempdir().unwrap();
        // Fake hierarchy marker so available() reflects the fixture.
        std::fs::write(root.path().join("cgroup.controllers"), "cpu memory pids").unwrap();

        let limiter = CgroupLimiter::with_root(root.path(), &test_config());
        assert!(limiter.available());

        limiter.apply("demo-ab12", 4242);

        let group = root.path().join("slipway/demo-ab12");
        assert_eq!(std::fs::read_to_string(group.join("memory.max")).unwrap(), "1024");
        assert_eq!(std::fs::read_to_string(group.join("cpu.max")).unwrap(), "25000 100000");
        assert_eq!(std::fs::read_to_string(group.join("pids.max")).unwrap(), "10");
        assert_eq!(std::fs::read_to_string(group.join("cgroup.procs")).unwrap(), "4242");
    }

    #[test]
    fn test_remove_is_silent_when_missing() {
        let root = tempfile::tempdir().unwrap();
        let limiter = CgroupLimiter::with_root(root.path(), &test_config());
        // Must not panic or error.
        limiter.remove("never-created");
    }

    #[test]
    fn test_unavailable_without_marker() {
        let root = tempfile::tempdir().unwrap();
        let limiter = CgroupLimiter::with_root(root.path(), &test_config());
        assert!(!limiter.available());
    }
}
