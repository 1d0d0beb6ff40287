//! Dedicated low-privilege principals for deployed processes.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// Highest offset above the base UID the allocator will scan.
const UID_SAFETY_LIMIT: u32 = 10_000;

/// A dedicated system user owning one deployment.
#[derive(Debug, Clone)]
pub struct Principal {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Deterministic principal name for a subdomain.
pub fn principal_name(subdomain: &str) -> String {
    format!("deploy-{}", subdomain)
}

/// Creates and removes per-subdomain system users.
pub struct PrincipalManager {
    base_uid: u32,
    users_dir: PathBuf,
}

impl PrincipalManager {
    pub fn new(base_uid: u32, users_dir: &Path) -> Self {
        Self {
            base_uid,
            users_dir: users_dir.to_path_buf(),
        }
    }

    /// Get or create the principal for a subdomain. Idempotent: an existing
    /// user is reused as-is.
    pub fn ensure(&self, subdomain: &str) -> Result<Principal> {
        let name = principal_name(subdomain);
        let home = self.users_dir.join(&name);

        if let Some(existing) = lookup_user(&name)? {
            tracing::debug!("Reusing principal {} (uid {})", name, existing.uid);
            return Ok(existing);
        }

        let uid = self.next_free_uid()?;
        std::fs::create_dir_all(&home)?;

        let status = Command::new("useradd")
            .args(["--uid", &uid.to_string()])
            .args(["--home-dir", &home.display().to_string()])
            .args(["--shell", "/bin/false"])
            .arg("--no-create-home")
            .arg("--system")
            .arg("--user-group")
            .arg(&name)
            .status()
            .map_err(|e| Error::ResourceAllocation(format!("useradd not runnable: {}", e)))?;

        if !status.success() {
            return Err(Error::ResourceAllocation(format!(
                "useradd for '{}' exited with {}",
                name, status
            )));
        }

        let created = lookup_user(&name)?.ok_or_else(|| {
            Error::ResourceAllocation(format!("principal '{}' missing after useradd", name))
        })?;

        nix::unistd::chown(
            &created.home,
            Some(nix::unistd::Uid::from_raw(created.uid)),
            Some(nix::unistd::Gid::from_raw(created.gid)),
        )
        .map_err(|e| Error::ResourceAllocation(format!("chown of {} failed: {}", name, e)))?;

        tracing::info!(
            "Created principal {} (uid {}, gid {})",
            created.name,
            created.uid,
            created.gid
        );
        Ok(created)
    }

    /// Remove the principal and its home directory. Best-effort.
    pub fn remove(&self, subdomain: &str) {
        let name = principal_name(subdomain);

        match Command::new("userdel").arg(&name).status() {
            Ok(status) if status.success() => {
                tracing::debug!("Removed principal {}", name);
            }
            Ok(status) => {
                tracing::warn!("userdel for '{}' exited with {}", name, status);
            }
            Err(e) => {
                tracing::warn!("userdel for '{}' not runnable: {}", name, e);
            }
        }

        let home = self.users_dir.join(&name);
        if let Err(e) = std::fs::remove_dir_all(&home) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove home {}: {}", home.display(), e);
            }
        }
    }

    /// First UID at or above the base that no user holds, bounded by the
    /// safety limit.
    fn next_free_uid(&self) -> Result<u32> {
        for uid in self.base_uid..self.base_uid + UID_SAFETY_LIMIT {
            let taken = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
                .map_err(|e| Error::ResourceAllocation(format!("uid lookup failed: {}", e)))?
                .is_some();
            if !taken {
                return Ok(uid);
            }
        }
        Err(Error::ResourceAllocation(format!(
            "no free UID in {}..{}",
            self.base_uid,
            self.base_uid + UID_SAFETY_LIMIT
        )))
    }
}

fn lookup_user(name: &str) -> Result<Option<Principal>> {
    let user = nix::unistd::User::from_name(name)
        .map_err(|e| Error::ResourceAllocation(format!("user lookup failed: {}", e)))?;

    Ok(user.map(|u| Principal {
        name: name.to_string(),
        uid: u.uid.as_raw(),
        gid: u.gid.as_raw(),
        home: u.dir,
    }))
}
