//! Chroot jail staging: artifact, resolved dynamic dependencies, device stubs.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// A staged jail. The process chroots into `root` and runs in `/app`.
#[derive(Debug, Clone)]
pub struct Jail {
    pub root: PathBuf,
    /// Working directory inside the jail, relative to its root.
    pub run_dir: PathBuf,
}

/// Stages minimal chroot jails under a base directory.
pub struct JailBuilder {
    jail_dir: PathBuf,
}

impl JailBuilder {
    pub fn new(jail_dir: &Path) -> Self {
        Self {
            jail_dir: jail_dir.to_path_buf(),
        }
    }

    /// Stage a jail for a subdomain from its built workspace. Restaging an
    /// existing jail replaces its contents.
    pub fn stage(&self, subdomain: &str, workspace: &Path) -> Result<Jail> {
        let root = self.jail_dir.join(subdomain);
        let app_dir = root.join("app");

        // Restage from scratch so stale artifacts never survive a redeploy.
        if app_dir.exists() {
            std::fs::remove_dir_all(&app_dir)?;
        }
        for dir in ["app", "tmp", "dev", "proc"] {
            std::fs::create_dir_all(root.join(dir))?;
        }

        copy_tree(workspace, &app_dir)?;
        self.stage_libraries(&root, &app_dir)?;
        create_device_stubs(&root)?;

        Ok(Jail {
            root,
            run_dir: PathBuf::from("/app"),
        })
    }

    /// Remove a subdomain's jail. Best-effort.
    pub fn remove(&self, subdomain: &str) {
        let root = self.jail_dir.join(subdomain);
        if let Err(e) = std::fs::remove_dir_all(&root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove jail {}: {}", root.display(), e);
            }
        }
    }

    /// Copy each staged executable's dynamic dependencies into the jail,
    /// preserving their absolute paths. Dependencies are resolved per binary
    /// from `ldd` output; static binaries stage nothing.
    fn stage_libraries(&self, root: &Path, app_dir: &Path) -> Result<()> {
        for binary in find_executables(app_dir)? {
            for lib in resolve_dynamic_deps(&binary) {
                let dest = root.join(lib.strip_prefix("/").unwrap_or(&lib));
                if dest.exists() {
                    continue;
                }
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if let Err(e) = std::fs::copy(&lib, &dest) {
                    tracing::warn!("Failed to stage library {}: {}", lib.display(), e);
                }
            }
        }
        Ok(())
    }
}

/// Executable regular files in the top level of a directory.
fn find_executables(dir: &Path) -> Result<Vec<PathBuf>> {
    use std::os::unix::fs::PermissionsExt;

    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
            out.push(entry.path());
        }
    }
    Ok(out)
}

/// Parse `ldd` output into the set of shared objects a binary loads. The
/// loader line (`/lib64/ld-linux-*.so`) has no `=>` and is included too.
/// Returns nothing when `ldd` is unavailable or the binary is static.
fn resolve_dynamic_deps(binary: &Path) -> Vec<PathBuf> {
    let output = match Command::new("ldd").arg(binary).output() {
        Ok(out) if out.status.success() => out,
        _ => return Vec::new(),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ldd_output(&stdout)
}

fn parse_ldd_output(output: &str) -> Vec<PathBuf> {
    let mut deps = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        // "libc.so.6 => /lib/x86_64-linux-gnu/libc.so.6 (0x...)" or
        // "/lib64/ld-linux-x86-64.so.2 (0x...)"
        let candidate = match line.split_once("=>") {
            Some((_, rhs)) => rhs.trim(),
            None => line,
        };
        if let Some(path) = candidate.split_whitespace().next() {
            if path.starts_with('/') {
                deps.push(PathBuf::from(path));
            }
        }
    }
    deps
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            // Skip VCS metadata; the jail only needs the built artifact.
            if entry.file_name() == ".git" {
                continue;
            }
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
        // Symlinks are skipped: anything they point at outside the workspace
        // would dangle inside the jail.
    }
    Ok(())
}

/// Create /dev/null and /dev/zero inside the jail.
#[cfg(target_os = "linux")]
fn create_device_stubs(root: &Path) -> Result<()> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    for (name, minor) in [("null", 3), ("zero", 5)] {
        let path = root.join("dev").join(name);
        if path.exists() {
            continue;
        }
        mknod(
            &path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(1, minor),
        )
        .map_err(|e| Error::ResourceAllocation(format!("mknod /dev/{} failed: {}", name, e)))?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn create_device_stubs(_root: &Path) -> Result<()> {
    Err(Error::ResourceAllocation(
        "device stubs require Linux".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ldd_output() {
        let output = "\
\tlinux-vdso.so.1 (0x00007ffd8a9f2000)
\tlibc.so.6 => /lib/x86_64-linux-gnu/libc.so.6 (0x00007f2b1c000000)
\t/lib64/ld-linux-x86-64.so.2 (0x00007f2b1c4a2000)
";
        let deps = parse_ldd_output(output);
        assert_eq!(
            deps,
            vec![
                PathBuf::from("/lib/x86_64-linux-gnu/libc.so.6"),
                PathBuf::from("/lib64/ld-linux-x86-64.so.2"),
            ]
        );
    }

    #[test]
    fn test_parse_ldd_static_binary() {
        assert!(parse_ldd_output("\tstatically linked\n").is_empty());
        assert!(parse_ldd_output("").is_empty());
    }

    #[test]
    fn test_copy_tree_skips_git() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        std::fs::write(src.path().join("app"), b"binary").unwrap();
        std::fs::create_dir_all(src.path().join(".git/objects")).unwrap();
        std::fs::write(src.path().join(".git/HEAD"), b"ref").unwrap();
        std::fs::create_dir(src.path().join("static")).unwrap();
        std::fs::write(src.path().join("static/index.html"), b"<html>").unwrap();

        let target = dst.path().join("app");
        copy_tree(src.path(), &target).unwrap();

        assert!(target.join("app").exists());
        assert!(target.join("static/index.html").exists());
        assert!(!target.join(".git").exists());
    }

    #[test]
    fn test_find_executables() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("server");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("README.md"), b"docs").unwrap();

        let found = find_executables(dir.path()).unwrap();
        assert_eq!(found, vec![bin]);
    }
}
