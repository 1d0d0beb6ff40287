//! Deployment pipeline steps: source fetch, build, and sandboxed launch.

use std::path::Path;
use std::process::Stdio;

use chrono::Utc;
use tokio::process::{Child, Command};

use crate::error::{Error, Result};
use crate::sandbox::ExecContext;

/// Structured log accumulated across pipeline steps and persisted with the
/// deployment record.
#[derive(Debug, Default)]
pub struct BuildLog {
    buf: String,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a named step section.
    pub fn step(&mut self, name: &str) {
        self.buf.push_str(&format!(
            "=== {} === ({})\n",
            name,
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        ));
    }

    pub fn line(&mut self, text: &str) {
        self.buf.push_str(text);
        if !text.ends_with('\n') {
            self.buf.push('\n');
        }
    }

    /// Append raw command output.
    pub fn output(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.buf.push_str(&String::from_utf8_lossy(bytes));
            if !self.buf.ends_with('\n') {
                self.buf.push('\n');
            }
        }
    }

    pub fn render(&self) -> &str {
        &self.buf
    }
}

/// Run a command, append combined output to the log, and fail the named step
/// on a non-zero exit.
async fn run_logged(
    cmd: &mut Command,
    step: &'static str,
    log: &mut BuildLog,
) -> Result<()> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::PipelineStep {
            step,
            message: e.to_string(),
        })?;

    log.output(&output.stdout);
    log.output(&output.stderr);

    if !output.status.success() {
        return Err(Error::PipelineStep {
            step,
            message: format!("command exited with {}", output.status),
        });
    }
    Ok(())
}

/// Clone the repository into the workspace, or fetch the branch and
/// hard-reset to it when a checkout already exists. Local drift is discarded.
pub async fn fetch_source(
    repo_url: &str,
    branch: &str,
    workspace: &Path,
    log: &mut BuildLog,
) -> Result<()> {
    log.step("fetch");

    if !workspace.join(".git").exists() {
        tokio::fs::create_dir_all(workspace).await.map_err(|e| Error::PipelineStep {
            step: "fetch",
            message: format!("failed to create workspace: {}", e),
        })?;
        log.line(&format!("Cloning {} (branch {})", repo_url, branch));
        run_logged(
            Command::new("git").args(["clone", "--branch", branch, repo_url]).arg(workspace),
            "fetch",
            log,
        )
        .await
    } else {
        log.line(&format!("Fetching origin/{}", branch));
        run_logged(
            Command::new("git")
                .arg("-C")
                .arg(workspace)
                .args(["fetch", "origin", branch]),
            "fetch",
            log,
        )
        .await?;
        run_logged(
            Command::new("git")
                .arg("-C")
                .arg(workspace)
                .args(["reset", "--hard", &format!("origin/{}", branch)]),
            "fetch",
            log,
        )
        .await
    }
}

/// Check out a specific commit when one was requested.
pub async fn checkout_commit(workspace: &Path, commit: &str, log: &mut BuildLog) -> Result<()> {
    log.step("checkout");
    log.line(&format!("Checking out {}", commit));
    run_logged(
        Command::new("git")
            .arg("-C")
            .arg(workspace)
            .args(["checkout", commit]),
        "checkout",
        log,
    )
    .await
}

/// Resolved HEAD commit of the workspace, for the deployment record.
pub async fn head_commit(workspace: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(workspace)
        .args(["rev-parse", "HEAD"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run the configured build command through the shell, with the project's
/// secrets merged into the build environment.
pub async fn run_build(
    workspace: &Path,
    build_command: &str,
    secrets_env: &std::collections::HashMap<String, String>,
    log: &mut BuildLog,
) -> Result<()> {
    log.step("build");
    log.line(&format!("$ {}", build_command));

    let mut cmd = Command::new("sh");
    cmd.args(["-c", build_command]).current_dir(workspace);
    for (key, value) in secrets_env {
        cmd.env(key, value);
    }

    run_logged(&mut cmd, "build", log).await
}

/// Launch the start command inside the sandbox context, with stdout/stderr
/// captured to the runtime log file.
pub fn launch(
    start_command: &str,
    ctx: &ExecContext,
    runtime_log: &Path,
) -> Result<Child> {
    if let Some(dir) = runtime_log.parent() {
        std::fs::create_dir_all(dir)?;
    }
    // Recreated on every deploy so each run starts with a clean log.
    let stdout = std::fs::File::create(runtime_log)?;
    let stderr = stdout.try_clone()?;

    let mut cmd = Command::new("sh");
    cmd.args(["-c", start_command])
        .env_clear()
        .envs(ctx.env.iter().cloned())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(false);

    match &ctx.chroot {
        Some(root) => {
            // Enter the jail and only then drop privileges: chroot needs
            // root, so credentials must be applied inside pre_exec after it.
            let root = root.clone();
            let run_dir = ctx.run_dir.clone();
            let creds = ctx.credentials;
            unsafe {
                cmd.pre_exec(move || {
                    nix::unistd::chroot(&root)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    nix::unistd::chdir(&run_dir)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    if let Some((uid, gid)) = creds {
                        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))
                            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
                            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    }
                    Ok(())
                });
            }
        }
        None => {
            cmd.current_dir(&ctx.run_dir);
            if let Some((uid, gid)) = ctx.credentials {
                cmd.uid(uid).gid(gid);
            }
        }
    }

    cmd.spawn().map_err(|e| Error::PipelineStep {
        step: "launch",
        message: format!("failed to start process: {}", e),
    })
}

/// Whether the workspace holds a built artifact: any executable regular file
/// at its top level. Build commands are arbitrary, so this is the most
/// specific check available.
pub fn has_built_artifact(workspace: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Ok(entries) = std::fs::read_dir(workspace) else {
        return false;
    };
    for entry in entries.flatten() {
        if let Ok(meta) = entry.metadata() {
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return true;
            }
        }
    }
    false
}

/// Last `limit` lines of a runtime log file.
pub async fn tail_runtime_log(path: &Path, limit: usize) -> Result<String> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok("No logs available yet.".to_string());
        }
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(limit);
    Ok(lines[start..].join("\n"))
}

/// Kill whatever process currently listens on a port. Fallback for stale
/// process handles; best-effort.
pub fn kill_process_on_port(port: u16) {
    let output = match std::process::Command::new("lsof")
        .args(["-ti", &format!(":{}", port)])
        .output()
    {
        Ok(out) => out,
        Err(_) => return,
    };

    for pid_str in String::from_utf8_lossy(&output.stdout).split_whitespace() {
        if let Ok(pid) = pid_str.parse::<i32>() {
            tracing::debug!("Killing pid {} bound to port {}", pid, port);
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_build_log_sections() {
        let mut log = BuildLog::new();
        log.step("fetch");
        log.line("Cloning repo");
        log.step("build");
        log.output(b"compiling...\n");

        let rendered = log.render();
        assert!(rendered.contains("=== fetch ==="));
        assert!(rendered.contains("Cloning repo"));
        assert!(rendered.contains("=== build ==="));
        assert!(rendered.contains("compiling..."));
        let fetch_pos = rendered.find("fetch").unwrap();
        let build_pos = rendered.find("build").unwrap();
        assert!(fetch_pos < build_pos);
    }

    #[tokio::test]
    async fn test_run_build_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BuildLog::new();

        run_build(dir.path(), "echo building && true", &HashMap::new(), &mut log)
            .await
            .unwrap();
        assert!(log.render().contains("building"));

        let mut log = BuildLog::new();
        let err = run_build(dir.path(), "echo oops >&2 && exit 1", &HashMap::new(), &mut log)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PipelineStep { step: "build", .. }));
        assert!(log.render().contains("oops"));
    }

    #[tokio::test]
    async fn test_build_sees_secret_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut secrets = HashMap::new();
        secrets.insert("API_KEY".to_string(), "sk-42".to_string());

        let mut log = BuildLog::new();
        run_build(dir.path(), "echo key=$API_KEY", &secrets, &mut log)
            .await
            .unwrap();
        assert!(log.render().contains("key=sk-42"));
    }

    #[test]
    fn test_has_built_artifact() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        assert!(!has_built_artifact(dir.path()));

        std::fs::write(dir.path().join("README.md"), b"docs").unwrap();
        assert!(!has_built_artifact(dir.path()));

        let bin = dir.path().join("server");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(has_built_artifact(dir.path()));
    }

    #[tokio::test]
    async fn test_tail_runtime_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.log");

        assert_eq!(
            tail_runtime_log(&path, 100).await.unwrap(),
            "No logs available yet."
        );

        let lines: Vec<String> = (0..150).map(|i| format!("line {}", i)).collect();
        tokio::fs::write(&path, lines.join("\n")).await.unwrap();

        let tail = tail_runtime_log(&path, 100).await.unwrap();
        assert!(tail.starts_with("line 50"));
        assert!(tail.ends_with("line 149"));
    }

    #[tokio::test]
    async fn test_launch_writes_runtime_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("logs/demo.log");
        let ctx = ExecContext {
            credentials: None,
            env: vec![
                ("PATH".to_string(), "/usr/bin:/bin".to_string()),
                ("GREETING".to_string(), "hello".to_string()),
            ],
            run_dir: dir.path().to_path_buf(),
            chroot: None,
        };

        let mut child = launch("echo $GREETING", &ctx, &log_path).unwrap();
        child.wait().await.unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.trim(), "hello");
    }

    #[tokio::test]
    async fn test_launch_does_not_inherit_parent_env() {
        std::env::set_var("SLIPWAY_TEST_AMBIENT", "leaked");
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("demo.log");
        let ctx = ExecContext {
            credentials: None,
            env: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
            run_dir: dir.path().to_path_buf(),
            chroot: None,
        };

        let mut child = launch("echo ambient=$SLIPWAY_TEST_AMBIENT", &ctx, &log_path).unwrap();
        child.wait().await.unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.trim(), "ambient=");
        std::env::remove_var("SLIPWAY_TEST_AMBIENT");
    }
}
