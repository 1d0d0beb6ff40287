//! Deployment orchestrator.
//!
//! Drives the fetch -> build -> launch pipeline, supervises running
//! instances, and recovers previously active projects after a restart. All
//! mutable state lives in one shared `Inner`; handles are cheap clones.

pub mod monitor;
pub mod pipeline;
pub mod ports;
pub mod registry;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::PlatformConfig;
use crate::error::{Error, Result};
use crate::proxy::router::RouteTable;
use crate::sandbox::{Isolation, SandboxSpec};
use crate::store::{DeploymentStatus, Project, ProjectStatus, Store};
use crate::vault::Vault;

pub use monitor::ExitEvent;
pub use pipeline::BuildLog;
pub use ports::PortAllocator;
pub use registry::{InstanceRegistry, RunningInstance};

/// Summary of one running instance, for status listings.
#[derive(Debug, Clone)]
pub struct ActiveDeployment {
    pub subdomain: String,
    pub project_id: i64,
    pub port: u16,
    pub pid: u32,
}

/// What happened to each previously active project during startup recovery.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Relaunched from an existing built artifact.
    pub restarted: Vec<String>,
    /// Artifact was missing; went through a full rebuild.
    pub rebuilt: Vec<String>,
    /// Could not be brought back; project marked failed.
    pub failed: Vec<String>,
}

struct Inner {
    config: PlatformConfig,
    store: Store,
    vault: Vault,
    isolation: Arc<dyn Isolation>,
    registry: InstanceRegistry,
    ports: PortAllocator,
    routes: Arc<RouteTable>,
    events: mpsc::UnboundedSender<ExitEvent>,
    /// Subdomains with a deploy currently in flight.
    in_flight: Mutex<HashSet<String>>,
}

/// Handle to the orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Releases the in-flight slot for a subdomain when the pipeline finishes,
/// whichever way it finishes.
struct InFlightGuard {
    inner: Arc<Inner>,
    subdomain: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.subdomain);
    }
}

impl Orchestrator {
    /// Construct the orchestrator and spawn its exit-event handler. Must be
    /// called from within a tokio runtime.
    pub fn new(
        config: PlatformConfig,
        store: Store,
        vault: Vault,
        isolation: Arc<dyn Isolation>,
        routes: Arc<RouteTable>,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end);

        let orchestrator = Self {
            inner: Arc::new(Inner {
                config,
                store,
                vault,
                isolation,
                registry: InstanceRegistry::new(),
                ports,
                routes,
                events,
                in_flight: Mutex::new(HashSet::new()),
            }),
        };
        orchestrator.spawn_exit_handler(rx);
        orchestrator
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn vault(&self) -> &Vault {
        &self.inner.vault
    }

    // ---- deploy ----

    /// Kick off the full pipeline for a project: fetch, build, relaunch.
    /// Returns the deployment record id as soon as the pipeline is enqueued;
    /// progress lands in the deployment record. At most one deploy per
    /// subdomain runs at a time; a second concurrent attempt is rejected.
    pub async fn deploy(&self, project_id: i64, commit: Option<String>) -> Result<i64> {
        let project = self.inner.store.get_project(project_id).await?;
        let guard = self.acquire_in_flight(&project.subdomain)?;
        let deployment_id = self.begin_deployment(&project).await?;

        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _ = this
                .execute_pipeline(&project, commit.as_deref(), deployment_id)
                .await;
        });
        Ok(deployment_id)
    }

    /// Like `deploy`, but waits for the pipeline to finish. Used by recovery
    /// and on-demand restarts, which need the outcome.
    async fn deploy_and_wait(&self, project: &Project) -> Result<()> {
        let _guard = self.acquire_in_flight(&project.subdomain)?;
        let deployment_id = self.begin_deployment(project).await?;
        self.execute_pipeline(project, None, deployment_id)
            .await
            .map(|_| ())
    }

    async fn begin_deployment(&self, project: &Project) -> Result<i64> {
        // The deployment row first; a failed insert must not strand the
        // project in `building`.
        let deployment_id = self.inner.store.create_deployment(project.id, "").await?;
        self.inner
            .store
            .update_project_status(project.id, ProjectStatus::Building)
            .await?;
        tracing::info!(
            "Deploying {} ({}) from {}",
            project.name,
            project.subdomain,
            project.repo_url
        );
        Ok(deployment_id)
    }

    /// Run the pipeline and record its outcome. Bookkeeping failures are
    /// logged rather than raised; this runs detached from any caller.
    async fn execute_pipeline(
        &self,
        project: &Project,
        commit: Option<&str>,
        deployment_id: i64,
    ) -> Result<u16> {
        let mut log = BuildLog::new();
        let result = self
            .run_pipeline(project, commit, deployment_id, &mut log)
            .await;

        match &result {
            Ok(port) => {
                let record = async {
                    self.inner
                        .store
                        .finish_deployment(
                            deployment_id,
                            DeploymentStatus::Success,
                            log.render(),
                            None,
                        )
                        .await?;
                    self.inner.store.mark_project_deployed(project.id, *port).await
                };
                if let Err(e) = record.await {
                    tracing::error!("Failed to record deploy of {}: {}", project.subdomain, e);
                }
                tracing::info!(
                    "Deployed {} on port {} ({} live routes)",
                    project.subdomain,
                    port,
                    self.inner.routes.len()
                );
            }
            Err(e) => {
                tracing::warn!("Deploy of {} failed: {}", project.subdomain, e);
                // A project recorded as failed must not stay reachable; any
                // previous instance comes down with its route.
                self.halt_instance(project).await;
                let record = async {
                    self.inner
                        .store
                        .finish_deployment(
                            deployment_id,
                            DeploymentStatus::Failed,
                            log.render(),
                            Some(&e.to_string()),
                        )
                        .await?;
                    self.inner
                        .store
                        .update_project_status(project.id, ProjectStatus::Failed)
                        .await
                };
                if let Err(e) = record.await {
                    tracing::error!(
                        "Failed to record failed deploy of {}: {}",
                        project.subdomain,
                        e
                    );
                }
            }
        }
        result
    }

    fn acquire_in_flight(&self, subdomain: &str) -> Result<InFlightGuard> {
        let mut in_flight = self.inner.in_flight.lock();
        if !in_flight.insert(subdomain.to_string()) {
            return Err(Error::Conflict(format!(
                "a deployment for {} is already in progress",
                subdomain
            )));
        }
        Ok(InFlightGuard {
            inner: self.inner.clone(),
            subdomain: subdomain.to_string(),
        })
    }

    async fn run_pipeline(
        &self,
        project: &Project,
        commit: Option<&str>,
        deployment_id: i64,
        log: &mut BuildLog,
    ) -> Result<u16> {
        let workspace = self.inner.config.workspace_dir(&project.subdomain);

        pipeline::fetch_source(&project.repo_url, &project.branch, &workspace, log).await?;
        if let Some(commit) = commit {
            pipeline::checkout_commit(&workspace, commit, log).await?;
        }
        if let Some(sha) = pipeline::head_commit(&workspace).await {
            log.line(&format!("At commit {}", sha));
            self.inner
                .store
                .set_deployment_commit(deployment_id, &sha)
                .await?;
        }

        self.inner
            .store
            .update_deployment_status(deployment_id, DeploymentStatus::Building)
            .await?;
        let secrets = self.inner.vault.deployment_env(project.id).await?;
        pipeline::run_build(&workspace, &project.build_command, &secrets, log).await?;

        // The prior instance keeps serving through fetch and build and is
        // replaced here; the failure path in execute_pipeline halts it too.
        self.halt_instance(project).await;

        log.step("launch");
        let port = self.start_instance(project, &secrets).await?;
        log.line(&format!("Listening on port {}", port));
        Ok(port)
    }

    /// Launch a built workspace under the sandbox, supervise it, and publish
    /// its route once it survives the grace period.
    async fn start_instance(
        &self,
        project: &Project,
        secrets: &std::collections::HashMap<String, String>,
    ) -> Result<u16> {
        let workspace = self.inner.config.workspace_dir(&project.subdomain);
        let port = self.inner.ports.reserve_or_allocate(project.port)?;

        let spec = SandboxSpec {
            project_id: project.id,
            subdomain: project.subdomain.clone(),
            working_dir: workspace,
            port,
            secrets_env: secrets.clone(),
        };

        let runtime_log = self.inner.config.runtime_log_path(&project.subdomain);
        let launched = self
            .inner
            .isolation
            .create_sandbox(&spec)
            .and_then(|ctx| pipeline::launch(&project.start_command, &ctx, &runtime_log));

        let child = match launched {
            Ok(child) => child,
            Err(e) => {
                self.inner.ports.release(port);
                return Err(e);
            }
        };

        let pid = child.id().unwrap_or_default();
        self.inner.registry.insert(RunningInstance {
            subdomain: project.subdomain.clone(),
            project_id: project.id,
            pid,
            port,
            stopping: false,
        });
        monitor::spawn_monitor(
            child,
            project.subdomain.clone(),
            project.id,
            self.inner.events.clone(),
        );
        self.inner.isolation.apply_resource_limits(&project.subdomain, pid);

        // An instance that dies inside the grace window never gets a route;
        // the exit handler has already cleaned it up by the time we look.
        tokio::time::sleep(Duration::from_secs(self.inner.config.launch_grace_secs)).await;
        if !self.inner.registry.is_running(&project.subdomain) {
            return Err(Error::PipelineStep {
                step: "launch",
                message: format!(
                    "process exited within {}s of launch",
                    self.inner.config.launch_grace_secs
                ),
            });
        }

        self.inner.routes.set(&project.subdomain, port);
        Ok(port)
    }

    // ---- stop / delete ----

    /// Stop a project's running instance and withdraw its route.
    pub async fn stop(&self, project_id: i64) -> Result<()> {
        let project = self.inner.store.get_project(project_id).await?;
        self.halt_instance(&project).await;
        self.inner
            .store
            .update_project_status(project.id, ProjectStatus::Idle)
            .await?;
        Ok(())
    }

    /// Kill the instance for a project, if any, without touching its status.
    /// Falls back to killing by port when the process handle is stale.
    async fn halt_instance(&self, project: &Project) {
        self.inner.routes.unset(&project.subdomain);

        // Flag first so the exit monitor treats the kill as deliberate.
        match self.inner.registry.mark_stopping(&project.subdomain) {
            Some(instance) => {
                tracing::info!(
                    "Stopping {} (pid {}, port {})",
                    project.subdomain,
                    instance.pid,
                    instance.port
                );
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(instance.pid as i32),
                    nix::sys::signal::Signal::SIGKILL,
                );
                self.inner.registry.remove(&project.subdomain);
                self.inner.ports.release(instance.port);
            }
            None => {
                // Nothing registered; a previous run may have left an
                // orphan bound to the recorded port.
                if let Some(port) = project.port {
                    pipeline::kill_process_on_port(port);
                }
            }
        }
    }

    /// Stop a project and remove everything it owns: workspace, runtime log,
    /// sandbox principal and jail, and the database rows.
    pub async fn delete(&self, project_id: i64) -> Result<()> {
        let project = self.inner.store.get_project(project_id).await?;
        self.halt_instance(&project).await;
        self.inner.isolation.teardown(&project.subdomain);

        let workspace = self.inner.config.workspace_dir(&project.subdomain);
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove workspace {}: {}", workspace.display(), e);
            }
        }
        let runtime_log = self.inner.config.runtime_log_path(&project.subdomain);
        let _ = tokio::fs::remove_file(&runtime_log).await;

        self.inner.store.delete_project(project.id).await?;
        tracing::info!("Deleted project {} ({})", project.name, project.subdomain);
        Ok(())
    }

    // ---- recovery ----

    /// Bring back every project that was active before the last shutdown.
    /// Projects with an intact built artifact are relaunched directly;
    /// projects without one go through a full rebuild.
    pub async fn restart_all(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        let projects = match self.inner.store.list_active_projects().await {
            Ok(projects) => projects,
            Err(e) => {
                tracing::error!("Recovery query failed: {}", e);
                return report;
            }
        };

        for project in projects {
            let workspace = self.inner.config.workspace_dir(&project.subdomain);
            let outcome = if pipeline::has_built_artifact(&workspace) {
                match self.relaunch(&project).await {
                    Ok(()) => {
                        report.restarted.push(project.subdomain.clone());
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Relaunch of {} failed, rebuilding: {}",
                            project.subdomain,
                            e
                        );
                        self.deploy_and_wait(&project).await
                    }
                }
            } else {
                tracing::info!(
                    "No built artifact for {}; rebuilding from source",
                    project.subdomain
                );
                self.deploy_and_wait(&project).await
            };

            match outcome {
                Ok(_) => report.rebuilt.push(project.subdomain.clone()),
                Err(e) => {
                    tracing::warn!("Recovery of {} failed: {}", project.subdomain, e);
                    let _ = self
                        .inner
                        .store
                        .update_project_status(project.id, ProjectStatus::Failed)
                        .await;
                    report.failed.push(project.subdomain.clone());
                }
            }
        }

        tracing::info!(
            "Recovery complete: {} restarted, {} rebuilt, {} failed",
            report.restarted.len(),
            report.rebuilt.len(),
            report.failed.len()
        );
        report
    }

    /// Relaunch from the existing artifact, skipping fetch and build.
    async fn relaunch(&self, project: &Project) -> Result<()> {
        let _guard = self.acquire_in_flight(&project.subdomain)?;
        let secrets = self.inner.vault.deployment_env(project.id).await?;
        let port = self.start_instance(project, &secrets).await?;
        self.inner
            .store
            .mark_project_deployed(project.id, port)
            .await?;
        Ok(())
    }

    /// Start a stopped instance in the background, if it is not already
    /// running or being deployed. Used by the proxy for on-demand restarts;
    /// callers poll the route table for completion.
    pub fn request_restart(&self, subdomain: &str) {
        if self.inner.registry.is_running(subdomain) {
            return;
        }
        if self.inner.in_flight.lock().contains(subdomain) {
            return;
        }

        let this = self.clone();
        let subdomain = subdomain.to_string();
        tokio::spawn(async move {
            let project = match this.inner.store.get_project_by_subdomain(&subdomain).await {
                Ok(project) => project,
                Err(_) => return,
            };
            tracing::info!("On-demand restart of {}", subdomain);

            let workspace = this.inner.config.workspace_dir(&subdomain);
            let result = if pipeline::has_built_artifact(&workspace) {
                this.relaunch(&project).await
            } else {
                this.deploy_and_wait(&project).await
            };
            if let Err(e) = result {
                tracing::warn!("On-demand restart of {} failed: {}", subdomain, e);
            }
        });
    }

    // ---- introspection ----

    /// Build log of a project's most recent deployment.
    pub async fn build_logs(&self, project_id: i64) -> Result<String> {
        let deployments = self.inner.store.list_deployments(project_id, 1).await?;
        match deployments.into_iter().next() {
            Some(d) => Ok(d.build_log),
            None => Ok("No deployments yet.".to_string()),
        }
    }

    /// Last `limit` lines of a project's runtime log.
    pub async fn runtime_logs(&self, project_id: i64, limit: usize) -> Result<String> {
        let project = self.inner.store.get_project(project_id).await?;
        let path = self.inner.config.runtime_log_path(&project.subdomain);
        pipeline::tail_runtime_log(&path, limit).await
    }

    /// Snapshot of every running instance, sorted by subdomain.
    pub fn active_deployments(&self) -> Vec<ActiveDeployment> {
        let mut active: Vec<ActiveDeployment> = self
            .inner
            .registry
            .active_subdomains()
            .into_iter()
            .filter_map(|subdomain| self.inner.registry.get(&subdomain))
            .map(|i| ActiveDeployment {
                subdomain: i.subdomain,
                project_id: i.project_id,
                port: i.port,
                pid: i.pid,
            })
            .collect();
        active.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        active
    }

    // ---- exit handling ----

    fn spawn_exit_handler(&self, mut rx: mpsc::UnboundedReceiver<ExitEvent>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handle_exit(&inner, event).await;
            }
        });
    }
}

/// React to a supervised process exiting. Deliberate stops were flagged (or
/// already removed) by `halt_instance`; anything else is a crash.
async fn handle_exit(inner: &Inner, event: ExitEvent) {
    let instance = match inner.registry.get(&event.subdomain) {
        Some(instance) => instance,
        None => return,
    };
    if instance.stopping || instance.pid != event.pid {
        return;
    }

    tracing::warn!(
        "Instance {} (pid {}) exited unexpectedly with code {:?}",
        event.subdomain,
        event.pid,
        event.exit_code
    );

    inner.registry.remove(&event.subdomain);
    inner.routes.unset(&event.subdomain);
    inner.ports.release(instance.port);

    if let Err(e) = inner
        .store
        .update_project_status(event.project_id, ProjectStatus::Failed)
        .await
    {
        tracing::error!(
            "Failed to record crash of {}: {}",
            event.subdomain,
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::BestEffortIsolation;
    use crate::store::NewProject;

    async fn test_orchestrator(port_start: u16, port_end: u16) -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = PlatformConfig {
            database_path: dir.path().join("test.db"),
            deployments_dir: dir.path().join("deployments"),
            encryption_key: Some("test-key".to_string()),
            port_range_start: port_start,
            port_range_end: port_end,
            launch_grace_secs: 0,
            ..PlatformConfig::default()
        };
        let store = Store::open_in_memory().await.unwrap();
        let vault = Vault::new(store.clone(), "test-key");
        let routes = Arc::new(RouteTable::new());
        let orchestrator = Orchestrator::new(
            config,
            store,
            vault,
            Arc::new(BestEffortIsolation),
            routes,
        );
        (orchestrator, dir)
    }

    async fn seed_project(orchestrator: &Orchestrator, subdomain: &str, repo: &str) -> Project {
        orchestrator
            .store()
            .create_project(&NewProject {
                user_id: 1,
                name: subdomain.to_string(),
                repo_url: repo.to_string(),
                branch: "main".to_string(),
                subdomain: subdomain.to_string(),
                build_command: "true".to_string(),
                start_command: "sleep 30".to_string(),
            })
            .await
            .unwrap()
    }

    fn init_git_repo(dir: &std::path::Path) {
        let run = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(["-C", dir.to_str().unwrap()])
                .args(args)
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        std::fs::create_dir_all(dir).unwrap();
        run(&["init", "-q", "-b", "main"]);
        std::fs::write(dir.join("app.txt"), "hello").unwrap();
        run(&["add", "."]);
        run(&[
            "-c",
            "user.email=test@example.com",
            "-c",
            "user.name=test",
            "commit",
            "-q",
            "-m",
            "init",
        ]);
    }

    #[tokio::test]
    async fn test_fetch_failure_marks_project_failed() {
        let (orchestrator, _dir) = test_orchestrator(45000, 45010).await;
        let project = seed_project(&orchestrator, "broken", "/nonexistent/repo.git").await;

        let err = orchestrator.deploy_and_wait(&project).await.unwrap_err();
        assert!(matches!(err, Error::PipelineStep { step: "fetch", .. }));

        let project = orchestrator.store().get_project(project.id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
        assert!(orchestrator.inner.routes.lookup("broken").is_none());

        // The failed attempt is recorded with its partial log.
        let deployments = orchestrator
            .store()
            .list_deployments(project.id, 10)
            .await
            .unwrap();
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].status, DeploymentStatus::Failed);
        assert!(deployments[0].build_log.contains("=== fetch ==="));
        assert!(deployments[0].error_msg.is_some());
    }

    #[tokio::test]
    async fn test_deploy_stop_lifecycle() {
        let (orchestrator, dir) = test_orchestrator(45020, 45030).await;
        let repo = dir.path().join("origin");
        init_git_repo(&repo);
        let project =
            seed_project(&orchestrator, "demo", repo.to_str().unwrap()).await;

        orchestrator.deploy_and_wait(&project).await.unwrap();

        let port = orchestrator.inner.routes.lookup("demo").unwrap();
        assert!((45020..45030).contains(&port));
        assert!(orchestrator.inner.registry.is_running("demo"));

        let stored = orchestrator.store().get_project(project.id).await.unwrap();
        assert_eq!(stored.status, ProjectStatus::Active);
        assert_eq!(stored.port, Some(port));

        orchestrator.stop(project.id).await.unwrap();
        assert!(orchestrator.inner.routes.lookup("demo").is_none());
        assert!(!orchestrator.inner.registry.is_running("demo"));
        let stored = orchestrator.store().get_project(project.id).await.unwrap();
        assert_eq!(stored.status, ProjectStatus::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_deploy_rejected() {
        let (orchestrator, _dir) = test_orchestrator(45040, 45050).await;

        let _guard = orchestrator.acquire_in_flight("demo").unwrap();
        assert!(matches!(
            orchestrator.acquire_in_flight("demo"),
            Err(Error::Conflict(_))
        ));

        // Other subdomains are unaffected, and the slot frees on drop.
        orchestrator.acquire_in_flight("other").unwrap();
        drop(_guard);
        orchestrator.acquire_in_flight("demo").unwrap();
    }

    #[tokio::test]
    async fn test_failed_redeploy_withdraws_live_route() {
        let (orchestrator, dir) = test_orchestrator(45100, 45110).await;
        let repo = dir.path().join("origin");
        init_git_repo(&repo);
        let mut project = seed_project(&orchestrator, "stale", repo.to_str().unwrap()).await;

        orchestrator.deploy_and_wait(&project).await.unwrap();
        assert!(orchestrator.inner.routes.lookup("stale").is_some());

        // A failed redeploy must not leave the old version serving.
        project.build_command = "exit 1".to_string();
        let err = orchestrator.deploy_and_wait(&project).await.unwrap_err();
        assert!(matches!(err, Error::PipelineStep { step: "build", .. }));

        let stored = orchestrator.store().get_project(project.id).await.unwrap();
        assert_eq!(stored.status, ProjectStatus::Failed);
        assert!(orchestrator.inner.routes.lookup("stale").is_none());
        assert!(!orchestrator.inner.registry.is_running("stale"));
    }

    #[tokio::test]
    async fn test_restart_all_buckets_outcomes() {
        let (orchestrator, dir) = test_orchestrator(45120, 45130).await;

        // The unrecoverable project comes first so a failure mid-recovery
        // is shown not to stop the rest.
        let gone = seed_project(&orchestrator, "gone", "/nonexistent/repo.git").await;
        let repo = dir.path().join("origin");
        init_git_repo(&repo);
        let rebuilt = seed_project(&orchestrator, "rebuilt", repo.to_str().unwrap()).await;
        let kept = seed_project(&orchestrator, "kept", repo.to_str().unwrap()).await;

        // "kept" has a built artifact left over from a previous run;
        // "rebuilt" has no workspace at all.
        let workspace = orchestrator.inner.config.workspace_dir("kept");
        std::fs::create_dir_all(&workspace).unwrap();
        let artifact = workspace.join("server");
        std::fs::write(&artifact, "#!/bin/sh\nsleep 30\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&artifact).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&artifact, perms).unwrap();

        for p in [&gone, &rebuilt, &kept] {
            orchestrator
                .store()
                .update_project_status(p.id, ProjectStatus::Active)
                .await
                .unwrap();
        }

        let report = orchestrator.restart_all().await;
        assert_eq!(report.restarted, vec!["kept".to_string()]);
        assert_eq!(report.rebuilt, vec!["rebuilt".to_string()]);
        assert_eq!(report.failed, vec!["gone".to_string()]);

        assert!(orchestrator.inner.routes.lookup("kept").is_some());
        assert!(orchestrator.inner.routes.lookup("rebuilt").is_some());
        assert!(orchestrator.inner.routes.lookup("gone").is_none());

        let gone = orchestrator.store().get_project(gone.id).await.unwrap();
        assert_eq!(gone.status, ProjectStatus::Failed);
        let kept = orchestrator.store().get_project(kept.id).await.unwrap();
        assert_eq!(kept.status, ProjectStatus::Active);
    }

    #[tokio::test]
    async fn test_begin_deployment_missing_project_writes_nothing() {
        let (orchestrator, _dir) = test_orchestrator(45140, 45150).await;
        let project = seed_project(&orchestrator, "phantom", "/tmp/unused").await;
        orchestrator.store().delete_project(project.id).await.unwrap();

        // The deployment insert hits the foreign key and nothing else runs.
        let err = orchestrator.begin_deployment(&project).await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        let deployments = orchestrator
            .store()
            .list_deployments(project.id, 10)
            .await
            .unwrap();
        assert!(deployments.is_empty());
    }

    #[tokio::test]
    async fn test_crash_releases_resources_and_marks_failed() {
        let (orchestrator, dir) = test_orchestrator(45060, 45070).await;
        let repo = dir.path().join("origin");
        init_git_repo(&repo);
        let mut project =
            seed_project(&orchestrator, "crashy", repo.to_str().unwrap()).await;
        project.start_command = "sleep 30".to_string();

        orchestrator.deploy_and_wait(&project).await.unwrap();
        let instance = orchestrator.inner.registry.get("crashy").unwrap();

        // Kill the process out from under the orchestrator.
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(instance.pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();

        // Wait for the exit handler to react.
        for _ in 0..50 {
            if !orchestrator.inner.registry.is_running("crashy") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(!orchestrator.inner.registry.is_running("crashy"));
        assert!(orchestrator.inner.routes.lookup("crashy").is_none());
        let stored = orchestrator.store().get_project(project.id).await.unwrap();
        assert_eq!(stored.status, ProjectStatus::Failed);
    }

    #[tokio::test]
    async fn test_build_logs_without_deployments() {
        let (orchestrator, _dir) = test_orchestrator(45080, 45090).await;
        let project = seed_project(&orchestrator, "fresh", "/tmp/unused").await;
        let logs = orchestrator.build_logs(project.id).await.unwrap();
        assert_eq!(logs, "No deployments yet.");
    }
}
