//! Presentation-facing facade over the platform subsystems.
//!
//! The dashboard (or any other front end) talks to this one handle; it never
//! reaches into the orchestrator, vault, or store directly. Errors carry an
//! [`Outcome`](crate::error::Outcome) so callers can map them to a response
//! without inspecting variants.

use crate::error::{Error, Result};
use crate::orchestrator::{ActiveDeployment, Orchestrator};
use crate::store::{NewProject, Project};
use crate::utils::{generate_subdomain, is_valid_subdomain, RESERVED_LABELS};
use crate::vault::MaskedSecret;

/// Fields a caller supplies to register a project. The subdomain is derived
/// from the name when not given.
#[derive(Debug, Clone)]
pub struct ProjectRequest {
    pub user_id: i64,
    pub name: String,
    pub repo_url: String,
    pub branch: Option<String>,
    pub subdomain: Option<String>,
    pub build_command: String,
    pub start_command: String,
}

/// One handle to everything the presentation layer may do.
#[derive(Clone)]
pub struct Platform {
    orchestrator: Orchestrator,
}

impl Platform {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    // ---- projects ----

    /// Register a new project. The subdomain must be unique; a taken or
    /// reserved one is rejected.
    pub async fn create_project(&self, req: ProjectRequest) -> Result<Project> {
        if req.name.trim().is_empty() {
            return Err(Error::Validation("project name is required".to_string()));
        }
        if req.repo_url.trim().is_empty() {
            return Err(Error::Validation("repository URL is required".to_string()));
        }
        if req.build_command.trim().is_empty() || req.start_command.trim().is_empty() {
            return Err(Error::Validation(
                "build and start commands are required".to_string(),
            ));
        }

        let subdomain = match req.subdomain {
            Some(s) => {
                if !is_valid_subdomain(&s) {
                    return Err(Error::Validation(format!("invalid subdomain '{}'", s)));
                }
                s
            }
            None => generate_subdomain(&req.name),
        };
        if RESERVED_LABELS.contains(&subdomain.as_str()) {
            return Err(Error::Validation(format!(
                "subdomain '{}' is reserved",
                subdomain
            )));
        }

        self.orchestrator
            .store()
            .create_project(&NewProject {
                user_id: req.user_id,
                name: req.name,
                repo_url: req.repo_url,
                branch: req.branch.unwrap_or_else(|| "main".to_string()),
                subdomain,
                build_command: req.build_command,
                start_command: req.start_command,
            })
            .await
    }

    pub async fn get_project(&self, project_id: i64) -> Result<Project> {
        self.orchestrator.store().get_project(project_id).await
    }

    // ---- deployment lifecycle ----

    /// Start a deployment; returns the deployment id immediately.
    pub async fn deploy_project(&self, project_id: i64, commit: Option<String>) -> Result<i64> {
        self.orchestrator.deploy(project_id, commit).await
    }

    pub async fn stop_project(&self, project_id: i64) -> Result<()> {
        self.orchestrator.stop(project_id).await
    }

    pub async fn delete_project(&self, project_id: i64) -> Result<()> {
        self.orchestrator.delete(project_id).await
    }

    /// Build log of the most recent deployment.
    pub async fn get_logs(&self, project_id: i64) -> Result<String> {
        self.orchestrator.build_logs(project_id).await
    }

    /// Tail of the running instance's output.
    pub async fn get_runtime_logs(&self, project_id: i64) -> Result<String> {
        self.orchestrator.runtime_logs(project_id, 100).await
    }

    pub fn active_deployments(&self) -> Vec<ActiveDeployment> {
        self.orchestrator.active_deployments()
    }

    // ---- secrets ----

    /// Masked listing; plaintext never leaves the vault here.
    pub async fn get_secrets(&self, project_id: i64) -> Result<Vec<MaskedSecret>> {
        self.orchestrator.vault().list(project_id).await
    }

    pub async fn put_secret(
        &self,
        project_id: i64,
        key_name: &str,
        value: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        self.orchestrator
            .vault()
            .put(project_id, key_name, value, description)
            .await
    }

    pub async fn update_secret(
        &self,
        secret_id: i64,
        project_id: i64,
        key_name: &str,
        value: &str,
        description: Option<&str>,
    ) -> Result<()> {
        self.orchestrator
            .vault()
            .update(secret_id, project_id, key_name, value, description)
            .await
    }

    pub async fn delete_secret(&self, secret_id: i64, project_id: i64) -> Result<()> {
        self.orchestrator.vault().delete(secret_id, project_id).await
    }

    /// Reveal one secret's plaintext. The single deliberate disclosure path.
    pub async fn get_secret_value(&self, secret_id: i64, project_id: i64) -> Result<String> {
        self.orchestrator.vault().get_value(secret_id, project_id).await
    }
}
