//! Row models and status enums for the relational store.

use chrono::{DateTime, Utc};

/// Lifecycle status of a project.
///
/// `idle -> building -> {active, failed}`; `active -> idle` on user stop;
/// `active -> failed` on unexpected process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Idle,
    Building,
    Active,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Idle => "idle",
            ProjectStatus::Building => "building",
            ProjectStatus::Active => "active",
            ProjectStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(ProjectStatus::Idle),
            "building" => Some(ProjectStatus::Building),
            "active" => Some(ProjectStatus::Active),
            "failed" => Some(ProjectStatus::Failed),
            _ => None,
        }
    }
}

/// Status of a single deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    Pending,
    Building,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeploymentStatus::Pending),
            "building" => Some(DeploymentStatus::Building),
            "success" => Some(DeploymentStatus::Success),
            "failed" => Some(DeploymentStatus::Failed),
            _ => None,
        }
    }
}

/// A deployable project. The subdomain is immutable and globally unique.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub subdomain: String,
    pub build_command: String,
    pub start_command: String,
    /// Port of the last successful launch; refreshed on each deploy.
    pub port: Option<u16>,
    pub status: ProjectStatus,
    pub last_deploy: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to register a new project.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub user_id: i64,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub subdomain: String,
    pub build_command: String,
    pub start_command: String,
}

/// One build-and-run attempt. Immutable once finished.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: i64,
    pub project_id: i64,
    pub commit_sha: String,
    pub status: DeploymentStatus,
    pub build_log: String,
    pub error_msg: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A project-scoped secret row; the value is stored encrypted.
#[derive(Debug, Clone)]
pub struct SecretRow {
    pub id: i64,
    pub project_id: i64,
    pub key_name: String,
    pub encrypted_value: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            ProjectStatus::Idle,
            ProjectStatus::Building,
            ProjectStatus::Active,
            ProjectStatus::Failed,
        ] {
            assert_eq!(ProjectStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ProjectStatus::parse("bogus"), None);

        for s in [
            DeploymentStatus::Pending,
            DeploymentStatus::Building,
            DeploymentStatus::Success,
            DeploymentStatus::Failed,
        ] {
            assert_eq!(DeploymentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(DeploymentStatus::parse(""), None);
    }
}
