//! SQLite-backed relational store for projects, deployments, and secrets.

pub mod models;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};

pub use models::{Deployment, DeploymentStatus, NewProject, Project, ProjectStatus, SecretRow};

const CREATE_PROJECTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    repo_url TEXT NOT NULL,
    branch TEXT NOT NULL DEFAULT 'main',
    subdomain TEXT UNIQUE NOT NULL,
    build_command TEXT NOT NULL,
    start_command TEXT NOT NULL,
    port INTEGER,
    status TEXT NOT NULL DEFAULT 'idle',
    last_deploy TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#;

const CREATE_DEPLOYMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS deployments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    build_log TEXT NOT NULL DEFAULT '',
    error_msg TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    FOREIGN KEY (project_id) REFERENCES projects (id) ON DELETE CASCADE
)"#;

const CREATE_SECRETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS secrets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    key_name TEXT NOT NULL,
    encrypted_value TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (project_id) REFERENCES projects (id) ON DELETE CASCADE,
    UNIQUE(project_id, key_name)
)"#;

const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_projects_subdomain ON projects(subdomain);
CREATE INDEX IF NOT EXISTS idx_deployments_project_id ON deployments(project_id);
CREATE INDEX IF NOT EXISTS idx_secrets_project_id ON secrets(project_id)
"#;

/// Handle to the relational store. Cheap to clone; wraps a connection pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory database. Used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);

        // One connection: every pooled connection would otherwise get its own
        // empty in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for ddl in [
            CREATE_PROJECTS_TABLE,
            CREATE_DEPLOYMENTS_TABLE,
            CREATE_SECRETS_TABLE,
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        for stmt in CREATE_INDEXES.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    // ---- projects ----

    /// Insert a new project in `idle` state.
    pub async fn create_project(&self, new: &NewProject) -> Result<Project> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO projects
                (user_id, name, repo_url, branch, subdomain, build_command, start_command, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'idle', ?, ?)
            "#,
        )
        .bind(new.user_id)
        .bind(&new.name)
        .bind(&new.repo_url)
        .bind(&new.branch)
        .bind(&new.subdomain)
        .bind(&new.build_command)
        .bind(&new.start_command)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, format!("subdomain '{}' already exists", new.subdomain))
        })?;

        self.get_project(result.last_insert_rowid()).await
    }

    pub async fn get_project(&self, id: i64) -> Result<Project> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {}", id)))?;
        project_from_row(&row)
    }

    pub async fn get_project_by_subdomain(&self, subdomain: &str) -> Result<Project> {
        let row = sqlx::query("SELECT * FROM projects WHERE subdomain = ?")
            .bind(subdomain)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("subdomain '{}'", subdomain)))?;
        project_from_row(&row)
    }

    /// Projects persisted as active; the startup recovery set.
    pub async fn list_active_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects WHERE status = 'active' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(project_from_row).collect()
    }

    pub async fn update_project_status(&self, id: i64, status: ProjectStatus) -> Result<()> {
        sqlx::query("UPDATE projects SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a successful deploy: active status, assigned port, deploy time.
    pub async fn mark_project_deployed(&self, id: i64, port: u16) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE projects SET status = 'active', port = ?, last_deploy = ?, updated_at = ? WHERE id = ?",
        )
        .bind(port as i64)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a project; deployments and secrets cascade.
    pub async fn delete_project(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("project {}", id)));
        }
        Ok(())
    }

    // ---- deployments ----

    pub async fn create_deployment(&self, project_id: i64, commit_sha: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO deployments (project_id, commit_sha, status, started_at) VALUES (?, ?, 'pending', ?)",
        )
        .bind(project_id)
        .bind(commit_sha)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Record the commit a deployment resolved to, once known.
    pub async fn set_deployment_commit(&self, id: i64, commit_sha: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET commit_sha = ? WHERE id = ?")
            .bind(commit_sha)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_deployment_status(&self, id: i64, status: DeploymentStatus) -> Result<()> {
        sqlx::query("UPDATE deployments SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Finish a deployment with its final status, full log, and error.
    pub async fn finish_deployment(
        &self,
        id: i64,
        status: DeploymentStatus,
        build_log: &str,
        error_msg: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deployments SET status = ?, build_log = ?, error_msg = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(build_log)
        .bind(error_msg)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_deployment(&self, id: i64) -> Result<Deployment> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("deployment {}", id)))?;
        deployment_from_row(&row)
    }

    /// Most recent deployments for a project, newest first.
    pub async fn list_deployments(&self, project_id: i64, limit: i64) -> Result<Vec<Deployment>> {
        let rows = sqlx::query(
            "SELECT * FROM deployments WHERE project_id = ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deployment_from_row).collect()
    }

    // ---- secrets ----

    pub async fn insert_secret(
        &self,
        project_id: i64,
        key_name: &str,
        encrypted_value: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO secrets (project_id, key_name, encrypted_value, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project_id)
        .bind(key_name)
        .bind(encrypted_value)
        .bind(description)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, format!("secret '{}' already exists", key_name)))?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_secret(
        &self,
        secret_id: i64,
        project_id: i64,
        key_name: &str,
        encrypted_value: &str,
        description: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE secrets SET key_name = ?, encrypted_value = ?, description = ?, updated_at = ?
            WHERE id = ? AND project_id = ?
            "#,
        )
        .bind(key_name)
        .bind(encrypted_value)
        .bind(description)
        .bind(Utc::now())
        .bind(secret_id)
        .bind(project_id)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, format!("secret '{}' already exists", key_name)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("secret {}", secret_id)));
        }
        Ok(())
    }

    pub async fn delete_secret(&self, secret_id: i64, project_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM secrets WHERE id = ? AND project_id = ?")
            .bind(secret_id)
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("secret {}", secret_id)));
        }
        Ok(())
    }

    pub async fn get_secret(&self, secret_id: i64, project_id: i64) -> Result<SecretRow> {
        let row = sqlx::query("SELECT * FROM secrets WHERE id = ? AND project_id = ?")
            .bind(secret_id)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("secret {}", secret_id)))?;
        secret_from_row(&row)
    }

    pub async fn list_secrets(&self, project_id: i64) -> Result<Vec<SecretRow>> {
        let rows = sqlx::query("SELECT * FROM secrets WHERE project_id = ? ORDER BY key_name ASC")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(secret_from_row).collect()
    }
}

fn conflict_on_unique(e: sqlx::Error, message: String) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed") => {
            Error::Conflict(message)
        }
        _ => Error::Database(e),
    }
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    let status: String = row.try_get("status")?;
    let port: Option<i64> = row.try_get("port")?;
    Ok(Project {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        repo_url: row.try_get("repo_url")?,
        branch: row.try_get("branch")?,
        subdomain: row.try_get("subdomain")?,
        build_command: row.try_get("build_command")?,
        start_command: row.try_get("start_command")?,
        port: port.map(|p| p as u16),
        status: ProjectStatus::parse(&status).unwrap_or(ProjectStatus::Failed),
        last_deploy: row.try_get::<Option<DateTime<Utc>>, _>("last_deploy")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn deployment_from_row(row: &SqliteRow) -> Result<Deployment> {
    let status: String = row.try_get("status")?;
    Ok(Deployment {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        commit_sha: row.try_get("commit_sha")?,
        status: DeploymentStatus::parse(&status).unwrap_or(DeploymentStatus::Failed),
        build_log: row.try_get("build_log")?,
        error_msg: row.try_get("error_msg")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
    })
}

fn secret_from_row(row: &SqliteRow) -> Result<SecretRow> {
    Ok(SecretRow {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        key_name: row.try_get("key_name")?,
        encrypted_value: row.try_get("encrypted_value")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Outcome;

    fn demo_project(subdomain: &str) -> NewProject {
        NewProject {
            user_id: 1,
            name: "demo".to_string(),
            repo_url: "https://example.com/demo.git".to_string(),
            branch: "main".to_string(),
            subdomain: subdomain.to_string(),
            build_command: "true".to_string(),
            start_command: "sleep 100".to_string(),
        }
    }

    #[tokio::test]
    async fn test_project_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let project = store.create_project(&demo_project("demo-ab12")).await.unwrap();

        assert_eq!(project.subdomain, "demo-ab12");
        assert_eq!(project.status, ProjectStatus::Idle);
        assert!(project.port.is_none());
        assert!(project.last_deploy.is_none());

        let by_sub = store.get_project_by_subdomain("demo-ab12").await.unwrap();
        assert_eq!(by_sub.id, project.id);
    }

    #[tokio::test]
    async fn test_duplicate_subdomain_is_conflict() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_project(&demo_project("demo-ab12")).await.unwrap();

        let err = store.create_project(&demo_project("demo-ab12")).await.unwrap_err();
        assert_eq!(err.outcome(), Outcome::Conflict);
    }

    #[tokio::test]
    async fn test_status_and_deploy_updates() {
        let store = Store::open_in_memory().await.unwrap();
        let project = store.create_project(&demo_project("demo-ab12")).await.unwrap();

        store
            .update_project_status(project.id, ProjectStatus::Building)
            .await
            .unwrap();
        assert_eq!(
            store.get_project(project.id).await.unwrap().status,
            ProjectStatus::Building
        );

        store.mark_project_deployed(project.id, 3001).await.unwrap();
        let active = store.get_project(project.id).await.unwrap();
        assert_eq!(active.status, ProjectStatus::Active);
        assert_eq!(active.port, Some(3001));
        assert!(active.last_deploy.is_some());

        let listed = store.list_active_projects().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, project.id);
    }

    #[tokio::test]
    async fn test_deployment_lifecycle() {
        let store = Store::open_in_memory().await.unwrap();
        let project = store.create_project(&demo_project("demo-ab12")).await.unwrap();

        let dep_id = store.create_deployment(project.id, "abc123").await.unwrap();
        let dep = store.get_deployment(dep_id).await.unwrap();
        assert_eq!(dep.status, DeploymentStatus::Pending);
        assert!(dep.finished_at.is_none());

        store
            .update_deployment_status(dep_id, DeploymentStatus::Building)
            .await
            .unwrap();
        store
            .finish_deployment(dep_id, DeploymentStatus::Failed, "step: build\nexit 1", Some("build failed"))
            .await
            .unwrap();

        let dep = store.get_deployment(dep_id).await.unwrap();
        assert_eq!(dep.status, DeploymentStatus::Failed);
        assert!(dep.build_log.contains("exit 1"));
        assert_eq!(dep.error_msg.as_deref(), Some("build failed"));
        assert!(dep.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = Store::open_in_memory().await.unwrap();
        let project = store.create_project(&demo_project("demo-ab12")).await.unwrap();
        let dep_id = store.create_deployment(project.id, "").await.unwrap();
        store
            .insert_secret(project.id, "API_KEY", "ciphertext", None)
            .await
            .unwrap();

        store.delete_project(project.id).await.unwrap();

        assert!(store.get_deployment(dep_id).await.is_err());
        assert!(store.list_secrets(project.id).await.unwrap().is_empty());
        assert!(store.get_project(project.id).await.is_err());
    }

    #[tokio::test]
    async fn test_secret_unique_per_project() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.create_project(&demo_project("a-1111")).await.unwrap();
        let b = store.create_project(&demo_project("b-2222")).await.unwrap();

        store.insert_secret(a.id, "API_KEY", "enc-a", None).await.unwrap();
        // Same key in another project is fine.
        store.insert_secret(b.id, "API_KEY", "enc-b", None).await.unwrap();

        let err = store
            .insert_secret(a.id, "API_KEY", "enc-a2", None)
            .await
            .unwrap_err();
        assert_eq!(err.outcome(), Outcome::Conflict);
    }
}
