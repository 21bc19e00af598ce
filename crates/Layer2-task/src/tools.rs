//! Task Tools - the store operations an agent process performs
//!
//! Runs inside the spawned agent (or any process pointed at the store by
//! `DASHBOARD_DB_PATH`). The server and the agent coordinate through the
//! store alone.

use crate::question::{AskOutcome, AskRequest, QuestionBroker};
use dashboard_foundation::config::ARTIFACTS_DIR;
use dashboard_foundation::strings::short_id;
use dashboard_foundation::{
    ActivityKind, Artifact, ChildEnv, Error, NewArtifact, NewTask, QuestionSettings, Result, Task,
    TaskPatch, TaskStatus, TaskStore, TaskView,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Agent name for root tasks registered by the orchestrator
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";

fn default_artifact_type() -> String {
    "file".to_string()
}

/// A file to register as a task artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRequest {
    pub task_id: String,
    /// Absolute, or relative to the project root
    pub file_path: PathBuf,
    /// screenshot, markdown_report, eval_report, file, ...
    #[serde(default = "default_artifact_type")]
    pub artifact_type: String,
    /// Defaults to the file name
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Child-side task operations
#[derive(Debug, Clone)]
pub struct TaskTools {
    store: TaskStore,
    env: ChildEnv,
    project_root: PathBuf,
    broker: QuestionBroker,
}

impl TaskTools {
    pub fn new(
        store: TaskStore,
        env: ChildEnv,
        project_root: impl Into<PathBuf>,
        questions: QuestionSettings,
    ) -> Self {
        let broker = QuestionBroker::new(store.clone(), questions);
        Self {
            store,
            env,
            project_root: project_root.into(),
            broker,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Snapshot directory next to the database
    pub fn artifacts_dir(&self) -> PathBuf {
        self.store
            .path()
            .parent()
            .unwrap_or(&self.project_root)
            .join(ARTIFACTS_DIR)
    }

    /// Register the root task for this run
    ///
    /// A dashboard-spawned agent resumes the task named by
    /// `DASHBOARD_TASK_ID`; otherwise a new root task is created.
    pub fn register_task(&self, title: &str, description: Option<&str>) -> Result<Task> {
        if let Some(ref task_id) = self.env.task_id {
            if self.store.find_task(task_id)?.is_some() {
                let task = self
                    .store
                    .update_task(task_id, &TaskPatch::new().status(TaskStatus::InProgress))?
                    .ok_or_else(|| Error::not_found("Task", task_id))?;
                self.store.log_activity(
                    task_id,
                    ActivityKind::Message,
                    "Orchestrator started",
                    Some(ORCHESTRATOR_AGENT),
                )?;
                info!("Resumed dashboard task {}", task_id);
                return Ok(task);
            }
            debug!("{} not in store, creating a new root task", task_id);
        }

        let mut new = NewTask::new(title)
            .with_agent(ORCHESTRATOR_AGENT)
            .with_status(TaskStatus::InProgress);
        if let Some(description) = description {
            new = new.with_description(description);
        }
        let task = self.store.create_task(&new)?;
        info!("Registered root task {}: {}", task.id, task.title);
        Ok(task)
    }

    /// Create a pending subtask; `auto_accept` and `source` come from the parent
    pub fn create_subtask(
        &self,
        parent_id: &str,
        title: &str,
        assigned_agent: Option<&str>,
        description: Option<&str>,
    ) -> Result<Task> {
        let parent = self
            .store
            .find_task(parent_id)?
            .ok_or_else(|| Error::not_found("Task", parent_id))?;

        let mut new = NewTask::new(title)
            .with_parent(parent_id)
            .with_auto_accept(parent.auto_accept)
            .with_source(parent.source);
        if let Some(agent) = assigned_agent.filter(|a| !a.is_empty()) {
            new = new.with_agent(agent);
        }
        if let Some(description) = description {
            new = new.with_description(description);
        }
        self.store.create_task(&new)
    }

    pub fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<Task> {
        let mut patch = TaskPatch::new().status(status);
        if let Some(result) = result.filter(|r| !r.is_empty()) {
            patch = patch.result(result);
        }
        self.store
            .update_task(task_id, &patch)?
            .ok_or_else(|| Error::not_found("Task", task_id))
    }

    pub fn update_phase(&self, task_id: &str, phase: &str) -> Result<Task> {
        self.store
            .update_task(task_id, &TaskPatch::new().phase(phase))?
            .ok_or_else(|| Error::not_found("Task", task_id))
    }

    /// Append a free-form message to the activity log
    pub fn log(&self, task_id: &str, message: &str, agent: Option<&str>) -> Result<i64> {
        self.store.log_activity(
            task_id,
            ActivityKind::Message,
            message,
            agent.filter(|a| !a.is_empty()),
        )
    }

    /// Ask a question and wait for the answer
    pub async fn ask(&self, request: &AskRequest) -> Result<AskOutcome> {
        self.broker.ask(request).await
    }

    /// Snapshot a file under the artifacts directory and record it
    ///
    /// The source must exist and lie inside the project root.
    pub fn add_artifact(&self, request: &ArtifactRequest) -> Result<Artifact> {
        if self.store.find_task(&request.task_id)?.is_none() {
            return Err(Error::not_found("Task", &request.task_id));
        }

        let source = if request.file_path.is_absolute() {
            request.file_path.clone()
        } else {
            self.project_root.join(&request.file_path)
        };
        let source = source
            .canonicalize()
            .map_err(|_| Error::not_found("File", request.file_path.display()))?;
        if !source.is_file() {
            return Err(Error::InvalidInput(format!(
                "Not a regular file: {}",
                request.file_path.display()
            )));
        }

        let root = self.project_root.canonicalize()?;
        if !source.starts_with(&root) {
            return Err(Error::InvalidInput(
                "Access denied: file must be within the project directory".to_string(),
            ));
        }

        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let label = request
            .label
            .clone()
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| file_name.clone());
        let mime_type = mime_guess::from_path(&source)
            .first()
            .map(|m| m.essence_str().to_string());

        let artifact_id = short_id();
        let dest = snapshot(&source, &self.artifacts_dir().join(&artifact_id), &file_name)?;

        self.store.create_artifact(&NewArtifact {
            id: artifact_id,
            task_id: request.task_id.clone(),
            artifact_type: request.artifact_type.clone(),
            label,
            file_path: dest.display().to_string(),
            mime_type,
            metadata: request.metadata.clone(),
        })
    }

    /// Task with children and pending question count
    pub fn get_task(&self, task_id: &str) -> Result<TaskView> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| Error::not_found("Task", task_id))
    }
}

/// Copy `source` into `dir/file_name` so later edits don't change the artifact
fn snapshot(source: &Path, dir: &Path, file_name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let dest = dir.join(file_name);
    std::fs::copy(source, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashboard_foundation::TaskSource;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        store: TaskStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = dir.path().to_path_buf();
        let store = TaskStore::open(root.join(".dashboard").join("tasks.db")).unwrap();
        Fixture {
            _dir: dir,
            root,
            store,
        }
    }

    fn tools(fx: &Fixture, task_id: Option<&str>) -> TaskTools {
        let env = ChildEnv {
            task_id: task_id.map(str::to_string),
            db_path: Some(fx.store.path().to_path_buf()),
        };
        TaskTools::new(fx.store.clone(), env, &fx.root, QuestionSettings::default())
    }

    #[test]
    fn test_register_resumes_env_task() {
        let fx = fixture();
        let task = fx.store.create_task(&NewTask::new("from dashboard")).unwrap();
        let tools = tools(&fx, Some(&task.id));

        let registered = tools.register_task("ignored", None).unwrap();
        assert_eq!(registered.id, task.id);
        assert_eq!(registered.status, TaskStatus::InProgress);
        assert_eq!(fx.store.root_tasks().unwrap().len(), 1);

        let last = fx.store.activity(Some(&task.id), 1, false).unwrap();
        assert_eq!(last[0].message, "Orchestrator started");
        assert_eq!(last[0].agent.as_deref(), Some(ORCHESTRATOR_AGENT));
    }

    #[test]
    fn test_register_creates_root_task() {
        let fx = fixture();
        // Unknown env id falls back to creating a task
        let tools = tools(&fx, Some("deadbeef"));
        let task = tools.register_task("Build auth", Some("JWT")).unwrap();
        assert_ne!(task.id, "deadbeef");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agent.as_deref(), Some(ORCHESTRATOR_AGENT));
        assert_eq!(task.source, TaskSource::Cli);
    }

    #[test]
    fn test_subtask_inherits_auto_accept_and_source() {
        let fx = fixture();
        let parent = fx
            .store
            .create_task(
                &NewTask::new("root")
                    .with_auto_accept(true)
                    .with_source(TaskSource::Dashboard),
            )
            .unwrap();
        let tools = tools(&fx, None);

        let child = tools
            .create_subtask(&parent.id, "frontend", Some("frontend-developer"), None)
            .unwrap();
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert!(child.auto_accept);
        assert_eq!(child.source, TaskSource::Dashboard);
        assert_eq!(child.status, TaskStatus::Pending);

        assert!(matches!(
            tools.create_subtask("missing", "x", None, None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_update_status_and_phase() {
        let fx = fixture();
        let task = fx.store.create_task(&NewTask::new("t")).unwrap();
        let tools = tools(&fx, None);

        let updated = tools
            .update_status(&task.id, TaskStatus::Completed, Some("done"))
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Completed);
        assert_eq!(updated.result.as_deref(), Some("done"));

        // Empty result leaves the previous one
        let updated = tools.update_status(&task.id, TaskStatus::Failed, Some("")).unwrap();
        assert_eq!(updated.result.as_deref(), Some("done"));

        let updated = tools.update_phase(&task.id, "testing").unwrap();
        assert_eq!(updated.phase.as_deref(), Some("testing"));

        assert!(tools.update_phase("missing", "x").is_err());
    }

    #[test]
    fn test_log_and_get_task() {
        let fx = fixture();
        let task = fx.store.create_task(&NewTask::new("t")).unwrap();
        let tools = tools(&fx, None);

        tools.log(&task.id, "halfway there", Some("grind")).unwrap();
        let last = fx.store.activity(Some(&task.id), 1, false).unwrap();
        assert_eq!(last[0].message, "halfway there");
        assert_eq!(last[0].agent.as_deref(), Some("grind"));

        let view = tools.get_task(&task.id).unwrap();
        assert_eq!(view.task.id, task.id);
        assert!(matches!(tools.get_task("missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_add_artifact_snapshots_file() {
        let fx = fixture();
        let task = fx.store.create_task(&NewTask::new("t")).unwrap();
        let tools = tools(&fx, None);

        std::fs::write(fx.root.join("report.md"), "# Report").unwrap();
        let artifact = tools
            .add_artifact(&ArtifactRequest {
                task_id: task.id.clone(),
                file_path: PathBuf::from("report.md"),
                artifact_type: "markdown_report".into(),
                label: None,
                metadata: Some(serde_json::json!({"score": 9})),
            })
            .unwrap();

        assert_eq!(artifact.label, "report.md");
        assert_eq!(artifact.mime_type.as_deref(), Some("text/markdown"));
        assert_eq!(artifact.metadata["score"], 9);

        let dest = PathBuf::from(&artifact.file_path);
        assert!(dest.starts_with(tools.artifacts_dir().join(&artifact.id)));
        // Later edits to the source don't touch the snapshot
        std::fs::write(fx.root.join("report.md"), "changed").unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "# Report");
    }

    #[test]
    fn test_add_artifact_rejects_outside_and_missing() {
        let fx = fixture();
        let task = fx.store.create_task(&NewTask::new("t")).unwrap();
        let tools = tools(&fx, None);

        let outside = tempfile::NamedTempFile::new().unwrap();
        let request = |path: PathBuf| ArtifactRequest {
            task_id: task.id.clone(),
            file_path: path,
            artifact_type: default_artifact_type(),
            label: None,
            metadata: None,
        };

        assert!(matches!(
            tools.add_artifact(&request(outside.path().to_path_buf())),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            tools.add_artifact(&request(PathBuf::from("nope.txt"))),
            Err(Error::NotFound(_))
        ));
    }
}
