//! Resolved project paths, settings and store location

use anyhow::Context as _;
use dashboard_foundation::{ChildEnv, DashboardPaths, DashboardSettings, SettingsLoader, TaskStore};
use std::path::{Path, PathBuf};

pub struct Context {
    pub paths: DashboardPaths,
    pub settings: DashboardSettings,
    db_path: PathBuf,
}

impl Context {
    /// `--db` wins over `DASHBOARD_DB_PATH`, which wins over the project default
    pub fn load(project: Option<PathBuf>, db: Option<PathBuf>) -> anyhow::Result<Self> {
        let paths = match project {
            Some(root) => DashboardPaths::new(
                root.canonicalize()
                    .with_context(|| format!("Project root {} not found", root.display()))?,
            ),
            None => DashboardPaths::current()?,
        };

        let settings = SettingsLoader::new(&paths)
            .load_all()
            .context("Failed to load settings")?;

        let db_path = db
            .or_else(|| ChildEnv::from_env().db_path)
            .unwrap_or_else(|| paths.db_path());

        Ok(Self {
            paths,
            settings,
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn open_store(&self) -> anyhow::Result<TaskStore> {
        TaskStore::open(&self.db_path)
            .with_context(|| format!("Failed to open task store at {}", self.db_path.display()))
    }
}
