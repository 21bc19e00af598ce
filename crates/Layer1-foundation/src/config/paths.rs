//! `.dashboard/` 디렉토리 레이아웃

use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// 데이터 폴더 이름
pub const DATA_DIR_NAME: &str = ".dashboard";
/// SQLite 데이터베이스 파일명
pub const DB_FILE: &str = "tasks.db";
/// 서비스 목록 파일명
pub const SERVICES_FILE: &str = "services.json";
/// 설정 파일명
pub const SETTINGS_FILE: &str = "settings.json";
/// 로컬 설정 파일명 (gitignored)
pub const SETTINGS_LOCAL_FILE: &str = "settings.local.json";
/// 아티팩트 스냅샷 폴더
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Resolved locations for one project
#[derive(Debug, Clone)]
pub struct DashboardPaths {
    project_root: PathBuf,
    data_dir: PathBuf,
}

impl DashboardPaths {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let data_dir = project_root.join(DATA_DIR_NAME);
        Self {
            project_root,
            data_dir,
        }
    }

    /// 현재 디렉토리 기준
    pub fn current() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
        Ok(Self::new(cwd))
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn services_file(&self) -> PathBuf {
        self.data_dir.join(SERVICES_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn local_settings_file(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_LOCAL_FILE)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join(ARTIFACTS_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = DashboardPaths::new("/work/project");
        assert_eq!(paths.db_path(), PathBuf::from("/work/project/.dashboard/tasks.db"));
        assert_eq!(
            paths.services_file(),
            PathBuf::from("/work/project/.dashboard/services.json")
        );
        assert_eq!(
            paths.artifacts_dir(),
            PathBuf::from("/work/project/.dashboard/artifacts")
        );
    }
}
