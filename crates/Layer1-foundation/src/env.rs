//! Environment contract between the supervisor and a spawned agent
//!
//! The child process never shares memory with the server. It learns which
//! task it works on and where the store lives from these two variables.

use std::path::PathBuf;

/// Task id the child should attach to
pub const TASK_ID_ENV: &str = "DASHBOARD_TASK_ID";

/// Absolute path to the shared SQLite store
pub const DB_PATH_ENV: &str = "DASHBOARD_DB_PATH";

/// Values read from the environment inside a child process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildEnv {
    pub task_id: Option<String>,
    pub db_path: Option<PathBuf>,
}

impl ChildEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 테스트용: 임의의 조회 함수로 생성
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            task_id: non_empty(TASK_ID_ENV),
            db_path: non_empty(DB_PATH_ENV).map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_lookup() {
        let env = ChildEnv::from_lookup(|key| match key {
            TASK_ID_ENV => Some("abcd1234".to_string()),
            DB_PATH_ENV => Some("/tmp/tasks.db".to_string()),
            _ => None,
        });
        assert_eq!(env.task_id.as_deref(), Some("abcd1234"));
        assert_eq!(env.db_path, Some(PathBuf::from("/tmp/tasks.db")));
    }

    #[test]
    fn test_blank_values_ignored() {
        let env = ChildEnv::from_lookup(|_| Some("  ".to_string()));
        assert_eq!(env, ChildEnv::default());
    }
}
