//! Settings Loader
//!
//! ## 검색 우선순위
//!
//! 1. User-level: `~/.dashboard/settings.json`
//! 2. Project-level: `.dashboard/settings.json`
//! 3. Local (gitignored): `.dashboard/settings.local.json`
//!
//! 각 레벨의 설정이 이전 레벨을 오버라이드합니다. 병합은 JSON 객체 단위로
//! 수행되므로 하위 레벨은 바꾸고 싶은 키만 적으면 된다.

use super::paths::{DashboardPaths, DATA_DIR_NAME, SETTINGS_FILE};
use super::settings::DashboardSettings;
use crate::{Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// SettingsLoader
// ============================================================================

/// 설정 파일 경로 정보
#[derive(Debug, Clone)]
struct SettingsPath {
    path: PathBuf,
    /// 우선순위 (높을수록 우선)
    priority: u8,
    description: &'static str,
}

/// 설정 로더
pub struct SettingsLoader {
    search_paths: Vec<SettingsPath>,
}

impl SettingsLoader {
    /// 새 로더 생성 (기본 검색 경로)
    pub fn new(paths: &DashboardPaths) -> Self {
        let mut search_paths = Vec::new();

        if let Some(home) = dirs::home_dir() {
            search_paths.push(SettingsPath {
                path: home.join(DATA_DIR_NAME).join(SETTINGS_FILE),
                priority: 10,
                description: "User settings",
            });
        }

        search_paths.push(SettingsPath {
            path: paths.settings_file(),
            priority: 20,
            description: "Project settings",
        });

        search_paths.push(SettingsPath {
            path: paths.local_settings_file(),
            priority: 30,
            description: "Local settings",
        });

        search_paths.sort_by_key(|p| p.priority);
        Self { search_paths }
    }

    /// 커스텀 검색 경로로 생성 (앞쪽이 낮은 우선순위)
    pub fn with_paths(paths: Vec<PathBuf>) -> Self {
        let search_paths = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| SettingsPath {
                path,
                priority: i as u8,
                description: "Custom",
            })
            .collect();
        Self { search_paths }
    }

    /// 모든 경로에서 설정 로드하여 병합
    ///
    /// A file that fails to parse is skipped with a warning; the remaining
    /// levels still apply.
    pub fn load_all(&self) -> Result<DashboardSettings> {
        let mut merged = Value::Object(Default::default());

        for settings_path in &self.search_paths {
            if !settings_path.path.exists() {
                continue;
            }
            match read_json(&settings_path.path) {
                Ok(value) => {
                    info!(
                        "Loaded {} from: {}",
                        settings_path.description,
                        settings_path.path.display()
                    );
                    merge_json(&mut merged, value);
                }
                Err(e) => {
                    warn!(
                        "Failed to load settings from {}: {}",
                        settings_path.path.display(),
                        e
                    );
                }
            }
        }

        let settings: DashboardSettings = serde_json::from_value(merged)
            .map_err(|e| Error::Config(format!("Invalid dashboard settings: {}", e)))?;
        debug!(
            "Effective settings: agent={}, tick={}ms",
            settings.agent.program, settings.sync.tick_ms
        );
        Ok(settings)
    }

    /// 존재하는 설정 파일 목록
    pub fn existing_files(&self) -> Vec<PathBuf> {
        self.search_paths
            .iter()
            .filter(|p| p.path.exists())
            .map(|p| p.path.clone())
            .collect()
    }
}

// ============================================================================
// 유틸리티 함수
// ============================================================================

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// 두 JSON 값 병합 (later가 earlier를 오버라이드, 객체는 재귀 병합)
pub fn merge_json(earlier: &mut Value, later: Value) {
    match (earlier, later) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_json_nested() {
        let mut base = json!({"sync": {"tickMs": 500, "channelCapacity": 10}, "agent": {"program": "claude"}});
        merge_json(&mut base, json!({"sync": {"tickMs": 50}}));
        assert_eq!(base["sync"]["tickMs"], 50);
        assert_eq!(base["sync"]["channelCapacity"], 10);
        assert_eq!(base["agent"]["program"], "claude");
    }

    #[test]
    fn test_load_all_layers() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let project = dir.path().join("project.json");
        let local = dir.path().join("local.json");
        std::fs::write(&project, r#"{"questions": {"timeoutSecs": 60, "pollIntervalMs": 10}}"#)
            .unwrap();
        std::fs::write(&local, r#"{"questions": {"timeoutSecs": 3}}"#).unwrap();

        let loader = SettingsLoader::with_paths(vec![project, local]);
        let settings = loader.load_all().expect("Failed to load settings");
        assert_eq!(settings.questions.timeout_secs, 3);
        assert_eq!(settings.questions.poll_interval_ms, 10);
    }

    #[test]
    fn test_invalid_file_is_skipped() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();

        let loader = SettingsLoader::with_paths(vec![broken.clone()]);
        let settings = loader.load_all().expect("Failed to load settings");
        assert_eq!(settings.sync.tick_ms, 500);
        assert_eq!(loader.existing_files(), vec![broken]);
    }
}
