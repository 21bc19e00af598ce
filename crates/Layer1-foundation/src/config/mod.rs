//! Config - 대시보드 설정 관리
//!
//! - `paths.rs` - `.dashboard/` 디렉토리 레이아웃
//! - `settings.rs` - DashboardSettings 통합 설정
//! - `loader.rs` - 사용자/프로젝트/로컬 settings.json 병합 로더
//! - `services.rs` - services.json 서비스 목록

mod loader;
mod paths;
mod services;
mod settings;

pub use loader::{merge_json, SettingsLoader};
pub use paths::{
    DashboardPaths, ARTIFACTS_DIR, DATA_DIR_NAME, DB_FILE, SERVICES_FILE, SETTINGS_FILE,
    SETTINGS_LOCAL_FILE,
};
pub use services::{load_services, ServiceSpec, ServicesFile};
pub use settings::{
    AgentSettings, DashboardSettings, QuestionSettings, ServiceSettings, SupervisorSettings,
    SyncSettings, PROMPT_PLACEHOLDER, REQUIRED_TOOLS,
};
