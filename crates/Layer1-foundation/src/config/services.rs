//! Service list - `.dashboard/services.json`
//!
//! ```json
//! {"services": [{"id": "web", "name": "Web", "command": "npm run dev", "cwd": "web", "port": 3000}]}
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// One declared dev service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: String,

    pub name: String,

    /// Shell command line
    pub command: String,

    /// Working directory relative to the project root
    #[serde(default = "default_cwd")]
    pub cwd: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

fn default_cwd() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesFile {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// Load the service list
///
/// A missing file means no services. An unreadable or invalid file is logged
/// and also treated as empty.
pub fn load_services(path: &Path) -> Vec<ServiceSpec> {
    if !path.exists() {
        debug!("No services config at {}", path.display());
        return Vec::new();
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    match serde_json::from_str::<ServicesFile>(&content) {
        Ok(file) => file.services,
        Err(e) => {
            warn!("Failed to parse {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
