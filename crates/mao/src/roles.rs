//! Role catalogue: the closed set of specialist roles agents can take.
//!
//! Loaded read-only at startup. The default catalogue is compiled into the
//! binary; a project may override it with its own YAML directory.

use std::collections::BTreeMap;
use std::path::Path;

use coordination::{MaoError, MaoResult, ModelTier};
use serde::{Deserialize, Serialize};

/// One role definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub display_name: String,
    /// Default model tier when a spawn directive names none.
    #[serde(default)]
    pub model: ModelTier,
    #[serde(default)]
    pub responsibilities: Vec<String>,
    /// Optional role prompt file, relative to the roles directory.
    #[serde(default)]
    pub prompt_file: Option<String>,
    #[serde(default)]
    pub coding_standards: Vec<String>,
    #[serde(default)]
    pub additional_context: Vec<String>,
}

/// Built-in role definitions, one YAML document per role.
const BUILTIN_ROLES: &[&str] = &[
    include_str!("../roles/general.yaml"),
    include_str!("../roles/planner.yaml"),
    include_str!("../roles/researcher.yaml"),
    include_str!("../roles/coder_backend.yaml"),
    include_str!("../roles/coder_frontend.yaml"),
    include_str!("../roles/tester.yaml"),
    include_str!("../roles/reviewer.yaml"),
    include_str!("../roles/auditor.yaml"),
];

/// The read-only role catalogue.
#[derive(Debug, Clone)]
pub struct RoleCatalog {
    roles: BTreeMap<String, Role>,
}

impl RoleCatalog {
    /// The catalogue compiled into the binary.
    pub fn builtin() -> Self {
        let mut roles = BTreeMap::new();
        for document in BUILTIN_ROLES {
            // Built-in documents are validated by the test suite.
            if let Ok(role) = serde_yaml::from_str::<Role>(document) {
                roles.insert(role.name.clone(), role);
            }
        }
        Self { roles }
    }

    /// Load a catalogue from a directory of `<role>.yaml` files.
    pub fn load_from_dir(dir: &Path) -> MaoResult<Self> {
        let mut roles = BTreeMap::new();
        for entry in std::fs::read_dir(dir)?.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|x| x.to_str()) != Some("yaml") {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            let role: Role = serde_yaml::from_str(&text).map_err(|e| {
                MaoError::validation(format!("invalid role file {}: {e}", path.display()))
            })?;
            roles.insert(role.name.clone(), role);
        }
        if roles.is_empty() {
            return Err(MaoError::validation(format!(
                "no role definitions found in {}",
                dir.display()
            )));
        }
        Ok(Self { roles })
    }

    pub fn get(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.roles.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.roles.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }

    /// Model for a spawn: the explicit request if given, else the role's
    /// default, else sonnet.
    pub fn resolve_model(&self, role: &str, explicit: Option<&str>) -> String {
        if let Some(model) = explicit {
            return model.to_string();
        }
        self.roles
            .get(role)
            .map(|r| r.model.as_str().to_string())
            .unwrap_or_else(|| ModelTier::Sonnet.as_str().to_string())
    }
}
