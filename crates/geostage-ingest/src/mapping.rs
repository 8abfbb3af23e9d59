//! Name-mapping overrides for the downstream spatial loader
//!
//! The overrides document maps staged feature-class names to explicit
//! dataset and feature-class names in the production database. The engine
//! does not interpret these; it attaches the matching override to each
//! StagedEntry so the downstream loader never has to re-derive names.

use std::collections::HashMap;
use std::path::Path;

use geostage_common::{GeostageError, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Explicit mapping from a staging feature class to its production target
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OutputMapping {
    pub staging_fc: String,
    pub sde_fc: String,
    pub sde_dataset: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub schema: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Global mapping behavior knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MappingSettings {
    pub default_dataset_pattern: String,
    /// Skip sources whose staged entries have no explicit mapping
    pub skip_unmappable_sources: bool,
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            default_dataset_pattern: "Underlag_{authority}".to_string(),
            skip_unmappable_sources: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct MappingDocument {
    #[serde(default)]
    settings: Option<MappingSettings>,
    #[serde(default)]
    mappings: Vec<OutputMapping>,
}

/// Loaded overrides, indexed by staging feature-class name
#[derive(Debug, Clone, Default)]
pub struct MappingSet {
    pub settings: MappingSettings,
    by_staging_fc: HashMap<String, OutputMapping>,
}

impl MappingSet {
    /// Load overrides from a YAML document. A missing file is not an
    /// error; the engine simply carries no overrides.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No mapping overrides file, using defaults only");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            GeostageError::config(
                format!("cannot read {}: {}", path.display(), e),
                "check the --mappings path",
            )
        })?;
        let doc: MappingDocument = serde_yaml::from_str(&text).map_err(|e| {
            GeostageError::config(
                format!("invalid YAML in {}: {}", path.display(), e),
                "the overrides file needs 'settings' and/or 'mappings' sections",
            )
        })?;

        let mut by_staging_fc = HashMap::new();
        for mapping in doc.mappings {
            if mapping.staging_fc.trim().is_empty()
                || mapping.sde_fc.trim().is_empty()
                || mapping.sde_dataset.trim().is_empty()
            {
                warn!(?mapping, "Skipping mapping with empty field");
                continue;
            }
            debug!(
                staging_fc = %mapping.staging_fc,
                target = format!("{}.{}", mapping.sde_dataset, mapping.sde_fc),
                "Loaded mapping override"
            );
            by_staging_fc.insert(mapping.staging_fc.clone(), mapping);
        }

        info!(count = by_staging_fc.len(), "Loaded mapping overrides");
        Ok(Self {
            settings: doc.settings.unwrap_or_default(),
            by_staging_fc,
        })
    }

    /// Override for a staged feature class, if one is configured and enabled
    pub fn lookup(&self, staging_fc: &str) -> Option<&OutputMapping> {
        self.by_staging_fc
            .get(staging_fc)
            .filter(|m| m.enabled)
    }

    pub fn len(&self) -> usize {
        self.by_staging_fc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_staging_fc.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_mappings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
settings:
  skip_unmappable_sources: false
mappings:
  - staging_fc: nvv_naturreservat
    sde_fc: Naturreservat
    sde_dataset: Underlag_NVV
  - staging_fc: lst_bete
    sde_fc: Betesmark
    sde_dataset: Underlag_LST
    enabled: false
"#,
        )
        .unwrap();

        let set = MappingSet::load(file.path()).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.lookup("nvv_naturreservat").is_some());
        // Disabled mappings are carried but never returned.
        assert!(set.lookup("lst_bete").is_none());
        assert!(set.lookup("okand").is_none());
        assert!(!set.settings.skip_unmappable_sources);
    }

    #[test]
    fn test_missing_file_is_empty_set() {
        let set = MappingSet::load(Path::new("/nonexistent/mappings.yaml")).unwrap();
        assert!(set.is_empty());
    }
}
