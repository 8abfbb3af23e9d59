//! Staging materializer
//!
//! Turns raw artifacts into the uniform staging layout the downstream
//! spatial loader consumes: validated payloads under
//! `<staging>/<authority>/<source_id>/<canonical_name>.<ext>` with a
//! `.meta` sidecar per entry. A malformed artifact fails alone; the
//! offending file stays where it was with a `.bad` sibling describing the
//! error, and sibling artifacts proceed.

mod container;
mod json_vector;
mod split;

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use geostage_common::naming::{resolve_collision, sanitize_identifier};
use geostage_common::{GeostageError, Result};
use tracing::{debug, info, warn};

use crate::artifact::{RawArtifact, StagedEntry};
use crate::mapping::MappingSet;
use crate::sources::{SourceDescriptor, StagedKind};

/// Registry of canonical names already claimed within one staging root.
///
/// Entries are only ever added during a run, never removed, so two staged
/// entries can never share a name.
#[derive(Debug, Default)]
pub struct NameRegistry {
    used: Mutex<HashSet<String>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a collision-free canonical name derived from `base`
    pub fn claim(&self, base: &str) -> String {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let name = resolve_collision(base, &used);
        used.insert(name.clone());
        name
    }

    #[cfg(test)]
    pub fn contains(&self, name: &str) -> bool {
        self.used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }
}

/// Validates and canonicalizes raw artifacts into the staging tree
pub struct Materializer<'a> {
    staging_root: &'a Path,
    names: &'a NameRegistry,
    mappings: &'a MappingSet,
}

impl<'a> Materializer<'a> {
    pub fn new(staging_root: &'a Path, names: &'a NameRegistry, mappings: &'a MappingSet) -> Self {
        Self {
            staging_root,
            names,
            mappings,
        }
    }

    /// Stage one artifact, producing one entry per staged dataset.
    ///
    /// Split-vector archives may hold several primaries and containers may
    /// hold several feature classes, so an artifact can expand into
    /// multiple entries.
    pub fn stage(
        &self,
        source: &SourceDescriptor,
        artifact: &RawArtifact,
    ) -> Result<Vec<StagedEntry>> {
        debug!(
            source = %artifact.source_id,
            payload = %artifact.payload_path.display(),
            format = artifact.declared_format.as_str(),
            "Staging artifact"
        );

        let result = match artifact.declared_format {
            StagedKind::ArchiveOfSplitVector => split::stage_archive(self, source, artifact),
            StagedKind::SplitVector => split::stage_on_disk(self, artifact),
            StagedKind::ContainerVector => container::stage(self, source, artifact),
            StagedKind::JsonVector => json_vector::stage(self, artifact),
        };

        match result {
            Ok(entries) => {
                for entry in &entries {
                    if let Err(e) = self.write_sidecar(entry, artifact) {
                        warn!(entry = %entry.canonical_name, error = %e, "Could not write sidecar");
                    }
                    info!(
                        name = %entry.canonical_name,
                        format = entry.format.as_str(),
                        features = ?entry.feature_count,
                        "Staged"
                    );
                }
                Ok(entries)
            },
            Err(e) => {
                self.mark_bad(&artifact.payload_path, &e);
                Err(e)
            },
        }
    }

    /// Staging directory for an artifact's source
    pub(crate) fn source_dir(&self, artifact: &RawArtifact) -> PathBuf {
        self.staging_root
            .join(&artifact.authority)
            .join(&artifact.source_id)
    }

    /// Claim a canonical name for a logical sub-resource name
    pub(crate) fn claim_name(&self, artifact: &RawArtifact, logical_name: &str) -> String {
        let base = sanitize_identifier(&format!("{}_{}", artifact.authority, logical_name));
        self.names.claim(&base)
    }

    /// Build a staged entry with its mapping override attached
    pub(crate) fn entry(
        &self,
        artifact: &RawArtifact,
        canonical_name: String,
        path: PathBuf,
        format: StagedKind,
        crs: Option<String>,
        feature_count: Option<u64>,
        geometry_kind: Option<crate::artifact::GeometryKind>,
    ) -> StagedEntry {
        let mapping = self.mappings.lookup(&canonical_name).cloned();
        if mapping.is_none() && self.mappings.settings.skip_unmappable_sources {
            // The engine carries mappings opaquely; the flag is surfaced
            // for the downstream loader, which owns the skip decision.
            warn!(name = %canonical_name, "No mapping override for entry and skip_unmappable_sources is set");
        }
        StagedEntry {
            source_id: artifact.source_id.clone(),
            authority: artifact.authority.clone(),
            canonical_name,
            path,
            format,
            crs: crs.or_else(|| artifact.declared_crs.clone()),
            feature_count,
            geometry_kind,
            partial: artifact.partial,
            mapping,
        }
    }

    /// Write the `.meta` sidecar next to a staged entry
    fn write_sidecar(&self, entry: &StagedEntry, artifact: &RawArtifact) -> std::io::Result<()> {
        let sidecar = entry.path.with_file_name(format!("{}.meta", entry.canonical_name));
        let mut file = fs::File::create(sidecar)?;
        writeln!(file, "source={}", entry.source_id)?;
        writeln!(file, "authority={}", entry.authority)?;
        writeln!(file, "format={}", entry.format.as_str())?;
        writeln!(file, "crs={}", entry.crs.as_deref().unwrap_or("unknown"))?;
        if let Some(count) = entry.feature_count {
            writeln!(file, "feature_count={}", count)?;
        }
        if let Some(kind) = entry.geometry_kind {
            writeln!(file, "geometry={}", kind.as_str())?;
        }
        writeln!(file, "partial={}", entry.partial)?;
        if artifact.bbox_pending {
            writeln!(file, "bbox_pending=true")?;
        }
        if let Some(mapping) = &entry.mapping {
            writeln!(file, "sde_dataset={}", mapping.sde_dataset)?;
            writeln!(file, "sde_fc={}", mapping.sde_fc)?;
            if let Some(schema) = &mapping.schema {
                writeln!(file, "sde_schema={}", schema)?;
            }
        }
        Ok(())
    }

    /// Preserve a failed payload and describe the failure in a `.bad`
    /// sibling for debugging
    fn mark_bad(&self, payload: &Path, error: &GeostageError) {
        let mut name = payload
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| std::ffi::OsString::from("artifact"));
        name.push(".bad");
        let bad_path = payload.with_file_name(name);
        if let Err(e) = fs::write(&bad_path, format!("{}\n", error)) {
            warn!(path = %bad_path.display(), error = %e, "Could not write .bad marker");
        } else {
            warn!(
                payload = %payload.display(),
                marker = %bad_path.display(),
                "Artifact failed staging, payload preserved"
            );
        }
    }
}

/// Move a file, falling back to copy+remove across filesystems
pub(crate) fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_name_registry_claims_are_unique() {
        let registry = NameRegistry::new();
        let first = registry.claim("nvv_kust");
        let second = registry.claim("nvv_kust");
        let third = registry.claim("nvv_kust");
        assert_eq!(first, "nvv_kust");
        assert_eq!(second, "nvv_kust_1");
        assert_eq!(third, "nvv_kust_2");
        assert!(registry.contains("nvv_kust_2"));
    }

    #[test]
    fn test_move_file() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.txt");
        let to = dir.path().join("b.txt");
        fs::write(&from, b"payload").unwrap();
        move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"payload");
    }
}
