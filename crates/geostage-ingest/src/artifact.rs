//! Artifact types flowing between handlers, staging and the summary

use std::path::PathBuf;

use crate::mapping::OutputMapping;
use crate::sources::StagedKind;

/// A file produced by a handler from one sub-resource of one source.
///
/// Owned by the handler until handed to the staging materializer; staging
/// moves the payload into the staging tree on success and leaves it in
/// place (with a `.bad` sibling) on failure.
#[derive(Debug, Clone)]
pub struct RawArtifact {
    pub source_id: String,
    pub authority: String,
    /// Layer index, collection id or archive-member stem
    pub sub_resource: Option<String>,
    pub payload_path: PathBuf,
    /// The handler's claim about the payload format
    pub declared_format: StagedKind,
    /// CRS tag when the handler could determine one (e.g. "EPSG:3006")
    pub declared_crs: Option<String>,
    /// Some pages or members failed; the payload holds what succeeded
    pub partial: bool,
    /// A bbox filter applies but could not be pushed to the server;
    /// downstream processing must apply it
    pub bbox_pending: bool,
}

impl RawArtifact {
    /// Logical name used for canonical naming: the sub-resource when
    /// present, otherwise the payload file stem.
    pub fn logical_name(&self) -> String {
        if let Some(sub) = &self.sub_resource {
            return sub.clone();
        }
        self.payload_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source_id.clone())
    }
}

/// Per-sub-resource result of a handler run
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(RawArtifact),
    Skipped {
        sub_resource: Option<String>,
        reason: String,
    },
    Failed {
        sub_resource: Option<String>,
        reason: String,
    },
}

/// Dominant geometry kind of a JSON-vector artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    Point,
    Line,
    Polygon,
    Mixed,
}

impl GeometryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryKind::Point => "point",
            GeometryKind::Line => "line",
            GeometryKind::Polygon => "polygon",
            GeometryKind::Mixed => "mixed",
        }
    }
}

/// A staged dataset ready for the downstream spatial loader
#[derive(Debug, Clone)]
pub struct StagedEntry {
    pub source_id: String,
    pub authority: String,
    /// Sanitized, collision-resolved identifier, unique per staging root
    pub canonical_name: String,
    pub path: PathBuf,
    pub format: StagedKind,
    pub crs: Option<String>,
    /// Best effort; `None` when the format gives no cheap count
    pub feature_count: Option<u64>,
    pub geometry_kind: Option<GeometryKind>,
    pub partial: bool,
    /// Explicit downstream mapping, carried through opaquely
    pub mapping: Option<OutputMapping>,
}
