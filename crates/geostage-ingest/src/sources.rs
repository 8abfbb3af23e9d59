//! Source model and inventory loader
//!
//! A source describes one upstream dataset endpoint: where it lives, which
//! protocol handler fetches it and what kind of artifact staging should
//! expect. The inventory document is an ordered list of source records;
//! records that fail validation are rejected individually so one bad entry
//! never aborts the whole run.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use geostage_common::naming::sanitize_identifier;
use geostage_common::{GeostageError, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Protocol family a source is fetched with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// One or more files downloaded directly from a base URL
    DirectFile,
    /// Atom feed whose entries link to downloadable resources
    Feed,
    /// ESRI-style REST query endpoint with numbered layers
    TiledQuery,
    /// OGC API Features endpoint with a collections index
    TiledCollection,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::DirectFile => "file",
            SourceKind::Feed => "atom_feed",
            SourceKind::TiledQuery => "rest_api",
            SourceKind::TiledCollection => "ogc_api",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(SourceKind::DirectFile),
            "atom_feed" => Some(SourceKind::Feed),
            "rest_api" => Some(SourceKind::TiledQuery),
            "ogc_api" => Some(SourceKind::TiledCollection),
            _ => None,
        }
    }
}

/// Artifact family expected after staging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedKind {
    /// Zip archive holding a shapefile with its companion files
    ArchiveOfSplitVector,
    /// Shapefile with companions, uncompressed on disk
    SplitVector,
    /// Single-file container (GeoPackage)
    ContainerVector,
    /// GeoJSON feature collection
    JsonVector,
}

impl StagedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagedKind::ArchiveOfSplitVector => "shapefile_collection",
            StagedKind::SplitVector => "shapefile",
            StagedKind::ContainerVector => "gpkg",
            StagedKind::JsonVector => "geojson",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "shapefile_collection" => Some(StagedKind::ArchiveOfSplitVector),
            "shapefile" => Some(StagedKind::SplitVector),
            "gpkg" => Some(StagedKind::ContainerVector),
            // json and geojson normalize to the same staged kind
            "geojson" | "json" => Some(StagedKind::JsonVector),
            _ => None,
        }
    }
}

/// Rectangular geographic filter with its CRS identifier
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
    /// CRS of the coordinates: an EPSG code ("3006") or a CRS URI
    pub crs: String,
}

impl BoundingBox {
    /// Parse "xmin,ymin,xmax,ymax" plus a CRS tag
    pub fn parse(coords: &str, crs: &str) -> Result<Self> {
        let parts: Vec<f64> = coords
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| GeostageError::parse("bbox", format!("'{}': {}", coords, e)))?;
        if parts.len() != 4 {
            return Err(GeostageError::parse(
                "bbox",
                format!("expected 4 coordinates, got {}", parts.len()),
            ));
        }
        let bbox = Self {
            xmin: parts[0],
            ymin: parts[1],
            xmax: parts[2],
            ymax: parts[3],
            crs: crs.to_string(),
        };
        if bbox.xmin > bbox.xmax || bbox.ymin > bbox.ymax {
            return Err(GeostageError::parse(
                "bbox",
                format!("min exceeds max in '{}'", coords),
            ));
        }
        Ok(bbox)
    }

    /// Coordinates in the "xmin,ymin,xmax,ymax" wire form
    pub fn coords_string(&self) -> String {
        format!("{},{},{},{}", self.xmin, self.ymin, self.xmax, self.ymax)
    }
}

/// Validated, immutable description of one upstream dataset
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Stable identifier derived from authority and name
    pub id: String,
    /// Free-form human name, may contain non-ASCII
    pub name: String,
    /// Short tag for the publishing organization (e.g. "NVV", "LST")
    pub authority: String,
    pub kind: SourceKind,
    pub url: String,
    pub enabled: bool,
    /// Expected artifact family; handlers may infer one when absent
    pub staged_kind: Option<StagedKind>,
    /// Allow-list of sub-resource names (layer ids, collection ids, stems)
    pub include: Vec<String>,
    /// Preferred download extension for DirectFile collections
    pub download_format: Option<String>,
    /// Handler-specific options preserved verbatim
    pub raw: BTreeMap<String, serde_yaml::Value>,
}

impl SourceDescriptor {
    /// String-valued raw option
    pub fn raw_str(&self, key: &str) -> Option<String> {
        match self.raw.get(key)? {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Integer-valued raw option
    pub fn raw_u64(&self, key: &str) -> Option<u64> {
        match self.raw.get(key)? {
            serde_yaml::Value::Number(n) => n.as_u64(),
            serde_yaml::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Boolean-valued raw option
    pub fn raw_bool(&self, key: &str) -> Option<bool> {
        self.raw.get(key)?.as_bool()
    }

    /// List-of-strings raw option (numbers are stringified)
    pub fn raw_str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.raw.get(key)? {
            serde_yaml::Value::Sequence(seq) => Some(
                seq.iter()
                    .filter_map(|v| match v {
                        serde_yaml::Value::String(s) => Some(s.clone()),
                        serde_yaml::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect(),
            ),
            serde_yaml::Value::String(s) => Some(vec![s.clone()]),
            serde_yaml::Value::Number(n) => Some(vec![n.to_string()]),
            _ => None,
        }
    }

    /// Per-source bounding box from the raw bag, when configured
    pub fn own_bbox(&self) -> Option<BoundingBox> {
        let coords = self.raw_str("bbox")?;
        let crs = self.raw_str("bbox_sr").unwrap_or_else(|| "3006".to_string());
        match BoundingBox::parse(&coords, &crs) {
            Ok(bbox) => Some(bbox),
            Err(e) => {
                warn!(source = %self.id, error = %e, "Ignoring malformed per-source bbox");
                None
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IncludeField {
    One(String),
    Many(Vec<String>),
}

impl IncludeField {
    /// Lists stay lists; strings may be semicolon-separated
    fn into_vec(self) -> Vec<String> {
        match self {
            IncludeField::Many(items) => items,
            IncludeField::One(s) => s
                .split(';')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }
}

/// Raw inventory record before validation. Unknown keys land in `extra`
/// and are merged into the descriptor's raw bag.
#[derive(Debug, Deserialize)]
struct RawSourceRecord {
    name: Option<String>,
    authority: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
    enabled: Option<bool>,
    staged_data_type: Option<String>,
    download_format: Option<String>,
    include: Option<IncludeField>,
    raw: Option<BTreeMap<String, serde_yaml::Value>>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct InventoryDocument {
    sources: Vec<RawSourceRecord>,
}

/// Load and validate the source inventory.
///
/// Order is preserved from the document. Records missing a required field
/// or carrying an unknown enum value are rejected with a logged validation
/// error; the rest of the inventory still loads. A record whose derived id
/// collides with an earlier one is rejected to keep ids unique.
pub fn load_inventory(path: &Path) -> Result<Vec<SourceDescriptor>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        GeostageError::config(
            format!("cannot read source inventory {}: {}", path.display(), e),
            "check the --sources path",
        )
    })?;
    let doc: InventoryDocument = serde_yaml::from_str(&text).map_err(|e| {
        GeostageError::config(
            format!("invalid YAML in {}: {}", path.display(), e),
            "the inventory must be a mapping with a 'sources' list",
        )
    })?;

    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut sources = Vec::with_capacity(doc.sources.len());

    for (index, record) in doc.sources.into_iter().enumerate() {
        match validate_record(record, index, &mut seen_ids) {
            Ok(source) => {
                debug!(id = %source.id, kind = source.kind.as_str(), "Loaded source");
                sources.push(source);
            },
            Err(e) => {
                warn!(index, error = %e, "Rejecting invalid source record");
            },
        }
    }

    info!(count = sources.len(), path = %path.display(), "Loaded source inventory");
    Ok(sources)
}

fn validate_record(
    record: RawSourceRecord,
    index: usize,
    seen_ids: &mut HashSet<String>,
) -> Result<SourceDescriptor> {
    let label = record
        .name
        .clone()
        .unwrap_or_else(|| format!("sources[{}]", index));

    let name = record
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| GeostageError::source_validation(label.as_str(), "missing required field 'name'"))?;
    let authority = record
        .authority
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| {
            GeostageError::source_validation(label.as_str(), "missing required field 'authority'")
        })?;
    let kind_str = record
        .kind
        .ok_or_else(|| GeostageError::source_validation(label.as_str(), "missing required field 'type'"))?;
    let kind = SourceKind::parse(&kind_str).ok_or_else(|| {
        GeostageError::source_validation(label.as_str(), format!("unknown source type '{}'", kind_str))
    })?;
    let url = record
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| GeostageError::source_validation(label.as_str(), "missing required field 'url'"))?;

    let staged_kind = match record.staged_data_type {
        None => None,
        Some(s) => Some(StagedKind::parse(&s).ok_or_else(|| {
            GeostageError::source_validation(label.as_str(), format!("unknown staged_data_type '{}'", s))
        })?),
    };

    let id = sanitize_identifier(&format!("{}_{}", authority, name));
    if !seen_ids.insert(id.clone()) {
        return Err(GeostageError::source_validation(
            label.as_str(),
            format!("duplicate source id '{}'", id),
        ));
    }

    let mut raw = record.raw.unwrap_or_default();
    // Unknown top-level keys are preserved alongside the explicit raw bag.
    for (key, value) in record.extra {
        raw.entry(key).or_insert(value);
    }

    Ok(SourceDescriptor {
        id,
        name,
        authority,
        kind,
        url,
        enabled: record.enabled.unwrap_or(true),
        staged_kind,
        include: record.include.map(IncludeField::into_vec).unwrap_or_default(),
        download_format: record.download_format,
        raw,
    })
}
