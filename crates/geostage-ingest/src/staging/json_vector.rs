//! JSON-vector staging (GeoJSON)
//!
//! Verifies the payload parses as a feature collection (or a single
//! feature), pre-scans geometries to classify the dominant kind and moves
//! the file into the staging tree under its canonical name. The dominant
//! kind saves the downstream loader from guessing the output geometry
//! type.

use std::fs;

use geojson::{Feature, GeoJson, Value as GeomValue};
use geostage_common::{GeostageError, Result};
use tracing::debug;

use crate::artifact::{GeometryKind, RawArtifact, StagedEntry};
use crate::sources::StagedKind;

use super::{move_file, Materializer};

pub(super) fn stage(
    materializer: &Materializer<'_>,
    artifact: &RawArtifact,
) -> Result<Vec<StagedEntry>> {
    let text = fs::read_to_string(&artifact.payload_path)?;
    let parsed: GeoJson = text.parse().map_err(|e| {
        GeostageError::staging_validation(
            artifact.payload_path.display().to_string(),
            format!("malformed GeoJSON: {}", e),
        )
    })?;

    let (features, crs_member): (Vec<Feature>, Option<String>) = match parsed {
        GeoJson::FeatureCollection(collection) => {
            let crs = crs_from_foreign_members(collection.foreign_members.as_ref());
            (collection.features, crs)
        },
        GeoJson::Feature(feature) => (vec![feature], None),
        GeoJson::Geometry(_) => {
            return Err(GeostageError::staging_validation(
                artifact.payload_path.display().to_string(),
                "bare geometry is not a stageable feature collection",
            ));
        },
    };

    let geometry_kind = dominant_geometry(&features);
    let feature_count = features.len() as u64;
    debug!(
        payload = %artifact.payload_path.display(),
        features = feature_count,
        geometry = ?geometry_kind.map(|g| g.as_str()),
        "Validated JSON vector"
    );

    let dest_dir = materializer.source_dir(artifact);
    fs::create_dir_all(&dest_dir)?;
    let canonical = materializer.claim_name(artifact, &artifact.logical_name());
    let staged_path = dest_dir.join(format!("{}.geojson", canonical));
    if artifact.payload_path != staged_path {
        move_file(&artifact.payload_path, &staged_path)?;
    }

    Ok(vec![materializer.entry(
        artifact,
        canonical,
        staged_path,
        StagedKind::JsonVector,
        crs_member,
        Some(feature_count),
        geometry_kind,
    )])
}

/// CRS from the legacy `crs` foreign member, as written by the handlers
fn crs_from_foreign_members(
    members: Option<&serde_json::Map<String, serde_json::Value>>,
) -> Option<String> {
    let name = members?
        .get("crs")?
        .get("properties")?
        .get("name")?
        .as_str()?;
    // "urn:ogc:def:crs:EPSG::3006" -> "EPSG:3006"
    name.rsplit_once("EPSG::")
        .map(|(_, code)| format!("EPSG:{}", code))
        .or_else(|| Some(name.to_string()))
}

/// Classify the dominant geometry kind: a single kind across every
/// feature, `Mixed` otherwise, `None` when no feature has a geometry
fn dominant_geometry(features: &[Feature]) -> Option<GeometryKind> {
    let mut dominant: Option<GeometryKind> = None;
    for feature in features {
        let Some(geometry) = &feature.geometry else {
            continue;
        };
        let kind = match geometry.value {
            GeomValue::Point(_) | GeomValue::MultiPoint(_) => GeometryKind::Point,
            GeomValue::LineString(_) | GeomValue::MultiLineString(_) => GeometryKind::Line,
            GeomValue::Polygon(_) | GeomValue::MultiPolygon(_) => GeometryKind::Polygon,
            GeomValue::GeometryCollection(_) => GeometryKind::Mixed,
        };
        dominant = match dominant {
            None => Some(kind),
            Some(existing) if existing == kind => Some(existing),
            Some(_) => return Some(GeometryKind::Mixed),
        };
    }
    dominant
}
