//! Tiled REST query handler
//!
//! Targets ESRI-style MapServer/FeatureServer endpoints: a service
//! metadata document lists numbered layers with server-advertised record
//! limits, and each layer is drained through paginated query requests.
//! Every layer aggregates into one well-formed FeatureCollection artifact,
//! empty feature lists included.

use geostage_common::naming::sanitize_file_name;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::artifact::{FetchOutcome, RawArtifact};
use crate::retry::BreakerKey;
use crate::sources::{SourceDescriptor, StagedKind};
use crate::transport::TransportError;

use super::FetchContext;

const DEFAULT_RECORD_LIMIT: u64 = 1000;

struct LayerTarget {
    id: String,
    name: String,
    metadata: Option<Value>,
}

pub(super) async fn fetch(
    ctx: &FetchContext<'_>,
    source: &SourceDescriptor,
) -> Vec<FetchOutcome> {
    let base_url = match Url::parse(source.url.trim_end_matches('/')) {
        Ok(url) => url,
        Err(e) => {
            return vec![FetchOutcome::Failed {
                sub_resource: None,
                reason: format!("invalid service URL '{}': {}", source.url, e),
            }];
        },
    };

    let key = BreakerKey::new(base_url.host_str().unwrap_or("-"), source.kind.as_str());
    let json_param = [("f".to_string(), "json".to_string())];
    let service_meta = match ctx
        .retry
        .run(ctx.cancel, ctx.breakers, &key, |_| async {
            let (_, value) = ctx
                .transport
                .get_json(ctx.cancel, &base_url, &json_param)
                .await?;
            Ok(value)
        })
        .await
    {
        Ok(meta) => meta,
        Err(e) => {
            warn!(source = %source.id, error = %e, "Could not retrieve service metadata");
            return vec![FetchOutcome::Failed {
                sub_resource: None,
                reason: format!("service metadata: {}", e),
            }];
        },
    };

    if let Some(error) = service_meta.get("error") {
        return vec![FetchOutcome::Failed {
            sub_resource: None,
            reason: format!("service reported error: {}", error),
        }];
    }

    let layers = resolve_layers(source, &service_meta);
    if layers.is_empty() {
        warn!(source = %source.id, "No layers identified to query");
        return vec![FetchOutcome::Skipped {
            sub_resource: None,
            reason: "no matching layers".to_string(),
        }];
    }

    info!(
        source = %source.id,
        layers = layers.len(),
        ids = ?layers.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
        "Querying layers"
    );

    let mut outcomes = Vec::with_capacity(layers.len());
    for layer in layers {
        outcomes.push(fetch_layer(ctx, source, &base_url, &key, layer).await);
        if ctx.cancel.is_cancelled() {
            break;
        }
    }
    outcomes
}

/// Resolve which layers to query: explicit `layer_ids` from the raw bag,
/// else every advertised layer, else a degenerate single-layer service.
fn resolve_layers(source: &SourceDescriptor, service_meta: &Value) -> Vec<LayerTarget> {
    let advertised: Vec<(String, Value)> = service_meta
        .get("layers")
        .and_then(Value::as_array)
        .map(|layers| {
            layers
                .iter()
                .filter_map(|layer| {
                    let id = layer.get("id")?;
                    let id = match id {
                        Value::Number(n) => n.to_string(),
                        Value::String(s) => s.clone(),
                        _ => return None,
                    };
                    Some((id, layer.clone()))
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some(ids) = source.raw_str_list("layer_ids").filter(|ids| !ids.is_empty()) {
        return ids
            .into_iter()
            .map(|id| {
                let metadata = advertised
                    .iter()
                    .find(|(aid, _)| *aid == id)
                    .map(|(_, meta)| meta.clone());
                let name = metadata
                    .as_ref()
                    .and_then(|m| m.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("layer_{}", id));
                if metadata.is_none() {
                    // Configured ids missing from the advertised list are
                    // still attempted; some services answer direct queries
                    // for unlisted layers.
                    warn!(layer = %id, "Configured layer not in service metadata, querying anyway");
                }
                LayerTarget { id, name, metadata }
            })
            .collect();
    }

    if !advertised.is_empty() {
        return advertised
            .into_iter()
            .map(|(id, meta)| {
                let name = meta
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("layer_{}", id));
                LayerTarget {
                    id,
                    name,
                    metadata: Some(meta),
                }
            })
            .collect();
    }

    // Degenerate single-layer service: the root document is the layer.
    if service_meta.get("type").and_then(Value::as_str) == Some("Feature Layer") {
        let id = match service_meta.get("id") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => "0".to_string(),
        };
        let name = service_meta
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("layer_{}", id));
        return vec![LayerTarget {
            id,
            name,
            metadata: Some(service_meta.clone()),
        }];
    }

    Vec::new()
}

fn record_limit(layer_meta: Option<&Value>) -> u64 {
    let limit = layer_meta
        .and_then(|m| {
            m.get("maxRecordCount")
                .or_else(|| m.get("standardMaxRecordCount"))
        })
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_RECORD_LIMIT);
    // A server claiming "no limit" still gets paged for stability.
    if limit == 0 {
        DEFAULT_RECORD_LIMIT
    } else {
        limit
    }
}

fn layer_crs(layer_meta: Option<&Value>) -> Option<String> {
    let wkid = layer_meta?
        .get("spatialReference")?
        .get("wkid")?
        .as_u64()?;
    Some(format!("EPSG:{}", wkid))
}

async fn fetch_layer(
    ctx: &FetchContext<'_>,
    source: &SourceDescriptor,
    base_url: &Url,
    key: &BreakerKey,
    layer: LayerTarget,
) -> FetchOutcome {
    let layer_name = sanitize_file_name(&layer.name);
    let query_url = match Url::parse(&format!("{}/{}/query", base_url, layer.id)) {
        Ok(url) => url,
        Err(e) => {
            return FetchOutcome::Failed {
                sub_resource: Some(layer_name),
                reason: format!("invalid layer query URL: {}", e),
            };
        },
    };

    // Layer metadata: taken from the service document when advertised,
    // fetched separately otherwise. A metadata miss is tolerated; the
    // defaults cover it.
    let layer_meta = match layer.metadata {
        Some(meta) => Some(meta),
        None => {
            let meta_url = Url::parse(&format!("{}/{}", base_url, layer.id)).ok();
            match meta_url {
                Some(meta_url) => ctx
                    .retry
                    .run(ctx.cancel, ctx.breakers, key, |_| async {
                        let (_, value) = ctx
                            .transport
                            .get_json(
                                ctx.cancel,
                                &meta_url,
                                &[("f".to_string(), "json".to_string())],
                            )
                            .await?;
                        Ok(value)
                    })
                    .await
                    .ok(),
                None => None,
            }
        },
    };

    let limit = record_limit(layer_meta.as_ref());
    let declared_crs = layer_crs(layer_meta.as_ref());
    debug!(layer = %layer.id, limit, crs = ?declared_crs, "Layer query parameters");

    let mut base_params: Vec<(String, String)> = vec![
        (
            "where".to_string(),
            source.raw_str("where_clause").unwrap_or_else(|| "1=1".to_string()),
        ),
        (
            "outFields".to_string(),
            source.raw_str("out_fields").unwrap_or_else(|| "*".to_string()),
        ),
        ("returnGeometry".to_string(), "true".to_string()),
        (
            "f".to_string(),
            source.raw_str("format").unwrap_or_else(|| "geojson".to_string()),
        ),
    ];
    if let Some(bbox) = ctx.effective_bbox(source) {
        info!(layer = %layer.id, bbox = %bbox.coords_string(), crs = %bbox.crs, "Applying bbox filter");
        base_params.push(("geometry".to_string(), bbox.coords_string()));
        base_params.push(("geometryType".to_string(), "esriGeometryEnvelope".to_string()));
        base_params.push(("inSR".to_string(), bbox.crs.clone()));
        base_params.push(("spatialRel".to_string(), "esriSpatialRelIntersects".to_string()));
    }

    let mut features: Vec<Value> = Vec::new();
    let mut offset: u64 = 0;
    let mut page: u32 = 1;
    let mut partial = false;

    loop {
        let mut params = base_params.clone();
        params.push(("resultOffset".to_string(), offset.to_string()));
        params.push(("resultRecordCount".to_string(), limit.to_string()));

        debug!(layer = %layer.id, page, offset, limit, "Fetching page");
        let data = match ctx
            .retry
            .run(ctx.cancel, ctx.breakers, key, |_| {
                let params = params.clone();
                let query_url = query_url.clone();
                async move {
                    let (_, value) = ctx.transport.get_json(ctx.cancel, &query_url, &params).await?;
                    Ok(value)
                }
            })
            .await
        {
            Ok(data) => data,
            Err(TransportError::Cancelled) => {
                // Finalize with what was collected; the orchestrator
                // records the source itself as cancelled.
                partial = true;
                break;
            },
            Err(e) => {
                warn!(layer = %layer.id, page, error = %e, "Page failed after retries, skipping");
                partial = true;
                break;
            },
        };

        if let Some(error) = data.get("error") {
            warn!(layer = %layer.id, page, error = %error, "Service error during pagination");
            partial = true;
            break;
        }

        let page_features = data
            .get("features")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if page_features.is_empty() {
            if page == 1 {
                info!(layer = %layer.id, "No features returned");
            } else {
                debug!(layer = %layer.id, "Empty page, pagination complete");
            }
            break;
        }

        let count = page_features.len() as u64;
        features.extend(page_features);
        let exceeded = data
            .get("exceededTransferLimit")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if exceeded {
            offset += count;
            page += 1;
        } else if count < limit {
            debug!(layer = %layer.id, total = features.len(), "Short page, pagination complete");
            break;
        } else {
            offset += count;
            page += 1;
        }
    }

    // The artifact stays well-formed even with zero features.
    let mut collection = json!({
        "type": "FeatureCollection",
        "features": features,
    });
    if let Some(crs) = &declared_crs {
        if let Some(code) = crs.strip_prefix("EPSG:") {
            collection["crs"] = json!({
                "type": "name",
                "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", code) },
            });
        }
    }

    let dest_dir = ctx.download_dir(source);
    if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
        return FetchOutcome::Failed {
            sub_resource: Some(layer_name),
            reason: format!("cannot create download dir: {}", e),
        };
    }
    let path = dest_dir.join(format!("{}.geojson", layer_name));
    let body = match serde_json::to_vec(&collection) {
        Ok(body) => body,
        Err(e) => {
            return FetchOutcome::Failed {
                sub_resource: Some(layer_name),
                reason: format!("cannot serialize layer: {}", e),
            };
        },
    };
    if let Err(e) = tokio::fs::write(&path, body).await {
        return FetchOutcome::Failed {
            sub_resource: Some(layer_name),
            reason: format!("cannot write artifact: {}", e),
        };
    }

    info!(
        layer = %layer.id,
        features = collection["features"].as_array().map(|f| f.len()).unwrap_or(0),
        partial,
        file = %path.display(),
        "Layer aggregated"
    );

    FetchOutcome::Fetched(RawArtifact {
        source_id: source.id.clone(),
        authority: source.authority.clone(),
        sub_resource: Some(layer_name),
        payload_path: path,
        declared_format: StagedKind::JsonVector,
        declared_crs,
        partial,
        bbox_pending: false,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(raw: serde_json::Value) -> SourceDescriptor {
        let raw_yaml: std::collections::BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(&serde_yaml::to_string(&raw).unwrap()).unwrap();
        SourceDescriptor {
            id: "lst_test".to_string(),
            name: "Test".to_string(),
            authority: "LST".to_string(),
            kind: crate::sources::SourceKind::TiledQuery,
            url: "https://example.com/MapServer".to_string(),
            enabled: true,
            staged_kind: None,
            include: Vec::new(),
            download_format: None,
            raw: raw_yaml,
        }
    }

    #[test]
    fn test_resolve_layers_from_config_ids() {
        let meta = json!({
            "layers": [
                {"id": 0, "name": "Zoner"},
                {"id": 1, "name": "Punkter"},
            ]
        });
        let source = descriptor(json!({"layer_ids": [1]}));
        let layers = resolve_layers(&source, &meta);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].id, "1");
        assert_eq!(layers[0].name, "Punkter");
    }

    #[test]
    fn test_resolve_layers_discovers_all() {
        let meta = json!({
            "layers": [
                {"id": 0, "name": "A"},
                {"id": 1, "name": "B"},
            ]
        });
        let source = descriptor(json!({}));
        let layers = resolve_layers(&source, &meta);
        assert_eq!(layers.len(), 2);
    }

    #[test]
    fn test_resolve_degenerate_single_layer() {
        let meta = json!({
            "type": "Feature Layer",
            "id": 0,
            "name": "Enda lagret",
        });
        let source = descriptor(json!({}));
        let layers = resolve_layers(&source, &meta);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].id, "0");
        assert_eq!(layers[0].name, "Enda lagret");
    }

    #[test]
    fn test_record_limit_fallbacks() {
        assert_eq!(record_limit(None), 1000);
        assert_eq!(record_limit(Some(&json!({"maxRecordCount": 2000}))), 2000);
        assert_eq!(
            record_limit(Some(&json!({"standardMaxRecordCount": 500}))),
            500
        );
        // Zero means "unlimited" server-side; page anyway.
        assert_eq!(record_limit(Some(&json!({"maxRecordCount": 0}))), 1000);
    }

    #[test]
    fn test_layer_crs_extraction() {
        let meta = json!({"spatialReference": {"wkid": 3006}});
        assert_eq!(layer_crs(Some(&meta)).as_deref(), Some("EPSG:3006"));
        assert_eq!(layer_crs(Some(&json!({}))), None);
        assert_eq!(layer_crs(None), None);
    }
}
