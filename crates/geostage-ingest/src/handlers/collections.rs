//! Tiled collection handler (OGC API Features)
//!
//! Fetches the collections index, resolves the configured collection ids
//! and drains each collection's item stream by following `rel="next"`
//! hypermedia links. Some services advertise a projected storage CRS while
//! actually serving lon/lat coordinates; for configured authorities the
//! first page's coordinate magnitudes decide, and the override is recorded
//! on the artifact.

use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use geostage_common::naming::sanitize_file_name;

use crate::artifact::{FetchOutcome, RawArtifact};
use crate::config::CRS84_URI;
use crate::retry::BreakerKey;
use crate::sources::{BoundingBox, SourceDescriptor, StagedKind};
use crate::transport::TransportError;

use super::FetchContext;

const DEFAULT_PAGE_SIZE: u64 = 1000;
const PREFERRED_ITEM_TYPES: [&str; 3] = [
    "application/geo+json",
    "application/json",
    "application/vnd.ogc.fg+json",
];

pub(super) async fn fetch(
    ctx: &FetchContext<'_>,
    source: &SourceDescriptor,
) -> Vec<FetchOutcome> {
    let base_url = match Url::parse(source.url.trim_end_matches('/')) {
        Ok(url) => url,
        Err(e) => {
            return vec![FetchOutcome::Failed {
                sub_resource: None,
                reason: format!("invalid API URL '{}': {}", source.url, e),
            }];
        },
    };

    let Some(target_ids) = source.raw_str_list("collections").filter(|c| !c.is_empty()) else {
        return vec![FetchOutcome::Failed {
            sub_resource: None,
            reason: "source configures no 'collections' to fetch".to_string(),
        }];
    };

    let key = BreakerKey::new(base_url.host_str().unwrap_or("-"), source.kind.as_str());
    let discovered = match discover_collections(ctx, &base_url, &key).await {
        Ok(collections) => collections,
        Err(e) => {
            warn!(source = %source.id, error = %e, "Collection discovery failed");
            return vec![FetchOutcome::Failed {
                sub_resource: None,
                reason: format!("collections index: {}", e),
            }];
        },
    };
    info!(source = %source.id, discovered = discovered.len(), "Discovered collections");

    let mut outcomes = Vec::with_capacity(target_ids.len());
    for id in target_ids {
        if ctx.cancel.is_cancelled() {
            outcomes.push(FetchOutcome::Skipped {
                sub_resource: Some(id),
                reason: "cancelled".to_string(),
            });
            continue;
        }
        let Some(collection) = discovered
            .iter()
            .find(|c| c.get("id").and_then(Value::as_str) == Some(id.as_str()))
        else {
            warn!(source = %source.id, collection = %id, "Configured collection not advertised");
            outcomes.push(FetchOutcome::Failed {
                sub_resource: Some(id.clone()),
                reason: "collection not found in index".to_string(),
            });
            continue;
        };
        outcomes.push(fetch_collection(ctx, source, &base_url, &key, &id, collection).await);
    }
    outcomes
}

/// The collections index, following a `rel="data"` link when the landing
/// page does not list collections inline.
async fn discover_collections(
    ctx: &FetchContext<'_>,
    base_url: &Url,
    key: &BreakerKey,
) -> Result<Vec<Value>, TransportError> {
    let (final_url, document) = ctx
        .retry
        .run(ctx.cancel, ctx.breakers, key, |_| {
            ctx.transport.get_json(ctx.cancel, base_url, &[])
        })
        .await?;

    if let Some(collections) = document.get("collections").and_then(Value::as_array) {
        return Ok(collections.clone());
    }

    // Landing page: follow the data link to the collections document.
    if let Some(href) = find_link(&document, "data") {
        let next_url = resolve_href(&final_url, &href).ok_or_else(|| TransportError::Decode {
            url: href.clone(),
            reason: "unresolvable collections link".to_string(),
        })?;
        debug!(url = %next_url, "Following data link to collections");
        let (_, document) = ctx
            .retry
            .run(ctx.cancel, ctx.breakers, key, |_| {
                ctx.transport.get_json(ctx.cancel, &next_url, &[])
            })
            .await?;
        if let Some(collections) = document.get("collections").and_then(Value::as_array) {
            return Ok(collections.clone());
        }
    }

    Err(TransportError::Decode {
        url: base_url.as_str().to_string(),
        reason: "no collections in index document".to_string(),
    })
}

fn find_link(document: &Value, rel: &str) -> Option<String> {
    document
        .get("links")?
        .as_array()?
        .iter()
        .find(|l| l.get("rel").and_then(Value::as_str) == Some(rel))
        .and_then(|l| l.get("href").and_then(Value::as_str))
        .map(str::to_string)
}

fn resolve_href(base: &Url, href: &str) -> Option<Url> {
    match Url::parse(href) {
        Ok(url) => Some(url),
        Err(_) => base.join(href).ok(),
    }
}

/// The items link of a collection, preferring GeoJSON representations
fn find_items_link(base: &Url, collection: &Value) -> Option<Url> {
    let links = collection.get("links")?.as_array()?;
    let self_href = links
        .iter()
        .find(|l| l.get("rel").and_then(Value::as_str) == Some("self"))
        .and_then(|l| l.get("href").and_then(Value::as_str));
    let resolve_base = self_href
        .and_then(|href| resolve_href(base, href))
        .unwrap_or_else(|| base.clone());

    for preferred in PREFERRED_ITEM_TYPES {
        for link in links {
            if link.get("rel").and_then(Value::as_str) == Some("items")
                && link.get("type").and_then(Value::as_str) == Some(preferred)
            {
                if let Some(href) = link.get("href").and_then(Value::as_str) {
                    return resolve_href(&resolve_base, href);
                }
            }
        }
    }
    // Fallback: any items link at all.
    for link in links {
        if link.get("rel").and_then(Value::as_str) == Some("items") {
            if let Some(href) = link.get("href").and_then(Value::as_str) {
                warn!(
                    media_type = link.get("type").and_then(|v| v.as_str()).unwrap_or("unknown"),
                    "Using non-preferred items representation"
                );
                return resolve_href(&resolve_base, href);
            }
        }
    }
    None
}

fn bbox_crs_uri(crs: &str) -> String {
    if crs.eq_ignore_ascii_case("CRS84") {
        CRS84_URI.to_string()
    } else if crs.chars().all(|c| c.is_ascii_digit()) {
        format!("http://www.opengis.net/def/crs/EPSG/0/{}", crs)
    } else {
        crs.to_string()
    }
}

fn bbox_params(bbox: &BoundingBox) -> Vec<(String, String)> {
    vec![
        ("bbox".to_string(), bbox.coords_string()),
        ("bbox-crs".to_string(), bbox_crs_uri(&bbox.crs)),
    ]
}

/// EPSG code from a storage CRS URI like
/// `http://www.opengis.net/def/crs/EPSG/0/3006` or `urn:...:EPSG::3006`
fn epsg_from_storage_crs(storage_crs: &str) -> Option<String> {
    // Both common URI spellings carry the code after an EPSG marker.
    let pattern = Regex::new(r"EPSG/(?:0/)?(\d+)|EPSG::(\d+)").ok()?;
    let captures = pattern.captures(storage_crs)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().to_string())
}

/// Descend nested coordinate arrays to the first `[x, y]` position
fn first_position(geometry: &Value) -> Option<(f64, f64)> {
    let mut current = geometry.get("coordinates")?;
    loop {
        let array = current.as_array()?;
        match array.first()? {
            Value::Array(_) => current = array.first()?,
            Value::Number(_) => {
                let x = array.first()?.as_f64()?;
                let y = array.get(1)?.as_f64()?;
                return Some((x, y));
            },
            _ => return None,
        }
    }
}

/// Geographic-looking coordinates advertised under a projected CRS
fn looks_geographic(features: &[Value]) -> bool {
    features
        .first()
        .and_then(|f| f.get("geometry"))
        .and_then(first_position)
        .is_some_and(|(x, y)| x.abs() <= 180.0 && y.abs() <= 90.0)
}

async fn fetch_collection(
    ctx: &FetchContext<'_>,
    source: &SourceDescriptor,
    base_url: &Url,
    key: &BreakerKey,
    collection_id: &str,
    collection: &Value,
) -> FetchOutcome {
    let sub_resource = sanitize_file_name(collection_id);
    let Some(items_url) = find_items_link(base_url, collection) else {
        return FetchOutcome::Failed {
            sub_resource: Some(sub_resource),
            reason: "no items link in collection".to_string(),
        };
    };

    let page_size = source.raw_u64("page_size").unwrap_or(DEFAULT_PAGE_SIZE);
    let page_delay = source
        .raw_u64("page_delay_ms")
        .map(std::time::Duration::from_millis);

    let mut first_params: Vec<(String, String)> =
        vec![("limit".to_string(), page_size.to_string())];
    if let Some(bbox) = ctx.effective_bbox(source) {
        info!(
            collection = collection_id,
            bbox = %bbox.coords_string(),
            crs = %bbox_crs_uri(&bbox.crs),
            "Applying bbox filter to items request"
        );
        first_params.extend(bbox_params(&bbox));
    }

    let mut features: Vec<Value> = Vec::new();
    let mut next: Option<Url> = Some(items_url);
    let mut page: u32 = 1;
    let mut partial = false;

    while let Some(page_url) = next.take() {
        // The first request carries limit and bbox; next links already
        // embed the server's continuation parameters.
        let params = if page == 1 {
            first_params.clone()
        } else {
            Vec::new()
        };

        debug!(collection = collection_id, page, url = %page_url, "Fetching items page");
        let (final_url, document) = match ctx
            .retry
            .run(ctx.cancel, ctx.breakers, key, |_| {
                let params = params.clone();
                let page_url = page_url.clone();
                async move { ctx.transport.get_json(ctx.cancel, &page_url, &params).await }
            })
            .await
        {
            Ok(result) => result,
            Err(TransportError::Cancelled) => {
                partial = true;
                break;
            },
            Err(e) => {
                warn!(collection = collection_id, page, error = %e, "Items page failed, finalizing partial");
                partial = true;
                break;
            },
        };

        let page_features = document
            .get("features")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        debug!(
            collection = collection_id,
            page,
            count = page_features.len(),
            total = features.len() + page_features.len(),
            "Retrieved items page"
        );
        features.extend(page_features);

        next = find_link(&document, "next")
            .and_then(|href| resolve_href(&final_url, &href));
        page += 1;

        if next.is_some() {
            if let Some(delay) = page_delay {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        partial = true;
                        break;
                    },
                    _ = tokio::time::sleep(delay) => {},
                }
            }
        }
    }

    // CRS determination: storageCrs, overridden to lon/lat when the
    // configured authority heuristic fires.
    let mut declared_crs = None;
    if let Some(storage_crs) = collection.get("storageCrs").and_then(Value::as_str) {
        if let Some(mut code) = epsg_from_storage_crs(storage_crs) {
            let override_candidate = code != "4326"
                && ctx
                    .settings
                    .crs_override_authorities
                    .iter()
                    .any(|a| a == &source.authority);
            if override_candidate && looks_geographic(&features) {
                warn!(
                    collection = collection_id,
                    advertised = %code,
                    "Advertised CRS is projected but coordinates are within geographic bounds, overriding to EPSG:4326"
                );
                code = "4326".to_string();
            }
            declared_crs = Some(format!("EPSG:{}", code));
        }
    }

    let mut output = json!({
        "type": "FeatureCollection",
        "features": features,
        "name": collection.get("title").and_then(Value::as_str).unwrap_or(collection_id),
    });
    if let Some(crs) = &declared_crs {
        if let Some(code) = crs.strip_prefix("EPSG:") {
            output["crs"] = json!({
                "type": "name",
                "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", code) },
            });
        }
    }

    let dest_dir = ctx.download_dir(source);
    if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
        return FetchOutcome::Failed {
            sub_resource: Some(sub_resource),
            reason: format!("cannot create download dir: {}", e),
        };
    }
    let path = dest_dir.join(format!("{}.geojson", sub_resource));
    let body = match serde_json::to_vec(&output) {
        Ok(body) => body,
        Err(e) => {
            return FetchOutcome::Failed {
                sub_resource: Some(sub_resource),
                reason: format!("cannot serialize collection: {}", e),
            };
        },
    };
    if let Err(e) = tokio::fs::write(&path, body).await {
        return FetchOutcome::Failed {
            sub_resource: Some(sub_resource),
            reason: format!("cannot write artifact: {}", e),
        };
    }

    info!(
        collection = collection_id,
        features = output["features"].as_array().map(|f| f.len()).unwrap_or(0),
        crs = ?declared_crs,
        partial,
        "Collection aggregated"
    );

    FetchOutcome::Fetched(RawArtifact {
        source_id: source.id.clone(),
        authority: source.authority.clone(),
        sub_resource: Some(sub_resource),
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

    #[test]
    fn test_epsg_from_storage_crs() {
        assert_eq!(
            epsg_from_storage_crs("http://www.opengis.net/def/crs/EPSG/0/3006").as_deref(),
            Some("3006")
        );
        assert_eq!(
            epsg_from_storage_crs("urn:ogc:def:crs:EPSG::4326").as_deref(),
            Some("4326")
        );
        assert_eq!(epsg_from_storage_crs(super::CRS84_URI), None);
    }

    #[test]
    fn test_first_position_nested() {
        let point = json!({"type": "Point", "coordinates": [17.1, 59.2]});
        assert_eq!(first_position(&point), Some((17.1, 59.2)));

        let polygon = json!({
            "type": "Polygon",
            "coordinates": [[[586206.0, 6551160.0], [586300.0, 6551200.0]]],
        });
        assert_eq!(first_position(&polygon), Some((586206.0, 6551160.0)));

        let empty = json!({"type": "Point", "coordinates": []});
        assert_eq!(first_position(&empty), None);
    }

    #[test]
    fn test_looks_geographic() {
        let geographic = vec![json!({"geometry": {"coordinates": [17.1, 59.2]}})];
        assert!(looks_geographic(&geographic));
        let projected = vec![json!({"geometry": {"coordinates": [586206.0, 6551160.0]}})];
        assert!(!looks_geographic(&projected));
        assert!(!looks_geographic(&[]));
    }

    #[test]
    fn test_bbox_crs_uri_forms() {
        assert_eq!(bbox_crs_uri("CRS84"), CRS84_URI);
        assert_eq!(
            bbox_crs_uri("3006"),
            "http://www.opengis.net/def/crs/EPSG/0/3006"
        );
        assert_eq!(bbox_crs_uri("http://example.com/crs"), "http://example.com/crs");
    }

    #[test]
    fn test_find_items_link_prefers_geojson() {
        let base = Url::parse("https://api.example.com/collections/x").unwrap();
        let collection = json!({
            "id": "x",
            "links": [
                {"rel": "items", "type": "text/html", "href": "items.html"},
                {"rel": "items", "type": "application/geo+json", "href": "items?f=json"},
            ]
        });
        let url = find_items_link(&base, &collection).unwrap();
        assert!(url.as_str().contains("items?f=json"));
    }

    #[test]
    fn test_find_next_link_resolution() {
        let document = json!({
            "links": [{"rel": "next", "href": "items?offset=100"}]
        });
        let base = Url::parse("https://api.example.com/collections/x/items").unwrap();
        let href = find_link(&document, "next").unwrap();
        let resolved = resolve_href(&base, &href).unwrap();
        assert_eq!(
            resolved.as_str(),
            "https://api.example.com/collections/x/items?offset=100"
        );
    }
}
