//! Direct-file handler
//!
//! Downloads one resource per `include` entry, or a single resource when
//! no include list is configured. Archives are kept as-is; expansion
//! happens in staging. An existing destination file short-circuits the
//! download unless the run forces re-downloads.

use geostage_common::naming::sanitize_file_name;
use tracing::{debug, info, warn};
use url::Url;

use crate::artifact::{FetchOutcome, RawArtifact};
use crate::retry::BreakerKey;
use crate::sources::SourceDescriptor;
use crate::transport::infer_extension;

use super::{staged_kind_for_extension, FetchContext};

pub(super) async fn fetch(
    ctx: &FetchContext<'_>,
    source: &SourceDescriptor,
) -> Vec<FetchOutcome> {
    if source.include.is_empty() {
        vec![fetch_one(ctx, source, &source.url, None).await]
    } else {
        info!(
            source = %source.id,
            parts = source.include.len(),
            "Multi-part download from base URL"
        );
        let ext = source
            .download_format
            .as_deref()
            .map(|f| format!(".{}", f.trim_start_matches('.').to_lowercase()))
            .unwrap_or_else(|| ".zip".to_string());
        let base = source.url.trim_end_matches('/');

        let mut outcomes = Vec::with_capacity(source.include.len());
        for stem in &source.include {
            if ctx.cancel.is_cancelled() {
                outcomes.push(FetchOutcome::Skipped {
                    sub_resource: Some(stem.clone()),
                    reason: "cancelled".to_string(),
                });
                continue;
            }
            let url = format!("{}/{}{}", base, stem, ext);
            outcomes.push(fetch_one(ctx, source, &url, Some(stem.clone())).await);
        }
        outcomes
    }
}

async fn fetch_one(
    ctx: &FetchContext<'_>,
    source: &SourceDescriptor,
    raw_url: &str,
    sub_resource: Option<String>,
) -> FetchOutcome {
    let url = match Url::parse(raw_url) {
        Ok(url) => url,
        Err(e) => {
            return FetchOutcome::Failed {
                sub_resource,
                reason: format!("invalid URL '{}': {}", raw_url, e),
            };
        },
    };

    let stem = sub_resource
        .as_deref()
        .map(sanitize_file_name)
        .unwrap_or_else(|| sanitize_file_name(&source.name));
    let ext_hint = source.download_format.as_deref();
    let dest_dir = ctx.download_dir(source);

    // Cache short-circuit: predict the destination from the URL path and
    // declared format; a hit skips the request entirely.
    let predicted_ext = infer_extension(None, &url, ext_hint);
    let predicted = dest_dir.join(format!("{}{}", stem, predicted_ext));
    if predicted.exists() && !ctx.settings.force_download {
        debug!(file = %predicted.display(), "Destination exists, skipping download");
        return FetchOutcome::Skipped {
            sub_resource,
            reason: format!("cached: {}", predicted.display()),
        };
    }

    let key = BreakerKey::new(url.host_str().unwrap_or("-"), source.kind.as_str());
    let download = ctx
        .retry
        .run(ctx.cancel, ctx.breakers, &key, |_| {
            ctx.transport
                .download_to_file(ctx.cancel, &url, &[], &dest_dir, &stem, ext_hint)
        })
        .await;

    match download {
        Ok(path) => {
            let ext = path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let declared_format = source
                .staged_kind
                .unwrap_or_else(|| staged_kind_for_extension(&ext));
            let bbox_pending = ctx.effective_bbox(source).is_some();
            if bbox_pending {
                // Plain file endpoints cannot filter server-side; the
                // filter is recorded for downstream application.
                debug!(source = %source.id, "Bbox filter deferred to downstream processing");
            }
            FetchOutcome::Fetched(RawArtifact {
                source_id: source.id.clone(),
                authority: source.authority.clone(),
                sub_resource,
                payload_path: path,
                declared_format,
                declared_crs: None,
                partial: false,
                bbox_pending,
            })
        },
        Err(e) => {
            warn!(source = %source.id, url = %url, error = %e, "Download failed");
            FetchOutcome::Failed {
                sub_resource,
                reason: e.to_string(),
            }
        },
    }
}
