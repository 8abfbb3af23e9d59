//! Extract handlers
//!
//! Four protocol handlers share one contract: given a source descriptor,
//! discover its sub-resources, fetch them and emit raw artifacts into the
//! downloads tree. Handlers translate every failure into a per-sub-resource
//! outcome; they never abort the source unless nothing succeeded. Each
//! handler kind is a plain module function dispatched on the source's
//! tagged kind; the only shared state is the transport and retry policy
//! passed in through the context.

mod collections;
mod direct_file;
mod feed;
mod rest_query;

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::artifact::FetchOutcome;
use crate::config::GlobalSettings;
use crate::retry::{BreakerTable, RetryPolicy};
use crate::sources::{BoundingBox, SourceDescriptor, SourceKind};
use crate::transport::HttpTransport;

/// Everything a handler needs to fetch one source
pub struct FetchContext<'a> {
    pub transport: &'a HttpTransport,
    pub retry: &'a RetryPolicy,
    pub breakers: &'a BreakerTable,
    pub settings: &'a GlobalSettings,
    pub cancel: &'a CancellationToken,
}

impl FetchContext<'_> {
    /// Download directory for a source: `<downloads>/<authority>/<id>/`
    pub fn download_dir(&self, source: &SourceDescriptor) -> PathBuf {
        self.settings
            .paths
            .downloads
            .join(&source.authority)
            .join(&source.id)
    }

    /// The bbox filter in effect for a source: the source's own when set,
    /// otherwise the global one when bbox filtering is enabled.
    pub fn effective_bbox(&self, source: &SourceDescriptor) -> Option<BoundingBox> {
        source.own_bbox().or_else(|| self.settings.global_bbox())
    }
}

/// Fetch one source through the handler its kind selects
pub async fn fetch_source(ctx: &FetchContext<'_>, source: &SourceDescriptor) -> Vec<FetchOutcome> {
    info!(
        source = %source.id,
        kind = source.kind.as_str(),
        url = %source.url,
        "Fetching source"
    );
    match source.kind {
        SourceKind::DirectFile => direct_file::fetch(ctx, source).await,
        SourceKind::Feed => feed::fetch(ctx, source).await,
        SourceKind::TiledQuery => rest_query::fetch(ctx, source).await,
        SourceKind::TiledCollection => collections::fetch(ctx, source).await,
    }
}

/// Map a file extension to the staged kind handlers infer when the source
/// does not declare one
pub(crate) fn staged_kind_for_extension(ext: &str) -> crate::sources::StagedKind {
    use crate::sources::StagedKind;
    match ext.trim_start_matches('.') {
        "gpkg" => StagedKind::ContainerVector,
        "geojson" | "json" => StagedKind::JsonVector,
        "shp" => StagedKind::SplitVector,
        // Zip archives and anything unrecognized default to the
        // shapefile-collection path, matching upstream conventions.
        _ => StagedKind::ArchiveOfSplitVector,
    }
}
