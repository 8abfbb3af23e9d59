//! Atom feed handler
//!
//! Downloads the feed document, extracts one link per entry (preferring
//! `rel="enclosure"`), deduplicates URLs across the feed and downloads
//! every unique resource. Individual entry failures are recorded and
//! counted without failing the source.

use std::collections::HashSet;

use geostage_common::naming::sanitize_file_name;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::artifact::{FetchOutcome, RawArtifact};
use crate::retry::BreakerKey;
use crate::sources::SourceDescriptor;
use crate::transport::{infer_extension, percent_decode};

use super::{staged_kind_for_extension, FetchContext};

#[derive(Debug, Deserialize)]
struct FeedDocument {
    #[serde(rename = "entry", default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(rename = "link", default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(rename = "@rel")]
    rel: Option<String>,
    #[serde(rename = "@href")]
    href: Option<String>,
}

impl Entry {
    /// The enclosure link when present, otherwise the first link with an
    /// href at all.
    fn resource_url(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.rel.as_deref() == Some("enclosure"))
            .and_then(|l| l.href.as_deref())
            .or_else(|| self.links.iter().find_map(|l| l.href.as_deref()))
            .filter(|href| !href.trim().is_empty())
    }
}

pub(super) async fn fetch(
    ctx: &FetchContext<'_>,
    source: &SourceDescriptor,
) -> Vec<FetchOutcome> {
    let feed_url = match Url::parse(&source.url) {
        Ok(url) => url,
        Err(e) => {
            return vec![FetchOutcome::Failed {
                sub_resource: None,
                reason: format!("invalid feed URL '{}': {}", source.url, e),
            }];
        },
    };

    let key = BreakerKey::new(feed_url.host_str().unwrap_or("-"), source.kind.as_str());
    let feed_xml = match ctx
        .retry
        .run(ctx.cancel, ctx.breakers, &key, |_| {
            ctx.transport.get_text(ctx.cancel, &feed_url)
        })
        .await
    {
        Ok(xml) => xml,
        Err(e) => {
            warn!(source = %source.id, error = %e, "Failed to download feed document");
            return vec![FetchOutcome::Failed {
                sub_resource: None,
                reason: format!("feed download failed: {}", e),
            }];
        },
    };

    let feed: FeedDocument = match quick_xml::de::from_str(&feed_xml) {
        Ok(feed) => feed,
        Err(e) => {
            return vec![FetchOutcome::Failed {
                sub_resource: None,
                reason: format!("malformed feed XML: {}", e),
            }];
        },
    };

    info!(source = %source.id, entries = feed.entries.len(), "Parsed feed");

    let mut seen: HashSet<String> = HashSet::new();
    let mut outcomes = Vec::new();

    for entry in &feed.entries {
        let Some(href) = entry.resource_url() else {
            debug!(source = %source.id, "Skipping entry with no usable link");
            continue;
        };
        if !seen.insert(href.to_string()) {
            debug!(source = %source.id, url = href, "Duplicate link in feed");
            outcomes.push(FetchOutcome::Skipped {
                sub_resource: None,
                reason: format!("duplicate link: {}", href),
            });
            continue;
        }
        if ctx.cancel.is_cancelled() {
            outcomes.push(FetchOutcome::Skipped {
                sub_resource: None,
                reason: "cancelled".to_string(),
            });
            continue;
        }
        outcomes.push(download_entry(ctx, source, href).await);
    }

    if outcomes.is_empty() {
        info!(source = %source.id, "No downloadable resources in feed");
    }
    outcomes
}

async fn download_entry(
    ctx: &FetchContext<'_>,
    source: &SourceDescriptor,
    href: &str,
) -> FetchOutcome {
    let url = match Url::parse(href) {
        Ok(url) => url,
        Err(e) => {
            return FetchOutcome::Failed {
                sub_resource: Some(href.to_string()),
                reason: format!("invalid entry URL '{}': {}", href, e),
            };
        },
    };

    // Stem from the (decoded) URL path, so "l%C3%A4mningar.zip" stages
    // under a readable name.
    let stem = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .map(percent_decode)
        .map(|name| {
            name.rsplit_once('.')
                .map(|(stem, _)| stem.to_string())
                .unwrap_or(name)
        })
        .filter(|s| !s.is_empty())
        .map(|s| sanitize_file_name(&s))
        .unwrap_or_else(|| sanitize_file_name(&source.name));

    let ext_hint = source.download_format.as_deref().or(Some("zip"));
    let dest_dir = ctx.download_dir(source);

    let predicted = dest_dir.join(format!("{}{}", stem, infer_extension(None, &url, ext_hint)));
    if predicted.exists() && !ctx.settings.force_download {
        return FetchOutcome::Skipped {
            sub_resource: Some(stem),
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
            FetchOutcome::Fetched(RawArtifact {
                source_id: source.id.clone(),
                authority: source.authority.clone(),
                sub_resource: Some(stem),
                payload_path: path,
                declared_format,
                declared_crs: None,
                partial: false,
                bbox_pending,
            })
        },
        Err(e) => {
            warn!(source = %source.id, url = %url, error = %e, "Feed entry download failed");
            FetchOutcome::Failed {
                sub_resource: Some(stem),
                reason: e.to_string(),
            }
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Nedladdningar</title>
  <entry>
    <title>Paket 1</title>
    <link rel="enclosure" href="https://example.com/files/a.zip"/>
  </entry>
  <entry>
    <title>Paket 1 igen</title>
    <link rel="enclosure" href="https://example.com/files/a.zip"/>
  </entry>
  <entry>
    <title>Paket 2</title>
    <link href="https://example.com/files/b.zip"/>
  </entry>
  <entry>
    <title>Tom</title>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_feed_links() {
        let feed: FeedDocument = quick_xml::de::from_str(FEED).unwrap();
        assert_eq!(feed.entries.len(), 4);
        assert_eq!(
            feed.entries[0].resource_url(),
            Some("https://example.com/files/a.zip")
        );
        // Plain href fallback when no enclosure link exists.
        assert_eq!(
            feed.entries[2].resource_url(),
            Some("https://example.com/files/b.zip")
        );
        assert_eq!(feed.entries[3].resource_url(), None);
    }

    #[test]
    fn test_malformed_feed_rejected() {
        let result: Result<FeedDocument, _> = quick_xml::de::from_str("<feed><entry>");
        assert!(result.is_err());
    }
}
