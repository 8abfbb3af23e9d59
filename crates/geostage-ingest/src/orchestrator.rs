//! Run orchestrator
//!
//! Drives every enabled source through extract and stage with a bounded
//! worker pool. Each worker owns one source end-to-end; the per-host
//! semaphore inside the transport is the only backpressure against remote
//! endpoints, the pool size the only one against local staging. A single
//! cancellation token fans out to all workers, and a per-source deadline
//! turns runaway sources into recorded failures instead of hung runs.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifact::FetchOutcome;
use crate::config::GlobalSettings;
use crate::handlers::{self, FetchContext};
use crate::mapping::MappingSet;
use crate::retry::{BreakerTable, RetryPolicy};
use crate::sources::SourceDescriptor;
use crate::staging::{Materializer, NameRegistry};
use crate::summary::{Phase, RunReport, RunSummary, SourceState, Status};
use crate::transport::HttpTransport;

/// Final outcome of a pipeline run, for exit-code mapping
pub struct PipelineResult {
    pub report: RunReport,
    /// The run was cancelled from outside (signal) before completion
    pub cancelled: bool,
    /// The configured failure budget was exceeded
    pub budget_exceeded: bool,
}

struct Shared {
    settings: Arc<GlobalSettings>,
    transport: HttpTransport,
    retry: RetryPolicy,
    breakers: BreakerTable,
    summary: RunSummary,
    names: NameRegistry,
    mappings: MappingSet,
    failed_sources: AtomicU32,
    budget_exceeded: AtomicBool,
}

/// Orchestrates one full ingestion run
pub struct Orchestrator {
    settings: Arc<GlobalSettings>,
    sources: Vec<SourceDescriptor>,
    mappings: MappingSet,
}

impl Orchestrator {
    pub fn new(
        settings: GlobalSettings,
        sources: Vec<SourceDescriptor>,
        mappings: MappingSet,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            sources,
            mappings,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<PipelineResult> {
        self.prepare_roots().await?;

        let enabled: Vec<SourceDescriptor> = self
            .sources
            .into_iter()
            .filter(|source| {
                if !source.enabled {
                    info!(source = %source.id, "Source disabled, skipping");
                }
                source.enabled
            })
            .collect();

        if enabled.is_empty() {
            info!("No enabled sources, nothing to do");
            return Ok(PipelineResult {
                report: RunSummary::new().finalize(),
                cancelled: false,
                budget_exceeded: false,
            });
        }

        let workers = self.settings.processing.parallel_workers.min(enabled.len());
        info!(
            sources = enabled.len(),
            workers,
            "Starting ingestion run"
        );

        let shared = Arc::new(Shared {
            transport: HttpTransport::new(&self.settings).context("building HTTP transport")?,
            retry: RetryPolicy::from_settings(&self.settings.retry),
            breakers: BreakerTable::from_settings(&self.settings.retry),
            summary: RunSummary::new(),
            names: NameRegistry::new(),
            mappings: self.mappings,
            settings: Arc::clone(&self.settings),
            failed_sources: AtomicU32::new(0),
            budget_exceeded: AtomicBool::new(false),
        });

        // One channel of sources, drained by the pool. With one worker
        // this preserves inventory order exactly.
        let (tx, rx) = mpsc::channel::<SourceDescriptor>(enabled.len());
        for source in enabled {
            // Capacity equals the queue length, so sends never block.
            tx.send(source).await.ok();
        }
        drop(tx);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let shared = Arc::clone(&shared);
            let rx = Arc::clone(&rx);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, shared, rx, cancel).await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker panicked");
            }
        }

        let budget_exceeded = shared.budget_exceeded.load(Ordering::SeqCst);
        let cancelled = cancel.is_cancelled() && !budget_exceeded;
        let shared = Arc::try_unwrap(shared)
            .map_err(|_| anyhow::anyhow!("worker still holds shared state"))?;
        let report = shared.summary.finalize();
        report.log();

        Ok(PipelineResult {
            report,
            cancelled,
            budget_exceeded,
        })
    }

    /// Apply the cleanup policy and make sure both roots exist
    async fn prepare_roots(&self) -> Result<()> {
        let paths = &self.settings.paths;
        if self.settings.cleanup_downloads_before_run && paths.downloads.exists() {
            info!(path = %paths.downloads.display(), "Cleaning downloads root");
            tokio::fs::remove_dir_all(&paths.downloads)
                .await
                .context("cleaning downloads root")?;
        }
        if self.settings.cleanup_staging_before_run && paths.staging.exists() {
            info!(path = %paths.staging.display(), "Cleaning staging root");
            tokio::fs::remove_dir_all(&paths.staging)
                .await
                .context("cleaning staging root")?;
        }
        tokio::fs::create_dir_all(&paths.downloads)
            .await
            .context("creating downloads root")?;
        tokio::fs::create_dir_all(&paths.staging)
            .await
            .context("creating staging root")?;
        Ok(())
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    rx: Arc<Mutex<mpsc::Receiver<SourceDescriptor>>>,
    cancel: CancellationToken,
) {
    loop {
        let source = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(source) = source else {
            break;
        };

        if cancel.is_cancelled() {
            shared
                .summary
                .record_terminal(&source.id, SourceState::SkippedCancelled, "run cancelled");
            continue;
        }

        let source_cancel = cancel.child_token();
        let deadline = shared.settings.source_deadline();
        let state = match tokio::time::timeout(
            deadline,
            process_source(&shared, &source, &source_cancel),
        )
        .await
        {
            Ok(state) => state,
            Err(_) => {
                source_cancel.cancel();
                warn!(
                    source = %source.id,
                    timeout_secs = deadline.as_secs(),
                    "Source deadline exceeded"
                );
                shared
                    .summary
                    .record_terminal(&source.id, SourceState::Failed, "source timeout");
                SourceState::Failed
            },
        };

        if state == SourceState::Failed {
            let failed = shared.failed_sources.fetch_add(1, Ordering::SeqCst) + 1;
            if failed > shared.settings.max_pipeline_failures {
                if !shared.budget_exceeded.swap(true, Ordering::SeqCst) {
                    error!(
                        failed,
                        budget = shared.settings.max_pipeline_failures,
                        "Failure budget exceeded, cancelling run"
                    );
                    cancel.cancel();
                }
            }
        }
        tracing::debug!(worker_id, source = %source.id, state = state.as_str(), "Source settled");
    }
}

/// Run one source through extract and stage, recording summary events,
/// and classify its terminal state
async fn process_source(
    shared: &Shared,
    source: &SourceDescriptor,
    cancel: &CancellationToken,
) -> SourceState {
    let ctx = FetchContext {
        transport: &shared.transport,
        retry: &shared.retry,
        breakers: &shared.breakers,
        settings: &shared.settings,
        cancel,
    };

    let outcomes = handlers::fetch_source(&ctx, source).await;
    let had_outcomes = !outcomes.is_empty();

    let mut artifacts = Vec::new();
    let mut ok_artifacts: u32 = 0;
    let mut failed_artifacts: u32 = 0;
    let mut skipped: u32 = 0;
    let mut any_partial = false;
    let mut first_failure: Option<String> = None;

    for outcome in outcomes {
        match outcome {
            FetchOutcome::Fetched(artifact) => {
                shared.summary.record(
                    &source.id,
                    Phase::Download,
                    Status::Ok,
                    artifact.payload_path.display().to_string(),
                );
                any_partial |= artifact.partial;
                artifacts.push(artifact);
            },
            FetchOutcome::Skipped { reason, .. } => {
                shared
                    .summary
                    .record(&source.id, Phase::Download, Status::Skipped, reason);
                skipped += 1;
            },
            FetchOutcome::Failed { sub_resource, reason } => {
                let detail = match sub_resource {
                    Some(sub) => format!("{}: {}", sub, reason),
                    None => reason,
                };
                shared
                    .summary
                    .record(&source.id, Phase::Download, Status::Failed, detail.clone());
                first_failure.get_or_insert(detail);
                failed_artifacts += 1;
            },
        }
    }

    let materializer = Materializer::new(
        &shared.settings.paths.staging,
        &shared.names,
        &shared.mappings,
    );
    for artifact in &artifacts {
        if cancel.is_cancelled() {
            shared.summary.record(
                &source.id,
                Phase::Stage,
                Status::Skipped,
                "cancelled before staging",
            );
            continue;
        }
        match materializer.stage(source, artifact) {
            Ok(entries) => {
                let names: Vec<&str> =
                    entries.iter().map(|e| e.canonical_name.as_str()).collect();
                shared
                    .summary
                    .record(&source.id, Phase::Stage, Status::Ok, names.join(", "));
                ok_artifacts += 1;
            },
            Err(e) => {
                shared
                    .summary
                    .record(&source.id, Phase::Stage, Status::Failed, e.to_string());
                first_failure.get_or_insert(e.to_string());
                failed_artifacts += 1;
            },
        }
    }

    let state = if cancel.is_cancelled() {
        SourceState::SkippedCancelled
    } else if !had_outcomes || (ok_artifacts == 0 && failed_artifacts == 0) {
        SourceState::Skipped
    } else if failed_artifacts == 0 {
        if any_partial {
            SourceState::Partial
        } else {
            SourceState::Ok
        }
    } else if ok_artifacts > 0 {
        SourceState::Partial
    } else {
        SourceState::Failed
    };

    let cause = match state {
        SourceState::Ok => format!("{} artifact(s) staged", ok_artifacts),
        SourceState::Partial => format!(
            "{} staged, {} failed{}",
            ok_artifacts,
            failed_artifacts,
            if any_partial { ", incomplete pages" } else { "" }
        ),
        SourceState::Skipped => {
            if skipped > 0 {
                format!("{} sub-resource(s) skipped", skipped)
            } else {
                "no matching sub-resources".to_string()
            }
        },
        SourceState::SkippedCancelled => "cancelled".to_string(),
        SourceState::Failed => first_failure.unwrap_or_else(|| "all artifacts failed".to_string()),
    };
    shared.summary.record_terminal(&source.id, state, cause);
    state
}
