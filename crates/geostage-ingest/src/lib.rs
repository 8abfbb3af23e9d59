//! Geostage ingestion engine
//!
//! Ingests geospatial datasets from heterogeneous web sources and stages
//! them into a uniform on-disk layout for the downstream spatial loader.
//!
//! # Pipeline
//!
//! Config loader → orchestrator → (per source) handler → transport →
//! staging materializer → run summary. Four protocol handlers cover the
//! source kinds in the inventory: direct files, Atom feeds, tiled REST
//! query endpoints and OGC API Features collections.
//!
//! # Example
//!
//! ```no_run
//! use geostage_ingest::config::GlobalSettings;
//! use geostage_ingest::mapping::MappingSet;
//! use geostage_ingest::orchestrator::Orchestrator;
//! use geostage_ingest::sources::load_inventory;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = GlobalSettings::load("config/config.yaml".as_ref())?;
//!     let sources = load_inventory("config/sources.yaml".as_ref())?;
//!     let mappings = MappingSet::load("config/mappings.yaml".as_ref())?;
//!     let orchestrator = Orchestrator::new(settings, sources, mappings);
//!     let result = orchestrator.run(CancellationToken::new()).await?;
//!     println!("{} staged", result.report.totals.staged);
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod config;
pub mod handlers;
pub mod mapping;
pub mod orchestrator;
pub mod retry;
pub mod sources;
pub mod staging;
pub mod summary;
pub mod transport;
