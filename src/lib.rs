pub mod batch;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod coordinates;
pub mod dedup;
pub mod enrichment;
pub mod errors;
pub mod generation;
pub mod journal;
pub mod normalizer;
pub mod records;
pub mod report;
pub mod response;
pub mod secrets;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::batch::{BatchCounters, BatchRunner, ItemOutcome, PageCursor};
pub use crate::catalog::{Catalog, HttpCatalogClient};
pub use crate::config::AppConfig;
pub use crate::coordinates::{extract_coordinates, haversine_distance_m, CoordinatePair};
pub use crate::dedup::{group_duplicates, DuplicateDetector, DuplicateGroup, DuplicateReview, ScanPhase};
pub use crate::enrichment::{Enricher, EnrichmentJob, EnrichmentOutcome};
pub use crate::errors::{AppError, AppResult};
pub use crate::generation::{CompletionClient, CompletionPrompt, HttpCompletionClient};
pub use crate::normalizer::normalize_enhancement;
pub use crate::records::{Category, LocationRecord, RecordFilter, RecordPage, UpdateRequest};
pub use crate::response::extract_update;
pub use crate::secrets::CredentialVault;

/// Installs the global subscriber once. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,place_curator=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
