use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::batch::{BatchCounters, BatchProgress, BatchRunner};
use crate::catalog::Catalog;
use crate::config::{clamp_page_size, AppConfig, PublicAppConfig};
use crate::coordinates::CoordinatePair;
use crate::dedup::{delete_ids, DuplicateDetector, DuplicateReview, ScanPhase};
use crate::enrichment::{require_filter, Enricher, EnrichmentJob};
use crate::errors::{AppError, AppResult};
use crate::journal::RunJournal;
use crate::records::{LocationRecord, RecordFilter, UpdateRequest};
use crate::report::write_report_file;
use crate::secrets::CredentialStatus;

#[derive(Debug, Clone, Default)]
pub struct EnrichOptions {
    pub filter: RecordFilter,
    pub page_size: Option<usize>,
    pub max_pages: Option<usize>,
    pub dry_run: bool,
    pub delay_ms: Option<u64>,
    pub all: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichSummary {
    pub counters: BatchCounters,
    pub pages: usize,
    pub dry_run: bool,
    pub journal_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct DedupeOptions {
    pub filter: RecordFilter,
    pub tolerance_m: f64,
    pub page_size: Option<usize>,
    pub max_pages: Option<usize>,
    pub report: Option<PathBuf>,
    pub delete_duplicates: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupeSummary {
    pub scanned: usize,
    pub without_coordinates: usize,
    pub groups: usize,
    pub duplicate_records: usize,
    pub report_path: Option<String>,
    pub deletion: Option<BatchCounters>,
    pub groups_remaining: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReport {
    pub version: &'static str,
    pub config: PublicAppConfig,
    pub credentials: Option<CredentialStatus>,
}

fn log_progress(progress: BatchProgress) {
    info!(
        processed = progress.counters.processed,
        succeeded = progress.counters.succeeded,
        failed = progress.counters.failed,
        skipped = progress.counters.skipped,
        remaining = progress.remaining,
        "batch progress"
    );
}

fn log_phase(phase: &ScanPhase) {
    info!(phase = phase.as_str(), detail = ?phase, "scan progress");
}

fn page_size(config: &AppConfig, requested: Option<usize>) -> usize {
    requested.map(clamp_page_size).unwrap_or(config.catalog_page_size)
}

pub async fn enrich(
    config: &AppConfig,
    catalog: Arc<dyn Catalog>,
    options: EnrichOptions,
    stop: Arc<AtomicBool>,
) -> AppResult<EnrichSummary> {
    require_filter(&options.filter, options.all)?;
    let enricher = Enricher::from_config(config)?;
    let journal = RunJournal::open(config)?;
    let delay = Duration::from_millis(options.delay_ms.unwrap_or(config.batch_delay_ms));
    let runner = BatchRunner::new(delay).with_stop_flag(stop);

    if let Err(err) = journal.record(
        "run_started",
        serde_json::json!({
            "command": "enrich",
            "dryRun": options.dry_run,
            "version": env!("CARGO_PKG_VERSION"),
        }),
    ) {
        warn!(?err, "failed to write journal entry");
    }

    let journal_path = journal.path().to_string_lossy().to_string();
    let job = EnrichmentJob::new(catalog, enricher, delay)
        .with_runner(runner)
        .with_journal(journal)
        .with_paging(page_size(config, options.page_size), options.max_pages)
        .dry_run(options.dry_run);
    let state = job.run(&options.filter, Some(&log_progress)).await?;

    Ok(EnrichSummary {
        counters: state.counters,
        pages: state.cursor.page.saturating_sub(1),
        dry_run: options.dry_run,
        journal_path,
    })
}

pub async fn dedupe(
    config: &AppConfig,
    catalog: Arc<dyn Catalog>,
    options: DedupeOptions,
    stop: Arc<AtomicBool>,
) -> AppResult<DedupeSummary> {
    if !options.tolerance_m.is_finite() || options.tolerance_m < 0.0 {
        return Err(AppError::Config(format!(
            "tolerance must be a non-negative number of metres, got {}",
            options.tolerance_m
        )));
    }

    let detector = DuplicateDetector::new(Arc::clone(&catalog), options.tolerance_m)
        .with_paging(page_size(config, options.page_size), options.max_pages)
        .with_stop_flag(Arc::clone(&stop));
    let report = detector.scan(&options.filter, Some(&log_phase)).await?;

    let groups = report.groups.len();
    let duplicate_records = report
        .groups
        .iter()
        .map(|group| group.len().saturating_sub(1))
        .sum();

    let report_path = match &options.report {
        Some(path) => {
            let rows = write_report_file(path, &report.groups)?;
            info!(rows, path = %path.display(), "wrote duplicate report");
            Some(path.to_string_lossy().to_string())
        }
        None => None,
    };

    let mut review = DuplicateReview::new(report.groups);
    let deletion = if options.delete_duplicates {
        review.select_all_but_first();
        let runner = BatchRunner::new(Duration::from_millis(config.batch_delay_ms))
            .with_stop_flag(stop);
        Some(
            review
                .delete_selected(catalog.as_ref(), &runner, Some(&log_progress))
                .await,
        )
    } else {
        None
    };

    Ok(DedupeSummary {
        scanned: report.scanned,
        without_coordinates: report.without_coordinates,
        groups,
        duplicate_records,
        report_path,
        deletion,
        groups_remaining: review.groups().len(),
    })
}

pub async fn delete(
    config: &AppConfig,
    catalog: Arc<dyn Catalog>,
    ids: Vec<i64>,
    stop: Arc<AtomicBool>,
) -> AppResult<BatchCounters> {
    if ids.is_empty() {
        return Err(AppError::Config("no ids given".into()));
    }
    let runner = BatchRunner::new(Duration::from_millis(config.batch_delay_ms)).with_stop_flag(stop);
    Ok(delete_ids(catalog.as_ref(), &runner, ids, Some(&log_progress)).await)
}

/// Out-of-range coordinates are rejected before the catalog is contacted.
pub async fn set_coordinates(
    catalog: Arc<dyn Catalog>,
    id: i64,
    lat: f64,
    lng: f64,
) -> AppResult<LocationRecord> {
    let pair = CoordinatePair::new(lat, lng).ok_or_else(|| {
        AppError::Validation(format!("coordinates ({lat}, {lng}) out of range"))
    })?;
    let update = UpdateRequest::coordinates(pair);
    update.validate()?;
    let record = catalog.update(id, &update).await?;
    info!(id, lat, lng, "coordinates updated");
    Ok(record)
}

pub fn config_report(config: &AppConfig, credentials: Option<CredentialStatus>) -> ConfigReport {
    ConfigReport {
        version: env!("CARGO_PKG_VERSION"),
        config: config.public_profile(),
        credentials,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;
    use crate::config::test_config;
    use crate::records::RecordPage;

    #[derive(Default)]
    struct RecordingCatalog {
        records: Vec<LocationRecord>,
        updates: Mutex<Vec<(i64, UpdateRequest)>>,
        deletes: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Catalog for RecordingCatalog {
        async fn fetch_page(
            &self,
            _filter: &RecordFilter,
            page: usize,
            _page_size: usize,
        ) -> AppResult<RecordPage> {
            let records = if page == 1 { self.records.clone() } else { Vec::new() };
            Ok(RecordPage {
                total: self.records.len(),
                total_pages: 1,
                records,
            })
        }

        async fn update(&self, id: i64, update: &UpdateRequest) -> AppResult<LocationRecord> {
            self.updates.lock().push((id, update.clone()));
            Ok(LocationRecord {
                id,
                lat: update.lat,
                lng: update.lng,
                ..LocationRecord::default()
            })
        }

        async fn delete(&self, id: i64) -> AppResult<bool> {
            self.deletes.lock().push(id);
            Ok(true)
        }
    }

    fn at(id: i64, lat: f64, lng: f64) -> LocationRecord {
        LocationRecord {
            id,
            lat: Some(lat),
            lng: Some(lng),
            ..LocationRecord::default()
        }
    }

    fn stop() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test]
    async fn set_coordinates_rejects_out_of_range_without_calling_catalog() {
        let catalog = Arc::new(RecordingCatalog::default());
        let err = set_coordinates(catalog.clone(), 1, 95.0, 10.0).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(catalog.updates.lock().is_empty());

        let record = set_coordinates(catalog.clone(), 1, 64.1417, -21.9266).await.unwrap();
        assert_eq!(record.lat, Some(64.1417));
        let updates = catalog.updates.lock();
        assert_eq!(
            serde_json::to_value(&updates[0].1).unwrap(),
            serde_json::json!({ "lat": 64.1417, "lng": -21.9266 })
        );
    }

    #[tokio::test]
    async fn enrich_refuses_an_unfiltered_run() {
        let catalog = Arc::new(RecordingCatalog::default());
        let err = enrich(&test_config(), catalog, EnrichOptions::default(), stop())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn enrich_requires_a_model_key_before_touching_the_catalog() {
        let mut config = test_config();
        config.model_api_key = None;
        let options = EnrichOptions {
            all: true,
            ..EnrichOptions::default()
        };
        let err = enrich(&config, Arc::new(RecordingCatalog::default()), options, stop())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn dedupe_writes_report_and_deletes_all_but_the_lowest_id() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(RecordingCatalog {
            records: vec![at(5, 1.0, 1.0), at(3, 1.0, 1.0), at(8, 1.0, 1.0), at(9, 2.0, 2.0)],
            ..RecordingCatalog::default()
        });
        let options = DedupeOptions {
            report: Some(dir.path().join("dupes.csv")),
            delete_duplicates: true,
            ..DedupeOptions::default()
        };

        let summary = dedupe(&test_config(), catalog.clone(), options, stop())
            .await
            .unwrap();

        assert_eq!(summary.scanned, 4);
        assert_eq!(summary.groups, 1);
        assert_eq!(summary.duplicate_records, 2);
        assert_eq!(summary.deletion.unwrap().succeeded, 2);
        assert_eq!(summary.groups_remaining, 0);
        assert_eq!(*catalog.deletes.lock(), vec![5, 8]);
        assert!(dir.path().join("dupes.csv").exists());
    }

    #[tokio::test]
    async fn dedupe_rejects_negative_tolerance() {
        let options = DedupeOptions {
            tolerance_m: -1.0,
            ..DedupeOptions::default()
        };
        let result = dedupe(&test_config(), Arc::new(RecordingCatalog::default()), options, stop()).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn delete_needs_ids() {
        let catalog = Arc::new(RecordingCatalog::default());
        assert!(delete(&test_config(), catalog.clone(), Vec::new(), stop()).await.is_err());
        let counters = delete(&test_config(), catalog.clone(), vec![1, 2], stop()).await.unwrap();
        assert_eq!(counters.succeeded, 2);
        assert_eq!(*catalog.deletes.lock(), vec![1, 2]);
    }

    #[test]
    fn config_report_hides_secrets() {
        let report = config_report(&test_config(), None);
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("test-key"));
        assert!(json.contains("\"has_model_api_key\":true"));
    }
}
