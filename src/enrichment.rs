use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::batch::{BatchProgress, BatchRunState, BatchRunner, ItemOutcome};
use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::generation::{CompletionClient, CompletionPrompt, HttpCompletionClient};
use crate::journal::RunJournal;
use crate::records::{LocationRecord, RecordFilter, UpdateRequest};
use crate::normalizer::normalize_enhancement;
use crate::response::parse_payload;

const SYSTEM_INSTRUCTION: &str = "You are a meticulous travel data editor. You correct and complete \
records describing points of interest. You only state facts you are confident about and you always \
answer with a single JSON object inside a ```json fenced code block.";

#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentOutcome {
    Enriched(UpdateRequest),
    NoUsableData,
}

/// Turns one record into one completion call and one proposed update.
#[derive(Clone)]
pub struct Enricher {
    client: Arc<dyn CompletionClient>,
    language: String,
}

impl Enricher {
    /// Requires `MODEL_API_KEY`; without it this fails before any network call.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let client = HttpCompletionClient::from_config(config)?.into_shared();
        Ok(Self::with_client(client, &config.enrichment_language))
    }

    pub fn with_client(client: Arc<dyn CompletionClient>, language: impl Into<String>) -> Self {
        Self {
            client,
            language: language.into(),
        }
    }

    pub fn build_prompt(&self, record: &LocationRecord) -> AppResult<CompletionPrompt> {
        let context = serde_json::to_string_pretty(record)?;
        let user = format!(
            "Current record (JSON):\n{context}\n\n\
Instructions:\n\
1. Write `nameLocal` and `description` in {language}; `nameEN` is the official English name.\n\
2. Return only fields you want to change. Every field you return replaces the stored value \
completely, so repeat unchanged parts of a text you are editing. Omit fields you would not change; \
never return null.\n\
3. Allowed fields: nameLocal, nameEN, category, address, description, rating, lat, lng, \
metadata, physicalMetadata.\n\
4. `category` is one of ATTRACTION, RESTAURANT, SHOPPING, LODGING, TRANSIT_HUB.\n\
5. `rating` is a number from 0 to 5. `lat`/`lng` are decimal degrees; only include them if the \
current values are missing or clearly wrong.\n\
6. `metadata` and `physicalMetadata` replace the whole object when present.\n\
7. Reply with exactly one ```json fenced code block containing a single JSON object and nothing \
else inside the fence.",
            language = self.language,
        );
        Ok(CompletionPrompt {
            system: SYSTEM_INSTRUCTION.to_string(),
            user,
        })
    }

    /// One completion call, no retries. Transport and API failures are errors;
    /// a reply without a usable payload is [`EnrichmentOutcome::NoUsableData`].
    pub async fn enrich(&self, record: &LocationRecord) -> AppResult<EnrichmentOutcome> {
        let prompt = self.build_prompt(record)?;
        let completion = self.client.complete(&prompt).await?;

        let Some((source, payload)) = parse_payload(&completion) else {
            debug!(id = record.id, "completion carried no parseable payload");
            return Ok(EnrichmentOutcome::NoUsableData);
        };

        let update = normalize_enhancement(&payload, record.metadata.as_ref());
        if update.is_empty() {
            debug!(id = record.id, source = source.as_str(), "payload mapped to an empty update");
            return Ok(EnrichmentOutcome::NoUsableData);
        }

        debug!(
            id = record.id,
            source = source.as_str(),
            fields = update.field_count(),
            "extracted update from completion"
        );
        Ok(EnrichmentOutcome::Enriched(update))
    }
}

/// Pages through the filtered catalog and enriches every record in order.
pub struct EnrichmentJob {
    catalog: Arc<dyn Catalog>,
    enricher: Enricher,
    runner: BatchRunner,
    journal: Option<RunJournal>,
    dry_run: bool,
    page_size: usize,
    max_pages: Option<usize>,
}

impl EnrichmentJob {
    pub fn new(catalog: Arc<dyn Catalog>, enricher: Enricher, delay: Duration) -> Self {
        Self {
            catalog,
            enricher,
            runner: BatchRunner::new(delay),
            journal: None,
            dry_run: false,
            page_size: 100,
            max_pages: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_journal(mut self, journal: RunJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_paging(mut self, page_size: usize, max_pages: Option<usize>) -> Self {
        self.page_size = page_size.max(1);
        self.max_pages = max_pages;
        self
    }

    pub fn with_runner(mut self, runner: BatchRunner) -> Self {
        self.runner = runner;
        self
    }

    /// A page that cannot be fetched aborts the run with that error after the
    /// journal is flushed; per-record failures never do.
    pub async fn run(
        &self,
        filter: &RecordFilter,
        observer: Option<&(dyn Fn(BatchProgress) + Send + Sync)>,
    ) -> AppResult<BatchRunState> {
        let mut state = BatchRunState::new(self.page_size, self.max_pages);
        info!(?filter, dry_run = self.dry_run, "starting enrichment run");

        while state.cursor.has_next() && !self.runner.stop_requested() {
            let page = match self
                .catalog
                .fetch_page(filter, state.cursor.page, state.cursor.page_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        ?err,
                        page = state.cursor.page,
                        processed = state.counters.processed,
                        "failed to fetch catalog page; aborting run"
                    );
                    self.journal_event(
                        "page_failed",
                        json!({ "page": state.cursor.page, "error": err.to_string(), "counters": state.counters }),
                    );
                    self.flush_journal();
                    return Err(err);
                }
            };
            state
                .cursor
                .advance(page.records.len(), page.total, page.total_pages);
            if page.records.is_empty() {
                break;
            }

            state.counters = self
                .runner
                .run(
                    state.counters,
                    page.records,
                    |record| self.process_record(record),
                    observer,
                )
                .await;
        }

        self.flush_journal();
        info!(
            processed = state.counters.processed,
            succeeded = state.counters.succeeded,
            failed = state.counters.failed,
            skipped = state.counters.skipped,
            "enrichment run finished"
        );
        Ok(state)
    }

    async fn process_record(&self, record: LocationRecord) -> AppResult<ItemOutcome> {
        let id = record.id;
        let update = match self.enricher.enrich(&record).await {
            Ok(EnrichmentOutcome::Enriched(update)) => update,
            Ok(EnrichmentOutcome::NoUsableData) => {
                info!(id, name = record.display_name(), "skipped: no usable data");
                self.journal_event("skipped", json!({ "id": id, "reason": "no usable data" }));
                return Ok(ItemOutcome::Skipped("no usable data".into()));
            }
            Err(err) => {
                self.journal_event("failed", json!({ "id": id, "error": err.to_string() }));
                return Err(err);
            }
        };

        if let Err(err) = update.validate() {
            self.journal_event("failed", json!({ "id": id, "error": err.to_string() }));
            return Err(err);
        }

        if self.dry_run {
            let payload = serde_json::to_value(&update)?;
            info!(id, %payload, "dry run: would update record");
            self.journal_event("would_update", json!({ "id": id, "update": payload }));
            return Ok(ItemOutcome::Succeeded);
        }

        match self.catalog.update(id, &update).await {
            Ok(_) => {
                info!(id, fields = update.field_count(), "record enriched");
                self.journal_event("updated", json!({ "id": id, "update": update }));
                Ok(ItemOutcome::Succeeded)
            }
            Err(err) => {
                self.journal_event("failed", json!({ "id": id, "error": err.to_string() }));
                Err(err)
            }
        }
    }

    fn journal_event(&self, name: &str, payload: serde_json::Value) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record(name, payload) {
                warn!(?err, "failed to write journal entry");
            }
        }
    }

    fn flush_journal(&self) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.flush() {
                warn!(?err, "failed to flush journal");
            }
        }
    }
}

/// Rejects an unfiltered enrichment unless the caller opted in explicitly.
pub fn require_filter(filter: &RecordFilter, allow_all: bool) -> AppResult<()> {
    if filter.is_unfiltered() && !allow_all {
        return Err(AppError::Config(
            "refusing to enrich the whole catalog; pass a filter or --all".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::records::{Category, RecordPage};

    struct ScriptedModel {
        replies: Mutex<Vec<AppResult<String>>>,
        prompts: Mutex<Vec<CompletionPrompt>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<AppResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().rev().collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedModel {
        async fn complete(&self, prompt: &CompletionPrompt) -> AppResult<String> {
            self.prompts.lock().push(prompt.clone());
            self.replies
                .lock()
                .pop()
                .unwrap_or_else(|| Ok("no payload".to_string()))
        }
    }

    #[derive(Default)]
    struct MemoryCatalog {
        pages: Vec<Vec<LocationRecord>>,
        updates: Mutex<Vec<(i64, UpdateRequest)>>,
        fail_updates_for: Vec<i64>,
        fail_on_page: Option<usize>,
    }

    #[async_trait]
    impl Catalog for MemoryCatalog {
        async fn fetch_page(
            &self,
            _filter: &RecordFilter,
            page: usize,
            _page_size: usize,
        ) -> AppResult<RecordPage> {
            if self.fail_on_page == Some(page) {
                return Err(AppError::Api {
                    endpoint: "catalog",
                    status: 502,
                    message: "bad gateway".into(),
                });
            }
            let total = self.pages.iter().map(Vec::len).sum();
            Ok(RecordPage {
                records: self.pages.get(page - 1).cloned().unwrap_or_default(),
                total,
                total_pages: self.pages.len(),
            })
        }

        async fn update(&self, id: i64, update: &UpdateRequest) -> AppResult<LocationRecord> {
            if self.fail_updates_for.contains(&id) {
                return Err(AppError::Api {
                    endpoint: "catalog",
                    status: 500,
                    message: "write failed".into(),
                });
            }
            self.updates.lock().push((id, update.clone()));
            Ok(LocationRecord {
                id,
                ..LocationRecord::default()
            })
        }

        async fn delete(&self, _id: i64) -> AppResult<bool> {
            Ok(true)
        }
    }

    fn record(id: i64, name: &str) -> LocationRecord {
        LocationRecord {
            id,
            name_local: Some(name.to_string()),
            ..LocationRecord::default()
        }
    }

    fn filter() -> RecordFilter {
        RecordFilter {
            country_code: Some("IS".into()),
            ..RecordFilter::default()
        }
    }

    #[tokio::test]
    async fn dry_run_extracts_update_without_writing() {
        let model = ScriptedModel::new(vec![Ok(
            "```json\n{\"nameEN\":\"Hallgrímskirkja\",\"category\":\"ATTRACTION\"}\n```".into(),
        )]);
        let catalog = Arc::new(MemoryCatalog {
            pages: vec![vec![record(7, "雷克雅未克大教堂")]],
            ..MemoryCatalog::default()
        });
        let enricher = Enricher::with_client(model.clone(), "Simplified Chinese");

        let outcome = enricher.enrich(&record(7, "雷克雅未克大教堂")).await.unwrap();
        let EnrichmentOutcome::Enriched(update) = outcome else {
            panic!("expected an update");
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({ "nameEN": "Hallgrímskirkja", "category": "ATTRACTION" })
        );

        let model = ScriptedModel::new(vec![Ok(
            "```json\n{\"nameEN\":\"Hallgrímskirkja\",\"category\":\"ATTRACTION\"}\n```".into(),
        )]);
        let job = EnrichmentJob::new(
            catalog.clone(),
            Enricher::with_client(model, "Simplified Chinese"),
            Duration::ZERO,
        )
        .dry_run(true);
        let state = job.run(&filter(), None).await.unwrap();

        assert_eq!(state.counters.succeeded, 1);
        assert!(catalog.updates.lock().is_empty());
    }

    #[tokio::test]
    async fn prompt_embeds_record_and_instructions() {
        let model = ScriptedModel::new(vec![]);
        let enricher = Enricher::with_client(model.clone(), "Simplified Chinese");
        let mut subject = record(7, "雷克雅未克大教堂");
        subject.extra.insert("openingHours".into(), json!("09:00-21:00"));

        let prompt = enricher.build_prompt(&subject).unwrap();
        assert!(prompt.user.contains("雷克雅未克大教堂"));
        assert!(prompt.user.contains("openingHours"));
        assert!(prompt.user.contains("Simplified Chinese"));
        assert!(prompt.user.contains("```json"));
        assert!(prompt.system.contains("JSON object"));
    }

    #[tokio::test]
    async fn unusable_reply_is_skipped_not_failed() {
        let model = ScriptedModel::new(vec![
            Ok("I could not find anything about this place.".into()),
            Ok("```json\n{}\n```".into()),
        ]);
        let enricher = Enricher::with_client(model, "English");
        assert_eq!(
            enricher.enrich(&record(1, "a")).await.unwrap(),
            EnrichmentOutcome::NoUsableData
        );
        assert_eq!(
            enricher.enrich(&record(2, "b")).await.unwrap(),
            EnrichmentOutcome::NoUsableData
        );
    }

    #[tokio::test]
    async fn keeps_existing_coordinates_from_metadata() {
        let model = ScriptedModel::new(vec![Ok("```json\n{\"nameLocal\": \"X\"}\n```".into())]);
        let enricher = Enricher::with_client(model, "English");
        let mut subject = record(3, "x");
        subject.metadata = Some(json!({ "lat": 1, "lng": 2 }));
        let EnrichmentOutcome::Enriched(update) = enricher.enrich(&subject).await.unwrap() else {
            panic!("expected an update");
        };
        assert_eq!((update.lat, update.lng), (Some(1.0), Some(2.0)));
    }

    #[tokio::test]
    async fn run_counts_each_outcome_and_keeps_going() {
        let model = ScriptedModel::new(vec![
            Ok("```json\n{\"category\": \"restaurant\"}\n```".into()),
            Err(AppError::Api {
                endpoint: "completion endpoint",
                status: 429,
                message: "Rate limit reached".into(),
            }),
            Ok("nothing useful".into()),
            Ok("```json\n{\"rating\": 4.2}\n```".into()),
            Ok("```json\n{\"rating\": 11}\n```".into()),
        ]);
        let catalog = Arc::new(MemoryCatalog {
            pages: vec![
                vec![record(1, "a"), record(2, "b")],
                vec![record(3, "c"), record(4, "d")],
                vec![record(5, "e")],
            ],
            fail_updates_for: vec![4],
            ..MemoryCatalog::default()
        });
        let job = EnrichmentJob::new(
            catalog.clone(),
            Enricher::with_client(model, "English"),
            Duration::ZERO,
        )
        .with_paging(2, None);

        let state = job.run(&filter(), None).await.unwrap();
        let counters = state.counters;
        assert_eq!(counters.processed, 5);
        assert_eq!(counters.succeeded, 1);
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.failed, 3);
        assert!(counters.is_balanced());

        let updates = catalog.updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, 1);
        assert_eq!(updates[0].1.category, Some(Category::Restaurant));
        assert_eq!(state.cursor.fetched, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_holds_across_page_boundaries() {
        let model = ScriptedModel::new(vec![]);
        let catalog = Arc::new(MemoryCatalog {
            pages: vec![vec![record(1, "a")], vec![record(2, "b")], vec![record(3, "c")]],
            ..MemoryCatalog::default()
        });
        let job = EnrichmentJob::new(
            catalog,
            Enricher::with_client(model, "English"),
            Duration::from_secs(1),
        )
        .with_paging(1, None);

        let started = tokio::time::Instant::now();
        let state = job.run(&filter(), None).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(state.counters.processed, 3);
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn page_fetch_failure_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RunJournal::open_in(dir.path(), &crate::config::test_config()).unwrap();
        let model = ScriptedModel::new(vec![]);
        let catalog = Arc::new(MemoryCatalog {
            pages: vec![vec![record(1, "a")], vec![record(2, "b")]],
            fail_on_page: Some(2),
            ..MemoryCatalog::default()
        });
        let job = EnrichmentJob::new(catalog, Enricher::with_client(model.clone(), "English"), Duration::ZERO)
            .with_paging(1, None)
            .with_journal(journal.clone());

        let err = job.run(&filter(), None).await.unwrap_err();
        assert!(matches!(err, AppError::Api { status: 502, .. }));
        assert_eq!(model.prompts.lock().len(), 1);

        let contents = std::fs::read_to_string(journal.path()).unwrap();
        assert!(contents.contains("\"page_failed\""));
    }

    #[tokio::test]
    async fn max_pages_caps_the_run() {
        let model = ScriptedModel::new(vec![]);
        let catalog = Arc::new(MemoryCatalog {
            pages: vec![vec![record(1, "a")], vec![record(2, "b")]],
            ..MemoryCatalog::default()
        });
        let job = EnrichmentJob::new(catalog, Enricher::with_client(model, "English"), Duration::ZERO)
            .with_paging(1, Some(1));
        let state = job.run(&filter(), None).await.unwrap();
        assert_eq!(state.counters.processed, 1);
        assert_eq!(state.counters.skipped, 1);
    }

    #[test]
    fn unfiltered_runs_need_explicit_opt_in() {
        let err = require_filter(&RecordFilter::default(), false).unwrap_err();
        assert!(err.is_fatal());
        assert!(require_filter(&RecordFilter::default(), true).is_ok());
        assert!(require_filter(&filter(), false).is_ok());
    }

    #[test]
    fn missing_model_key_fails_before_any_call() {
        let mut config = crate::config::test_config();
        config.model_api_key = None;
        assert!(matches!(Enricher::from_config(&config), Err(AppError::Config(_))));
    }
}
