use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::{BatchCounters, BatchProgress, BatchRunner, ItemOutcome, PageCursor};
use crate::catalog::Catalog;
use crate::coordinates::CoordinatePair;
use crate::errors::{AppError, AppResult};
use crate::records::{LocationRecord, RecordFilter};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum ScanPhase {
    Idle,
    Scanning { page: usize, fetched: usize },
    Grouping { records: usize },
    Done { groups: usize },
    Error { message: String },
}

impl ScanPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPhase::Idle => "idle",
            ScanPhase::Scanning { .. } => "scanning",
            ScanPhase::Grouping { .. } => "grouping",
            ScanPhase::Done { .. } => "done",
            ScanPhase::Error { .. } => "error",
        }
    }
}

/// Records that share a location. `anchor` is the coordinate of the record
/// that opened the bucket; `members` are sorted ascending by id, so the first
/// member is the one to keep.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub key: String,
    pub anchor: CoordinatePair,
    pub members: Vec<LocationRecord>,
}

impl DuplicateGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub groups: Vec<DuplicateGroup>,
    pub scanned: usize,
    pub without_coordinates: usize,
}

/// Buckets records by location.
///
/// A tolerance of zero (or anything not strictly positive) groups by the
/// 6-decimal rounded key. A positive tolerance runs one greedy pass: each
/// record joins the first bucket whose anchor lies within `tolerance_m`
/// metres, or opens a new bucket anchored at itself. Anchors never move, so
/// the result depends on input order.
///
/// Only buckets with at least two members are returned, largest first; ties
/// keep the order in which buckets were opened.
pub fn group_duplicates(records: Vec<LocationRecord>, tolerance_m: f64) -> Vec<DuplicateGroup> {
    let mut buckets: Vec<DuplicateGroup> = Vec::new();
    let exact = !(tolerance_m.is_finite() && tolerance_m > 0.0);
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for record in records {
        let Some(point) = record.coordinates() else {
            continue;
        };

        let slot = if exact {
            by_key.get(&point.rounded_key()).copied()
        } else {
            buckets
                .iter()
                .position(|bucket| bucket.anchor.distance_m(&point) <= tolerance_m)
        };

        match slot {
            Some(index) => buckets[index].members.push(record),
            None => {
                let key = point.rounded_key();
                by_key.insert(key.clone(), buckets.len());
                buckets.push(DuplicateGroup {
                    key,
                    anchor: point,
                    members: vec![record],
                });
            }
        }
    }

    let mut groups: Vec<DuplicateGroup> = buckets
        .into_iter()
        .filter(|bucket| bucket.members.len() > 1)
        .collect();
    for group in &mut groups {
        group.members.sort_by_key(|member| member.id);
    }
    groups.sort_by(|a, b| b.members.len().cmp(&a.members.len()));
    groups
}

/// Pages through the catalog and groups what it finds.
pub struct DuplicateDetector {
    catalog: Arc<dyn Catalog>,
    tolerance_m: f64,
    page_size: usize,
    max_pages: Option<usize>,
    stop: Arc<AtomicBool>,
    phase: Mutex<ScanPhase>,
}

impl DuplicateDetector {
    pub fn new(catalog: Arc<dyn Catalog>, tolerance_m: f64) -> Self {
        Self {
            catalog,
            tolerance_m,
            page_size: 100,
            max_pages: None,
            stop: Arc::new(AtomicBool::new(false)),
            phase: Mutex::new(ScanPhase::Idle),
        }
    }

    pub fn with_paging(mut self, page_size: usize, max_pages: Option<usize>) -> Self {
        self.page_size = page_size.max(1);
        self.max_pages = max_pages;
        self
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase.lock().clone()
    }

    fn enter(&self, phase: ScanPhase, observer: Option<&(dyn Fn(&ScanPhase) + Send + Sync)>) {
        debug!(phase = phase.as_str(), "scan phase changed");
        if let Some(callback) = observer {
            callback(&phase);
        }
        *self.phase.lock() = phase;
    }

    /// A failed page fetch moves the detector to `Error` and is returned; the
    /// stop flag is honoured between pages and groups whatever was fetched.
    pub async fn scan(
        &self,
        filter: &RecordFilter,
        observer: Option<&(dyn Fn(&ScanPhase) + Send + Sync)>,
    ) -> AppResult<ScanReport> {
        let mut cursor = PageCursor::new(self.page_size, self.max_pages);
        let mut records = Vec::new();

        while cursor.has_next() {
            if self.stop.load(Ordering::SeqCst) {
                warn!(page = cursor.page, "scan stopped before the last page");
                break;
            }
            self.enter(
                ScanPhase::Scanning {
                    page: cursor.page,
                    fetched: records.len(),
                },
                observer,
            );
            let page = match self
                .catalog
                .fetch_page(filter, cursor.page, cursor.page_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(?err, page = cursor.page, "scan failed");
                    self.enter(
                        ScanPhase::Error {
                            message: err.to_string(),
                        },
                        observer,
                    );
                    return Err(err);
                }
            };
            cursor.advance(page.records.len(), page.total, page.total_pages);
            records.extend(page.records);
        }

        let scanned = records.len();
        let without_coordinates = records
            .iter()
            .filter(|record| record.coordinates().is_none())
            .count();
        self.enter(ScanPhase::Grouping { records: scanned }, observer);
        let groups = group_duplicates(records, self.tolerance_m);
        self.enter(
            ScanPhase::Done {
                groups: groups.len(),
            },
            observer,
        );
        info!(
            scanned,
            without_coordinates,
            groups = groups.len(),
            tolerance_m = self.tolerance_m,
            "duplicate scan finished"
        );

        Ok(ScanReport {
            groups,
            scanned,
            without_coordinates,
        })
    }
}

/// Operator selection over a set of duplicate groups, and the deletions that
/// follow from it.
#[derive(Debug, Clone, Default)]
pub struct DuplicateReview {
    groups: Vec<DuplicateGroup>,
    selected: BTreeSet<i64>,
}

impl DuplicateReview {
    pub fn new(groups: Vec<DuplicateGroup>) -> Self {
        Self {
            groups,
            selected: BTreeSet::new(),
        }
    }

    pub fn groups(&self) -> &[DuplicateGroup] {
        &self.groups
    }

    /// Keeps the lowest id of every group and marks the rest.
    pub fn select_all_but_first(&mut self) {
        self.selected = self
            .groups
            .iter()
            .flat_map(|group| group.members.iter().skip(1).map(|member| member.id))
            .collect();
    }

    pub fn deselect_all(&mut self) {
        self.selected.clear();
    }

    /// Returns whether `id` is selected afterwards. Ids outside the groups
    /// are ignored.
    pub fn toggle(&mut self, id: i64) -> bool {
        if !self.contains(id) {
            return false;
        }
        if !self.selected.remove(&id) {
            self.selected.insert(id);
            return true;
        }
        false
    }

    pub fn is_selected(&self, id: i64) -> bool {
        self.selected.contains(&id)
    }

    pub fn selected_ids(&self) -> Vec<i64> {
        self.selected.iter().copied().collect()
    }

    fn contains(&self, id: i64) -> bool {
        self.groups
            .iter()
            .any(|group| group.members.iter().any(|member| member.id == id))
    }

    fn forget(&mut self, ids: &[i64]) {
        for group in &mut self.groups {
            group.members.retain(|member| !ids.contains(&member.id));
        }
        self.groups.retain(|group| group.members.len() > 1);
        let remaining: BTreeSet<i64> = self
            .groups
            .iter()
            .flat_map(|group| group.members.iter().map(|member| member.id))
            .collect();
        self.selected.retain(|id| remaining.contains(id));
    }

    pub async fn delete_one(&mut self, catalog: &dyn Catalog, id: i64) -> AppResult<()> {
        delete_record(catalog, id).await?;
        self.forget(&[id]);
        Ok(())
    }

    /// Deletes every selected id through the runner. Failures (including a
    /// record that is already gone) are counted and leave the id in place.
    pub async fn delete_selected(
        &mut self,
        catalog: &dyn Catalog,
        runner: &BatchRunner,
        observer: Option<&(dyn Fn(BatchProgress) + Send + Sync)>,
    ) -> BatchCounters {
        let targets = self.selected_ids();
        let deleted = Mutex::new(Vec::with_capacity(targets.len()));

        let counters = runner
            .run(
                BatchCounters::default(),
                targets,
                |id| {
                    let deleted = &deleted;
                    async move {
                        delete_record(catalog, id).await?;
                        deleted.lock().push(id);
                        Ok(ItemOutcome::Succeeded)
                    }
                },
                observer,
            )
            .await;

        let deleted = deleted.into_inner();
        self.forget(&deleted);
        info!(
            deleted = deleted.len(),
            failed = counters.failed,
            groups_left = self.groups.len(),
            "duplicate deletion finished"
        );
        counters
    }
}

/// Deletes by id outside any review; used by the `delete` command.
pub async fn delete_ids(
    catalog: &dyn Catalog,
    runner: &BatchRunner,
    ids: Vec<i64>,
    observer: Option<&(dyn Fn(BatchProgress) + Send + Sync)>,
) -> BatchCounters {
    runner
        .run(
            BatchCounters::default(),
            ids,
            |id| async move {
                delete_record(catalog, id).await?;
                Ok(ItemOutcome::Succeeded)
            },
            observer,
        )
        .await
}

async fn delete_record(catalog: &dyn Catalog, id: i64) -> AppResult<()> {
    if catalog.delete(id).await? {
        info!(id, "record deleted");
        Ok(())
    } else {
        Err(AppError::DeleteUnconfirmed(id))
    }
}
