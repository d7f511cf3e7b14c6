use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::auth::{Token, TokenService};
use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::cmr::{CatalogClient, search_all};
use crate::config::ResolvedConfig;
use crate::domain::{Clock, CyclePass, SystemClock, Timestamp};
use crate::error::SyncError;
use crate::fetch::{DownloadCandidate, Downloader, FetchOutcome, fetch_all, select_candidates};
use crate::links::extract_download_urls;
use crate::query::{SearchQuery, SearchWindow, build_cycle_query, build_sync_query};

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Phase,
    Info,
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn phase(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Phase,
            message: message.into(),
            elapsed: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Info,
            message: message.into(),
            elapsed: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Everything a finished run reports. The checkpoint decision is taken from these values.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub collection: String,
    pub window: SearchWindow,
    pub search_time: Timestamp,
    pub hits: u64,
    pub record_count: usize,
    pub pages: usize,
    pub truncated: bool,
    pub candidates: Vec<DownloadCandidate>,
    pub success_count: usize,
    pub failure_count: usize,
    pub failed_urls: Vec<String>,
    pub dry_run: bool,
    pub previous_checkpoint: Option<Timestamp>,
    pub checkpoint_advanced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub data_dir: String,
    pub marker_path: String,
    pub data_dir_exists: bool,
    pub checkpoint: CheckpointState,
    pub lookback_minutes: u32,
    pub data_since: Option<Timestamp>,
}

/// Runs the search, extract, download and commit sequence against injected clients.
#[derive(Clone)]
pub struct App<T: TokenService, C: CatalogClient, D: Downloader> {
    tokens: T,
    catalog: C,
    downloader: D,
    clock: Arc<dyn Clock>,
}

impl<T: TokenService, C: CatalogClient, D: Downloader> App<T, C, D> {
    pub fn new(tokens: T, catalog: C, downloader: D) -> Self {
        Self {
            tokens,
            catalog,
            downloader,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Incremental run: downloads granules new since the checkpoint and advances
    /// the checkpoint to the search time when there were hits and no failures.
    /// A scroll that ended before every hit arrived keeps the checkpoint in place;
    /// with pagination disabled only the first page is considered.
    pub fn sync(
        &self,
        config: &ResolvedConfig,
        options: SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, SyncError> {
        let store = CheckpointStore::new(config.data_dir.clone());
        sink.event(ProgressEvent::phase(format!(
            "phase=Resolve; data directory {}",
            store.data_dir()
        )));
        if !options.dry_run && store.ensure_data_dir()? {
            info!(data_dir = %store.data_dir(), "created data directory (first run)");
        }

        let state = store.inspect();
        let previous = state.timestamp();
        match &state {
            CheckpointState::Valid(ts) => {
                sink.event(ProgressEvent::info(format!("last successful run at {ts}")));
            }
            CheckpointState::Absent => {
                sink.event(ProgressEvent::info(format!(
                    "no {} marker, starting {} minutes back",
                    crate::checkpoint::MARKER_FILE,
                    config.lookback_minutes
                )));
            }
            CheckpointState::Unreadable(reason) => {
                warn!(
                    path = %store.marker_path(),
                    "checkpoint unreadable, using look-back window: {reason}"
                );
            }
            CheckpointState::Corrupt(content) => {
                warn!(
                    path = %store.marker_path(),
                    content = %content,
                    "checkpoint marker is not a timestamp"
                );
            }
        }

        self.with_token(sink, |token| {
            let now = self.clock.now();
            let lower_bound = match &state {
                CheckpointState::Valid(ts) => Some(*ts),
                CheckpointState::Absent | CheckpointState::Unreadable(_) => {
                    Some(now.minus_minutes(config.lookback_minutes))
                }
                CheckpointState::Corrupt(_) => None,
            };
            let query = build_sync_query(&config.filter, lower_bound, now, token)?;
            let mut result = self.search_and_fetch(config, &query, now, options, sink)?;
            result.previous_checkpoint = previous;

            if options.dry_run {
                return Ok(result);
            }
            if result.truncated && config.paginate {
                warn!(
                    hits = result.hits,
                    received = result.record_count,
                    "checkpoint left unchanged because the search ended early"
                );
            } else if result.hits > 0 && result.failure_count == 0 {
                if let Err(err) = store.save(now) {
                    error!(
                        path = %store.marker_path(),
                        "checkpoint not advanced, next run repeats this window: {err}"
                    );
                    return Err(err);
                }
                result.checkpoint_advanced = true;
                info!(checkpoint = %now, "checkpoint advanced");
                sink.event(ProgressEvent::phase(format!(
                    "phase=Store; checkpoint advanced to {now}"
                )));
            } else if result.failure_count > 0 {
                warn!(
                    failures = result.failure_count,
                    "checkpoint left unchanged because some downloads failed"
                );
            } else {
                info!("no new granules, checkpoint left unchanged");
            }
            Ok(result)
        })
    }

    /// One-off download of a cycle (and optionally a pass).
    /// The checkpoint is never read or written.
    pub fn fetch_cycle(
        &self,
        config: &ResolvedConfig,
        cycle_pass: CyclePass,
        options: SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, SyncError> {
        let store = CheckpointStore::new(config.data_dir.clone());
        if !options.dry_run {
            store.ensure_data_dir()?;
        }
        self.with_token(sink, |token| {
            let now = self.clock.now();
            let query = build_cycle_query(&config.filter, cycle_pass, token)?;
            self.search_and_fetch(config, &query, now, options, sink)
        })
    }

    pub fn status(&self, config: &ResolvedConfig) -> StatusResult {
        let store = CheckpointStore::new(config.data_dir.clone());
        StatusResult {
            data_dir: store.data_dir().to_string(),
            marker_path: store.marker_path().to_string(),
            data_dir_exists: store.data_dir().as_std_path().is_dir(),
            checkpoint: store.inspect(),
            lookback_minutes: config.lookback_minutes,
            data_since: config.filter.data_since,
        }
    }

    /// Acquires a token, runs `body`, and revokes the token whatever `body` returned.
    fn with_token<R>(
        &self,
        sink: &dyn ProgressSink,
        body: impl FnOnce(&Token) -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        sink.event(ProgressEvent::phase("phase=Auth; requesting token"));
        let token = self.tokens.acquire()?;
        let result = body(&token);
        if let Err(err) = self.tokens.revoke(&token) {
            warn!("failed to delete CMR token: {err}");
        }
        result
    }

    fn search_and_fetch(
        &self,
        config: &ResolvedConfig,
        query: &SearchQuery,
        now: Timestamp,
        options: SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, SyncError> {
        let collection = config.filter.collection_label();
        sink.event(ProgressEvent::phase(format!(
            "phase=Search; {collection} {}",
            query.window().describe()
        )));
        if let Ok(url) = query.redacted_url(&config.endpoints.search_url()) {
            info!(%url, "searching CMR");
        }
        let results = search_all(&self.catalog, query, config.paginate)?;
        sink.event(ProgressEvent::info(format!(
            "{} granules for {collection} ({})",
            results.hits,
            query.window().describe()
        )));
        if results.truncated {
            sink.event(ProgressEvent::info(format!(
                "only {} of {} records received; the rest are not downloaded",
                results.items.len(),
                results.hits
            )));
        }

        let urls = extract_download_urls(&results.items);
        let candidates = select_candidates(&urls, &config.extensions);
        info!(
            links = urls.len(),
            candidates = candidates.len(),
            "selected download candidates"
        );

        let outcome = if options.dry_run {
            for candidate in &candidates {
                sink.event(ProgressEvent::info(format!("would download {}", candidate.url)));
            }
            FetchOutcome::default()
        } else {
            sink.event(ProgressEvent::phase(format!(
                "phase=Fetch; {} files",
                candidates.len()
            )));
            fetch_all(&self.downloader, &candidates, &config.data_dir, sink)
        };

        Ok(RunResult {
            collection,
            window: query.window().clone(),
            search_time: now,
            hits: results.hits,
            record_count: results.items.len(),
            pages: results.pages,
            truncated: results.truncated,
            candidates,
            success_count: outcome.success_count,
            failure_count: outcome.failure_count,
            failed_urls: outcome.failed_urls,
            dry_run: options.dry_run,
            previous_checkpoint: None,
            checkpoint_advanced: false,
        })
    }
}
