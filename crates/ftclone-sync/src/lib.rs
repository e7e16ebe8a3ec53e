//! Clone orchestration: the resumable paging loop, the operation registry and background runs.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use ftclone_adapters::{
    record_ocid, AdapterError, FindTenderSource, PageRequest, PageSource, DEFAULT_PAGE_LIMIT,
};
use ftclone_core::{
    generate_operation_id, validate_operation_id, Checkpoint, CloneEvent, CloneFilters,
    CloneResult, CloneStatus, Manifest, ManifestLayout, ManifestParams, OperationRecord, Quota,
    StatusSnapshot,
};
use ftclone_storage::{
    canonicalize, CloneStore, FetchError, HttpClientConfig, HttpFetcher, DEFAULT_SEGMENT_MAX_BYTES,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "ftclone-sync";

pub const DEFAULT_MAX_BACKGROUND: usize = 2;
pub const INTERRUPTED_CAUSE: &str =
    "interrupted before completion; resume with the same operation_id";
pub const UNBOUNDED_SNAPSHOT_WARNING: &str =
    "upstream echoed no updatedTo bound; records updated while cloning may be included";

#[derive(Debug, Clone)]
pub struct CloneConfig {
    pub base_url: String,
    pub api_version: String,
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_background: usize,
    pub page_limit: u32,
    pub segment_max_bytes: u64,
    pub run_deadline: Option<Duration>,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.find-tender.service.gov.uk".to_string(),
            api_version: "1.0".to_string(),
            data_dir: PathBuf::from("./data/clones"),
            user_agent: "ftclone/0.1".to_string(),
            http_timeout_secs: 60,
            max_background: DEFAULT_MAX_BACKGROUND,
            page_limit: DEFAULT_PAGE_LIMIT,
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            run_deadline: None,
        }
    }
}

impl CloneConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("FIND_TENDER_BASE_URL").unwrap_or(defaults.base_url),
            api_version: std::env::var("FIND_TENDER_VERSION").unwrap_or(defaults.api_version),
            data_dir: std::env::var("FTCLONE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            user_agent: std::env::var("FTCLONE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("FTCLONE_HTTP_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.http_timeout_secs),
            max_background: env_parse("FTCLONE_MAX_BACKGROUND").unwrap_or(defaults.max_background),
            page_limit: env_parse("FTCLONE_PAGE_LIMIT")
                .filter(|limit| *limit > 0)
                .unwrap_or(defaults.page_limit),
            segment_max_bytes: env_parse("FTCLONE_SEGMENT_MAX_BYTES")
                .filter(|bytes| *bytes > 0)
                .unwrap_or(defaults.segment_max_bytes),
            run_deadline: env_parse::<u64>("FTCLONE_RUN_DEADLINE_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }

    pub fn find_tender_source(&self) -> anyhow::Result<FindTenderSource> {
        let http = HttpFetcher::new(self.http_client_config())?;
        Ok(FindTenderSource::new(
            http,
            self.base_url.clone(),
            self.api_version.clone(),
        ))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UpstreamRejected,
    UpstreamUnavailable,
    Timeout,
    Storage,
    Aborted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpstreamRejected => "upstream_rejected",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Timeout => "timeout",
            Self::Storage => "storage",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Error)]
pub enum CloneError {
    #[error("operation_id not found: {0}")]
    NotFound(String),
    #[error("too many background clones running ({running}); max: {max}")]
    ConcurrencyLimit { running: usize, max: usize },
    #[error("operation {0} is already running")]
    AlreadyRunning(String),
    #[error("invalid clone request: {0}")]
    InvalidRequest(String),
    #[error("clone {operation_id} failed ({}): {cause}", .kind.as_str())]
    Failed {
        operation_id: String,
        kind: FailureKind,
        cause: String,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl CloneError {
    /// The readable cause recorded for a failed operation.
    pub fn cause(&self) -> String {
        match self {
            Self::Failed { cause, .. } => cause.clone(),
            Self::Storage(err) => format!("{err:#}"),
            other => other.to_string(),
        }
    }
}

/// Errors raised inside a run, before they are recorded as a failed operation.
#[derive(Debug, Error)]
enum RunFailure {
    #[error(transparent)]
    Upstream(#[from] AdapterError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
    #[error("clone did not finish within {}s", .0.as_secs_f64())]
    Deadline(Duration),
}

impl RunFailure {
    fn kind(&self) -> FailureKind {
        match self {
            Self::Upstream(AdapterError::Fetch(FetchError::Rejected { .. }))
            | Self::Upstream(AdapterError::Fetch(FetchError::InvalidBody { .. }))
            | Self::Upstream(AdapterError::MalformedPage(_)) => FailureKind::UpstreamRejected,
            Self::Upstream(AdapterError::Fetch(FetchError::Request(err))) if err.is_timeout() => {
                FailureKind::Timeout
            }
            Self::Upstream(_) => FailureKind::UpstreamUnavailable,
            Self::Storage(_) => FailureKind::Storage,
            Self::Deadline(_) => FailureKind::Timeout,
        }
    }

    fn cause(&self) -> String {
        match self {
            Self::Storage(err) => format!("{err:#}"),
            other => other.to_string(),
        }
    }
}

/// Caller-facing trigger parameters. `total` of `-1` or `0` means "no limit".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub total: i64,
    pub filters: CloneFilters,
    pub operation_id: Option<String>,
    pub force: bool,
    pub background: bool,
}

impl Default for CloneRequest {
    fn default() -> Self {
        Self {
            total: -1,
            filters: CloneFilters::default(),
            operation_id: None,
            force: false,
            background: false,
        }
    }
}

impl CloneRequest {
    pub fn validate(&self) -> Result<Quota, CloneError> {
        let quota = Quota::from_total(self.total).map_err(CloneError::InvalidRequest)?;
        self.filters.validate().map_err(CloneError::InvalidRequest)?;
        if let Some(operation_id) = &self.operation_id {
            validate_operation_id(operation_id).map_err(CloneError::InvalidRequest)?;
        }
        Ok(quota)
    }
}

/// Acknowledgement returned when a clone is handed to the background runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedOperation {
    pub status: String,
    pub operation_id: String,
    pub path: String,
    pub message: String,
}

impl QueuedOperation {
    fn new(operation_id: &str, path: String) -> Self {
        Self {
            status: "background_queued".to_string(),
            operation_id: operation_id.to_string(),
            message: format!("clone running in background; poll /admin/clone_status/{operation_id}"),
            path,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// The clone ran to completion in this call.
    Finished(CloneResult),
    /// The operation had already completed; nothing was fetched.
    AlreadyCompleted(CloneResult),
    Queued(QueuedOperation),
}

impl TriggerOutcome {
    pub fn operation_id(&self) -> &str {
        match self {
            Self::Finished(result) | Self::AlreadyCompleted(result) => &result.operation_id,
            Self::Queued(queued) => &queued.operation_id,
        }
    }
}

/// In-memory view of every operation this process has started.
#[derive(Debug)]
pub struct OperationRegistry {
    data_dir: PathBuf,
    max_background: usize,
    operations: Mutex<HashMap<String, OperationRecord>>,
}

impl OperationRegistry {
    pub fn new(data_dir: impl Into<PathBuf>, max_background: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_background,
            operations: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn max_background(&self) -> usize {
        self.max_background
    }

    /// Insert a running record unless the id is already running or, for background
    /// requests, the running count has reached the ceiling.
    pub async fn try_register(&self, record: OperationRecord) -> Result<(), CloneError> {
        let mut operations = self.operations.lock().await;
        if operations
            .get(&record.operation_id)
            .is_some_and(|existing| existing.status == CloneStatus::Running)
        {
            return Err(CloneError::AlreadyRunning(record.operation_id));
        }
        self.check_ceiling(&operations, record.background)?;
        operations.insert(record.operation_id.clone(), record);
        Ok(())
    }

    /// Claim the first free id among `base`, `base_2`, `base_3`, ... and register it.
    /// The id is free when neither this registry nor the data directory knows it; both
    /// checks and the insert happen under one lock.
    pub async fn register_fresh(
        &self,
        base: &str,
        background: bool,
        record: impl FnOnce(&str) -> OperationRecord,
    ) -> Result<String, CloneError> {
        let mut operations = self.operations.lock().await;
        self.check_ceiling(&operations, background)?;

        let mut candidate = base.to_string();
        let mut suffix = 2;
        loop {
            let on_disk = tokio::fs::try_exists(CloneStore::operation_root(
                &self.data_dir,
                &candidate,
            ))
            .await
            .unwrap_or(false);
            if !on_disk && !operations.contains_key(&candidate) {
                break;
            }
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }

        operations.insert(candidate.clone(), record(&candidate));
        Ok(candidate)
    }

    fn check_ceiling(
        &self,
        operations: &HashMap<String, OperationRecord>,
        background: bool,
    ) -> Result<(), CloneError> {
        if !background {
            return Ok(());
        }
        let running = operations
            .values()
            .filter(|r| r.status == CloneStatus::Running)
            .count();
        if running >= self.max_background {
            return Err(CloneError::ConcurrencyLimit {
                running,
                max: self.max_background,
            });
        }
        Ok(())
    }

    /// Record the terminal outcome. Only a running record transitions; returns whether
    /// this call settled it.
    pub async fn settle(&self, operation_id: &str, outcome: Result<CloneResult, String>) -> bool {
        let mut operations = self.operations.lock().await;
        let Some(record) = operations.get_mut(operation_id) else {
            return false;
        };
        if record.status != CloneStatus::Running {
            return false;
        }
        match outcome {
            Ok(result) => {
                record.status = CloneStatus::Completed;
                record.result = Some(result);
            }
            Err(cause) => {
                record.status = CloneStatus::Failed;
                record.error = Some(cause);
            }
        }
        true
    }

    pub async fn get(&self, operation_id: &str) -> Option<OperationRecord> {
        self.operations.lock().await.get(operation_id).cloned()
    }

    pub async fn is_running(&self, operation_id: &str) -> bool {
        self.operations
            .lock()
            .await
            .get(operation_id)
            .is_some_and(|r| r.status == CloneStatus::Running)
    }

    pub async fn running_count(&self) -> usize {
        self.operations
            .lock()
            .await
            .values()
            .filter(|r| r.status == CloneStatus::Running)
            .count()
    }

    /// Persisted status first, then the in-memory record.
    pub async fn poll(&self, operation_id: &str) -> Result<StatusSnapshot, CloneError> {
        validate_operation_id(operation_id).map_err(CloneError::InvalidRequest)?;
        if let Some(status) = CloneStore::read_persisted_status(&self.data_dir, operation_id).await
        {
            return Ok(status);
        }
        match self.get(operation_id).await {
            Some(record) => Ok(record.to_status_snapshot()),
            None => Err(CloneError::NotFound(operation_id.to_string())),
        }
    }

    /// Mark on-disk `running` operations that this process is not running as failed.
    /// Returns the recovered ids, sorted.
    pub async fn recover(&self) -> anyhow::Result<Vec<String>> {
        let mut recovered = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(recovered),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading {}", self.data_dir.display()))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", self.data_dir.display()))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let Some(operation_id) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !is_dir || validate_operation_id(&operation_id).is_err() {
                continue;
            }
            let Some(mut status) =
                CloneStore::read_persisted_status(&self.data_dir, &operation_id).await
            else {
                continue;
            };
            if status.status != CloneStatus::Running || self.is_running(&operation_id).await {
                continue;
            }
            let Some(store) = CloneStore::open_existing(&self.data_dir, &operation_id).await?
            else {
                continue;
            };

            status.status = CloneStatus::Failed;
            status.error = Some(INTERRUPTED_CAUSE.to_string());
            status.updated_at = Utc::now();
            store.save_status(&status).await?;
            warn!(operation_id = %operation_id, "marked interrupted clone as failed");
            recovered.push(operation_id);
        }

        recovered.sort();
        Ok(recovered)
    }
}

pub(crate) enum Prepared {
    Done(CloneResult),
    Run(PreparedRun),
}

/// A registered operation with its store opened and its running status persisted.
pub(crate) struct PreparedRun {
    store: Arc<CloneStore>,
    checkpoint: Checkpoint,
    quota: Quota,
    status: StatusSnapshot,
    started: Instant,
}

impl PreparedRun {
    fn operation_id(&self) -> &str {
        self.store.operation_id()
    }

    fn path(&self) -> String {
        self.store.root().display().to_string()
    }
}

pub struct CloneOrchestrator {
    config: CloneConfig,
    source: Arc<dyn PageSource>,
    registry: Arc<OperationRegistry>,
}

impl CloneOrchestrator {
    pub fn new(config: CloneConfig, source: Arc<dyn PageSource>) -> Self {
        let registry = Arc::new(OperationRegistry::new(
            config.data_dir.clone(),
            config.max_background,
        ));
        Self::with_registry(config, source, registry)
    }

    pub fn with_registry(
        config: CloneConfig,
        source: Arc<dyn PageSource>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            config,
            source,
            registry,
        }
    }

    /// Orchestrator backed by the live Find a Tender API.
    pub fn from_config(config: CloneConfig) -> anyhow::Result<Self> {
        let source = config.find_tender_source()?;
        Ok(Self::new(config, Arc::new(source)))
    }

    pub fn config(&self) -> &CloneConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub async fn poll(&self, operation_id: &str) -> Result<StatusSnapshot, CloneError> {
        self.registry.poll(operation_id).await
    }

    pub async fn trigger(self: &Arc<Self>, request: CloneRequest) -> Result<TriggerOutcome, CloneError> {
        // Registration and the run live on the runtime, so dropping this future cancels
        // neither and the registry is always settled.
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.start(request).await })
            .await
            .unwrap_or_else(|join_err| {
                Err(CloneError::Storage(anyhow::anyhow!(
                    "clone trigger task stopped: {join_err}"
                )))
            })
    }

    async fn start(self: Arc<Self>, request: CloneRequest) -> Result<TriggerOutcome, CloneError> {
        let plan = match self.prepare(&request).await? {
            Prepared::Done(result) => return Ok(TriggerOutcome::AlreadyCompleted(result)),
            Prepared::Run(plan) => plan,
        };

        let queued = QueuedOperation::new(plan.operation_id(), plan.path());
        let handle = BackgroundRunner::spawn(Arc::clone(&self), plan);
        if request.background {
            info!(operation_id = %queued.operation_id, "clone queued in background");
            return Ok(TriggerOutcome::Queued(queued));
        }

        handle
            .await
            .unwrap_or_else(|join_err| {
                Err(CloneError::Storage(anyhow::anyhow!(
                    "clone supervisor for {} stopped: {join_err}",
                    queued.operation_id
                )))
            })
            .map(TriggerOutcome::Finished)
    }

    /// Resolve the operation id, short-circuit finished operations, register, open the
    /// store and persist a `running` status.
    pub(crate) async fn prepare(&self, request: &CloneRequest) -> Result<Prepared, CloneError> {
        let quota = request.validate()?;
        let data_dir = &self.config.data_dir;

        let running_record = |operation_id: &str| {
            OperationRecord::running(
                operation_id,
                CloneStore::operation_root(data_dir, operation_id)
                    .display()
                    .to_string(),
                quota,
                request.filters.clone(),
                request.background,
            )
        };

        let mut rerun = false;
        let (operation_id, existing) = match &request.operation_id {
            Some(id) => {
                let store = CloneStore::open_existing(data_dir, id)
                    .await?
                    .ok_or_else(|| CloneError::NotFound(id.clone()))?;
                if let Some(result) = completed_result(&store).await {
                    if !request.force {
                        info!(operation_id = %id, "clone already completed; returning stored result");
                        return Ok(Prepared::Done(result));
                    }
                    rerun = true;
                }
                self.registry.try_register(running_record(id)).await?;
                (id.clone(), Some(store))
            }
            None => {
                let base = generate_operation_id(Utc::now(), &request.filters, quota);
                let id = self
                    .registry
                    .register_fresh(&base, request.background, running_record)
                    .await?;
                (id, None)
            }
        };

        match self.open_run(&operation_id, existing, request, quota, rerun).await {
            Ok(plan) => Ok(Prepared::Run(plan)),
            Err(err) => {
                let cause = format!("{err:#}");
                error!(operation_id = %operation_id, %cause, "could not start clone");
                self.registry.settle(&operation_id, Err(cause.clone())).await;
                Err(CloneError::Failed {
                    operation_id,
                    kind: FailureKind::Storage,
                    cause,
                })
            }
        }
    }

    async fn open_run(
        &self,
        operation_id: &str,
        existing: Option<CloneStore>,
        request: &CloneRequest,
        quota: Quota,
        rerun: bool,
    ) -> anyhow::Result<PreparedRun> {
        let resumed = existing.is_some();
        let store = match existing {
            Some(store) => store,
            None => CloneStore::create(&self.config.data_dir, operation_id).await?,
        }
        .with_segment_max_bytes(self.config.segment_max_bytes);

        let previous = if resumed { store.read_status().await } else { None };
        let checkpoint = if rerun {
            info!(operation_id, "forced re-run of a completed clone");
            store.remove_manifest().await?;
            Checkpoint::fresh(operation_id, &request.filters)
        } else {
            let checkpoint = store.load_checkpoint().await;
            // Without a checkpoint, filters persisted by an earlier attempt still bind.
            let frozen = match &checkpoint {
                Some(checkpoint) => Some(checkpoint.frozen_filters()),
                None => previous.as_ref().and_then(|s| s.filters.clone()),
            };
            if frozen
                .as_ref()
                .is_some_and(|frozen| filters_conflict(frozen, &request.filters))
            {
                warn!(
                    operation_id,
                    "resume request filters differ from the frozen ones; keeping frozen filters"
                );
            }
            match (checkpoint, frozen) {
                (Some(checkpoint), _) => checkpoint,
                (None, Some(frozen)) => Checkpoint::fresh(operation_id, &frozen),
                (None, None) => Checkpoint::fresh(operation_id, &request.filters),
            }
        };

        let now = Utc::now();
        let mut status = StatusSnapshot::new(operation_id, CloneStatus::Running);
        if resumed {
            status.started_at = previous.and_then(|s| s.started_at);
            status.resumed_at = Some(now);
        }
        status.started_at.get_or_insert(now);
        status.total_requested = Some(quota);
        status.filters = Some(checkpoint.frozen_filters());
        status.stats = Some(checkpoint.stats());
        status.cursor = checkpoint.cursor.clone();
        status.path = Some(store.root().display().to_string());
        status.warnings = checkpoint.warnings.clone();
        store.save_status(&status).await?;

        Ok(PreparedRun {
            store: Arc::new(store),
            checkpoint,
            quota,
            status,
            started: Instant::now(),
        })
    }

    /// Drive a prepared run to its end, persisting a failed status on error. The caller
    /// settles the registry.
    pub(crate) async fn run(&self, plan: PreparedRun) -> Result<CloneResult, CloneError> {
        let operation_id = plan.operation_id().to_string();
        let store = Arc::clone(&plan.store);
        let span = info_span!("clone_run", operation_id = %operation_id);
        let work = self.drive(plan).instrument(span.clone());
        let outcome = match self.config.run_deadline {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .unwrap_or(Err(RunFailure::Deadline(limit))),
            None => work.await,
        };

        let failure = match outcome {
            Ok(result) => return Ok(result),
            Err(failure) => failure,
        };
        let kind = failure.kind();
        let cause = failure.cause();
        span.in_scope(|| error!(kind = kind.as_str(), %cause, "clone failed"));
        persist_failure(&store, &cause).await;
        Err(CloneError::Failed {
            operation_id,
            kind,
            cause,
        })
    }

    async fn drive(&self, plan: PreparedRun) -> Result<CloneResult, RunFailure> {
        let PreparedRun {
            store,
            mut checkpoint,
            quota,
            mut status,
            started,
        } = plan;
        let info = self.source.info();
        info!(
            pages = checkpoint.pages,
            cursor = ?checkpoint.cursor,
            total = quota.as_total(),
            "clone paging"
        );

        while !checkpoint.exhausted && !quota.is_satisfied(checkpoint.processed_total) {
            let request = PageRequest {
                limit: self.config.page_limit,
                cursor: checkpoint.cursor.clone(),
                filters: checkpoint.frozen_filters(),
            };
            let page = self.source.fetch_page(&request).await?;

            if checkpoint.pages == 0 && checkpoint.fixed_updated_to.is_none() {
                match page.implied_updated_to() {
                    Some(bound) => {
                        info!(updated_to = %bound, "froze upper time bound from first response");
                        checkpoint.fixed_updated_to = Some(bound);
                    }
                    None => {
                        warn!("{UNBOUNDED_SNAPSHOT_WARNING}");
                        checkpoint.push_warning(UNBOUNDED_SNAPSHOT_WARNING);
                    }
                }
            }

            if page.records.is_empty() {
                checkpoint.exhausted = true;
                commit_page(&store, &mut checkpoint, &mut status, started).await?;
                break;
            }

            checkpoint.pages += 1;
            checkpoint.received_raw += page.records.len() as u64;
            let take = quota
                .remaining(checkpoint.processed_total)
                .map_or(page.records.len(), |left| {
                    left.min(page.records.len() as u64) as usize
                });

            let fetched_at = Utc::now();
            for record in page.records.iter().take(take) {
                let (content_hash, bytes) =
                    canonicalize(record).context("canonicalizing upstream record")?;
                if store.write_object_if_missing(&content_hash, &bytes).await? {
                    checkpoint.objects_written += 1;
                }
                store
                    .append_event(&CloneEvent {
                        fetched_at,
                        source: info.source.clone(),
                        page: checkpoint.pages,
                        cursor: request.cursor.clone(),
                        ocid: record_ocid(record),
                        content_hash,
                        upstream: page.provenance(record),
                        page_uri: page.uri.clone(),
                    })
                    .await?;
                checkpoint.events_written += 1;
                checkpoint.processed_total += 1;
            }

            checkpoint.cursor = page.following_cursor();
            if checkpoint.cursor.is_none() {
                checkpoint.exhausted = true;
            }
            store.sync_events().await?;
            commit_page(&store, &mut checkpoint, &mut status, started).await?;
            info!(
                page = checkpoint.pages,
                records = take,
                objects_written = checkpoint.objects_written,
                events_written = checkpoint.events_written,
                "page committed"
            );
        }

        let stats = checkpoint.stats();
        let elapsed_seconds = round_seconds(started.elapsed());
        let generated_at = Utc::now();
        let manifest = Manifest {
            operation_id: store.operation_id().to_string(),
            source: info.source,
            base_url: info.base_url,
            version: info.version,
            params: ManifestParams {
                total_requested: quota,
                stages: checkpoint.fixed_stages,
                updated_from: checkpoint.fixed_updated_from.clone(),
                updated_to: checkpoint.fixed_updated_to.clone(),
            },
            stats,
            generated_at,
            elapsed_seconds,
            layout: ManifestLayout {
                objects_dir: store.objects_dir().display().to_string(),
                events_dir: store.events_dir().display().to_string(),
                checkpoint: store.checkpoint_path().display().to_string(),
            },
            warnings: checkpoint.warnings.clone(),
        };
        store.finalize_manifest(&manifest).await?;

        let result = CloneResult {
            status: "success".to_string(),
            operation_id: store.operation_id().to_string(),
            path: store.root().display().to_string(),
            stats,
            elapsed_seconds,
            generated_at,
            resume_supported: true,
            warnings: checkpoint.warnings.clone(),
        };
        let mut completed = StatusSnapshot::completed(result.clone());
        completed.started_at = status.started_at;
        completed.resumed_at = status.resumed_at;
        completed.total_requested = status.total_requested;
        completed.filters = Some(checkpoint.frozen_filters());
        completed.cursor = checkpoint.cursor.clone();
        store.save_status(&completed).await?;

        info!(
            pages = stats.pages,
            received_raw = stats.received_raw,
            objects_written = stats.objects_written,
            elapsed_seconds,
            "clone completed"
        );
        Ok(result)
    }
}

/// Checkpoint first, then the running status.
async fn commit_page(
    store: &CloneStore,
    checkpoint: &mut Checkpoint,
    status: &mut StatusSnapshot,
    started: Instant,
) -> anyhow::Result<()> {
    checkpoint.updated_at = Utc::now();
    store.save_checkpoint(checkpoint).await?;

    status.stats = Some(checkpoint.stats());
    status.cursor = checkpoint.cursor.clone();
    status.filters = Some(checkpoint.frozen_filters());
    status.warnings = checkpoint.warnings.clone();
    status.elapsed_seconds = Some(round_seconds(started.elapsed()));
    status.updated_at = checkpoint.updated_at;
    store.save_status(status).await
}

async fn completed_result(store: &CloneStore) -> Option<CloneResult> {
    if let Some(status) = store.read_status().await {
        if status.status == CloneStatus::Completed {
            if let Some(result) = status.result {
                return Some(result);
            }
        }
    }
    let manifest = store.read_manifest().await?;
    Some(CloneResult {
        status: "success".to_string(),
        operation_id: manifest.operation_id,
        path: store.root().display().to_string(),
        stats: manifest.stats,
        elapsed_seconds: manifest.elapsed_seconds,
        generated_at: manifest.generated_at,
        resume_supported: true,
        warnings: manifest.warnings,
    })
}

async fn persist_failure(store: &CloneStore, cause: &str) {
    let status = match store.read_status().await {
        Some(mut status) => {
            status.status = CloneStatus::Failed;
            status.error = Some(cause.to_string());
            status.result = None;
            status.updated_at = Utc::now();
            status
        }
        None => StatusSnapshot::failed(store.operation_id(), cause),
    };
    if let Err(err) = store.save_status(&status).await {
        error!(
            operation_id = store.operation_id(),
            error = %format!("{err:#}"),
            "could not persist failed status"
        );
    }
}

/// Only explicitly requested filters count as a conflict.
fn filters_conflict(frozen: &CloneFilters, requested: &CloneFilters) -> bool {
    (requested.stages.is_some() && requested.stages != frozen.stages)
        || (requested.updated_from.is_some() && requested.updated_from != frozen.updated_from)
        || (requested.updated_to.is_some() && requested.updated_to != frozen.updated_to)
}

fn round_seconds(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}

/// Runs prepared clones on the tokio runtime under a supervising task, detached from
/// whoever triggered them.
pub struct BackgroundRunner;

impl BackgroundRunner {
    /// The supervisor turns run errors and panics into a failed outcome and settles the
    /// registry exactly once. Awaiting the handle is optional.
    pub(crate) fn spawn(
        orchestrator: Arc<CloneOrchestrator>,
        plan: PreparedRun,
    ) -> JoinHandle<Result<CloneResult, CloneError>> {
        let operation_id = plan.operation_id().to_string();
        let store = Arc::clone(&plan.store);
        let registry = Arc::clone(orchestrator.registry());
        let worker = tokio::spawn(async move { orchestrator.run(plan).await });
        let span = info_span!("clone_supervisor", operation_id = %operation_id);

        tokio::spawn(
            async move {
                let outcome = match worker.await {
                    Ok(outcome) => outcome,
                    Err(join_err) => {
                        let cause = if join_err.is_panic() {
                            format!("clone task panicked: {}", panic_message(join_err.into_panic()))
                        } else {
                            "clone task was cancelled".to_string()
                        };
                        error!(%cause, "clone aborted");
                        persist_failure(&store, &cause).await;
                        Err(CloneError::Failed {
                            operation_id: operation_id.clone(),
                            kind: FailureKind::Aborted,
                            cause,
                        })
                    }
                };
                let settled = outcome.as_ref().map(CloneResult::clone).map_err(CloneError::cause);
                if !registry.settle(&operation_id, settled).await {
                    warn!("clone was already settled");
                }
                outcome
            }
            .instrument(span),
        )
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ftclone_adapters::{FixturePageSource, SourceInfo, UpstreamPage};
    use ftclone_core::Stage;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    const BOUNDED_URI: &str = "https://www.find-tender.service.gov.uk/api/1.0/ocdsReleasePackages?limit=100&updatedTo=2026-02-24T12%3A00%3A00";
    const FROZEN_BOUND: &str = "2026-02-24T12:00:00";

    fn release(ocid: &str, seq: u64) -> Value {
        json!({
            "ocid": ocid,
            "id": format!("{ocid}-{seq}"),
            "date": "2026-02-01T09:30:00Z",
            "tag": ["tender"],
            "tender": {"title": format!("Lot {seq}"), "value": {"amount": seq * 1000, "currency": "GBP"}}
        })
    }

    fn page(records: Vec<Value>, next: Option<&str>, uri: Option<&str>) -> Value {
        let mut page = json!({"releases": records, "publishedDate": "2026-02-24T12:00:00Z"});
        if let Some(next) = next {
            page["nextCursor"] = json!(next);
        }
        if let Some(uri) = uri {
            page["uri"] = json!(uri);
        }
        page
    }

    fn three_pages() -> Vec<Value> {
        vec![
            page(
                vec![release("ocds-a-01", 1), release("ocds-a-02", 2)],
                Some("c2"),
                Some(BOUNDED_URI),
            ),
            page(vec![release("ocds-a-03", 3), release("ocds-a-04", 4)], Some("c3"), None),
            page(vec![release("ocds-a-05", 5), release("ocds-a-06", 6)], None, None),
        ]
    }

    fn fixture(pages: Vec<Value>) -> Arc<FixturePageSource> {
        Arc::new(FixturePageSource::from_pages(pages).expect("fixture pages"))
    }

    fn test_config(data_dir: &Path) -> CloneConfig {
        CloneConfig {
            data_dir: data_dir.to_path_buf(),
            ..CloneConfig::default()
        }
    }

    fn orchestrator(data_dir: &Path, source: Arc<dyn PageSource>) -> Arc<CloneOrchestrator> {
        Arc::new(CloneOrchestrator::new(test_config(data_dir), source))
    }

    fn resume(operation_id: &str) -> CloneRequest {
        CloneRequest {
            operation_id: Some(operation_id.to_string()),
            ..CloneRequest::default()
        }
    }

    fn finished(outcome: TriggerOutcome) -> CloneResult {
        match outcome {
            TriggerOutcome::Finished(result) => result,
            other => panic!("expected a finished clone, got {other:?}"),
        }
    }

    fn failed(outcome: Result<TriggerOutcome, CloneError>) -> (String, FailureKind, String) {
        match outcome {
            Err(CloneError::Failed {
                operation_id,
                kind,
                cause,
            }) => (operation_id, kind, cause),
            other => panic!("expected a failed clone, got {other:?}"),
        }
    }

    async fn open_store(data_dir: &Path, operation_id: &str) -> CloneStore {
        CloneStore::open_existing(data_dir, operation_id)
            .await
            .expect("open store")
            .expect("store exists")
    }

    async fn event_ocids(store: &CloneStore) -> Vec<String> {
        store
            .read_events()
            .await
            .expect("events")
            .into_iter()
            .filter_map(|event| event.ocid)
            .collect()
    }

    async fn wait_for_settled(registry: &OperationRegistry, operation_id: &str) -> OperationRecord {
        for _ in 0..500 {
            if let Some(record) = registry.get(operation_id).await {
                if record.status.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("operation {operation_id} never settled");
    }

    /// Fails the run on first use.
    struct PanickingSource;

    #[async_trait]
    impl PageSource for PanickingSource {
        fn info(&self) -> SourceInfo {
            SourceInfo {
                source: "panicking".into(),
                base_url: "memory".into(),
                version: "test".into(),
            }
        }

        async fn fetch_page(&self, _request: &PageRequest) -> Result<UpstreamPage, AdapterError> {
            panic!("page source exploded");
        }
    }

    struct StalledSource;

    #[async_trait]
    impl PageSource for StalledSource {
        fn info(&self) -> SourceInfo {
            SourceInfo {
                source: "stalled".into(),
                base_url: "memory".into(),
                version: "test".into(),
            }
        }

        async fn fetch_page(&self, _request: &PageRequest) -> Result<UpstreamPage, AdapterError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(AdapterError::MalformedPage("unreachable".into()))
        }
    }

    /// Holds the first fetch until released, then serves the wrapped fixture.
    struct GatedSource {
        gate: Arc<tokio::sync::Notify>,
        inner: Arc<FixturePageSource>,
        opened: std::sync::atomic::AtomicBool,
    }

    impl GatedSource {
        fn new(inner: Arc<FixturePageSource>) -> Self {
            Self {
                gate: Arc::new(tokio::sync::Notify::new()),
                inner,
                opened: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PageSource for GatedSource {
        fn info(&self) -> SourceInfo {
            self.inner.info()
        }

        async fn fetch_page(&self, request: &PageRequest) -> Result<UpstreamPage, AdapterError> {
            if !self.opened.swap(true, std::sync::atomic::Ordering::SeqCst) {
                self.gate.notified().await;
            }
            self.inner.fetch_page(request).await
        }
    }

    async fn abandon_trigger(orchestrator: &Arc<CloneOrchestrator>, request: CloneRequest) {
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), orchestrator.trigger(request)).await;
        assert!(abandoned.is_err(), "trigger should still be waiting on the gate");
    }

    #[tokio::test]
    async fn dropped_trigger_still_finishes_and_settles() {
        let dir = tempdir().expect("tempdir");
        CloneStore::create(dir.path(), "op-gated").await.expect("create");
        let source = Arc::new(GatedSource::new(fixture(three_pages())));
        let gate = Arc::clone(&source.gate);
        let orchestrator = orchestrator(dir.path(), source);

        abandon_trigger(&orchestrator, resume("op-gated")).await;
        gate.notify_one();

        let record = wait_for_settled(orchestrator.registry(), "op-gated").await;
        assert_eq!(record.status, CloneStatus::Completed);
        assert_eq!(orchestrator.registry().running_count().await, 0);
        assert_eq!(
            orchestrator.poll("op-gated").await.expect("status").status,
            CloneStatus::Completed
        );

        let again = orchestrator.trigger(resume("op-gated")).await.expect("trigger");
        assert!(matches!(again, TriggerOutcome::AlreadyCompleted(_)));
        let queued = orchestrator
            .trigger(CloneRequest {
                background: true,
                ..CloneRequest::default()
            })
            .await
            .expect("ceiling is free again");
        assert!(matches!(queued, TriggerOutcome::Queued(_)));
    }

    #[tokio::test]
    async fn dropped_trigger_that_fails_leaves_the_id_resumable() {
        let dir = tempdir().expect("tempdir");
        CloneStore::create(dir.path(), "op-gated").await.expect("create");
        let inner = fixture(three_pages());
        inner.fail_once_at_call(0);
        let source = Arc::new(GatedSource::new(inner));
        let gate = Arc::clone(&source.gate);
        let orchestrator = orchestrator(dir.path(), source);

        abandon_trigger(&orchestrator, resume("op-gated")).await;
        gate.notify_one();

        let record = wait_for_settled(orchestrator.registry(), "op-gated").await;
        assert_eq!(record.status, CloneStatus::Failed);
        assert_eq!(orchestrator.registry().running_count().await, 0);
        assert_eq!(
            orchestrator.poll("op-gated").await.expect("status").status,
            CloneStatus::Failed
        );

        let resumed = finished(orchestrator.trigger(resume("op-gated")).await.expect("resume"));
        assert_eq!(resumed.stats.pages, 3);
    }

    #[tokio::test]
    async fn resume_without_a_checkpoint_keeps_the_original_filters() {
        let dir = tempdir().expect("tempdir");
        let source = fixture(three_pages());
        source.fail_once_at_call(0);
        let orchestrator = orchestrator(dir.path(), source.clone());
        let filters = CloneFilters {
            stages: Some(Stage::Award),
            updated_from: Some("2026-01-01".into()),
            updated_to: Some("2026-01-31T23:59:59".into()),
        };
        let request = CloneRequest {
            filters: filters.clone(),
            ..CloneRequest::default()
        };

        let (operation_id, _, _) = failed(orchestrator.trigger(request).await);
        let store = open_store(dir.path(), &operation_id).await;
        assert!(store.load_checkpoint().await.is_none());

        let result = finished(orchestrator.trigger(resume(&operation_id)).await.expect("resume"));
        assert_eq!(result.stats.pages, 3);
        assert!(source.requests().iter().all(|r| r.filters == filters));
        let manifest = store.read_manifest().await.expect("manifest");
        assert_eq!(manifest.params.stages, Some(Stage::Award));
        assert_eq!(manifest.params.updated_from.as_deref(), Some("2026-01-01"));
    }

    #[tokio::test]
    async fn identical_fresh_requests_get_distinct_ids() {
        let dir = tempdir().expect("tempdir");
        let registry = OperationRegistry::new(dir.path(), DEFAULT_MAX_BACKGROUND);
        let record = |id: &str| {
            OperationRecord::running(id, id, Quota::Unlimited, CloneFilters::default(), false)
        };

        let (first, second) = tokio::join!(
            registry.register_fresh("clone_20261017_001400_7870", false, record),
            registry.register_fresh("clone_20261017_001400_7870", false, record),
        );
        let mut ids = vec![first.expect("first"), second.expect("second")];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                "clone_20261017_001400_7870".to_string(),
                "clone_20261017_001400_7870_2".to_string()
            ]
        );

        std::fs::create_dir(dir.path().join("clone_20261017_001400_7870_3")).expect("mkdir");
        let third = registry
            .register_fresh("clone_20261017_001400_7870", false, record)
            .await
            .expect("third");
        assert_eq!(third, "clone_20261017_001400_7870_4");
        assert_eq!(registry.running_count().await, 3);
    }

    #[tokio::test]
    async fn unlimited_clone_walks_every_page() {
        let dir = tempdir().expect("tempdir");
        let first = (0..100u64)
            .map(|i| release(&format!("ocds-b-{i:04}"), i))
            .collect::<Vec<_>>();
        let source = fixture(vec![
            page(first, Some("c2"), Some(BOUNDED_URI)),
            page(vec![release("ocds-b-0100", 100)], None, None),
        ]);
        let orchestrator = orchestrator(dir.path(), source.clone());

        let result = finished(orchestrator.trigger(CloneRequest::default()).await.expect("clone"));
        assert_eq!(result.status, "success");
        assert_eq!(result.stats.pages, 2);
        assert_eq!(result.stats.received_raw, 101);
        assert_eq!(result.stats.processed_total, 101);
        assert_eq!(result.stats.events_written, 101);
        assert!(result.stats.objects_written <= 101);
        assert_eq!(source.request_count(), 2);
        assert!(result.resume_supported);

        let store = open_store(dir.path(), &result.operation_id).await;
        let manifest = store.read_manifest().await.expect("manifest");
        assert_eq!(manifest.stats, result.stats);
        assert_eq!(manifest.params.total_requested, Quota::Unlimited);
        assert_eq!(store.object_count().await.expect("count"), 101);

        let status = orchestrator.poll(&result.operation_id).await.expect("status");
        assert_eq!(status.status, CloneStatus::Completed);
        assert_eq!(status.result.as_ref(), Some(&result));
        let record = orchestrator.registry().get(&result.operation_id).await.expect("record");
        assert_eq!(record.status, CloneStatus::Completed);
    }

    #[tokio::test]
    async fn completed_operation_returns_stored_result_without_fetching() {
        let dir = tempdir().expect("tempdir");
        let source = fixture(three_pages());
        let orchestrator = orchestrator(dir.path(), source.clone());

        let first = finished(orchestrator.trigger(CloneRequest::default()).await.expect("clone"));
        let calls = source.request_count();

        let again = orchestrator
            .trigger(resume(&first.operation_id))
            .await
            .expect("second trigger");
        assert_eq!(again, TriggerOutcome::AlreadyCompleted(first.clone()));
        assert_eq!(source.request_count(), calls);

        let store = open_store(dir.path(), &first.operation_id).await;
        assert_eq!(store.read_events().await.expect("events").len(), 6);
    }

    #[tokio::test]
    async fn manifest_alone_marks_an_operation_complete() {
        let dir = tempdir().expect("tempdir");
        let source = fixture(three_pages());
        let orchestrator = orchestrator(dir.path(), source.clone());
        let first = finished(orchestrator.trigger(CloneRequest::default()).await.expect("clone"));

        // Status rewritten as if the process died between manifest and final status.
        let store = open_store(dir.path(), &first.operation_id).await;
        store
            .save_status(&StatusSnapshot::new(&first.operation_id, CloneStatus::Running))
            .await
            .expect("status");

        let again = orchestrator.trigger(resume(&first.operation_id)).await.expect("trigger");
        match again {
            TriggerOutcome::AlreadyCompleted(result) => assert_eq!(result.stats, first.stats),
            other => panic!("expected stored result, got {other:?}"),
        }
        assert_eq!(source.request_count(), 3);
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let dir = tempdir().expect("tempdir");
        let shared = release("ocds-c-01", 1);
        let reordered: Value = serde_json::from_str(
            r#"{"tender":{"value":{"currency":"GBP","amount":1000},"title":"Lot 1"},"tag":["tender"],"date":"2026-02-01T09:30:00Z","id":"ocds-c-01-1","ocid":"ocds-c-01"}"#,
        )
        .expect("json");
        let source = fixture(vec![
            page(vec![shared, release("ocds-c-02", 2)], Some("c2"), Some(BOUNDED_URI)),
            page(vec![reordered, release("ocds-c-03", 3)], None, None),
        ]);
        let orchestrator = orchestrator(dir.path(), source);

        let result = finished(orchestrator.trigger(CloneRequest::default()).await.expect("clone"));
        assert_eq!(result.stats.events_written, 4);
        assert_eq!(result.stats.objects_written, 3);

        let store = open_store(dir.path(), &result.operation_id).await;
        assert_eq!(store.object_count().await.expect("count"), 3);
        let events = store.read_events().await.expect("events");
        assert_eq!(events[0].content_hash, events[2].content_hash);
        assert_eq!(events[0].page, 1);
        assert_eq!(events[2].page, 2);
        assert_eq!(events[2].cursor.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn preexisting_object_is_not_counted_again() {
        let dir = tempdir().expect("tempdir");
        let known = release("ocds-d-01", 1);
        let (hash, bytes) = canonicalize(&known).expect("canonical");
        let prior = CloneStore::create(dir.path(), "prior-run").await.expect("create");
        assert!(prior.write_object_if_missing(&hash, &bytes).await.expect("write"));

        let source = fixture(vec![page(
            vec![known, release("ocds-d-02", 2)],
            None,
            Some(BOUNDED_URI),
        )]);
        let orchestrator = orchestrator(dir.path(), source);
        let result = finished(orchestrator.trigger(resume("prior-run")).await.expect("clone"));

        assert_eq!(result.stats.events_written, 2);
        assert_eq!(result.stats.objects_written, 1);
        assert_eq!(prior.object_count().await.expect("count"), 2);
        let events = prior.read_events().await.expect("events");
        assert_eq!(events[0].content_hash, hash);
    }

    #[tokio::test]
    async fn interrupted_clone_resumes_to_uninterrupted_counts() {
        let baseline_dir = tempdir().expect("tempdir");
        let baseline = finished(
            orchestrator(baseline_dir.path(), fixture(three_pages()))
                .trigger(CloneRequest::default())
                .await
                .expect("baseline"),
        );
        let baseline_store = open_store(baseline_dir.path(), &baseline.operation_id).await;

        let dir = tempdir().expect("tempdir");
        let source = fixture(three_pages());
        source.fail_once_at_call(2);
        let orchestrator = orchestrator(dir.path(), source.clone());
        let (operation_id, kind, cause) =
            failed(orchestrator.trigger(CloneRequest::default()).await);
        assert_eq!(kind, FailureKind::UpstreamUnavailable);
        assert!(cause.contains("injected fixture failure"));

        let status = orchestrator.poll(&operation_id).await.expect("status");
        assert_eq!(status.status, CloneStatus::Failed);
        assert!(status.error.as_deref().unwrap_or_default().contains("injected"));
        assert_eq!(status.stats.map(|s| s.pages), Some(2));
        let record = orchestrator.registry().get(&operation_id).await.expect("record");
        assert_eq!(record.status, CloneStatus::Failed);

        let store = open_store(dir.path(), &operation_id).await;
        let checkpoint = store.load_checkpoint().await.expect("checkpoint");
        assert_eq!(checkpoint.pages, 2);
        assert_eq!(checkpoint.cursor.as_deref(), Some("c3"));

        let resumed = finished(orchestrator.trigger(resume(&operation_id)).await.expect("resume"));
        assert_eq!(resumed.stats, baseline.stats);
        assert_eq!(
            store.object_count().await.expect("count"),
            baseline_store.object_count().await.expect("count")
        );
        assert_eq!(event_ocids(&store).await, event_ocids(&baseline_store).await);
        assert_eq!(source.requests()[3].cursor.as_deref(), Some("c3"));

        let status = orchestrator.poll(&operation_id).await.expect("status");
        assert_eq!(status.status, CloneStatus::Completed);
        assert!(status.resumed_at.is_some());
    }

    #[tokio::test]
    async fn replaying_a_page_after_a_lost_checkpoint_keeps_objects_unique() {
        let dir = tempdir().expect("tempdir");
        let source = fixture(three_pages());
        let orchestrator = orchestrator(dir.path(), source.clone());

        source.fail_once_at_call(1);
        let (operation_id, _, _) = failed(orchestrator.trigger(CloneRequest::default()).await);
        let store = open_store(dir.path(), &operation_id).await;
        let after_first_page = store.load_checkpoint().await.expect("checkpoint");

        source.fail_once_at_call(3);
        orchestrator.trigger(resume(&operation_id)).await.expect_err("second failure");
        store
            .save_checkpoint(&after_first_page)
            .await
            .expect("roll back checkpoint");

        finished(orchestrator.trigger(resume(&operation_id)).await.expect("resume"));
        assert_eq!(store.object_count().await.expect("count"), 6);
        assert_eq!(store.read_events().await.expect("events").len(), 8);
    }

    #[tokio::test]
    async fn implied_upper_bound_is_frozen_for_every_later_request() {
        let dir = tempdir().expect("tempdir");
        let later_uri = "https://www.find-tender.service.gov.uk/api/1.0/ocdsReleasePackages?updatedTo=2026-03-01T00%3A00%3A00";
        let source = fixture(vec![
            page(vec![release("ocds-e-01", 1)], Some("c2"), Some(BOUNDED_URI)),
            page(vec![release("ocds-e-02", 2)], Some("c3"), Some(later_uri)),
            page(vec![release("ocds-e-03", 3)], None, None),
        ]);
        source.fail_once_at_call(2);
        let orchestrator = orchestrator(dir.path(), source.clone());
        let request = CloneRequest {
            filters: CloneFilters {
                stages: Some(Stage::Tender),
                ..CloneFilters::default()
            },
            ..CloneRequest::default()
        };

        let (operation_id, _, _) = failed(orchestrator.trigger(request).await);

        let mut conflicting = resume(&operation_id);
        conflicting.filters.updated_to = Some("2030-01-01T00:00:00".into());
        conflicting.filters.stages = Some(Stage::Award);
        let result = finished(orchestrator.trigger(conflicting).await.expect("resume"));
        assert_eq!(result.stats.pages, 3);

        let requests = source.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0].filters.updated_to, None);
        for request in &requests[1..] {
            assert_eq!(request.filters.updated_to.as_deref(), Some(FROZEN_BOUND));
        }
        assert!(requests.iter().all(|r| r.filters.stages == Some(Stage::Tender)));

        let store = open_store(dir.path(), &operation_id).await;
        let manifest = store.read_manifest().await.expect("manifest");
        assert_eq!(manifest.params.updated_to.as_deref(), Some(FROZEN_BOUND));
        assert_eq!(manifest.params.stages, Some(Stage::Tender));
        assert!(manifest.warnings.is_empty());
    }

    #[tokio::test]
    async fn caller_supplied_bounds_are_sent_unchanged() {
        let dir = tempdir().expect("tempdir");
        let source = fixture(three_pages());
        let orchestrator = orchestrator(dir.path(), source.clone());
        let filters = CloneFilters {
            stages: Some(Stage::Award),
            updated_from: Some("2026-01-01".into()),
            updated_to: Some("2026-01-31T23:59:59".into()),
        };
        let request = CloneRequest {
            filters: filters.clone(),
            ..CloneRequest::default()
        };

        finished(orchestrator.trigger(request).await.expect("clone"));
        assert!(source.requests().iter().all(|r| r.filters == filters));
    }

    #[tokio::test]
    async fn missing_upper_bound_is_reported_as_a_warning() {
        let dir = tempdir().expect("tempdir");
        let source = fixture(vec![
            page(vec![release("ocds-f-01", 1)], Some("c2"), None),
            page(vec![release("ocds-f-02", 2)], None, None),
        ]);
        let orchestrator = orchestrator(dir.path(), source.clone());

        let result = finished(orchestrator.trigger(CloneRequest::default()).await.expect("clone"));
        assert_eq!(result.warnings, vec![UNBOUNDED_SNAPSHOT_WARNING.to_string()]);
        assert!(source.requests().iter().all(|r| r.filters.updated_to.is_none()));

        let store = open_store(dir.path(), &result.operation_id).await;
        assert_eq!(store.read_manifest().await.expect("manifest").warnings, result.warnings);
        assert_eq!(
            store.load_checkpoint().await.expect("checkpoint").warnings,
            result.warnings
        );
        assert_eq!(store.read_status().await.expect("status").warnings, result.warnings);
    }

    #[tokio::test]
    async fn event_log_only_grows_by_appending() {
        let dir = tempdir().expect("tempdir");
        let source = fixture(three_pages());
        let orchestrator = orchestrator(dir.path(), source.clone());

        source.fail_once_at_call(1);
        let (operation_id, _, _) = failed(orchestrator.trigger(CloneRequest::default()).await);
        let store = open_store(dir.path(), &operation_id).await;
        let after_one = store.read_events().await.expect("events");

        source.fail_once_at_call(3);
        orchestrator.trigger(resume(&operation_id)).await.expect_err("failure");
        let after_two = store.read_events().await.expect("events");

        finished(orchestrator.trigger(resume(&operation_id)).await.expect("resume"));
        let after_three = store.read_events().await.expect("events");

        assert_eq!(after_one.len(), 2);
        assert_eq!(after_two.len(), 4);
        assert_eq!(after_three.len(), 6);
        assert!(after_two.starts_with(&after_one));
        assert!(after_three.starts_with(&after_two));
    }

    #[tokio::test]
    async fn total_caps_processed_records_and_stops_paging() {
        let dir = tempdir().expect("tempdir");
        let records = (0..5u64)
            .map(|i| release(&format!("ocds-g-{i:02}"), i))
            .collect::<Vec<_>>();
        let source = fixture(vec![
            page(records, Some("c2"), Some(BOUNDED_URI)),
            page(vec![release("ocds-g-99", 99)], None, None),
        ]);
        let orchestrator = orchestrator(dir.path(), source.clone());
        let request = CloneRequest {
            total: 3,
            ..CloneRequest::default()
        };

        let result = finished(orchestrator.trigger(request).await.expect("clone"));
        assert_eq!(result.stats.received_raw, 5);
        assert_eq!(result.stats.processed_total, 3);
        assert_eq!(result.stats.events_written, 3);
        assert_eq!(result.stats.objects_written, 3);
        assert_eq!(source.request_count(), 1);

        let store = open_store(dir.path(), &result.operation_id).await;
        let manifest = store.read_manifest().await.expect("manifest");
        assert_eq!(manifest.params.total_requested, Quota::Limited(3));
    }

    #[tokio::test]
    async fn background_requests_beyond_the_ceiling_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let source = fixture(three_pages());
        let orchestrator = orchestrator(dir.path(), source.clone());
        for id in ["busy-1", "busy-2"] {
            orchestrator
                .registry()
                .try_register(OperationRecord::running(
                    id,
                    format!("/tmp/{id}"),
                    Quota::Unlimited,
                    CloneFilters::default(),
                    true,
                ))
                .await
                .expect("register");
        }

        let err = orchestrator
            .trigger(CloneRequest {
                background: true,
                ..CloneRequest::default()
            })
            .await
            .expect_err("ceiling");
        assert!(matches!(err, CloneError::ConcurrencyLimit { running: 2, max: 2 }));
        assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 0);
        assert_eq!(source.request_count(), 0);
        assert_eq!(orchestrator.registry().running_count().await, 2);

        // The ceiling only gates background requests.
        finished(orchestrator.trigger(CloneRequest::default()).await.expect("sync clone"));
    }

    #[tokio::test]
    async fn resuming_an_unknown_operation_creates_nothing() {
        let dir = tempdir().expect("tempdir");
        let source = fixture(three_pages());
        let orchestrator = orchestrator(dir.path(), source.clone());

        let err = orchestrator
            .trigger(resume("does-not-exist"))
            .await
            .expect_err("not found");
        assert!(matches!(err, CloneError::NotFound(ref id) if id == "does-not-exist"));
        assert!(!dir.path().join("does-not-exist").exists());
        assert_eq!(source.request_count(), 0);
        assert!(matches!(
            orchestrator.poll("does-not-exist").await,
            Err(CloneError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_requests_are_refused_before_any_work() {
        let dir = tempdir().expect("tempdir");
        let orchestrator = orchestrator(dir.path(), fixture(three_pages()));

        let negative = CloneRequest {
            total: -5,
            ..CloneRequest::default()
        };
        assert!(matches!(
            orchestrator.trigger(negative).await,
            Err(CloneError::InvalidRequest(_))
        ));
        assert!(matches!(
            orchestrator.trigger(resume("../escape")).await,
            Err(CloneError::InvalidRequest(_))
        ));
        let bad_date = CloneRequest {
            filters: CloneFilters {
                updated_from: Some("yesterday".into()),
                ..CloneFilters::default()
            },
            ..CloneRequest::default()
        };
        assert!(matches!(
            orchestrator.trigger(bad_date).await,
            Err(CloneError::InvalidRequest(_))
        ));
        assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 0);
    }

    #[tokio::test]
    async fn second_run_of_a_running_operation_is_rejected() {
        let dir = tempdir().expect("tempdir");
        CloneStore::create(dir.path(), "op-busy").await.expect("create");
        let source = fixture(three_pages());
        let orchestrator = orchestrator(dir.path(), source.clone());
        orchestrator
            .registry()
            .try_register(OperationRecord::running(
                "op-busy",
                "op-busy",
                Quota::Unlimited,
                CloneFilters::default(),
                false,
            ))
            .await
            .expect("register");

        let err = orchestrator.trigger(resume("op-busy")).await.expect_err("busy");
        assert!(matches!(err, CloneError::AlreadyRunning(ref id) if id == "op-busy"));
        assert_eq!(source.request_count(), 0);
    }

    #[tokio::test]
    async fn force_reruns_a_completed_operation() {
        let dir = tempdir().expect("tempdir");
        let source = fixture(three_pages());
        let orchestrator = orchestrator(dir.path(), source.clone());
        let first = finished(orchestrator.trigger(CloneRequest::default()).await.expect("clone"));

        let forced = CloneRequest {
            force: true,
            ..resume(&first.operation_id)
        };
        let second = finished(orchestrator.trigger(forced).await.expect("forced"));
        assert_eq!(source.request_count(), 6);
        assert_eq!(second.stats.pages, 3);
        assert_eq!(second.stats.events_written, 6);
        assert_eq!(second.stats.objects_written, 0);

        let store = open_store(dir.path(), &first.operation_id).await;
        assert_eq!(store.object_count().await.expect("count"), 6);
        assert_eq!(store.read_events().await.expect("events").len(), 12);
        assert_eq!(
            store.read_manifest().await.expect("manifest").generated_at,
            second.generated_at
        );
    }

    #[tokio::test]
    async fn background_clone_settles_the_registry() {
        let dir = tempdir().expect("tempdir");
        let orchestrator = orchestrator(dir.path(), fixture(three_pages()));

        let outcome = orchestrator
            .trigger(CloneRequest {
                background: true,
                ..CloneRequest::default()
            })
            .await
            .expect("queued");
        let queued = match outcome {
            TriggerOutcome::Queued(queued) => queued,
            other => panic!("expected a queued clone, got {other:?}"),
        };
        assert_eq!(queued.status, "background_queued");
        assert!(queued.path.ends_with(&queued.operation_id));

        let record = wait_for_settled(orchestrator.registry(), &queued.operation_id).await;
        assert_eq!(record.status, CloneStatus::Completed);
        assert_eq!(record.result.map(|r| r.stats.events_written), Some(6));
        let status = orchestrator.poll(&queued.operation_id).await.expect("status");
        assert_eq!(status.status, CloneStatus::Completed);
    }

    #[tokio::test]
    async fn background_failure_is_persisted_and_settled() {
        let dir = tempdir().expect("tempdir");
        let source = fixture(three_pages());
        source.fail_once_at_call(0);
        let orchestrator = orchestrator(dir.path(), source);

        let outcome = orchestrator
            .trigger(CloneRequest {
                background: true,
                ..CloneRequest::default()
            })
            .await
            .expect("queued");
        let record = wait_for_settled(orchestrator.registry(), outcome.operation_id()).await;
        assert_eq!(record.status, CloneStatus::Failed);
        assert!(record.error.as_deref().unwrap_or_default().contains("injected"));

        let status = orchestrator.poll(outcome.operation_id()).await.expect("status");
        assert_eq!(status.status, CloneStatus::Failed);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn panicking_background_clone_is_recorded_as_failed() {
        let dir = tempdir().expect("tempdir");
        let orchestrator = orchestrator(dir.path(), Arc::new(PanickingSource));

        let outcome = orchestrator
            .trigger(CloneRequest {
                background: true,
                ..CloneRequest::default()
            })
            .await
            .expect("queued");
        let record = wait_for_settled(orchestrator.registry(), outcome.operation_id()).await;
        assert_eq!(record.status, CloneStatus::Failed);
        let error = record.error.expect("error");
        assert!(error.contains("panicked"));
        assert!(error.contains("page source exploded"));

        let status = orchestrator.poll(outcome.operation_id()).await.expect("status");
        assert_eq!(status.status, CloneStatus::Failed);
        assert_eq!(status.error.as_deref(), Some(error.as_str()));
    }

    #[tokio::test]
    async fn panicking_foreground_clone_fails_as_aborted() {
        let dir = tempdir().expect("tempdir");
        let orchestrator = orchestrator(dir.path(), Arc::new(PanickingSource));

        let (operation_id, kind, cause) =
            failed(orchestrator.trigger(CloneRequest::default()).await);
        assert_eq!(kind, FailureKind::Aborted);
        assert!(cause.contains("page source exploded"));
        assert_eq!(orchestrator.registry().running_count().await, 0);
        let status = orchestrator.poll(&operation_id).await.expect("status");
        assert_eq!(status.status, CloneStatus::Failed);
    }

    #[tokio::test]
    async fn overall_deadline_fails_the_clone_as_timeout() {
        let dir = tempdir().expect("tempdir");
        let config = CloneConfig {
            run_deadline: Some(Duration::from_millis(50)),
            ..test_config(dir.path())
        };
        let orchestrator = Arc::new(CloneOrchestrator::new(config, Arc::new(StalledSource)));

        let (operation_id, kind, _) = failed(orchestrator.trigger(CloneRequest::default()).await);
        assert_eq!(kind, FailureKind::Timeout);
        let status = orchestrator.poll(&operation_id).await.expect("status");
        assert_eq!(status.status, CloneStatus::Failed);
    }

    #[tokio::test]
    async fn recover_marks_only_orphaned_running_operations() {
        let dir = tempdir().expect("tempdir");
        let registry = OperationRegistry::new(dir.path(), DEFAULT_MAX_BACKGROUND);

        for id in ["stale-op", "live-op", "done-op"] {
            let store = CloneStore::create(dir.path(), id).await.expect("create");
            let status = if id == "done-op" {
                CloneStatus::Completed
            } else {
                CloneStatus::Running
            };
            store
                .save_status(&StatusSnapshot::new(id, status))
                .await
                .expect("status");
        }
        registry
            .try_register(OperationRecord::running(
                "live-op",
                "live-op",
                Quota::Unlimited,
                CloneFilters::default(),
                false,
            ))
            .await
            .expect("register");

        let recovered = registry.recover().await.expect("recover");
        assert_eq!(recovered, vec!["stale-op".to_string()]);

        let stale = registry.poll("stale-op").await.expect("status");
        assert_eq!(stale.status, CloneStatus::Failed);
        assert_eq!(stale.error.as_deref(), Some(INTERRUPTED_CAUSE));
        assert_eq!(
            registry.poll("live-op").await.expect("status").status,
            CloneStatus::Running
        );
        assert_eq!(
            registry.poll("done-op").await.expect("status").status,
            CloneStatus::Completed
        );
    }

    #[tokio::test]
    async fn poll_falls_back_to_the_in_memory_record() {
        let dir = tempdir().expect("tempdir");
        let registry = OperationRegistry::new(dir.path(), DEFAULT_MAX_BACKGROUND);
        registry
            .try_register(OperationRecord::running(
                "early-op",
                "early-op",
                Quota::Limited(10),
                CloneFilters::default(),
                true,
            ))
            .await
            .expect("register");

        let snapshot = registry.poll("early-op").await.expect("status");
        assert_eq!(snapshot.status, CloneStatus::Running);
        assert_eq!(snapshot.total_requested, Some(Quota::Limited(10)));

        assert!(registry.settle("early-op", Err("boom".into())).await);
        assert!(!registry.settle("early-op", Ok(CloneResult {
            status: "success".into(),
            operation_id: "early-op".into(),
            path: "early-op".into(),
            stats: Default::default(),
            elapsed_seconds: 0.0,
            generated_at: Utc::now(),
            resume_supported: true,
            warnings: Vec::new(),
        })).await);
        let record = registry.get("early-op").await.expect("record");
        assert_eq!(record.status, CloneStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn failure_without_prior_status_still_persists() {
        let dir = tempdir().expect("tempdir");
        let store = CloneStore::create(dir.path(), "op-bare").await.expect("create");

        persist_failure(&store, "disk vanished").await;
        let status = store.read_status().await.expect("status");
        assert_eq!(status.status, CloneStatus::Failed);
        assert_eq!(status.error.as_deref(), Some("disk vanished"));
        assert_eq!(status.operation_id, "op-bare");
    }

    #[test]
    fn failures_are_classified_by_cause() {
        let rejected = RunFailure::Upstream(AdapterError::Fetch(FetchError::Rejected {
            status: 400,
            url: "https://example.test".into(),
            body: "bad cursor".into(),
        }));
        assert_eq!(rejected.kind(), FailureKind::UpstreamRejected);

        let exhausted = RunFailure::Upstream(AdapterError::Fetch(FetchError::RetriesExhausted {
            attempts: 6,
            last_error: "http 503".into(),
        }));
        assert_eq!(exhausted.kind(), FailureKind::UpstreamUnavailable);
        assert_eq!(exhausted.cause(), "upstream unavailable after 6 attempts: http 503");

        let storage = RunFailure::Storage(
            anyhow::anyhow!("disk full").context("writing checkpoint.json"),
        );
        assert_eq!(storage.kind(), FailureKind::Storage);
        assert_eq!(storage.cause(), "writing checkpoint.json: disk full");

        let deadline = RunFailure::Deadline(Duration::from_secs(5));
        assert_eq!(deadline.kind(), FailureKind::Timeout);
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = CloneConfig::default();
        assert_eq!(config.base_url, "https://www.find-tender.service.gov.uk");
        assert_eq!(config.api_version, "1.0");
        assert_eq!(config.page_limit, 100);
        assert_eq!(config.max_background, 2);
        assert_eq!(config.segment_max_bytes, 100 * 1024 * 1024);
        assert!(config.run_deadline.is_none());
        assert_eq!(
            config.http_client_config().timeout,
            Duration::from_secs(60)
        );
    }
}
