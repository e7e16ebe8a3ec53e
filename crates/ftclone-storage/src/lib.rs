//! Content-addressed clone storage + upstream HTTP fetch utilities for ftclone.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ftclone_core::{Checkpoint, CloneEvent, Manifest, StatusSnapshot};
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ftclone-storage";

pub const STATUS_FILE: &str = "status.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const OBJECTS_DIR: &str = "objects";
pub const OBJECT_HASH_DIR: &str = "sha256";
pub const EVENTS_DIR: &str = "events";
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 100 * 1024 * 1024;
const TAIL_SCAN_CHUNK: u64 = 64 * 1024;

/// Serialize with object keys sorted by code point and no insignificant whitespace.
pub fn canonical_json_bytes(value: &JsonValue) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &JsonValue, out: &mut Vec<u8>) -> serde_json::Result<()> {
    match value {
        JsonValue::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(item, out)?;
            }
            out.push(b'}');
        }
        JsonValue::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical bytes of `value` together with their content hash.
pub fn canonicalize(value: &JsonValue) -> serde_json::Result<(String, Vec<u8>)> {
    let bytes = canonical_json_bytes(value)?;
    Ok((sha256_hex(&bytes), bytes))
}

fn is_content_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn segment_file_name(index: u32) -> String {
    format!("part-{index:06}.ndjson")
}

fn parse_segment_index(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix("part-")?
        .strip_suffix(".ndjson")?
        .parse()
        .ok()
}

#[derive(Debug, Clone, Copy)]
struct EventSegment {
    index: u32,
    bytes: u64,
}

/// All durable state of one clone operation, rooted at `<data_root>/<operation_id>/`.
///
/// Every mutating file operation takes `write_lock`, so concurrent callers on the same
/// store never interleave partial output. The lock is per store, not per process.
#[derive(Debug)]
pub struct CloneStore {
    operation_id: String,
    root: PathBuf,
    objects_dir: PathBuf,
    events_dir: PathBuf,
    segment_max_bytes: u64,
    write_lock: Mutex<EventSegment>,
}

impl CloneStore {
    pub fn operation_root(data_root: impl AsRef<Path>, operation_id: &str) -> PathBuf {
        data_root.as_ref().join(operation_id)
    }

    /// Create (or reopen) the on-disk layout for `operation_id`.
    pub async fn create(data_root: impl AsRef<Path>, operation_id: &str) -> anyhow::Result<Self> {
        let root = Self::operation_root(data_root, operation_id);
        let objects_dir = root.join(OBJECTS_DIR).join(OBJECT_HASH_DIR);
        let events_dir = root.join(EVENTS_DIR);
        for dir in [&objects_dir, &events_dir] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating clone directory {}", dir.display()))?;
        }
        Self::open_at(operation_id, root).await
    }

    /// Open a store whose root already exists. `Ok(None)` when it does not; the root is
    /// never created here.
    pub async fn open_existing(
        data_root: impl AsRef<Path>,
        operation_id: &str,
    ) -> anyhow::Result<Option<Self>> {
        let root = Self::operation_root(data_root, operation_id);
        let exists = fs::try_exists(&root)
            .await
            .with_context(|| format!("checking clone directory {}", root.display()))?;
        if !exists {
            return Ok(None);
        }
        // A partially created layout is repaired here; the root itself already exists.
        for dir in [root.join(OBJECTS_DIR).join(OBJECT_HASH_DIR), root.join(EVENTS_DIR)] {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating clone directory {}", dir.display()))?;
        }
        Self::open_at(operation_id, root).await.map(Some)
    }

    async fn open_at(operation_id: &str, root: PathBuf) -> anyhow::Result<Self> {
        let objects_dir = root.join(OBJECTS_DIR).join(OBJECT_HASH_DIR);
        let events_dir = root.join(EVENTS_DIR);
        let segment = discover_current_segment(&events_dir).await?;
        Ok(Self {
            operation_id: operation_id.to_string(),
            root,
            objects_dir,
            events_dir,
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            write_lock: Mutex::new(segment),
        })
    }

    pub fn with_segment_max_bytes(mut self, segment_max_bytes: u64) -> Self {
        self.segment_max_bytes = segment_max_bytes.max(1);
        self
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    pub fn events_dir(&self) -> &Path {
        &self.events_dir
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn object_path(&self, content_hash: &str) -> PathBuf {
        self.objects_dir.join(format!("{content_hash}.json.gz"))
    }

    pub fn segment_path(&self, index: u32) -> PathBuf {
        self.events_dir.join(segment_file_name(index))
    }

    /// Best effort: a missing or unreadable checkpoint means "start from scratch".
    pub async fn load_checkpoint(&self) -> Option<Checkpoint> {
        read_json_best_effort(&self.checkpoint_path(), &self.operation_id, "checkpoint").await
    }

    pub async fn read_status(&self) -> Option<StatusSnapshot> {
        read_json_best_effort(&self.status_path(), &self.operation_id, "status").await
    }

    pub async fn read_manifest(&self) -> Option<Manifest> {
        read_json_best_effort(&self.manifest_path(), &self.operation_id, "manifest").await
    }

    /// Read `status.json` of an operation without opening (or creating) its store.
    pub async fn read_persisted_status(
        data_root: impl AsRef<Path>,
        operation_id: &str,
    ) -> Option<StatusSnapshot> {
        let path = Self::operation_root(data_root, operation_id).join(STATUS_FILE);
        read_json_best_effort(&path, operation_id, "status").await
    }

    /// Drop the terminal manifest so a forced re-run is not mistaken for a finished one.
    pub async fn remove_manifest(&self) -> anyhow::Result<()> {
        let path = self.manifest_path();
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }

    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.write_json_locked(&self.checkpoint_path(), checkpoint).await
    }

    pub async fn save_status(&self, status: &StatusSnapshot) -> anyhow::Result<()> {
        self.write_json_locked(&self.status_path(), status).await
    }

    pub async fn finalize_manifest(&self, manifest: &Manifest) -> anyhow::Result<()> {
        self.write_json_locked(&self.manifest_path(), manifest).await
    }

    async fn write_json_locked<T: Serialize>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {}", path.display()))?;
        let _guard = self.write_lock.lock().await;
        write_atomic(path, &bytes).await
    }

    /// Store canonical record bytes under their hash. Returns `true` iff this call wrote.
    pub async fn write_object_if_missing(
        &self,
        content_hash: &str,
        canonical_bytes: &[u8],
    ) -> anyhow::Result<bool> {
        if !is_content_hash(content_hash) {
            bail!("refusing to store object under malformed hash `{content_hash}`");
        }
        let path = self.object_path(content_hash);
        if path_exists(&path).await? {
            return Ok(false);
        }

        let compressed = gzip(canonical_bytes)
            .with_context(|| format!("compressing object {content_hash}"))?;

        let _guard = self.write_lock.lock().await;
        if path_exists(&path).await? {
            return Ok(false);
        }
        write_atomic(&path, &compressed).await?;
        Ok(true)
    }

    pub async fn read_object(&self, content_hash: &str) -> anyhow::Result<Option<JsonValue>> {
        if !is_content_hash(content_hash) {
            bail!("malformed object hash `{content_hash}`");
        }
        let path = self.object_path(content_hash);
        if !path_exists(&path).await? {
            return Ok(None);
        }
        let compressed = fs::read(&path)
            .await
            .with_context(|| format!("reading object {}", path.display()))?;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .with_context(|| format!("decompressing object {}", path.display()))?;
        let value = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing object {}", path.display()))?;
        Ok(Some(value))
    }

    pub async fn object_count(&self) -> anyhow::Result<usize> {
        let mut entries = fs::read_dir(&self.objects_dir)
            .await
            .with_context(|| format!("listing {}", self.objects_dir.display()))?;
        let mut count = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().ends_with(".json.gz") {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Append one NDJSON line, rolling to a new segment first if this line would push a
    /// non-empty segment past `segment_max_bytes`.
    pub async fn append_event(&self, event: &CloneEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event).context("serializing clone event")?;
        line.push(b'\n');
        let line_len = line.len() as u64;

        let mut segment = self.write_lock.lock().await;
        if segment.bytes > 0 && segment.bytes + line_len > self.segment_max_bytes {
            sync_file(&self.segment_path(segment.index)).await?;
            segment.index += 1;
            segment.bytes = 0;
            debug!(
                operation_id = %self.operation_id,
                segment = segment.index,
                "rotating event log segment"
            );
        }

        let path = self.segment_path(segment.index);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening event segment {}", path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to event segment {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing event segment {}", path.display()))?;
        segment.bytes += line_len;
        Ok(())
    }

    /// Force the current event segment to disk. Called before a checkpoint is persisted.
    pub async fn sync_events(&self) -> anyhow::Result<()> {
        let segment = self.write_lock.lock().await;
        let path = self.segment_path(segment.index);
        if path_exists(&path).await? {
            sync_file(&path).await?;
        }
        Ok(())
    }

    pub async fn event_segments(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut indexed = list_segments(&self.events_dir).await?;
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, path)| path).collect())
    }

    /// Stream every event in log order through `visit`, returning how many were seen.
    pub async fn replay_events<F>(&self, mut visit: F) -> anyhow::Result<u64>
    where
        F: FnMut(CloneEvent) -> anyhow::Result<()>,
    {
        let mut seen = 0u64;
        for path in self.event_segments().await? {
            let file = fs::File::open(&path)
                .await
                .with_context(|| format!("opening event segment {}", path.display()))?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let event = serde_json::from_str(&line)
                    .with_context(|| format!("parsing event in {}", path.display()))?;
                visit(event)?;
                seen += 1;
            }
        }
        Ok(seen)
    }

    pub async fn read_events(&self) -> anyhow::Result<Vec<CloneEvent>> {
        let mut events = Vec::new();
        self.replay_events(|event| {
            events.push(event);
            Ok(())
        })
        .await?;
        Ok(events)
    }
}

async fn path_exists(path: &Path) -> anyhow::Result<bool> {
    fs::try_exists(path)
        .await
        .with_context(|| format!("checking path {}", path.display()))
}

async fn read_json_best_effort<T: DeserializeOwned>(
    path: &Path,
    operation_id: &str,
    what: &str,
) -> Option<T> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(operation_id, path = %path.display(), error = %err, "failed to read {what}");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                operation_id,
                path = %path.display(),
                error = %err,
                "failed to parse {what}; treating as absent"
            );
            None
        }
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

async fn sync_file(path: &Path) -> anyhow::Result<()> {
    let file = fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {} for sync", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", path.display()))
}

/// Write to a uniquely named temp file beside `path`, then rename over it.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let write_result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
        drop(file);
        fs::rename(&temp_path, path).await.with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    }
    .await;

    if write_result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    write_result
}

async fn list_segments(events_dir: &Path) -> anyhow::Result<Vec<(u32, PathBuf)>> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(events_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => {
            return Err(err).with_context(|| format!("listing {}", events_dir.display()));
        }
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(index) = parse_segment_index(&name) {
            out.push((index, entry.path()));
        }
    }
    Ok(out)
}

async fn discover_current_segment(events_dir: &Path) -> anyhow::Result<EventSegment> {
    let Some((index, path)) = list_segments(events_dir)
        .await?
        .into_iter()
        .max_by_key(|(index, _)| *index)
    else {
        return Ok(EventSegment { index: 1, bytes: 0 });
    };
    let len = fs::metadata(&path)
        .await
        .with_context(|| format!("reading metadata of {}", path.display()))?
        .len();
    let bytes = truncate_torn_tail(&path, len).await?;
    Ok(EventSegment { index, bytes })
}

/// Cut a partial trailing line left by a crash mid-append back to the last newline, so
/// the next append starts on its own line. Returns the segment length afterwards.
async fn truncate_torn_tail(path: &Path, len: u64) -> anyhow::Result<u64> {
    if len == 0 {
        return Ok(0);
    }
    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening event segment {}", path.display()))?;

    let mut end = len;
    let keep = loop {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK);
        let mut chunk = vec![0u8; (end - start) as usize];
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .with_context(|| format!("seeking in event segment {}", path.display()))?;
        file.read_exact(&mut chunk)
            .await
            .with_context(|| format!("reading event segment {}", path.display()))?;
        if end == len && chunk.last() == Some(&b'\n') {
            return Ok(len);
        }
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            break start + pos as u64 + 1;
        }
        if start == 0 {
            break 0;
        }
        end = start;
    };

    file.set_len(keep)
        .await
        .with_context(|| format!("truncating event segment {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", path.display()))?;
    warn!(
        path = %path.display(),
        dropped_bytes = len - keep,
        "dropped torn trailing event line"
    );
    Ok(keep)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Rate limiting and "server busy" statuses; every other non-2xx status is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// A numeric `Retry-After` (seconds) clamped to `[1s, max_delay]`.
    pub fn retry_after_delay(&self, header: &str) -> Option<Duration> {
        let header = header.trim();
        if header.is_empty() || !header.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let secs = header.parse::<u64>().unwrap_or(u64::MAX);
        let floor = Duration::from_secs(1).min(self.max_delay);
        Some(Duration::from_secs(secs).min(self.max_delay).max(floor))
    }

    pub fn delay_with_hint(&self, attempt_index: u32, retry_after: Option<&str>) -> Duration {
        retry_after
            .and_then(|h| self.retry_after_delay(h))
            .unwrap_or_else(|| self.delay_for_attempt(attempt_index))
    }

    pub fn jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrent_requests: usize,
    pub max_idle_per_host: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            user_agent: None,
            max_concurrent_requests: 20,
            max_idle_per_host: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub status: StatusCode,
    pub final_url: String,
    pub body: JsonValue,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream rejected request: http {status} for {url}: {body}")]
    Rejected {
        status: u16,
        url: String,
        body: String,
    },
    #[error("upstream unavailable after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned invalid JSON from {url}: {message}")]
    InvalidBody { url: String, message: String },
    #[error("request limiter closed")]
    LimiterClosed,
}

const MAX_ERROR_BODY_CHARS: usize = 2_000;

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// GET `url` with `query`, retrying transient failures per the backoff policy.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedJson, FetchError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", url);
        self.get_json_with_retry(url, query).instrument(span).await
    }

    async fn get_json_with_retry(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedJson, FetchError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 0..max_attempts {
            let wait = match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(bytes) => {
                                let body = serde_json::from_slice(&bytes).map_err(|err| {
                                    FetchError::InvalidBody {
                                        url: final_url.clone(),
                                        message: err.to_string(),
                                    }
                                })?;
                                return Ok(FetchedJson {
                                    status,
                                    final_url,
                                    body,
                                });
                            }
                            Err(err)
                                if classify_reqwest_error(&err) == RetryDisposition::Retryable =>
                            {
                                last_error = format!("reading body: {err}");
                                self.backoff.delay_for_attempt(attempt)
                            }
                            Err(err) => return Err(FetchError::Request(err)),
                        }
                    } else if classify_status(status) == RetryDisposition::Retryable {
                        let retry_after = resp
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned);
                        last_error = format!("http {}", status.as_u16());
                        self.backoff.delay_with_hint(attempt, retry_after.as_deref())
                    } else {
                        let mut body = resp.text().await.unwrap_or_default();
                        if body.chars().count() > MAX_ERROR_BODY_CHARS {
                            body = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
                        }
                        return Err(FetchError::Rejected {
                            status: status.as_u16(),
                            url: final_url,
                            body,
                        });
                    }
                }
                Err(err) if classify_reqwest_error(&err) == RetryDisposition::Retryable => {
                    last_error = format!("network error: {err}");
                    self.backoff.delay_for_attempt(attempt)
                }
                Err(err) => return Err(FetchError::Request(err)),
            };

            if attempt + 1 < max_attempts {
                let wait = wait + self.backoff.jitter();
                warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %last_error,
                    "transient upstream failure; backing off"
                );
                tokio::time::sleep(wait).await;
            }
        }

        Err(FetchError::RetriesExhausted {
            attempts: max_attempts,
            last_error,
        })
    }
}
