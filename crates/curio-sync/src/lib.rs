//! Collection pipelines: import conflict resolution, duplicate
//! cleanup, and rate-limited batch enrichment with credential rotation.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use curio_core::{AnalysisResult, AppConfig, Item};
use curio_storage::{Gateway, StoreError};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "curio-sync";

/// Chunk size for persisting freshly imported items.
pub const IMPORT_CHUNK_SIZE: usize = 50;
/// Chunk size for persisting enrichment results.
pub const ENRICH_CHUNK_SIZE: usize = 20;
/// Re-attempts per item after its first failed analysis.
pub const MAX_ANALYSIS_RETRIES: u32 = 3;
/// Environment fallback when the config carries no analysis keys.
pub const DEFAULT_KEY_ENV: &str = "CURIO_API_KEY";

pub const ENRICH_PROGRESS_LABEL: &str = "Enriching collection";

const ANALYSIS_CONTENT_LIMIT: usize = 5000;
const ANALYSIS_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_ANALYSIS_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("no analysis credential configured: set analysisKeys in the config or {DEFAULT_KEY_ENV}")]
    NoCredential,
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A single failed analysis attempt. Inside the batch pipeline this is
/// contained by the retry loop and never surfaced per item.
#[derive(Debug, Error)]
#[error("analysis failed: {0}")]
pub struct AnalysisError(pub String);

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        Self(err.to_string())
    }
}

/// External content-analysis capability: free text plus one credential
/// in, a structured result out. Every failure mode is uniform.
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn analyze(&self, content: &str, credential: &str)
        -> Result<AnalysisResult, AnalysisError>;
}

/// Production analyzer posting a JSON-schema-constrained prompt to a
/// `generateContent` endpoint, keyed per request.
#[derive(Debug, Clone)]
pub struct HttpAnalyzer {
    client: reqwest::Client,
    model: String,
}

impl HttpAnalyzer {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_model(DEFAULT_ANALYSIS_MODEL)
    }

    pub fn with_model(model: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building analysis http client")?;
        Ok(Self {
            client,
            model: model.to_string(),
        })
    }

    fn prompt(content: &str) -> String {
        let truncated: String = content.chars().take(ANALYSIS_CONTENT_LIMIT).collect();
        format!(
            "Analyze the following content (a URL or plain text).\n\n\
             Return:\n\
             1. title: a concise title.\n\
             2. summary: a summary of at most two sentences.\n\
             3. tags: 3-5 relevant tags.\n\
             4. type: 'link' for a URL, 'note' for plain text, 'snippet' for code.\n\n\
             Content: \"{truncated}\""
        )
    }
}

#[async_trait]
impl ContentAnalyzer for HttpAnalyzer {
    async fn analyze(
        &self,
        content: &str,
        credential: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": Self::prompt(content)}]}],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "OBJECT",
                    "properties": {
                        "title": {"type": "STRING"},
                        "summary": {"type": "STRING"},
                        "tags": {"type": "ARRAY", "items": {"type": "STRING"}},
                        "type": {"type": "STRING", "enum": ["link", "note", "snippet"]}
                    },
                    "required": ["title", "summary", "tags", "type"]
                }
            }
        });

        let url = format!("{ANALYSIS_ENDPOINT}/{}:generateContent", self.model);
        let resp = self
            .client
            .post(&url)
            .query(&[("key", credential)])
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AnalysisError(format!(
                "analysis request failed with status {status}"
            )));
        }

        let value: serde_json::Value = resp.json().await?;
        let text = value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AnalysisError("empty analysis response".to_string()))?;
        serde_json::from_str(text)
            .map_err(|err| AnalysisError(format!("malformed analysis payload: {err}")))
    }
}

/// Resolve the credential list: configured keys first, then the
/// process-level default. No usable credential is a hard error raised
/// before any work begins.
pub fn usable_keys(config: &AppConfig) -> Result<Vec<String>, EnrichError> {
    resolve_keys(config, std::env::var(DEFAULT_KEY_ENV).ok())
}

fn resolve_keys(config: &AppConfig, fallback: Option<String>) -> Result<Vec<String>, EnrichError> {
    let keys: Vec<String> = config
        .analysis_keys
        .iter()
        .filter(|key| !key.trim().is_empty())
        .cloned()
        .collect();
    if !keys.is_empty() {
        return Ok(keys);
    }
    match fallback {
        Some(key) if !key.trim().is_empty() => Ok(vec![key]),
        _ => Err(EnrichError::NoCredential),
    }
}

// --- Import conflict resolution ---

/// A newly imported link whose content exactly matches a stored one.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictPair {
    pub candidate: Item,
    pub existing: Item,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Persist the candidate; old and new coexist, no field merge.
    Keep,
    /// Discard the candidate.
    Skip,
    /// Discard the candidate and the whole remaining tail.
    SkipAll,
}

/// Split parsed candidates against a snapshot of the collection. Only
/// links are conflict-checked; notes and snippets always pass through.
pub fn partition_conflicts(
    candidates: Vec<Item>,
    existing: &[Item],
) -> (Vec<Item>, Vec<ConflictPair>) {
    let mut ready = Vec::new();
    let mut conflicts = Vec::new();
    for candidate in candidates {
        if candidate.is_link() {
            let hit = existing
                .iter()
                .find(|item| item.is_link() && item.content == candidate.content);
            if let Some(hit) = hit {
                conflicts.push(ConflictPair {
                    candidate,
                    existing: hit.clone(),
                });
                continue;
            }
        }
        ready.push(candidate);
    }
    (ready, conflicts)
}

/// Ordered queue of unresolved pairs, drained strictly one head at a
/// time. Empty is both the initial state (no conflicts) and the
/// terminal state. Not resumable across restarts; each Keep decision
/// is persisted before the queue advances, so resolved work is durable.
#[derive(Debug, Default)]
pub struct ConflictQueue {
    pairs: VecDeque<ConflictPair>,
}

impl ConflictQueue {
    pub fn new(pairs: impl IntoIterator<Item = ConflictPair>) -> Self {
        Self {
            pairs: pairs.into_iter().collect(),
        }
    }

    pub fn head(&self) -> Option<&ConflictPair> {
        self.pairs.front()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub async fn resolve_head(
        &mut self,
        action: ConflictAction,
        gateway: &Gateway,
    ) -> Result<(), StoreError> {
        let Some(head) = self.pairs.pop_front() else {
            return Ok(());
        };
        match action {
            ConflictAction::Keep => {
                if let Err(err) = gateway.upsert_one(&head.candidate).await {
                    self.pairs.push_front(head);
                    return Err(err);
                }
            }
            ConflictAction::Skip => {}
            ConflictAction::SkipAll => self.pairs.clear(),
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ImportOutcome {
    /// Candidates persisted immediately, without user interaction.
    pub imported: usize,
    pub conflicts: ConflictQueue,
}

/// Persist the non-conflicting candidates in fixed-size chunks and
/// queue the rest for one-at-a-time resolution.
pub async fn stage_import(
    gateway: &Gateway,
    candidates: Vec<Item>,
) -> Result<ImportOutcome, StoreError> {
    let existing = gateway.list_all().await?;
    let (ready, conflicts) = partition_conflicts(candidates, &existing);
    for chunk in ready.chunks(IMPORT_CHUNK_SIZE) {
        gateway.upsert_batch(chunk).await?;
    }
    Ok(ImportOutcome {
        imported: ready.len(),
        conflicts: ConflictQueue::new(conflicts),
    })
}

// --- Deduplication ---

/// Two or more stored links sharing identical content, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub content: String,
    pub members: Vec<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    KeepNewest,
    KeepOldest,
}

/// Pure projection over a snapshot: link items grouped by exact
/// content, groups of one dropped, members sorted by `created_at`
/// descending. The sort is stable, so equal timestamps keep their
/// snapshot order. Safe to recompute on every view.
pub fn duplicate_groups(items: &[Item]) -> Vec<DuplicateGroup> {
    let mut order: Vec<&str> = Vec::new();
    let mut by_content: HashMap<&str, Vec<&Item>> = HashMap::new();
    for item in items.iter().filter(|item| item.is_link()) {
        let bucket = by_content.entry(item.content.as_str()).or_default();
        if bucket.is_empty() {
            order.push(item.content.as_str());
        }
        bucket.push(item);
    }

    order
        .into_iter()
        .filter_map(|content| {
            let bucket = by_content.remove(content)?;
            if bucket.len() < 2 {
                return None;
            }
            let mut members: Vec<Item> = bucket.into_iter().cloned().collect();
            members.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Some(DuplicateGroup {
                content: content.to_string(),
                members,
            })
        })
        .collect()
}

/// Ids to delete under the given policy: everything but the newest
/// (first) or the oldest (last) member of each group.
pub fn retention_plan(groups: &[DuplicateGroup], policy: RetentionPolicy) -> Vec<String> {
    let mut doomed = Vec::new();
    for group in groups {
        let survivors = match policy {
            RetentionPolicy::KeepNewest => &group.members[1..],
            RetentionPolicy::KeepOldest => &group.members[..group.members.len() - 1],
        };
        doomed.extend(survivors.iter().map(|item| item.id.clone()));
    }
    doomed
}

/// Plan, then issue one delete batch through the gateway. Returns the
/// number of deleted items.
pub async fn apply_retention(
    gateway: &Gateway,
    groups: &[DuplicateGroup],
    policy: RetentionPolicy,
) -> Result<usize, StoreError> {
    let doomed = retention_plan(groups, policy);
    if !doomed.is_empty() {
        gateway.delete_batch(&doomed).await?;
    }
    Ok(doomed.len())
}

// --- Batch enrichment ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
    pub label: &'static str,
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);
}

#[derive(Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn report(&self, _progress: Progress) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub item: Item,
    pub retries: u32,
}

/// FIFO work queue with a retry counter attached per logical entry, so
/// a requeued item accumulates attempts instead of resetting them.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: VecDeque<QueueEntry>,
}

impl RetryQueue {
    pub fn seed(items: impl IntoIterator<Item = Item>) -> Self {
        Self {
            entries: items
                .into_iter()
                .map(|item| QueueEntry { item, retries: 0 })
                .collect(),
        }
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Re-enqueue at the tail with the counter incremented.
    pub fn requeue(&mut self, entry: QueueEntry) {
        self.entries.push_back(QueueEntry {
            retries: entry.retries + 1,
            ..entry
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Merge an analysis into an item: the summary lands in `ai_summary`,
/// returned tags union into the existing set.
pub fn apply_analysis(mut item: Item, analysis: AnalysisResult) -> Item {
    item.ai_summary = Some(analysis.summary);
    item.add_tags(analysis.tags);
    item
}

/// Drives the content-analysis capability across a working set, one
/// request at a time, rotating credentials round-robin and retrying
/// failures up to [`MAX_ANALYSIS_RETRIES`] times per item.
pub struct BatchEnricher {
    analyzer: Box<dyn ContentAnalyzer>,
    keys: Vec<String>,
    progress: Box<dyn ProgressSink>,
}

impl BatchEnricher {
    /// Fails fast with [`EnrichError::NoCredential`] on an empty key
    /// list; the caller must not proceed.
    pub fn new(analyzer: Box<dyn ContentAnalyzer>, keys: Vec<String>) -> Result<Self, EnrichError> {
        if keys.iter().all(|key| key.trim().is_empty()) {
            return Err(EnrichError::NoCredential);
        }
        Ok(Self {
            analyzer,
            keys,
            progress: Box::<NoopProgressSink>::default(),
        })
    }

    pub fn with_progress(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Throttle: aggregate request rate stays roughly constant however
    /// many credentials rotate, with a 500ms floor.
    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis((3000 / self.keys.len() as u64).max(500))
    }

    /// Drain the working set and persist the completed results in
    /// fixed-size chunks. Returns the number of completed items, which
    /// always equals the target count: items whose analysis keeps
    /// failing pass through unmodified.
    pub async fn run(&self, gateway: &Gateway, targets: Vec<Item>) -> Result<usize, EnrichError> {
        let total = targets.len();
        let delay = self.inter_request_delay();
        let mut queue = RetryQueue::seed(targets);
        let mut completed: Vec<Item> = Vec::with_capacity(total);
        let mut key_index = 0usize;
        let mut processed = 0usize;

        while let Some(entry) = queue.pop() {
            sleep(delay).await;
            let key = &self.keys[key_index % self.keys.len()];
            key_index += 1;

            match self.analyzer.analyze(&entry.item.content, key).await {
                Ok(analysis) => completed.push(apply_analysis(entry.item, analysis)),
                Err(err) => {
                    if entry.retries < MAX_ANALYSIS_RETRIES {
                        debug!(title = %entry.item.title, retries = entry.retries, %err,
                            "analysis failed; requeueing");
                        queue.requeue(entry);
                    } else {
                        warn!(title = %entry.item.title, %err,
                            "analysis exhausted retries; keeping item unmodified");
                        completed.push(entry.item);
                    }
                }
            }

            processed += 1;
            self.progress.report(Progress {
                processed: processed.min(total),
                total,
                label: ENRICH_PROGRESS_LABEL,
            });
        }

        for chunk in completed.chunks(ENRICH_CHUNK_SIZE) {
            gateway.upsert_batch(chunk).await?;
        }
        Ok(completed.len())
    }
}

/// Analyze one item with the first usable credential and persist the
/// result. Unlike the batch pipeline there is no retry loop; a failure
/// propagates to the caller.
pub async fn analyze_one(
    gateway: &Gateway,
    analyzer: &dyn ContentAnalyzer,
    keys: &[String],
    item: Item,
) -> Result<Item, EnrichError> {
    let key = keys
        .iter()
        .find(|key| !key.trim().is_empty())
        .ok_or(EnrichError::NoCredential)?;
    let analysis = analyzer.analyze(&item.content, key).await?;
    let updated = apply_analysis(item, analysis);
    gateway.upsert_one(&updated).await?;
    Ok(updated)
}
