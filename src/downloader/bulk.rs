// =============================================================================
// Bulk OHLCV downloader — checkpointed, rate-limited, priority-ordered
// =============================================================================
//
// Every (symbol, timeframe) pair is one task. Tasks already recorded in the
// checkpoint are skipped on resume; the rest are ordered by timeframe
// priority and drained by a bounded worker pool. Workers acquire a token
// before every outbound page request and trigger a limiter slowdown when the
// venue pushes back. The coordinator is the only checkpoint writer; it
// persists periodically and once more at the end. After the first pass,
// failed tasks are retried up to `max_retries` times, each retry removing
// the task's checkpoint key first.
//
// One CSV per task at `{root}/{timeframe}/{SYMBOL}_{timeframe}.csv`, columns
// `timestamp,open,high,low,close,volume`, ascending and deduplicated.
// =============================================================================

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::binance::FuturesClient;
use crate::downloader::rate_limit::RateLimiter;
use crate::downloader::symbols;
use crate::types::Candle;

/// Venue page size cap for kline requests.
const PAGE_LIMIT: u32 = 1500;
/// Checkpoint is persisted after this many new completions.
const CHECKPOINT_SAVE_EVERY: usize = 10;
/// Pause before each retry round.
const RETRY_PAUSE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Where the symbol list comes from.
#[derive(Debug, Clone)]
pub enum SymbolSource {
    /// Top N by 24h quote volume from the venue ticker, with stablecoin and
    /// leveraged-token pairs excluded.
    TopByVolume { n: usize, min_quote_volume: f64 },
    /// An explicit list, normalised to the internal form.
    Explicit(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub symbol_source: SymbolSource,
    pub timeframes: Vec<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub workers: usize,
    pub requests_per_minute: u32,
    pub burst: u32,
    pub output_dir: PathBuf,
    pub resume: bool,
    pub max_retries: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            symbol_source: SymbolSource::TopByVolume {
                n: 100,
                min_quote_volume: 1_000_000.0,
            },
            timeframes: vec!["1d".into(), "4h".into(), "1h".into(), "15m".into()],
            start: None,
            end: None,
            workers: 5,
            requests_per_minute: 1100,
            burst: 20,
            output_dir: PathBuf::from("data/raw"),
            resume: true,
            max_retries: 3,
        }
    }
}

impl DownloadConfig {
    /// Millisecond range for this run; the start defaults to 2020-01-01 and
    /// the end to `now`.
    pub fn date_range_ms(&self, now: DateTime<Utc>) -> (i64, i64) {
        let start = self
            .start
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid date"));
        let start_ms = start
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc()
            .timestamp_millis();
        let end_ms = match self.end {
            Some(end) => end
                .and_hms_opt(0, 0, 0)
                .expect("midnight is valid")
                .and_utc()
                .timestamp_millis(),
            None => now.timestamp_millis(),
        };
        (start_ms, end_ms)
    }
}

// ---------------------------------------------------------------------------
// Tasks & results
// ---------------------------------------------------------------------------

/// Scheduling priority per timeframe; lower runs first.
pub fn timeframe_priority(timeframe: &str) -> u8 {
    match timeframe {
        "1h" | "1d" => 1,
        "4h" => 2,
        "15m" => 3,
        "5m" => 4,
        "1m" => 5,
        _ => 10,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub symbol: String,
    pub timeframe: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub priority: u8,
}

impl DownloadTask {
    /// Checkpoint key for this task.
    pub fn key(&self) -> String {
        format!("{}_{}", self.symbol, self.timeframe)
    }
}

#[derive(Debug)]
pub struct DownloadResult {
    pub task: DownloadTask,
    pub success: bool,
    pub rows: usize,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Cross product of symbols and timeframes, with priorities attached.
pub fn build_tasks(
    symbols: &[String],
    timeframes: &[String],
    start_ms: i64,
    end_ms: i64,
) -> Vec<DownloadTask> {
    let mut tasks = Vec::with_capacity(symbols.len() * timeframes.len());
    for symbol in symbols {
        for timeframe in timeframes {
            tasks.push(DownloadTask {
                symbol: symbol.clone(),
                timeframe: timeframe.clone(),
                start_ms,
                end_ms,
                priority: timeframe_priority(timeframe),
            });
        }
    }
    tasks
}

/// Drop tasks whose key is already in the checkpoint.
pub fn filter_completed(tasks: Vec<DownloadTask>, checkpoint: &Checkpoint) -> Vec<DownloadTask> {
    let before = tasks.len();
    let remaining: Vec<DownloadTask> = tasks
        .into_iter()
        .filter(|t| !checkpoint.contains(&t.key()))
        .collect();
    info!(
        total = before,
        remaining = remaining.len(),
        "checkpoint filter applied"
    );
    remaining
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    completed: Vec<String>,
    last_update: String,
}

/// Persisted set of completed `{SYMBOL}_{TIMEFRAME}` keys.
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    completed: BTreeSet<String>,
}

impl Checkpoint {
    /// Load from `path`; a missing or unreadable file yields an empty set.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let completed = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<CheckpointFile>(&content) {
                Ok(file) => {
                    info!(
                        path = %path.display(),
                        completed = file.completed.len(),
                        "checkpoint loaded"
                    );
                    file.completed.into_iter().collect()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable checkpoint — starting fresh");
                    BTreeSet::new()
                }
            },
            Err(_) => BTreeSet::new(),
        };
        Self { path, completed }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.completed.contains(key)
    }

    pub fn insert(&mut self, key: String) {
        self.completed.insert(key);
    }

    pub fn remove(&mut self, key: &str) {
        self.completed.remove(key);
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// Whole-file rewrite via tmp + rename.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = CheckpointFile {
            completed: self.completed.iter().cloned().collect(),
            last_update: Utc::now().to_rfc3339(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "checkpoint saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct FailedItem {
    pub symbol: String,
    pub timeframe: String,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadReport {
    pub started: String,
    pub finished: String,
    pub total_symbols: usize,
    pub total_timeframes: usize,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub success_rate: String,
    pub total_rows: u64,
    pub total_duration_secs: f64,
    pub failed_items: Vec<FailedItem>,
}

impl DownloadReport {
    fn from_results(
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
        total_symbols: usize,
        total_timeframes: usize,
        total_tasks: usize,
        results: &[DownloadResult],
    ) -> Self {
        let successful_tasks = results.iter().filter(|r| r.success).count();
        let failed: Vec<&DownloadResult> = results.iter().filter(|r| !r.success).collect();
        let attempted = results.len();
        let success_rate = if attempted > 0 {
            format!("{:.1}%", successful_tasks as f64 / attempted as f64 * 100.0)
        } else {
            "N/A".to_string()
        };

        Self {
            started: started.to_rfc3339(),
            finished: finished.to_rfc3339(),
            total_symbols,
            total_timeframes,
            total_tasks,
            successful_tasks,
            failed_tasks: failed.len(),
            success_rate,
            total_rows: results.iter().map(|r| r.rows as u64).sum(),
            total_duration_secs: results.iter().map(|r| r.duration.as_secs_f64()).sum(),
            failed_items: failed
                .iter()
                .map(|r| FailedItem {
                    symbol: r.task.symbol.clone(),
                    timeframe: r.task.timeframe.clone(),
                    error: r.error.clone().unwrap_or_default(),
                })
                .collect(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage helpers
// ---------------------------------------------------------------------------

/// Deterministic output path: `{root}/{timeframe}/{SYMBOL}_{timeframe}.csv`.
pub fn task_path(root: &Path, symbol: &str, timeframe: &str) -> PathBuf {
    root.join(timeframe).join(format!("{symbol}_{timeframe}.csv"))
}

/// Sort ascending by open time and drop duplicate bars.
pub fn dedupe_ascending(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.sort_by_key(|c| c.open_time);
    candles.dedup_by_key(|c| c.open_time);
    candles
}

/// Write candles as CSV (`timestamp,open,high,low,close,volume`); returns the
/// number of rows written.
pub fn write_candles_csv(path: &Path, candles: &[Candle]) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writer.write_record(["timestamp", "open", "high", "low", "close", "volume"])?;
    for candle in candles {
        writer.write_record([
            candle.open_time.to_string(),
            candle.open.to_string(),
            candle.high.to_string(),
            candle.low.to_string(),
            candle.close.to_string(),
            candle.volume.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(candles.len())
}

// ---------------------------------------------------------------------------
// Downloader
// ---------------------------------------------------------------------------

pub struct BulkDownloader {
    client: Arc<FuturesClient>,
    limiter: Arc<RateLimiter>,
    config: DownloadConfig,
    checkpoint: Mutex<Checkpoint>,
}

impl BulkDownloader {
    pub fn new(client: Arc<FuturesClient>, config: DownloadConfig) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.requests_per_minute,
            config.burst,
            "downloader",
        ));
        let checkpoint = Checkpoint::load(config.output_dir.join(".download_checkpoint.json"));
        Self {
            client,
            limiter,
            config,
            checkpoint: Mutex::new(checkpoint),
        }
    }

    /// Full run: resolve symbols, plan tasks, drain the pool, retry failures,
    /// persist checkpoint and report.
    pub async fn run(self: Arc<Self>) -> Result<DownloadReport> {
        let started = Utc::now();

        let symbols = self.resolve_symbols().await?;
        anyhow::ensure!(!symbols.is_empty(), "no symbols to download");

        let (start_ms, end_ms) = self.config.date_range_ms(started);
        let mut tasks = build_tasks(&symbols, &self.config.timeframes, start_ms, end_ms);
        let total_tasks = tasks.len();

        if self.config.resume {
            let checkpoint = self.checkpoint.lock();
            if !checkpoint.is_empty() {
                tasks = filter_completed(tasks, &checkpoint);
            }
        }
        tasks.sort_by_key(|t| t.priority);

        info!(
            symbols = symbols.len(),
            timeframes = self.config.timeframes.len(),
            planned = total_tasks,
            to_download = tasks.len(),
            checkpointed = self.checkpoint.lock().len(),
            workers = self.config.workers,
            "bulk download starting"
        );

        let mut results = self.execute(tasks).await;

        if self.config.max_retries > 0 {
            self.retry_failed(&mut results).await;
        }

        if let Err(e) = self.checkpoint.lock().save() {
            warn!(error = %e, "final checkpoint save failed");
        }

        let report = DownloadReport::from_results(
            started,
            Utc::now(),
            symbols.len(),
            self.config.timeframes.len(),
            total_tasks,
            &results,
        );
        let report_path = self.config.output_dir.join("download_report.json");
        report
            .save(&report_path)
            .context("failed to save download report")?;

        let limiter_stats = self.limiter.stats();
        info!(
            successful = report.successful_tasks,
            failed = report.failed_tasks,
            rows = report.total_rows,
            requests = limiter_stats.total_requests,
            throttled = limiter_stats.total_waits,
            report = %report_path.display(),
            "bulk download finished"
        );
        Ok(report)
    }

    async fn resolve_symbols(&self) -> Result<Vec<String>> {
        match &self.config.symbol_source {
            SymbolSource::Explicit(list) => {
                let mut resolved = Vec::with_capacity(list.len());
                for raw in list {
                    match symbols::to_internal(raw) {
                        Some(s) => resolved.push(s),
                        None => warn!(symbol = %raw, "skipping unparseable symbol"),
                    }
                }
                Ok(resolved)
            }
            SymbolSource::TopByVolume {
                n,
                min_quote_volume,
            } => {
                let tickers = self
                    .client
                    .ticker_24h()
                    .await
                    .context("failed to fetch 24h tickers")?;
                Ok(symbols::select_top_symbols(
                    &tickers,
                    *n,
                    "USDT",
                    *min_quote_volume,
                ))
            }
        }
    }

    /// Drain `tasks` through the worker pool. The receiving side (this
    /// function) is the only checkpoint writer.
    async fn execute(self: &Arc<Self>, tasks: Vec<DownloadTask>) -> Vec<DownloadResult> {
        if tasks.is_empty() {
            info!("all tasks already complete — nothing to download");
            return Vec::new();
        }

        let total = tasks.len();
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let (tx, mut rx) = tokio::sync::mpsc::channel::<DownloadResult>(64);

        let workers = self.config.workers.clamp(1, total);
        for worker_id in 0..workers {
            let this = Arc::clone(self);
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    let task = queue.lock().pop_front();
                    let Some(task) = task else { break };
                    let result = this.download_one(task).await;
                    if tx.send(result).await.is_err() {
                        break;
                    }
                }
                debug!(worker_id, "worker drained");
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(total);
        let mut unsaved = 0usize;
        while let Some(result) = rx.recv().await {
            if result.success {
                let mut checkpoint = self.checkpoint.lock();
                checkpoint.insert(result.task.key());
                unsaved += 1;
                if unsaved >= CHECKPOINT_SAVE_EVERY {
                    if let Err(e) = checkpoint.save() {
                        warn!(error = %e, "periodic checkpoint save failed");
                    }
                    unsaved = 0;
                }
            } else {
                warn!(
                    symbol = %result.task.symbol,
                    timeframe = %result.task.timeframe,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "task failed"
                );
            }
            results.push(result);
            if results.len() % 50 == 0 {
                info!(done = results.len(), total, "download progress");
            }
        }

        results
    }

    async fn download_one(&self, task: DownloadTask) -> DownloadResult {
        let started = Instant::now();
        debug!(symbol = %task.symbol, timeframe = %task.timeframe, "task started");

        match self.fetch_and_store(&task).await {
            Ok((rows, path)) => {
                debug!(
                    symbol = %task.symbol,
                    timeframe = %task.timeframe,
                    rows,
                    secs = started.elapsed().as_secs_f64(),
                    "task complete"
                );
                DownloadResult {
                    success: true,
                    rows,
                    path: Some(path),
                    error: None,
                    duration: started.elapsed(),
                    task,
                }
            }
            Err(e) => DownloadResult {
                success: false,
                rows: 0,
                path: None,
                error: Some(e.to_string()),
                duration: started.elapsed(),
                task,
            },
        }
    }

    /// Page through the kline history and write the CSV. One token per page
    /// request; a venue rate-limit response engages the limiter slowdown.
    async fn fetch_and_store(&self, task: &DownloadTask) -> Result<(usize, PathBuf)> {
        let mut all: Vec<Candle> = Vec::new();
        let mut cursor = task.start_ms;

        while cursor < task.end_ms {
            self.limiter.acquire(1.0).await;

            let page = match self
                .client
                .get_klines_range(&task.symbol, &task.timeframe, cursor, task.end_ms, PAGE_LIMIT)
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    if e.is_rate_limited() {
                        self.limiter.slowdown(Duration::from_secs(60));
                    }
                    return Err(e.into());
                }
            };
            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            let last_close = page.last().map(|c| c.close_time).unwrap_or(cursor);
            all.extend(page);

            let next = last_close + 1;
            if next <= cursor {
                // The venue returned nothing beyond the cursor.
                break;
            }
            cursor = next;

            if (page_len as u32) < PAGE_LIMIT {
                break;
            }
        }

        let candles = dedupe_ascending(all);
        anyhow::ensure!(!candles.is_empty(), "no data returned");

        let path = task_path(&self.config.output_dir, &task.symbol, &task.timeframe);
        let rows = write_candles_csv(&path, &candles)?;
        Ok((rows, path))
    }

    /// Retry failed tasks sequentially, up to `max_retries` rounds. Each
    /// retry removes the checkpoint key first so a stale success can never
    /// mask a fresh failure.
    async fn retry_failed(&self, results: &mut [DownloadResult]) {
        for attempt in 1..=self.config.max_retries {
            let failed: Vec<usize> = results
                .iter()
                .enumerate()
                .filter(|(_, r)| !r.success)
                .map(|(i, _)| i)
                .collect();
            if failed.is_empty() {
                return;
            }

            info!(attempt, count = failed.len(), "retrying failed tasks");
            tokio::time::sleep(RETRY_PAUSE).await;

            for idx in failed {
                let task = results[idx].task.clone();
                self.checkpoint.lock().remove(&task.key());

                let result = self.download_one(task).await;
                if result.success {
                    self.checkpoint.lock().insert(result.task.key());
                }
                results[idx] = result;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            close_time: open_time + 3_599_999,
        }
    }

    #[test]
    fn priorities_follow_timeframe_ranking() {
        assert_eq!(timeframe_priority("1h"), 1);
        assert_eq!(timeframe_priority("1d"), 1);
        assert_eq!(timeframe_priority("4h"), 2);
        assert_eq!(timeframe_priority("15m"), 3);
        assert_eq!(timeframe_priority("5m"), 4);
        assert_eq!(timeframe_priority("1m"), 5);
        assert_eq!(timeframe_priority("3w"), 10);
    }

    #[test]
    fn tasks_cross_product_and_sort_by_priority() {
        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let timeframes = vec!["15m".to_string(), "1h".to_string()];
        let mut tasks = build_tasks(&symbols, &timeframes, 0, 1000);
        assert_eq!(tasks.len(), 4);

        tasks.sort_by_key(|t| t.priority);
        assert_eq!(tasks[0].timeframe, "1h");
        assert_eq!(tasks[1].timeframe, "1h");
        assert_eq!(tasks[2].timeframe, "15m");
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".download_checkpoint.json");

        let mut checkpoint = Checkpoint::load(&path);
        assert!(checkpoint.is_empty());
        checkpoint.insert("BTCUSDT_1h".to_string());
        checkpoint.insert("ETHUSDT_4h".to_string());
        checkpoint.save().unwrap();

        let reloaded = Checkpoint::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("BTCUSDT_1h"));
        assert!(reloaded.contains("ETHUSDT_4h"));
        assert!(!reloaded.contains("XRPUSDT_1h"));
    }

    #[test]
    fn checkpoint_remove_reopens_a_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = Checkpoint::load(dir.path().join("cp.json"));
        checkpoint.insert("BTCUSDT_1h".to_string());
        checkpoint.remove("BTCUSDT_1h");
        assert!(!checkpoint.contains("BTCUSDT_1h"));
    }

    #[test]
    fn resume_skips_checkpointed_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = Checkpoint::load(dir.path().join("cp.json"));
        checkpoint.insert("BTCUSDT_1h".to_string());

        let symbols = vec!["BTCUSDT".to_string()];
        let timeframes = vec!["1h".to_string(), "4h".to_string()];
        let tasks = build_tasks(&symbols, &timeframes, 0, 1000);

        let remaining = filter_completed(tasks, &checkpoint);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timeframe, "4h");
    }

    #[test]
    fn fully_checkpointed_run_plans_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = Checkpoint::load(dir.path().join("cp.json"));
        checkpoint.insert("BTCUSDT_1h".to_string());
        checkpoint.insert("BTCUSDT_4h".to_string());

        let tasks = build_tasks(
            &["BTCUSDT".to_string()],
            &["1h".to_string(), "4h".to_string()],
            0,
            1000,
        );
        assert!(filter_completed(tasks, &checkpoint).is_empty());
    }

    #[test]
    fn dedupe_sorts_and_drops_duplicates() {
        let raw = vec![candle(3000, 3.0), candle(1000, 1.0), candle(2000, 2.0), candle(1000, 1.5)];
        let clean = dedupe_ascending(raw);
        assert_eq!(clean.len(), 3);
        assert_eq!(
            clean.iter().map(|c| c.open_time).collect::<Vec<_>>(),
            vec![1000, 2000, 3000]
        );
    }

    #[test]
    fn csv_file_has_header_and_ascending_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = task_path(dir.path(), "BTCUSDT", "1h");
        let candles = vec![candle(1000, 1.0), candle(2000, 2.0), candle(3000, 3.0)];

        let rows = write_candles_csv(&path, &candles).unwrap();
        assert_eq!(rows, 3);
        assert!(path.ends_with("1h/BTCUSDT_1h.csv"));

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp,open,high,low,close,volume"
        );

        let timestamps: Vec<i64> = lines
            .map(|l| l.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(timestamps, vec![1000, 2000, 3000]);
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn report_counts_and_rate() {
        let task = DownloadTask {
            symbol: "BTCUSDT".to_string(),
            timeframe: "1h".to_string(),
            start_ms: 0,
            end_ms: 1000,
            priority: 1,
        };
        let results = vec![
            DownloadResult {
                task: task.clone(),
                success: true,
                rows: 500,
                path: Some(PathBuf::from("x.csv")),
                error: None,
                duration: Duration::from_secs(2),
            },
            DownloadResult {
                task: DownloadTask {
                    timeframe: "4h".to_string(),
                    ..task.clone()
                },
                success: false,
                rows: 0,
                path: None,
                error: Some("no data returned".to_string()),
                duration: Duration::from_secs(1),
            },
        ];

        let now = Utc::now();
        let report = DownloadReport::from_results(now, now, 1, 2, 2, &results);
        assert_eq!(report.successful_tasks, 1);
        assert_eq!(report.failed_tasks, 1);
        assert_eq!(report.success_rate, "50.0%");
        assert_eq!(report.total_rows, 500);
        assert_eq!(report.failed_items.len(), 1);
        assert_eq!(report.failed_items[0].timeframe, "4h");
        assert_eq!(report.failed_items[0].error, "no data returned");
    }

    #[test]
    fn report_saves_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let report = DownloadReport::from_results(now, now, 0, 0, 0, &[]);
        assert_eq!(report.success_rate, "N/A");

        let path = dir.path().join("download_report.json");
        report.save(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: DownloadReport = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.total_tasks, 0);
    }

    #[test]
    fn date_range_defaults() {
        let config = DownloadConfig::default();
        let now = Utc::now();
        let (start_ms, end_ms) = config.date_range_ms(now);
        // 2020-01-01T00:00:00Z
        assert_eq!(start_ms, 1_577_836_800_000);
        assert_eq!(end_ms, now.timestamp_millis());
    }
}
