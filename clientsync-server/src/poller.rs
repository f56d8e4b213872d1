//! Change detector: polls the claim store for out-of-band ownership changes
//!
//! Each tick:
//! 1. fetch rows with `updated_at >= watermark` (the first poll looks back a
//!    safety margin so writes landing just before start are not missed)
//! 2. advance the watermark to the newest `updated_at` seen, before processing
//! 3. keep the latest row per entity
//! 4. compare each entity's `owner|claimed_at` signature with the last one
//!    observed and publish a change only when it differs
//!
//! A failed fetch leaves watermark and state untouched so the next tick retries
//! the same window. Nothing here panics the host.
//!
//! Ticks are single-flight: the scheduling loop awaits each tick before the
//! next one, and a guard flag makes any overlapping call a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clientsync_common::config::PollerConfig;
use clientsync_common::{Change, ChangeType, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::CacheInvalidator;

/// One row of the claim store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRow {
    pub entity_id: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub source: Option<String>,
    pub deleted: bool,
}

impl ClaimRow {
    /// Observable-state signature compared across ticks
    pub fn signature(&self) -> String {
        format!(
            "{}|{}|{}",
            self.claimed_by.as_deref().unwrap_or("").trim(),
            self.claimed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            if self.deleted { "deleted" } else { "live" }
        )
    }
}

/// External store scanned by the detector
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Rows whose update timestamp is at or after `since`
    async fn fetch_updated_since(&self, since: DateTime<Utc>) -> Result<Vec<ClaimRow>>;
}

/// Receiver of detected changes
pub trait ChangeSink: Send + Sync {
    fn publish(&self, change: Change);
}

/// Poll position and last observed state per entity
#[derive(Debug, Clone, Default)]
pub struct Watermark {
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_observed_state: HashMap<String, String>,
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was already running
    Skipped,
    /// Fetch failed; nothing changed
    Failed,
    Completed { rows: usize, published: usize },
}

/// Detector timing
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub interval: Duration,
    pub safety_margin: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self::from(&PollerConfig::default())
    }
}

impl From<&PollerConfig> for PollerSettings {
    fn from(config: &PollerConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms.max(1)),
            safety_margin: Duration::from_secs(config.safety_margin_secs),
        }
    }
}

/// Watermark-driven claim change detector
pub struct ChangeDetector {
    source: Arc<dyn ChangeSource>,
    settings: PollerSettings,
    state: Mutex<Watermark>,
    running: AtomicBool,
    invalidation: Option<(CacheInvalidator, Vec<String>)>,
}

/// Clears the single-flight flag when a tick ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ChangeDetector {
    pub fn new(source: Arc<dyn ChangeSource>, settings: PollerSettings) -> Self {
        Self {
            source,
            settings,
            state: Mutex::new(Watermark::default()),
            running: AtomicBool::new(false),
            invalidation: None,
        }
    }

    /// Evict `patterns` whenever a tick publishes at least one change
    pub fn with_invalidation(
        mut self,
        invalidator: CacheInvalidator,
        patterns: Vec<String>,
    ) -> Self {
        self.invalidation = Some((invalidator, patterns));
        self
    }

    fn state(&self) -> MutexGuard<'_, Watermark> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current watermark
    pub fn watermark(&self) -> Watermark {
        self.state().clone()
    }

    /// Forget the watermark and every observed state
    pub fn reset(&self) {
        *self.state() = Watermark::default();
        debug!("Change detector state reset");
    }

    /// Run one poll cycle, publishing detected changes to `sink`
    pub async fn tick(&self, sink: &dyn ChangeSink) -> TickOutcome {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Previous poll still running, skipping tick");
            return TickOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);

        let since = self.state().last_polled_at.unwrap_or_else(|| {
            let margin = chrono::Duration::from_std(self.settings.safety_margin)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            clientsync_common::time::now() - margin
        });

        let rows = match self.source.fetch_updated_since(since).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(since = %since, "Claim poll failed, will retry next tick: {}", e);
                return TickOutcome::Failed;
            }
        };
        let row_count = rows.len();

        let changes = {
            let mut state = self.state();

            if let Some(newest) = rows.iter().map(|r| r.updated_at).max() {
                if state.last_polled_at.map_or(true, |current| newest > current) {
                    state.last_polled_at = Some(newest);
                }
            }

            let mut latest: HashMap<&str, &ClaimRow> = HashMap::new();
            for row in &rows {
                match latest.get(row.entity_id.as_str()) {
                    Some(existing) if existing.updated_at > row.updated_at => {}
                    _ => {
                        latest.insert(row.entity_id.as_str(), row);
                    }
                }
            }

            let mut candidates: Vec<&ClaimRow> = latest.into_values().collect();
            candidates.sort_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.entity_id.cmp(&b.entity_id))
            });

            let mut changes = Vec::new();
            for row in candidates {
                let signature = row.signature();
                let previous = state
                    .last_observed_state
                    .insert(row.entity_id.clone(), signature.clone());
                if previous.as_deref() == Some(signature.as_str()) {
                    continue;
                }
                changes.push(change_for(row, previous.is_none()));
            }
            changes
        };

        let published = changes.len();
        for change in changes {
            sink.publish(change);
        }

        if published > 0 {
            info!(rows = row_count, published, "Claim changes detected");
            if let Some((invalidator, patterns)) = &self.invalidation {
                invalidator.invalidate(patterns).await;
            }
        } else {
            debug!(rows = row_count, "No claim changes");
        }

        TickOutcome::Completed {
            rows: row_count,
            published,
        }
    }

    /// Start the sequential polling loop; stops when the handle is stopped or dropped
    pub fn spawn<S>(self: Arc<Self>, sink: S) -> PollerHandle
    where
        S: ChangeSink + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.settings.interval;
        let task = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Change detector started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                self.tick(&sink).await;
            }
            info!("Change detector stopped");
        });
        PollerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

fn change_for(row: &ClaimRow, first_seen: bool) -> Change {
    let change_type = if row.deleted {
        ChangeType::Deleted
    } else if first_seen && row.claimed_by.is_none() {
        ChangeType::Created
    } else {
        ChangeType::Claim
    };
    let mut change = Change::bare(change_type, row.entity_id.clone());
    change.claimed_by = row.claimed_by.clone();
    change.claimed_at = row.claimed_at;
    change.source = row.source.clone();
    change
}

/// Running detector loop
pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal the loop to exit after any in-flight tick
    pub fn stop(self) {
        if self.shutdown.send(true).is_err() {
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clientsync_common::Error;
    use std::collections::VecDeque;

    /// Replays scripted responses; records every `since` it was asked for
    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Vec<ClaimRow>>>>,
        calls: Mutex<Vec<DateTime<Utc>>>,
        delay: Option<Duration>,
    }

    impl ScriptedSource {
        fn push(&self, response: Result<Vec<ClaimRow>>) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    #[async_trait]
    impl ChangeSource for ScriptedSource {
        async fn fetch_updated_since(&self, since: DateTime<Utc>) -> Result<Vec<ClaimRow>> {
            self.calls.lock().unwrap().push(since);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        changes: Mutex<Vec<Change>>,
    }

    impl ChangeSink for CollectingSink {
        fn publish(&self, change: Change) {
            self.changes.lock().unwrap().push(change);
        }
    }

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap()
    }

    fn row(
        entity: &str,
        owner: Option<&str>,
        claimed_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> ClaimRow {
        ClaimRow {
            entity_id: entity.to_string(),
            claimed_by: owner.map(str::to_string),
            claimed_at,
            updated_at,
            source: None,
            deleted: false,
        }
    }

    fn detector(source: Arc<ScriptedSource>) -> ChangeDetector {
        ChangeDetector::new(source, PollerSettings::default())
    }

    #[tokio::test]
    async fn test_unchanged_row_emits_once() {
        let source = Arc::new(ScriptedSource::default());
        source.push(Ok(vec![row("42", Some("AB"), Some(t(1)), t(1))]));
        source.push(Ok(vec![row("42", Some("AB"), Some(t(1)), t(1))]));
        let detector = detector(source.clone());
        let sink = CollectingSink::default();

        let first = detector.tick(&sink).await;
        assert_eq!(first, TickOutcome::Completed { rows: 1, published: 1 });
        assert_eq!(detector.watermark().last_polled_at, Some(t(1)));

        let second = detector.tick(&sink).await;
        assert_eq!(second, TickOutcome::Completed { rows: 1, published: 0 });
        assert_eq!(sink.changes.lock().unwrap().len(), 1);

        let calls = source.calls.lock().unwrap().clone();
        assert_eq!(calls[1], t(1));
    }

    #[tokio::test]
    async fn test_owner_change_is_published() {
        let source = Arc::new(ScriptedSource::default());
        source.push(Ok(vec![row("42", Some("AB"), Some(t(1)), t(1))]));
        source.push(Ok(vec![row("42", Some("CD"), Some(t(5)), t(5))]));
        let detector = detector(source);
        let sink = CollectingSink::default();

        detector.tick(&sink).await;
        detector.tick(&sink).await;

        let changes = sink.changes.lock().unwrap().clone();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].change_type, ChangeType::Claim);
        assert_eq!(changes[1].claimed_by.as_deref(), Some("CD"));
        assert_eq!(changes[1].claimed_at, Some(t(5)));
        assert_eq!(detector.watermark().last_polled_at, Some(t(5)));
    }

    #[tokio::test]
    async fn test_latest_row_per_entity_wins() {
        let source = Arc::new(ScriptedSource::default());
        source.push(Ok(vec![
            row("7", Some("late"), Some(t(9)), t(9)),
            row("7", Some("early"), Some(t(2)), t(2)),
        ]));
        let detector = detector(source);
        let sink = CollectingSink::default();

        detector.tick(&sink).await;
        let changes = sink.changes.lock().unwrap().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].claimed_by.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_failure_leaves_state_untouched() {
        let source = Arc::new(ScriptedSource::default());
        source.push(Ok(vec![row("1", Some("AB"), Some(t(1)), t(3))]));
        source.push(Err(Error::Internal("store offline".to_string())));
        source.push(Ok(vec![row("1", Some("AB"), Some(t(1)), t(3))]));
        let detector = detector(source.clone());
        let sink = CollectingSink::default();

        detector.tick(&sink).await;
        let before = detector.watermark();

        assert_eq!(detector.tick(&sink).await, TickOutcome::Failed);
        let after = detector.watermark();
        assert_eq!(before.last_polled_at, after.last_polled_at);
        assert_eq!(before.last_observed_state, after.last_observed_state);

        // Retry covers the same window
        detector.tick(&sink).await;
        let calls = source.calls.lock().unwrap().clone();
        assert_eq!(calls[1], calls[2]);
        assert_eq!(sink.changes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_poll_uses_safety_margin() {
        let source = Arc::new(ScriptedSource::default());
        let detector = detector(source.clone());
        let sink = CollectingSink::default();

        let before = Utc::now();
        detector.tick(&sink).await;
        let since = source.calls.lock().unwrap()[0];
        let lookback = before - since;
        assert!(lookback >= chrono::Duration::seconds(59));
        assert!(lookback <= chrono::Duration::seconds(61));
        // Empty poll keeps the sliding window
        assert!(detector.watermark().last_polled_at.is_none());
    }

    #[tokio::test]
    async fn test_change_types() {
        let source = Arc::new(ScriptedSource::default());
        let mut gone = row("3", Some("AB"), Some(t(1)), t(2));
        gone.deleted = true;
        source.push(Ok(vec![
            row("1", None, None, t(1)),
            row("2", Some("AB"), Some(t(1)), t(1)),
            gone,
        ]));
        let detector = detector(source);
        let sink = CollectingSink::default();
        detector.tick(&sink).await;

        let types: Vec<ChangeType> = sink
            .changes
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.change_type)
            .collect();
        assert_eq!(types, vec![ChangeType::Created, ChangeType::Claim, ChangeType::Deleted]);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let source = Arc::new(ScriptedSource {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let detector = Arc::new(detector(source.clone()));
        let sink = Arc::new(CollectingSink::default());

        let slow = {
            let detector = Arc::clone(&detector);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { detector.tick(sink.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(detector.tick(sink.as_ref()).await, TickOutcome::Skipped);
        assert!(matches!(slow.await.unwrap(), TickOutcome::Completed { .. }));
        assert_eq!(source.calls.lock().unwrap().len(), 1);

        // Flag cleared once the slow tick finished
        assert!(matches!(detector.tick(sink.as_ref()).await, TickOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_reset_forgets_observations() {
        let source = Arc::new(ScriptedSource::default());
        source.push(Ok(vec![row("42", Some("AB"), Some(t(1)), t(1))]));
        source.push(Ok(vec![row("42", Some("AB"), Some(t(1)), t(1))]));
        let detector = detector(source);
        let sink = CollectingSink::default();

        detector.tick(&sink).await;
        detector.reset();
        assert!(detector.watermark().last_polled_at.is_none());
        detector.tick(&sink).await;
        assert_eq!(sink.changes.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_polls_until_stopped() {
        let source = Arc::new(ScriptedSource::default());
        let detector = Arc::new(ChangeDetector::new(
            source.clone(),
            PollerSettings {
                interval: Duration::from_secs(5),
                safety_margin: Duration::from_secs(60),
            },
        ));

        let handle = Arc::clone(&detector).spawn(CollectingSink::default());
        tokio::time::sleep(Duration::from_secs(12)).await;
        let polls = source.calls.lock().unwrap().len();
        assert_eq!(polls, 3);

        handle.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.calls.lock().unwrap().len(), polls);
    }
}
