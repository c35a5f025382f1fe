// src/vm/logs.rs

//! Per-VM log history and subscriber fan-out.
//!
//! A single mutex guards both the history rings and the subscriber registry.
//! [`LogEngine::publish`] holds it for the buffer update and the fan-out, which
//! only ever uses `try_send`, so a slow consumer loses entries instead of
//! stalling the publisher.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use metrics::{gauge, increment_counter};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::config::LogsConfig;
use crate::logging::Logger;
use crate::vm::cancel::CancelToken;

/// Default number of entries retained per VM
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Default queue capacity of a subscription
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

/// One immutable line of VM diagnostic output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the line was produced
    pub timestamp: DateTime<Utc>,

    /// Severity name (`debug`, `info`, `warn`, `error`, or anything else)
    pub level: String,

    /// Free text
    pub message: String,

    /// Producer tag such as `stdout` or `supervisor`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LogEntry {
    /// Creates an entry stamped now
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Sets the source tag
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Parsed severity, if the level is one of the known names
    pub fn severity(&self) -> Option<Severity> {
        Severity::parse(&self.level)
    }
}

/// Known severities in ascending order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    /// Case-insensitive parse; `warning` is accepted as `warn`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(Severity::Debug),
            "info" => Some(Severity::Info),
            "warn" | "warning" => Some(Severity::Warn),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-subscription entry filter
///
/// Every set criterion must hold. A level that is not a known severity, on
/// either the filter or the entry, never excludes anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFilter {
    /// Minimum severity name
    #[serde(default)]
    pub min_level: Option<String>,

    /// Required substring of the message
    #[serde(default)]
    pub contains: Option<String>,

    /// Allowed sources; empty means any
    #[serde(default)]
    pub sources: HashSet<String>,
}

impl LogFilter {
    /// Filter admitting entries at or above `level`
    pub fn min_level(level: impl Into<String>) -> Self {
        Self {
            min_level: Some(level.into()),
            ..Self::default()
        }
    }

    /// Whether an entry passes every criterion
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(min) = self.min_level.as_deref().and_then(Severity::parse) {
            if let Some(level) = entry.severity() {
                if level < min {
                    return false;
                }
            }
        }

        if let Some(needle) = self.contains.as_deref() {
            if !entry.message.contains(needle) {
                return false;
            }
        }

        if !self.sources.is_empty() {
            match entry.source.as_deref() {
                Some(source) if self.sources.contains(source) => {}
                _ => return false,
            }
        }

        true
    }
}

/// Opaque subscription identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end of a subscription
///
/// The queue closes after [`LogEngine::unsubscribe`], at which point
/// [`Subscription::recv`] drains what is left and then returns `None`.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    vm_id: String,
    rx: mpsc::Receiver<Arc<LogEntry>>,
}

impl Subscription {
    /// Subscription identity
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Target VM
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    /// Next entry in arrival order
    pub async fn recv(&mut self) -> Option<Arc<LogEntry>> {
        self.rx.recv().await
    }

    /// Next entry if one is already queued
    pub fn try_recv(&mut self) -> Option<Arc<LogEntry>> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    vm_id: String,
    filter: LogFilter,
    tx: mpsc::Sender<Arc<LogEntry>>,
    done: CancelToken,
}

#[derive(Default)]
struct EngineState {
    buffers: HashMap<String, VecDeque<Arc<LogEntry>>>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
}

/// Log distribution engine
pub struct LogEngine {
    state: Mutex<EngineState>,
    history_capacity: usize,
    subscriber_capacity: usize,
    next_id: AtomicU64,
    logger: Logger,
}

impl LogEngine {
    /// Creates an engine with explicit capacities (both clamped to at least 1)
    pub fn new(history_capacity: usize, subscriber_capacity: usize, logger: Logger) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            history_capacity: history_capacity.max(1),
            subscriber_capacity: subscriber_capacity.max(1),
            next_id: AtomicU64::new(1),
            logger,
        }
    }

    /// Creates an engine from configuration
    pub fn from_config(config: &LogsConfig, logger: Logger) -> Self {
        Self::new(config.history_capacity, config.subscriber_capacity, logger)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber and replays matching history to it in the background
    ///
    /// Replay is best effort: entries that do not fit in the queue are
    /// dropped. When there is history to replay this must be called from
    /// within a tokio runtime.
    pub fn subscribe(&self, vm_id: &str, filter: LogFilter) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let done = CancelToken::new();

        let backlog: Vec<Arc<LogEntry>> = {
            let mut state = self.lock();
            let backlog = state
                .buffers
                .get(vm_id)
                .map(|buf| buf.iter().filter(|e| filter.matches(e)).cloned().collect())
                .unwrap_or_default();

            state.subscribers.insert(
                id,
                Subscriber {
                    vm_id: vm_id.to_string(),
                    filter,
                    tx: tx.clone(),
                    done: done.clone(),
                },
            );
            gauge!("agni_log_subscribers", state.subscribers.len() as f64);
            backlog
        };

        debug!(parent: self.logger.span(), vm_id, subscription = %id, replay = backlog.len(), "log subscriber registered");

        if !backlog.is_empty() {
            tokio::spawn(replay(backlog, tx, done));
        }

        Subscription {
            id,
            vm_id: vm_id.to_string(),
            rx,
        }
    }

    /// Ends a subscription and closes its queue; returns false if unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut state = self.lock();
            let removed = state.subscribers.remove(&id);
            gauge!("agni_log_subscribers", state.subscribers.len() as f64);
            removed
        };

        match removed {
            Some(sub) => {
                sub.done.cancel();
                debug!(parent: self.logger.span(), vm_id = %sub.vm_id, subscription = %id, "log subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Appends to the VM's history and fans out to matching subscribers
    pub fn publish(&self, vm_id: &str, entry: LogEntry) {
        let entry = Arc::new(entry);
        let mut state = self.lock();

        let buffer = state
            .buffers
            .entry(vm_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.history_capacity.min(64)));
        while buffer.len() >= self.history_capacity {
            buffer.pop_front();
        }
        buffer.push_back(Arc::clone(&entry));
        increment_counter!("agni_log_entries_published_total");

        let mut closed = Vec::new();
        for (id, sub) in state.subscribers.iter() {
            if sub.vm_id != vm_id || !sub.filter.matches(&entry) {
                continue;
            }
            match sub.tx.try_send(Arc::clone(&entry)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    increment_counter!("agni_log_entries_dropped_total");
                    trace!(parent: self.logger.span(), vm_id, subscription = %id, "subscriber queue full, entry dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        if !closed.is_empty() {
            for id in closed {
                if let Some(sub) = state.subscribers.remove(&id) {
                    sub.done.cancel();
                }
            }
            gauge!("agni_log_subscribers", state.subscribers.len() as f64);
        }
    }

    /// Up to `limit` most recent entries, oldest first; `0` returns everything
    pub fn get_recent_logs(&self, vm_id: &str, limit: usize) -> Vec<Arc<LogEntry>> {
        let state = self.lock();
        match state.buffers.get(vm_id) {
            Some(buffer) => {
                let take = if limit == 0 || limit > buffer.len() {
                    buffer.len()
                } else {
                    limit
                };
                buffer.iter().skip(buffer.len() - take).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Discards a VM's history
    pub fn clear_buffer(&self, vm_id: &str) {
        self.lock().buffers.remove(vm_id);
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Retention limit per VM
    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }
}

async fn replay(backlog: Vec<Arc<LogEntry>>, tx: mpsc::Sender<Arc<LogEntry>>, done: CancelToken) {
    for entry in backlog {
        if done.is_cancelled() {
            return;
        }
        match tx.try_send(entry) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn engine(history: usize, queue: usize) -> LogEngine {
        LogEngine::new(history, queue, Logger::new("logs-test"))
    }

    #[test]
    fn severity_filter_uses_fixed_ordering() {
        let filter = LogFilter::min_level("warn");
        assert!(!filter.matches(&LogEntry::new("debug", "a")));
        assert!(!filter.matches(&LogEntry::new("info", "a")));
        assert!(filter.matches(&LogEntry::new("warn", "a")));
        assert!(filter.matches(&LogEntry::new("ERROR", "a")));
        // unknown levels always pass the severity criterion
        assert!(filter.matches(&LogEntry::new("trace", "a")));
        assert!(LogFilter::min_level("loud").matches(&LogEntry::new("debug", "a")));
    }

    #[test]
    fn substring_and_source_filters() {
        let filter = LogFilter {
            contains: Some("boot".into()),
            sources: ["stdout".to_string()].into_iter().collect(),
            ..LogFilter::default()
        };

        assert!(filter.matches(&LogEntry::new("info", "booting kernel").with_source("stdout")));
        assert!(!filter.matches(&LogEntry::new("info", "booting kernel").with_source("stderr")));
        assert!(!filter.matches(&LogEntry::new("info", "booting kernel")));
        assert!(!filter.matches(&LogEntry::new("info", "ready").with_source("stdout")));
    }

    #[test]
    fn history_is_bounded_fifo() {
        let engine = engine(3, 10);
        for i in 0..5 {
            engine.publish("vm", LogEntry::new("info", format!("line {i}")));
        }

        let all = engine.get_recent_logs("vm", 0);
        let messages: Vec<_> = all.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);

        let last_two = engine.get_recent_logs("vm", 2);
        assert_eq!(last_two[0].message, "line 3");
        assert_eq!(last_two[1].message, "line 4");

        assert_eq!(engine.get_recent_logs("vm", 99).len(), 3);
        assert!(engine.get_recent_logs("other", 5).is_empty());

        engine.clear_buffer("vm");
        assert!(engine.get_recent_logs("vm", 0).is_empty());
    }

    #[tokio::test]
    async fn subscriber_receives_only_matching_entries() {
        let engine = engine(10, 10);
        let mut sub = engine.subscribe("alpha", LogFilter::min_level("warn"));

        engine.publish("alpha", LogEntry::new("info", "hello"));
        engine.publish("alpha", LogEntry::new("error", "boom"));
        engine.publish("beta", LogEntry::new("error", "elsewhere"));

        let got = sub.recv().await.unwrap();
        assert_eq!(got.message, "boom");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn subscribers_are_isolated() {
        let engine = engine(10, 10);
        let mut errors = engine.subscribe("vm", LogFilter::min_level("error"));
        let mut all = engine.subscribe("vm", LogFilter::default());

        engine.publish("vm", LogEntry::new("info", "one"));
        engine.publish("vm", LogEntry::new("error", "two"));

        assert_eq!(all.recv().await.unwrap().message, "one");
        assert_eq!(all.recv().await.unwrap().message, "two");
        assert_eq!(errors.recv().await.unwrap().message, "two");
        assert!(errors.try_recv().is_none());
    }

    #[tokio::test]
    async fn history_is_replayed_to_new_subscribers() {
        let engine = engine(10, 10);
        engine.publish("vm", LogEntry::new("info", "old info"));
        engine.publish("vm", LogEntry::new("error", "old error"));

        let mut sub = engine.subscribe("vm", LogFilter::min_level("error"));
        let got = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message, "old error");
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let engine = engine(100, 2);
        let mut sub = engine.subscribe("vm", LogFilter::default());

        for i in 0..10 {
            engine.publish("vm", LogEntry::new("info", format!("{i}")));
        }

        assert_eq!(sub.recv().await.unwrap().message, "0");
        assert_eq!(sub.recv().await.unwrap().message, "1");
        assert!(sub.try_recv().is_none());
        assert_eq!(engine.get_recent_logs("vm", 0).len(), 10);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_queue() {
        let engine = engine(10, 10);
        let mut sub = engine.subscribe("vm", LogFilter::default());
        engine.publish("vm", LogEntry::new("info", "before"));

        assert!(engine.unsubscribe(sub.id()));
        assert!(!engine.unsubscribe(sub.id()));
        assert_eq!(engine.subscriber_count(), 0);

        assert_eq!(sub.recv().await.unwrap().message, "before");
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn dropped_receivers_are_pruned_on_publish() {
        let engine = engine(10, 10);
        let sub = engine.subscribe("vm", LogFilter::default());
        drop(sub);
        assert_eq!(engine.subscriber_count(), 1);

        engine.publish("vm", LogEntry::new("info", "x"));
        assert_eq!(engine.subscriber_count(), 0);
    }

    proptest! {
        #[test]
        fn entry_visible_until_capacity_newer_entries_arrive(capacity in 1usize..20, after in 0usize..40) {
            let engine = engine(capacity, 1);
            engine.publish("vm", LogEntry::new("info", "marker"));
            for i in 0..after {
                engine.publish("vm", LogEntry::new("info", format!("filler {i}")));
            }

            let window = engine.get_recent_logs("vm", after + 1);
            let present = window.iter().any(|e| e.message == "marker");
            prop_assert_eq!(present, after < capacity);
            prop_assert!(engine.get_recent_logs("vm", 0).len() <= capacity);
        }
    }
}
