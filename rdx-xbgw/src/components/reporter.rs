//! The data-point reporter.
//!
//! [`DataPointReporter`] turns every message carrying a `value` into a
//! [`DataPoint`] and queues it for a worker thread, which uploads batches to a
//! [`Collector`]. Uploads are spaced by a rate limit and retried with a
//! doubling backoff; a batch that still fails is logged and dropped.

use crate::bus::{Message, MessageBus};
use crate::common::{SubscriptionId, Topic, Value};
use crate::components::{Reporter, ShutdownReport};
use crate::error::{BusError, ConfigError, DeliveryFailure};
use crate::settings::{SettingsGroup, SettingsRegistry};
use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Where [`LogCollector`] pretends to upload to.
pub const UPLOAD_PATH: &str = "DataPoint/upload.csv";

const CSV_HEADER: &str = "#TIMESTAMP,DATA,DATATYPE,STREAMID";

/// Bounded retry with doubling backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// The wait after failed attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Settings of the `devicecloud` group.
#[derive(Debug, Clone, PartialEq)]
pub struct ReporterSettings {
    /// Upload serial data base64-encoded instead of as text.
    pub encode_serial: bool,
    /// Minimum spacing between uploads.
    pub rate_limit: Duration,
    pub retry: RetryPolicy,
    pub max_queue_size: usize,
    pub max_per_upload: usize,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self {
            encode_serial: false,
            rate_limit: Duration::from_secs(5),
            retry: RetryPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_secs(5),
                max_backoff: Duration::from_secs(60),
            },
            max_queue_size: 5000,
            // The collector counts the header line too.
            max_per_upload: 249,
        }
    }
}

impl SettingsGroup for ReporterSettings {
    const GROUP: &'static str = "devicecloud";

    fn defaults() -> Vec<(&'static str, Value)> {
        let d = Self::default();
        vec![
            ("encode_serial", d.encode_serial.into()),
            ("rate_limit_secs", (d.rate_limit.as_secs() as i64).into()),
            ("retry_count", i64::from(d.retry.max_retries).into()),
            (
                "retry_backoff_secs",
                (d.retry.initial_backoff.as_secs() as i64).into(),
            ),
            ("max_backoff_secs", (d.retry.max_backoff.as_secs() as i64).into()),
            ("max_queue_size", (d.max_queue_size as i64).into()),
            ("max_per_upload", (d.max_per_upload as i64).into()),
        ]
    }

    fn from_registry(registry: &SettingsRegistry) -> Result<Self, ConfigError> {
        let g = Self::GROUP;
        let positive = |key: &str| -> Result<usize, ConfigError> {
            let raw = registry.get_u64(g, key)?;
            match usize::try_from(raw) {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(ConfigError::OutOfRange {
                    group: g.to_string(),
                    key: key.to_string(),
                    reason: format!("{} must be a positive count", raw),
                }),
            }
        };
        let retry_count = registry.get_u64(g, "retry_count")?;
        Ok(Self {
            encode_serial: registry.get_bool(g, "encode_serial")?,
            rate_limit: registry.get_secs(g, "rate_limit_secs")?,
            retry: RetryPolicy {
                max_retries: u32::try_from(retry_count).map_err(|_| ConfigError::OutOfRange {
                    group: g.to_string(),
                    key: "retry_count".to_string(),
                    reason: format!("{} is too large", retry_count),
                })?,
                initial_backoff: registry.get_secs(g, "retry_backoff_secs")?,
                max_backoff: registry.get_secs(g, "max_backoff_secs")?,
            },
            max_queue_size: positive("max_queue_size")?,
            max_per_upload: positive("max_per_upload")?,
        })
    }
}

/// The collector's type tag for a data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Double,
    String,
    Unknown,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Double => "DOUBLE",
            DataType::String => "STRING",
            DataType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a topic to a stream name the collector accepts.
///
/// Segments are joined with `/`; any character outside
/// `_ - [ ] : a-z A-Z 0-9 . ! /` becomes `-`.
pub fn stream_id(topic: &Topic) -> String {
    let joined = topic.segments().collect::<Vec<_>>().join("/");
    let mut escaped = 0;
    let stream: String = joined
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "_-[]:.!/".contains(c) {
                c
            } else {
                escaped += 1;
                '-'
            }
        })
        .collect();
    if escaped > 0 {
        warn!(
            "Escaped {} invalid stream name character(s) in {}",
            escaped, joined
        );
    }
    stream
}

/// One timestamped reading bound for the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub stream_id: String,
    pub value: Value,
}

impl DataPoint {
    /// Builds a point for a `value` received on `topic`, stamped now.
    ///
    /// Booleans are reported as 0/1. Bytes become text: base64 when
    /// `encode_serial` is set, else decoded as UTF-8 with replacement.
    pub fn from_reading(topic: &Topic, value: &Value, encode_serial: bool) -> Self {
        let value = match value {
            Value::Bool(b) => Value::Int(i64::from(*b)),
            Value::Bytes(bytes) if encode_serial => Value::Str(BASE64.encode(bytes)),
            Value::Bytes(bytes) => Value::Str(String::from_utf8_lossy(bytes).into_owned()),
            other => other.clone(),
        };
        Self {
            timestamp: Utc::now(),
            stream_id: stream_id(topic),
            value,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self.value {
            Value::Int(_) | Value::Bool(_) => DataType::Integer,
            Value::Float(_) => DataType::Double,
            Value::Str(_) | Value::Bytes(_) => DataType::String,
            Value::List(_) => DataType::Unknown,
        }
    }

    pub fn csv_line(&self) -> String {
        format!(
            "{},{},{},{}",
            self.timestamp.timestamp_millis(),
            self.value,
            self.data_type(),
            self.stream_id
        )
    }
}

/// Renders an upload body: a header line, then one line per point.
pub fn render_csv(points: &[DataPoint]) -> String {
    std::iter::once(CSV_HEADER.to_string())
        .chain(points.iter().map(DataPoint::csv_line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The remote end of a reporter.
pub trait Collector: Send {
    /// Delivers one batch. Blocking is fine: this runs on the worker thread.
    fn deliver(&mut self, points: &[DataPoint]) -> Result<(), DeliveryFailure>;
}

/// A collector that writes each upload body to the log.
#[derive(Debug, Default)]
pub struct LogCollector {
    uploads: u64,
}

impl LogCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }
}

impl Collector for LogCollector {
    fn deliver(&mut self, points: &[DataPoint]) -> Result<(), DeliveryFailure> {
        self.uploads += 1;
        info!("Uploading {} datapoints to {}", points.len(), UPLOAD_PATH);
        for line in render_csv(points).lines() {
            info!("  {}", line);
        }
        Ok(())
    }
}

/// Live counters of a [`DataPointReporter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReporterStats {
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
    /// Delivery attempts, retries included.
    pub attempts: u64,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<DataPoint>,
    /// Set once shutdown is requested.
    deadline: Option<Instant>,
    delivered: u64,
    dropped: u64,
    attempts: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl Shared {
    fn accept(&self, message: &Message, encode_serial: bool, max_queue_size: usize) {
        let Some(value) = message.payload().get("value") else {
            debug!("No value in message on {}, not reporting it", message.topic());
            return;
        };
        let point = DataPoint::from_reading(message.topic(), value, encode_serial);
        trace!(stream = %point.stream_id, "Queued datapoint");

        let mut state = self.state.lock();
        if state.deadline.is_some() {
            warn!("Reporter shutting down, discarding datapoint for {}", point.stream_id);
            return;
        }
        if state.queue.len() >= max_queue_size {
            error!("Max queue size exceeded, purging queue");
            state.dropped += state.queue.len() as u64;
            state.queue.clear();
        }
        state.queue.push_back(point);
        self.cond.notify_all();
    }

    /// Sleeps for `delay` unless shutdown ends first. Returns `false` if the
    /// sleep would run past the shutdown deadline.
    fn pause(&self, delay: Duration) -> bool {
        let wake_at = Instant::now() + delay;
        let mut state = self.state.lock();
        loop {
            if matches!(state.deadline, Some(deadline) if wake_at > deadline) {
                return false;
            }
            if Instant::now() >= wake_at {
                return true;
            }
            self.cond.wait_until(&mut state, wake_at);
        }
    }

    fn stats(&self) -> ReporterStats {
        let state = self.state.lock();
        ReporterStats {
            queued: state.queue.len(),
            delivered: state.delivered,
            dropped: state.dropped,
            attempts: state.attempts,
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    collector: Box<dyn Collector>,
    settings: ReporterSettings,
    last_upload: Instant,
}

impl Worker {
    fn run(mut self) {
        debug!("Reporter worker started");
        while let Some(batch) = self.next_batch() {
            let count = batch.len() as u64;
            info!("Upload contains {} datapoints", count);
            let delivered = self.upload(&batch);
            self.last_upload = Instant::now();

            let mut state = self.shared.state.lock();
            if delivered {
                state.delivered += count;
            } else {
                state.dropped += count;
            }
        }
        debug!("Reporter worker finished");
    }

    /// Waits for work and the rate limit. `None` once shutdown is complete.
    fn next_batch(&mut self) -> Option<Vec<DataPoint>> {
        let mut state = self.shared.state.lock();
        loop {
            let deadline = state.deadline;
            match deadline {
                Some(_) if state.queue.is_empty() => return None,
                Some(deadline) if Instant::now() >= deadline => {
                    let lost = state.queue.len();
                    error!("Shutdown grace period over, dropping {} queued datapoints", lost);
                    state.dropped += lost as u64;
                    state.queue.clear();
                    return None;
                }
                // Shutting down: no rate limit.
                Some(_) => break,
                None if state.queue.is_empty() => self.shared.cond.wait(&mut state),
                None => {
                    let next = self.last_upload + self.settings.rate_limit;
                    if Instant::now() >= next {
                        break;
                    }
                    self.shared.cond.wait_until(&mut state, next);
                }
            }
        }
        let count = state.queue.len().min(self.settings.max_per_upload.max(1));
        Some(state.queue.drain(..count).collect())
    }

    /// Returns `true` if the batch was delivered.
    fn upload(&mut self, batch: &[DataPoint]) -> bool {
        let retry = self.settings.retry;
        let mut attempt = 0;
        loop {
            self.shared.state.lock().attempts += 1;
            match self.collector.deliver(batch) {
                Ok(()) => {
                    info!("Upload successful");
                    return true;
                }
                Err(failure) if !failure.is_retryable() => {
                    warn!("Unexpected collector error, data lost: {}", failure);
                    return false;
                }
                Err(failure) => {
                    if attempt >= retry.max_retries {
                        error!("Exceeded retries, data lost: {}", failure);
                        return false;
                    }
                    let delay = retry.backoff(attempt);
                    attempt += 1;
                    warn!("{}; retrying in {:?}", failure, delay);
                    if !self.shared.pause(delay) {
                        error!("Shutdown deadline before next retry, data lost: {}", failure);
                        return false;
                    }
                }
            }
        }
    }
}

/// Reads a [`DataPointReporter`]'s counters from anywhere.
#[derive(Clone)]
pub struct StatsProbe(Arc<Shared>);

impl StatsProbe {
    pub fn stats(&self) -> ReporterStats {
        self.0.stats()
    }
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    /// Disconnects when the worker exits.
    done: Receiver<()>,
}

/// Reports bus messages as data points through a [`Collector`].
pub struct DataPointReporter {
    settings: ReporterSettings,
    shared: Arc<Shared>,
    subscriptions: BTreeMap<String, SubscriptionId>,
    worker: Option<WorkerHandle>,
}

impl DataPointReporter {
    /// Creates the reporter and starts its worker thread.
    pub fn new(settings: ReporterSettings, collector: Box<dyn Collector>) -> anyhow::Result<Self> {
        info!("Initializing DataPointReporter");
        let shared = Arc::new(Shared::default());
        let (done_tx, done) = crossbeam_channel::bounded::<()>(1);
        let worker = Worker {
            shared: shared.clone(),
            collector,
            settings: settings.clone(),
            last_upload: Instant::now(),
        };
        let thread = std::thread::Builder::new()
            .name("xbgw-reporter".to_string())
            .spawn(move || {
                let _done = done_tx;
                worker.run();
            })
            .context("failed to spawn reporter worker")?;
        Ok(Self {
            settings,
            shared,
            subscriptions: BTreeMap::new(),
            worker: Some(WorkerHandle { thread, done }),
        })
    }

    pub fn stats(&self) -> ReporterStats {
        self.shared.stats()
    }

    /// A handle for reading the stats after the reporter has been boxed.
    pub fn stats_probe(&self) -> StatsProbe {
        StatsProbe(self.shared.clone())
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }
}

impl Reporter for DataPointReporter {
    fn name(&self) -> &str {
        "devicecloud"
    }

    fn start_reporting(&mut self, bus: &MessageBus, topic: &str) -> Result<(), BusError> {
        if self.subscriptions.contains_key(topic) {
            debug!("Already reporting {}", topic);
            return Ok(());
        }
        let shared = self.shared.clone();
        let encode_serial = self.settings.encode_serial;
        let max_queue_size = self.settings.max_queue_size;
        let id = bus.subscribe(topic, move |message: &Message| {
            shared.accept(message, encode_serial, max_queue_size);
            Ok(())
        })?;
        info!("Reporting {}", topic);
        self.subscriptions.insert(topic.to_string(), id);
        Ok(())
    }

    fn stop_reporting(&mut self, bus: &MessageBus, topic: &str) -> bool {
        match self.subscriptions.remove(topic) {
            Some(id) => bus.unsubscribe(id),
            None => false,
        }
    }

    fn shutdown(&mut self, grace: Duration) -> ShutdownReport {
        let deadline = {
            let mut state = self.shared.state.lock();
            let deadline = *state.deadline.get_or_insert(Instant::now() + grace);
            self.shared.cond.notify_all();
            deadline
        };

        let mut detached = false;
        if let Some(worker) = self.worker.take() {
            info!("Flushing reporter queue within {:?}", grace);
            match worker.done.recv_deadline(deadline) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Reporter worker still busy after the grace period, detaching it");
                    detached = true;
                }
                _ => {
                    if worker.thread.join().is_err() {
                        error!("Reporter worker panicked");
                    }
                }
            }
        }

        let mut state = self.shared.state.lock();
        if !state.queue.is_empty() {
            let lost = state.queue.len();
            warn!("Dropping {} datapoints left in the reporter queue", lost);
            state.dropped += lost as u64;
            state.queue.clear();
        }
        ShutdownReport {
            delivered: state.delivered,
            dropped: state.dropped,
            detached,
        }
    }
}

impl Drop for DataPointReporter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            // Never shut down: let the worker exit without flushing.
            let mut state = self.shared.state.lock();
            state.deadline.get_or_insert_with(Instant::now);
            self.shared.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Payload;
    use chrono::TimeZone;

    #[derive(Clone, Default)]
    struct Scripted {
        batches: Arc<Mutex<Vec<Vec<DataPoint>>>>,
        script: Arc<Mutex<VecDeque<Result<(), DeliveryFailure>>>>,
        fallback: Option<DeliveryFailure>,
        delay: Duration,
    }

    impl Collector for Scripted {
        fn deliver(&mut self, points: &[DataPoint]) -> Result<(), DeliveryFailure> {
            std::thread::sleep(self.delay);
            self.batches.lock().push(points.to_vec());
            match self.script.lock().pop_front() {
                Some(outcome) => outcome,
                None => self.fallback.clone().map_or(Ok(()), Err),
            }
        }
    }

    fn settings(max_per_upload: usize) -> ReporterSettings {
        ReporterSettings {
            // Long enough that points pile up until shutdown.
            rate_limit: Duration::from_secs(60),
            retry: RetryPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
            },
            max_per_upload,
            ..ReporterSettings::default()
        }
    }

    fn feed(reporter: &mut DataPointReporter, count: i64) -> MessageBus {
        let bus = MessageBus::new();
        reporter.start_reporting(&bus, "xbee.sample").unwrap();
        for n in 0..count {
            bus.publish(
                "xbee.sample.analog.dev1.ad0",
                Payload::new().with("value", n),
            )
            .unwrap();
        }
        bus
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
        };
        let delays: Vec<_> = (0..5).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60]);
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn stream_ids_join_segments_and_escape() {
        let topic = Topic::new("xbee.sample.analog.0013A200400A0B0C.ad1").unwrap();
        assert_eq!(stream_id(&topic), "xbee/sample/analog/0013A200400A0B0C/ad1");
        let odd = Topic::new("sensor.temp(c).[1]!").unwrap();
        assert_eq!(stream_id(&odd), "sensor/temp-c-/[1]!");
    }

    #[test]
    fn values_are_typed_for_upload() {
        let topic = Topic::new("a.b").unwrap();
        let point = |value: Value, encode| DataPoint::from_reading(&topic, &value, encode);

        let flag = point(Value::Bool(true), false);
        assert_eq!((flag.value.clone(), flag.data_type()), (Value::Int(1), DataType::Integer));
        assert_eq!(point(Value::Float(2.5), false).data_type(), DataType::Double);
        assert_eq!(
            point(Value::Bytes(b"hi".to_vec()), true).value,
            Value::Str("aGk=".into())
        );
        let raw = point(Value::Bytes(b"hi".to_vec()), false);
        assert_eq!((raw.value.clone(), raw.data_type()), (Value::Str("hi".into()), DataType::String));
        assert_eq!(point(Value::List(vec![]), false).data_type(), DataType::Unknown);
    }

    #[test]
    fn csv_body_has_header_and_millisecond_timestamps() {
        let point = DataPoint {
            timestamp: Utc.timestamp_millis_opt(1_500_000_000_123).unwrap(),
            stream_id: "a/b".to_string(),
            value: Value::Int(7),
        };
        assert_eq!(
            render_csv(&[point]),
            "#TIMESTAMP,DATA,DATATYPE,STREAMID\n1500000000123,7,INTEGER,a/b"
        );
    }

    #[test]
    fn settings_come_from_the_registry() {
        let mut registry = SettingsRegistry::new();
        registry.register::<ReporterSettings>().unwrap();
        let defaults = ReporterSettings::from_registry(&registry).unwrap();
        assert_eq!(defaults, ReporterSettings::default());

        let mut overrides = BTreeMap::new();
        overrides.insert("max_per_upload".to_string(), Value::Int(0));
        registry
            .apply_overrides(ReporterSettings::GROUP, &overrides)
            .unwrap();
        assert!(matches!(
            ReporterSettings::from_registry(&registry),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn shutdown_flushes_in_bounded_batches() {
        let collector = Scripted::default();
        let mut reporter =
            DataPointReporter::new(settings(2), Box::new(collector.clone())).unwrap();
        let bus = feed(&mut reporter, 5);
        assert_eq!(reporter.stats().queued, 5);

        let report = reporter.shutdown(Duration::from_secs(5));
        assert_eq!(
            report,
            ShutdownReport {
                delivered: 5,
                dropped: 0,
                detached: false
            }
        );
        let sizes: Vec<_> = collector.batches.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let first = &collector.batches.lock()[0][0];
        assert_eq!(first.stream_id, "xbee/sample/analog/dev1/ad0");
        assert_eq!(first.value, Value::Int(0));

        // Late messages are refused.
        bus.publish("xbee.sample.x", Payload::new().with("value", 1i64))
            .unwrap();
        assert_eq!(reporter.stats().queued, 0);
    }

    #[test]
    fn throttled_upload_is_retried_with_the_batch_intact() {
        let collector = Scripted::default();
        collector
            .script
            .lock()
            .push_back(Err(DeliveryFailure::Throttled("slow down".into())));
        let mut reporter =
            DataPointReporter::new(settings(10), Box::new(collector.clone())).unwrap();
        feed(&mut reporter, 3);

        let report = reporter.shutdown(Duration::from_secs(5));
        assert_eq!(report.delivered, 3);
        assert_eq!(reporter.stats().attempts, 2);
        let batches = collector.batches.lock();
        assert_eq!(batches[0], batches[1]);
    }

    #[test]
    fn rejected_upload_is_dropped_without_retry() {
        let collector = Scripted {
            fallback: Some(DeliveryFailure::Rejected("bad body".into())),
            ..Scripted::default()
        };
        let mut reporter = DataPointReporter::new(settings(10), Box::new(collector)).unwrap();
        feed(&mut reporter, 4);

        let report = reporter.shutdown(Duration::from_secs(5));
        assert_eq!((report.delivered, report.dropped), (0, 4));
        assert_eq!(reporter.stats().attempts, 1);
    }

    #[test]
    fn persistent_failure_gives_up_after_max_retries() {
        let collector = Scripted {
            fallback: Some(DeliveryFailure::Transport("down".into())),
            ..Scripted::default()
        };
        let mut reporter = DataPointReporter::new(settings(10), Box::new(collector)).unwrap();
        feed(&mut reporter, 1);

        let report = reporter.shutdown(Duration::from_secs(5));
        assert_eq!(report.dropped, 1);
        assert_eq!(reporter.stats().attempts, 4);
    }

    #[test]
    fn full_queue_is_purged() {
        let mut reporter = DataPointReporter::new(
            ReporterSettings {
                max_queue_size: 3,
                ..settings(10)
            },
            Box::new(Scripted::default()),
        )
        .unwrap();
        feed(&mut reporter, 4);
        let stats = reporter.stats();
        assert_eq!((stats.queued, stats.dropped), (1, 3));
        reporter.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn stuck_collector_is_detached_at_the_deadline() {
        let collector = Scripted {
            delay: Duration::from_secs(2),
            ..Scripted::default()
        };
        let mut reporter = DataPointReporter::new(settings(10), Box::new(collector)).unwrap();
        feed(&mut reporter, 1);

        let started = Instant::now();
        let report = reporter.shutdown(Duration::from_millis(100));
        assert!(report.detached);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stop_reporting_unsubscribes() {
        let mut reporter =
            DataPointReporter::new(settings(10), Box::new(Scripted::default())).unwrap();
        let bus = feed(&mut reporter, 1);
        assert_eq!(reporter.topics().collect::<Vec<_>>(), vec!["xbee.sample"]);
        assert!(reporter.stop_reporting(&bus, "xbee.sample"));
        assert!(!reporter.stop_reporting(&bus, "xbee.sample"));
        assert_eq!(bus.subscription_count(), 0);
        reporter.shutdown(Duration::from_secs(1));
    }
}
