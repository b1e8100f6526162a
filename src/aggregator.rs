use crate::{
    clock::Clock,
    configuration::Configuration,
    control::{AggregatorError, ControlMessage, Controller, EnableAck},
    helper::duration_as_millis,
    instrument::{InstrumentStatus, Instrumentation, PendingQuery, Policy, Reply, Responder},
    publisher::{DataMessage, Publisher},
    value::Dimension,
    view::{self, WindowView},
};
use crossbeam_channel::{self, bounded, tick, RecvTimeoutError};
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use log::{debug, info, warn};
use std::{cmp, time::Duration};

/// The aggregation core: consumes per-host data points, merges them per
/// time bucket, and answers queries with a completeness guarantee.
///
/// All instrumentation state is owned here and touched only by the
/// single-threaded `run` loop; ingestion, query handling, and the timeout
/// sweep are run-to-completion handlers that never execute concurrently
/// with one another.
pub struct Aggregator {
    // Message plumbing.
    data_tx: crossbeam_channel::Sender<DataMessage>,
    data_rx: crossbeam_channel::Receiver<DataMessage>,
    control_tx: crossbeam_channel::Sender<ControlMessage>,
    control_rx: crossbeam_channel::Receiver<ControlMessage>,

    // Aggregation machinery.
    instruments: HashMap<String, Instrumentation, FnvBuildHasher>,
    clock: Clock,
    policy: Policy,
    request_timeout: Duration,
    sweep_interval: Duration,
    poll_delay: Duration,
}

impl Aggregator {
    pub(crate) fn from_config(conf: Configuration) -> Aggregator {
        // Create our data and control channels.
        let (data_tx, data_rx) = bounded(conf.capacity);
        let (control_tx, control_rx) = bounded(1024);

        Aggregator {
            data_tx,
            data_rx,
            control_tx,
            control_rx,
            instruments: HashMap::default(),
            clock: conf.clock,
            policy: Policy {
                retention_secs: conf.retention.as_secs(),
                source_liveness_secs: conf.source_liveness.map(|d| d.as_secs()),
                assume_monotonic_source_reporting: conf.assume_monotonic_source_reporting,
            },
            request_timeout: conf.request_timeout,
            sweep_interval: conf.sweep_interval,
            poll_delay: conf.poll_delay,
        }
    }

    /// Gets a builder to configure an `Aggregator` instance with.
    pub fn builder() -> Configuration { Configuration::default() }

    /// Creates a `Publisher` bound to this aggregator.
    pub fn get_publisher(&self) -> Publisher { Publisher::new(self.data_tx.clone()) }

    /// Creates a `Controller` bound to this aggregator.
    pub fn get_controller(&self) -> Controller { Controller::new(self.control_tx.clone()) }

    /// Run the aggregator.
    pub fn run(&mut self) {
        let sweep_rx = tick(self.sweep_interval);
        loop {
            if sweep_rx.try_recv().is_ok() {
                self.sweep();
            }

            while let Ok(msg) = self.control_rx.try_recv() {
                self.process_control_msg(msg);
            }

            match self.data_rx.recv_timeout(self.poll_delay) {
                Ok(msg) => self.ingest(msg),
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process_control_msg(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Enable {
                id,
                arity,
                routing_key,
                reply,
            } => {
                let _ = reply.send(self.enable(id, arity, routing_key));
            },
            ControlMessage::Query { id, reply } => self.query(id, reply),
            ControlMessage::Window {
                id,
                seconds,
                selected_keys,
                reply,
            } => {
                let _ = reply.send(self.window(&id, seconds, &selected_keys));
            },
            ControlMessage::Status { reply } => {
                let _ = reply.send(self.status());
            },
        }
    }

    /// Enables an instrumentation, creating empty state on first sight.
    fn enable(&mut self, id: String, arity: u8, routing_key: String) -> Result<EnableAck, AggregatorError> {
        let dimension = match Dimension::from_arity(arity) {
            Some(dimension) => dimension,
            None => return Err(AggregatorError::InvalidDimension(arity)),
        };

        if self.instruments.contains_key(&id) {
            debug!("instrumentation {} already enabled", id);
        } else {
            let since = self.clock.now_millis();
            info!(
                "instrumentation {} enabled (dimension {:?}, routing key {})",
                id, dimension, routing_key
            );
            self.instruments
                .insert(id.clone(), Instrumentation::new(id.clone(), dimension, since));
        }

        Ok(EnableAck { id })
    }

    /// Applies one inbound data message to instrumentation state.
    ///
    /// Malformed messages and messages for unknown instrumentations are
    /// upstream faults: logged and dropped, never propagated.
    fn ingest(&mut self, msg: DataMessage) {
        let (id, host, time_ms, value) = match (msg.instrumentation_id, msg.source_host, msg.time, msg.value) {
            (Some(id), Some(host), Some(time), Some(value)) => (id, host, time, value),
            _ => {
                warn!("dropping malformed data message: missing field");
                return;
            },
        };

        let instr = match self.instruments.get_mut(&id) {
            Some(instr) => instr,
            None => {
                warn!("dropping data for unknown instrumentation {}", id);
                return;
            },
        };

        let time = time_ms / 1_000;
        if instr.ingest(host, time, value, &self.policy) {
            debug!(
                "instrumentation {}: bucket {} complete with {} sources",
                id,
                time,
                instr.source_count()
            );
            instr.resolve_completed(time, &self.policy);
        }
    }

    /// Answers a latest-value query: immediately when the target bucket is
    /// already complete, by parking the request otherwise.
    fn query(&mut self, id: String, reply: Reply) {
        let instr = match self.instruments.get_mut(&id) {
            Some(instr) => instr,
            None => {
                let _ = reply.send(Err(AggregatorError::UnknownInstrumentation(id)));
                return;
            },
        };

        let now_ms = self.clock.now_millis();
        // One second of slack so the common case finds a finished bucket.
        let when = (now_ms / 1_000).saturating_sub(1);

        if instr.complete_at(when) {
            let _ = reply.send(Ok(instr.response_at(when)));
            return;
        }

        instr.pending.push(PendingQuery {
            arrived_ms: now_ms,
            requested: when,
            responder: Responder::new(reply),
        });
    }

    /// Serves a windowed view over the last `seconds` buckets.
    fn window(&self, id: &str, seconds: u64, selected_keys: &[String]) -> Result<WindowView, AggregatorError> {
        let instr = match self.instruments.get(id) {
            Some(instr) => instr,
            None => return Err(AggregatorError::UnknownInstrumentation(id.to_string())),
        };

        let end = self.clock.now_secs().saturating_sub(1);
        let start = end.saturating_sub(cmp::max(seconds, 1) - 1);

        let (raw, min_reporting) = instr.window(start, end);
        let summary = view::summarize(&raw);
        let (values, present_keys) = view::project(raw, selected_keys)?;

        Ok(WindowView {
            start,
            end,
            values,
            present_keys,
            min_reporting,
            summary,
        })
    }

    fn status(&self) -> Vec<InstrumentStatus> {
        self.instruments.values().map(|instr| instr.status()).collect()
    }

    /// Resolves parked queries that have outlived the request timeout.
    fn sweep(&mut self) {
        let now_ms = self.clock.now_millis();
        let timeout_ms = duration_as_millis(self.request_timeout);
        for instr in self.instruments.values_mut() {
            instr.sweep(now_ms, timeout_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Aggregator;
    use crate::clock::{Clock, Mock};
    use crate::control::AggregatorError;
    use crate::publisher::DataMessage;
    use crate::value::{KeyedValues, Value};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn test_aggregator(start_ms: u64) -> (Aggregator, Arc<Mock>) {
        let (clock, mock) = Clock::mock(start_ms);
        let aggregator = Aggregator::builder().clock(clock).build();
        (aggregator, mock)
    }

    fn data(id: &str, host: &str, time_ms: u64, value: Value) -> DataMessage {
        DataMessage {
            instrumentation_id: Some(id.to_string()),
            source_host: Some(host.to_string()),
            time: Some(time_ms),
            value: Some(value),
        }
    }

    fn enable(aggregator: &mut Aggregator, id: &str, arity: u8) {
        aggregator
            .enable(id.to_string(), arity, format!("data.{}", id))
            .unwrap();
    }

    #[test]
    fn test_enable_is_idempotent() {
        let (mut aggregator, _) = test_aggregator(100_000);

        enable(&mut aggregator, "reqs", 0);
        aggregator.ingest(data("reqs", "h1", 100_000, Value::Scalar(5.0)));
        enable(&mut aggregator, "reqs", 0);

        let status = aggregator.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].source_count, 1);
    }

    #[test]
    fn test_enable_rejects_bad_arity() {
        let (mut aggregator, _) = test_aggregator(100_000);
        let result = aggregator.enable("reqs".to_string(), 3, "data.reqs".to_string());
        assert_eq!(result.unwrap_err(), AggregatorError::InvalidDimension(3));
    }

    #[test]
    fn test_query_unknown_instrumentation() {
        let (mut aggregator, _) = test_aggregator(100_000);

        let (tx, rx) = mpsc::sync_channel(1);
        aggregator.query("nope".to_string(), tx);

        let result = rx.try_recv().unwrap();
        assert_eq!(
            result.unwrap_err(),
            AggregatorError::UnknownInstrumentation("nope".to_string())
        );
    }

    #[test]
    fn test_malformed_messages_dropped() {
        let (mut aggregator, _) = test_aggregator(100_000);
        enable(&mut aggregator, "reqs", 0);

        let mut msg = data("reqs", "h1", 100_000, Value::Scalar(5.0));
        msg.source_host = None;
        aggregator.ingest(msg);

        aggregator.ingest(data("other", "h1", 100_000, Value::Scalar(5.0)));

        let status = aggregator.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].source_count, 0);
    }

    #[test]
    fn test_complete_bucket_answers_synchronously() {
        let (mut aggregator, _) = test_aggregator(101_500);
        enable(&mut aggregator, "reqs", 0);

        aggregator.ingest(data("reqs", "h1", 100_250, Value::Scalar(5.0)));

        let (tx, rx) = mpsc::sync_channel(1);
        aggregator.query("reqs".to_string(), tx);

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.when, 100);
        assert_eq!(response.value, Value::Scalar(5.0));
        assert_eq!(response.reporting_count, 1);
    }

    #[test]
    fn test_parked_query_resolved_by_completion() {
        let (mut aggregator, mock) = test_aggregator(99_000);
        enable(&mut aggregator, "reqs", 0);

        // Both sources known from bucket 99.
        aggregator.ingest(data("reqs", "h1", 99_000, Value::Scalar(1.0)));
        aggregator.ingest(data("reqs", "h2", 99_100, Value::Scalar(1.0)));

        mock.increment(2_500);
        aggregator.ingest(data("reqs", "h1", 100_000, Value::Scalar(5.0)));

        let (tx, rx) = mpsc::sync_channel(1);
        aggregator.query("reqs".to_string(), tx);
        assert!(rx.try_recv().is_err());

        aggregator.ingest(data("reqs", "h2", 100_400, Value::Scalar(7.0)));

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.when, 100);
        assert_eq!(response.value, Value::Scalar(12.0));
        assert_eq!(response.reporting_count, 2);
        assert_eq!(response.source_count, 2);

        // The responder fired exactly once; a later sweep finds nothing.
        mock.increment(60_000);
        aggregator.sweep();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_parked_query_resolved_by_timeout() {
        let (mut aggregator, mock) = test_aggregator(99_000);
        enable(&mut aggregator, "reqs", 0);

        aggregator.ingest(data("reqs", "h1", 99_000, Value::Scalar(1.0)));
        aggregator.ingest(data("reqs", "h2", 99_100, Value::Scalar(1.0)));

        mock.increment(2_500);
        aggregator.ingest(data("reqs", "h1", 100_000, Value::Scalar(5.0)));

        let (tx, rx) = mpsc::sync_channel(1);
        aggregator.query("reqs".to_string(), tx);
        assert!(rx.try_recv().is_err());

        // The sweep before the timeout leaves the query parked.
        mock.increment(1_000);
        aggregator.sweep();
        assert!(rx.try_recv().is_err());

        mock.increment(4_000);
        aggregator.sweep();

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.when, 100);
        assert_eq!(response.value, Value::Scalar(5.0));
        assert_eq!(response.reporting_count, 1);
        assert_eq!(response.source_count, 2);
    }

    #[test]
    fn test_decomposition_values_merge_across_sources() {
        let (mut aggregator, _) = test_aggregator(101_500);
        enable(&mut aggregator, "latency", 1);

        let keyed = |pairs: Vec<(&str, f64)>| {
            let mut keys = KeyedValues::default();
            for (key, value) in pairs {
                keys.insert(key.to_string(), Value::Scalar(value));
            }
            Value::Decomposition(keys)
        };

        aggregator.ingest(data("latency", "h1", 100_000, keyed(vec![("a", 3.0)])));
        aggregator.ingest(data("latency", "h2", 100_000, keyed(vec![("a", 4.0), ("b", 2.0)])));

        let (tx, rx) = mpsc::sync_channel(1);
        aggregator.query("latency".to_string(), tx);

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.value, keyed(vec![("a", 7.0), ("b", 2.0)]));
    }

    #[test]
    fn test_window_over_recent_buckets() {
        let (mut aggregator, _) = test_aggregator(103_500);
        enable(&mut aggregator, "reqs", 0);

        aggregator.ingest(data("reqs", "h1", 100_000, Value::Scalar(5.0)));
        aggregator.ingest(data("reqs", "h1", 101_000, Value::Scalar(3.0)));
        aggregator.ingest(data("reqs", "h1", 102_000, Value::Scalar(9.0)));

        let view = aggregator.window("reqs", 3, &[]).unwrap();
        assert_eq!(view.start, 100);
        assert_eq!(view.end, 102);
        assert_eq!(
            view.values,
            vec![Value::Scalar(5.0), Value::Scalar(3.0), Value::Scalar(9.0)]
        );
        assert_eq!(view.min_reporting, 1);
        assert_eq!(view.summary.total, 17.0);
    }

    #[test]
    fn test_window_selective_keys_not_implemented() {
        let (mut aggregator, _) = test_aggregator(101_500);
        enable(&mut aggregator, "latency", 1);

        let mut keys = KeyedValues::default();
        keys.insert("a".to_string(), Value::Scalar(1.0));
        aggregator.ingest(data("latency", "h1", 100_000, Value::Decomposition(keys)));

        let result = aggregator.window("latency", 1, &["a".to_string()]);
        assert_eq!(result.unwrap_err(), AggregatorError::SelectiveProjection);
    }

    #[test]
    fn test_handles_roundtrip_through_run_loop() {
        let (clock, _mock) = Clock::mock(101_500);
        let mut aggregator = Aggregator::builder()
            .clock(clock)
            .poll_delay(Duration::from_millis(5))
            .build();
        let publisher = aggregator.get_publisher();
        let controller = aggregator.get_controller();

        thread::spawn(move || aggregator.run());

        // enable blocks on its acknowledgement, so the data message below
        // cannot outrun it.
        controller.enable("reqs", 0, "data.reqs").unwrap();
        publisher
            .publish("reqs", "h1", 100_250, Value::Scalar(5.0))
            .unwrap();

        // Whether the query lands before or after ingestion, completion of
        // bucket 100 produces the same answer.
        let response = controller.query("reqs").unwrap();
        assert_eq!(response.when, 100);
        assert_eq!(response.value, Value::Scalar(5.0));
        assert_eq!(response.reporting_count, 1);
        assert_eq!(response.source_count, 1);
    }

    #[test]
    fn test_status_lists_instrumentations() {
        let (mut aggregator, _) = test_aggregator(100_000);
        enable(&mut aggregator, "reqs", 0);
        enable(&mut aggregator, "latency", 1);

        aggregator.ingest(data("reqs", "h1", 100_000, Value::Scalar(5.0)));

        let mut status = aggregator.status();
        status.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(status.len(), 2);
        assert_eq!(status[0].id, "latency");
        assert_eq!(status[0].source_count, 0);
        assert_eq!(status[1].id, "reqs");
        assert_eq!(status[1].last_time, 100);
        assert_eq!(status[1].latest_value, Some(Value::Scalar(5.0)));
    }
}
