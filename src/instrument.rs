use crate::{
    control::AggregatorError,
    value::{merge_value, Dimension, Value},
};
use fnv::FnvHashMap;
use log::debug;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::hash_map::Entry;
use std::{cmp, mem, sync::mpsc};

/// Ingest-time policy knobs, fixed at aggregator construction.
#[derive(Clone, Debug)]
pub(crate) struct Policy {
    /// Buckets older than this many seconds behind the newest one are
    /// evicted.
    pub(crate) retention_secs: u64,

    /// When set, a source that has not reported within this many seconds is
    /// left out of the completeness denominator of newly opened buckets.
    /// `None` means sources never expire.
    pub(crate) source_liveness_secs: Option<u64>,

    /// Resolve a parked query when any later bucket completes, on the
    /// assumption that sources report buckets in order: a source done with
    /// bucket `t` is done with every bucket before `t`. Switching this off
    /// restricts resolution to exact-bucket completion.
    pub(crate) assume_monotonic_source_reporting: bool,
}

/// Reply sent for a raw value query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResponse {
    /// The time bucket the query asked about.
    pub when: u64,
    /// Distinct sources known to this instrumentation.
    pub source_count: usize,
    /// The merged value at `when`, or the dimension-appropriate empty value
    /// if nothing was reported.
    pub value: Value,
    /// Contributions received for `when`; less than `source_count` marks a
    /// potentially incomplete answer.
    pub reporting_count: usize,
}

impl Serialize for QueryResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("when", &self.when)?;
        map.serialize_entry("sourceCount", &self.source_count)?;
        map.serialize_entry("value", &self.value)?;
        map.serialize_entry("reportingCount", &self.reporting_count)?;
        map.end()
    }
}

/// Operational snapshot of one instrumentation, for status queries.
#[derive(Clone, Debug)]
pub struct InstrumentStatus {
    pub id: String,
    pub since: u64,
    pub source_count: usize,
    pub last_time: u64,
    pub latest_value: Option<Value>,
}

impl Serialize for InstrumentStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(5))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("since", &self.since)?;
        map.serialize_entry("sourceCount", &self.source_count)?;
        map.serialize_entry("lastTime", &self.last_time)?;
        map.serialize_entry("latestValue", &self.latest_value)?;
        map.end()
    }
}

pub(crate) type Reply = mpsc::SyncSender<Result<QueryResponse, AggregatorError>>;

/// Delivers a query response at most once, no matter which of the ingest
/// path or the timeout sweep gets there first.
pub(crate) struct Responder {
    reply: Option<Reply>,
}

impl Responder {
    pub(crate) fn new(reply: Reply) -> Responder { Responder { reply: Some(reply) } }

    /// Sends `response` unless this responder already fired. Returns whether
    /// this call delivered it.
    pub(crate) fn resolve(&mut self, response: QueryResponse) -> bool {
        match self.reply.take() {
            Some(tx) => {
                let _ = tx.send(Ok(response));
                true
            },
            None => false,
        }
    }
}

/// A query parked until its bucket completes or the request times out.
pub(crate) struct PendingQuery {
    pub(crate) arrived_ms: u64,
    pub(crate) requested: u64,
    pub(crate) responder: Responder,
}

/// One merged time bucket.
#[derive(Debug)]
struct BucketRecord {
    value: Value,
    /// Contributions received so far.
    count: usize,
    /// Completeness denominator, snapshotted when the bucket was opened so
    /// later source arrivals cannot retroactively reopen other buckets.
    expected: usize,
}

impl BucketRecord {
    fn is_complete(&self) -> bool { self.count >= self.expected }
}

/// The mutable record for one fleet-wide instrumentation: known sources,
/// per-time-bucket merged values, and outstanding queries.
///
/// Owned exclusively by the aggregator and mutated only by its
/// single-threaded handlers.
pub(crate) struct Instrumentation {
    pub(crate) id: String,
    pub(crate) dimension: Dimension,
    pub(crate) since_ms: u64,
    sources: FnvHashMap<String, u64>,
    values_by_time: FnvHashMap<u64, BucketRecord>,
    pub(crate) last_time: u64,
    pub(crate) pending: Vec<PendingQuery>,
}

impl Instrumentation {
    pub(crate) fn new(id: String, dimension: Dimension, since_ms: u64) -> Instrumentation {
        Instrumentation {
            id,
            dimension,
            since_ms,
            sources: FnvHashMap::default(),
            values_by_time: FnvHashMap::default(),
            last_time: 0,
            pending: Vec::new(),
        }
    }

    pub(crate) fn source_count(&self) -> usize { self.sources.len() }

    /// Applies one data point. Returns true when the targeted bucket is
    /// complete afterwards.
    pub(crate) fn ingest(&mut self, host: String, time: u64, value: Value, policy: &Policy) -> bool {
        self.last_time = cmp::max(self.last_time, time);

        let is_new_source = !self.sources.contains_key(&host);
        self.sources.insert(host, time);
        let expected_at_open = self.live_source_count(time, policy);

        let complete = match self.values_by_time.entry(time) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.count += 1;
                if is_new_source {
                    // The new source belongs to this bucket's contributing
                    // set even though the bucket predates it.
                    record.expected += 1;
                } else if record.count > record.expected {
                    // A source outside the open-time snapshot came back.
                    record.expected = record.count;
                }
                merge_value(&mut record.value, value);
                record.is_complete()
            },
            Entry::Vacant(entry) => {
                let record = BucketRecord {
                    value,
                    count: 1,
                    expected: expected_at_open,
                };
                let complete = record.is_complete();
                entry.insert(record);
                complete
            },
        };

        let count = self.values_by_time[&time].count;
        assert!(
            count <= self.sources.len(),
            "instrumentation {}: bucket {} has {} contributions from {} known sources",
            self.id,
            time,
            count,
            self.sources.len()
        );

        self.evict(policy);
        complete
    }

    /// Number of sources counted toward completeness for a bucket opened at
    /// `time`. Without a liveness window every source ever seen counts.
    fn live_source_count(&self, time: u64, policy: &Policy) -> usize {
        match policy.source_liveness_secs {
            None => self.sources.len(),
            Some(window) => self
                .sources
                .values()
                .filter(|&&last| time.saturating_sub(last) <= window)
                .count(),
        }
    }

    fn evict(&mut self, policy: &Policy) {
        let horizon = self.last_time.saturating_sub(policy.retention_secs);
        self.values_by_time.retain(|&time, _| time >= horizon);
    }

    pub(crate) fn complete_at(&self, time: u64) -> bool {
        self.values_by_time
            .get(&time)
            .map(|record| record.is_complete())
            .unwrap_or(false)
    }

    /// Builds the response payload for `requested`, complete or not; the one
    /// construction shared by the synchronous path, bucket completion, and
    /// the timeout sweep.
    pub(crate) fn response_at(&self, requested: u64) -> QueryResponse {
        let record = self.values_by_time.get(&requested);
        QueryResponse {
            when: requested,
            source_count: self.sources.len(),
            value: record
                .map(|r| r.value.clone())
                .unwrap_or_else(|| self.dimension.empty_value()),
            reporting_count: record.map(|r| r.count).unwrap_or(0),
        }
    }

    /// Resolves parked queries satisfied by the completion of bucket `time`,
    /// each at its own requested time.
    pub(crate) fn resolve_completed(&mut self, time: u64, policy: &Policy) {
        let pending = mem::replace(&mut self.pending, Vec::new());
        for mut query in pending {
            let satisfied = if policy.assume_monotonic_source_reporting {
                query.requested <= time
            } else {
                query.requested == time
            };

            if satisfied {
                let response = self.response_at(query.requested);
                debug!(
                    "instrumentation {}: query for bucket {} resolved by completion of {}",
                    self.id, query.requested, time
                );
                query.responder.resolve(response);
            } else {
                self.pending.push(query);
            }
        }
    }

    /// Resolves parked queries that have waited at least `timeout_ms`, using
    /// whatever data exists; a short reporting count tells the caller the
    /// answer may be incomplete.
    pub(crate) fn sweep(&mut self, now_ms: u64, timeout_ms: u64) {
        let pending = mem::replace(&mut self.pending, Vec::new());
        for mut query in pending {
            if now_ms.saturating_sub(query.arrived_ms) >= timeout_ms {
                let response = self.response_at(query.requested);
                debug!(
                    "instrumentation {}: query for bucket {} timed out",
                    self.id, query.requested
                );
                query.responder.resolve(response);
            } else {
                self.pending.push(query);
            }
        }
    }

    /// Per-bucket values and the minimum reporting count for the window
    /// `[start, end]`, oldest first; absent buckets yield the empty value
    /// and a reporting count of zero.
    pub(crate) fn window(&self, start: u64, end: u64) -> (Vec<Value>, usize) {
        let mut values = Vec::with_capacity((end - start + 1) as usize);
        let mut min_reporting = usize::max_value();
        for time in start..=end {
            match self.values_by_time.get(&time) {
                Some(record) => {
                    values.push(record.value.clone());
                    min_reporting = cmp::min(min_reporting, record.count);
                },
                None => {
                    values.push(self.dimension.empty_value());
                    min_reporting = 0;
                },
            }
        }
        (values, min_reporting)
    }

    pub(crate) fn status(&self) -> InstrumentStatus {
        InstrumentStatus {
            id: self.id.clone(),
            since: self.since_ms,
            source_count: self.sources.len(),
            last_time: self.last_time,
            latest_value: self.values_by_time.get(&self.last_time).map(|r| r.value.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Instrumentation, PendingQuery, Policy, Responder};
    use crate::value::{Dimension, Value};
    use std::sync::mpsc;

    fn policy() -> Policy {
        Policy {
            retention_secs: 600,
            source_liveness_secs: None,
            assume_monotonic_source_reporting: true,
        }
    }

    fn scalar_instrument() -> Instrumentation {
        Instrumentation::new("cpu.busy".to_string(), Dimension::Scalar, 1_000)
    }

    #[test]
    fn test_two_source_bucket_merges_and_completes() {
        let mut instr = scalar_instrument();
        let policy = policy();

        // Register both sources in an earlier bucket.
        instr.ingest("h1".to_string(), 99, Value::Scalar(1.0), &policy);
        instr.ingest("h2".to_string(), 99, Value::Scalar(1.0), &policy);

        let complete = instr.ingest("h1".to_string(), 100, Value::Scalar(5.0), &policy);
        assert!(!complete);

        let complete = instr.ingest("h2".to_string(), 100, Value::Scalar(7.0), &policy);
        assert!(complete);

        let response = instr.response_at(100);
        assert_eq!(response.value, Value::Scalar(12.0));
        assert_eq!(response.reporting_count, 2);
        assert_eq!(response.source_count, 2);
    }

    #[test]
    fn test_single_source_bucket_completes_immediately() {
        let mut instr = scalar_instrument();
        assert!(instr.ingest("h1".to_string(), 100, Value::Scalar(5.0), &policy()));
        assert!(instr.complete_at(100));
    }

    #[test]
    fn test_last_time_tracks_maximum() {
        let mut instr = scalar_instrument();
        let policy = policy();

        instr.ingest("h1".to_string(), 100, Value::Scalar(1.0), &policy);
        instr.ingest("h1".to_string(), 95, Value::Scalar(1.0), &policy);

        assert_eq!(instr.last_time, 100);
    }

    #[test]
    #[should_panic(expected = "contributions from")]
    fn test_double_report_violates_invariant() {
        let mut instr = scalar_instrument();
        let policy = policy();

        instr.ingest("h1".to_string(), 100, Value::Scalar(1.0), &policy);
        instr.ingest("h1".to_string(), 100, Value::Scalar(1.0), &policy);
    }

    #[test]
    fn test_new_source_joins_open_bucket() {
        let mut instr = scalar_instrument();
        let policy = policy();

        // h1 alone opens bucket 100, which is then complete.
        instr.ingest("h1".to_string(), 100, Value::Scalar(5.0), &policy);
        assert!(instr.complete_at(100));

        // A brand-new source contributing to the same bucket grows its
        // denominator along with its count, so the bucket stays complete.
        let complete = instr.ingest("h2".to_string(), 100, Value::Scalar(7.0), &policy);
        assert!(complete);

        let response = instr.response_at(100);
        assert_eq!(response.value, Value::Scalar(12.0));
        assert_eq!(response.reporting_count, 2);
    }

    #[test]
    fn test_completed_bucket_survives_later_source_arrival() {
        let mut instr = scalar_instrument();
        let policy = policy();

        instr.ingest("h1".to_string(), 100, Value::Scalar(5.0), &policy);
        assert!(instr.complete_at(100));

        // h2 first appears in bucket 101: the new denominator applies to 101
        // but the snapshot taken when 100 was opened is untouched.
        instr.ingest("h2".to_string(), 101, Value::Scalar(3.0), &policy);
        assert!(!instr.complete_at(101));
        assert!(instr.complete_at(100));
    }

    #[test]
    fn test_stale_source_left_out_of_new_buckets() {
        let mut instr = scalar_instrument();
        let mut policy = policy();
        policy.source_liveness_secs = Some(10);

        instr.ingest("h1".to_string(), 100, Value::Scalar(1.0), &policy);
        instr.ingest("h2".to_string(), 100, Value::Scalar(1.0), &policy);

        // h2 goes quiet; 50 buckets later h1 alone is enough.
        let complete = instr.ingest("h1".to_string(), 150, Value::Scalar(1.0), &policy);
        assert!(complete);
    }

    #[test]
    fn test_retention_evicts_old_buckets() {
        let mut instr = scalar_instrument();
        let mut policy = policy();
        policy.retention_secs = 5;

        instr.ingest("h1".to_string(), 100, Value::Scalar(1.0), &policy);
        instr.ingest("h1".to_string(), 200, Value::Scalar(1.0), &policy);

        assert_eq!(instr.response_at(100).reporting_count, 0);
        assert_eq!(instr.response_at(200).reporting_count, 1);
    }

    #[test]
    fn test_resolution_uses_own_requested_time() {
        let mut instr = scalar_instrument();
        let policy = policy();

        instr.ingest("h1".to_string(), 100, Value::Scalar(5.0), &policy);

        let (tx, rx) = mpsc::sync_channel(1);
        instr.pending.push(PendingQuery {
            arrived_ms: 101_000,
            requested: 100,
            responder: Responder::new(tx),
        });

        // Bucket 101 completing resolves the query parked at 100, with the
        // value recorded at 100.
        instr.ingest("h1".to_string(), 101, Value::Scalar(9.0), &policy);
        instr.resolve_completed(101, &policy);

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.when, 100);
        assert_eq!(response.value, Value::Scalar(5.0));
        assert!(instr.pending.is_empty());
    }

    #[test]
    fn test_exact_bucket_resolution_when_policy_off() {
        let mut instr = scalar_instrument();
        let mut policy = policy();
        policy.assume_monotonic_source_reporting = false;

        let (tx, rx) = mpsc::sync_channel(1);
        instr.pending.push(PendingQuery {
            arrived_ms: 101_000,
            requested: 100,
            responder: Responder::new(tx),
        });

        instr.ingest("h1".to_string(), 101, Value::Scalar(9.0), &policy);
        instr.resolve_completed(101, &policy);
        assert!(rx.try_recv().is_err());
        assert_eq!(instr.pending.len(), 1);

        instr.ingest("h1".to_string(), 100, Value::Scalar(5.0), &policy);
        instr.resolve_completed(100, &policy);
        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.value, Value::Scalar(5.0));
    }

    #[test]
    fn test_sweep_resolves_partial_data() {
        let mut instr = scalar_instrument();
        let policy = policy();

        instr.ingest("h1".to_string(), 99, Value::Scalar(1.0), &policy);
        instr.ingest("h2".to_string(), 99, Value::Scalar(1.0), &policy);
        instr.ingest("h1".to_string(), 100, Value::Scalar(5.0), &policy);

        let (tx, rx) = mpsc::sync_channel(1);
        instr.pending.push(PendingQuery {
            arrived_ms: 101_000,
            requested: 100,
            responder: Responder::new(tx),
        });

        // Not yet timed out.
        instr.sweep(103_000, 5_000);
        assert!(rx.try_recv().is_err());

        instr.sweep(106_000, 5_000);
        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.value, Value::Scalar(5.0));
        assert_eq!(response.reporting_count, 1);
        assert_eq!(response.source_count, 2);
        assert!(response.reporting_count < response.source_count);
    }

    #[test]
    fn test_sweep_of_unreported_bucket_yields_empty_value() {
        let mut instr = scalar_instrument();

        let (tx, rx) = mpsc::sync_channel(1);
        instr.pending.push(PendingQuery {
            arrived_ms: 101_000,
            requested: 100,
            responder: Responder::new(tx),
        });

        instr.sweep(106_000, 5_000);
        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.value, Value::Scalar(0.0));
        assert_eq!(response.reporting_count, 0);
    }

    #[test]
    fn test_responder_fires_at_most_once() {
        let mut instr = scalar_instrument();
        instr.ingest("h1".to_string(), 100, Value::Scalar(5.0), &policy());

        let (tx, rx) = mpsc::sync_channel(1);
        let mut responder = Responder::new(tx);

        assert!(responder.resolve(instr.response_at(100)));
        assert!(!responder.resolve(instr.response_at(100)));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_window_fills_gaps_with_empty_values() {
        let mut instr = scalar_instrument();
        let policy = policy();

        instr.ingest("h1".to_string(), 100, Value::Scalar(5.0), &policy);
        instr.ingest("h1".to_string(), 102, Value::Scalar(7.0), &policy);

        let (values, min_reporting) = instr.window(100, 102);
        assert_eq!(
            values,
            vec![Value::Scalar(5.0), Value::Scalar(0.0), Value::Scalar(7.0)]
        );
        assert_eq!(min_reporting, 0);
    }

    #[test]
    fn test_status_reports_latest_value() {
        let mut instr = scalar_instrument();
        let policy = policy();

        instr.ingest("h1".to_string(), 100, Value::Scalar(5.0), &policy);
        instr.ingest("h1".to_string(), 101, Value::Scalar(9.0), &policy);

        let status = instr.status();
        assert_eq!(status.id, "cpu.busy");
        assert_eq!(status.since, 1_000);
        assert_eq!(status.source_count, 1);
        assert_eq!(status.last_time, 101);
        assert_eq!(status.latest_value, Some(Value::Scalar(9.0)));
    }
}
