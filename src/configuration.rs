use crate::aggregator::Aggregator;
use crate::clock::Clock;
use std::time::Duration;

/// A configuration builder for `Aggregator`.
#[derive(Clone)]
pub struct Configuration {
    pub(crate) capacity: usize,
    pub(crate) request_timeout: Duration,
    pub(crate) sweep_interval: Duration,
    pub(crate) poll_delay: Duration,
    pub(crate) retention: Duration,
    pub(crate) source_liveness: Option<Duration>,
    pub(crate) assume_monotonic_source_reporting: bool,
    pub(crate) clock: Clock,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            capacity: 128,
            request_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            poll_delay: Duration::from_millis(100),
            retention: Duration::from_secs(600),
            source_liveness: None,
            assume_monotonic_source_reporting: true,
            clock: Clock::wall(),
        }
    }
}

impl Configuration {
    /// Creates a new `Configuration` with default values.
    pub fn new() -> Configuration {
        Default::default()
    }

    /// Sets the data channel capacity.
    ///
    /// Defaults to `128`.
    ///
    /// This bounds how many data messages can sit unprocessed before
    /// publishers block. A fleet that reports in bursts at bucket boundaries
    /// may want this closer to its host count.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the request timeout.
    ///
    /// Defaults to `5s`.
    ///
    /// A query parked waiting for its bucket to complete is resolved with
    /// whatever data exists once it has waited this long. Callers can spot
    /// such answers by `reporting_count < source_count`.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Sets the timeout sweep interval.
    ///
    /// Defaults to `1s`.
    ///
    /// This is how often parked queries are checked against the request
    /// timeout, and therefore the resolution of that timeout.
    pub fn sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Sets the poll delay.
    ///
    /// Defaults to `100ms`.
    ///
    /// This controls the timeout used when polling the data channel, and so
    /// bounds how long control messages and the sweep can wait while the
    /// data channel is idle.
    pub fn poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    /// Sets the bucket retention window.
    ///
    /// Defaults to `600s`.
    ///
    /// Time buckets further than this behind the newest bucket are evicted.
    /// Queries only ever look at recent buckets, so this bounds memory
    /// without affecting answers.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the source liveness window.
    ///
    /// Defaults to `None`, meaning a source that stops reporting stays in
    /// the completeness denominator forever.
    ///
    /// When set, sources that have not reported within the window are left
    /// out of the denominator of newly opened buckets, so a dead host stops
    /// holding every query until its timeout.
    pub fn source_liveness(mut self, source_liveness: Option<Duration>) -> Self {
        self.source_liveness = source_liveness;
        self
    }

    /// Sets the monotonic source reporting policy.
    ///
    /// Defaults to `true`.
    ///
    /// When enabled, completion of bucket `t` also resolves queries parked
    /// at earlier buckets, assuming sources report buckets in order. Turn
    /// this off if sources can deliver an old bucket after a newer one, at
    /// the cost of more queries running into the request timeout.
    pub fn assume_monotonic_source_reporting(mut self, assume: bool) -> Self {
        self.assume_monotonic_source_reporting = assume;
        self
    }

    /// Sets the clock.
    ///
    /// Defaults to the system wall clock. Tests inject a mock clock to make
    /// bucket boundaries and timeouts deterministic.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Create an `Aggregator` based on this configuration.
    pub fn build(self) -> Aggregator {
        Aggregator::from_config(self)
    }
}
