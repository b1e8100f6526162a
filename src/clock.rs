use crate::helper::duration_as_millis;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time, in milliseconds since the Unix epoch.
pub trait ClockSource {
    fn now(&self) -> u64;
}

impl<T: ClockSource> ClockSource for Arc<T> {
    fn now(&self) -> u64 { (**self).now() }
}

/// The system wall clock.
pub struct Wall;

impl ClockSource for Wall {
    fn now(&self) -> u64 {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock set before the Unix epoch");
        duration_as_millis(since_epoch)
    }
}

/// An adjustable clock for tests.
///
/// Time only moves when `increment` is called, which makes timeout and
/// bucket-boundary behavior deterministic.
pub struct Mock {
    offset: AtomicU64,
}

impl Mock {
    pub fn new(offset: u64) -> Self {
        Self {
            offset: AtomicU64::new(offset),
        }
    }

    pub fn increment(&self, amount: u64) {
        self.offset.fetch_add(amount, Ordering::Release);
    }
}

impl ClockSource for Mock {
    fn now(&self) -> u64 { self.offset.load(Ordering::Acquire) }
}

/// Cloneable handle over the configured clock source.
#[derive(Clone)]
pub struct Clock {
    source: Arc<dyn ClockSource + Send + Sync>,
}

impl Clock {
    /// A clock backed by the system wall clock.
    pub fn wall() -> Clock {
        Clock {
            source: Arc::new(Wall),
        }
    }

    /// A clock backed by a `Mock`, along with the handle that advances it.
    pub fn mock(start: u64) -> (Clock, Arc<Mock>) {
        let mock = Arc::new(Mock::new(start));
        let clock = Clock {
            source: mock.clone(),
        };
        (clock, mock)
    }

    /// Current time in milliseconds since the Unix epoch.
    pub fn now_millis(&self) -> u64 { self.source.now() }

    /// Current time truncated to whole seconds since the Unix epoch.
    pub fn now_secs(&self) -> u64 { self.source.now() / 1_000 }
}
