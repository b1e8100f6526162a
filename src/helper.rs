use std::io::{Error, ErrorKind};
use std::time::Duration;

pub fn io_error(reason: &str) -> Error {
    Error::new(ErrorKind::Other, reason)
}

pub fn duration_as_millis(d: Duration) -> u64 {
    (d.as_secs() * 1_000) + u64::from(d.subsec_millis())
}
