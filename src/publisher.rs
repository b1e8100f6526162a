use crate::{helper::io_error, value::Value};
use crossbeam_channel::Sender;
use std::io;

/// One data point from the message bus.
///
/// Fields are optional because bus decoding happens upstream of this core;
/// the ingest path drops any message with a missing field and logs a
/// warning instead of failing.
#[derive(Clone, Debug)]
pub struct DataMessage {
    pub instrumentation_id: Option<String>,
    pub source_host: Option<String>,
    /// Milliseconds since the Unix epoch; truncated to whole seconds on
    /// ingestion.
    pub time: Option<u64>,
    pub value: Option<Value>,
}

/// Handle for publishing data points into the aggregator.
///
/// Publishers are cloneable and cheap to hand to per-host producer threads
/// or a bus consumer.
pub struct Publisher {
    data_tx: Sender<DataMessage>,
}

impl Publisher {
    pub(crate) fn new(data_tx: Sender<DataMessage>) -> Publisher {
        Publisher { data_tx }
    }

    /// Publishes a fully-formed data point.
    pub fn publish(&self, id: &str, source_host: &str, time_ms: u64, value: Value) -> Result<(), io::Error> {
        self.send(DataMessage {
            instrumentation_id: Some(id.to_string()),
            source_host: Some(source_host.to_string()),
            time: Some(time_ms),
            value: Some(value),
        })
    }

    /// Forwards a raw, possibly incomplete bus frame.
    pub fn send(&self, message: DataMessage) -> Result<(), io::Error> {
        self.data_tx
            .send(message)
            .map_err(|_| io_error("failed to send data message"))
    }
}

impl Clone for Publisher {
    fn clone(&self) -> Publisher {
        Publisher {
            data_tx: self.data_tx.clone(),
        }
    }
}
