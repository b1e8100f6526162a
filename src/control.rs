use crate::{
    instrument::{InstrumentStatus, QueryResponse, Reply},
    view::WindowView,
};
use crossbeam_channel::Sender;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::{fmt, sync::mpsc};

/// Failures surfaced to clients of the aggregator.
#[derive(Clone, Debug, PartialEq)]
pub enum AggregatorError {
    /// No instrumentation with the given id is enabled.
    UnknownInstrumentation(String),

    /// The configuration service sent an arity outside 0..=2.
    InvalidDimension(u8),

    /// Projection restricted to selected decomposition keys is deliberately
    /// unimplemented; failing beats a silently wrong answer.
    SelectiveProjection,

    /// The aggregator went away or a reply channel broke.
    Disconnected,
}

impl fmt::Display for AggregatorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AggregatorError::UnknownInstrumentation(ref id) => {
                write!(f, "unknown instrumentation {}", id)
            },
            AggregatorError::InvalidDimension(arity) => write!(f, "invalid dimension arity {}", arity),
            AggregatorError::SelectiveProjection => {
                write!(f, "projection of selected decomposition keys is not implemented")
            },
            AggregatorError::Disconnected => write!(f, "aggregator disconnected"),
        }
    }
}

impl std::error::Error for AggregatorError {}

/// Acknowledgement for an enable request.
#[derive(Clone, Debug, PartialEq)]
pub struct EnableAck {
    pub id: String,
}

impl Serialize for EnableAck {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("status", "enabled")?;
        map.end()
    }
}

pub(crate) enum ControlMessage {
    Enable {
        id: String,
        arity: u8,
        routing_key: String,
        reply: mpsc::SyncSender<Result<EnableAck, AggregatorError>>,
    },
    Query {
        id: String,
        reply: Reply,
    },
    Window {
        id: String,
        seconds: u64,
        selected_keys: Vec<String>,
        reply: mpsc::SyncSender<Result<WindowView, AggregatorError>>,
    },
    Status {
        reply: mpsc::SyncSender<Vec<InstrumentStatus>>,
    },
}

/// Client-side handle for lifecycle, query, and status requests.
///
/// Controllers are cloneable; every request round-trips over its own
/// one-shot reply channel.
pub struct Controller {
    control_tx: Sender<ControlMessage>,
}

impl Controller {
    pub(crate) fn new(control_tx: Sender<ControlMessage>) -> Controller {
        Controller { control_tx }
    }

    /// Enables an instrumentation, creating empty state if none exists.
    ///
    /// Idempotent: enabling an id twice acknowledges without resetting
    /// anything. The routing key binds the data subscription on the message
    /// bus, which is the transport's concern.
    pub fn enable(&self, id: &str, arity: u8, routing_key: &str) -> Result<EnableAck, AggregatorError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let msg = ControlMessage::Enable {
            id: id.to_string(),
            arity,
            routing_key: routing_key.to_string(),
            reply: tx,
        };

        self.control_tx.send(msg).map_err(|_| AggregatorError::Disconnected)?;
        rx.recv().map_err(|_| AggregatorError::Disconnected)?
    }

    /// The latest aggregated value for `id`.
    ///
    /// Returns immediately when the target bucket is already complete;
    /// otherwise blocks until data arrives or the aggregator's request
    /// timeout sweeps the query, whichever happens first. A response with
    /// `reporting_count < source_count` may be incomplete.
    pub fn query(&self, id: &str) -> Result<QueryResponse, AggregatorError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let msg = ControlMessage::Query {
            id: id.to_string(),
            reply: tx,
        };

        self.control_tx.send(msg).map_err(|_| AggregatorError::Disconnected)?;
        rx.recv().map_err(|_| AggregatorError::Disconnected)?
    }

    /// A windowed view over the last `seconds` buckets of `id`, re-aggregated
    /// to renderable shape.
    ///
    /// Selecting specific decomposition keys is not implemented and fails
    /// explicitly; pass no keys to collapse decompositions.
    pub fn window(
        &self,
        id: &str,
        seconds: u64,
        selected_keys: &[String],
    ) -> Result<WindowView, AggregatorError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let msg = ControlMessage::Window {
            id: id.to_string(),
            seconds,
            selected_keys: selected_keys.to_vec(),
            reply: tx,
        };

        self.control_tx.send(msg).map_err(|_| AggregatorError::Disconnected)?;
        rx.recv().map_err(|_| AggregatorError::Disconnected)?
    }

    /// Operational status of every enabled instrumentation.
    pub fn status(&self) -> Result<Vec<InstrumentStatus>, AggregatorError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let msg = ControlMessage::Status { reply: tx };

        self.control_tx.send(msg).map_err(|_| AggregatorError::Disconnected)?;
        rx.recv().map_err(|_| AggregatorError::Disconnected)
    }
}

impl Clone for Controller {
    fn clone(&self) -> Controller {
        Controller {
            control_tx: self.control_tx.clone(),
        }
    }
}
