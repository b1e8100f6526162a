mod aggregator;
mod clock;
mod configuration;
mod control;
mod helper;
mod instrument;
mod publisher;
mod value;
mod view;

pub use self::{
    aggregator::Aggregator,
    clock::{Clock, ClockSource, Mock, Wall},
    configuration::Configuration,
    control::{AggregatorError, Controller, EnableAck},
    instrument::{InstrumentStatus, QueryResponse},
    publisher::{DataMessage, Publisher},
    value::{
        bucketize, merge_distribution, merge_scalar, merge_value, Bucket, BucketSpec, Dimension,
        KeyedValues, Value,
    },
    view::{WindowSummary, WindowView},
};
