use crate::{
    control::AggregatorError,
    value::{merge_value, Value},
};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Summary statistics over a whole window, from a degenerate one-bucket
/// re-aggregation: bucket edges and summed counts for distributions, slot
/// values for scalars.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowSummary {
    pub min: f64,
    pub max: f64,
    pub total: f64,
}

impl Serialize for WindowSummary {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("min", &self.min)?;
        map.serialize_entry("max", &self.max)?;
        map.serialize_entry("total", &self.total)?;
        map.end()
    }
}

/// A windowed read shaped for an external renderer: one value per time
/// bucket plus the statistics the surrounding chrome displays. Byte and
/// image encoding belong to the renderer, not this core.
#[derive(Clone, Debug)]
pub struct WindowView {
    /// First time bucket of the window, inclusive.
    pub start: u64,
    /// Last time bucket of the window, inclusive.
    pub end: u64,
    /// One projected value per time bucket, oldest first.
    pub values: Vec<Value>,
    /// Decomposition keys observed across the window, sorted; empty when the
    /// window carried no decompositions.
    pub present_keys: Vec<String>,
    /// The smallest reporting count of any bucket in the window; zero when a
    /// bucket went entirely unreported.
    pub min_reporting: usize,
    pub summary: WindowSummary,
}

impl Serialize for WindowView {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(6))?;
        map.serialize_entry("start", &self.start)?;
        map.serialize_entry("end", &self.end)?;
        map.serialize_entry("values", &self.values)?;
        map.serialize_entry("presentKeys", &self.present_keys)?;
        map.serialize_entry("minReporting", &self.min_reporting)?;
        map.serialize_entry("summary", &self.summary)?;
        map.end()
    }
}

/// Re-aggregates a window of per-bucket values down to renderable shape.
///
/// A window without decompositions passes through untouched. When
/// decompositions are present and no keys are selected, each time slot
/// collapses to the merge of all of its keys' values, recursively for
/// nested decompositions. Restricting to selected keys is deliberately
/// unimplemented.
pub(crate) fn project(
    window: Vec<Value>,
    selected_keys: &[String],
) -> Result<(Vec<Value>, Vec<String>), AggregatorError> {
    let has_decomposition = window.iter().any(|value| match value {
        Value::Decomposition(_) => true,
        _ => false,
    });

    if !has_decomposition {
        return Ok((window, Vec::new()));
    }

    if !selected_keys.is_empty() {
        return Err(AggregatorError::SelectiveProjection);
    }

    let mut present = Vec::new();
    for value in &window {
        if let Value::Decomposition(keys) = value {
            for key in keys.keys() {
                if !present.contains(key) {
                    present.push(key.clone());
                }
            }
        }
    }
    present.sort();

    let collapsed = window.into_iter().map(collapse).collect();
    Ok((collapsed, present))
}

/// Collapses decomposition levels by merging all keyed values together; an
/// empty slot renders as an empty distribution.
fn collapse(value: Value) -> Value {
    match value {
        Value::Decomposition(keys) => {
            let mut keyed: Vec<(String, Value)> = keys.into_iter().collect();
            keyed.sort_by(|a, b| a.0.cmp(&b.0));

            let mut merged: Option<Value> = None;
            for (_, nested) in keyed {
                let nested = collapse(nested);
                match merged {
                    Some(ref mut m) => merge_value(m, nested),
                    None => merged = Some(nested),
                }
            }
            merged.unwrap_or_else(|| Value::Distribution(Vec::new()))
        },
        other => other,
    }
}

/// Min/max/total across the raw window, equivalent to re-aggregating the
/// whole window into a single bucket first.
pub(crate) fn summarize(values: &[Value]) -> WindowSummary {
    let mut min = std::f64::INFINITY;
    let mut max = std::f64::NEG_INFINITY;
    let mut total = 0.0;

    for value in values {
        accumulate(value, &mut min, &mut max, &mut total);
    }

    if min > max {
        min = 0.0;
        max = 0.0;
    }

    WindowSummary { min, max, total }
}

fn accumulate(value: &Value, min: &mut f64, max: &mut f64, total: &mut f64) {
    match value {
        Value::Scalar(v) => {
            *min = min.min(*v);
            *max = max.max(*v);
            *total += *v;
        },
        Value::Distribution(buckets) => {
            for bucket in buckets {
                if bucket.count > 0.0 {
                    *min = min.min(bucket.lo);
                    *max = max.max(bucket.hi);
                    *total += bucket.count;
                }
            }
        },
        Value::Decomposition(keys) => {
            for nested in keys.values() {
                accumulate(nested, min, max, total);
            }
        },
    }
}
