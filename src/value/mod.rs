use fnv::FnvHashMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::collections::hash_map::Entry;

pub mod bucket;

pub use self::bucket::{bucketize, Bucket, BucketSpec};

/// Map of decomposition keys to nested values.
pub type KeyedValues = FnvHashMap<String, Value>;

/// A merged data point for one instrumentation and time bucket.
///
/// The three shapes mirror the three instrumentation dimensions: plain
/// numbers, bucketed frequency distributions, and keyed decompositions.
/// Decompositions nest, so a two-level decomposition is a decomposition
/// whose values are themselves decompositions.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(f64),
    Distribution(Vec<Bucket>),
    Decomposition(KeyedValues),
}

/// Structural arity of an instrumentation's values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dimension {
    /// A plain number per time bucket.
    Scalar,
    /// A single-level decomposition.
    One,
    /// A two-level decomposition.
    Two,
}

impl Dimension {
    /// Maps the wire arity (0, 1, or 2) to a dimension.
    pub fn from_arity(arity: u8) -> Option<Dimension> {
        match arity {
            0 => Some(Dimension::Scalar),
            1 => Some(Dimension::One),
            2 => Some(Dimension::Two),
            _ => None,
        }
    }

    /// The value an unreported bucket presents: zero for scalars, an empty
    /// decomposition otherwise.
    pub fn empty_value(self) -> Value {
        match self {
            Dimension::Scalar => Value::Scalar(0.0),
            Dimension::One | Dimension::Two => Value::Decomposition(KeyedValues::default()),
        }
    }
}

pub fn merge_scalar(a: f64, b: f64) -> f64 { a + b }

/// Merges distribution `b` into `a`.
///
/// Matching ranges sum their counts; a range present only in `b` is inserted
/// into `a` at its sorted position. Both inputs must be sorted and
/// non-overlapping, and matching buckets must agree on both edges — all
/// instances of one metric share bucketing parameters fixed at
/// instrumentation creation, so anything else is a producer bug.
pub fn merge_distribution(a: &mut Vec<Bucket>, b: &[Bucket]) {
    assert_sorted(a, "merge target");
    assert_sorted(b, "merge source");

    let mut idx = 0;
    for nb in b {
        while idx < a.len() && a[idx].hi <= nb.lo {
            idx += 1;
        }

        if idx == a.len() {
            a.push(nb.clone());
        } else if a[idx].lo == nb.lo {
            assert!(
                a[idx].hi == nb.hi,
                "mismatched bucket boundaries at {}: {} vs {}",
                nb.lo,
                a[idx].hi,
                nb.hi
            );
            a[idx].count += nb.count;
        } else {
            assert!(nb.hi <= a[idx].lo, "overlapping bucket ranges at {}", nb.lo);
            a.insert(idx, nb.clone());
        }
    }
}

fn assert_sorted(buckets: &[Bucket], role: &str) {
    for pair in buckets.windows(2) {
        assert!(
            pair[0].hi <= pair[1].lo,
            "{} distribution is unsorted or overlapping at {}",
            role,
            pair[1].lo
        );
    }
}

/// Merges `b` into `a`, dispatching on shape.
///
/// Decompositions merge recursively by key, taking the union of keys; a key
/// present on only one side passes through unchanged. Mismatched shapes are
/// a producer bug.
pub fn merge_value(a: &mut Value, b: Value) {
    match (a, b) {
        (Value::Scalar(a), Value::Scalar(b)) => *a = merge_scalar(*a, b),
        (Value::Distribution(a), Value::Distribution(ref b)) => merge_distribution(a, b),
        (Value::Decomposition(a), Value::Decomposition(b)) => {
            for (key, nested) in b {
                match a.entry(key) {
                    Entry::Occupied(mut entry) => merge_value(entry.get_mut(), nested),
                    Entry::Vacant(entry) => {
                        entry.insert(nested);
                    },
                }
            }
        },
        (a, b) => panic!("cannot merge mismatched value shapes: {:?} vs {:?}", a, b),
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match *self {
            Value::Scalar(v) => serializer.serialize_f64(v),
            Value::Distribution(ref buckets) => {
                let mut seq = serializer.serialize_seq(Some(buckets.len()))?;
                for bucket in buckets {
                    seq.serialize_element(bucket)?;
                }
                seq.end()
            },
            Value::Decomposition(ref keys) => {
                let mut map = serializer.serialize_map(Some(keys.len()))?;
                for (key, nested) in keys {
                    map.serialize_entry(key, nested)?;
                }
                map.end()
            },
        }
    }
}
