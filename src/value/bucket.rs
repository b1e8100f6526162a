use serde::ser::{Serialize, SerializeSeq, Serializer};

// Positive samples below base^MIN_BAND collapse into the zero bucket, which
// keeps the zero bucket disjoint from every regular log-linear sub-bucket.
const MIN_BAND: i32 = -4;

/// One histogram bucket: a half-open range `[lo, hi)` and the weight
/// accumulated within it.
#[derive(Clone, Debug, PartialEq)]
pub struct Bucket {
    pub lo: f64,
    pub hi: f64,
    pub count: f64,
}

impl Bucket {
    pub fn new(lo: f64, hi: f64, count: f64) -> Bucket {
        Bucket { lo, hi, count }
    }

    fn contains(&self, sample: f64) -> bool { sample >= self.lo && sample < self.hi }
}

impl Serialize for Bucket {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.lo)?;
        seq.serialize_element(&self.hi)?;
        seq.serialize_element(&self.count)?;
        seq.end()
    }
}

/// Bucketing policy for raw samples.
///
/// All instances of a given metric share one policy, fixed when the
/// instrumentation is created, so distributions produced on different hosts
/// always agree on bucket boundaries and can be merged range-by-range.
#[derive(Clone, Debug, PartialEq)]
pub enum BucketSpec {
    /// Fixed-width buckets aligned to multiples of `width`.
    Linear { width: f64 },

    /// Geometric bands `[base^k, base^(k+1))`, each subdivided into
    /// equal-width sub-buckets of width `base^(k+1) / subdivisions`: fine
    /// resolution near zero, coarse resolution at the tail.
    LogLinear { base: f64, subdivisions: u32 },
}

impl BucketSpec {
    /// Log-linear bucketing with base 10 and 10 subdivisions per band, the
    /// usual choice for latency-like metrics.
    pub fn default_latency() -> BucketSpec {
        BucketSpec::LogLinear {
            base: 10.0,
            subdivisions: 10,
        }
    }

    /// The bucket `[lo, hi)` that `sample` falls into under this policy.
    pub fn bounds(&self, sample: f64) -> (f64, f64) {
        match *self {
            BucketSpec::Linear { width } => {
                assert!(width > 0.0, "linear bucket width must be positive");
                let idx = (sample / width).floor();
                (idx * width, (idx + 1.0) * width)
            },
            BucketSpec::LogLinear { base, subdivisions } => {
                assert!(base > 1.0, "log-linear base must exceed 1");
                assert!(subdivisions > 0, "log-linear subdivisions must be positive");
                let subs = f64::from(subdivisions);

                // Samples at or below zero, and positives below the
                // resolution floor, land in the zero bucket.
                if sample < base.powf(f64::from(MIN_BAND)) {
                    return (0.0, base.powf(f64::from(MIN_BAND + 1)) / subs);
                }

                // The log is off by at most one ulp, which matters exactly
                // at band boundaries; nudge the band until it brackets the
                // sample.
                let mut band = sample.log(base).floor();
                if sample >= base.powf(band + 1.0) {
                    band += 1.0;
                } else if sample < base.powf(band) {
                    band -= 1.0;
                }

                // Both edges derive from one integer index so adjacent
                // buckets share boundary values exactly; the nudge keeps a
                // sample sitting a hair under an edge from slipping a
                // bucket down.
                let width = base.powf(band + 1.0) / subs;
                let idx = (sample / width + 1e-9).floor();
                (idx * width, (idx + 1.0) * width)
            },
        }
    }
}

/// Adds a raw `(sample, weight)` observation to the distribution `rv`.
///
/// The bucket containing `sample` accumulates `weight`; if no such bucket
/// exists yet, one is created at its sorted position.
pub fn bucketize(rv: &mut Vec<Bucket>, sample: f64, weight: f64, spec: &BucketSpec) {
    let (lo, hi) = spec.bounds(sample);

    let mut insert_at = rv.len();
    for (idx, bucket) in rv.iter_mut().enumerate() {
        if bucket.contains(sample) {
            bucket.count += weight;
            return;
        }

        if lo < bucket.lo {
            insert_at = idx;
            break;
        }
    }

    rv.insert(insert_at, Bucket::new(lo, hi, weight));
}
