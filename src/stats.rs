//! Per-function timing statistics
//!
//! One `FunctionStats` record exists per watched function. All times are in
//! seconds; `min_time` starts at `f64::INFINITY`, meaning "no calls observed
//! yet", which is shown as `-` by consumers.

use serde::{Deserialize, Deserializer, Serialize};

/// Running aggregates for a single function
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStats {
    /// Number of completed calls
    pub call_count: u64,
    /// Sum of all call durations (seconds)
    pub total_time: f64,
    /// Fastest call (seconds), `INFINITY` until the first call
    #[serde(deserialize_with = "deserialize_min_time")]
    pub min_time: f64,
    /// Slowest call (seconds)
    pub max_time: f64,
}

impl Default for FunctionStats {
    fn default() -> Self {
        Self {
            call_count: 0,
            total_time: 0.0,
            min_time: f64::INFINITY,
            max_time: 0.0,
        }
    }
}

impl FunctionStats {
    /// Create a zeroed record
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample into the aggregates
    pub fn record(&mut self, elapsed_secs: f64) {
        self.call_count += 1;
        self.total_time += elapsed_secs;
        self.min_time = self.min_time.min(elapsed_secs);
        self.max_time = self.max_time.max(elapsed_secs);
    }

    /// Average call duration in milliseconds, 0 when nothing was recorded
    pub fn avg_time_ms(&self) -> f64 {
        if self.call_count == 0 {
            0.0
        } else {
            self.total_time / self.call_count as f64 * 1000.0
        }
    }

    /// Minimum duration, or `None` while the sentinel is still in place
    pub fn min_time_opt(&self) -> Option<f64> {
        self.min_time.is_finite().then_some(self.min_time)
    }

    /// True if no call has been recorded
    pub fn is_empty(&self) -> bool {
        self.call_count == 0
    }

    /// Update fields from a (possibly malformed) reply object
    ///
    /// Only fields that are present and numeric are applied; everything else
    /// keeps its prior value. A `null` `minTime` is the encoded sentinel.
    /// Returns the names of fields that were rejected.
    pub fn merge_reply_fields(&mut self, value: &serde_json::Value) -> Vec<&'static str> {
        let mut rejected = Vec::new();

        let Some(object) = value.as_object() else {
            return vec![FIELD_CALL_COUNT, FIELD_TOTAL_TIME, FIELD_MIN_TIME, FIELD_MAX_TIME];
        };

        match object.get(FIELD_CALL_COUNT).and_then(as_count) {
            Some(count) => self.call_count = count,
            None => rejected.push(FIELD_CALL_COUNT),
        }
        match object.get(FIELD_TOTAL_TIME).and_then(as_seconds) {
            Some(total) => self.total_time = total,
            None => rejected.push(FIELD_TOTAL_TIME),
        }
        match object.get(FIELD_MIN_TIME) {
            Some(serde_json::Value::Null) => self.min_time = f64::INFINITY,
            Some(v) => match as_seconds(v) {
                Some(min) => self.min_time = min,
                None => rejected.push(FIELD_MIN_TIME),
            },
            None => rejected.push(FIELD_MIN_TIME),
        }
        match object.get(FIELD_MAX_TIME).and_then(as_seconds) {
            Some(max) => self.max_time = max,
            None => rejected.push(FIELD_MAX_TIME),
        }

        rejected
    }
}

const FIELD_CALL_COUNT: &str = "callCount";
const FIELD_TOTAL_TIME: &str = "totalTime";
const FIELD_MIN_TIME: &str = "minTime";
const FIELD_MAX_TIME: &str = "maxTime";

fn as_count(value: &serde_json::Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    // Some runtimes send integral counts as floats
    let f = value.as_f64()?;
    (f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then_some(f as u64)
}

fn as_seconds(value: &serde_json::Value) -> Option<f64> {
    value.as_f64().filter(|f| f.is_finite() && *f >= 0.0)
}

fn deserialize_min_time<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
}
