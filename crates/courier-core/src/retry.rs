//! Fixed backoff table for failed publish attempts.
//!
//! Delays are advisory: they populate `next_retry_at` for operators, but the
//! pending-batch query does not filter on it, so a retried event may be picked
//! up by the very next dispatch run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay before the Nth retry, indexed by the new retry count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffTable {
    /// Delay applied after the first, second... failed attempt.
    #[serde(with = "seconds")]
    pub delays: Vec<Duration>,
}

impl BackoffTable {
    /// Creates a table from explicit delays.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Builds a table from whole seconds, as read from configuration.
    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// Delay to schedule after `retry_count` failed attempts.
    ///
    /// Returns `None` for counts of zero or beyond the end of the table.
    pub fn delay_for(&self, retry_count: i32) -> Option<Duration> {
        let index = usize::try_from(retry_count).ok()?.checked_sub(1)?;
        self.delays.get(index).copied()
    }
}

impl Default for BackoffTable {
    /// 30 seconds after the first failure, two minutes after the second.
    fn default() -> Self {
        Self::from_secs(&[30, 120])
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(delays: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        delays.iter().map(Duration::as_secs).collect::<Vec<_>>().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Ok(Vec::<u64>::deserialize(d)?.into_iter().map(Duration::from_secs).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_matches_documented_delays() {
        let table = BackoffTable::default();
        assert_eq!(table.delay_for(1), Some(Duration::from_secs(30)));
        assert_eq!(table.delay_for(2), Some(Duration::from_secs(120)));
        assert_eq!(table.delay_for(3), None);
    }

    #[test]
    fn zero_and_negative_counts_have_no_delay() {
        let table = BackoffTable::default();
        assert_eq!(table.delay_for(0), None);
        assert_eq!(table.delay_for(-1), None);
    }

    #[test]
    fn serializes_as_seconds() {
        let json = serde_json::to_string(&BackoffTable::default()).unwrap();
        assert_eq!(json, r#"{"delays":[30,120]}"#);
        let back: BackoffTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, BackoffTable::default());
    }
}
