//! Pipeline Statistics
//!
//! Rolling averages used for adaptive scheduling and the named counters every
//! stage reports through `collect_statistics`.

mod average_window;

pub use average_window::{Accumulator, AverageWindow};

use serde::{Deserialize, Serialize};

/// One named numeric counter reported by a stage or device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistic {
    /// Stage or device that owns the counter
    pub owner: String,

    /// Counter name, snake_case
    pub name: String,

    /// Current value
    pub value: f64,
}

impl Statistic {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            value,
        }
    }
}

impl std::fmt::Display for Statistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{} = {}", self.owner, self.name, self.value)
    }
}

/// Find a statistic by owner and name.
pub fn find<'a>(statistics: &'a [Statistic], owner: &str, name: &str) -> Option<&'a Statistic> {
    statistics
        .iter()
        .find(|s| s.owner == owner && s.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistic_display() {
        let stat = Statistic::new("read_splitter", "average_num_sub_reads", 2.5);
        assert_eq!(stat.to_string(), "read_splitter.average_num_sub_reads = 2.5");
    }

    #[test]
    fn test_find() {
        let stats = vec![
            Statistic::new("a", "x", 1.0),
            Statistic::new("b", "x", 2.0),
        ];
        assert_eq!(find(&stats, "b", "x").map(|s| s.value), Some(2.0));
        assert!(find(&stats, "c", "x").is_none());
    }
}
