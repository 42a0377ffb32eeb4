//! Prometheus export
//!
//! Renders the statistics collected from a stack in the Prometheus text
//! exposition format. Every statistic becomes one sample of a single gauge
//! family labelled by owning stage and counter name:
//!
//! ```text
//! streamstack_statistic{stage="read_splitter",name="requests_split"} 3
//! ```

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};
use crate::statistics::Statistic;

/// Gauge family name used for every statistic
pub const STATISTIC_METRIC: &str = "streamstack_statistic";

/// Encode `statistics` as Prometheus text.
///
/// A fresh registry is used per call, so the output only ever reflects the
/// statistics passed in.
pub fn encode_prometheus(statistics: &[Statistic]) -> Result<String> {
    let registry = Registry::new();
    let gauges = GaugeVec::new(
        Opts::new(STATISTIC_METRIC, "Stream stack statistic by stage"),
        &["stage", "name"],
    )?;
    registry.register(Box::new(gauges.clone()))?;

    for statistic in statistics {
        gauges
            .get_metric_with_label_values(&[statistic.owner.as_str(), statistic.name.as_str()])?
            .set(statistic.value);
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics not UTF-8: {}", e)))
}
