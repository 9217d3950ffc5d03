//! Adaptive column statistics.
//!
//! [`collect_statistics`] picks a tier from the catalog row estimate and
//! bounds each tier with its own timeout:
//!
//! | estimated rows              | tiers tried, in order        |
//! |-----------------------------|------------------------------|
//! | `<= exact_row_limit`        | exact, sample                |
//! | `<= sample_row_limit`       | index probe, sample          |
//! | above                       | sample                       |
//!
//! When every tier fails or times out the result is
//! [`StatisticsMethod::Unavailable`]; the caller is never blocked past the
//! sum of the tier timeouts.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::schema::{ColumnStatistics, StatisticsMethod};
use crate::error::{ArchiveError, Result};

/// Tier thresholds and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsPolicy {
    #[serde(default = "default_exact_row_limit")]
    pub exact_row_limit: i64,

    #[serde(default = "default_sample_row_limit")]
    pub sample_row_limit: i64,

    #[serde(default = "default_exact_timeout_secs")]
    pub exact_timeout_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_sample_timeout_secs")]
    pub sample_timeout_secs: u64,

    /// `TABLESAMPLE` percentage for the sample tier.
    #[serde(default = "default_sample_percent")]
    pub sample_percent: f64,
}

impl Default for StatisticsPolicy {
    fn default() -> Self {
        Self {
            exact_row_limit: default_exact_row_limit(),
            sample_row_limit: default_sample_row_limit(),
            exact_timeout_secs: default_exact_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            sample_timeout_secs: default_sample_timeout_secs(),
            sample_percent: default_sample_percent(),
        }
    }
}

impl StatisticsPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.exact_row_limit < 0 || self.sample_row_limit < self.exact_row_limit {
            return Err(ArchiveError::Config(
                "statistics: require 0 <= exact_row_limit <= sample_row_limit".into(),
            ));
        }
        if self.exact_timeout_secs == 0
            || self.probe_timeout_secs == 0
            || self.sample_timeout_secs == 0
        {
            return Err(ArchiveError::Config(
                "statistics: timeouts must be at least 1 second".into(),
            ));
        }
        if !(self.sample_percent > 0.0 && self.sample_percent <= 100.0) {
            return Err(ArchiveError::Config(
                "statistics: sample_percent must be in (0, 100]".into(),
            ));
        }
        Ok(())
    }

    /// Tiers applicable to a table of `estimated_rows`.
    pub fn tiers(&self, estimated_rows: i64) -> &'static [StatisticsMethod] {
        if estimated_rows <= self.exact_row_limit {
            &[StatisticsMethod::Exact, StatisticsMethod::Sampled]
        } else if estimated_rows <= self.sample_row_limit {
            &[StatisticsMethod::IndexProbe, StatisticsMethod::Sampled]
        } else {
            &[StatisticsMethod::Sampled]
        }
    }

    fn timeout_for(&self, method: StatisticsMethod) -> Duration {
        let secs = match method {
            StatisticsMethod::Exact => self.exact_timeout_secs,
            StatisticsMethod::IndexProbe => self.probe_timeout_secs,
            StatisticsMethod::Sampled | StatisticsMethod::Unavailable => self.sample_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

/// The individual statistics queries for one column.
#[async_trait]
pub trait StatisticsProbe: Send + Sync {
    /// MIN, MAX, COUNT(*), COUNT(DISTINCT) over the whole table.
    async fn exact(&self) -> Result<ColumnStatistics>;

    /// `TOP 1` ascending and descending along an index on the column.
    async fn index_probe(&self, estimated_rows: i64) -> Result<ColumnStatistics>;

    /// Estimate from a `TABLESAMPLE` of `percent`.
    async fn sample(&self, percent: f64, estimated_rows: i64) -> Result<ColumnStatistics>;
}

/// Run the applicable tiers until one answers in time.
pub async fn collect_statistics(
    probe: &dyn StatisticsProbe,
    estimated_rows: i64,
    policy: &StatisticsPolicy,
) -> ColumnStatistics {
    for &method in policy.tiers(estimated_rows) {
        let limit = policy.timeout_for(method);
        let attempt = match method {
            StatisticsMethod::Exact => bounded(limit, probe.exact()).await,
            StatisticsMethod::IndexProbe => bounded(limit, probe.index_probe(estimated_rows)).await,
            _ => bounded(limit, probe.sample(policy.sample_percent, estimated_rows)).await,
        };

        match attempt {
            Ok(stats) => {
                debug!(
                    "Column statistics via {:?} (estimated_rows={})",
                    method, estimated_rows
                );
                return stats;
            }
            Err(e) => {
                warn!(
                    "Statistics tier {:?} failed (estimated_rows={}): {}",
                    method, estimated_rows, e
                );
            }
        }
    }

    ColumnStatistics::unavailable(estimated_rows)
}

async fn bounded<F>(limit: Duration, fut: F) -> Result<ColumnStatistics>
where
    F: Future<Output = Result<ColumnStatistics>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ArchiveError::timeout("column statistics", limit.as_secs())),
    }
}

fn default_exact_row_limit() -> i64 {
    1_000_000
}

fn default_sample_row_limit() -> i64 {
    5_000_000
}

fn default_exact_timeout_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_sample_timeout_secs() -> u64 {
    3
}

fn default_sample_percent() -> f64 {
    1.0
}
