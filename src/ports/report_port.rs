//! Report generation port trait.

use crate::domain::backtest::BacktestResult;
use crate::domain::error::QuantlabError;
use crate::domain::metrics::BacktestMetrics;
use crate::domain::optimizer::OptimizationOutcome;
use std::path::Path;

/// Port for writing optimization and backtest reports.
pub trait ReportPort {
    fn write_weights(
        &self,
        outcome: &OptimizationOutcome,
        output_dir: &Path,
    ) -> Result<(), QuantlabError>;

    fn write_backtest(
        &self,
        result: &BacktestResult,
        metrics: &BacktestMetrics,
        output_dir: &Path,
    ) -> Result<(), QuantlabError>;
}
