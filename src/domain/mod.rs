//! Core domain types and logic.

pub mod backtest;
pub mod config_validation;
pub mod equilibrium;
pub mod error;
pub mod estimator;
pub mod linalg;
pub mod metrics;
pub mod momentum;
pub mod optimizer;
pub mod price_table;
pub mod solver;
pub mod view;
