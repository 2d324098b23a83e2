//! Rolling performance metrics used by permission evaluation.

mod calculator;

pub use calculator::{PerformanceCalculator, PerformanceWindow};
