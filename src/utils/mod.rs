//!
//! Utility module for the ledger engine.
//!
//! Re-exports the decimal quantization helpers used for money and item counts.
/// Fixed-point rounding helpers
pub mod decimal;

pub use decimal::{parse_money, quantize_count, quantize_money};
