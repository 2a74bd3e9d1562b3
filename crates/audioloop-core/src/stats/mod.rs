//! Statistics storage for the adjustment cycles
//!
//! Keeps a bounded history of every finished cycle plus running totals for
//! status output.

pub mod store;
