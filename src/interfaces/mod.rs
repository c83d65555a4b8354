//! Simulator surface: JSON scenarios in, CSV state traces out.

pub mod csv;
pub mod scenario;
