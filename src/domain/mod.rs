//! Domain layer: payment value objects and the ports flows talk through.

pub mod configuration;
pub mod payment;
pub mod ports;
