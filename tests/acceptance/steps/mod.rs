//! Step definition modules for the acceptance suite.

pub mod order_lifecycle;
