//! Coursepay - Order/Billing Service
//!
//! A gRPC service managing student product subscriptions: order submission
//! (new, leave-of-absence, resume, withdrawal, graduation), voiding, and
//! scheduled status promotion, with per-period billing verification
//! (proration, discounts, inclusive/exclusive tax).

pub mod billing;
pub mod bus;
pub mod config;
pub mod domain;
pub mod proto_ext;
pub mod services;
pub mod storage;
pub mod utils;
pub mod validation;

pub mod proto {
    tonic::include_proto!("coursepay");
}
