//! Conversions between proto types and domain types.
//!
//! Wire enums admit an UNSPECIFIED zero value and arbitrary integers; the
//! fallible conversions here are the only place those are rejected, so the
//! rest of the crate works with closed domain enums.

use chrono::{DateTime, Utc};
use prost_types::Timestamp;
use tonic::Status;

use crate::domain::{
    DiscountAmountType, DiscountType, OrderStatus, OrderType, StudentProductLabel,
    StudentProductStatus, TaxCategory,
};
use crate::proto;

pub fn timestamp_to_datetime(ts: &Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.seconds, ts.nanos as u32)
}

pub fn datetime_to_timestamp(dt: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

/// Decode an optional wire timestamp, treating an out-of-range value the
/// same as an absent one.
pub fn optional_datetime(ts: Option<&Timestamp>) -> Option<DateTime<Utc>> {
    ts.and_then(timestamp_to_datetime)
}

/// Decode a timestamp the request must carry.
pub fn required_datetime(field: &'static str, ts: Option<&Timestamp>) -> Result<DateTime<Utc>, Status> {
    optional_datetime(ts).ok_or_else(|| Status::invalid_argument(format!("missing {field}")))
}

/// Decode a wire enum field, rejecting unknown integers and the UNSPECIFIED
/// zero value.
pub fn order_type_from_wire(value: i32) -> Result<OrderType, Status> {
    match proto::OrderType::try_from(value) {
        Ok(proto::OrderType::New) => Ok(OrderType::New),
        Ok(proto::OrderType::Loa) => Ok(OrderType::Loa),
        Ok(proto::OrderType::Resume) => Ok(OrderType::Resume),
        Ok(proto::OrderType::Withdrawal) => Ok(OrderType::Withdrawal),
        Ok(proto::OrderType::Graduate) => Ok(OrderType::Graduate),
        Ok(proto::OrderType::Update) => Ok(OrderType::Update),
        Ok(proto::OrderType::Unspecified) | Err(_) => {
            Err(Status::invalid_argument(format!("unknown order type {value}")))
        }
    }
}

pub fn tax_category_from_wire(value: i32) -> Result<TaxCategory, Status> {
    match proto::TaxCategory::try_from(value) {
        Ok(proto::TaxCategory::Inclusive) => Ok(TaxCategory::Inclusive),
        Ok(proto::TaxCategory::Exclusive) => Ok(TaxCategory::Exclusive),
        Ok(proto::TaxCategory::Unspecified) | Err(_) => {
            Err(Status::invalid_argument(format!("unknown tax category {value}")))
        }
    }
}

pub fn discount_type_from_wire(value: i32) -> Result<DiscountType, Status> {
    match proto::DiscountType::try_from(value) {
        Ok(proto::DiscountType::Regular) => Ok(DiscountType::Regular),
        Ok(proto::DiscountType::Family) => Ok(DiscountType::Family),
        Ok(proto::DiscountType::Unspecified) | Err(_) => {
            Err(Status::invalid_argument(format!("unknown discount type {value}")))
        }
    }
}

pub fn discount_amount_type_from_wire(value: i32) -> Result<DiscountAmountType, Status> {
    match proto::DiscountAmountType::try_from(value) {
        Ok(proto::DiscountAmountType::Fixed) => Ok(DiscountAmountType::Fixed),
        Ok(proto::DiscountAmountType::Percentage) => Ok(DiscountAmountType::Percentage),
        Ok(proto::DiscountAmountType::Unspecified) | Err(_) => Err(Status::invalid_argument(
            format!("unknown discount amount type {value}"),
        )),
    }
}

impl From<OrderType> for proto::OrderType {
    fn from(ty: OrderType) -> Self {
        match ty {
            OrderType::New => proto::OrderType::New,
            OrderType::Loa => proto::OrderType::Loa,
            OrderType::Resume => proto::OrderType::Resume,
            OrderType::Withdrawal => proto::OrderType::Withdrawal,
            OrderType::Graduate => proto::OrderType::Graduate,
            OrderType::Update => proto::OrderType::Update,
        }
    }
}

impl From<OrderStatus> for proto::OrderStatus {
    fn from(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Submitted => proto::OrderStatus::Submitted,
            OrderStatus::Voided => proto::OrderStatus::Voided,
        }
    }
}

impl From<StudentProductStatus> for proto::StudentProductStatus {
    fn from(status: StudentProductStatus) -> Self {
        match status {
            StudentProductStatus::Ordered => proto::StudentProductStatus::Ordered,
            StudentProductStatus::Cancelled => proto::StudentProductStatus::Cancelled,
        }
    }
}

impl From<StudentProductLabel> for proto::StudentProductLabel {
    fn from(label: StudentProductLabel) -> Self {
        match label {
            StudentProductLabel::Created => proto::StudentProductLabel::Created,
            StudentProductLabel::Paused => proto::StudentProductLabel::Paused,
            StudentProductLabel::PauseScheduled => proto::StudentProductLabel::PauseScheduled,
            StudentProductLabel::WithdrawalScheduled => {
                proto::StudentProductLabel::WithdrawalScheduled
            }
            StudentProductLabel::GraduationScheduled => {
                proto::StudentProductLabel::GraduationScheduled
            }
        }
    }
}
