//! Domain model: closed enums and entities for orders, bill items, and
//! student product subscriptions.
//!
//! Enum values cross the wire and the database as strings; parsing happens
//! at those boundaries only, the rest of the code works on these types.

pub mod student_product;

use chrono::{DateTime, Utc};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderType {
    New,
    Loa,
    Resume,
    Withdrawal,
    Graduate,
    Update,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::New => "NEW",
            OrderType::Loa => "LOA",
            OrderType::Resume => "RESUME",
            OrderType::Withdrawal => "WITHDRAWAL",
            OrderType::Graduate => "GRADUATE",
            OrderType::Update => "UPDATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OrderType::New),
            "LOA" => Some(OrderType::Loa),
            "RESUME" => Some(OrderType::Resume),
            "WITHDRAWAL" => Some(OrderType::Withdrawal),
            "GRADUATE" => Some(OrderType::Graduate),
            "UPDATE" => Some(OrderType::Update),
            _ => None,
        }
    }

    /// Order types that mutate an existing subscription and therefore
    /// require a target student product and a version number.
    pub fn mutates_existing(&self) -> bool {
        matches!(
            self,
            OrderType::Update
                | OrderType::Loa
                | OrderType::Resume
                | OrderType::Withdrawal
                | OrderType::Graduate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Submitted,
    Voided,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::Voided => "VOIDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(OrderStatus::Submitted),
            "VOIDED" => Some(OrderStatus::Voided),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudentProductStatus {
    Ordered,
    Cancelled,
}

impl StudentProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudentProductStatus::Ordered => "ORDERED",
            StudentProductStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ORDERED" => Some(StudentProductStatus::Ordered),
            "CANCELLED" => Some(StudentProductStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StudentProductLabel {
    Created,
    Paused,
    PauseScheduled,
    WithdrawalScheduled,
    GraduationScheduled,
}

impl StudentProductLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudentProductLabel::Created => "CREATED",
            StudentProductLabel::Paused => "PAUSED",
            StudentProductLabel::PauseScheduled => "PAUSE_SCHEDULED",
            StudentProductLabel::WithdrawalScheduled => "WITHDRAWAL_SCHEDULED",
            StudentProductLabel::GraduationScheduled => "GRADUATION_SCHEDULED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(StudentProductLabel::Created),
            "PAUSED" => Some(StudentProductLabel::Paused),
            "PAUSE_SCHEDULED" => Some(StudentProductLabel::PauseScheduled),
            "WITHDRAWAL_SCHEDULED" => Some(StudentProductLabel::WithdrawalScheduled),
            "GRADUATION_SCHEDULED" => Some(StudentProductLabel::GraduationScheduled),
            _ => None,
        }
    }

    /// Labels the batch updater may promote once their date arrives.
    pub fn is_scheduled(&self) -> bool {
        matches!(
            self,
            StudentProductLabel::PauseScheduled
                | StudentProductLabel::WithdrawalScheduled
                | StudentProductLabel::GraduationScheduled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxCategory {
    Inclusive,
    Exclusive,
}

impl TaxCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxCategory::Inclusive => "INCLUSIVE",
            TaxCategory::Exclusive => "EXCLUSIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INCLUSIVE" => Some(TaxCategory::Inclusive),
            "EXCLUSIVE" => Some(TaxCategory::Exclusive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountType {
    Regular,
    Family,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Regular => "REGULAR",
            DiscountType::Family => "FAMILY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGULAR" => Some(DiscountType::Regular),
            "FAMILY" => Some(DiscountType::Family),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountAmountType {
    Fixed,
    Percentage,
}

impl DiscountAmountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountAmountType::Fixed => "FIXED",
            DiscountAmountType::Percentage => "PERCENTAGE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FIXED" => Some(DiscountAmountType::Fixed),
            "PERCENTAGE" => Some(DiscountAmountType::Percentage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingStatus {
    Billed,
    Pending,
    Cancelled,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Billed => "BILLED",
            BillingStatus::Pending => "PENDING",
            BillingStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BILLED" => Some(BillingStatus::Billed),
            "PENDING" => Some(BillingStatus::Pending),
            "CANCELLED" => Some(BillingStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingType {
    BilledAtOrder,
    AdjustmentBilling,
}

impl BillingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingType::BilledAtOrder => "BILLED_AT_ORDER",
            BillingType::AdjustmentBilling => "ADJUSTMENT_BILLING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BILLED_AT_ORDER" => Some(BillingType::BilledAtOrder),
            "ADJUSTMENT_BILLING" => Some(BillingType::AdjustmentBilling),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentStatus {
    Potential,
    Enrolled,
    Withdrawn,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Potential => "POTENTIAL",
            EnrollmentStatus::Enrolled => "ENROLLED",
            EnrollmentStatus::Withdrawn => "WITHDRAWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "POTENTIAL" => Some(EnrollmentStatus::Potential),
            "ENROLLED" => Some(EnrollmentStatus::Enrolled),
            "WITHDRAWN" => Some(EnrollmentStatus::Withdrawn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAction {
    Submitted,
    Voided,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Submitted => "SUBMITTED",
            OrderAction::Voided => "VOIDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(OrderAction::Submitted),
            "VOIDED" => Some(OrderAction::Voided),
            _ => None,
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A submitted order. Immutable after creation except for voiding, which is
/// guarded by the version number.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub student_id: String,
    pub location_id: String,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub comment: Option<String>,
    pub withdrawal_effective_date: Option<DateTime<Utc>>,
    pub background: Option<String>,
    pub future_measures: Option<String>,
    pub version_number: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub order_id: String,
    pub product_id: String,
    pub discount_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub effective_date: Option<DateTime<Utc>>,
    pub student_product_id: Option<String>,
}

/// Course assignment captured with a package product's order item.
#[derive(Debug, Clone, PartialEq)]
pub struct CourseItem {
    pub order_id: String,
    pub product_id: String,
    pub course_id: String,
    pub course_name: String,
    pub weight: Option<i32>,
    pub slot: Option<i32>,
}

/// One billed (or pending) period for one product within an order.
#[derive(Debug, Clone, PartialEq)]
pub struct BillItem {
    pub order_id: String,
    pub sequence_number: i32,
    pub product_id: String,
    pub location_id: String,
    pub student_product_id: Option<String>,
    pub billing_schedule_period_id: Option<String>,
    pub price: f64,
    pub quantity: Option<i32>,
    pub tax_id: Option<String>,
    pub tax_percentage: Option<f64>,
    pub tax_category: Option<TaxCategory>,
    pub tax_amount: Option<f64>,
    pub discount_id: Option<String>,
    pub discount_type: Option<DiscountType>,
    pub discount_amount_type: Option<DiscountAmountType>,
    pub discount_amount_value: Option<f64>,
    pub discount_amount: Option<f64>,
    pub final_price: f64,
    pub adjustment_price: Option<f64>,
    pub billing_status: BillingStatus,
    pub billing_type: BillingType,
    pub created_at: DateTime<Utc>,
}

/// One student's subscription to one product. The version number is bumped
/// by every mutating order and checked against client-supplied versions.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentProduct {
    pub student_product_id: String,
    pub student_id: String,
    pub product_id: String,
    pub location_id: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub product_status: StudentProductStatus,
    pub student_product_label: StudentProductLabel,
    pub updated_from_student_product_id: Option<String>,
    pub version_number: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One cycle of a product's recurring billing schedule. Immutable once
/// created, apart from archiving.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingSchedulePeriod {
    pub billing_schedule_period_id: String,
    pub billing_schedule_id: String,
    pub name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub billing_date: DateTime<Utc>,
    pub is_archived: bool,
}

/// Exact proration fraction for orders landing inside a period. The row
/// whose date range contains the order date supplies numerator/denominator.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingRatio {
    pub billing_ratio_id: String,
    pub billing_schedule_period_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub numerator: i32,
    pub denominator: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub product_id: String,
    pub name: String,
    pub available_from: DateTime<Utc>,
    pub available_until: DateTime<Utc>,
    /// Recurring products reference a billing schedule; one-time products
    /// leave this unset.
    pub billing_schedule_id: Option<String>,
    pub tax_id: Option<String>,
}

/// Per-product flags governing which order types are permitted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductSetting {
    pub product_id: String,
    pub is_pausable: bool,
    pub is_enrollment_required: bool,
    pub is_added_to_enrollment_by_default: bool,
    pub is_operation_fee: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Discount {
    pub discount_id: String,
    pub name: String,
    pub discount_type: DiscountType,
    pub discount_amount_type: DiscountAmountType,
    pub discount_amount_value: f64,
    pub available_from: DateTime<Utc>,
    pub available_until: DateTime<Utc>,
    pub is_archived: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tax {
    pub tax_id: String,
    pub name: String,
    pub tax_percentage: f64,
    pub tax_category: TaxCategory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub location_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Student {
    pub student_id: String,
    pub name: String,
    pub grade_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeavingReason {
    pub leaving_reason_id: String,
    pub name: String,
    pub is_archived: bool,
}

/// Append-only audit entry; one per SUBMITTED/VOIDED action with the actor.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderActionLog {
    pub order_id: String,
    pub user_id: String,
    pub action: OrderAction,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}
