//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query
//! building, plus the DDL run at startup. Timestamps are stored as RFC3339
//! TEXT throughout.

use sea_query::Iden;

/// Orders table schema.
#[derive(Iden)]
pub enum Orders {
    Table,
    #[iden = "order_id"]
    OrderId,
    #[iden = "student_id"]
    StudentId,
    #[iden = "location_id"]
    LocationId,
    #[iden = "order_type"]
    OrderType,
    #[iden = "order_status"]
    OrderStatus,
    #[iden = "order_comment"]
    OrderComment,
    #[iden = "withdrawal_effective_date"]
    WithdrawalEffectiveDate,
    #[iden = "background"]
    Background,
    #[iden = "future_measures"]
    FutureMeasures,
    #[iden = "version_number"]
    VersionNumber,
    #[iden = "created_at"]
    CreatedAt,
}

/// Order items table schema.
#[derive(Iden)]
pub enum OrderItems {
    Table,
    #[iden = "order_id"]
    OrderId,
    #[iden = "product_id"]
    ProductId,
    #[iden = "discount_id"]
    DiscountId,
    #[iden = "start_date"]
    StartDate,
    #[iden = "end_date"]
    EndDate,
    #[iden = "effective_date"]
    EffectiveDate,
    #[iden = "student_product_id"]
    StudentProductId,
}

/// Course assignments per order item.
#[derive(Iden)]
pub enum OrderItemCourses {
    Table,
    #[iden = "order_id"]
    OrderId,
    #[iden = "product_id"]
    ProductId,
    #[iden = "course_id"]
    CourseId,
    #[iden = "course_name"]
    CourseName,
    #[iden = "weight"]
    Weight,
    #[iden = "slot"]
    Slot,
}

/// Bill items table schema.
#[derive(Iden)]
pub enum BillItems {
    Table,
    #[iden = "order_id"]
    OrderId,
    #[iden = "sequence_number"]
    SequenceNumber,
    #[iden = "product_id"]
    ProductId,
    #[iden = "location_id"]
    LocationId,
    #[iden = "student_product_id"]
    StudentProductId,
    #[iden = "billing_schedule_period_id"]
    BillingSchedulePeriodId,
    #[iden = "price"]
    Price,
    #[iden = "quantity"]
    Quantity,
    #[iden = "tax_id"]
    TaxId,
    #[iden = "tax_percentage"]
    TaxPercentage,
    #[iden = "tax_category"]
    TaxCategory,
    #[iden = "tax_amount"]
    TaxAmount,
    #[iden = "discount_id"]
    DiscountId,
    #[iden = "discount_type"]
    DiscountType,
    #[iden = "discount_amount_type"]
    DiscountAmountType,
    #[iden = "discount_amount_value"]
    DiscountAmountValue,
    #[iden = "discount_amount"]
    DiscountAmount,
    #[iden = "final_price"]
    FinalPrice,
    #[iden = "adjustment_price"]
    AdjustmentPrice,
    #[iden = "billing_status"]
    BillingStatus,
    #[iden = "billing_type"]
    BillingType,
    #[iden = "created_at"]
    CreatedAt,
}

/// Student products (subscriptions) table schema.
#[derive(Iden)]
pub enum StudentProducts {
    Table,
    #[iden = "student_product_id"]
    StudentProductId,
    #[iden = "student_id"]
    StudentId,
    #[iden = "product_id"]
    ProductId,
    #[iden = "location_id"]
    LocationId,
    #[iden = "start_date"]
    StartDate,
    #[iden = "end_date"]
    EndDate,
    #[iden = "product_status"]
    ProductStatus,
    #[iden = "student_product_label"]
    StudentProductLabel,
    #[iden = "updated_from_student_product_id"]
    UpdatedFromStudentProductId,
    #[iden = "version_number"]
    VersionNumber,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Leaving reasons recorded per order.
#[derive(Iden)]
pub enum OrderLeavingReasons {
    Table,
    #[iden = "order_id"]
    OrderId,
    #[iden = "leaving_reason_id"]
    LeavingReasonId,
}

/// Order action log table schema.
#[derive(Iden)]
pub enum OrderActionLogs {
    Table,
    #[iden = "order_id"]
    OrderId,
    #[iden = "user_id"]
    UserId,
    #[iden = "action"]
    Action,
    #[iden = "comment"]
    Comment,
    #[iden = "created_at"]
    CreatedAt,
}

/// Students table schema.
#[derive(Iden)]
pub enum Students {
    Table,
    #[iden = "student_id"]
    StudentId,
    #[iden = "name"]
    Name,
    #[iden = "grade_id"]
    GradeId,
}

/// Locations table schema.
#[derive(Iden)]
pub enum Locations {
    Table,
    #[iden = "location_id"]
    LocationId,
    #[iden = "name"]
    Name,
}

/// Products table schema.
#[derive(Iden)]
pub enum Products {
    Table,
    #[iden = "product_id"]
    ProductId,
    #[iden = "name"]
    Name,
    #[iden = "available_from"]
    AvailableFrom,
    #[iden = "available_until"]
    AvailableUntil,
    #[iden = "billing_schedule_id"]
    BillingScheduleId,
    #[iden = "tax_id"]
    TaxId,
}

/// Product settings table schema.
#[derive(Iden)]
pub enum ProductSettings {
    Table,
    #[iden = "product_id"]
    ProductId,
    #[iden = "is_pausable"]
    IsPausable,
    #[iden = "is_enrollment_required"]
    IsEnrollmentRequired,
    #[iden = "is_added_to_enrollment_by_default"]
    IsAddedToEnrollmentByDefault,
    #[iden = "is_operation_fee"]
    IsOperationFee,
}

/// Product/location availability.
#[derive(Iden)]
pub enum ProductLocations {
    Table,
    #[iden = "product_id"]
    ProductId,
    #[iden = "location_id"]
    LocationId,
}

/// Product/grade restrictions.
#[derive(Iden)]
pub enum ProductGrades {
    Table,
    #[iden = "product_id"]
    ProductId,
    #[iden = "grade_id"]
    GradeId,
}

/// Discounts applicable per product.
#[derive(Iden)]
pub enum ProductDiscounts {
    Table,
    #[iden = "product_id"]
    ProductId,
    #[iden = "discount_id"]
    DiscountId,
}

/// Catalog prices per product (and billing period for recurring products).
#[derive(Iden)]
pub enum ProductPrices {
    Table,
    #[iden = "product_id"]
    ProductId,
    #[iden = "billing_schedule_period_id"]
    BillingSchedulePeriodId,
    #[iden = "price"]
    Price,
}

/// Discounts table schema.
#[derive(Iden)]
pub enum Discounts {
    Table,
    #[iden = "discount_id"]
    DiscountId,
    #[iden = "name"]
    Name,
    #[iden = "discount_type"]
    DiscountType,
    #[iden = "discount_amount_type"]
    DiscountAmountType,
    #[iden = "discount_amount_value"]
    DiscountAmountValue,
    #[iden = "available_from"]
    AvailableFrom,
    #[iden = "available_until"]
    AvailableUntil,
    #[iden = "is_archived"]
    IsArchived,
}

/// Taxes table schema.
#[derive(Iden)]
pub enum Taxes {
    Table,
    #[iden = "tax_id"]
    TaxId,
    #[iden = "name"]
    Name,
    #[iden = "tax_percentage"]
    TaxPercentage,
    #[iden = "tax_category"]
    TaxCategory,
}

/// Billing schedule periods table schema.
#[derive(Iden)]
pub enum BillingSchedulePeriods {
    Table,
    #[iden = "billing_schedule_period_id"]
    BillingSchedulePeriodId,
    #[iden = "billing_schedule_id"]
    BillingScheduleId,
    #[iden = "name"]
    Name,
    #[iden = "start_date"]
    StartDate,
    #[iden = "end_date"]
    EndDate,
    #[iden = "billing_date"]
    BillingDate,
    #[iden = "is_archived"]
    IsArchived,
}

/// Billing ratios table schema.
#[derive(Iden)]
pub enum BillingRatios {
    Table,
    #[iden = "billing_ratio_id"]
    BillingRatioId,
    #[iden = "billing_schedule_period_id"]
    BillingSchedulePeriodId,
    #[iden = "start_date"]
    StartDate,
    #[iden = "end_date"]
    EndDate,
    #[iden = "numerator"]
    Numerator,
    #[iden = "denominator"]
    Denominator,
}

/// Enrollment status per student and location.
#[derive(Iden)]
pub enum StudentEnrollments {
    Table,
    #[iden = "student_id"]
    StudentId,
    #[iden = "location_id"]
    LocationId,
    #[iden = "status"]
    Status,
}

/// Leaving reasons table schema.
#[derive(Iden)]
pub enum LeavingReasons {
    Table,
    #[iden = "leaving_reason_id"]
    LeavingReasonId,
    #[iden = "name"]
    Name,
    #[iden = "is_archived"]
    IsArchived,
}

/// SQL for creating the order tables.
pub const CREATE_ORDER_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    student_id TEXT NOT NULL,
    location_id TEXT NOT NULL,
    order_type TEXT NOT NULL,
    order_status TEXT NOT NULL,
    order_comment TEXT,
    withdrawal_effective_date TEXT,
    background TEXT,
    future_measures TEXT,
    version_number INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_student ON orders(student_id);

CREATE TABLE IF NOT EXISTS order_items (
    order_id TEXT NOT NULL REFERENCES orders(order_id),
    product_id TEXT NOT NULL,
    discount_id TEXT,
    start_date TEXT,
    end_date TEXT,
    effective_date TEXT,
    student_product_id TEXT,
    PRIMARY KEY (order_id, product_id)
);

CREATE TABLE IF NOT EXISTS order_item_courses (
    order_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    course_id TEXT NOT NULL,
    course_name TEXT NOT NULL,
    weight INTEGER,
    slot INTEGER,
    PRIMARY KEY (order_id, product_id, course_id),
    FOREIGN KEY (order_id, product_id) REFERENCES order_items(order_id, product_id)
);

CREATE TABLE IF NOT EXISTS bill_items (
    order_id TEXT NOT NULL REFERENCES orders(order_id),
    sequence_number INTEGER NOT NULL,
    product_id TEXT NOT NULL,
    location_id TEXT NOT NULL,
    student_product_id TEXT,
    billing_schedule_period_id TEXT,
    price REAL NOT NULL,
    quantity INTEGER,
    tax_id TEXT,
    tax_percentage REAL,
    tax_category TEXT,
    tax_amount REAL,
    discount_id TEXT,
    discount_type TEXT,
    discount_amount_type TEXT,
    discount_amount_value REAL,
    discount_amount REAL,
    final_price REAL NOT NULL,
    adjustment_price REAL,
    billing_status TEXT NOT NULL,
    billing_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (order_id, sequence_number)
);

CREATE INDEX IF NOT EXISTS idx_bill_items_student_product
    ON bill_items(student_product_id, billing_schedule_period_id);

CREATE TABLE IF NOT EXISTS student_products (
    student_product_id TEXT PRIMARY KEY,
    student_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    location_id TEXT NOT NULL,
    start_date TEXT,
    end_date TEXT,
    product_status TEXT NOT NULL,
    student_product_label TEXT NOT NULL,
    updated_from_student_product_id TEXT,
    version_number INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_student_products_student
    ON student_products(student_id, location_id);

CREATE TABLE IF NOT EXISTS order_leaving_reasons (
    order_id TEXT NOT NULL REFERENCES orders(order_id),
    leaving_reason_id TEXT NOT NULL REFERENCES leaving_reasons(leaving_reason_id),
    PRIMARY KEY (order_id, leaving_reason_id)
);

CREATE TABLE IF NOT EXISTS order_action_logs (
    order_id TEXT NOT NULL REFERENCES orders(order_id),
    user_id TEXT NOT NULL,
    action TEXT NOT NULL,
    comment TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_order_action_logs_order ON order_action_logs(order_id);
"#;

/// SQL for creating the catalog tables.
pub const CREATE_CATALOG_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS students (
    student_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    grade_id TEXT
);

CREATE TABLE IF NOT EXISTS locations (
    location_id TEXT PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS products (
    product_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    available_from TEXT NOT NULL,
    available_until TEXT NOT NULL,
    billing_schedule_id TEXT,
    tax_id TEXT
);

CREATE TABLE IF NOT EXISTS product_settings (
    product_id TEXT PRIMARY KEY REFERENCES products(product_id),
    is_pausable INTEGER NOT NULL DEFAULT 1,
    is_enrollment_required INTEGER NOT NULL DEFAULT 0,
    is_added_to_enrollment_by_default INTEGER NOT NULL DEFAULT 0,
    is_operation_fee INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS product_locations (
    product_id TEXT NOT NULL REFERENCES products(product_id),
    location_id TEXT NOT NULL REFERENCES locations(location_id),
    PRIMARY KEY (product_id, location_id)
);

CREATE TABLE IF NOT EXISTS product_grades (
    product_id TEXT NOT NULL REFERENCES products(product_id),
    grade_id TEXT NOT NULL,
    PRIMARY KEY (product_id, grade_id)
);

CREATE TABLE IF NOT EXISTS product_discounts (
    product_id TEXT NOT NULL REFERENCES products(product_id),
    discount_id TEXT NOT NULL REFERENCES discounts(discount_id),
    PRIMARY KEY (product_id, discount_id)
);

CREATE TABLE IF NOT EXISTS product_prices (
    product_id TEXT NOT NULL REFERENCES products(product_id),
    billing_schedule_period_id TEXT,
    price REAL NOT NULL,
    UNIQUE (product_id, billing_schedule_period_id)
);

CREATE TABLE IF NOT EXISTS discounts (
    discount_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    discount_type TEXT NOT NULL,
    discount_amount_type TEXT NOT NULL,
    discount_amount_value REAL NOT NULL,
    available_from TEXT NOT NULL,
    available_until TEXT NOT NULL,
    is_archived INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS taxes (
    tax_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    tax_percentage REAL NOT NULL,
    tax_category TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS billing_schedule_periods (
    billing_schedule_period_id TEXT PRIMARY KEY,
    billing_schedule_id TEXT NOT NULL,
    name TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    billing_date TEXT NOT NULL,
    is_archived INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_periods_schedule
    ON billing_schedule_periods(billing_schedule_id);

CREATE TABLE IF NOT EXISTS billing_ratios (
    billing_ratio_id TEXT PRIMARY KEY,
    billing_schedule_period_id TEXT NOT NULL REFERENCES billing_schedule_periods(billing_schedule_period_id),
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    numerator INTEGER NOT NULL,
    denominator INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS student_enrollments (
    student_id TEXT NOT NULL REFERENCES students(student_id),
    location_id TEXT NOT NULL REFERENCES locations(location_id),
    status TEXT NOT NULL,
    PRIMARY KEY (student_id, location_id)
);

CREATE TABLE IF NOT EXISTS leaving_reasons (
    leaving_reason_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    is_archived INTEGER NOT NULL DEFAULT 0
);
"#;
