//! Storage interfaces and implementations.
//!
//! `CatalogStore` serves the reference data orders are validated against;
//! `OrderStore` owns the mutable order/subscription state. Both mutating
//! operations (`submit_order`, `void_order`) are atomic: every row change of
//! one order lands in a single transaction or not at all.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::config::StorageConfig;
use crate::domain::{
    BillItem, BillingRatio, BillingSchedulePeriod, CourseItem, Discount, EnrollmentStatus,
    LeavingReason, Location, Order, OrderActionLog, OrderItem, Product, ProductSetting, Student,
    StudentProduct, StudentProductLabel, StudentProductStatus, Tax,
};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("duplicate key: {constraint}")]
    DuplicateKey { constraint: String },

    #[error("version conflict on {entity} {id}")]
    VersionConflict { entity: &'static str, id: String },

    #[error("malformed row: {detail}")]
    MalformedRow { detail: String },

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Update applied to an existing student product, guarded by the version
/// the caller read. The row is only touched when `expected_version` still
/// matches; the stored version is then bumped by one.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentProductUpdate {
    pub student_product_id: String,
    pub expected_version: i32,
    pub product_status: StudentProductStatus,
    pub student_product_label: StudentProductLabel,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Subscription state change carried by an order.
#[derive(Debug, Clone, PartialEq)]
pub enum StudentProductChange {
    Create(StudentProduct),
    Update(StudentProductUpdate),
}

/// Everything one accepted order writes, applied in a single transaction.
#[derive(Debug, Clone)]
pub struct OrderSubmission {
    pub order: Order,
    pub order_items: Vec<OrderItem>,
    pub course_items: Vec<CourseItem>,
    pub bill_items: Vec<BillItem>,
    pub product_changes: Vec<StudentProductChange>,
    pub leaving_reason_ids: Vec<String>,
    pub action_log: OrderActionLog,
}

/// Everything voiding one order writes, applied in a single transaction.
/// The order's bill items are cancelled as part of the same transaction.
#[derive(Debug, Clone)]
pub struct OrderVoid {
    pub order_id: String,
    pub expected_version: i32,
    pub product_changes: Vec<StudentProductUpdate>,
    pub action_log: OrderActionLog,
}

/// Read access to reference data: students, locations, the product catalog,
/// discounts, taxes, billing schedules.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_student(&self, student_id: &str) -> Result<Student>;

    async fn get_location(&self, location_id: &str) -> Result<Location>;

    async fn get_product(&self, product_id: &str) -> Result<Product>;

    async fn get_product_setting(&self, product_id: &str) -> Result<ProductSetting>;

    /// Whether the product is sold at the given location.
    async fn product_sold_at_location(&self, product_id: &str, location_id: &str) -> Result<bool>;

    /// Grade ids the product is restricted to. Empty means unrestricted.
    async fn product_grades(&self, product_id: &str) -> Result<Vec<String>>;

    /// Whether the discount may be applied to the product.
    async fn product_has_discount(&self, product_id: &str, discount_id: &str) -> Result<bool>;

    async fn get_discount(&self, discount_id: &str) -> Result<Discount>;

    async fn get_tax(&self, tax_id: &str) -> Result<Tax>;

    /// Catalog price of a product, per billing period for recurring
    /// products, with `None` selecting the one-time price row.
    async fn get_product_price(&self, product_id: &str, period_id: Option<&str>) -> Result<f64>;

    async fn get_billing_schedule_period(&self, period_id: &str) -> Result<BillingSchedulePeriod>;

    /// End date of the last (non-archived) period of a billing schedule.
    async fn latest_period_end(&self, billing_schedule_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// The proration ratio row whose date range contains `at`, if any.
    async fn billing_ratio_for(
        &self,
        period_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<BillingRatio>>;

    /// Enrollment status of the student at a location, `None` when the
    /// student has no enrollment record there.
    async fn enrollment_status(
        &self,
        student_id: &str,
        location_id: &str,
    ) -> Result<Option<EnrollmentStatus>>;

    /// Subset of `ids` that do not name an active leaving reason.
    async fn missing_leaving_reasons(&self, ids: &[String]) -> Result<Vec<String>>;
}

/// Mutable order and subscription state.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist an accepted order atomically. Fails with
    /// [`StorageError::VersionConflict`] if any updated student product has
    /// moved past its expected version, and [`StorageError::DuplicateKey`]
    /// if a generated id collides.
    async fn submit_order(&self, submission: OrderSubmission) -> Result<()>;

    async fn get_order(&self, order_id: &str) -> Result<Order>;

    async fn get_order_items(&self, order_id: &str) -> Result<Vec<OrderItem>>;

    async fn get_student_product(&self, student_product_id: &str) -> Result<StudentProduct>;

    async fn get_bill_items(&self, order_id: &str) -> Result<Vec<BillItem>>;

    /// Final price most recently billed (status BILLED) for a student
    /// product in a period, used to verify adjustment lines.
    async fn latest_billed_final_price(
        &self,
        student_product_id: &str,
        period_id: &str,
    ) -> Result<Option<f64>>;

    /// Void an order atomically: flip it to VOIDED, cancel its bill items,
    /// and apply the subscription reversals, all version-guarded.
    async fn void_order(&self, void: OrderVoid) -> Result<()>;

    /// Student products of one student across the given locations (all
    /// locations when empty), newest first, windowed by limit/offset.
    /// Returns the page and the total count.
    async fn list_student_products(
        &self,
        student_id: &str,
        location_ids: &[String],
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<StudentProduct>, i64)>;

    /// Promote every scheduled label in `labels` whose trigger date has
    /// arrived by `effective`. Returns the ids of the products changed;
    /// already-promoted products are left alone, so re-runs return empty.
    async fn promote_scheduled(
        &self,
        effective: DateTime<Utc>,
        labels: &[StudentProductLabel],
    ) -> Result<Vec<String>>;

    async fn get_action_logs(&self, order_id: &str) -> Result<Vec<OrderActionLog>>;

    /// Leaving reasons recorded with an order.
    async fn get_order_leaving_reasons(&self, order_id: &str) -> Result<Vec<LeavingReason>>;
}

/// Initialize storage based on configuration.
///
/// Returns a tuple of (CatalogStore, OrderStore) implementations based on
/// the configured storage type.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<(Arc<dyn CatalogStore>, Arc<dyn OrderStore>), Box<dyn std::error::Error>>
{
    info!("Storage: {}", config.storage_type);

    match config.storage_type.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;

            let store = Arc::new(SqliteStore::new(pool));
            store.init_schema().await?;

            Ok((store.clone(), store))
        }
        #[cfg(not(feature = "sqlite"))]
        "sqlite" => {
            error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err("SQLite feature not enabled".into())
        }
        "memory" => {
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
        other => {
            error!("Unknown storage type: {}", other);
            Err(format!("Unknown storage type: {}", other).into())
        }
    }
}
