//! Order request validation against the catalog.
//!
//! Every CreateOrder request passes through here before any price math or
//! state transition runs: referenced entities must exist, the product must
//! be sellable to this student at this location on the processing date, and
//! per-product flags must permit the order type. Checks fail fast and carry
//! the offending id, so callers can surface a precise message.
//!
//! Enrollment eligibility is deliberately a separate error kind from plain
//! validation: clients show it as "cannot order yet", not "bad request".

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tonic::Status;

use crate::domain::{
    BillingSchedulePeriod, Discount, EnrollmentStatus, Location, OrderType, Product,
    ProductSetting, Student, Tax,
};
use crate::storage::{CatalogStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("student id cannot be empty")]
    EmptyStudentId,

    #[error("location id cannot be empty")]
    EmptyLocationId,

    #[error("{field} is required for {order_type} orders")]
    MissingField {
        field: &'static str,
        order_type: &'static str,
    },

    #[error("order item for product {product_id} must name the target student product")]
    MissingStudentProductRef { product_id: String },

    #[error("order item for product {product_id} must carry the student product version")]
    MissingVersionRef { product_id: String },

    #[error("student not found: {0}")]
    StudentNotFound(String),

    #[error("location not found: {0}")]
    LocationNotFound(String),

    #[error("product not found: {0}")]
    ProductNotFound(String),

    #[error("product {product_id} is not sold at location {location_id}")]
    NotSoldAtLocation {
        product_id: String,
        location_id: String,
    },

    #[error("product {product_id} is outside its availability window")]
    ProductUnavailable { product_id: String },

    #[error("product {product_id} is not available for the student's grade")]
    GradeRestricted { product_id: String },

    #[error("product {product_id} cannot be paused")]
    NotPausable { product_id: String },

    #[error("student {student_id} is not enrolled at location {location_id}")]
    NotEnrolled {
        student_id: String,
        location_id: String,
    },

    #[error("discount not found: {0}")]
    DiscountNotFound(String),

    #[error("discount {discount_id} does not apply to product {product_id}")]
    DiscountNotLinked {
        discount_id: String,
        product_id: String,
    },

    #[error("discount {0} is archived")]
    DiscountArchived(String),

    #[error("discount {0} is outside its availability window")]
    DiscountUnavailable(String),

    #[error("tax not found: {0}")]
    TaxNotFound(String),

    #[error("billing schedule period not found: {0}")]
    PeriodNotFound(String),

    #[error("billing schedule period {period_id} does not belong to product {product_id}")]
    PeriodScheduleMismatch {
        period_id: String,
        product_id: String,
    },

    #[error("billing item for product {product_id} has no matching order item")]
    ChargeWithoutItem { product_id: String },

    #[error("unknown or archived leaving reasons: {}", ids.join(", "))]
    UnknownLeavingReasons { ids: Vec<String> },

    #[error("product {product_id} appears more than once in the order")]
    DuplicateProduct { product_id: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<ValidationError> for Status {
    fn from(err: ValidationError) -> Self {
        match &err {
            ValidationError::NotEnrolled { .. } => Status::failed_precondition(err.to_string()),
            ValidationError::Storage(_) => Status::internal(err.to_string()),
            _ => Status::invalid_argument(err.to_string()),
        }
    }
}

/// One order item reduced to the references validation inspects.
#[derive(Debug, Clone)]
pub struct ItemView<'a> {
    pub product_id: &'a str,
    pub discount_id: Option<&'a str>,
    pub student_product_id: Option<&'a str>,
    pub student_product_version: Option<i32>,
}

/// One billing line reduced to the references validation inspects.
#[derive(Debug, Clone)]
pub struct ChargeView<'a> {
    pub product_id: &'a str,
    pub tax_id: Option<&'a str>,
    pub billing_schedule_period_id: Option<&'a str>,
}

/// The validated slice of a CreateOrder request.
#[derive(Debug, Clone)]
pub struct OrderView<'a> {
    pub student_id: &'a str,
    pub location_id: &'a str,
    pub order_type: OrderType,
    pub items: Vec<ItemView<'a>>,
    pub charges: Vec<ChargeView<'a>>,
    pub leaving_reason_ids: &'a [String],
    pub background: Option<&'a str>,
    pub future_measures: Option<&'a str>,
}

/// Catalog rows resolved while validating, handed to price verification so
/// nothing is looked up twice.
#[derive(Debug)]
pub struct CatalogContext {
    pub student: Student,
    pub location: Location,
    pub products: HashMap<String, Product>,
    pub discounts: HashMap<String, Discount>,
    pub taxes: HashMap<String, Tax>,
    pub periods: HashMap<String, BillingSchedulePeriod>,
}

pub struct OrderValidator<'a> {
    catalog: &'a dyn CatalogStore,
    now: DateTime<Utc>,
}

impl<'a> OrderValidator<'a> {
    pub fn new(catalog: &'a dyn CatalogStore, now: DateTime<Utc>) -> Self {
        Self { catalog, now }
    }

    /// Run every check against the request; the first failure wins.
    pub async fn validate(
        &self,
        view: &OrderView<'_>,
    ) -> Result<CatalogContext, ValidationError> {
        check_required_fields(view)?;

        let student = self
            .catalog
            .get_student(view.student_id)
            .await
            .map_err(|e| entity_error(e, ValidationError::StudentNotFound))?;
        let location = self
            .catalog
            .get_location(view.location_id)
            .await
            .map_err(|e| entity_error(e, ValidationError::LocationNotFound))?;
        let mut ctx = CatalogContext {
            student,
            location,
            products: HashMap::new(),
            discounts: HashMap::new(),
            taxes: HashMap::new(),
            periods: HashMap::new(),
        };

        for item in &view.items {
            self.check_item(view, item, &mut ctx).await?;
        }
        for item in &view.items {
            if let Some(discount_id) = item.discount_id {
                self.check_discount(discount_id, item.product_id, &mut ctx)
                    .await?;
            }
        }
        for charge in &view.charges {
            self.check_charge(charge, &mut ctx).await?;
        }

        if !view.leaving_reason_ids.is_empty() {
            let missing = self
                .catalog
                .missing_leaving_reasons(view.leaving_reason_ids)
                .await?;
            if !missing.is_empty() {
                return Err(ValidationError::UnknownLeavingReasons { ids: missing });
            }
        }

        let mut seen = HashSet::new();
        for item in &view.items {
            if !seen.insert(item.product_id) {
                return Err(ValidationError::DuplicateProduct {
                    product_id: item.product_id.to_string(),
                });
            }
        }

        Ok(ctx)
    }

    async fn check_item(
        &self,
        view: &OrderView<'_>,
        item: &ItemView<'_>,
        ctx: &mut CatalogContext,
    ) -> Result<(), ValidationError> {
        let product = self
            .catalog
            .get_product(item.product_id)
            .await
            .map_err(|e| entity_error(e, ValidationError::ProductNotFound))?;

        if !self
            .catalog
            .product_sold_at_location(item.product_id, view.location_id)
            .await?
        {
            return Err(ValidationError::NotSoldAtLocation {
                product_id: item.product_id.to_string(),
                location_id: view.location_id.to_string(),
            });
        }
        if self.now < product.available_from || self.now > product.available_until {
            return Err(ValidationError::ProductUnavailable {
                product_id: item.product_id.to_string(),
            });
        }

        let grades = self.catalog.product_grades(item.product_id).await?;
        if !grades.is_empty() {
            let eligible = ctx
                .student
                .grade_id
                .as_ref()
                .map(|g| grades.contains(g))
                .unwrap_or(false);
            if !eligible {
                return Err(ValidationError::GradeRestricted {
                    product_id: item.product_id.to_string(),
                });
            }
        }

        let setting = match self.catalog.get_product_setting(item.product_id).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => default_setting(item.product_id),
            Err(e) => return Err(e.into()),
        };
        if view.order_type == OrderType::Loa && !setting.is_pausable {
            return Err(ValidationError::NotPausable {
                product_id: item.product_id.to_string(),
            });
        }
        if setting.is_enrollment_required {
            let status = self
                .catalog
                .enrollment_status(view.student_id, view.location_id)
                .await?;
            if status != Some(EnrollmentStatus::Enrolled) {
                return Err(ValidationError::NotEnrolled {
                    student_id: view.student_id.to_string(),
                    location_id: view.location_id.to_string(),
                });
            }
        }

        ctx.products.insert(item.product_id.to_string(), product);
        Ok(())
    }

    async fn check_discount(
        &self,
        discount_id: &str,
        product_id: &str,
        ctx: &mut CatalogContext,
    ) -> Result<(), ValidationError> {
        let discount = self
            .catalog
            .get_discount(discount_id)
            .await
            .map_err(|e| entity_error(e, ValidationError::DiscountNotFound))?;

        if !self
            .catalog
            .product_has_discount(product_id, discount_id)
            .await?
        {
            return Err(ValidationError::DiscountNotLinked {
                discount_id: discount_id.to_string(),
                product_id: product_id.to_string(),
            });
        }
        if discount.is_archived {
            return Err(ValidationError::DiscountArchived(discount_id.to_string()));
        }
        if self.now < discount.available_from || self.now > discount.available_until {
            return Err(ValidationError::DiscountUnavailable(
                discount_id.to_string(),
            ));
        }

        ctx.discounts.insert(discount_id.to_string(), discount);
        Ok(())
    }

    async fn check_charge(
        &self,
        charge: &ChargeView<'_>,
        ctx: &mut CatalogContext,
    ) -> Result<(), ValidationError> {
        let Some(product) = ctx.products.get(charge.product_id) else {
            return Err(ValidationError::ChargeWithoutItem {
                product_id: charge.product_id.to_string(),
            });
        };

        if let Some(tax_id) = charge.tax_id {
            if !ctx.taxes.contains_key(tax_id) {
                let tax = self
                    .catalog
                    .get_tax(tax_id)
                    .await
                    .map_err(|e| entity_error(e, ValidationError::TaxNotFound))?;
                ctx.taxes.insert(tax_id.to_string(), tax);
            }
        }

        if let Some(period_id) = charge.billing_schedule_period_id {
            let period = match ctx.periods.get(period_id) {
                Some(p) => p.clone(),
                None => self
                    .catalog
                    .get_billing_schedule_period(period_id)
                    .await
                    .map_err(|e| entity_error(e, ValidationError::PeriodNotFound))?,
            };
            if product.billing_schedule_id.as_deref() != Some(period.billing_schedule_id.as_str())
            {
                return Err(ValidationError::PeriodScheduleMismatch {
                    period_id: period_id.to_string(),
                    product_id: charge.product_id.to_string(),
                });
            }
            ctx.periods.insert(period_id.to_string(), period);
        }
        Ok(())
    }
}

fn check_required_fields(view: &OrderView<'_>) -> Result<(), ValidationError> {
    if view.student_id.is_empty() {
        return Err(ValidationError::EmptyStudentId);
    }
    if view.location_id.is_empty() {
        return Err(ValidationError::EmptyLocationId);
    }

    let order_type = view.order_type.as_str();
    match view.order_type {
        OrderType::Loa | OrderType::Withdrawal => {
            if view.leaving_reason_ids.is_empty() {
                return Err(ValidationError::MissingField {
                    field: "leaving reasons",
                    order_type,
                });
            }
            require_text(view.background, "background", order_type)?;
            require_text(view.future_measures, "future measures", order_type)?;
        }
        OrderType::Graduate => {
            require_text(view.background, "background", order_type)?;
            require_text(view.future_measures, "future measures", order_type)?;
        }
        _ => {}
    }

    if view.order_type.mutates_existing() {
        for item in &view.items {
            if item.student_product_id.map(str::is_empty).unwrap_or(true) {
                return Err(ValidationError::MissingStudentProductRef {
                    product_id: item.product_id.to_string(),
                });
            }
            if item.student_product_version.is_none() {
                return Err(ValidationError::MissingVersionRef {
                    product_id: item.product_id.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn require_text(
    value: Option<&str>,
    field: &'static str,
    order_type: &'static str,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(ValidationError::MissingField { field, order_type }),
    }
}

/// Products with no settings row get the conservative defaults.
fn default_setting(product_id: &str) -> ProductSetting {
    ProductSetting {
        product_id: product_id.to_string(),
        is_pausable: false,
        is_enrollment_required: false,
        is_added_to_enrollment_by_default: false,
        is_operation_fee: false,
    }
}

fn entity_error(
    err: StorageError,
    wrap: impl FnOnce(String) -> ValidationError,
) -> ValidationError {
    match err {
        StorageError::NotFound { id, .. } => wrap(id),
        other => ValidationError::Storage(other),
    }
}
