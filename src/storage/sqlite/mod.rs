//! SQLite storage backend.
//!
//! Implements both storage traits on one connection pool. Queries are built
//! with sea-query against the identifiers in [`super::schema`]. Timestamps
//! are stored as fixed-width RFC3339 TEXT (microseconds, Zulu), so date
//! comparisons inside SQL are plain string comparisons. Mutating operations
//! run in a single transaction; optimistic version checks are version-guarded
//! UPDATEs whose affected-row count decides between success and conflict.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{Expr, Order as SortOrder, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::domain::student_product::promote_scheduled as promotion_target;
use crate::domain::{
    BillItem, BillingRatio, BillingSchedulePeriod, BillingStatus, BillingType, Discount,
    DiscountAmountType,
    DiscountType, EnrollmentStatus, LeavingReason, Location, Order, OrderAction, OrderActionLog,
    OrderItem, OrderStatus, OrderType, Product, ProductSetting, Student, StudentProduct,
    StudentProductLabel, StudentProductStatus, Tax, TaxCategory,
};
use crate::storage::{
    CatalogStore, OrderStore, OrderSubmission, OrderVoid, Result, StorageError,
    StudentProductChange, StudentProductUpdate,
};

use super::schema::{
    BillItems, BillingRatios, BillingSchedulePeriods, Discounts, LeavingReasons, Locations,
    OrderActionLogs, OrderItemCourses, OrderItems, OrderLeavingReasons, Orders, ProductDiscounts,
    ProductGrades, ProductLocations, ProductPrices, ProductSettings, Products, StudentEnrollments,
    StudentProducts, Students, Taxes, CREATE_CATALOG_TABLES, CREATE_ORDER_TABLES,
};

/// SQLite implementation of both storage traits.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_CATALOG_TABLES)
            .execute(&self.pool)
            .await?;
        sqlx::raw_sql(CREATE_ORDER_TABLES)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_submission(
        conn: &mut SqliteConnection,
        submission: &OrderSubmission,
    ) -> Result<()> {
        let order = &submission.order;
        let query = Query::insert()
            .into_table(Orders::Table)
            .columns([
                Orders::OrderId,
                Orders::StudentId,
                Orders::LocationId,
                Orders::OrderType,
                Orders::OrderStatus,
                Orders::OrderComment,
                Orders::WithdrawalEffectiveDate,
                Orders::Background,
                Orders::FutureMeasures,
                Orders::VersionNumber,
                Orders::CreatedAt,
            ])
            .values_panic([
                order.order_id.clone().into(),
                order.student_id.clone().into(),
                order.location_id.clone().into(),
                order.order_type.as_str().into(),
                order.status.as_str().into(),
                order.comment.clone().into(),
                fmt_opt(order.withdrawal_effective_date).into(),
                order.background.clone().into(),
                order.future_measures.clone().into(),
                order.version_number.into(),
                fmt_dt(order.created_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .execute(&mut *conn)
            .await
            .map_err(classify)?;

        for item in &submission.order_items {
            let query = Query::insert()
                .into_table(OrderItems::Table)
                .columns([
                    OrderItems::OrderId,
                    OrderItems::ProductId,
                    OrderItems::DiscountId,
                    OrderItems::StartDate,
                    OrderItems::EndDate,
                    OrderItems::EffectiveDate,
                    OrderItems::StudentProductId,
                ])
                .values_panic([
                    item.order_id.clone().into(),
                    item.product_id.clone().into(),
                    item.discount_id.clone().into(),
                    fmt_opt(item.start_date).into(),
                    fmt_opt(item.end_date).into(),
                    fmt_opt(item.effective_date).into(),
                    item.student_product_id.clone().into(),
                ])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query)
                .execute(&mut *conn)
                .await
                .map_err(classify)?;
        }

        for course in &submission.course_items {
            let query = Query::insert()
                .into_table(OrderItemCourses::Table)
                .columns([
                    OrderItemCourses::OrderId,
                    OrderItemCourses::ProductId,
                    OrderItemCourses::CourseId,
                    OrderItemCourses::CourseName,
                    OrderItemCourses::Weight,
                    OrderItemCourses::Slot,
                ])
                .values_panic([
                    course.order_id.clone().into(),
                    course.product_id.clone().into(),
                    course.course_id.clone().into(),
                    course.course_name.clone().into(),
                    course.weight.into(),
                    course.slot.into(),
                ])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query)
                .execute(&mut *conn)
                .await
                .map_err(classify)?;
        }

        for bill in &submission.bill_items {
            let query = Query::insert()
                .into_table(BillItems::Table)
                .columns(bill_item_columns())
                .values_panic([
                    bill.order_id.clone().into(),
                    bill.sequence_number.into(),
                    bill.product_id.clone().into(),
                    bill.location_id.clone().into(),
                    bill.student_product_id.clone().into(),
                    bill.billing_schedule_period_id.clone().into(),
                    bill.price.into(),
                    bill.quantity.into(),
                    bill.tax_id.clone().into(),
                    bill.tax_percentage.into(),
                    bill.tax_category.map(|c| c.as_str().to_string()).into(),
                    bill.tax_amount.into(),
                    bill.discount_id.clone().into(),
                    bill.discount_type.map(|d| d.as_str().to_string()).into(),
                    bill.discount_amount_type
                        .map(|d| d.as_str().to_string())
                        .into(),
                    bill.discount_amount_value.into(),
                    bill.discount_amount.into(),
                    bill.final_price.into(),
                    bill.adjustment_price.into(),
                    bill.billing_status.as_str().into(),
                    bill.billing_type.as_str().into(),
                    fmt_dt(bill.created_at).into(),
                ])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query)
                .execute(&mut *conn)
                .await
                .map_err(classify)?;
        }

        for change in &submission.product_changes {
            match change {
                StudentProductChange::Create(sp) => {
                    Self::insert_student_product(conn, sp).await?;
                }
                StudentProductChange::Update(update) => {
                    Self::update_student_product(conn, update).await?;
                }
            }
        }

        for reason_id in &submission.leaving_reason_ids {
            let query = Query::insert()
                .into_table(OrderLeavingReasons::Table)
                .columns([
                    OrderLeavingReasons::OrderId,
                    OrderLeavingReasons::LeavingReasonId,
                ])
                .values_panic([order.order_id.clone().into(), reason_id.clone().into()])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query)
                .execute(&mut *conn)
                .await
                .map_err(classify)?;
        }

        Self::insert_action_log(conn, &submission.action_log).await
    }

    async fn insert_student_product(
        conn: &mut SqliteConnection,
        sp: &StudentProduct,
    ) -> Result<()> {
        let query = Query::insert()
            .into_table(StudentProducts::Table)
            .columns(student_product_columns())
            .values_panic([
                sp.student_product_id.clone().into(),
                sp.student_id.clone().into(),
                sp.product_id.clone().into(),
                sp.location_id.clone().into(),
                fmt_opt(sp.start_date).into(),
                fmt_opt(sp.end_date).into(),
                sp.product_status.as_str().into(),
                sp.student_product_label.as_str().into(),
                sp.updated_from_student_product_id.clone().into(),
                sp.version_number.into(),
                fmt_dt(sp.created_at).into(),
                fmt_dt(sp.updated_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .execute(&mut *conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Version-guarded write to one student product. Zero affected rows
    /// means the row is gone or its version moved, either way a conflict.
    async fn update_student_product(
        conn: &mut SqliteConnection,
        update: &StudentProductUpdate,
    ) -> Result<()> {
        let query = Query::update()
            .table(StudentProducts::Table)
            .value(
                StudentProducts::ProductStatus,
                update.product_status.as_str(),
            )
            .value(
                StudentProducts::StudentProductLabel,
                update.student_product_label.as_str(),
            )
            .value(StudentProducts::StartDate, fmt_opt(update.start_date))
            .value(StudentProducts::EndDate, fmt_opt(update.end_date))
            .value(StudentProducts::UpdatedAt, fmt_dt(update.updated_at))
            .value(
                StudentProducts::VersionNumber,
                Expr::col(StudentProducts::VersionNumber).add(1),
            )
            .and_where(
                Expr::col(StudentProducts::StudentProductId)
                    .eq(update.student_product_id.as_str()),
            )
            .and_where(Expr::col(StudentProducts::VersionNumber).eq(update.expected_version))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::VersionConflict {
                entity: "student product",
                id: update.student_product_id.clone(),
            });
        }
        Ok(())
    }

    async fn insert_action_log(conn: &mut SqliteConnection, log: &OrderActionLog) -> Result<()> {
        let query = Query::insert()
            .into_table(OrderActionLogs::Table)
            .columns([
                OrderActionLogs::OrderId,
                OrderActionLogs::UserId,
                OrderActionLogs::Action,
                OrderActionLogs::Comment,
                OrderActionLogs::CreatedAt,
            ])
            .values_panic([
                log.order_id.clone().into(),
                log.user_id.clone().into(),
                log.action.as_str().into(),
                log.comment.clone().into(),
                fmt_dt(log.created_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .execute(&mut *conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn apply_void(conn: &mut SqliteConnection, void: &OrderVoid) -> Result<()> {
        let query = Query::update()
            .table(Orders::Table)
            .value(Orders::OrderStatus, OrderStatus::Voided.as_str())
            .value(
                Orders::VersionNumber,
                Expr::col(Orders::VersionNumber).add(1),
            )
            .and_where(Expr::col(Orders::OrderId).eq(void.order_id.as_str()))
            .and_where(Expr::col(Orders::VersionNumber).eq(void.expected_version))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            // Zero rows is either a missing order or a moved version.
            let probe = Query::select()
                .column(Orders::OrderId)
                .from(Orders::Table)
                .and_where(Expr::col(Orders::OrderId).eq(void.order_id.as_str()))
                .to_string(SqliteQueryBuilder);
            let exists = sqlx::query(&probe).fetch_optional(&mut *conn).await?;
            return Err(match exists {
                Some(_) => StorageError::VersionConflict {
                    entity: "order",
                    id: void.order_id.clone(),
                },
                None => StorageError::NotFound {
                    entity: "order",
                    id: void.order_id.clone(),
                },
            });
        }

        for update in &void.product_changes {
            Self::update_student_product(conn, update).await?;
        }

        let cancel = Query::update()
            .table(BillItems::Table)
            .value(BillItems::BillingStatus, BillingStatus::Cancelled.as_str())
            .and_where(Expr::col(BillItems::OrderId).eq(void.order_id.as_str()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&cancel).execute(&mut *conn).await?;

        Self::insert_action_log(conn, &void.action_log).await
    }

    async fn promote_in_tx(
        conn: &mut SqliteConnection,
        effective: DateTime<Utc>,
        labels: &[StudentProductLabel],
    ) -> Result<Vec<String>> {
        let query = Query::select()
            .columns([
                StudentProducts::StudentProductId,
                StudentProducts::StudentProductLabel,
                StudentProducts::VersionNumber,
            ])
            .from(StudentProducts::Table)
            .and_where(
                Expr::col(StudentProducts::StudentProductLabel)
                    .is_in(labels.iter().map(|l| l.as_str())),
            )
            .and_where(Expr::col(StudentProducts::EndDate).is_not_null())
            .and_where(Expr::col(StudentProducts::EndDate).lte(fmt_dt(effective)))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;
        let now = fmt_dt(Utc::now());
        let mut promoted = Vec::new();

        for row in rows {
            let id: String = row.get("student_product_id");
            let label_text: String = row.get("student_product_label");
            let version: i32 = row.get("version_number");
            let label = decode(
                &label_text,
                StudentProductLabel::parse,
                "student product label",
            )?;
            let (status, next_label) = match promotion_target(label) {
                Some(target) => target,
                None => continue,
            };

            let update = Query::update()
                .table(StudentProducts::Table)
                .value(StudentProducts::ProductStatus, status.as_str())
                .value(StudentProducts::StudentProductLabel, next_label.as_str())
                .value(StudentProducts::UpdatedAt, now.as_str())
                .value(
                    StudentProducts::VersionNumber,
                    Expr::col(StudentProducts::VersionNumber).add(1),
                )
                .and_where(Expr::col(StudentProducts::StudentProductId).eq(id.as_str()))
                .and_where(Expr::col(StudentProducts::VersionNumber).eq(version))
                .to_string(SqliteQueryBuilder);
            let result = sqlx::query(&update).execute(&mut *conn).await?;
            if result.rows_affected() == 1 {
                promoted.push(id);
            }
        }

        promoted.sort();
        Ok(promoted)
    }
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn get_student(&self, student_id: &str) -> Result<Student> {
        let query = Query::select()
            .columns([Students::StudentId, Students::Name, Students::GradeId])
            .from(Students::Table)
            .and_where(Expr::col(Students::StudentId).eq(student_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "student",
                id: student_id.to_string(),
            })?;

        Ok(Student {
            student_id: row.get("student_id"),
            name: row.get("name"),
            grade_id: row.get("grade_id"),
        })
    }

    async fn get_location(&self, location_id: &str) -> Result<Location> {
        let query = Query::select()
            .columns([Locations::LocationId, Locations::Name])
            .from(Locations::Table)
            .and_where(Expr::col(Locations::LocationId).eq(location_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "location",
                id: location_id.to_string(),
            })?;

        Ok(Location {
            location_id: row.get("location_id"),
            name: row.get("name"),
        })
    }

    async fn get_product(&self, product_id: &str) -> Result<Product> {
        let query = Query::select()
            .columns([
                Products::ProductId,
                Products::Name,
                Products::AvailableFrom,
                Products::AvailableUntil,
                Products::BillingScheduleId,
                Products::TaxId,
            ])
            .from(Products::Table)
            .and_where(Expr::col(Products::ProductId).eq(product_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "product",
                id: product_id.to_string(),
            })?;

        product_from_row(&row)
    }

    async fn get_product_setting(&self, product_id: &str) -> Result<ProductSetting> {
        let query = Query::select()
            .columns([
                ProductSettings::ProductId,
                ProductSettings::IsPausable,
                ProductSettings::IsEnrollmentRequired,
                ProductSettings::IsAddedToEnrollmentByDefault,
                ProductSettings::IsOperationFee,
            ])
            .from(ProductSettings::Table)
            .and_where(Expr::col(ProductSettings::ProductId).eq(product_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "product setting",
                id: product_id.to_string(),
            })?;

        Ok(ProductSetting {
            product_id: row.get("product_id"),
            is_pausable: row.get("is_pausable"),
            is_enrollment_required: row.get("is_enrollment_required"),
            is_added_to_enrollment_by_default: row.get("is_added_to_enrollment_by_default"),
            is_operation_fee: row.get("is_operation_fee"),
        })
    }

    async fn product_sold_at_location(&self, product_id: &str, location_id: &str) -> Result<bool> {
        let query = Query::select()
            .column(ProductLocations::ProductId)
            .from(ProductLocations::Table)
            .and_where(Expr::col(ProductLocations::ProductId).eq(product_id))
            .and_where(Expr::col(ProductLocations::LocationId).eq(location_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.is_some())
    }

    async fn product_grades(&self, product_id: &str) -> Result<Vec<String>> {
        let query = Query::select()
            .column(ProductGrades::GradeId)
            .from(ProductGrades::Table)
            .and_where(Expr::col(ProductGrades::ProductId).eq(product_id))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("grade_id"))
            .collect())
    }

    async fn product_has_discount(&self, product_id: &str, discount_id: &str) -> Result<bool> {
        let query = Query::select()
            .column(ProductDiscounts::ProductId)
            .from(ProductDiscounts::Table)
            .and_where(Expr::col(ProductDiscounts::ProductId).eq(product_id))
            .and_where(Expr::col(ProductDiscounts::DiscountId).eq(discount_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.is_some())
    }

    async fn get_discount(&self, discount_id: &str) -> Result<Discount> {
        let query = Query::select()
            .columns([
                Discounts::DiscountId,
                Discounts::Name,
                Discounts::DiscountType,
                Discounts::DiscountAmountType,
                Discounts::DiscountAmountValue,
                Discounts::AvailableFrom,
                Discounts::AvailableUntil,
                Discounts::IsArchived,
            ])
            .from(Discounts::Table)
            .and_where(Expr::col(Discounts::DiscountId).eq(discount_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "discount",
                id: discount_id.to_string(),
            })?;

        discount_from_row(&row)
    }

    async fn get_tax(&self, tax_id: &str) -> Result<Tax> {
        let query = Query::select()
            .columns([
                Taxes::TaxId,
                Taxes::Name,
                Taxes::TaxPercentage,
                Taxes::TaxCategory,
            ])
            .from(Taxes::Table)
            .and_where(Expr::col(Taxes::TaxId).eq(tax_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "tax",
                id: tax_id.to_string(),
            })?;

        let category: String = row.get("tax_category");
        Ok(Tax {
            tax_id: row.get("tax_id"),
            name: row.get("name"),
            tax_percentage: row.get("tax_percentage"),
            tax_category: decode(&category, TaxCategory::parse, "tax category")?,
        })
    }

    async fn get_product_price(&self, product_id: &str, period_id: Option<&str>) -> Result<f64> {
        let mut query = Query::select();
        query
            .column(ProductPrices::Price)
            .from(ProductPrices::Table)
            .and_where(Expr::col(ProductPrices::ProductId).eq(product_id));
        match period_id {
            Some(period) => {
                query.and_where(Expr::col(ProductPrices::BillingSchedulePeriodId).eq(period));
            }
            None => {
                query.and_where(Expr::col(ProductPrices::BillingSchedulePeriodId).is_null());
            }
        }
        let sql = query.to_string(SqliteQueryBuilder);

        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "product price",
                id: product_id.to_string(),
            })?;

        Ok(row.get("price"))
    }

    async fn get_billing_schedule_period(&self, period_id: &str) -> Result<BillingSchedulePeriod> {
        let query = Query::select()
            .columns([
                BillingSchedulePeriods::BillingSchedulePeriodId,
                BillingSchedulePeriods::BillingScheduleId,
                BillingSchedulePeriods::Name,
                BillingSchedulePeriods::StartDate,
                BillingSchedulePeriods::EndDate,
                BillingSchedulePeriods::BillingDate,
                BillingSchedulePeriods::IsArchived,
            ])
            .from(BillingSchedulePeriods::Table)
            .and_where(Expr::col(BillingSchedulePeriods::BillingSchedulePeriodId).eq(period_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "billing schedule period",
                id: period_id.to_string(),
            })?;

        period_from_row(&row)
    }

    async fn latest_period_end(&self, billing_schedule_id: &str) -> Result<Option<DateTime<Utc>>> {
        // MAX over the fixed-width TEXT column is the chronological max.
        let query = Query::select()
            .expr(Expr::col(BillingSchedulePeriods::EndDate).max())
            .from(BillingSchedulePeriods::Table)
            .and_where(Expr::col(BillingSchedulePeriods::BillingScheduleId).eq(billing_schedule_id))
            .and_where(Expr::col(BillingSchedulePeriods::IsArchived).eq(false))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let max_end: Option<String> = row.get(0);
                parse_opt(max_end)
            }
            None => Ok(None),
        }
    }

    async fn billing_ratio_for(
        &self,
        period_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<BillingRatio>> {
        let stamp = fmt_dt(at);
        let query = Query::select()
            .columns([
                BillingRatios::BillingRatioId,
                BillingRatios::BillingSchedulePeriodId,
                BillingRatios::StartDate,
                BillingRatios::EndDate,
                BillingRatios::Numerator,
                BillingRatios::Denominator,
            ])
            .from(BillingRatios::Table)
            .and_where(Expr::col(BillingRatios::BillingSchedulePeriodId).eq(period_id))
            .and_where(Expr::col(BillingRatios::StartDate).lte(stamp.as_str()))
            .and_where(Expr::col(BillingRatios::EndDate).gte(stamp.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(ratio_from_row).transpose()
    }

    async fn enrollment_status(
        &self,
        student_id: &str,
        location_id: &str,
    ) -> Result<Option<EnrollmentStatus>> {
        let query = Query::select()
            .column(StudentEnrollments::Status)
            .from(StudentEnrollments::Table)
            .and_where(Expr::col(StudentEnrollments::StudentId).eq(student_id))
            .and_where(Expr::col(StudentEnrollments::LocationId).eq(location_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let status: String = row.get("status");
                Ok(Some(decode(
                    &status,
                    EnrollmentStatus::parse,
                    "enrollment status",
                )?))
            }
            None => Ok(None),
        }
    }

    async fn missing_leaving_reasons(&self, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = Query::select()
            .column(LeavingReasons::LeavingReasonId)
            .from(LeavingReasons::Table)
            .and_where(
                Expr::col(LeavingReasons::LeavingReasonId).is_in(ids.iter().map(String::as_str)),
            )
            .and_where(Expr::col(LeavingReasons::IsArchived).eq(false))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let active: HashSet<String> = rows
            .iter()
            .map(|row| row.get::<String, _>("leaving_reason_id"))
            .collect();

        Ok(ids
            .iter()
            .filter(|id| !active.contains(*id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OrderStore for SqliteStore {
    async fn submit_order(&self, submission: OrderSubmission) -> Result<()> {
        // BEGIN IMMEDIATE acquires the write lock upfront, preventing deadlocks
        // when concurrent DEFERRED transactions race to upgrade from shared to exclusive.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::insert_submission(&mut conn, &submission).await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        let query = Query::select()
            .columns([
                Orders::OrderId,
                Orders::StudentId,
                Orders::LocationId,
                Orders::OrderType,
                Orders::OrderStatus,
                Orders::OrderComment,
                Orders::WithdrawalEffectiveDate,
                Orders::Background,
                Orders::FutureMeasures,
                Orders::VersionNumber,
                Orders::CreatedAt,
            ])
            .from(Orders::Table)
            .and_where(Expr::col(Orders::OrderId).eq(order_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "order",
                id: order_id.to_string(),
            })?;

        order_from_row(&row)
    }

    async fn get_order_items(&self, order_id: &str) -> Result<Vec<OrderItem>> {
        let query = Query::select()
            .columns([
                OrderItems::OrderId,
                OrderItems::ProductId,
                OrderItems::DiscountId,
                OrderItems::StartDate,
                OrderItems::EndDate,
                OrderItems::EffectiveDate,
                OrderItems::StudentProductId,
            ])
            .from(OrderItems::Table)
            .and_where(Expr::col(OrderItems::OrderId).eq(order_id))
            .order_by(OrderItems::ProductId, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(order_item_from_row).collect()
    }

    async fn get_student_product(&self, student_product_id: &str) -> Result<StudentProduct> {
        let query = Query::select()
            .columns(student_product_columns())
            .from(StudentProducts::Table)
            .and_where(Expr::col(StudentProducts::StudentProductId).eq(student_product_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "student product",
                id: student_product_id.to_string(),
            })?;

        student_product_from_row(&row)
    }

    async fn get_bill_items(&self, order_id: &str) -> Result<Vec<BillItem>> {
        let query = Query::select()
            .columns(bill_item_columns())
            .from(BillItems::Table)
            .and_where(Expr::col(BillItems::OrderId).eq(order_id))
            .order_by(BillItems::SequenceNumber, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(bill_item_from_row).collect()
    }

    async fn latest_billed_final_price(
        &self,
        student_product_id: &str,
        period_id: &str,
    ) -> Result<Option<f64>> {
        let query = Query::select()
            .column(BillItems::FinalPrice)
            .from(BillItems::Table)
            .and_where(Expr::col(BillItems::StudentProductId).eq(student_product_id))
            .and_where(Expr::col(BillItems::BillingSchedulePeriodId).eq(period_id))
            .and_where(Expr::col(BillItems::BillingStatus).eq(BillingStatus::Billed.as_str()))
            .order_by(BillItems::CreatedAt, SortOrder::Desc)
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.map(|row| row.get("final_price")))
    }

    async fn void_order(&self, void: OrderVoid) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::apply_void(&mut conn, &void).await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn list_student_products(
        &self,
        student_id: &str,
        location_ids: &[String],
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<StudentProduct>, i64)> {
        let mut count_query = Query::select();
        count_query
            .expr(Expr::col(StudentProducts::StudentProductId).count())
            .from(StudentProducts::Table)
            .and_where(Expr::col(StudentProducts::StudentId).eq(student_id));
        if !location_ids.is_empty() {
            count_query.and_where(
                Expr::col(StudentProducts::LocationId)
                    .is_in(location_ids.iter().map(String::as_str)),
            );
        }
        let count_sql = count_query.to_string(SqliteQueryBuilder);
        let total: i64 = sqlx::query(&count_sql).fetch_one(&self.pool).await?.get(0);

        let mut query = Query::select();
        query
            .columns(student_product_columns())
            .from(StudentProducts::Table)
            .and_where(Expr::col(StudentProducts::StudentId).eq(student_id));
        if !location_ids.is_empty() {
            query.and_where(
                Expr::col(StudentProducts::LocationId)
                    .is_in(location_ids.iter().map(String::as_str)),
            );
        }
        // Newest first; id as tie-break to keep pages stable.
        query
            .order_by(StudentProducts::CreatedAt, SortOrder::Desc)
            .order_by(StudentProducts::StudentProductId, SortOrder::Desc)
            .limit(limit.max(0) as u64)
            .offset(offset.max(0) as u64);
        let sql = query.to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let page = rows
            .iter()
            .map(student_product_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((page, total))
    }

    async fn promote_scheduled(
        &self,
        effective: DateTime<Utc>,
        labels: &[StudentProductLabel],
    ) -> Result<Vec<String>> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::promote_in_tx(&mut conn, effective, labels).await;

        match result {
            Ok(promoted) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(promoted)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn get_action_logs(&self, order_id: &str) -> Result<Vec<OrderActionLog>> {
        let query = Query::select()
            .columns([
                OrderActionLogs::OrderId,
                OrderActionLogs::UserId,
                OrderActionLogs::Action,
                OrderActionLogs::Comment,
                OrderActionLogs::CreatedAt,
            ])
            .from(OrderActionLogs::Table)
            .and_where(Expr::col(OrderActionLogs::OrderId).eq(order_id))
            .order_by(OrderActionLogs::CreatedAt, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(action_log_from_row).collect()
    }

    async fn get_order_leaving_reasons(&self, order_id: &str) -> Result<Vec<LeavingReason>> {
        let ids_query = Query::select()
            .column(OrderLeavingReasons::LeavingReasonId)
            .from(OrderLeavingReasons::Table)
            .and_where(Expr::col(OrderLeavingReasons::OrderId).eq(order_id))
            .to_string(SqliteQueryBuilder);

        let id_rows = sqlx::query(&ids_query).fetch_all(&self.pool).await?;
        let ids: Vec<String> = id_rows
            .iter()
            .map(|row| row.get::<String, _>("leaving_reason_id"))
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = Query::select()
            .columns([
                LeavingReasons::LeavingReasonId,
                LeavingReasons::Name,
                LeavingReasons::IsArchived,
            ])
            .from(LeavingReasons::Table)
            .and_where(
                Expr::col(LeavingReasons::LeavingReasonId).is_in(ids.iter().map(String::as_str)),
            )
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut by_id: HashMap<String, LeavingReason> = HashMap::new();
        for row in &rows {
            let reason = leaving_reason_from_row(row);
            by_id.insert(reason.leaving_reason_id.clone(), reason);
        }

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }
}

fn student_product_columns() -> [StudentProducts; 12] {
    [
        StudentProducts::StudentProductId,
        StudentProducts::StudentId,
        StudentProducts::ProductId,
        StudentProducts::LocationId,
        StudentProducts::StartDate,
        StudentProducts::EndDate,
        StudentProducts::ProductStatus,
        StudentProducts::StudentProductLabel,
        StudentProducts::UpdatedFromStudentProductId,
        StudentProducts::VersionNumber,
        StudentProducts::CreatedAt,
        StudentProducts::UpdatedAt,
    ]
}

fn bill_item_columns() -> [BillItems; 22] {
    [
        BillItems::OrderId,
        BillItems::SequenceNumber,
        BillItems::ProductId,
        BillItems::LocationId,
        BillItems::StudentProductId,
        BillItems::BillingSchedulePeriodId,
        BillItems::Price,
        BillItems::Quantity,
        BillItems::TaxId,
        BillItems::TaxPercentage,
        BillItems::TaxCategory,
        BillItems::TaxAmount,
        BillItems::DiscountId,
        BillItems::DiscountType,
        BillItems::DiscountAmountType,
        BillItems::DiscountAmountValue,
        BillItems::DiscountAmount,
        BillItems::FinalPrice,
        BillItems::AdjustmentPrice,
        BillItems::BillingStatus,
        BillItems::BillingType,
        BillItems::CreatedAt,
    ]
}

/// RFC3339 with fixed microsecond width so that lexicographic order on the
/// TEXT column matches chronological order.
fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn fmt_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(fmt_dt)
}

fn parse_dt(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::MalformedRow {
            detail: format!("bad timestamp {text:?}: {e}"),
        })
}

fn parse_opt(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.map(|t| parse_dt(&t)).transpose()
}

fn decode<T>(text: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<T> {
    parse(text).ok_or_else(|| StorageError::MalformedRow {
        detail: format!("unknown {what}: {text}"),
    })
}

fn decode_opt<T>(
    text: Option<String>,
    parse: fn(&str) -> Option<T>,
    what: &str,
) -> Result<Option<T>> {
    text.map(|t| decode(&t, parse, what)).transpose()
}

/// Map unique constraint hits to [`StorageError::DuplicateKey`] so callers
/// can retry generated ids.
fn classify(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(ref db) = err {
        if db.is_unique_violation() {
            return StorageError::DuplicateKey {
                constraint: db.message().to_string(),
            };
        }
    }
    StorageError::Database(err)
}

fn order_from_row(row: &SqliteRow) -> Result<Order> {
    let order_type: String = row.get("order_type");
    let status: String = row.get("order_status");
    let created_at: String = row.get("created_at");
    Ok(Order {
        order_id: row.get("order_id"),
        student_id: row.get("student_id"),
        location_id: row.get("location_id"),
        order_type: decode(&order_type, OrderType::parse, "order type")?,
        status: decode(&status, OrderStatus::parse, "order status")?,
        comment: row.get("order_comment"),
        withdrawal_effective_date: parse_opt(row.get("withdrawal_effective_date"))?,
        background: row.get("background"),
        future_measures: row.get("future_measures"),
        version_number: row.get("version_number"),
        created_at: parse_dt(&created_at)?,
    })
}

fn order_item_from_row(row: &SqliteRow) -> Result<OrderItem> {
    Ok(OrderItem {
        order_id: row.get("order_id"),
        product_id: row.get("product_id"),
        discount_id: row.get("discount_id"),
        start_date: parse_opt(row.get("start_date"))?,
        end_date: parse_opt(row.get("end_date"))?,
        effective_date: parse_opt(row.get("effective_date"))?,
        student_product_id: row.get("student_product_id"),
    })
}

fn bill_item_from_row(row: &SqliteRow) -> Result<BillItem> {
    let tax_category: Option<String> = row.get("tax_category");
    let discount_type: Option<String> = row.get("discount_type");
    let discount_amount_type: Option<String> = row.get("discount_amount_type");
    let billing_status: String = row.get("billing_status");
    let billing_type: String = row.get("billing_type");
    let created_at: String = row.get("created_at");
    Ok(BillItem {
        order_id: row.get("order_id"),
        sequence_number: row.get("sequence_number"),
        product_id: row.get("product_id"),
        location_id: row.get("location_id"),
        student_product_id: row.get("student_product_id"),
        billing_schedule_period_id: row.get("billing_schedule_period_id"),
        price: row.get("price"),
        quantity: row.get("quantity"),
        tax_id: row.get("tax_id"),
        tax_percentage: row.get("tax_percentage"),
        tax_category: decode_opt(tax_category, TaxCategory::parse, "tax category")?,
        tax_amount: row.get("tax_amount"),
        discount_id: row.get("discount_id"),
        discount_type: decode_opt(discount_type, DiscountType::parse, "discount type")?,
        discount_amount_type: decode_opt(
            discount_amount_type,
            DiscountAmountType::parse,
            "discount amount type",
        )?,
        discount_amount_value: row.get("discount_amount_value"),
        discount_amount: row.get("discount_amount"),
        final_price: row.get("final_price"),
        adjustment_price: row.get("adjustment_price"),
        billing_status: decode(&billing_status, BillingStatus::parse, "billing status")?,
        billing_type: decode(&billing_type, BillingType::parse, "billing type")?,
        created_at: parse_dt(&created_at)?,
    })
}

fn student_product_from_row(row: &SqliteRow) -> Result<StudentProduct> {
    let status: String = row.get("product_status");
    let label: String = row.get("student_product_label");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(StudentProduct {
        student_product_id: row.get("student_product_id"),
        student_id: row.get("student_id"),
        product_id: row.get("product_id"),
        location_id: row.get("location_id"),
        start_date: parse_opt(row.get("start_date"))?,
        end_date: parse_opt(row.get("end_date"))?,
        product_status: decode(&status, StudentProductStatus::parse, "product status")?,
        student_product_label: decode(&label, StudentProductLabel::parse, "student product label")?,
        updated_from_student_product_id: row.get("updated_from_student_product_id"),
        version_number: row.get("version_number"),
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn product_from_row(row: &SqliteRow) -> Result<Product> {
    let available_from: String = row.get("available_from");
    let available_until: String = row.get("available_until");
    Ok(Product {
        product_id: row.get("product_id"),
        name: row.get("name"),
        available_from: parse_dt(&available_from)?,
        available_until: parse_dt(&available_until)?,
        billing_schedule_id: row.get("billing_schedule_id"),
        tax_id: row.get("tax_id"),
    })
}

fn discount_from_row(row: &SqliteRow) -> Result<Discount> {
    let discount_type: String = row.get("discount_type");
    let amount_type: String = row.get("discount_amount_type");
    let available_from: String = row.get("available_from");
    let available_until: String = row.get("available_until");
    Ok(Discount {
        discount_id: row.get("discount_id"),
        name: row.get("name"),
        discount_type: decode(&discount_type, DiscountType::parse, "discount type")?,
        discount_amount_type: decode(
            &amount_type,
            DiscountAmountType::parse,
            "discount amount type",
        )?,
        discount_amount_value: row.get("discount_amount_value"),
        available_from: parse_dt(&available_from)?,
        available_until: parse_dt(&available_until)?,
        is_archived: row.get("is_archived"),
    })
}

fn period_from_row(row: &SqliteRow) -> Result<BillingSchedulePeriod> {
    let start_date: String = row.get("start_date");
    let end_date: String = row.get("end_date");
    let billing_date: String = row.get("billing_date");
    Ok(BillingSchedulePeriod {
        billing_schedule_period_id: row.get("billing_schedule_period_id"),
        billing_schedule_id: row.get("billing_schedule_id"),
        name: row.get("name"),
        start_date: parse_dt(&start_date)?,
        end_date: parse_dt(&end_date)?,
        billing_date: parse_dt(&billing_date)?,
        is_archived: row.get("is_archived"),
    })
}

fn ratio_from_row(row: &SqliteRow) -> Result<BillingRatio> {
    let start_date: String = row.get("start_date");
    let end_date: String = row.get("end_date");
    Ok(BillingRatio {
        billing_ratio_id: row.get("billing_ratio_id"),
        billing_schedule_period_id: row.get("billing_schedule_period_id"),
        start_date: parse_dt(&start_date)?,
        end_date: parse_dt(&end_date)?,
        numerator: row.get("numerator"),
        denominator: row.get("denominator"),
    })
}

fn action_log_from_row(row: &SqliteRow) -> Result<OrderActionLog> {
    let action: String = row.get("action");
    let created_at: String = row.get("created_at");
    Ok(OrderActionLog {
        order_id: row.get("order_id"),
        user_id: row.get("user_id"),
        action: decode(&action, OrderAction::parse, "order action")?,
        comment: row.get("comment"),
        created_at: parse_dt(&created_at)?,
    })
}

fn leaving_reason_from_row(row: &SqliteRow) -> LeavingReason {
    LeavingReason {
        leaving_reason_id: row.get("leaving_reason_id"),
        name: row.get("name"),
        is_archived: row.get("is_archived"),
    }
}
