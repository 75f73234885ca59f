//! In-memory storage backend.
//!
//! Backs both traits with plain maps behind async locks. Used by tests and
//! by the standalone server when `storage_type` is `memory`. Mutating
//! operations run their version checks before touching any map, so a failed
//! submit or void leaves the store unchanged just like the SQL backends.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::student_product::promote_scheduled as promotion_target;
use crate::domain::{
    BillItem, BillingRatio, BillingSchedulePeriod, BillingStatus, CourseItem, Discount,
    EnrollmentStatus, LeavingReason, Location, Order, OrderActionLog, OrderItem, OrderStatus,
    Product, ProductSetting, Student, StudentProduct, StudentProductLabel, Tax,
};
use crate::storage::{
    CatalogStore, OrderStore, OrderSubmission, OrderVoid, Result, StorageError,
    StudentProductChange, StudentProductUpdate,
};

/// In-memory store. `put_*`/`link_*` helpers seed the catalog side; the
/// order side is written through the trait like any other backend.
#[derive(Default)]
pub struct MemoryStore {
    students: RwLock<HashMap<String, Student>>,
    locations: RwLock<HashMap<String, Location>>,
    products: RwLock<HashMap<String, Product>>,
    product_settings: RwLock<HashMap<String, ProductSetting>>,
    product_locations: RwLock<HashSet<(String, String)>>,
    product_grades: RwLock<HashMap<String, Vec<String>>>,
    product_discounts: RwLock<HashSet<(String, String)>>,
    product_prices: RwLock<HashMap<(String, Option<String>), f64>>,
    discounts: RwLock<HashMap<String, Discount>>,
    taxes: RwLock<HashMap<String, Tax>>,
    periods: RwLock<HashMap<String, BillingSchedulePeriod>>,
    billing_ratios: RwLock<Vec<BillingRatio>>,
    enrollments: RwLock<HashMap<(String, String), EnrollmentStatus>>,
    leaving_reasons: RwLock<HashMap<String, LeavingReason>>,

    orders: RwLock<HashMap<String, Order>>,
    order_items: RwLock<HashMap<String, Vec<OrderItem>>>,
    course_items: RwLock<HashMap<String, Vec<CourseItem>>>,
    bill_items: RwLock<HashMap<String, Vec<BillItem>>>,
    student_products: RwLock<HashMap<String, StudentProduct>>,
    order_leaving_reasons: RwLock<HashMap<String, Vec<String>>>,
    action_logs: RwLock<HashMap<String, Vec<OrderActionLog>>>,

    fail_on_submit: RwLock<bool>,
    duplicate_submits_remaining: RwLock<u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_student(&self, student: Student) {
        self.students
            .write()
            .await
            .insert(student.student_id.clone(), student);
    }

    pub async fn put_location(&self, location: Location) {
        self.locations
            .write()
            .await
            .insert(location.location_id.clone(), location);
    }

    pub async fn put_product(&self, product: Product) {
        self.products
            .write()
            .await
            .insert(product.product_id.clone(), product);
    }

    pub async fn put_product_setting(&self, setting: ProductSetting) {
        self.product_settings
            .write()
            .await
            .insert(setting.product_id.clone(), setting);
    }

    pub async fn link_product_location(&self, product_id: &str, location_id: &str) {
        self.product_locations
            .write()
            .await
            .insert((product_id.to_string(), location_id.to_string()));
    }

    pub async fn restrict_product_grades(&self, product_id: &str, grade_ids: &[&str]) {
        self.product_grades.write().await.insert(
            product_id.to_string(),
            grade_ids.iter().map(|g| g.to_string()).collect(),
        );
    }

    pub async fn link_product_discount(&self, product_id: &str, discount_id: &str) {
        self.product_discounts
            .write()
            .await
            .insert((product_id.to_string(), discount_id.to_string()));
    }

    pub async fn put_product_price(&self, product_id: &str, period_id: Option<&str>, price: f64) {
        self.product_prices.write().await.insert(
            (product_id.to_string(), period_id.map(str::to_string)),
            price,
        );
    }

    pub async fn put_discount(&self, discount: Discount) {
        self.discounts
            .write()
            .await
            .insert(discount.discount_id.clone(), discount);
    }

    pub async fn put_tax(&self, tax: Tax) {
        self.taxes.write().await.insert(tax.tax_id.clone(), tax);
    }

    pub async fn put_billing_period(&self, period: BillingSchedulePeriod) {
        self.periods
            .write()
            .await
            .insert(period.billing_schedule_period_id.clone(), period);
    }

    pub async fn put_billing_ratio(&self, ratio: BillingRatio) {
        self.billing_ratios.write().await.push(ratio);
    }

    pub async fn set_enrollment(
        &self,
        student_id: &str,
        location_id: &str,
        status: EnrollmentStatus,
    ) {
        self.enrollments
            .write()
            .await
            .insert((student_id.to_string(), location_id.to_string()), status);
    }

    pub async fn put_leaving_reason(&self, reason: LeavingReason) {
        self.leaving_reasons
            .write()
            .await
            .insert(reason.leaving_reason_id.clone(), reason);
    }

    pub async fn put_student_product(&self, sp: StudentProduct) {
        self.student_products
            .write()
            .await
            .insert(sp.student_product_id.clone(), sp);
    }

    pub async fn set_fail_on_submit(&self, fail: bool) {
        *self.fail_on_submit.write().await = fail;
    }

    /// The next `n` submissions fail with a duplicate-key error, simulating
    /// id collisions for retry tests.
    pub async fn fail_submits_with_duplicate_key(&self, n: u32) {
        *self.duplicate_submits_remaining.write().await = n;
    }

    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn get_student(&self, student_id: &str) -> Result<Student> {
        self.students
            .read()
            .await
            .get(student_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                entity: "student",
                id: student_id.to_string(),
            })
    }

    async fn get_location(&self, location_id: &str) -> Result<Location> {
        self.locations
            .read()
            .await
            .get(location_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                entity: "location",
                id: location_id.to_string(),
            })
    }

    async fn get_product(&self, product_id: &str) -> Result<Product> {
        self.products
            .read()
            .await
            .get(product_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                entity: "product",
                id: product_id.to_string(),
            })
    }

    async fn get_product_setting(&self, product_id: &str) -> Result<ProductSetting> {
        self.product_settings
            .read()
            .await
            .get(product_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                entity: "product setting",
                id: product_id.to_string(),
            })
    }

    async fn product_sold_at_location(&self, product_id: &str, location_id: &str) -> Result<bool> {
        Ok(self
            .product_locations
            .read()
            .await
            .contains(&(product_id.to_string(), location_id.to_string())))
    }

    async fn product_grades(&self, product_id: &str) -> Result<Vec<String>> {
        Ok(self
            .product_grades
            .read()
            .await
            .get(product_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn product_has_discount(&self, product_id: &str, discount_id: &str) -> Result<bool> {
        Ok(self
            .product_discounts
            .read()
            .await
            .contains(&(product_id.to_string(), discount_id.to_string())))
    }

    async fn get_discount(&self, discount_id: &str) -> Result<Discount> {
        self.discounts
            .read()
            .await
            .get(discount_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                entity: "discount",
                id: discount_id.to_string(),
            })
    }

    async fn get_tax(&self, tax_id: &str) -> Result<Tax> {
        self.taxes
            .read()
            .await
            .get(tax_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                entity: "tax",
                id: tax_id.to_string(),
            })
    }

    async fn get_product_price(&self, product_id: &str, period_id: Option<&str>) -> Result<f64> {
        self.product_prices
            .read()
            .await
            .get(&(product_id.to_string(), period_id.map(str::to_string)))
            .copied()
            .ok_or_else(|| StorageError::NotFound {
                entity: "product price",
                id: product_id.to_string(),
            })
    }

    async fn get_billing_schedule_period(&self, period_id: &str) -> Result<BillingSchedulePeriod> {
        self.periods
            .read()
            .await
            .get(period_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                entity: "billing schedule period",
                id: period_id.to_string(),
            })
    }

    async fn latest_period_end(
        &self,
        billing_schedule_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .periods
            .read()
            .await
            .values()
            .filter(|p| p.billing_schedule_id == billing_schedule_id && !p.is_archived)
            .map(|p| p.end_date)
            .max())
    }

    async fn billing_ratio_for(
        &self,
        period_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<BillingRatio>> {
        Ok(self
            .billing_ratios
            .read()
            .await
            .iter()
            .find(|r| {
                r.billing_schedule_period_id == period_id && r.start_date <= at && at <= r.end_date
            })
            .cloned())
    }

    async fn enrollment_status(
        &self,
        student_id: &str,
        location_id: &str,
    ) -> Result<Option<EnrollmentStatus>> {
        Ok(self
            .enrollments
            .read()
            .await
            .get(&(student_id.to_string(), location_id.to_string()))
            .copied())
    }

    async fn missing_leaving_reasons(&self, ids: &[String]) -> Result<Vec<String>> {
        let reasons = self.leaving_reasons.read().await;
        Ok(ids
            .iter()
            .filter(|id| !reasons.get(*id).map(|r| !r.is_archived).unwrap_or(false))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn submit_order(&self, submission: OrderSubmission) -> Result<()> {
        if *self.fail_on_submit.read().await {
            return Err(StorageError::MalformedRow {
                detail: "injected submit failure".to_string(),
            });
        }
        {
            let mut remaining = self.duplicate_submits_remaining.write().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::DuplicateKey {
                    constraint: "orders_pk".to_string(),
                });
            }
        }

        let order_id = submission.order.order_id.clone();

        // All checks before any write, so a rejected submission is a no-op.
        {
            let orders = self.orders.read().await;
            if orders.contains_key(&order_id) {
                return Err(StorageError::DuplicateKey {
                    constraint: "orders_pk".to_string(),
                });
            }
        }
        {
            let sps = self.student_products.read().await;
            for change in &submission.product_changes {
                match change {
                    StudentProductChange::Create(sp) => {
                        if sps.contains_key(&sp.student_product_id) {
                            return Err(StorageError::DuplicateKey {
                                constraint: "student_products_pk".to_string(),
                            });
                        }
                    }
                    StudentProductChange::Update(update) => {
                        check_version(&sps, &update.student_product_id, update.expected_version)?;
                    }
                }
            }
        }

        self.orders
            .write()
            .await
            .insert(order_id.clone(), submission.order);
        self.order_items
            .write()
            .await
            .insert(order_id.clone(), submission.order_items);
        self.course_items
            .write()
            .await
            .insert(order_id.clone(), submission.course_items);
        self.bill_items
            .write()
            .await
            .insert(order_id.clone(), submission.bill_items);
        {
            let mut sps = self.student_products.write().await;
            for change in submission.product_changes {
                match change {
                    StudentProductChange::Create(sp) => {
                        sps.insert(sp.student_product_id.clone(), sp);
                    }
                    StudentProductChange::Update(update) => {
                        apply_update(&mut sps, update);
                    }
                }
            }
        }
        self.order_leaving_reasons
            .write()
            .await
            .insert(order_id.clone(), submission.leaving_reason_ids);
        self.action_logs
            .write()
            .await
            .entry(order_id)
            .or_default()
            .push(submission.action_log);
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        self.orders
            .read()
            .await
            .get(order_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                entity: "order",
                id: order_id.to_string(),
            })
    }

    async fn get_order_items(&self, order_id: &str) -> Result<Vec<OrderItem>> {
        Ok(self
            .order_items
            .read()
            .await
            .get(order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_student_product(&self, student_product_id: &str) -> Result<StudentProduct> {
        self.student_products
            .read()
            .await
            .get(student_product_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                entity: "student product",
                id: student_product_id.to_string(),
            })
    }

    async fn get_bill_items(&self, order_id: &str) -> Result<Vec<BillItem>> {
        Ok(self
            .bill_items
            .read()
            .await
            .get(order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_billed_final_price(
        &self,
        student_product_id: &str,
        period_id: &str,
    ) -> Result<Option<f64>> {
        Ok(self
            .bill_items
            .read()
            .await
            .values()
            .flatten()
            .filter(|item| {
                item.billing_status == BillingStatus::Billed
                    && item.student_product_id.as_deref() == Some(student_product_id)
                    && item.billing_schedule_period_id.as_deref() == Some(period_id)
            })
            .max_by_key(|item| item.created_at)
            .map(|item| item.final_price))
    }

    async fn void_order(&self, void: OrderVoid) -> Result<()> {
        {
            let orders = self.orders.read().await;
            let order = orders.get(&void.order_id).ok_or_else(|| StorageError::NotFound {
                entity: "order",
                id: void.order_id.clone(),
            })?;
            if order.version_number != void.expected_version {
                return Err(StorageError::VersionConflict {
                    entity: "order",
                    id: void.order_id.clone(),
                });
            }
            let sps = self.student_products.read().await;
            for update in &void.product_changes {
                check_version(&sps, &update.student_product_id, update.expected_version)?;
            }
        }

        {
            let mut orders = self.orders.write().await;
            if let Some(order) = orders.get_mut(&void.order_id) {
                order.status = OrderStatus::Voided;
                order.version_number += 1;
            }
        }
        {
            let mut sps = self.student_products.write().await;
            for update in void.product_changes {
                apply_update(&mut sps, update);
            }
        }
        if let Some(items) = self.bill_items.write().await.get_mut(&void.order_id) {
            for item in items.iter_mut() {
                item.billing_status = BillingStatus::Cancelled;
            }
        }
        self.action_logs
            .write()
            .await
            .entry(void.order_id)
            .or_default()
            .push(void.action_log);
        Ok(())
    }

    async fn list_student_products(
        &self,
        student_id: &str,
        location_ids: &[String],
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<StudentProduct>, i64)> {
        let sps = self.student_products.read().await;
        let mut matched: Vec<StudentProduct> = sps
            .values()
            .filter(|sp| {
                sp.student_id == student_id
                    && (location_ids.is_empty() || location_ids.contains(&sp.location_id))
            })
            .cloned()
            .collect();
        // Newest first; id as tie-break to keep pages stable.
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.student_product_id.cmp(&a.student_product_id))
        });
        let total = matched.len() as i64;
        let page = matched
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn promote_scheduled(
        &self,
        effective: DateTime<Utc>,
        labels: &[StudentProductLabel],
    ) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut sps = self.student_products.write().await;
        let mut promoted = Vec::new();
        for sp in sps.values_mut() {
            if !labels.contains(&sp.student_product_label) {
                continue;
            }
            let due = match sp.end_date {
                Some(end) => end <= effective,
                None => false,
            };
            if !due {
                continue;
            }
            if let Some((status, label)) = promotion_target(sp.student_product_label) {
                sp.product_status = status;
                sp.student_product_label = label;
                sp.version_number += 1;
                sp.updated_at = now;
                promoted.push(sp.student_product_id.clone());
            }
        }
        promoted.sort();
        Ok(promoted)
    }

    async fn get_action_logs(&self, order_id: &str) -> Result<Vec<OrderActionLog>> {
        Ok(self
            .action_logs
            .read()
            .await
            .get(order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_order_leaving_reasons(&self, order_id: &str) -> Result<Vec<LeavingReason>> {
        let ids = self
            .order_leaving_reasons
            .read()
            .await
            .get(order_id)
            .cloned()
            .unwrap_or_default();
        let reasons = self.leaving_reasons.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| reasons.get(id))
            .cloned()
            .collect())
    }
}

fn check_version(
    sps: &HashMap<String, StudentProduct>,
    id: &str,
    expected: i32,
) -> Result<()> {
    match sps.get(id) {
        Some(sp) if sp.version_number == expected => Ok(()),
        Some(_) | None => Err(StorageError::VersionConflict {
            entity: "student product",
            id: id.to_string(),
        }),
    }
}

fn apply_update(sps: &mut HashMap<String, StudentProduct>, update: StudentProductUpdate) {
    if let Some(sp) = sps.get_mut(&update.student_product_id) {
        sp.product_status = update.product_status;
        sp.student_product_label = update.student_product_label;
        sp.start_date = update.start_date;
        sp.end_date = update.end_date;
        sp.updated_at = update.updated_at;
        sp.version_number += 1;
    }
}
