//! Order service: submission, voiding, subscription listing and scheduled
//! status promotion.
//!
//! All four RPCs funnel through the same stores. CreateOrder is the long
//! path: validate the request against the catalog, plan the student product
//! transition per order type, re-derive every submitted amount, then write
//! the whole order in one transaction and announce it on the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use chrono::{DateTime, Utc};
use tonic::{Request, Response, Status};
use tracing::{info, warn};
use uuid::Uuid;

use crate::billing::{self, BillingError, ExpectedCharge, SubmittedCharge};
use crate::bus::EventBus;
use crate::domain::student_product::{
    check_effective_date, check_loa_window, check_pending_change, check_resumable,
    check_void_allowed, end_of_day, pause_label, start_of_day, void_reversal, TransitionError,
};
use crate::domain::{
    BillItem, BillingStatus, CourseItem, Discount, Order, OrderAction, OrderActionLog, OrderItem,
    OrderStatus, OrderType, Product, StudentProduct, StudentProductLabel, StudentProductStatus,
    Tax,
};
use crate::proto;
use crate::proto::order_service_server::OrderService as OrderServiceTrait;
use crate::proto::{
    CreateOrderRequest, CreateOrderResponse, LocationInfo, OrderEventLog, OrderProduct, Paging,
    RetrieveListOfOrderProductsRequest, RetrieveListOfOrderProductsResponse,
    UpdateStudentProductStatusRequest, UpdateStudentProductStatusResponse, VoidOrderRequest,
    VoidOrderResponse,
};
use crate::proto_ext::{
    datetime_to_timestamp, optional_datetime, order_type_from_wire, required_datetime,
};
use crate::storage::{
    CatalogStore, OrderStore, OrderSubmission, OrderVoid, StorageError, StudentProductChange,
    StudentProductUpdate,
};
use crate::utils::paging::{PageWindow, PagingError, DEFAULT_PAGE_LIMIT};
use crate::utils::retry::{is_retryable_storage, submit_backoff};
use crate::validation::{
    CatalogContext, ChargeView, ItemView, OrderValidator, OrderView, ValidationError,
};

/// Failures raised by the order service itself, on top of the per-layer
/// errors it forwards.
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("user id cannot be empty")]
    MissingActor,

    #[error("OptimisticLockingEntityVersionMismatched: {entity} {id}")]
    VersionMismatch { entity: &'static str, id: String },

    #[error("order {0} is already voided")]
    AlreadyVoided(String),

    #[error("cannot void order {order_id}: its {order_type} change already took effect")]
    ChangeAlreadyEffective {
        order_id: String,
        order_type: &'static str,
    },

    #[error("no price for product {product_id} in the requested period")]
    PriceNotFound { product_id: String },

    #[error("unknown student product label: {0}")]
    UnknownLabel(String),

    #[error("label {0} is not a scheduled label")]
    NotScheduled(&'static str),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Paging(#[from] PagingError),

    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for OrderError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionConflict { entity, id } => OrderError::VersionMismatch { entity, id },
            StorageError::NotFound { entity, id } => OrderError::NotFound { entity, id },
            other => OrderError::Storage(other),
        }
    }
}

impl From<OrderError> for Status {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Validation(e) => e.into(),
            OrderError::Transition(e) => e.into(),
            OrderError::Billing(e) => e.into(),
            OrderError::Paging(e) => e.into(),
            OrderError::MissingActor | OrderError::PriceNotFound { .. } => {
                Status::invalid_argument(err.to_string())
            }
            OrderError::VersionMismatch { .. }
            | OrderError::AlreadyVoided(_)
            | OrderError::ChangeAlreadyEffective { .. }
            | OrderError::UnknownLabel(_)
            | OrderError::NotScheduled(_) => Status::failed_precondition(err.to_string()),
            OrderError::NotFound { .. } => Status::not_found(err.to_string()),
            OrderError::Storage(e) => Status::internal(e.to_string()),
        }
    }
}

/// Where one billing line lands once subscription planning has run: the
/// student product the charge belongs to, the discount the order item named,
/// and the date billing ratios are read at.
struct BillTarget {
    student_product_id: String,
    discount_id: Option<String>,
    ratio_at: DateTime<Utc>,
}

/// Outcome of planning a single order item.
struct ItemPlan {
    item_row: OrderItem,
    changes: Vec<StudentProductChange>,
    target: BillTarget,
    /// Termination date recorded on the order row for withdrawals and
    /// graduations.
    effective: Option<DateTime<Utc>>,
}

/// An accepted order before an id is assigned. Ids are generated per submit
/// attempt so a duplicate-key retry inserts under a fresh identity.
struct OrderDraft {
    order: Order,
    order_items: Vec<OrderItem>,
    course_items: Vec<CourseItem>,
    bill_items: Vec<BillItem>,
    product_changes: Vec<StudentProductChange>,
    leaving_reason_ids: Vec<String>,
    action_log: OrderActionLog,
}

impl OrderDraft {
    fn assign(&self, order_id: &str) -> OrderSubmission {
        let mut order = self.order.clone();
        order.order_id = order_id.to_string();
        let mut action_log = self.action_log.clone();
        action_log.order_id = order_id.to_string();

        let order_items = self
            .order_items
            .iter()
            .cloned()
            .map(|mut row| {
                row.order_id = order_id.to_string();
                row
            })
            .collect();
        let course_items = self
            .course_items
            .iter()
            .cloned()
            .map(|mut row| {
                row.order_id = order_id.to_string();
                row
            })
            .collect();
        let bill_items = self
            .bill_items
            .iter()
            .cloned()
            .map(|mut row| {
                row.order_id = order_id.to_string();
                row
            })
            .collect();

        OrderSubmission {
            order,
            order_items,
            course_items,
            bill_items,
            product_changes: self.product_changes.clone(),
            leaving_reason_ids: self.leaving_reason_ids.clone(),
            action_log,
        }
    }
}

/// gRPC order service backed by catalog and order stores plus an event bus.
pub struct OrderService {
    catalog: Arc<dyn CatalogStore>,
    orders: Arc<dyn OrderStore>,
    bus: Arc<dyn EventBus>,
}

impl OrderService {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        orders: Arc<dyn OrderStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            catalog,
            orders,
            bus,
        }
    }

    #[tracing::instrument(name = "order.create", skip_all, fields(student_id = %req.student_id))]
    async fn submit(&self, req: &CreateOrderRequest, now: DateTime<Utc>) -> Result<String, Status> {
        if req.user_id.is_empty() {
            return Err(OrderError::MissingActor.into());
        }
        let order_type = order_type_from_wire(req.order_type)?;

        let view = order_view(req, order_type);
        let validator = OrderValidator::new(self.catalog.as_ref(), now);
        let ctx = validator.validate(&view).await?;

        let mut product_changes = Vec::new();
        let mut item_rows = Vec::with_capacity(req.order_items.len());
        let mut course_rows = Vec::new();
        let mut targets: HashMap<String, BillTarget> = HashMap::new();
        let mut withdrawal_effective = None;

        for item in &req.order_items {
            let product = catalog_product(&ctx, &item.product_id)?;
            let plan = match order_type {
                OrderType::New => self.plan_new(req, item, product, now).await?,
                OrderType::Resume => self.plan_resume(req, item, product, now).await?,
                OrderType::Loa => self.plan_pause(item, now).await?,
                OrderType::Withdrawal | OrderType::Graduate => {
                    self.plan_termination(order_type, item, now).await?
                }
                OrderType::Update => self.plan_revision(item, now).await?,
            };

            if plan.effective.is_some() {
                withdrawal_effective = plan.effective;
            }
            course_rows.extend(course_rows_for(item));
            item_rows.push(plan.item_row);
            product_changes.extend(plan.changes);
            targets.insert(item.product_id.clone(), plan.target);
        }

        let mut bill_rows = Vec::with_capacity(req.billing_items.len() + req.upcoming_billing_items.len());
        let charges = req
            .billing_items
            .iter()
            .map(|b| (b, BillingStatus::Billed))
            .chain(
                req.upcoming_billing_items
                    .iter()
                    .map(|b| (b, BillingStatus::Pending)),
            );
        for (sequence, (charge, status)) in charges.enumerate() {
            let row = self
                .verify_bill_item(&ctx, &targets, charge, status, sequence as i32 + 1, req, now)
                .await?;
            bill_rows.push(row);
        }

        let draft = OrderDraft {
            order: Order {
                order_id: String::new(),
                student_id: req.student_id.clone(),
                location_id: req.location_id.clone(),
                order_type,
                status: OrderStatus::Submitted,
                comment: opt_text(&req.order_comment),
                withdrawal_effective_date: withdrawal_effective,
                background: opt_text(&req.background),
                future_measures: opt_text(&req.future_measures),
                version_number: 0,
                created_at: now,
            },
            order_items: item_rows,
            course_items: course_rows,
            bill_items: bill_rows,
            product_changes,
            leaving_reason_ids: req.leaving_reason_ids.clone(),
            action_log: OrderActionLog {
                order_id: String::new(),
                user_id: req.user_id.clone(),
                action: OrderAction::Submitted,
                comment: opt_text(&req.order_comment),
                created_at: now,
            },
        };

        let order_id = (|| async {
            let id = Uuid::new_v4().to_string();
            self.orders.submit_order(draft.assign(&id)).await.map(|()| id)
        })
        .retry(submit_backoff())
        .when(is_retryable_storage)
        .notify(|err: &StorageError, dur: Duration| {
            warn!(error = %err, delay = ?dur, "Order insert collided, retrying with a fresh id");
        })
        .await
        .map_err(OrderError::from)?;

        info!(
            order_id = %order_id,
            order_type = order_type.as_str(),
            items = req.order_items.len(),
            "Order submitted"
        );
        self.publish_event(&order_id, &req.student_id, order_type, OrderStatus::Submitted)
            .await;
        Ok(order_id)
    }

    /// NEW: a fresh subscription. Recurring products open a window from the
    /// start of the item's start day to the end of the schedule's last
    /// period; one-time products carry no window.
    async fn plan_new(
        &self,
        req: &CreateOrderRequest,
        item: &proto::OrderItem,
        product: &Product,
        now: DateTime<Utc>,
    ) -> Result<ItemPlan, Status> {
        let student_product_id = Uuid::new_v4().to_string();
        let (start_date, end_date) = self.subscription_window(product, item).await?;

        let subscription = StudentProduct {
            student_product_id: student_product_id.clone(),
            student_id: req.student_id.clone(),
            product_id: item.product_id.clone(),
            location_id: req.location_id.clone(),
            start_date,
            end_date,
            product_status: StudentProductStatus::Ordered,
            student_product_label: StudentProductLabel::Created,
            updated_from_student_product_id: None,
            version_number: 0,
            created_at: now,
            updated_at: now,
        };

        Ok(ItemPlan {
            item_row: item_row(item, &student_product_id),
            changes: vec![StudentProductChange::Create(subscription)],
            target: BillTarget {
                student_product_id,
                discount_id: submitted_discount(item),
                ratio_at: start_date.unwrap_or(now),
            },
            effective: None,
        })
    }

    /// RESUME: a new subscription row linked to the paused one, which keeps
    /// its state and history but takes a version bump so concurrent resumes
    /// cannot both succeed.
    async fn plan_resume(
        &self,
        req: &CreateOrderRequest,
        item: &proto::OrderItem,
        product: &Product,
        now: DateTime<Utc>,
    ) -> Result<ItemPlan, Status> {
        let (target_id, expected_version) = mutation_target(item)?;
        let paused = self.fetch_subscription(target_id).await?;
        check_resumable(&paused)?;
        ensure_version(&paused, expected_version)?;

        let student_product_id = Uuid::new_v4().to_string();
        let (start_date, end_date) = self.subscription_window(product, item).await?;

        let replacement = StudentProduct {
            student_product_id: student_product_id.clone(),
            student_id: req.student_id.clone(),
            product_id: item.product_id.clone(),
            location_id: req.location_id.clone(),
            start_date,
            end_date,
            product_status: StudentProductStatus::Ordered,
            student_product_label: StudentProductLabel::Created,
            updated_from_student_product_id: Some(paused.student_product_id.clone()),
            version_number: 0,
            created_at: now,
            updated_at: now,
        };
        let bump = StudentProductUpdate {
            student_product_id: paused.student_product_id.clone(),
            expected_version,
            product_status: paused.product_status,
            student_product_label: paused.student_product_label,
            start_date: paused.start_date,
            end_date: paused.end_date,
            updated_at: now,
        };

        Ok(ItemPlan {
            item_row: item_row(item, &student_product_id),
            changes: vec![
                StudentProductChange::Create(replacement),
                StudentProductChange::Update(bump),
            ],
            target: BillTarget {
                student_product_id,
                discount_id: submitted_discount(item),
                ratio_at: start_date.unwrap_or(now),
            },
            effective: None,
        })
    }

    /// LOA: pause an existing subscription. The label is scheduled when the
    /// pause starts on a later day, effective immediately when it starts
    /// today; the subscription's end moves to the end of the pause start day.
    async fn plan_pause(
        &self,
        item: &proto::OrderItem,
        now: DateTime<Utc>,
    ) -> Result<ItemPlan, Status> {
        let (target_id, expected_version) = mutation_target(item)?;
        let subscription = self.fetch_subscription(target_id).await?;
        check_pending_change(&subscription)?;
        ensure_version(&subscription, expected_version)?;

        let start = required_datetime("start_date", item.start_date.as_ref())?;
        let end = required_datetime("end_date", item.end_date.as_ref())?;
        check_loa_window(start, end, &subscription, now)?;

        let update = StudentProductUpdate {
            student_product_id: subscription.student_product_id.clone(),
            expected_version,
            product_status: StudentProductStatus::Ordered,
            student_product_label: pause_label(start, now),
            start_date: subscription.start_date,
            end_date: Some(end_of_day(start)),
            updated_at: now,
        };

        let mut row = item_row(item, &subscription.student_product_id);
        row.effective_date = Some(start);

        Ok(ItemPlan {
            item_row: row,
            changes: vec![StudentProductChange::Update(update)],
            target: BillTarget {
                student_product_id: subscription.student_product_id,
                discount_id: submitted_discount(item),
                ratio_at: start,
            },
            effective: None,
        })
    }

    /// WITHDRAWAL/GRADUATE: schedule the end of a subscription at the
    /// effective date.
    async fn plan_termination(
        &self,
        order_type: OrderType,
        item: &proto::OrderItem,
        now: DateTime<Utc>,
    ) -> Result<ItemPlan, Status> {
        let (target_id, expected_version) = mutation_target(item)?;
        let subscription = self.fetch_subscription(target_id).await?;
        check_pending_change(&subscription)?;
        ensure_version(&subscription, expected_version)?;

        let effective = required_datetime("effective_date", item.effective_date.as_ref())?;
        check_effective_date(effective, &subscription, now)?;

        let label = match order_type {
            OrderType::Graduate => StudentProductLabel::GraduationScheduled,
            _ => StudentProductLabel::WithdrawalScheduled,
        };
        let update = StudentProductUpdate {
            student_product_id: subscription.student_product_id.clone(),
            expected_version,
            product_status: StudentProductStatus::Ordered,
            student_product_label: label,
            start_date: subscription.start_date,
            end_date: Some(end_of_day(effective)),
            updated_at: now,
        };

        let mut row = item_row(item, &subscription.student_product_id);
        row.effective_date = Some(effective);

        Ok(ItemPlan {
            item_row: row,
            changes: vec![StudentProductChange::Update(update)],
            target: BillTarget {
                student_product_id: subscription.student_product_id,
                discount_id: submitted_discount(item),
                ratio_at: effective,
            },
            effective: Some(effective),
        })
    }

    /// UPDATE: re-bill an existing subscription without changing its state.
    /// The version bump still serializes concurrent revisions.
    async fn plan_revision(
        &self,
        item: &proto::OrderItem,
        now: DateTime<Utc>,
    ) -> Result<ItemPlan, Status> {
        let (target_id, expected_version) = mutation_target(item)?;
        let subscription = self.fetch_subscription(target_id).await?;
        check_pending_change(&subscription)?;
        ensure_version(&subscription, expected_version)?;

        let update = StudentProductUpdate {
            student_product_id: subscription.student_product_id.clone(),
            expected_version,
            product_status: subscription.product_status,
            student_product_label: subscription.student_product_label,
            start_date: subscription.start_date,
            end_date: subscription.end_date,
            updated_at: now,
        };

        let ratio_at = optional_datetime(item.effective_date.as_ref())
            .or_else(|| optional_datetime(item.start_date.as_ref()))
            .unwrap_or(now);

        Ok(ItemPlan {
            item_row: item_row(item, &subscription.student_product_id),
            changes: vec![StudentProductChange::Update(update)],
            target: BillTarget {
                student_product_id: subscription.student_product_id,
                discount_id: submitted_discount(item),
                ratio_at,
            },
            effective: None,
        })
    }

    /// Date window of a subscription created by NEW/RESUME: recurring
    /// products run from the start of the item's start day to the end of the
    /// schedule's latest period, one-time products have no window.
    async fn subscription_window(
        &self,
        product: &Product,
        item: &proto::OrderItem,
    ) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), Status> {
        let Some(schedule_id) = product.billing_schedule_id.as_deref() else {
            return Ok((None, None));
        };
        let start = required_datetime("start_date", item.start_date.as_ref())?;
        let latest = self
            .catalog
            .latest_period_end(schedule_id)
            .await
            .map_err(OrderError::from)?
            .ok_or_else(|| TransitionError::MissingBillingPeriod {
                product_id: product.product_id.clone(),
            })?;
        Ok((Some(start_of_day(start)), Some(end_of_day(latest))))
    }

    /// Recompute one billing line from catalog data, reject it on any
    /// mismatch with the submitted amounts, and produce the row to persist.
    #[allow(clippy::too_many_arguments)]
    async fn verify_bill_item(
        &self,
        ctx: &CatalogContext,
        targets: &HashMap<String, BillTarget>,
        charge: &proto::BillingItem,
        status: BillingStatus,
        sequence_number: i32,
        req: &CreateOrderRequest,
        now: DateTime<Utc>,
    ) -> Result<BillItem, Status> {
        let target = targets
            .get(&charge.product_id)
            .ok_or_else(|| Status::internal("billing item without a matching order item"))?;
        let period_id = charge
            .billing_schedule_period_id
            .as_deref()
            .filter(|s| !s.is_empty());

        let base_price = match self.catalog.get_product_price(&charge.product_id, period_id).await {
            Ok(price) => price,
            Err(StorageError::NotFound { .. }) => {
                return Err(OrderError::PriceNotFound {
                    product_id: charge.product_id.clone(),
                }
                .into())
            }
            Err(e) => return Err(OrderError::from(e).into()),
        };
        let ratio = match period_id {
            Some(period_id) => self
                .catalog
                .billing_ratio_for(period_id, target.ratio_at)
                .await
                .map_err(OrderError::from)?
                .map(|r| (r.numerator, r.denominator)),
            None => None,
        };

        let product = catalog_product(ctx, &charge.product_id)?;
        let tax = match product.tax_id.as_deref() {
            Some(tax_id) => Some(match ctx.taxes.get(tax_id) {
                Some(tax) => tax.clone(),
                None => self.catalog.get_tax(tax_id).await.map_err(OrderError::from)?,
            }),
            None => None,
        };
        let discount = match target.discount_id.as_deref() {
            Some(discount_id) => Some(ctx.discounts.get(discount_id).cloned().ok_or_else(
                || Status::internal("validated discount missing from catalog context"),
            )?),
            None => None,
        };

        let billed_final = match (charge.adjustment_price, period_id) {
            (Some(_), Some(period_id)) => self
                .orders
                .latest_billed_final_price(&target.student_product_id, period_id)
                .await
                .map_err(OrderError::from)?,
            _ => None,
        };

        let submitted = SubmittedCharge {
            product_id: charge.product_id.clone(),
            price: charge.price,
            discount_amount: charge.discount_item.as_ref().map(|d| d.discount_amount),
            tax_amount: charge.tax_item.as_ref().map(|t| t.tax_amount),
            final_price: charge.final_price,
            adjustment_price: charge.adjustment_price,
        };
        let expected = ExpectedCharge {
            base_price,
            ratio,
            discount: discount.as_ref(),
            tax: tax.as_ref(),
            billed_final,
        };
        billing::verify_charge(&submitted, &expected)?;

        Ok(bill_row(
            charge,
            status,
            sequence_number,
            &req.location_id,
            target,
            tax.as_ref(),
            discount.as_ref(),
            now,
        ))
    }

    #[tracing::instrument(name = "order.void", skip_all, fields(order_id = %req.order_id))]
    async fn cancel(&self, req: &VoidOrderRequest, now: DateTime<Utc>) -> Result<String, Status> {
        if req.user_id.is_empty() {
            return Err(OrderError::MissingActor.into());
        }
        if req.order_id.is_empty() {
            return Err(Status::invalid_argument("order id cannot be empty"));
        }

        let order = self
            .orders
            .get_order(&req.order_id)
            .await
            .map_err(OrderError::from)?;
        if order.version_number != req.order_version_number {
            return Err(OrderError::VersionMismatch {
                entity: "order",
                id: order.order_id,
            }
            .into());
        }
        if order.status == OrderStatus::Voided {
            return Err(OrderError::AlreadyVoided(order.order_id).into());
        }

        let items = self
            .orders
            .get_order_items(&order.order_id)
            .await
            .map_err(OrderError::from)?;

        // A change order whose effective date has passed can no longer be
        // unwound; the subscription has moved on.
        if matches!(
            order.order_type,
            OrderType::Update | OrderType::Loa | OrderType::Withdrawal | OrderType::Graduate
        ) {
            for item in &items {
                if item.effective_date.is_some_and(|effective| effective <= now) {
                    return Err(OrderError::ChangeAlreadyEffective {
                        order_id: order.order_id.clone(),
                        order_type: order.order_type.as_str(),
                    }
                    .into());
                }
            }
        }

        let mut reversals = Vec::with_capacity(items.len());
        for item in &items {
            let Some(target_id) = item.student_product_id.as_deref() else {
                continue;
            };
            let subscription = self.fetch_subscription(target_id).await?;
            check_void_allowed(order.order_type, &subscription)?;

            let latest_end = match order.order_type {
                OrderType::Loa | OrderType::Withdrawal | OrderType::Graduate => self
                    .latest_schedule_end(&subscription.product_id)
                    .await?
                    .map(end_of_day),
                _ => None,
            };
            let reversal = void_reversal(order.order_type, &subscription, latest_end)?;
            reversals.push(StudentProductUpdate {
                student_product_id: subscription.student_product_id.clone(),
                expected_version: subscription.version_number,
                product_status: reversal.product_status,
                student_product_label: reversal.student_product_label,
                start_date: reversal.start_date,
                end_date: reversal.end_date,
                updated_at: now,
            });
        }

        self.orders
            .void_order(OrderVoid {
                order_id: order.order_id.clone(),
                expected_version: req.order_version_number,
                product_changes: reversals,
                action_log: OrderActionLog {
                    order_id: order.order_id.clone(),
                    user_id: req.user_id.clone(),
                    action: OrderAction::Voided,
                    comment: None,
                    created_at: now,
                },
            })
            .await
            .map_err(OrderError::from)?;

        info!(order_id = %order.order_id, order_type = order.order_type.as_str(), "Order voided");
        self.publish_event(
            &order.order_id,
            &order.student_id,
            order.order_type,
            OrderStatus::Voided,
        )
        .await;
        Ok(order.order_id)
    }

    #[tracing::instrument(name = "order.list_products", skip_all, fields(student_id = %req.student_id))]
    async fn list_products(
        &self,
        req: &RetrieveListOfOrderProductsRequest,
    ) -> Result<RetrieveListOfOrderProductsResponse, Status> {
        if req.student_id.is_empty() {
            return Err(Status::invalid_argument("student id cannot be empty"));
        }
        if req.location_ids.is_empty() {
            return Err(Status::invalid_argument("location ids cannot be empty"));
        }
        let paging = req.paging.clone().unwrap_or_default();

        // The window is validated against the counted total below; the read
        // itself runs with sanitized bounds.
        let safe_limit = if paging.limit <= 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            paging.limit
        };
        let (rows, total) = self
            .orders
            .list_student_products(
                &req.student_id,
                &req.location_ids,
                safe_limit,
                paging.offset.max(0),
            )
            .await
            .map_err(OrderError::from)?;
        let window = PageWindow::new(paging.limit, paging.offset, total)?;

        let mut locations: HashMap<String, String> = HashMap::new();
        let mut items = Vec::with_capacity(rows.len());
        for sp in &rows {
            let location_name = match locations.get(&sp.location_id) {
                Some(name) => name.clone(),
                None => {
                    let location = self
                        .catalog
                        .get_location(&sp.location_id)
                        .await
                        .map_err(OrderError::from)?;
                    locations.insert(sp.location_id.clone(), location.name.clone());
                    location.name
                }
            };
            items.push(OrderProduct {
                product_id: sp.product_id.clone(),
                student_product_id: sp.student_product_id.clone(),
                location_info: Some(LocationInfo {
                    location_id: sp.location_id.clone(),
                    location_name,
                }),
                start_date: sp.start_date.map(datetime_to_timestamp),
                end_date: sp.end_date.map(datetime_to_timestamp),
                status: proto::StudentProductStatus::from(sp.product_status) as i32,
                student_product_label: proto::StudentProductLabel::from(sp.student_product_label)
                    as i32,
            });
        }

        Ok(RetrieveListOfOrderProductsResponse {
            items,
            next_paging: window.next_offset().map(|offset| Paging {
                limit: window.limit,
                offset,
            }),
            previous_paging: window.previous_offset().map(|offset| Paging {
                limit: window.limit,
                offset,
            }),
            total_items: total as u32,
        })
    }

    #[tracing::instrument(name = "order.update_status", skip_all, fields(organization_id = %req.organization_id))]
    async fn promote(
        &self,
        req: &UpdateStudentProductStatusRequest,
    ) -> Result<Vec<String>, Status> {
        if req.organization_id.is_empty() {
            return Err(Status::invalid_argument("organization id cannot be empty"));
        }

        let mut labels = Vec::with_capacity(req.student_product_labels.len());
        for name in &req.student_product_labels {
            let label = StudentProductLabel::parse(name)
                .ok_or_else(|| OrderError::UnknownLabel(name.clone()))?;
            if !label.is_scheduled() {
                return Err(OrderError::NotScheduled(label.as_str()).into());
            }
            labels.push(label);
        }
        let effective = required_datetime("effective_date", req.effective_date.as_ref())?;

        let ids = self
            .orders
            .promote_scheduled(end_of_day(effective), &labels)
            .await
            .map_err(OrderError::from)?;
        info!(promoted = ids.len(), "Scheduled statuses advanced");
        Ok(ids)
    }

    async fn fetch_subscription(&self, student_product_id: &str) -> Result<StudentProduct, Status> {
        self.orders
            .get_student_product(student_product_id)
            .await
            .map_err(|e| OrderError::from(e).into())
    }

    /// End date of the latest period on the product's billing schedule, when
    /// the product has one.
    async fn latest_schedule_end(
        &self,
        product_id: &str,
    ) -> Result<Option<DateTime<Utc>>, Status> {
        let product = self
            .catalog
            .get_product(product_id)
            .await
            .map_err(OrderError::from)?;
        match product.billing_schedule_id.as_deref() {
            Some(schedule_id) => Ok(self
                .catalog
                .latest_period_end(schedule_id)
                .await
                .map_err(OrderError::from)?),
            None => Ok(None),
        }
    }

    /// Post-commit notification. Failures are logged and swallowed; the bus
    /// is at-least-once and consumers de-duplicate by order id.
    async fn publish_event(
        &self,
        order_id: &str,
        student_id: &str,
        order_type: OrderType,
        status: OrderStatus,
    ) {
        let event = OrderEventLog {
            order_id: order_id.to_string(),
            student_id: student_id.to_string(),
            order_type: proto::OrderType::from(order_type) as i32,
            order_status: proto::OrderStatus::from(status) as i32,
        };
        if let Err(e) = self.bus.publish(Arc::new(event)).await {
            warn!(order_id = %order_id, error = %e, "Order event publish failed");
        }
    }
}

#[tonic::async_trait]
impl OrderServiceTrait for OrderService {
    async fn create_order(
        &self,
        request: Request<CreateOrderRequest>,
    ) -> Result<Response<CreateOrderResponse>, Status> {
        let req = request.into_inner();
        let order_id = self.submit(&req, Utc::now()).await?;
        Ok(Response::new(CreateOrderResponse {
            successful: true,
            order_id,
        }))
    }

    async fn void_order(
        &self,
        request: Request<VoidOrderRequest>,
    ) -> Result<Response<VoidOrderResponse>, Status> {
        let req = request.into_inner();
        let order_id = self.cancel(&req, Utc::now()).await?;
        Ok(Response::new(VoidOrderResponse {
            successful: true,
            order_id,
        }))
    }

    async fn retrieve_list_of_order_products(
        &self,
        request: Request<RetrieveListOfOrderProductsRequest>,
    ) -> Result<Response<RetrieveListOfOrderProductsResponse>, Status> {
        let req = request.into_inner();
        Ok(Response::new(self.list_products(&req).await?))
    }

    async fn update_student_product_status(
        &self,
        request: Request<UpdateStudentProductStatusRequest>,
    ) -> Result<Response<UpdateStudentProductStatusResponse>, Status> {
        let req = request.into_inner();
        let student_product_ids = self.promote(&req).await?;
        Ok(Response::new(UpdateStudentProductStatusResponse {
            student_product_ids,
        }))
    }
}

/// Borrowed view of a create request for the validator.
fn order_view<'a>(req: &'a CreateOrderRequest, order_type: OrderType) -> OrderView<'a> {
    let items = req
        .order_items
        .iter()
        .map(|item| ItemView {
            product_id: item.product_id.as_str(),
            discount_id: item.discount_id.as_deref().filter(|s| !s.is_empty()),
            student_product_id: item.student_product_id.as_deref().filter(|s| !s.is_empty()),
            student_product_version: item.student_product_version_number,
        })
        .collect();
    let charges = req
        .billing_items
        .iter()
        .chain(req.upcoming_billing_items.iter())
        .map(|charge| ChargeView {
            product_id: charge.product_id.as_str(),
            tax_id: charge
                .tax_item
                .as_ref()
                .map(|t| t.tax_id.as_str())
                .filter(|s| !s.is_empty()),
            billing_schedule_period_id: charge
                .billing_schedule_period_id
                .as_deref()
                .filter(|s| !s.is_empty()),
        })
        .collect();

    OrderView {
        student_id: &req.student_id,
        location_id: &req.location_id,
        order_type,
        items,
        charges,
        leaving_reason_ids: &req.leaving_reason_ids,
        background: req.background.as_deref().filter(|s| !s.trim().is_empty()),
        future_measures: req
            .future_measures
            .as_deref()
            .filter(|s| !s.trim().is_empty()),
    }
}

fn catalog_product<'a>(ctx: &'a CatalogContext, product_id: &str) -> Result<&'a Product, Status> {
    ctx.products
        .get(product_id)
        .ok_or_else(|| Status::internal("validated product missing from catalog context"))
}

/// Target reference of a mutating order item. Presence was established by
/// validation; absence here means the validator was bypassed.
fn mutation_target(item: &proto::OrderItem) -> Result<(&str, i32), Status> {
    let id = item
        .student_product_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Status::internal("mutating order item without a student product id"))?;
    let version = item
        .student_product_version_number
        .ok_or_else(|| Status::internal("mutating order item without a version number"))?;
    Ok((id, version))
}

fn ensure_version(sp: &StudentProduct, expected: i32) -> Result<(), OrderError> {
    if sp.version_number != expected {
        return Err(OrderError::VersionMismatch {
            entity: "student product",
            id: sp.student_product_id.clone(),
        });
    }
    Ok(())
}

fn submitted_discount(item: &proto::OrderItem) -> Option<String> {
    item.discount_id.clone().filter(|s| !s.is_empty())
}

fn item_row(item: &proto::OrderItem, student_product_id: &str) -> OrderItem {
    OrderItem {
        order_id: String::new(),
        product_id: item.product_id.clone(),
        discount_id: submitted_discount(item),
        start_date: optional_datetime(item.start_date.as_ref()),
        end_date: optional_datetime(item.end_date.as_ref()),
        effective_date: optional_datetime(item.effective_date.as_ref()),
        student_product_id: Some(student_product_id.to_string()),
    }
}

fn course_rows_for(item: &proto::OrderItem) -> Vec<CourseItem> {
    item.course_items
        .iter()
        .map(|course| CourseItem {
            order_id: String::new(),
            product_id: item.product_id.clone(),
            course_id: course.course_id.clone(),
            course_name: course.course_name.clone(),
            weight: course.weight,
            slot: course.slot,
        })
        .collect()
}

/// The persisted row keeps the verified submitted amounts but takes its tax
/// and discount metadata from the catalog, which is the authority.
#[allow(clippy::too_many_arguments)]
fn bill_row(
    charge: &proto::BillingItem,
    status: BillingStatus,
    sequence_number: i32,
    location_id: &str,
    target: &BillTarget,
    tax: Option<&Tax>,
    discount: Option<&Discount>,
    now: DateTime<Utc>,
) -> BillItem {
    BillItem {
        order_id: String::new(),
        sequence_number,
        product_id: charge.product_id.clone(),
        location_id: location_id.to_string(),
        student_product_id: Some(target.student_product_id.clone()),
        billing_schedule_period_id: charge
            .billing_schedule_period_id
            .clone()
            .filter(|s| !s.is_empty()),
        price: charge.price,
        quantity: charge.quantity,
        tax_id: tax.map(|t| t.tax_id.clone()),
        tax_percentage: tax.map(|t| t.tax_percentage),
        tax_category: tax.map(|t| t.tax_category),
        tax_amount: charge.tax_item.as_ref().map(|t| t.tax_amount),
        discount_id: discount.map(|d| d.discount_id.clone()),
        discount_type: discount.map(|d| d.discount_type),
        discount_amount_type: discount.map(|d| d.discount_amount_type),
        discount_amount_value: discount.map(|d| d.discount_amount_value),
        discount_amount: charge.discount_item.as_ref().map(|d| d.discount_amount),
        final_price: charge.final_price,
        adjustment_price: charge.adjustment_price,
        billing_status: status,
        billing_type: billing::billing_type_for(charge.adjustment_price),
        created_at: now,
    }
}

fn opt_text(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
