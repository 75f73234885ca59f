//! Order lifecycle step definitions.
//!
//! Scenarios run against a freshly seeded [`MemoryStore`] and a
//! [`MockEventBus`]; the service is driven through the generated gRPC trait
//! exactly as a network caller would see it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cucumber::{given, then, when, World};
use prost_types::Timestamp;
use tonic::{Request, Status};

use coursepay::bus::MockEventBus;
use coursepay::domain::student_product::{end_of_day, start_of_day};
use coursepay::domain::{
    BillingSchedulePeriod, BillingStatus, LeavingReason, Location, Product, ProductSetting,
    Student, StudentProduct, StudentProductLabel, StudentProductStatus, Tax, TaxCategory,
};
use coursepay::proto;
use coursepay::proto::order_service_server::OrderService as OrderServiceRpc;
use coursepay::services::OrderService;
use coursepay::storage::{MemoryStore, OrderStore};

const TAX_PERCENT: f64 = 10.0;

fn today() -> DateTime<Utc> {
    start_of_day(Utc::now())
}

fn days(n: i64) -> Duration {
    Duration::days(n)
}

fn ts(dt: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

/// Test context shared by every order lifecycle scenario.
#[derive(World)]
#[world(init = Self::new)]
pub struct OrderWorld {
    store: Arc<MemoryStore>,
    bus: Arc<MockEventBus>,
    last_order_id: Option<String>,
    last_error: Option<Status>,
    last_promoted: Vec<String>,
}

impl fmt::Debug for OrderWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderWorld")
            .field("last_order_id", &self.last_order_id)
            .field("last_error", &self.last_error)
            .field("last_promoted", &self.last_promoted)
            .finish_non_exhaustive()
    }
}

impl OrderWorld {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            bus: Arc::new(MockEventBus::new()),
            last_order_id: None,
            last_error: None,
            last_promoted: Vec::new(),
        }
    }

    fn service(&self) -> OrderService {
        OrderService::new(self.store.clone(), self.store.clone(), self.bus.clone())
    }

    fn order_id(&self) -> &str {
        self.last_order_id
            .as_deref()
            .expect("no order submitted yet")
    }

    fn record(&mut self, outcome: Result<String, Status>) {
        match outcome {
            Ok(order_id) => {
                self.last_order_id = Some(order_id);
                self.last_error = None;
            }
            Err(status) => self.last_error = Some(status),
        }
    }

    async fn submit(&mut self, req: proto::CreateOrderRequest) {
        let outcome = self
            .service()
            .create_order(Request::new(req))
            .await
            .map(|r| r.into_inner().order_id);
        self.record(outcome);
    }

    async fn subscription(&self, id: &str) -> StudentProduct {
        self.store
            .get_student_product(id)
            .await
            .expect("subscription should exist")
    }

    /// The subscription created by the most recent order.
    async fn submitted_subscription(&self) -> StudentProduct {
        let items = self
            .store
            .get_order_items(self.order_id())
            .await
            .expect("order items should exist");
        let sp_id = items
            .first()
            .and_then(|i| i.student_product_id.clone())
            .expect("order item should reference a subscription");
        self.subscription(&sp_id).await
    }

    fn seeded_subscription(&self, id: &str, label: StudentProductLabel) -> StudentProduct {
        StudentProduct {
            student_product_id: id.to_string(),
            student_id: "student-1".to_string(),
            product_id: "product-1".to_string(),
            location_id: "location-1".to_string(),
            start_date: Some(today() - days(60)),
            end_date: Some(end_of_day(today() + days(15))),
            product_status: StudentProductStatus::Ordered,
            student_product_label: label,
            updated_from_student_product_id: None,
            version_number: 0,
            created_at: today() - days(60),
            updated_at: today() - days(60),
        }
    }
}

fn billed_line(price: f64) -> proto::BillingItem {
    proto::BillingItem {
        product_id: "product-1".to_string(),
        billing_schedule_period_id: Some("period-1".to_string()),
        price,
        quantity: Some(1),
        tax_item: Some(proto::TaxItem {
            tax_id: "tax-1".to_string(),
            tax_percentage: TAX_PERCENT,
            tax_category: proto::TaxCategory::Inclusive as i32,
            tax_amount: price * TAX_PERCENT / (100.0 + TAX_PERCENT),
        }),
        discount_item: None,
        final_price: price,
        adjustment_price: None,
    }
}

fn base_request(order_type: proto::OrderType) -> proto::CreateOrderRequest {
    proto::CreateOrderRequest {
        student_id: "student-1".to_string(),
        location_id: "location-1".to_string(),
        order_type: order_type as i32,
        order_items: Vec::new(),
        billing_items: Vec::new(),
        upcoming_billing_items: Vec::new(),
        leaving_reason_ids: Vec::new(),
        background: None,
        future_measures: None,
        order_comment: None,
        user_id: "user-1".to_string(),
    }
}

fn loa_request(target: &str, start: DateTime<Utc>, version: i32) -> proto::CreateOrderRequest {
    let mut req = base_request(proto::OrderType::Loa);
    req.order_items = vec![proto::OrderItem {
        product_id: "product-1".to_string(),
        discount_id: None,
        start_date: Some(ts(start)),
        end_date: Some(ts(start + days(10))),
        effective_date: None,
        student_product_id: Some(target.to_string()),
        student_product_version_number: Some(version),
        course_items: Vec::new(),
    }];
    req.leaving_reason_ids = vec!["reason-1".to_string()];
    req.background = Some("Family circumstances".to_string());
    req.future_measures = Some("Expected to return".to_string());
    req
}

// ---------------------------------------------------------------------------
// Given
// ---------------------------------------------------------------------------

#[given(expr = "a student at a location with a monthly product priced at {float}")]
async fn seed_catalog(world: &mut OrderWorld, price: f64) {
    let store = &world.store;
    store
        .put_student(Student {
            student_id: "student-1".to_string(),
            name: "Aki".to_string(),
            grade_id: Some("grade-5".to_string()),
        })
        .await;
    store
        .put_location(Location {
            location_id: "location-1".to_string(),
            name: "Shibuya".to_string(),
        })
        .await;
    store
        .put_product(Product {
            product_id: "product-1".to_string(),
            name: "Math course".to_string(),
            available_from: today() - days(100),
            available_until: today() + days(300),
            billing_schedule_id: Some("schedule-1".to_string()),
            tax_id: Some("tax-1".to_string()),
        })
        .await;
    store.link_product_location("product-1", "location-1").await;
    store
        .put_product_setting(ProductSetting {
            product_id: "product-1".to_string(),
            is_pausable: true,
            is_enrollment_required: false,
            is_added_to_enrollment_by_default: false,
            is_operation_fee: false,
        })
        .await;
    store
        .put_tax(Tax {
            tax_id: "tax-1".to_string(),
            name: "Consumption tax".to_string(),
            tax_percentage: TAX_PERCENT,
            tax_category: TaxCategory::Inclusive,
        })
        .await;
    store
        .put_billing_period(BillingSchedulePeriod {
            billing_schedule_period_id: "period-1".to_string(),
            billing_schedule_id: "schedule-1".to_string(),
            name: "Current month".to_string(),
            start_date: today() - days(15),
            end_date: today() + days(15),
            billing_date: today() - days(20),
            is_archived: false,
        })
        .await;
    store
        .put_product_price("product-1", Some("period-1"), price)
        .await;
    store
        .put_leaving_reason(LeavingReason {
            leaving_reason_id: "reason-1".to_string(),
            name: "Relocation".to_string(),
            is_archived: false,
        })
        .await;
}

#[given(expr = "an active subscription {string}")]
async fn active_subscription(world: &mut OrderWorld, id: String) {
    let sp = world.seeded_subscription(&id, StudentProductLabel::Created);
    world.store.put_student_product(sp).await;
}

#[given("the product is not pausable")]
async fn not_pausable(world: &mut OrderWorld) {
    world
        .store
        .put_product_setting(ProductSetting {
            product_id: "product-1".to_string(),
            is_pausable: false,
            is_enrollment_required: false,
            is_added_to_enrollment_by_default: false,
            is_operation_fee: false,
        })
        .await;
}

#[given(expr = "a subscription {string} scheduled to pause as of today")]
async fn pause_due_today(world: &mut OrderWorld, id: String) {
    let mut sp = world.seeded_subscription(&id, StudentProductLabel::PauseScheduled);
    sp.end_date = Some(today());
    world.store.put_student_product(sp).await;
}

#[given(expr = "a subscription {string} scheduled to pause in {int} days")]
async fn pause_due_later(world: &mut OrderWorld, id: String, in_days: i64) {
    let mut sp = world.seeded_subscription(&id, StudentProductLabel::PauseScheduled);
    sp.end_date = Some(end_of_day(today() + days(in_days)));
    world.store.put_student_product(sp).await;
}

// ---------------------------------------------------------------------------
// When
// ---------------------------------------------------------------------------

#[when(expr = "the student submits a new order billed at {float}")]
async fn submit_new_order(world: &mut OrderWorld, price: f64) {
    let mut req = base_request(proto::OrderType::New);
    req.order_items = vec![proto::OrderItem {
        product_id: "product-1".to_string(),
        discount_id: None,
        start_date: Some(ts(today())),
        end_date: None,
        effective_date: None,
        student_product_id: None,
        student_product_version_number: None,
        course_items: Vec::new(),
    }];
    req.billing_items = vec![billed_line(price)];
    world.submit(req).await;
}

#[when(expr = "the student pauses subscription {string} starting in {int} days")]
async fn pause_subscription(world: &mut OrderWorld, id: String, in_days: i64) {
    world.submit(loa_request(&id, today() + days(in_days), 0)).await;
}

#[when(expr = "the student pauses subscription {string} starting in {int} days with version {int}")]
async fn pause_subscription_versioned(
    world: &mut OrderWorld,
    id: String,
    in_days: i64,
    version: i32,
) {
    world
        .submit(loa_request(&id, today() + days(in_days), version))
        .await;
}

#[when(expr = "the student withdraws subscription {string} effective in {int} days")]
async fn withdraw_subscription(world: &mut OrderWorld, id: String, in_days: i64) {
    let mut req = base_request(proto::OrderType::Withdrawal);
    req.order_items = vec![proto::OrderItem {
        product_id: "product-1".to_string(),
        discount_id: None,
        start_date: None,
        end_date: None,
        effective_date: Some(ts(today() + days(in_days))),
        student_product_id: Some(id),
        student_product_version_number: Some(0),
        course_items: Vec::new(),
    }];
    req.leaving_reason_ids = vec!["reason-1".to_string()];
    req.background = Some("Transferring schools".to_string());
    req.future_measures = Some("None planned".to_string());
    world.submit(req).await;
}

#[when(expr = "the order is voided with version {int}")]
async fn void_order(world: &mut OrderWorld, version: i32) {
    let order_id = world.order_id().to_string();
    let outcome = world
        .service()
        .void_order(Request::new(proto::VoidOrderRequest {
            order_id: order_id.clone(),
            order_version_number: version,
            user_id: "user-1".to_string(),
        }))
        .await
        .map(|_| order_id);
    world.record(outcome);
}

#[when("scheduled statuses are promoted as of today")]
async fn promote_scheduled(world: &mut OrderWorld) {
    let resp = world
        .service()
        .update_student_product_status(Request::new(proto::UpdateStudentProductStatusRequest {
            organization_id: "org-1".to_string(),
            effective_date: Some(ts(Utc::now())),
            student_product_labels: vec![
                "PAUSE_SCHEDULED".to_string(),
                "WITHDRAWAL_SCHEDULED".to_string(),
                "GRADUATION_SCHEDULED".to_string(),
            ],
        }))
        .await
        .expect("promotion should succeed");
    world.last_promoted = resp.into_inner().student_product_ids;
}

// ---------------------------------------------------------------------------
// Then
// ---------------------------------------------------------------------------

#[then("the order is accepted")]
async fn order_accepted(world: &mut OrderWorld) {
    if let Some(status) = &world.last_error {
        panic!("order was rejected: {status}");
    }
    assert!(world.last_order_id.is_some());
}

#[then("the void succeeds")]
async fn void_succeeded(world: &mut OrderWorld) {
    if let Some(status) = &world.last_error {
        panic!("void was rejected: {status}");
    }
}

#[then(expr = "the request is rejected with a message containing {string}")]
async fn request_rejected(world: &mut OrderWorld, needle: String) {
    let status = world
        .last_error
        .as_ref()
        .expect("expected the request to be rejected");
    assert!(
        status.message().contains(&needle),
        "expected {:?} in {:?}",
        needle,
        status.message()
    );
}

#[then(expr = "the student has a subscription with status {string} and label {string}")]
async fn submitted_subscription_state(world: &mut OrderWorld, status: String, label: String) {
    let sp = world.submitted_subscription().await;
    assert_eq!(sp.product_status.as_str(), status);
    assert_eq!(sp.student_product_label.as_str(), label);
}

#[then(expr = "subscription {string} has label {string}")]
async fn subscription_label(world: &mut OrderWorld, id: String, label: String) {
    let sp = world.subscription(&id).await;
    assert_eq!(sp.student_product_label.as_str(), label);
}

#[then(expr = "subscription {string} has status {string}")]
async fn subscription_status(world: &mut OrderWorld, id: String, status: String) {
    let sp = world.subscription(&id).await;
    assert_eq!(sp.product_status.as_str(), status);
}

#[then(expr = "subscription {string} is at version {int}")]
async fn subscription_version(world: &mut OrderWorld, id: String, version: i32) {
    let sp = world.subscription(&id).await;
    assert_eq!(sp.version_number, version);
}

#[then(expr = "the order has {int} bill item(s) with billing status {string}")]
async fn order_bill_items(world: &mut OrderWorld, count: usize, status: String) {
    let bills = world
        .store
        .get_bill_items(world.order_id())
        .await
        .expect("bill items should be readable");
    assert_eq!(bills.len(), count);
    let expected = BillingStatus::parse(&status).expect("known billing status");
    assert!(bills.iter().all(|b| b.billing_status == expected));
}

#[then("no orders are stored")]
async fn no_orders(world: &mut OrderWorld) {
    assert_eq!(world.store.order_count().await, 0);
}

#[then(expr = "an order event log is published with status {string}")]
async fn event_published(world: &mut OrderWorld, status: String) {
    let events = world.bus.take_published().await;
    let last = events.last().expect("an event should have been published");
    let expected = match status.as_str() {
        "SUBMITTED" => proto::OrderStatus::Submitted as i32,
        "VOIDED" => proto::OrderStatus::Voided as i32,
        other => panic!("unknown order status {other}"),
    };
    assert_eq!(last.order_status, expected);
    assert_eq!(last.order_id, world.order_id());
}

#[then("no order event logs are published")]
async fn no_events(world: &mut OrderWorld) {
    assert_eq!(world.bus.published_count().await, 0);
}

#[then(expr = "{int} subscription was promoted")]
#[then(expr = "{int} subscriptions were promoted")]
async fn promoted_count(world: &mut OrderWorld, count: usize) {
    assert_eq!(world.last_promoted.len(), count);
}
