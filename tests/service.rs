//! Order service integration tests over in-memory backends.
//!
//! Each test builds a fresh service on a seeded [`MemoryStore`] and a
//! [`MockEventBus`] and drives it through the generated gRPC trait, so the
//! full path from wire request to stored rows and published events is
//! exercised without a network listener.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use prost_types::Timestamp;
use tonic::{Code, Request};

use coursepay::bus::MockEventBus;
use coursepay::domain::student_product::{end_of_day, start_of_day};
use coursepay::domain::{
    BillingRatio, BillingSchedulePeriod, BillingStatus, BillingType, Discount, DiscountAmountType,
    DiscountType, EnrollmentStatus, LeavingReason, Location, Product, ProductSetting, Student,
    StudentProduct, StudentProductLabel, StudentProductStatus, Tax, TaxCategory,
};
use coursepay::proto;
use coursepay::proto::order_service_server::OrderService as OrderServiceRpc;
use coursepay::services::OrderService;
use coursepay::storage::{MemoryStore, OrderStore};

/// Midnight UTC of the current day. Fixture dates hang off this anchor so a
/// test never straddles a day boundary between seeding and asserting.
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

struct Harness {
    store: Arc<MemoryStore>,
    bus: Arc<MockEventBus>,
    service: OrderService,
}

async fn harness() -> Harness {
    let store = Arc::new(seeded_store().await);
    let bus = Arc::new(MockEventBus::new());
    let service = OrderService::new(store.clone(), store.clone(), bus.clone());
    Harness {
        store,
        bus,
        service,
    }
}

/// One student, one location, one recurring product on a monthly schedule
/// with a single current period and a 10% inclusive tax.
async fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
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
            tax_percentage: 10.0,
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
    store.put_product_price("product-1", Some("period-1"), 10000.0).await;
    store
        .put_leaving_reason(LeavingReason {
            leaving_reason_id: "reason-1".to_string(),
            name: "Relocation".to_string(),
            is_archived: false,
        })
        .await;
    store
}

fn subscription(id: &str, label: StudentProductLabel) -> StudentProduct {
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

fn order_item(product_id: &str) -> proto::OrderItem {
    proto::OrderItem {
        product_id: product_id.to_string(),
        discount_id: None,
        start_date: None,
        end_date: None,
        effective_date: None,
        student_product_id: None,
        student_product_version_number: None,
        course_items: Vec::new(),
    }
}

fn mutating_item(product_id: &str, target: &str, version: i32) -> proto::OrderItem {
    let mut item = order_item(product_id);
    item.student_product_id = Some(target.to_string());
    item.student_product_version_number = Some(version);
    item
}

fn tax_item(amount: f64) -> proto::TaxItem {
    proto::TaxItem {
        tax_id: "tax-1".to_string(),
        tax_percentage: 10.0,
        tax_category: proto::TaxCategory::Inclusive as i32,
        tax_amount: amount,
    }
}

fn billed_line(price: f64, tax: f64, final_price: f64) -> proto::BillingItem {
    proto::BillingItem {
        product_id: "product-1".to_string(),
        billing_schedule_period_id: Some("period-1".to_string()),
        price,
        quantity: Some(1),
        tax_item: Some(tax_item(tax)),
        discount_item: None,
        final_price,
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

/// NEW order for product-1 starting today, fully-priced current period.
fn new_order_request() -> proto::CreateOrderRequest {
    let mut req = base_request(proto::OrderType::New);
    let mut item = order_item("product-1");
    item.start_date = Some(ts(today()));
    req.order_items = vec![item];
    req.billing_items = vec![billed_line(10000.0, 909.09, 10000.0)];
    req
}

fn loa_request(target: &str, version: i32, start: DateTime<Utc>) -> proto::CreateOrderRequest {
    let mut req = base_request(proto::OrderType::Loa);
    let mut item = mutating_item("product-1", target, version);
    item.start_date = Some(ts(start));
    item.end_date = Some(ts(start + days(10)));
    req.order_items = vec![item];
    req.leaving_reason_ids = vec!["reason-1".to_string()];
    req.background = Some("Family move".to_string());
    req.future_measures = Some("Rejoin after settling in".to_string());
    req
}

fn withdrawal_request(target: &str, version: i32, effective: DateTime<Utc>) -> proto::CreateOrderRequest {
    let mut req = base_request(proto::OrderType::Withdrawal);
    let mut item = mutating_item("product-1", target, version);
    item.effective_date = Some(ts(effective));
    req.order_items = vec![item];
    req.leaving_reason_ids = vec!["reason-1".to_string()];
    req.background = Some("Transferring schools".to_string());
    req.future_measures = Some("None planned".to_string());
    req
}

async fn create(h: &Harness, req: proto::CreateOrderRequest) -> proto::CreateOrderResponse {
    h.service
        .create_order(Request::new(req))
        .await
        .expect("create_order should succeed")
        .into_inner()
}

async fn create_err(h: &Harness, req: proto::CreateOrderRequest) -> tonic::Status {
    h.service
        .create_order(Request::new(req))
        .await
        .expect_err("create_order should be rejected")
}

async fn void(h: &Harness, order_id: &str, version: i32) -> Result<proto::VoidOrderResponse, tonic::Status> {
    h.service
        .void_order(Request::new(proto::VoidOrderRequest {
            order_id: order_id.to_string(),
            order_version_number: version,
            user_id: "user-1".to_string(),
        }))
        .await
        .map(|r| r.into_inner())
}

// ---------------------------------------------------------------------------
// CreateOrder: NEW
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_order_creates_subscription_and_bills() {
    let h = harness().await;

    let resp = create(&h, new_order_request()).await;
    assert!(resp.successful);
    assert!(!resp.order_id.is_empty());

    let order = h.store.get_order(&resp.order_id).await.unwrap();
    assert_eq!(order.student_id, "student-1");
    assert_eq!(order.version_number, 0);

    let items = h.store.get_order_items(&resp.order_id).await.unwrap();
    assert_eq!(items.len(), 1);
    let sp_id = items[0].student_product_id.clone().unwrap();

    let sp = h.store.get_student_product(&sp_id).await.unwrap();
    assert_eq!(sp.product_status, StudentProductStatus::Ordered);
    assert_eq!(sp.student_product_label, StudentProductLabel::Created);
    assert_eq!(sp.start_date, Some(today()));
    // Recurring subscriptions run to the end of the schedule's last period.
    assert_eq!(sp.end_date, Some(end_of_day(today() + days(15))));
    assert_eq!(sp.version_number, 0);

    let bills = h.store.get_bill_items(&resp.order_id).await.unwrap();
    assert_eq!(bills.len(), 1);
    assert_eq!(bills[0].sequence_number, 1);
    assert_eq!(bills[0].billing_status, BillingStatus::Billed);
    assert_eq!(bills[0].billing_type, BillingType::BilledAtOrder);
    assert_eq!(bills[0].final_price, 10000.0);
    // Tax metadata comes from the catalog, not the submitted line.
    assert_eq!(bills[0].tax_id.as_deref(), Some("tax-1"));
    assert_eq!(bills[0].tax_percentage, Some(10.0));
    assert_eq!(bills[0].tax_category, Some(TaxCategory::Inclusive));

    let logs = h.store.get_action_logs(&resp.order_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].user_id, "user-1");

    let events = h.bus.take_published().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].order_id, resp.order_id);
    assert_eq!(events[0].order_type, proto::OrderType::New as i32);
    assert_eq!(events[0].order_status, proto::OrderStatus::Submitted as i32);
}

#[tokio::test]
async fn upcoming_lines_are_recorded_pending() {
    let h = harness().await;
    h.store
        .put_billing_period(BillingSchedulePeriod {
            billing_schedule_period_id: "period-2".to_string(),
            billing_schedule_id: "schedule-1".to_string(),
            name: "Next month".to_string(),
            start_date: today() + days(16),
            end_date: today() + days(45),
            billing_date: today() + days(10),
            is_archived: false,
        })
        .await;
    h.store.put_product_price("product-1", Some("period-2"), 10000.0).await;

    let mut req = new_order_request();
    let mut upcoming = billed_line(10000.0, 909.09, 10000.0);
    upcoming.billing_schedule_period_id = Some("period-2".to_string());
    req.upcoming_billing_items = vec![upcoming];

    let resp = create(&h, req).await;
    let bills = h.store.get_bill_items(&resp.order_id).await.unwrap();
    assert_eq!(bills.len(), 2);
    assert_eq!(bills[0].billing_status, BillingStatus::Billed);
    assert_eq!(bills[1].billing_status, BillingStatus::Pending);
    assert_eq!(bills[1].sequence_number, 2);
    assert_eq!(
        bills[1].billing_schedule_period_id.as_deref(),
        Some("period-2")
    );
}

#[tokio::test]
async fn price_mismatch_rejects_the_order() {
    let h = harness().await;

    let mut req = new_order_request();
    req.billing_items = vec![billed_line(9000.0, 909.09, 10000.0)];

    let status = create_err(&h, req).await;
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("incorrect price for product product-1"));
    // Nothing may be persisted or announced for a rejected order.
    assert_eq!(h.store.order_count().await, 0);
    assert_eq!(h.bus.published_count().await, 0);
}

#[tokio::test]
async fn missing_tax_entry_is_rejected() {
    let h = harness().await;

    let mut req = new_order_request();
    req.billing_items[0].tax_item = None;

    let status = create_err(&h, req).await;
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("missing its tax entry"));
}

#[tokio::test]
async fn billing_ratio_prorates_the_current_period() {
    let h = harness().await;
    h.store
        .put_billing_ratio(BillingRatio {
            billing_ratio_id: "ratio-1".to_string(),
            billing_schedule_period_id: "period-1".to_string(),
            start_date: today() - days(15),
            end_date: today() + days(15),
            numerator: 1,
            denominator: 2,
        })
        .await;

    // Full price is no longer acceptable once a ratio covers the start date.
    let status = create_err(&h, new_order_request()).await;
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("incorrect price"));

    let mut req = new_order_request();
    req.billing_items = vec![billed_line(5000.0, 454.55, 5000.0)];
    let resp = create(&h, req).await;

    let bills = h.store.get_bill_items(&resp.order_id).await.unwrap();
    assert_eq!(bills[0].price, 5000.0);
    assert_eq!(bills[0].final_price, 5000.0);
}

#[tokio::test]
async fn zero_ratio_period_is_billed_at_zero_not_dropped() {
    let h = harness().await;
    h.store
        .put_billing_ratio(BillingRatio {
            billing_ratio_id: "ratio-0".to_string(),
            billing_schedule_period_id: "period-1".to_string(),
            start_date: today() - days(15),
            end_date: today() + days(15),
            numerator: 0,
            denominator: 2,
        })
        .await;

    let mut req = new_order_request();
    req.billing_items = vec![billed_line(0.0, 0.0, 0.0)];
    let resp = create(&h, req).await;

    // The free period still produces a bill row of its own.
    let bills = h.store.get_bill_items(&resp.order_id).await.unwrap();
    assert_eq!(bills.len(), 1);
    assert_eq!(bills[0].price, 0.0);
    assert_eq!(bills[0].final_price, 0.0);
    assert_eq!(bills[0].billing_status, BillingStatus::Billed);
}

#[tokio::test]
async fn discount_is_verified_and_recorded() {
    let h = harness().await;
    h.store
        .put_discount(Discount {
            discount_id: "discount-1".to_string(),
            name: "Sibling discount".to_string(),
            discount_type: DiscountType::Family,
            discount_amount_type: DiscountAmountType::Percentage,
            discount_amount_value: 20.0,
            available_from: today() - days(10),
            available_until: today() + days(10),
            is_archived: false,
        })
        .await;
    h.store.link_product_discount("product-1", "discount-1").await;

    let discount_line = proto::DiscountItem {
        discount_id: "discount-1".to_string(),
        discount_type: proto::DiscountType::Family as i32,
        discount_amount_type: proto::DiscountAmountType::Percentage as i32,
        discount_amount_value: 20.0,
        discount_amount: 2000.0,
    };

    let mut req = new_order_request();
    req.order_items[0].discount_id = Some("discount-1".to_string());
    req.billing_items = vec![proto::BillingItem {
        discount_item: Some(discount_line.clone()),
        final_price: 8000.0,
        ..billed_line(10000.0, 727.27, 8000.0)
    }];

    let resp = create(&h, req).await;
    let bills = h.store.get_bill_items(&resp.order_id).await.unwrap();
    assert_eq!(bills[0].discount_id.as_deref(), Some("discount-1"));
    assert_eq!(bills[0].discount_amount, Some(2000.0));
    assert_eq!(bills[0].discount_amount_value, Some(20.0));
    assert_eq!(bills[0].final_price, 8000.0);

    // Wrong discount amount.
    let mut req = new_order_request();
    req.order_items[0].discount_id = Some("discount-1".to_string());
    req.billing_items = vec![proto::BillingItem {
        discount_item: Some(proto::DiscountItem {
            discount_amount: 1500.0,
            ..discount_line.clone()
        }),
        final_price: 8500.0,
        ..billed_line(10000.0, 772.73, 8500.0)
    }];
    let status = create_err(&h, req).await;
    assert!(status.message().contains("incorrect discount amount"));

    // Discount on the billing line without one on the order item.
    let mut req = new_order_request();
    req.billing_items = vec![proto::BillingItem {
        discount_item: Some(discount_line),
        final_price: 8000.0,
        ..billed_line(10000.0, 727.27, 8000.0)
    }];
    let status = create_err(&h, req).await;
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("carries a discount"));
}

#[tokio::test]
async fn one_time_product_needs_enrollment_when_flagged() {
    let h = harness().await;
    h.store
        .put_product(Product {
            product_id: "product-3".to_string(),
            name: "Entrance fee".to_string(),
            available_from: today() - days(100),
            available_until: today() + days(300),
            billing_schedule_id: None,
            tax_id: None,
        })
        .await;
    h.store.link_product_location("product-3", "location-1").await;
    h.store
        .put_product_setting(ProductSetting {
            product_id: "product-3".to_string(),
            is_pausable: false,
            is_enrollment_required: true,
            is_added_to_enrollment_by_default: false,
            is_operation_fee: false,
        })
        .await;
    h.store.put_product_price("product-3", None, 3000.0).await;

    let mut req = base_request(proto::OrderType::New);
    req.order_items = vec![order_item("product-3")];
    req.billing_items = vec![proto::BillingItem {
        product_id: "product-3".to_string(),
        billing_schedule_period_id: None,
        price: 3000.0,
        quantity: Some(1),
        tax_item: None,
        discount_item: None,
        final_price: 3000.0,
        adjustment_price: None,
    }];

    let status = create_err(&h, req.clone()).await;
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("not enrolled"));

    h.store
        .set_enrollment("student-1", "location-1", EnrollmentStatus::Enrolled)
        .await;
    let resp = create(&h, req).await;

    let items = h.store.get_order_items(&resp.order_id).await.unwrap();
    let sp_id = items[0].student_product_id.clone().unwrap();
    let sp = h.store.get_student_product(&sp_id).await.unwrap();
    // One-time products carry no subscription window.
    assert_eq!(sp.start_date, None);
    assert_eq!(sp.end_date, None);
}

#[tokio::test]
async fn grade_restricted_product_is_rejected() {
    let h = harness().await;
    h.store.restrict_product_grades("product-1", &["grade-9"]).await;

    let status = create_err(&h, new_order_request()).await;
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("grade"));
}

#[tokio::test]
async fn unknown_references_are_rejected() {
    let h = harness().await;

    let mut req = new_order_request();
    req.student_id = "ghost".to_string();
    let status = create_err(&h, req).await;
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("student not found: ghost"));

    let mut req = new_order_request();
    req.order_items[0].product_id = "nope".to_string();
    req.billing_items[0].product_id = "nope".to_string();
    let status = create_err(&h, req).await;
    assert!(status.message().contains("product not found"));

    let mut req = new_order_request();
    req.user_id = String::new();
    let status = create_err(&h, req).await;
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("user id"));

    let mut req = new_order_request();
    req.order_type = proto::OrderType::Unspecified as i32;
    let status = create_err(&h, req).await;
    assert!(status.message().contains("unknown order type"));
}

// ---------------------------------------------------------------------------
// CreateOrder: LOA / RESUME / WITHDRAWAL / GRADUATE / UPDATE
// ---------------------------------------------------------------------------

#[tokio::test]
async fn same_day_pause_takes_effect_immediately() {
    let h = harness().await;
    h.store.put_student_product(subscription("sp-loa", StudentProductLabel::Created)).await;

    let resp = create(&h, loa_request("sp-loa", 0, today())).await;

    let sp = h.store.get_student_product("sp-loa").await.unwrap();
    assert_eq!(sp.student_product_label, StudentProductLabel::Paused);
    assert_eq!(sp.product_status, StudentProductStatus::Ordered);
    assert_eq!(sp.end_date, Some(end_of_day(today())));
    assert_eq!(sp.version_number, 1);

    let reasons = h.store.get_order_leaving_reasons(&resp.order_id).await.unwrap();
    assert_eq!(reasons.len(), 1);
    assert_eq!(reasons[0].leaving_reason_id, "reason-1");
}

#[tokio::test]
async fn future_pause_is_scheduled() {
    let h = harness().await;
    h.store.put_student_product(subscription("sp-loa", StudentProductLabel::Created)).await;

    create(&h, loa_request("sp-loa", 0, today() + days(1))).await;

    let sp = h.store.get_student_product("sp-loa").await.unwrap();
    assert_eq!(sp.student_product_label, StudentProductLabel::PauseScheduled);
    assert_eq!(sp.end_date, Some(end_of_day(today() + days(1))));
}

#[tokio::test]
async fn pause_requires_a_pausable_product() {
    let h = harness().await;
    h.store
        .put_product_setting(ProductSetting {
            product_id: "product-1".to_string(),
            is_pausable: false,
            is_enrollment_required: false,
            is_added_to_enrollment_by_default: false,
            is_operation_fee: false,
        })
        .await;
    h.store.put_student_product(subscription("sp-loa", StudentProductLabel::Created)).await;

    let status = create_err(&h, loa_request("sp-loa", 0, today())).await;
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("cannot be paused"));
}

#[tokio::test]
async fn stale_subscription_version_is_a_conflict() {
    let h = harness().await;
    let mut sp = subscription("sp-loa", StudentProductLabel::Created);
    sp.version_number = 4;
    h.store.put_student_product(sp).await;

    let status = create_err(&h, loa_request("sp-loa", 3, today())).await;
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("OptimisticLockingEntityVersionMismatched"));

    // The subscription is untouched and no order exists.
    let sp = h.store.get_student_product("sp-loa").await.unwrap();
    assert_eq!(sp.student_product_label, StudentProductLabel::Created);
    assert_eq!(sp.version_number, 4);
    assert_eq!(h.store.order_count().await, 0);
}

#[tokio::test]
async fn pending_scheduled_change_blocks_further_mutation() {
    let h = harness().await;
    h.store
        .put_student_product(subscription("sp-loa", StudentProductLabel::WithdrawalScheduled))
        .await;

    let status = create_err(&h, loa_request("sp-loa", 0, today())).await;
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("pending scheduled change"));
}

#[tokio::test]
async fn unknown_leaving_reason_is_rejected() {
    let h = harness().await;
    h.store.put_student_product(subscription("sp-loa", StudentProductLabel::Created)).await;

    let mut req = loa_request("sp-loa", 0, today());
    req.leaving_reason_ids.push("bogus".to_string());
    let status = create_err(&h, req).await;
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("bogus"));
}

#[tokio::test]
async fn resume_spawns_a_linked_subscription() {
    let h = harness().await;
    h.store.put_student_product(subscription("sp-paused", StudentProductLabel::Paused)).await;

    let mut req = base_request(proto::OrderType::Resume);
    let mut item = mutating_item("product-1", "sp-paused", 0);
    item.start_date = Some(ts(today() + days(1)));
    req.order_items = vec![item];
    let resp = create(&h, req).await;

    let items = h.store.get_order_items(&resp.order_id).await.unwrap();
    let new_id = items[0].student_product_id.clone().unwrap();
    assert_ne!(new_id, "sp-paused");

    let replacement = h.store.get_student_product(&new_id).await.unwrap();
    assert_eq!(replacement.student_product_label, StudentProductLabel::Created);
    assert_eq!(
        replacement.updated_from_student_product_id.as_deref(),
        Some("sp-paused")
    );
    assert_eq!(replacement.start_date, Some(today() + days(1)));
    assert_eq!(replacement.end_date, Some(end_of_day(today() + days(15))));

    // The paused row keeps its state but takes a version bump.
    let paused = h.store.get_student_product("sp-paused").await.unwrap();
    assert_eq!(paused.student_product_label, StudentProductLabel::Paused);
    assert_eq!(paused.version_number, 1);
}

#[tokio::test]
async fn resume_requires_a_paused_subscription() {
    let h = harness().await;
    h.store.put_student_product(subscription("sp-active", StudentProductLabel::Created)).await;

    let mut req = base_request(proto::OrderType::Resume);
    let mut item = mutating_item("product-1", "sp-active", 0);
    item.start_date = Some(ts(today() + days(1)));
    req.order_items = vec![item];

    let status = create_err(&h, req).await;
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("not paused"));
}

#[tokio::test]
async fn graduation_needs_background_and_schedules_the_end() {
    let h = harness().await;
    h.store.put_student_product(subscription("sp-grad", StudentProductLabel::Created)).await;

    let mut req = base_request(proto::OrderType::Graduate);
    let mut item = mutating_item("product-1", "sp-grad", 0);
    item.effective_date = Some(ts(today() + days(7)));
    req.order_items = vec![item];

    let status = create_err(&h, req.clone()).await;
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("required"));

    req.background = Some("Completed the program".to_string());
    req.future_measures = Some("Alumni newsletter".to_string());
    create(&h, req).await;

    let sp = h.store.get_student_product("sp-grad").await.unwrap();
    assert_eq!(sp.student_product_label, StudentProductLabel::GraduationScheduled);
    assert_eq!(sp.end_date, Some(end_of_day(today() + days(7))));
}

#[tokio::test]
async fn update_order_bills_an_adjustment() {
    let h = harness().await;
    // Half-price ratio covering the original mid-period start, but not today.
    h.store
        .put_billing_ratio(BillingRatio {
            billing_ratio_id: "ratio-1".to_string(),
            billing_schedule_period_id: "period-1".to_string(),
            start_date: today() - days(14),
            end_date: today() - days(2),
            numerator: 1,
            denominator: 2,
        })
        .await;

    let mut req = new_order_request();
    req.order_items[0].start_date = Some(ts(today() - days(7)));
    req.billing_items = vec![billed_line(5000.0, 454.55, 5000.0)];
    let resp = create(&h, req).await;

    let items = h.store.get_order_items(&resp.order_id).await.unwrap();
    let sp_id = items[0].student_product_id.clone().unwrap();

    // Re-bill the same period at full charge; the delta is the adjustment.
    let mut update = base_request(proto::OrderType::Update);
    let mut item = mutating_item("product-1", &sp_id, 0);
    item.effective_date = Some(ts(today()));
    update.order_items = vec![item];
    update.billing_items = vec![proto::BillingItem {
        adjustment_price: Some(5000.0),
        ..billed_line(10000.0, 909.09, 10000.0)
    }];
    let resp = create(&h, update.clone()).await;

    let bills = h.store.get_bill_items(&resp.order_id).await.unwrap();
    assert_eq!(bills[0].billing_type, BillingType::AdjustmentBilling);
    assert_eq!(bills[0].adjustment_price, Some(5000.0));

    let sp = h.store.get_student_product(&sp_id).await.unwrap();
    assert_eq!(sp.student_product_label, StudentProductLabel::Created);
    assert_eq!(sp.version_number, 1);

    // A wrong delta is caught against the previously billed final price.
    update.order_items[0].student_product_version_number = Some(1);
    update.billing_items[0].adjustment_price = Some(4000.0);
    let status = create_err(&h, update).await;
    assert!(status.message().contains("incorrect adjustment price"));
}

// ---------------------------------------------------------------------------
// VoidOrder
// ---------------------------------------------------------------------------

#[tokio::test]
async fn voiding_a_new_order_cancels_the_subscription() {
    let h = harness().await;
    let resp = create(&h, new_order_request()).await;
    let items = h.store.get_order_items(&resp.order_id).await.unwrap();
    let sp_id = items[0].student_product_id.clone().unwrap();

    let voided = void(&h, &resp.order_id, 0).await.unwrap();
    assert!(voided.successful);

    let sp = h.store.get_student_product(&sp_id).await.unwrap();
    assert_eq!(sp.product_status, StudentProductStatus::Cancelled);
    assert_eq!(sp.student_product_label, StudentProductLabel::Created);
    assert_eq!(sp.start_date, None);
    assert_eq!(sp.end_date, None);

    let order = h.store.get_order(&resp.order_id).await.unwrap();
    assert_eq!(order.version_number, 1);

    let bills = h.store.get_bill_items(&resp.order_id).await.unwrap();
    assert!(bills.iter().all(|b| b.billing_status == BillingStatus::Cancelled));

    let logs = h.store.get_action_logs(&resp.order_id).await.unwrap();
    assert_eq!(logs.len(), 2);

    let events = h.bus.take_published().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].order_status, proto::OrderStatus::Voided as i32);
}

#[tokio::test]
async fn voiding_a_withdrawal_restores_the_subscription() {
    let h = harness().await;
    h.store.put_student_product(subscription("sp-w", StudentProductLabel::Created)).await;

    let resp = create(&h, withdrawal_request("sp-w", 0, today() + days(5))).await;

    let sp = h.store.get_student_product("sp-w").await.unwrap();
    assert_eq!(sp.student_product_label, StudentProductLabel::WithdrawalScheduled);
    assert_eq!(sp.end_date, Some(end_of_day(today() + days(5))));
    assert_eq!(sp.version_number, 1);

    let order = h.store.get_order(&resp.order_id).await.unwrap();
    assert_eq!(order.withdrawal_effective_date, Some(today() + days(5)));

    void(&h, &resp.order_id, 0).await.unwrap();

    // The subscription returns to its ordered state with the end pushed back
    // to the schedule's latest period end.
    let sp = h.store.get_student_product("sp-w").await.unwrap();
    assert_eq!(sp.product_status, StudentProductStatus::Ordered);
    assert_eq!(sp.student_product_label, StudentProductLabel::Created);
    assert_eq!(sp.end_date, Some(end_of_day(today() + days(15))));
    assert_eq!(sp.version_number, 2);
}

#[tokio::test]
async fn void_version_and_repeat_guards() {
    let h = harness().await;
    let resp = create(&h, new_order_request()).await;

    let status = void(&h, &resp.order_id, 7).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("OptimisticLockingEntityVersionMismatched"));

    void(&h, &resp.order_id, 0).await.unwrap();

    // The first void bumped the order version; replaying it is stale.
    let status = void(&h, &resp.order_id, 0).await.unwrap_err();
    assert!(status.message().contains("OptimisticLockingEntityVersionMismatched"));

    let status = void(&h, &resp.order_id, 1).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("already voided"));
}

#[tokio::test]
async fn effective_change_can_no_longer_be_voided() {
    let h = harness().await;
    h.store.put_student_product(subscription("sp-w", StudentProductLabel::Created)).await;

    // Effective today at midnight, so the change is in force by the time the
    // void arrives.
    let resp = create(&h, withdrawal_request("sp-w", 0, today())).await;
    let status = void(&h, &resp.order_id, 0).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("already took effect"));
}

#[tokio::test]
async fn effective_graduation_can_no_longer_be_voided() {
    let h = harness().await;
    h.store.put_student_product(subscription("sp-g", StudentProductLabel::Created)).await;

    let mut req = base_request(proto::OrderType::Graduate);
    let mut item = mutating_item("product-1", "sp-g", 0);
    item.effective_date = Some(ts(today()));
    req.order_items = vec![item];
    req.background = Some("Completed the program".to_string());
    req.future_measures = Some("Alumni newsletter".to_string());

    let resp = create(&h, req).await;
    let status = void(&h, &resp.order_id, 0).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("already took effect"));

    // The subscription stays on its scheduled course.
    let sp = h.store.get_student_product("sp-g").await.unwrap();
    assert_eq!(sp.student_product_label, StudentProductLabel::GraduationScheduled);
}

#[tokio::test]
async fn started_pause_can_no_longer_be_voided() {
    let h = harness().await;
    h.store.put_student_product(subscription("sp-p", StudentProductLabel::Created)).await;

    // The pause starts today, so it is in force before the void arrives.
    let resp = create(&h, loa_request("sp-p", 0, today())).await;
    let status = void(&h, &resp.order_id, 0).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("already took effect"));

    let sp = h.store.get_student_product("sp-p").await.unwrap();
    assert_eq!(sp.student_product_label, StudentProductLabel::Paused);
}

#[tokio::test]
async fn voiding_an_unknown_order_is_not_found() {
    let h = harness().await;
    let status = void(&h, "no-such-order", 0).await.unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

// ---------------------------------------------------------------------------
// Submission retry and event publishing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_id_collisions_are_retried_with_fresh_ids() {
    let h = harness().await;
    h.store.fail_submits_with_duplicate_key(2).await;

    let resp = create(&h, new_order_request()).await;
    assert!(resp.successful);
    assert_eq!(h.store.order_count().await, 1);
    assert_eq!(h.bus.published_count().await, 1);
}

#[tokio::test]
async fn persistent_duplicate_failures_surface_as_internal() {
    let h = harness().await;
    h.store.fail_submits_with_duplicate_key(10).await;

    let status = create_err(&h, new_order_request()).await;
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(h.store.order_count().await, 0);
    assert_eq!(h.bus.published_count().await, 0);
}

#[tokio::test]
async fn publish_failure_does_not_fail_the_order() {
    let h = harness().await;
    h.bus.set_fail_on_publish(true).await;

    let resp = create(&h, new_order_request()).await;
    assert!(resp.successful);
    assert_eq!(h.store.order_count().await, 1);
    assert_eq!(h.bus.published_count().await, 0);
}

// ---------------------------------------------------------------------------
// RetrieveListOfOrderProducts
// ---------------------------------------------------------------------------

async fn seed_listing(h: &Harness, count: usize) {
    for i in 0..count {
        let mut sp = subscription(&format!("sp-list-{i}"), StudentProductLabel::Created);
        sp.created_at = today() - days(i as i64);
        h.store.put_student_product(sp).await;
    }
}

async fn list(
    h: &Harness,
    paging: Option<proto::Paging>,
) -> Result<proto::RetrieveListOfOrderProductsResponse, tonic::Status> {
    h.service
        .retrieve_list_of_order_products(Request::new(proto::RetrieveListOfOrderProductsRequest {
            student_id: "student-1".to_string(),
            location_ids: vec!["location-1".to_string()],
            paging,
        }))
        .await
        .map(|r| r.into_inner())
}

#[tokio::test]
async fn listing_pages_newest_first() {
    let h = harness().await;
    seed_listing(&h, 5).await;

    let page = list(&h, Some(proto::Paging { limit: 2, offset: 0 })).await.unwrap();
    assert_eq!(page.total_items, 5);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].student_product_id, "sp-list-0");
    assert_eq!(page.items[1].student_product_id, "sp-list-1");
    assert_eq!(page.next_paging, Some(proto::Paging { limit: 2, offset: 2 }));
    assert_eq!(page.previous_paging, None);
    let location = page.items[0].location_info.as_ref().unwrap();
    assert_eq!(location.location_name, "Shibuya");
    assert_eq!(
        page.items[0].status,
        proto::StudentProductStatus::Ordered as i32
    );

    let page = list(&h, Some(proto::Paging { limit: 2, offset: 2 })).await.unwrap();
    assert_eq!(page.next_paging, Some(proto::Paging { limit: 2, offset: 4 }));
    assert_eq!(page.previous_paging, Some(proto::Paging { limit: 2, offset: 0 }));

    let page = list(&h, Some(proto::Paging { limit: 2, offset: 4 })).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.next_paging, None);
    assert_eq!(page.previous_paging, Some(proto::Paging { limit: 2, offset: 2 }));
}

#[tokio::test]
async fn listing_defaults_and_bounds() {
    let h = harness().await;
    seed_listing(&h, 5).await;

    // No paging block: everything on one default-limit page.
    let page = list(&h, None).await.unwrap();
    assert_eq!(page.items.len(), 5);
    assert_eq!(page.next_paging, None);

    let status = list(&h, Some(proto::Paging { limit: 2, offset: 9 })).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("beyond the result set"));

    let status = list(&h, Some(proto::Paging { limit: -1, offset: 0 })).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn listing_requires_student_and_locations() {
    let h = harness().await;

    let status = h
        .service
        .retrieve_list_of_order_products(Request::new(proto::RetrieveListOfOrderProductsRequest {
            student_id: String::new(),
            location_ids: vec!["location-1".to_string()],
            paging: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = h
        .service
        .retrieve_list_of_order_products(Request::new(proto::RetrieveListOfOrderProductsRequest {
            student_id: "student-1".to_string(),
            location_ids: Vec::new(),
            paging: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn listing_filters_by_location() {
    let h = harness().await;
    seed_listing(&h, 2).await;
    let mut elsewhere = subscription("sp-elsewhere", StudentProductLabel::Created);
    elsewhere.location_id = "location-2".to_string();
    h.store.put_student_product(elsewhere).await;

    let page = list(&h, None).await.unwrap();
    assert_eq!(page.total_items, 2);
    assert!(page.items.iter().all(|i| i.student_product_id != "sp-elsewhere"));

    let empty = h
        .service
        .retrieve_list_of_order_products(Request::new(proto::RetrieveListOfOrderProductsRequest {
            student_id: "student-1".to_string(),
            location_ids: vec!["location-9".to_string()],
            paging: None,
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(empty.total_items, 0);
    assert!(empty.items.is_empty());
    assert_eq!(empty.next_paging, None);
}

// ---------------------------------------------------------------------------
// UpdateStudentProductStatus
// ---------------------------------------------------------------------------

async fn promote(
    h: &Harness,
    labels: &[&str],
) -> Result<proto::UpdateStudentProductStatusResponse, tonic::Status> {
    h.service
        .update_student_product_status(Request::new(proto::UpdateStudentProductStatusRequest {
            organization_id: "org-1".to_string(),
            effective_date: Some(ts(Utc::now())),
            student_product_labels: labels.iter().map(|s| s.to_string()).collect(),
        }))
        .await
        .map(|r| r.into_inner())
}

#[tokio::test]
async fn due_scheduled_labels_are_promoted() {
    let h = harness().await;
    let mut due_pause = subscription("sp-sched-a", StudentProductLabel::PauseScheduled);
    due_pause.end_date = Some(today());
    h.store.put_student_product(due_pause).await;
    let mut due_withdrawal = subscription("sp-sched-b", StudentProductLabel::WithdrawalScheduled);
    due_withdrawal.end_date = Some(today() - days(2));
    h.store.put_student_product(due_withdrawal).await;
    let mut not_due = subscription("sp-sched-c", StudentProductLabel::PauseScheduled);
    not_due.end_date = Some(today() + days(5));
    h.store.put_student_product(not_due).await;

    let resp = promote(&h, &["PAUSE_SCHEDULED", "WITHDRAWAL_SCHEDULED", "GRADUATION_SCHEDULED"])
        .await
        .unwrap();
    assert_eq!(resp.student_product_ids, vec!["sp-sched-a", "sp-sched-b"]);

    let paused = h.store.get_student_product("sp-sched-a").await.unwrap();
    assert_eq!(paused.product_status, StudentProductStatus::Ordered);
    assert_eq!(paused.student_product_label, StudentProductLabel::Paused);
    assert_eq!(paused.version_number, 1);

    let withdrawn = h.store.get_student_product("sp-sched-b").await.unwrap();
    assert_eq!(withdrawn.product_status, StudentProductStatus::Cancelled);
    assert_eq!(withdrawn.student_product_label, StudentProductLabel::Created);

    let untouched = h.store.get_student_product("sp-sched-c").await.unwrap();
    assert_eq!(untouched.student_product_label, StudentProductLabel::PauseScheduled);
    assert_eq!(untouched.version_number, 0);

    // Promotions are idempotent; a rerun finds nothing left to do.
    let resp = promote(&h, &["PAUSE_SCHEDULED", "WITHDRAWAL_SCHEDULED"]).await.unwrap();
    assert!(resp.student_product_ids.is_empty());
}

#[tokio::test]
async fn promotion_rejects_bad_labels() {
    let h = harness().await;

    let status = promote(&h, &["NOT_A_LABEL"]).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("unknown student product label"));

    let status = promote(&h, &["PAUSED"]).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("not a scheduled label"));
}

#[tokio::test]
async fn promotion_requires_organization_and_date() {
    let h = harness().await;

    let status = h
        .service
        .update_student_product_status(Request::new(proto::UpdateStudentProductStatusRequest {
            organization_id: String::new(),
            effective_date: Some(ts(Utc::now())),
            student_product_labels: vec!["PAUSE_SCHEDULED".to_string()],
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = h
        .service
        .update_student_product_status(Request::new(proto::UpdateStudentProductStatusRequest {
            organization_id: "org-1".to_string(),
            effective_date: None,
            student_product_labels: vec!["PAUSE_SCHEDULED".to_string()],
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("effective_date"));
}
