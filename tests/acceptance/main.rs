//! Acceptance tests for the order lifecycle using Cucumber.
//!
//! Human-readable scenarios under `tests/acceptance/features/` define the
//! expected behavior of order submission, leave of absence, voiding, and
//! scheduled status promotion. Step definitions drive the gRPC service over
//! the in-memory store and mock bus.
//!
//! ```bash
//! cargo test --test acceptance
//! ```

mod steps;

use cucumber::World;
use steps::order_lifecycle::OrderWorld;

#[tokio::main]
async fn main() {
    println!("\n=== Running Order Submission Scenarios ===\n");
    OrderWorld::cucumber()
        .fail_on_skipped()
        .run("tests/acceptance/features/order_submission.feature")
        .await;

    println!("\n=== Running Leave of Absence Scenarios ===\n");
    OrderWorld::cucumber()
        .fail_on_skipped()
        .run("tests/acceptance/features/leave_of_absence.feature")
        .await;

    println!("\n=== Running Void Order Scenarios ===\n");
    OrderWorld::cucumber()
        .fail_on_skipped()
        .run("tests/acceptance/features/void_order.feature")
        .await;

    println!("\n=== Running Scheduled Status Scenarios ===\n");
    OrderWorld::cucumber()
        .fail_on_skipped()
        .run("tests/acceptance/features/scheduled_status.feature")
        .await;
}
