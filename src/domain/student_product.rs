//! State machine for student product subscriptions.
//!
//! Transitions are driven by order type and the triggering date: a change
//! dated strictly after the processing day installs a scheduled label, a
//! same-day change takes effect immediately. Date comparisons happen at day
//! granularity.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tonic::Status;

use super::{OrderType, StudentProduct, StudentProductLabel, StudentProductStatus};

/// Truncate to midnight UTC of the same day.
pub fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Last second of the same day.
pub fn end_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    start_of_day(t) + Duration::days(1) - Duration::seconds(1)
}

/// Whether `trigger` falls on a later day than `now`.
pub fn is_future_day(trigger: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    trigger.date_naive() > now.date_naive()
}

/// Label installed by an LOA order: scheduled for future start dates,
/// effective immediately when the pause starts today.
pub fn pause_label(start: DateTime<Utc>, now: DateTime<Utc>) -> StudentProductLabel {
    if is_future_day(start, now) {
        StudentProductLabel::PauseScheduled
    } else {
        StudentProductLabel::Paused
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TransitionError {
    #[error("student product {id} has a pending scheduled change ({label})")]
    PendingChange { id: String, label: &'static str },

    #[error("cannot void {order_type} order while student product {id} is {label}")]
    VoidConflict {
        order_type: &'static str,
        id: String,
        label: &'static str,
    },

    #[error("missing {field} date on order item for product {product_id}")]
    MissingDate {
        field: &'static str,
        product_id: String,
    },

    #[error("student product {id} has no subscription window")]
    MissingSubscriptionWindow { id: String },

    #[error("invalid leave start date for student product {id}")]
    InvalidLoaStart { id: String },

    #[error("invalid leave end date for student product {id}")]
    InvalidLoaEnd { id: String },

    #[error("invalid effective date for student product {id}")]
    InvalidEffectiveDate { id: String },

    #[error("student product {id} is not paused")]
    NotPaused { id: String },

    #[error("no billing schedule period available for product {product_id}")]
    MissingBillingPeriod { product_id: String },
}

impl From<TransitionError> for Status {
    fn from(err: TransitionError) -> Self {
        Status::failed_precondition(err.to_string())
    }
}

/// Reject mutating orders against a subscription that already carries a
/// scheduled change; the pending order must be processed or voided first.
pub fn check_pending_change(sp: &StudentProduct) -> Result<(), TransitionError> {
    if sp.student_product_label.is_scheduled() {
        return Err(TransitionError::PendingChange {
            id: sp.student_product_id.clone(),
            label: sp.student_product_label.as_str(),
        });
    }
    Ok(())
}

/// The LOA window must start today or later, lie inside the subscription
/// window, and end strictly after it starts.
pub fn check_loa_window(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    sp: &StudentProduct,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    let (sp_start, sp_end) = subscription_window(sp)?;
    let start_day = start.date_naive();
    if start_day < now.date_naive()
        || start_day < sp_start.date_naive()
        || start_day >= sp_end.date_naive()
    {
        return Err(TransitionError::InvalidLoaStart {
            id: sp.student_product_id.clone(),
        });
    }
    if end.date_naive() <= start_day {
        return Err(TransitionError::InvalidLoaEnd {
            id: sp.student_product_id.clone(),
        });
    }
    Ok(())
}

/// A withdrawal/graduation effective date must be today or later and lie
/// inside the subscription window.
pub fn check_effective_date(
    effective: DateTime<Utc>,
    sp: &StudentProduct,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    let (sp_start, sp_end) = subscription_window(sp)?;
    let day = effective.date_naive();
    if day < now.date_naive() || day < sp_start.date_naive() || day >= sp_end.date_naive() {
        return Err(TransitionError::InvalidEffectiveDate {
            id: sp.student_product_id.clone(),
        });
    }
    Ok(())
}

fn subscription_window(
    sp: &StudentProduct,
) -> Result<(DateTime<Utc>, DateTime<Utc>), TransitionError> {
    match (sp.start_date, sp.end_date) {
        (Some(s), Some(e)) => Ok((s, e)),
        _ => Err(TransitionError::MissingSubscriptionWindow {
            id: sp.student_product_id.clone(),
        }),
    }
}

/// A RESUME order only applies to a paused (or pause-scheduled) subscription.
pub fn check_resumable(sp: &StudentProduct) -> Result<(), TransitionError> {
    match sp.student_product_label {
        StudentProductLabel::Paused | StudentProductLabel::PauseScheduled => Ok(()),
        _ => Err(TransitionError::NotPaused {
            id: sp.student_product_id.clone(),
        }),
    }
}

/// Labels under which an order of the given type may still be voided.
/// Voiding a withdrawal or graduation is never label-gated; for every other
/// order type a scheduled withdrawal/graduation owns the subscription and
/// blocks the void.
pub fn check_void_allowed(
    order_type: OrderType,
    sp: &StudentProduct,
) -> Result<(), TransitionError> {
    let label = sp.student_product_label;
    let blocked = match order_type {
        OrderType::Withdrawal | OrderType::Graduate => false,
        _ => {
            label == StudentProductLabel::WithdrawalScheduled
                || label == StudentProductLabel::GraduationScheduled
        }
    };
    if blocked {
        Err(TransitionError::VoidConflict {
            order_type: order_type.as_str(),
            id: sp.student_product_id.clone(),
            label: label.as_str(),
        })
    } else {
        Ok(())
    }
}

/// Replacement field values applied to a student product when the order that
/// produced its current state is voided.
#[derive(Debug, Clone, PartialEq)]
pub struct VoidReversal {
    pub product_status: StudentProductStatus,
    pub student_product_label: StudentProductLabel,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Compute the reversal for voiding an order of the given type.
///
/// NEW/RESUME orders created the subscription, so voiding cancels it and
/// clears its window. LOA/WITHDRAWAL/GRADUATE orders scheduled an end to an
/// existing subscription, so voiding restores it to ORDERED/CREATED with the
/// end date pushed back to the latest billing period's end.
pub fn void_reversal(
    order_type: OrderType,
    sp: &StudentProduct,
    latest_period_end: Option<DateTime<Utc>>,
) -> Result<VoidReversal, TransitionError> {
    match order_type {
        OrderType::Loa | OrderType::Withdrawal | OrderType::Graduate => {
            let end = latest_period_end.ok_or_else(|| TransitionError::MissingBillingPeriod {
                product_id: sp.product_id.clone(),
            })?;
            Ok(VoidReversal {
                product_status: StudentProductStatus::Ordered,
                student_product_label: StudentProductLabel::Created,
                start_date: sp.start_date,
                end_date: Some(end),
            })
        }
        _ => Ok(VoidReversal {
            product_status: StudentProductStatus::Cancelled,
            student_product_label: StudentProductLabel::Created,
            start_date: None,
            end_date: None,
        }),
    }
}

/// Advance a scheduled label whose date has arrived. Pause becomes effective
/// in place; withdrawal/graduation terminate the subscription.
pub fn promote_scheduled(
    label: StudentProductLabel,
) -> Option<(StudentProductStatus, StudentProductLabel)> {
    match label {
        StudentProductLabel::PauseScheduled => {
            Some((StudentProductStatus::Ordered, StudentProductLabel::Paused))
        }
        StudentProductLabel::WithdrawalScheduled | StudentProductLabel::GraduationScheduled => {
            Some((StudentProductStatus::Cancelled, StudentProductLabel::Created))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 30, 0).unwrap()
    }

    fn subscription(start: DateTime<Utc>, end: DateTime<Utc>) -> StudentProduct {
        StudentProduct {
            student_product_id: "sp-1".to_string(),
            student_id: "student-1".to_string(),
            product_id: "product-1".to_string(),
            location_id: "location-1".to_string(),
            start_date: Some(start),
            end_date: Some(end),
            product_status: StudentProductStatus::Ordered,
            student_product_label: StudentProductLabel::Created,
            updated_from_student_product_id: None,
            version_number: 0,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn same_day_pause_is_effective_immediately() {
        let now = day(2025, 4, 10);
        assert_eq!(pause_label(now, now), StudentProductLabel::Paused);
        // Different wall-clock time on the same day still counts as today.
        let later = Utc.with_ymd_and_hms(2025, 4, 10, 23, 0, 0).unwrap();
        assert_eq!(pause_label(later, now), StudentProductLabel::Paused);
    }

    #[test]
    fn future_pause_is_scheduled() {
        let now = day(2025, 4, 10);
        assert_eq!(
            pause_label(day(2025, 4, 11), now),
            StudentProductLabel::PauseScheduled
        );
    }

    #[test]
    fn end_of_day_is_last_second() {
        let eod = end_of_day(day(2025, 4, 10));
        assert_eq!(eod, Utc.with_ymd_and_hms(2025, 4, 10, 23, 59, 59).unwrap());
    }

    #[test]
    fn loa_window_must_fit_subscription() {
        let now = day(2025, 4, 10);
        let sp = subscription(day(2025, 4, 1), day(2025, 12, 31));

        assert!(check_loa_window(day(2025, 5, 1), day(2025, 6, 1), &sp, now).is_ok());

        // Start in the past.
        assert_eq!(
            check_loa_window(day(2025, 4, 9), day(2025, 6, 1), &sp, now),
            Err(TransitionError::InvalidLoaStart {
                id: "sp-1".to_string()
            })
        );
        // Start at/after subscription end.
        assert_eq!(
            check_loa_window(day(2025, 12, 31), day(2026, 1, 5), &sp, now),
            Err(TransitionError::InvalidLoaStart {
                id: "sp-1".to_string()
            })
        );
        // End not after start.
        assert_eq!(
            check_loa_window(day(2025, 5, 1), day(2025, 5, 1), &sp, now),
            Err(TransitionError::InvalidLoaEnd {
                id: "sp-1".to_string()
            })
        );
    }

    #[test]
    fn effective_date_bounds() {
        let now = day(2025, 4, 10);
        let sp = subscription(day(2025, 4, 1), day(2025, 12, 31));

        assert!(check_effective_date(day(2025, 4, 10), &sp, now).is_ok());
        assert!(check_effective_date(day(2025, 4, 9), &sp, now).is_err());
        assert!(check_effective_date(day(2026, 1, 1), &sp, now).is_err());
    }

    #[test]
    fn pending_scheduled_change_blocks_new_mutation() {
        let mut sp = subscription(day(2025, 4, 1), day(2025, 12, 31));
        sp.student_product_label = StudentProductLabel::WithdrawalScheduled;
        assert!(check_pending_change(&sp).is_err());

        sp.student_product_label = StudentProductLabel::Created;
        assert!(check_pending_change(&sp).is_ok());
    }

    #[test]
    fn resume_requires_paused_subscription() {
        let mut sp = subscription(day(2025, 4, 1), day(2025, 12, 31));
        assert!(check_resumable(&sp).is_err());
        sp.student_product_label = StudentProductLabel::Paused;
        assert!(check_resumable(&sp).is_ok());
    }

    #[test]
    fn void_guard_per_order_type() {
        let mut sp = subscription(day(2025, 4, 1), day(2025, 12, 31));

        sp.student_product_label = StudentProductLabel::WithdrawalScheduled;
        assert!(check_void_allowed(OrderType::Withdrawal, &sp).is_ok());
        assert!(check_void_allowed(OrderType::Graduate, &sp).is_ok());
        assert!(check_void_allowed(OrderType::New, &sp).is_err());
        assert!(check_void_allowed(OrderType::Loa, &sp).is_err());

        sp.student_product_label = StudentProductLabel::GraduationScheduled;
        assert!(check_void_allowed(OrderType::Graduate, &sp).is_ok());
        assert!(check_void_allowed(OrderType::Resume, &sp).is_err());

        // A pause never blocks a void of any order type.
        sp.student_product_label = StudentProductLabel::PauseScheduled;
        assert!(check_void_allowed(OrderType::Loa, &sp).is_ok());
        assert!(check_void_allowed(OrderType::Withdrawal, &sp).is_ok());
        assert!(check_void_allowed(OrderType::New, &sp).is_ok());

        sp.student_product_label = StudentProductLabel::Created;
        assert!(check_void_allowed(OrderType::New, &sp).is_ok());
    }

    #[test]
    fn void_of_withdrawal_restores_subscription() {
        let mut sp = subscription(day(2025, 4, 1), day(2025, 6, 30));
        sp.student_product_label = StudentProductLabel::WithdrawalScheduled;

        let reversal =
            void_reversal(OrderType::Withdrawal, &sp, Some(day(2025, 12, 31))).unwrap();
        assert_eq!(reversal.product_status, StudentProductStatus::Ordered);
        assert_eq!(
            reversal.student_product_label,
            StudentProductLabel::Created
        );
        assert_eq!(reversal.end_date, Some(day(2025, 12, 31)));
        assert_eq!(reversal.start_date, sp.start_date);
    }

    #[test]
    fn void_of_new_cancels_subscription() {
        let sp = subscription(day(2025, 4, 1), day(2025, 6, 30));
        let reversal = void_reversal(OrderType::New, &sp, None).unwrap();
        assert_eq!(reversal.product_status, StudentProductStatus::Cancelled);
        assert_eq!(reversal.start_date, None);
        assert_eq!(reversal.end_date, None);
    }

    #[test]
    fn void_of_loa_requires_billing_period() {
        let mut sp = subscription(day(2025, 4, 1), day(2025, 6, 30));
        sp.student_product_label = StudentProductLabel::PauseScheduled;
        assert!(void_reversal(OrderType::Loa, &sp, None).is_err());
    }

    #[test]
    fn promotion_targets() {
        assert_eq!(
            promote_scheduled(StudentProductLabel::PauseScheduled),
            Some((StudentProductStatus::Ordered, StudentProductLabel::Paused))
        );
        assert_eq!(
            promote_scheduled(StudentProductLabel::WithdrawalScheduled),
            Some((
                StudentProductStatus::Cancelled,
                StudentProductLabel::Created
            ))
        );
        assert_eq!(
            promote_scheduled(StudentProductLabel::GraduationScheduled),
            Some((
                StudentProductStatus::Cancelled,
                StudentProductLabel::Created
            ))
        );
        assert_eq!(promote_scheduled(StudentProductLabel::Paused), None);
        assert_eq!(promote_scheduled(StudentProductLabel::Created), None);
    }
}
