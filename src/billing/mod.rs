//! Billing math and server-side price verification.
//!
//! Every monetary figure a client submits is recomputed here from catalog
//! data and compared at two-decimal precision. A mismatch rejects the order
//! before anything is persisted.

use tonic::Status;

use crate::domain::{BillingType, Discount, DiscountAmountType, Tax, TaxCategory};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BillingError {
    #[error("incorrect price for product {product_id}: expected {expected:.2}, got {got:.2}")]
    PriceMismatch {
        product_id: String,
        expected: f64,
        got: f64,
    },

    #[error("incorrect discount amount for product {product_id}: expected {expected:.2}, got {got:.2}")]
    DiscountMismatch {
        product_id: String,
        expected: f64,
        got: f64,
    },

    #[error("incorrect tax amount for product {product_id}: expected {expected:.2}, got {got:.2}")]
    TaxMismatch {
        product_id: String,
        expected: f64,
        got: f64,
    },

    #[error("incorrect final price for product {product_id}: expected {expected:.2}, got {got:.2}")]
    FinalPriceMismatch {
        product_id: String,
        expected: f64,
        got: f64,
    },

    #[error("incorrect adjustment price for product {product_id}: expected {expected:.2}, got {got:.2}")]
    AdjustmentMismatch {
        product_id: String,
        expected: f64,
        got: f64,
    },

    #[error("billing item for product {product_id} carries a discount the order does not")]
    UnexpectedDiscount { product_id: String },

    #[error("billing item for product {product_id} is missing its tax entry")]
    MissingTax { product_id: String },
}

impl From<BillingError> for Status {
    fn from(err: BillingError) -> Self {
        Status::failed_precondition(err.to_string())
    }
}

/// Two-decimal money comparison. Prices travel as doubles, so compare their
/// rounded textual forms rather than raw bit patterns.
pub fn money_eq(a: f64, b: f64) -> bool {
    format!("{a:.2}") == format!("{b:.2}")
}

/// Prorate a full-period price by the billing ratio `numerator/denominator`.
pub fn prorated_price(price: f64, numerator: i32, denominator: i32) -> f64 {
    price * f64::from(numerator) / f64::from(denominator)
}

/// Expected base price for a period, prorated when a billing ratio applies.
pub fn expected_price(base: f64, ratio: Option<(i32, i32)>) -> f64 {
    match ratio {
        Some((n, d)) => prorated_price(base, n, d),
        None => base,
    }
}

/// Monetary value of a discount against the given price.
pub fn discount_amount(discount: &Discount, price: f64) -> f64 {
    match discount.discount_amount_type {
        DiscountAmountType::Percentage => price * discount.discount_amount_value / 100.0,
        DiscountAmountType::Fixed => discount.discount_amount_value,
    }
}

/// Tax on the final (post-discount) price. Inclusive tax is carved out of the
/// price, exclusive tax is added on top.
pub fn tax_amount(category: TaxCategory, percentage: f64, taxable: f64) -> f64 {
    match category {
        TaxCategory::Inclusive => taxable * percentage / (100.0 + percentage),
        TaxCategory::Exclusive => taxable * percentage / 100.0,
    }
}

pub fn final_price(price: f64, discount: f64) -> f64 {
    price - discount
}

/// Adjustment charged when an existing billed period is re-priced: the delta
/// between the new charge and what was already billed, prorated over the
/// remainder of the period. Cancel-like orders pass a new charge of zero,
/// producing a negative adjustment (a refund).
pub fn adjustment_price(new_charge: f64, billed_final: f64, ratio: Option<(i32, i32)>) -> f64 {
    expected_price(new_charge - billed_final, ratio)
}

/// A billing line carrying an adjustment is an adjustment billing; everything
/// else is billed at order time.
pub fn billing_type_for(adjustment: Option<f64>) -> BillingType {
    if adjustment.is_some() {
        BillingType::AdjustmentBilling
    } else {
        BillingType::BilledAtOrder
    }
}

/// Monetary fields of a billing line as submitted by the client.
#[derive(Debug, Clone)]
pub struct SubmittedCharge {
    pub product_id: String,
    pub price: f64,
    pub discount_amount: Option<f64>,
    pub tax_amount: Option<f64>,
    pub final_price: f64,
    pub adjustment_price: Option<f64>,
}

/// Catalog-derived inputs the server recomputes a billing line from.
#[derive(Debug, Clone, Default)]
pub struct ExpectedCharge<'a> {
    pub base_price: f64,
    pub ratio: Option<(i32, i32)>,
    pub discount: Option<&'a Discount>,
    pub tax: Option<&'a Tax>,
    /// Final price previously billed for the same period, when this line
    /// adjusts an earlier bill.
    pub billed_final: Option<f64>,
}

/// Recompute a billing line from catalog data and reject any field that does
/// not match what the client submitted.
pub fn verify_charge(
    submitted: &SubmittedCharge,
    expected: &ExpectedCharge<'_>,
) -> Result<(), BillingError> {
    let product_id = submitted.product_id.clone();

    // An adjustment line re-bills a period at its full new charge; the ratio
    // scales the delta below, not the price.
    let want_price = if submitted.adjustment_price.is_some() {
        expected.base_price
    } else {
        expected_price(expected.base_price, expected.ratio)
    };
    if !money_eq(want_price, submitted.price) {
        return Err(BillingError::PriceMismatch {
            product_id,
            expected: want_price,
            got: submitted.price,
        });
    }

    let want_discount = match (expected.discount, submitted.discount_amount) {
        (Some(discount), Some(got)) => {
            let want = discount_amount(discount, want_price);
            if !money_eq(want, got) {
                return Err(BillingError::DiscountMismatch {
                    product_id,
                    expected: want,
                    got,
                });
            }
            want
        }
        (None, Some(_)) => {
            return Err(BillingError::UnexpectedDiscount { product_id });
        }
        (Some(discount), None) => discount_amount(discount, want_price),
        (None, None) => 0.0,
    };

    let want_final = final_price(want_price, want_discount);
    if !money_eq(want_final, submitted.final_price) {
        return Err(BillingError::FinalPriceMismatch {
            product_id,
            expected: want_final,
            got: submitted.final_price,
        });
    }

    if let Some(tax) = expected.tax {
        let got = submitted
            .tax_amount
            .ok_or_else(|| BillingError::MissingTax {
                product_id: product_id.clone(),
            })?;
        let want = tax_amount(tax.tax_category, tax.tax_percentage, want_final);
        if !money_eq(want, got) {
            return Err(BillingError::TaxMismatch {
                product_id,
                expected: want,
                got,
            });
        }
    }

    if let Some(got) = submitted.adjustment_price {
        let billed = expected.billed_final.unwrap_or(0.0);
        let want = adjustment_price(want_final, billed, expected.ratio);
        if !money_eq(want, got) {
            return Err(BillingError::AdjustmentMismatch {
                product_id,
                expected: want,
                got,
            });
        }
    }

    Ok(())
}
