//! Derives fulfillment status from remaining quantities
use super::inventory::{Category, Donation, FulfillStatus, LineQty, RequestNeed};

/// Status of a donation given its current counters. Pure and idempotent;
/// the service calls this inside the commit path before the batch is built.
pub fn donation_status(donation: &Donation) -> FulfillStatus {
    match donation.category {
        Category::PackagedProducts => lines_status(&donation.products),
        Category::PreparedMeals => {
            totals_status(donation.number_of_meals, donation.original_meals)
        }
    }
}

/// Status of a request given its current counters.
pub fn request_status(request: &RequestNeed) -> FulfillStatus {
    match request.category {
        Category::PackagedProducts => lines_status(&request.products),
        Category::PreparedMeals => totals_status(request.number_of_meals, request.original_meals),
    }
}

fn lines_status(lines: &[LineQty]) -> FulfillStatus {
    if lines.is_empty() {
        return FulfillStatus::Open;
    }
    if lines.iter().all(|l| l.remaining == 0) {
        return FulfillStatus::Fulfilled;
    }
    if lines.iter().any(|l| l.remaining < l.original) {
        return FulfillStatus::PartiallyFulfilled;
    }
    FulfillStatus::Open
}

fn totals_status(remaining: u64, original: u64) -> FulfillStatus {
    if original > 0 && remaining == 0 {
        FulfillStatus::Fulfilled
    } else if remaining < original {
        FulfillStatus::PartiallyFulfilled
    } else {
        FulfillStatus::Open
    }
}
