//! Builds validated allocations from a donation/request pair
use super::error::LedgerError;
use super::inventory::{Category, Donation, RequestNeed};

/// Caller input: one (item ref, quantity) pair to draw from the donation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedLine {
    pub item: String,
    pub quantity: u64,
}

impl RequestedLine {
    pub fn new(item: &str, quantity: u64) -> Self {
        Self {
            item: item.to_string(),
            quantity,
        }
    }
}

/// A validated allocation line, copied verbatim onto the transaction.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct AllocatedLine {
    #[n(0)]
    pub item: String,
    #[n(1)]
    pub quantity: u64,
}

/// A validated, not-yet-persisted proposal of quantities drawn from a
/// donation's supply lines to satisfy a request's demand lines. Only
/// binding once a transaction carrying it is approved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub products: Vec<AllocatedLine>,
    pub meals: Vec<AllocatedLine>,
    pub total_meals: u64,
}

impl Allocation {
    /// Every allocated line, regardless of category.
    pub fn lines(&self) -> impl Iterator<Item = &AllocatedLine> + '_ {
        self.products.iter().chain(self.meals.iter())
    }
}

/// Validate `requested_lines` against both sides' remaining quantities and
/// construct an [`Allocation`]. Pure; no side effects; safe to call
/// repeatedly.
///
/// Each line must name an item present on both the donation's supply lines
/// and the request's demand lines, and its quantity must not exceed the
/// remaining quantity on either side. Prepared-meals allocations are
/// additionally bounded by both sides' remaining meal totals.
pub fn build_allocation(
    donation: &Donation,
    request: &RequestNeed,
    requested_lines: &[RequestedLine],
) -> Result<Allocation, LedgerError> {
    if donation.category != request.category {
        return Err(LedgerError::CategoryMismatch);
    }
    if requested_lines.is_empty() {
        return Err(LedgerError::EmptyAllocation);
    }

    let mut validated = Vec::with_capacity(requested_lines.len());
    for (idx, line) in requested_lines.iter().enumerate() {
        if requested_lines[..idx].iter().any(|l| l.item == line.item) {
            return Err(LedgerError::DuplicateLine {
                item: line.item.clone(),
            });
        }
        if line.quantity == 0 {
            return Err(LedgerError::ZeroQuantity {
                item: line.item.clone(),
            });
        }
        let supply = donation
            .supply_line(&line.item)
            .ok_or_else(|| LedgerError::not_found("donation line", &line.item))?;
        let demand = request
            .demand_line(&line.item)
            .ok_or_else(|| LedgerError::not_found("request line", &line.item))?;
        if line.quantity > supply.remaining.min(demand.remaining) {
            return Err(LedgerError::QuantityExceedsAvailable {
                item: line.item.clone(),
                requested: line.quantity,
                supply: supply.remaining,
                demand: demand.remaining,
            });
        }
        validated.push(AllocatedLine {
            item: line.item.clone(),
            quantity: line.quantity,
        });
    }

    match donation.category {
        Category::PackagedProducts => Ok(Allocation {
            products: validated,
            meals: Vec::new(),
            total_meals: 0,
        }),
        Category::PreparedMeals => {
            // Meals are also bounded by total: the per-meal demand lines are
            // advisory, the running number_of_meals counters are authoritative.
            let total_meals: u64 = validated.iter().map(|l| l.quantity).sum();
            if total_meals > donation.number_of_meals || total_meals > request.number_of_meals {
                return Err(LedgerError::QuantityExceedsAvailable {
                    item: "total_meals".to_string(),
                    requested: total_meals,
                    supply: donation.number_of_meals,
                    demand: request.number_of_meals,
                });
            }
            Ok(Allocation {
                products: Vec::new(),
                meals: validated,
                total_meals,
            })
        }
    }
}

/// "Donate all" / "request all" convenience mode: one line per item present
/// on both sides, at the full remaining quantity that fits both. Runs the
/// same bound checks as [`build_allocation`], which guards against stale
/// client state.
pub fn build_full_allocation(
    donation: &Donation,
    request: &RequestNeed,
) -> Result<Allocation, LedgerError> {
    if donation.category != request.category {
        return Err(LedgerError::CategoryMismatch);
    }

    let mut lines = Vec::new();
    for supply in donation.supply_lines() {
        if let Some(demand) = request.demand_line(&supply.item) {
            let quantity = supply.remaining.min(demand.remaining);
            if quantity > 0 {
                lines.push(RequestedLine {
                    item: supply.item.clone(),
                    quantity,
                });
            }
        }
    }
    if lines.is_empty() {
        return Err(LedgerError::EmptyAllocation);
    }

    build_allocation(donation, request, &lines)
}
