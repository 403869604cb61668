//! Core donation and request inventory records
use super::allocation::Allocation;
use super::error::LedgerError;
use super::utils::{self, DONATION_HRP, REQUEST_HRP};
use chrono::{DateTime, TimeZone, Utc};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    #[n(0)]
    PackagedProducts,
    #[n(1)]
    PreparedMeals,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillStatus {
    #[n(0)]
    Open,
    #[n(1)]
    PartiallyFulfilled,
    #[n(2)]
    Fulfilled,
}

/// One supply or demand line. `remaining` is the live counter the
/// approval commit decrements; `original` never changes after creation.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LineQty {
    #[n(0)]
    pub item: String,
    #[n(1)]
    pub original: u64,
    #[n(2)]
    pub remaining: u64,
}

impl LineQty {
    pub fn new(item: &str, quantity: u64) -> Self {
        Self {
            item: item.to_string(),
            original: quantity,
            remaining: quantity,
        }
    }
}

/// A donor's offered inventory. `products` is populated for
/// `PackagedProducts`, `meals` plus the meal totals for `PreparedMeals`.
///
/// Invariant: `sum(meals[].remaining) == number_of_meals` at all times.
/// Quantities are mutated only by the approval commit path, under the
/// entity lock held by the service.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Donation {
    #[n(0)]
    pub donation_id: String,
    #[n(1)]
    pub donor_id: String,
    #[n(2)]
    pub title: String,
    #[n(3)]
    pub category: Category,
    #[n(4)]
    pub products: Vec<LineQty>,
    #[n(5)]
    pub meals: Vec<LineQty>,
    #[n(6)]
    pub number_of_meals: u64,
    #[n(7)]
    pub original_meals: u64,
    #[n(8)]
    pub status: FulfillStatus,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
}

/// A recipient's requested inventory. Mirror of [`Donation`] representing
/// demand rather than supply.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct RequestNeed {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    pub recipient_id: String,
    #[n(2)]
    pub title: String,
    #[n(3)]
    pub category: Category,
    #[n(4)]
    pub products: Vec<LineQty>,
    #[n(5)]
    pub meals: Vec<LineQty>,
    #[n(6)]
    pub number_of_meals: u64,
    #[n(7)]
    pub original_meals: u64,
    #[n(8)]
    pub status: FulfillStatus,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

fn line_sum(lines: &[LineQty]) -> u64 {
    lines.iter().map(|l| l.remaining).sum()
}

impl Donation {
    /// A packaged-products donation; one line per (product ref, quantity).
    pub fn new_packaged(donor_id: &str, title: &str, lines: &[(String, u64)]) -> anyhow::Result<Self> {
        Ok(Self {
            donation_id: utils::mint_id(DONATION_HRP)?,
            donor_id: donor_id.to_string(),
            title: title.to_string(),
            category: Category::PackagedProducts,
            products: lines.iter().map(|(item, q)| LineQty::new(item, *q)).collect(),
            meals: Vec::new(),
            number_of_meals: 0,
            original_meals: 0,
            status: FulfillStatus::Open,
            created_at: TimeStamp::new(),
        })
    }

    /// A prepared-meals donation; the meal totals start as the sum of the
    /// per-meal lines.
    pub fn new_prepared(donor_id: &str, title: &str, lines: &[(String, u64)]) -> anyhow::Result<Self> {
        let meals: Vec<LineQty> = lines.iter().map(|(item, q)| LineQty::new(item, *q)).collect();
        let total = line_sum(&meals);
        Ok(Self {
            donation_id: utils::mint_id(DONATION_HRP)?,
            donor_id: donor_id.to_string(),
            title: title.to_string(),
            category: Category::PreparedMeals,
            products: Vec::new(),
            meals,
            number_of_meals: total,
            original_meals: total,
            status: FulfillStatus::Open,
            created_at: TimeStamp::new(),
        })
    }

    pub fn supply_line(&self, item: &str) -> Option<&LineQty> {
        self.supply_lines().iter().find(|l| l.item == item)
    }

    /// The lines this donation offers, per its category.
    pub fn supply_lines(&self) -> &[LineQty] {
        match self.category {
            Category::PackagedProducts => &self.products,
            Category::PreparedMeals => &self.meals,
        }
    }

    /// Phase one of the commit: every allocated line must still fit the
    /// *current* remaining supply. Run under the entity lock so the second
    /// of two conflicting approvals observes the first's committed state.
    pub fn check_supply(&self, alloc: &Allocation) -> Result<(), LedgerError> {
        for line in alloc.lines() {
            let supply = self
                .supply_line(&line.item)
                .ok_or_else(|| LedgerError::not_found("donation line", &line.item))?;
            if line.quantity > supply.remaining {
                return Err(LedgerError::AllocationStale {
                    item: line.item.clone(),
                    requested: line.quantity,
                    remaining: supply.remaining,
                });
            }
        }
        if self.category == Category::PreparedMeals && alloc.total_meals > self.number_of_meals {
            return Err(LedgerError::AllocationStale {
                item: self.donation_id.clone(),
                requested: alloc.total_meals,
                remaining: self.number_of_meals,
            });
        }
        Ok(())
    }

    /// Phase two of the commit. Only valid after `check_supply` succeeded
    /// under the entity lock; remaining counters never underflow.
    pub fn commit_supply(&mut self, alloc: &Allocation) {
        for line in alloc.lines() {
            let lines = match self.category {
                Category::PackagedProducts => &mut self.products,
                Category::PreparedMeals => &mut self.meals,
            };
            if let Some(supply) = lines.iter_mut().find(|l| l.item == line.item) {
                supply.remaining = supply.remaining.saturating_sub(line.quantity);
            }
        }
        if self.category == Category::PreparedMeals {
            self.number_of_meals = self.number_of_meals.saturating_sub(alloc.total_meals);
        }
    }
}

impl RequestNeed {
    /// A packaged-products request; one line per (product ref, quantity).
    pub fn new_packaged(
        recipient_id: &str,
        title: &str,
        lines: &[(String, u64)],
    ) -> anyhow::Result<Self> {
        Ok(Self {
            request_id: utils::mint_id(REQUEST_HRP)?,
            recipient_id: recipient_id.to_string(),
            title: title.to_string(),
            category: Category::PackagedProducts,
            products: lines.iter().map(|(item, q)| LineQty::new(item, *q)).collect(),
            meals: Vec::new(),
            number_of_meals: 0,
            original_meals: 0,
            status: FulfillStatus::Open,
            created_at: TimeStamp::new(),
        })
    }

    /// A prepared-meals request.
    pub fn new_prepared(
        recipient_id: &str,
        title: &str,
        lines: &[(String, u64)],
    ) -> anyhow::Result<Self> {
        let meals: Vec<LineQty> = lines.iter().map(|(item, q)| LineQty::new(item, *q)).collect();
        let total = line_sum(&meals);
        Ok(Self {
            request_id: utils::mint_id(REQUEST_HRP)?,
            recipient_id: recipient_id.to_string(),
            title: title.to_string(),
            category: Category::PreparedMeals,
            products: Vec::new(),
            meals,
            number_of_meals: total,
            original_meals: total,
            status: FulfillStatus::Open,
            created_at: TimeStamp::new(),
        })
    }

    pub fn demand_line(&self, item: &str) -> Option<&LineQty> {
        self.demand_lines().iter().find(|l| l.item == item)
    }

    /// The lines this request asks for, per its category.
    pub fn demand_lines(&self) -> &[LineQty] {
        match self.category {
            Category::PackagedProducts => &self.products,
            Category::PreparedMeals => &self.meals,
        }
    }

    /// Counterpart of [`Donation::check_supply`] for the demand side.
    pub fn check_demand(&self, alloc: &Allocation) -> Result<(), LedgerError> {
        for line in alloc.lines() {
            let demand = self
                .demand_line(&line.item)
                .ok_or_else(|| LedgerError::not_found("request line", &line.item))?;
            if line.quantity > demand.remaining {
                return Err(LedgerError::AllocationStale {
                    item: line.item.clone(),
                    requested: line.quantity,
                    remaining: demand.remaining,
                });
            }
        }
        if self.category == Category::PreparedMeals && alloc.total_meals > self.number_of_meals {
            return Err(LedgerError::AllocationStale {
                item: self.request_id.clone(),
                requested: alloc.total_meals,
                remaining: self.number_of_meals,
            });
        }
        Ok(())
    }

    /// Counterpart of [`Donation::commit_supply`] for the demand side.
    pub fn commit_demand(&mut self, alloc: &Allocation) {
        for line in alloc.lines() {
            let lines = match self.category {
                Category::PackagedProducts => &mut self.products,
                Category::PreparedMeals => &mut self.meals,
            };
            if let Some(demand) = lines.iter_mut().find(|l| l.item == line.item) {
                demand.remaining = demand.remaining.saturating_sub(line.quantity);
            }
        }
        if self.category == Category::PreparedMeals {
            self.number_of_meals = self.number_of_meals.saturating_sub(alloc.total_meals);
        }
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
