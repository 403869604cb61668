//! The transaction record linking one donation and one request
use super::allocation::{AllocatedLine, Allocation};
use super::error::{LedgerError, MAX_REASON_LEN};
use super::inventory::{Donation, RequestNeed, TimeStamp};
use super::utils::{self, TXN_HRP};
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

impl TxnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnStatus::Pending => "pending",
            TxnStatus::Approved => "approved",
            TxnStatus::Rejected => "rejected",
        }
    }
}

/// Which party created the transaction. Only the counterpart may drive it
/// to a terminal state.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    #[n(0)]
    Donor,
    #[n(1)]
    Recipient,
}

/// The persisted unit of work. The allocation it carries is a snapshot
/// request, binding only once committed; until then the parents' remaining
/// quantities are untouched and overlapping pending transactions may
/// coexist.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DonationTransaction {
    #[n(0)]
    pub txn_id: String,
    #[n(1)]
    pub donation_id: String,
    #[n(2)]
    pub request_id: String,
    #[n(3)]
    pub donor_id: String,
    #[n(4)]
    pub recipient_id: String,
    #[n(5)]
    pub initiated_by: Initiator,
    #[n(6)]
    pub allocated_products: Vec<AllocatedLine>,
    #[n(7)]
    pub allocated_meals: Vec<AllocatedLine>,
    #[n(8)]
    pub total_meals: u64,
    #[n(9)]
    pub status: TxnStatus,
    #[n(10)]
    pub rejection_reason: Option<String>,
    #[n(11)]
    pub allocation_digest: Option<String>,
    #[n(12)]
    pub created_at: TimeStamp<Utc>,
    #[n(13)]
    pub response_date: Option<TimeStamp<Utc>>,
}

impl DonationTransaction {
    pub fn new(
        donation: &Donation,
        request: &RequestNeed,
        allocation: Allocation,
        initiated_by: Initiator,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            txn_id: utils::mint_id(TXN_HRP)?,
            donation_id: donation.donation_id.clone(),
            request_id: request.request_id.clone(),
            donor_id: donation.donor_id.clone(),
            recipient_id: request.recipient_id.clone(),
            initiated_by,
            allocated_products: allocation.products,
            allocated_meals: allocation.meals,
            total_meals: allocation.total_meals,
            status: TxnStatus::Pending,
            rejection_reason: None,
            allocation_digest: None,
            created_at: TimeStamp::new(),
            response_date: None,
        })
    }

    /// The stored lines as an [`Allocation`] view, for re-validation and
    /// commit against the live parents.
    pub fn allocation(&self) -> Allocation {
        Allocation {
            products: self.allocated_products.clone(),
            meals: self.allocated_meals.clone(),
            total_meals: self.total_meals,
        }
    }

    pub fn ensure_pending(&self) -> Result<(), LedgerError> {
        if self.status != TxnStatus::Pending {
            return Err(LedgerError::InvalidState {
                id: self.txn_id.clone(),
                status: self.status.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Only the party that did *not* initiate the transaction may approve
    /// or reject it.
    pub fn authorize_response(&self, acting_user: &str) -> Result<(), LedgerError> {
        let counterpart = match self.initiated_by {
            Initiator::Donor => &self.recipient_id,
            Initiator::Recipient => &self.donor_id,
        };
        if acting_user != counterpart {
            return Err(LedgerError::unauthorized(acting_user));
        }
        Ok(())
    }

    /// The other party relative to `user`, used to address notifications.
    pub fn counterpart_of(&self, user: &str) -> &str {
        if user == self.donor_id {
            &self.recipient_id
        } else {
            &self.donor_id
        }
    }

    /// Integrity fingerprint of the allocation lines: sha256 over their
    /// CBOR encoding. Recomputable later to verify the audit trail.
    pub fn compute_digest(&self) -> anyhow::Result<String> {
        let mut lines = self.allocated_products.clone();
        lines.extend(self.allocated_meals.iter().cloned());
        let cbor = minicbor::to_vec(&lines)?;
        Ok(sha256::digest(&cbor))
    }

    /// Flip to `Approved`, stamping the audit fields. The caller persists
    /// this record in the same atomic batch as the parent updates.
    pub fn mark_approved(&mut self) -> anyhow::Result<()> {
        self.status = TxnStatus::Approved;
        self.response_date = Some(TimeStamp::new());
        self.allocation_digest = Some(self.compute_digest()?);
        Ok(())
    }

    /// Flip to `Rejected` with a reason. No quantities were ever reserved,
    /// so nothing else changes.
    pub fn mark_rejected(&mut self, reason: &str) -> Result<(), LedgerError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LedgerError::MissingReason);
        }
        if reason.chars().count() > MAX_REASON_LEN {
            return Err(LedgerError::ReasonTooLong);
        }
        self.status = TxnStatus::Rejected;
        self.rejection_reason = Some(reason.to_string());
        self.response_date = Some(TimeStamp::new());
        Ok(())
    }
}
