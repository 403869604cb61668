//! Service layer API for the allocation and transaction workflow
use super::allocation::{self, RequestedLine};
use super::error::LedgerError;
use super::fulfillment;
use super::inventory::{Donation, RequestNeed};
use super::notify::{LogNotifier, Notify, NotifyEvent};
use super::store::Store;
use super::transaction::{DonationTransaction, Initiator, TxnStatus};
use std::sync::Arc;

const DONATION_WITHDRAWN: &str = "donation withdrawn by the donor";
const REQUEST_WITHDRAWN: &str = "request withdrawn by the recipient";

/// Returned by a successful approval: the committed transaction plus fresh
/// snapshots of both parents.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub transaction: DonationTransaction,
    pub donation: Donation,
    pub request: RequestNeed,
}

pub struct LedgerService {
    store: Store,
    notifier: Box<dyn Notify>,
}

impl LedgerService {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self::with_notifier(instance, Box::new(LogNotifier))
    }

    pub fn with_notifier(instance: Arc<sled::Db>, notifier: Box<dyn Notify>) -> Self {
        Self {
            store: Store::new(instance),
            notifier,
        }
    }

    /// Persist a donor's new donation.
    pub fn publish_donation(&self, donation: Donation) -> anyhow::Result<Donation> {
        self.store.put_donation(&donation)?;
        Ok(donation)
    }

    /// Persist a recipient's new request.
    pub fn publish_request(&self, request: RequestNeed) -> anyhow::Result<RequestNeed> {
        self.store.put_request(&request)?;
        Ok(request)
    }

    /// Create a pending transaction carrying a validated allocation.
    ///
    /// The initiating side is derived from the acting user: the donation's
    /// owner offers, the request's owner asks; anyone else is turned away.
    /// Reservation is optimistic -- the parents' remaining quantities are
    /// untouched until approval, and the bound checks here are re-run then
    /// against current state.
    pub fn create_transaction(
        &self,
        donation_id: &str,
        request_id: &str,
        requested_lines: &[RequestedLine],
        acting_user: &str,
    ) -> anyhow::Result<DonationTransaction> {
        let donation = self
            .store
            .fetch_donation(donation_id)?
            .ok_or_else(|| LedgerError::not_found("donation", donation_id))?;
        let request = self
            .store
            .fetch_request(request_id)?
            .ok_or_else(|| LedgerError::not_found("request", request_id))?;
        let initiated_by = initiator_for(&donation, &request, acting_user)?;

        let alloc = allocation::build_allocation(&donation, &request, requested_lines)?;
        let txn = DonationTransaction::new(&donation, &request, alloc, initiated_by)?;
        self.store.put_transaction(&txn)?;

        let message = match initiated_by {
            Initiator::Donor => format!(
                "A donation toward your request \"{}\" is awaiting your response.",
                request.title
            ),
            Initiator::Recipient => format!(
                "A request against your donation \"{}\" is awaiting your response.",
                donation.title
            ),
        };
        self.emit(acting_user, txn.counterpart_of(acting_user), message);

        Ok(txn)
    }

    /// "Donate all" / "request all": a pending transaction over every item
    /// both sides still have open, at the full quantity that fits both.
    pub fn create_full_transaction(
        &self,
        donation_id: &str,
        request_id: &str,
        acting_user: &str,
    ) -> anyhow::Result<DonationTransaction> {
        let donation = self
            .store
            .fetch_donation(donation_id)?
            .ok_or_else(|| LedgerError::not_found("donation", donation_id))?;
        let request = self
            .store
            .fetch_request(request_id)?
            .ok_or_else(|| LedgerError::not_found("request", request_id))?;
        let initiated_by = initiator_for(&donation, &request, acting_user)?;

        let alloc = allocation::build_full_allocation(&donation, &request)?;
        let txn = DonationTransaction::new(&donation, &request, alloc, initiated_by)?;
        self.store.put_transaction(&txn)?;

        let message = match initiated_by {
            Initiator::Donor => format!(
                "A donation toward your request \"{}\" is awaiting your response.",
                request.title
            ),
            Initiator::Recipient => format!(
                "A request against your donation \"{}\" is awaiting your response.",
                donation.title
            ),
        };
        self.emit(acting_user, txn.counterpart_of(acting_user), message);

        Ok(txn)
    }

    /// Approve a pending transaction: re-validate the allocation against
    /// the parents' current remaining quantities, then commit the quantity
    /// decrements, the recomputed fulfillment statuses, and the status flip
    /// as one atomic batch.
    ///
    /// A stale allocation fails the whole approval with `AllocationStale`
    /// and commits nothing; the transaction stays pending.
    pub fn approve_transaction(
        &self,
        txn_id: &str,
        acting_user: &str,
    ) -> anyhow::Result<ApprovalOutcome> {
        let txn = self
            .store
            .fetch_transaction(txn_id)?
            .ok_or_else(|| LedgerError::not_found("transaction", txn_id))?;
        txn.ensure_pending()?;
        txn.authorize_response(acting_user)?;

        let outcome = {
            let (first, second) = self.store.locks().pair(&txn.donation_id, &txn.request_id);
            let _first = first.lock().unwrap_or_else(|e| e.into_inner());
            let _second = second.lock().unwrap_or_else(|e| e.into_inner());

            // Reload under the locks; a concurrent approval, rejection, or
            // owner delete may have won the race since the checks above.
            let mut txn = self
                .store
                .fetch_transaction(txn_id)?
                .ok_or_else(|| LedgerError::not_found("transaction", txn_id))?;
            txn.ensure_pending()?;
            let mut donation = self
                .store
                .fetch_donation(&txn.donation_id)?
                .ok_or_else(|| LedgerError::not_found("donation", &txn.donation_id))?;
            let mut request = self
                .store
                .fetch_request(&txn.request_id)?
                .ok_or_else(|| LedgerError::not_found("request", &txn.request_id))?;

            let alloc = txn.allocation();
            donation.check_supply(&alloc)?;
            request.check_demand(&alloc)?;

            donation.commit_supply(&alloc);
            request.commit_demand(&alloc);
            donation.status = fulfillment::donation_status(&donation);
            request.status = fulfillment::request_status(&request);
            txn.mark_approved()?;

            self.store.commit_approval(&donation, &request, &txn)?;

            ApprovalOutcome {
                transaction: txn,
                donation,
                request,
            }
        };

        self.emit(
            acting_user,
            outcome.transaction.counterpart_of(acting_user),
            format!(
                "Your transaction linking \"{}\" and \"{}\" was accepted.",
                outcome.donation.title, outcome.request.title
            ),
        );

        Ok(outcome)
    }

    /// Reject a pending transaction with a reason. Nothing was ever
    /// reserved, so no quantities change.
    pub fn reject_transaction(
        &self,
        txn_id: &str,
        reason: &str,
        acting_user: &str,
    ) -> anyhow::Result<DonationTransaction> {
        let txn = self
            .store
            .fetch_transaction(txn_id)?
            .ok_or_else(|| LedgerError::not_found("transaction", txn_id))?;
        txn.ensure_pending()?;
        txn.authorize_response(acting_user)?;

        let txn = {
            let (first, second) = self.store.locks().pair(&txn.donation_id, &txn.request_id);
            let _first = first.lock().unwrap_or_else(|e| e.into_inner());
            let _second = second.lock().unwrap_or_else(|e| e.into_inner());

            let mut txn = self
                .store
                .fetch_transaction(txn_id)?
                .ok_or_else(|| LedgerError::not_found("transaction", txn_id))?;
            txn.ensure_pending()?;
            txn.mark_rejected(reason)?;
            self.store.put_transaction(&txn)?;
            txn
        };

        self.emit(
            acting_user,
            txn.counterpart_of(acting_user),
            format!("Your transaction {} was rejected: {}", txn.txn_id, reason),
        );

        Ok(txn)
    }

    /// Owner-only delete. Every outstanding pending transaction against
    /// the donation is invalidated in the same atomic batch; terminal
    /// transactions are retained as audit history.
    pub fn delete_donation(&self, donation_id: &str, acting_user: &str) -> anyhow::Result<()> {
        let donation = self
            .store
            .fetch_donation(donation_id)?
            .ok_or_else(|| LedgerError::not_found("donation", donation_id))?;
        if acting_user != donation.donor_id {
            return Err(LedgerError::unauthorized(acting_user).into());
        }

        let (title, invalidated) = {
            let lock = self.store.locks().entity(donation_id);
            let _hold = lock.lock().unwrap_or_else(|e| e.into_inner());

            // The record may already be gone if a concurrent delete won.
            let donation = self
                .store
                .fetch_donation(donation_id)?
                .ok_or_else(|| LedgerError::not_found("donation", donation_id))?;
            let mut invalidated = Vec::new();
            for mut txn in self.store.transactions_by_donation(donation_id)? {
                if txn.status == TxnStatus::Pending {
                    txn.mark_rejected(DONATION_WITHDRAWN)?;
                    invalidated.push(txn);
                }
            }
            self.store.commit_removal(donation_id, &invalidated)?;
            (donation.title, invalidated)
        };

        for txn in &invalidated {
            log::info!(
                "invalidated pending transaction {} after donation {} was deleted",
                txn.txn_id,
                donation_id
            );
            self.emit(
                acting_user,
                txn.counterpart_of(acting_user),
                format!(
                    "Donation \"{}\" was withdrawn; your pending transaction {} was cancelled.",
                    title, txn.txn_id
                ),
            );
        }

        Ok(())
    }

    /// Mirror of [`Self::delete_donation`] for the demand side.
    pub fn delete_request(&self, request_id: &str, acting_user: &str) -> anyhow::Result<()> {
        let request = self
            .store
            .fetch_request(request_id)?
            .ok_or_else(|| LedgerError::not_found("request", request_id))?;
        if acting_user != request.recipient_id {
            return Err(LedgerError::unauthorized(acting_user).into());
        }

        let (title, invalidated) = {
            let lock = self.store.locks().entity(request_id);
            let _hold = lock.lock().unwrap_or_else(|e| e.into_inner());

            let request = self
                .store
                .fetch_request(request_id)?
                .ok_or_else(|| LedgerError::not_found("request", request_id))?;
            let mut invalidated = Vec::new();
            for mut txn in self.store.transactions_by_request(request_id)? {
                if txn.status == TxnStatus::Pending {
                    txn.mark_rejected(REQUEST_WITHDRAWN)?;
                    invalidated.push(txn);
                }
            }
            self.store.commit_removal(request_id, &invalidated)?;
            (request.title, invalidated)
        };

        for txn in &invalidated {
            log::info!(
                "invalidated pending transaction {} after request {} was deleted",
                txn.txn_id,
                request_id
            );
            self.emit(
                acting_user,
                txn.counterpart_of(acting_user),
                format!(
                    "Request \"{}\" was withdrawn; your pending transaction {} was cancelled.",
                    title, txn.txn_id
                ),
            );
        }

        Ok(())
    }

    pub fn transaction(&self, txn_id: &str) -> anyhow::Result<DonationTransaction> {
        Ok(self
            .store
            .fetch_transaction(txn_id)?
            .ok_or_else(|| LedgerError::not_found("transaction", txn_id))?)
    }

    pub fn donation(&self, donation_id: &str) -> anyhow::Result<Donation> {
        Ok(self
            .store
            .fetch_donation(donation_id)?
            .ok_or_else(|| LedgerError::not_found("donation", donation_id))?)
    }

    pub fn request(&self, request_id: &str) -> anyhow::Result<RequestNeed> {
        Ok(self
            .store
            .fetch_request(request_id)?
            .ok_or_else(|| LedgerError::not_found("request", request_id))?)
    }

    pub fn transactions_by_donation(&self, id: &str) -> anyhow::Result<Vec<DonationTransaction>> {
        self.store.transactions_by_donation(id)
    }

    pub fn transactions_by_request(&self, id: &str) -> anyhow::Result<Vec<DonationTransaction>> {
        self.store.transactions_by_request(id)
    }

    pub fn transactions_by_donor(&self, donor_id: &str) -> anyhow::Result<Vec<DonationTransaction>> {
        Ok(self
            .store
            .transactions()?
            .into_iter()
            .filter(|t| t.donor_id == donor_id)
            .collect())
    }

    pub fn transactions_by_recipient(
        &self,
        recipient_id: &str,
    ) -> anyhow::Result<Vec<DonationTransaction>> {
        Ok(self
            .store
            .transactions()?
            .into_iter()
            .filter(|t| t.recipient_id == recipient_id)
            .collect())
    }

    pub fn transactions_by_status(
        &self,
        status: TxnStatus,
    ) -> anyhow::Result<Vec<DonationTransaction>> {
        Ok(self
            .store
            .transactions()?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    // Delivery failures are logged and dropped; they are not part of the
    // ledger's correctness contract.
    fn emit(&self, sender: &str, receiver: &str, message: String) {
        let event = NotifyEvent {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            message,
        };
        if let Err(err) = self.notifier.notify(&event) {
            log::warn!("notification to {} was not delivered: {err:#}", event.receiver);
        }
    }
}

fn initiator_for(
    donation: &Donation,
    request: &RequestNeed,
    acting_user: &str,
) -> Result<Initiator, LedgerError> {
    if acting_user == donation.donor_id {
        Ok(Initiator::Donor)
    } else if acting_user == request.recipient_id {
        Ok(Initiator::Recipient)
    } else {
        Err(LedgerError::unauthorized(acting_user))
    }
}
