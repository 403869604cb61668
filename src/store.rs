//! sled-backed persistence for ledger records
//!
//! All records live in the default tree, keyed by their bech32 id; the id
//! prefixes (`donation_`, `request_`, `txn_`) double as key namespaces for
//! prefix scans. Multi-record mutations go through a single
//! [`sled::Batch`], which sled applies atomically, also under crash.
use super::inventory::{Donation, RequestNeed};
use super::transaction::DonationTransaction;
use super::utils::TXN_HRP;
use sled::{Batch, Db};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Hands out one mutex per entity id. Approval holds the locks of both
/// parents, acquired in lexicographic id order so conflicting approvals
/// serialize without lock-order inversion; operations on unrelated
/// entities never contend.
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The mutex scoped to a single entity id.
    pub fn entity(&self, id: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(id.to_string()).or_default().clone()
    }

    /// Both parents' mutexes, ordered for acquisition. Lock the first
    /// before the second.
    pub fn pair(&self, a: &str, b: &str) -> (Arc<Mutex<()>>, Arc<Mutex<()>>) {
        if a <= b {
            (self.entity(a), self.entity(b))
        } else {
            (self.entity(b), self.entity(a))
        }
    }
}

pub struct Store {
    db: Arc<Db>,
    locks: LockRegistry,
}

impl Store {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            locks: LockRegistry::new(),
        }
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn fetch_donation(&self, id: &str) -> anyhow::Result<Option<Donation>> {
        match self.db.get(id.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(raw.as_ref())?)),
            None => Ok(None),
        }
    }

    pub fn fetch_request(&self, id: &str) -> anyhow::Result<Option<RequestNeed>> {
        match self.db.get(id.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(raw.as_ref())?)),
            None => Ok(None),
        }
    }

    pub fn fetch_transaction(&self, id: &str) -> anyhow::Result<Option<DonationTransaction>> {
        match self.db.get(id.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(raw.as_ref())?)),
            None => Ok(None),
        }
    }

    pub fn put_donation(&self, donation: &Donation) -> anyhow::Result<()> {
        self.db
            .insert(donation.donation_id.as_bytes(), minicbor::to_vec(donation)?)?;
        Ok(())
    }

    pub fn put_request(&self, request: &RequestNeed) -> anyhow::Result<()> {
        self.db
            .insert(request.request_id.as_bytes(), minicbor::to_vec(request)?)?;
        Ok(())
    }

    pub fn put_transaction(&self, txn: &DonationTransaction) -> anyhow::Result<()> {
        self.db
            .insert(txn.txn_id.as_bytes(), minicbor::to_vec(txn)?)?;
        Ok(())
    }

    /// The approval commit: both parent updates and the transaction flip
    /// land in one atomic batch. This is the hard guarantee of the ledger;
    /// an approved transaction with undecremented quantities (or the
    /// reverse) must be impossible even under crash.
    pub fn commit_approval(
        &self,
        donation: &Donation,
        request: &RequestNeed,
        txn: &DonationTransaction,
    ) -> anyhow::Result<()> {
        let mut batch = Batch::default();
        batch.insert(donation.donation_id.as_bytes(), minicbor::to_vec(donation)?);
        batch.insert(request.request_id.as_bytes(), minicbor::to_vec(request)?);
        batch.insert(txn.txn_id.as_bytes(), minicbor::to_vec(txn)?);
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Entity deletion plus cascade: the record is removed and every
    /// invalidated transaction is rewritten in the same atomic batch.
    pub fn commit_removal(
        &self,
        entity_id: &str,
        invalidated: &[DonationTransaction],
    ) -> anyhow::Result<()> {
        let mut batch = Batch::default();
        batch.remove(entity_id.as_bytes());
        for txn in invalidated {
            batch.insert(txn.txn_id.as_bytes(), minicbor::to_vec(txn)?);
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Every transaction record, in key order.
    pub fn transactions(&self) -> anyhow::Result<Vec<DonationTransaction>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(TXN_HRP.as_bytes()) {
            let (_, raw) = entry?;
            out.push(minicbor::decode(raw.as_ref())?);
        }
        Ok(out)
    }

    pub fn transactions_by_donation(&self, id: &str) -> anyhow::Result<Vec<DonationTransaction>> {
        Ok(self
            .transactions()?
            .into_iter()
            .filter(|t| t.donation_id == id)
            .collect())
    }

    pub fn transactions_by_request(&self, id: &str) -> anyhow::Result<Vec<DonationTransaction>> {
        Ok(self
            .transactions()?
            .into_iter()
            .filter(|t| t.request_id == id)
            .collect())
    }
}
