#![allow(unused_imports)]

use anyhow::Context;
use donation_ledger::{
    allocation::RequestedLine,
    error::LedgerError,
    inventory::{Donation, FulfillStatus, RequestNeed},
    notify::{Notify, NotifyEvent},
    service::LedgerService,
    transaction::TxnStatus,
    utils,
};
use sled::open;
use std::sync::Arc;

use tempfile::tempdir; // Use for test db cleanup.

#[test]
fn offer_and_approve_products() -> anyhow::Result<()> {
    // Sled uses file-based locking to prevent concurrent access, so only one test
    // can hold the lock at a time. As is good practice in testing create separate
    // databases for each test. The db is created on temp for simplified cleanup.
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("test_offer_and_approve.db");
    let db = open(db_path)?;
    let db = Arc::new(db);

    // reset the db for each test run
    db.clear()?;

    let service = LedgerService::new(db);

    let donor = utils::mint_id("user_")?;
    let recipient = utils::mint_id("user_")?;
    let product_a = utils::mint_id("product_")?;
    let product_b = utils::mint_id("product_")?;

    let donation = service.publish_donation(Donation::new_packaged(
        &donor,
        "Pantry surplus",
        &[(product_a.clone(), 5), (product_b.clone(), 3)],
    )?)?;
    let request = service.publish_request(RequestNeed::new_packaged(
        &recipient,
        "Shelter restock",
        &[(product_a.clone(), 5), (product_b.clone(), 3)],
    )?)?;

    let txn = service
        .create_full_transaction(&donation.donation_id, &request.request_id, &recipient)
        .context("Transaction failed on create: ")?;

    assert_eq!(txn.status, TxnStatus::Pending);

    // the counterpart (the donor) accepts the recipient's request

    let outcome = service
        .approve_transaction(&txn.txn_id, &donor)
        .context("Transaction failed on approval: ")?;

    assert_eq!(outcome.transaction.status, TxnStatus::Approved);
    assert!(outcome.transaction.allocation_digest.is_some());
    assert!(outcome.transaction.response_date.is_some());
    assert_eq!(outcome.donation.status, FulfillStatus::Fulfilled);
    assert_eq!(outcome.request.status, FulfillStatus::Fulfilled);
    assert!(outcome.donation.products.iter().all(|l| l.remaining == 0));
    assert!(outcome.request.products.iter().all(|l| l.remaining == 0));

    Ok(())
}

#[test]
fn partial_allocation_leaves_donation_partially_fulfilled() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("test_partial_allocation.db");
    let db = open(db_path)?;
    let db = Arc::new(db);

    db.clear()?;

    let service = LedgerService::new(db);

    let donor = utils::mint_id("user_")?;
    let recipient = utils::mint_id("user_")?;
    let product_a = utils::mint_id("product_")?;
    let product_b = utils::mint_id("product_")?;

    let donation = service.publish_donation(Donation::new_packaged(
        &donor,
        "Pantry surplus",
        &[(product_a.clone(), 5), (product_b.clone(), 3)],
    )?)?;
    let request = service.publish_request(RequestNeed::new_packaged(
        &recipient,
        "Shelter restock",
        &[(product_a.clone(), 5), (product_b.clone(), 3)],
    )?)?;

    // only the first line is allocated
    let txn = service.create_transaction(
        &donation.donation_id,
        &request.request_id,
        &[RequestedLine::new(&product_a, 5)],
        &recipient,
    )?;
    let outcome = service.approve_transaction(&txn.txn_id, &donor)?;

    assert_eq!(outcome.donation.status, FulfillStatus::PartiallyFulfilled);
    assert_eq!(outcome.request.status, FulfillStatus::PartiallyFulfilled);
    assert_eq!(outcome.donation.supply_line(&product_b).unwrap().remaining, 3);

    // a second transaction over what is left completes both sides
    let txn = service.create_full_transaction(&donation.donation_id, &request.request_id, &recipient)?;
    let outcome = service.approve_transaction(&txn.txn_id, &donor)?;

    assert_eq!(outcome.donation.status, FulfillStatus::Fulfilled);
    assert_eq!(outcome.request.status, FulfillStatus::Fulfilled);

    Ok(())
}

#[test]
fn prepared_meals_full_cycle() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("test_prepared_meals.db");
    let db = open(db_path)?;
    let db = Arc::new(db);

    db.clear()?;

    let service = LedgerService::new(db);

    let donor = utils::mint_id("user_")?;
    let recipient = utils::mint_id("user_")?;
    let meal = utils::mint_id("meal_")?;

    let donation = service.publish_donation(Donation::new_prepared(
        &donor,
        "Evening meals",
        &[(meal.clone(), 10)],
    )?)?;
    let request = service.publish_request(RequestNeed::new_prepared(
        &recipient,
        "Soup kitchen",
        &[(meal.clone(), 10)],
    )?)?;

    assert_eq!(donation.number_of_meals, 10);
    assert_eq!(request.number_of_meals, 10);

    let txn = service.create_full_transaction(&donation.donation_id, &request.request_id, &recipient)?;
    assert_eq!(txn.total_meals, 10);
    assert_eq!(txn.status, TxnStatus::Pending);

    let outcome = service.approve_transaction(&txn.txn_id, &donor)?;

    assert_eq!(outcome.transaction.status, TxnStatus::Approved);
    assert_eq!(outcome.donation.number_of_meals, 0);
    assert_eq!(outcome.request.number_of_meals, 0);
    assert_eq!(outcome.donation.status, FulfillStatus::Fulfilled);
    assert_eq!(outcome.request.status, FulfillStatus::Fulfilled);

    Ok(())
}

#[test]
fn reject_requires_a_reason_and_leaves_quantities_alone() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("test_reject_path.db");
    let db = open(db_path)?;
    let db = Arc::new(db);

    db.clear()?;

    let service = LedgerService::new(db);

    let donor = utils::mint_id("user_")?;
    let recipient = utils::mint_id("user_")?;
    let product = utils::mint_id("product_")?;

    let donation = service.publish_donation(Donation::new_packaged(
        &donor,
        "Pantry surplus",
        &[(product.clone(), 5)],
    )?)?;
    let request = service.publish_request(RequestNeed::new_packaged(
        &recipient,
        "Shelter restock",
        &[(product.clone(), 5)],
    )?)?;

    let txn = service.create_full_transaction(&donation.donation_id, &request.request_id, &recipient)?;

    let err = service
        .reject_transaction(&txn.txn_id, "   ", &donor)
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<LedgerError>(),
        Some(&LedgerError::MissingReason)
    );

    let rejected = service.reject_transaction(&txn.txn_id, "out of stock", &donor)?;
    assert_eq!(rejected.status, TxnStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("out of stock"));

    // nothing was ever reserved
    let donation = service.donation(&donation.donation_id)?;
    let request = service.request(&request.request_id)?;
    assert_eq!(donation.supply_line(&product).unwrap().remaining, 5);
    assert_eq!(request.demand_line(&product).unwrap().remaining, 5);
    assert_eq!(donation.status, FulfillStatus::Open);
    assert_eq!(request.status, FulfillStatus::Open);

    Ok(())
}

#[test]
fn second_conflicting_approval_is_stale() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("test_stale_approval.db");
    let db = open(db_path)?;
    let db = Arc::new(db);

    db.clear()?;

    let service = LedgerService::new(db);

    let donor = utils::mint_id("user_")?;
    let recipient = utils::mint_id("user_")?;
    let product = utils::mint_id("product_")?;

    let donation = service.publish_donation(Donation::new_packaged(
        &donor,
        "Pantry surplus",
        &[(product.clone(), 6)],
    )?)?;
    let request = service.publish_request(RequestNeed::new_packaged(
        &recipient,
        "Shelter restock",
        &[(product.clone(), 6)],
    )?)?;

    // two overlapping pending transactions, each wanting more than half
    let lines = [RequestedLine::new(&product, 4)];
    let t1 = service.create_transaction(&donation.donation_id, &request.request_id, &lines, &recipient)?;
    let t2 = service.create_transaction(&donation.donation_id, &request.request_id, &lines, &recipient)?;

    service.approve_transaction(&t1.txn_id, &donor)?;

    let err = service.approve_transaction(&t2.txn_id, &donor).unwrap_err();
    assert_eq!(
        err.downcast_ref::<LedgerError>(),
        Some(&LedgerError::AllocationStale {
            item: product.clone(),
            requested: 4,
            remaining: 2,
        })
    );

    // the loser stays pending and nothing was committed for it
    assert_eq!(service.transaction(&t2.txn_id)?.status, TxnStatus::Pending);
    let donation = service.donation(&donation.donation_id)?;
    assert_eq!(donation.supply_line(&product).unwrap().remaining, 2);

    Ok(())
}

#[test]
fn concurrent_conflicting_approvals_have_one_winner() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("test_concurrent_approval.db");
    let db = open(db_path)?;
    let db = Arc::new(db);

    db.clear()?;

    let service = LedgerService::new(db);

    let donor = utils::mint_id("user_")?;
    let recipient = utils::mint_id("user_")?;
    let product = utils::mint_id("product_")?;

    let donation = service.publish_donation(Donation::new_packaged(
        &donor,
        "Pantry surplus",
        &[(product.clone(), 6)],
    )?)?;
    let request = service.publish_request(RequestNeed::new_packaged(
        &recipient,
        "Shelter restock",
        &[(product.clone(), 6)],
    )?)?;

    let lines = [RequestedLine::new(&product, 4)];
    let t1 = service.create_transaction(&donation.donation_id, &request.request_id, &lines, &recipient)?;
    let t2 = service.create_transaction(&donation.donation_id, &request.request_id, &lines, &recipient)?;

    let outcomes = std::thread::scope(|scope| {
        let h1 = scope.spawn(|| service.approve_transaction(&t1.txn_id, &donor).is_ok());
        let h2 = scope.spawn(|| service.approve_transaction(&t2.txn_id, &donor).is_ok());
        [h1.join().unwrap(), h2.join().unwrap()]
    });

    assert_eq!(outcomes.iter().filter(|won| **won).count(), 1);

    let donation = service.donation(&donation.donation_id)?;
    let request = service.request(&request.request_id)?;
    assert_eq!(donation.supply_line(&product).unwrap().remaining, 2);
    assert_eq!(request.demand_line(&product).unwrap().remaining, 2);

    Ok(())
}

#[test]
fn terminal_transactions_never_change_again() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("test_terminal_state.db");
    let db = open(db_path)?;
    let db = Arc::new(db);

    db.clear()?;

    let service = LedgerService::new(db);

    let donor = utils::mint_id("user_")?;
    let recipient = utils::mint_id("user_")?;
    let product = utils::mint_id("product_")?;

    let donation = service.publish_donation(Donation::new_packaged(
        &donor,
        "Pantry surplus",
        &[(product.clone(), 5)],
    )?)?;
    let request = service.publish_request(RequestNeed::new_packaged(
        &recipient,
        "Shelter restock",
        &[(product.clone(), 5)],
    )?)?;

    let txn = service.create_transaction(
        &donation.donation_id,
        &request.request_id,
        &[RequestedLine::new(&product, 2)],
        &recipient,
    )?;
    service.approve_transaction(&txn.txn_id, &donor)?;

    // a second approval must fail and must not decrement a second time
    let err = service.approve_transaction(&txn.txn_id, &donor).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::InvalidState { .. })
    ));

    let err = service
        .reject_transaction(&txn.txn_id, "changed my mind", &donor)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::InvalidState { .. })
    ));

    let donation = service.donation(&donation.donation_id)?;
    assert_eq!(donation.supply_line(&product).unwrap().remaining, 3);

    Ok(())
}

#[test]
fn deleting_a_donation_invalidates_pending_transactions() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("test_delete_cascade.db");
    let db = open(db_path)?;
    let db = Arc::new(db);

    db.clear()?;

    let service = LedgerService::new(db);

    let donor = utils::mint_id("user_")?;
    let recipient = utils::mint_id("user_")?;
    let product = utils::mint_id("product_")?;

    let donation = service.publish_donation(Donation::new_packaged(
        &donor,
        "Pantry surplus",
        &[(product.clone(), 5)],
    )?)?;
    let request = service.publish_request(RequestNeed::new_packaged(
        &recipient,
        "Shelter restock",
        &[(product.clone(), 5)],
    )?)?;

    let txn = service.create_full_transaction(&donation.donation_id, &request.request_id, &recipient)?;

    // only the owner may delete
    let err = service
        .delete_donation(&donation.donation_id, &recipient)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::Unauthorized { .. })
    ));

    service.delete_donation(&donation.donation_id, &donor)?;

    let err = service.donation(&donation.donation_id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::NotFound { .. })
    ));

    let txn = service.transaction(&txn.txn_id)?;
    assert_eq!(txn.status, TxnStatus::Rejected);
    assert_eq!(
        txn.rejection_reason.as_deref(),
        Some("donation withdrawn by the donor")
    );

    // the request side is untouched
    let request = service.request(&request.request_id)?;
    assert_eq!(request.demand_line(&product).unwrap().remaining, 5);

    Ok(())
}

#[test]
fn only_the_counterpart_may_respond() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("test_authorization.db");
    let db = open(db_path)?;
    let db = Arc::new(db);

    db.clear()?;

    let service = LedgerService::new(db);

    let donor = utils::mint_id("user_")?;
    let recipient = utils::mint_id("user_")?;
    let stranger = utils::mint_id("user_")?;
    let product = utils::mint_id("product_")?;

    let donation = service.publish_donation(Donation::new_packaged(
        &donor,
        "Pantry surplus",
        &[(product.clone(), 5)],
    )?)?;
    let request = service.publish_request(RequestNeed::new_packaged(
        &recipient,
        "Shelter restock",
        &[(product.clone(), 5)],
    )?)?;

    // a stranger may not create a transaction between the two
    let err = service
        .create_full_transaction(&donation.donation_id, &request.request_id, &stranger)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::Unauthorized { .. })
    ));

    let txn = service.create_full_transaction(&donation.donation_id, &request.request_id, &recipient)?;

    // the initiator may not accept their own request
    let err = service.approve_transaction(&txn.txn_id, &recipient).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::Unauthorized { .. })
    ));

    // the counterpart may
    let outcome = service.approve_transaction(&txn.txn_id, &donor)?;
    assert_eq!(outcome.transaction.status, TxnStatus::Approved);

    Ok(())
}

struct FailingNotifier;

impl Notify for FailingNotifier {
    fn notify(&self, _event: &NotifyEvent) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("notification channel is down"))
    }
}

#[test]
fn notification_failures_never_fail_the_ledger() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("test_notify_failure.db");
    let db = open(db_path)?;
    let db = Arc::new(db);

    db.clear()?;

    let service = LedgerService::with_notifier(db, Box::new(FailingNotifier));

    let donor = utils::mint_id("user_")?;
    let recipient = utils::mint_id("user_")?;
    let product = utils::mint_id("product_")?;

    let donation = service.publish_donation(Donation::new_packaged(
        &donor,
        "Pantry surplus",
        &[(product.clone(), 5)],
    )?)?;
    let request = service.publish_request(RequestNeed::new_packaged(
        &recipient,
        "Shelter restock",
        &[(product.clone(), 5)],
    )?)?;

    let txn = service.create_full_transaction(&donation.donation_id, &request.request_id, &recipient)?;
    let outcome = service.approve_transaction(&txn.txn_id, &donor)?;

    assert_eq!(outcome.transaction.status, TxnStatus::Approved);

    Ok(())
}
