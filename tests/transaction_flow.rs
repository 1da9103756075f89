//! End-to-end transaction behavior over a live database.

mod common;

use common::{account, entry, node, Account, Entry};
use gridstore::{Error, Filter, PersistenceMode, SortOrder};
use std::time::Duration;

#[test]
fn test_crud_round_trip() {
    let n = node(PersistenceMode::None);
    n.db.start().unwrap();

    let mut tx = n.db.transaction(0);
    for (owner, balance) in [("ava", 300), ("bo", 100), ("cy", 200)] {
        let mut a = account(owner, balance);
        tx.insert(&mut a).unwrap();
    }
    assert!(tx.commit().unwrap());

    let tx = n.db.transaction(0);
    let richest: Vec<Account> = tx
        .find(None, &[SortOrder::desc("balance")], 0)
        .unwrap();
    let owners: Vec<&str> = richest.iter().map(|a| a.owner.as_str()).collect();
    assert_eq!(owners, vec!["ava", "cy", "bo"]);

    let mut bo: Account = tx.find_one(&Filter::eq("owner", "bo")).unwrap().unwrap();
    bo.balance = 150;
    std::thread::sleep(Duration::from_millis(5));
    let mut tx = n.db.transaction(0);
    tx.update(&bo).unwrap();
    tx.delete_matching::<Account>(Filter::eq("owner", "cy")).unwrap();
    tx.commit().unwrap();

    let tx = n.db.transaction(0);
    assert_eq!(tx.count::<Account>(None).unwrap(), 2);
    let bo: Account = tx.get(bo.meta.id.unwrap()).unwrap().unwrap();
    assert_eq!(bo.balance, 150);
    assert!(bo.meta.modified_at.unwrap() > bo.meta.created_at.unwrap());
}

#[test]
fn test_stale_commit_applies_nothing() {
    let n = node(PersistenceMode::None);
    n.db.start().unwrap();

    let mut tx = n.db.transaction(0);
    let mut a = account("ava", 100);
    let mut b = account("bo", 200);
    tx.insert(&mut a).unwrap();
    tx.insert(&mut b).unwrap();
    tx.commit().unwrap();
    std::thread::sleep(Duration::from_millis(5));

    let reader = n.db.transaction(0);
    let mut stale_b: Account = reader.get(b.meta.id.unwrap()).unwrap().unwrap();

    // Someone else touches B first.
    let mut other = n.db.transaction(0);
    let mut fresh_b: Account = other.get(b.meta.id.unwrap()).unwrap().unwrap();
    fresh_b.balance = 201;
    other.update(&fresh_b).unwrap();
    other.commit().unwrap();

    // A transaction mixing a clean update of A with a stale optimistic
    // update of B is abandoned whole.
    let mut tx = n.db.transaction(0);
    let mut fresh_a: Account = tx.get(a.meta.id.unwrap()).unwrap().unwrap();
    fresh_a.balance = 999;
    tx.update(&fresh_a).unwrap();
    stale_b.balance = 500;
    tx.update_optimistic(&stale_b).unwrap();
    assert!(matches!(tx.commit(), Err(Error::Stale { .. })));

    let tx = n.db.transaction(0);
    let a_after: Account = tx.get(a.meta.id.unwrap()).unwrap().unwrap();
    let b_after: Account = tx.get(b.meta.id.unwrap()).unwrap().unwrap();
    assert_eq!(a_after.balance, 100);
    assert_eq!(b_after.balance, 201);
}

#[test]
fn test_cascade_delete_removes_dependents() {
    let n = node(PersistenceMode::None);
    n.db.start().unwrap();

    let mut tx = n.db.transaction(0);
    let mut a = account("ava", 100);
    tx.insert(&mut a).unwrap();
    let account_id = a.meta.id.unwrap();
    for amount in [10, -5, 20] {
        let mut e = entry(account_id, amount);
        tx.insert(&mut e).unwrap();
    }
    tx.commit().unwrap();

    let mut tx = n.db.transaction(0);
    let stored: Account = tx.get(account_id).unwrap().unwrap();
    tx.delete_with_dependents(&stored).unwrap();
    tx.commit().unwrap();

    let tx = n.db.transaction(0);
    assert_eq!(tx.count::<Account>(None).unwrap(), 0);
    assert_eq!(tx.count::<Entry>(None).unwrap(), 0);
}

#[test]
fn test_in_place_update_bypasses_staleness() {
    let n = node(PersistenceMode::None);
    n.db.start().unwrap();

    let mut tx = n.db.transaction(0);
    let mut a = account("ava", 100);
    tx.insert(&mut a).unwrap();
    tx.commit().unwrap();
    let id = a.meta.id.unwrap();

    // Two concurrent increments, both through the in-place path.
    for _ in 0..2 {
        let mut tx = n.db.transaction(0);
        tx.update_in_place::<Account, _>(id, |account| {
            account.balance += 25;
            Ok(())
        })
        .unwrap();
        tx.commit().unwrap();
    }

    let tx = n.db.transaction(0);
    let stored: Account = tx.get(id).unwrap().unwrap();
    assert_eq!(stored.balance, 150);
}

#[test]
fn test_sibling_transaction_shares_datastore() {
    let n = node(PersistenceMode::None);
    n.db.start().unwrap();

    let mut tx = n.db.transaction(0);
    let mut a = account("ava", 100);
    tx.insert(&mut a).unwrap();
    tx.commit().unwrap();

    let outer = n.db.transaction(0);
    let mut sibling = outer.transaction(0);
    let mut stored: Account = sibling.get(a.meta.id.unwrap()).unwrap().unwrap();
    stored.balance = 42;
    sibling.update(&stored).unwrap();
    sibling.commit().unwrap();

    let after: Account = outer.get(a.meta.id.unwrap()).unwrap().unwrap();
    assert_eq!(after.balance, 42);
}
