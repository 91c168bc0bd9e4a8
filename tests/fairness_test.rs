//! End-to-end commit/reveal checks: wagers settled during a period can be
//! audited once the period's secret is published, and concurrent wagers on
//! one account never reuse a nonce or overdraw the balance.

use chrono::{Duration, Utc};
use fairstake::{
    common::clock::{Clock, ManualClock},
    fairness::PeriodStatus,
    games::{
        outcome::{hash_secret, verify_wager, CoinSide},
        WagerParams,
    },
    ledger::EntryKind,
    storage::MemoryStorage,
    Casino, CasinoConfig, CasinoError, Points, UserId,
};
use futures::future::join_all;
use std::{collections::HashSet, sync::Arc};

fn casino() -> (Arc<Casino>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let casino = Casino::new(
        CasinoConfig::testing(),
        Arc::new(MemoryStorage::new()),
        clock.clone(),
    )
    .expect("Failed to build casino");
    (Arc::new(casino), clock)
}

fn heads() -> WagerParams {
    WagerParams::Coinflip {
        side: CoinSide::Heads,
    }
}

#[tokio::test]
async fn test_revealed_period_verifies_its_wagers() {
    let (casino, clock) = casino();
    let user = UserId::from("400");
    casino
        .ledger
        .credit(&user, Points::whole(100), EntryKind::Deposit, "tx-1")
        .await
        .unwrap();

    let settled = casino
        .settlement
        .settle(&user, Points::whole(10), heads())
        .await
        .unwrap();
    let number = settled.record.period_number;

    // Before the period ends its secret stays private
    let active = casino.registry.load_period(number).unwrap().unwrap();
    assert!(active.revealed_secret().is_none());
    assert!(active.public().server_secret.is_none());

    clock.advance(Duration::seconds(61));
    let report = casino.registry.sweep(clock.now()).await.unwrap();
    assert_eq!(report.revealed, vec![number]);

    let period = casino.registry.load_period(number).unwrap().unwrap();
    assert_eq!(period.status, PeriodStatus::Revealed);
    let secret = period.revealed_secret().unwrap();
    assert_eq!(hash_secret(secret), settled.record.server_hash);

    let verification = verify_wager(&settled.record, secret);
    assert!(verification.is_valid(), "{:?}", verification.mismatches);

    // A new period took over with a fresh commitment
    let next = casino.registry.get_active_period(clock.now()).unwrap().unwrap();
    assert_eq!(next.number, number + 1);
    assert_ne!(next.server_hash, period.server_hash);
}

#[tokio::test]
async fn test_tampered_record_fails_verification() {
    let (casino, clock) = casino();
    let user = UserId::from("401");
    casino
        .ledger
        .credit(&user, Points::whole(100), EntryKind::Deposit, "tx-1")
        .await
        .unwrap();

    let settled = casino
        .settlement
        .settle(&user, Points::whole(10), heads())
        .await
        .unwrap();
    clock.advance(Duration::seconds(61));
    casino.registry.sweep(clock.now()).await.unwrap();
    let period = casino
        .registry
        .load_period(settled.record.period_number)
        .unwrap()
        .unwrap();
    let secret = period.revealed_secret().unwrap();

    let mut forged = settled.record.clone();
    forged.payout = if forged.payout.is_zero() {
        Points::from_cents(1960)
    } else {
        Points::ZERO
    };
    assert!(!verify_wager(&forged, secret).payout_matches);

    let mut replayed = settled.record.clone();
    replayed.nonce += 1;
    let verification = verify_wager(&replayed, secret);
    assert!(!verification.digest_matches);
    assert!(!verification.is_valid());

    assert!(!verify_wager(&settled.record, "not-the-secret").hash_matches);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_wagers_share_one_balance() {
    let (casino, _clock) = casino();
    let user = UserId::from("402");
    casino
        .ledger
        .credit(&user, Points::whole(50), EntryKind::Deposit, "tx-1")
        .await
        .unwrap();

    let tasks = (0..20).map(|_| {
        let casino = casino.clone();
        let user = user.clone();
        tokio::spawn(async move {
            casino
                .settlement
                .settle(&user, Points::whole(10), heads())
                .await
        })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked"))
        .collect();

    let mut expected = Points::whole(50).cents() as i64;
    let mut nonces = HashSet::new();
    for result in &results {
        match result {
            Ok(settled) => {
                expected += settled.record.payout.cents() as i64 - 1000;
                assert!(nonces.insert(settled.record.nonce), "nonce reused");
            }
            Err(CasinoError::InsufficientFunds { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    let account = casino.ledger.load(&user).unwrap().unwrap();
    assert_eq!(account.balance().cents() as i64, expected);
    assert_eq!(account.nonce as usize, nonces.len());
    assert_eq!(account.games_played as usize, nonces.len());
}
