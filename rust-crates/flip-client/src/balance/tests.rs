#![allow(non_snake_case)]

use super::*;
use crate::{
    address::AddressStyle,
    rpc::RpcError,
    testing::{
        FakeLedger,
        ManualClock,
    },
};

const RAW: &str = "0:83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8";

fn cache(
    ledger: &FakeLedger,
    clock: &ManualClock,
) -> BalanceCache<FakeLedger, InMemoryBalanceStore, ManualClock> {
    BalanceCache::new(
        Arc::new(ledger.clone()),
        InMemoryBalanceStore::new(),
        clock.clone(),
    )
}

fn exhausted() -> RpcError {
    RpcError::Exhausted {
        attempts: 5,
        last_error: "HTTP 503".to_string(),
    }
}

#[tokio::test]
async fn get_balance__second_read_within_window_skips_the_ledger() {
    // given
    let ledger = FakeLedger::new();
    ledger.push_balance(Ok(Coins::from_nanos(7)));
    let clock = ManualClock::at(1_000);
    let sut = cache(&ledger, &clock);
    let first = sut.get_balance(RAW, BalanceKind::Contract).await;

    // when
    clock.advance(59_999);
    let second = sut.get_balance(RAW, BalanceKind::Contract).await;

    // then
    assert_eq!(first, Coins::from_nanos(7));
    assert_eq!(second, Coins::from_nanos(7));
    assert_eq!(ledger.balance_calls(), 1);
}

#[tokio::test]
async fn get_balance__wallet_window_is_shorter_than_contract_window() {
    // given
    let ledger = FakeLedger::new();
    ledger.push_balance(Ok(Coins::from_nanos(1)));
    ledger.push_balance(Ok(Coins::from_nanos(2)));
    let clock = ManualClock::at(0);
    let sut = cache(&ledger, &clock);
    sut.get_balance(RAW, BalanceKind::Wallet).await;

    // when
    clock.advance(5_000);
    let refreshed = sut.get_balance(RAW, BalanceKind::Wallet).await;

    // then
    assert_eq!(refreshed, Coins::from_nanos(2));
    assert_eq!(ledger.balance_calls(), 2);
}

#[tokio::test]
async fn get_balance__failed_refresh_returns_stale_value() {
    // given
    let ledger = FakeLedger::new();
    ledger.push_balance(Ok(Coins::from_nanos(42)));
    ledger.push_balance(Err(exhausted()));
    let clock = ManualClock::at(0);
    let sut = cache(&ledger, &clock);
    sut.get_balance(RAW, BalanceKind::Contract).await;

    // when
    clock.advance(60_000);
    let balance = sut.get_balance(RAW, BalanceKind::Contract).await;

    // then
    assert_eq!(balance, Coins::from_nanos(42));
    assert_eq!(ledger.balance_calls(), 2);
    assert_eq!(sut.cached(RAW).map(|r| r.fetched_at_ms), Some(0));
}

#[tokio::test]
async fn get_balance__failure_without_cache_returns_fallback() {
    // given
    let ledger = FakeLedger::new();
    ledger.push_balance(Err(exhausted()));
    let clock = ManualClock::at(0);
    let sut = cache(&ledger, &clock).with_fallback(Coins::from_nanos(99));

    // when
    let balance = sut.get_balance(RAW, BalanceKind::Wallet).await;

    // then
    assert_eq!(balance, Coins::from_nanos(99));
}

#[tokio::test]
async fn get_balance__unparsable_address_gets_fallback_without_fetching() {
    // given
    let ledger = FakeLedger::new();
    let clock = ManualClock::at(0);
    let sut = cache(&ledger, &clock);

    // when
    let balance = sut.get_balance("not an address", BalanceKind::Wallet).await;

    // then
    assert_eq!(balance, Coins::ZERO);
    assert_eq!(ledger.balance_calls(), 0);
}

#[tokio::test]
async fn get_balance__different_spellings_share_one_entry() {
    // given
    let ledger = FakeLedger::new();
    ledger.push_balance(Ok(Coins::from_nanos(5)));
    let clock = ManualClock::at(0);
    let sut = cache(&ledger, &clock);
    let friendly = Address::parse(RAW)
        .unwrap()
        .format(AddressStyle::MAINNET_BOUNCEABLE);
    sut.get_balance(&friendly, BalanceKind::Contract).await;

    // when
    let balance = sut.get_balance(&RAW.to_uppercase(), BalanceKind::Contract).await;

    // then
    assert_eq!(balance, Coins::from_nanos(5));
    assert_eq!(ledger.balance_calls(), 1);
}

#[tokio::test]
async fn clear__forces_next_read_to_fetch() {
    // given
    let ledger = FakeLedger::new();
    ledger.push_balance(Ok(Coins::from_nanos(1)));
    ledger.push_balance(Ok(Coins::from_nanos(3)));
    let clock = ManualClock::at(0);
    let sut = cache(&ledger, &clock);
    sut.get_balance(RAW, BalanceKind::Contract).await;

    // when
    sut.clear().unwrap();
    let balance = sut.get_balance(RAW, BalanceKind::Contract).await;

    // then
    assert_eq!(balance, Coins::from_nanos(3));
    assert!(sut.cached(RAW).is_some());
}
