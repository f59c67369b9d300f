use std::sync::Arc;
use std::time::Duration;

use sharpline::bankroll::SharedBankroll;
use sharpline::strategy::arbitrage::ArbRejection;
use sharpline::strategy::DetectionRecord;
use sharpline::types::SharplineError;

use crate::mock_source::*;

#[tokio::test(start_paused = true)]
async fn test_consumers_share_one_network_call() {
    let source = Arc::new(MockSource::new(vec![arb_snapshot("e1")]).with_delay(Duration::from_millis(200)));
    let cache = make_cache();
    let bankroll = Arc::new(SharedBankroll::new(5_000.0));
    let a = make_tracker(&cache, source.clone(), bankroll.clone());
    let b = make_tracker(&cache, source.clone(), bankroll);
    assert_eq!(a.cache_key(), b.cache_key());

    tokio::join!(a.refresh(false), b.refresh(false));

    assert_eq!(source.calls(), 1);
    assert_eq!(cache.stats().coalesced, 1);
    for tracker in [&a, &b] {
        let state = tracker.state();
        assert!(!state.loading);
        assert_eq!(state.arbitrage.len(), 1);
        assert_eq!(state.middles.len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_refresh_by_one_consumer_updates_the_other() {
    let source = Arc::new(MockSource::new(vec![arb_snapshot("e1")]));
    let cache = make_cache();
    let bankroll = Arc::new(SharedBankroll::new(5_000.0));
    let a = make_tracker(&cache, source.clone(), bankroll.clone());
    let b = make_tracker(&cache, source.clone(), bankroll);

    a.refresh(false).await;
    let state = b.state();
    assert_eq!(state.arbitrage.len(), 1);
    assert!(state.last_updated.is_some());
    assert_eq!(source.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_keeps_stale_lists() {
    let source = Arc::new(MockSource::new(vec![arb_snapshot("e1")]));
    let cache = make_cache();
    let tracker = make_tracker(&cache, source.clone(), Arc::new(SharedBankroll::new(5_000.0)));

    tracker.refresh(false).await;
    assert_eq!(tracker.state().arbitrage.len(), 1);

    source.set_error(Some(network_error()));
    tokio::time::advance(Duration::from_secs(61)).await;

    // past TTL: served stale at once, revalidation fails in the background
    tracker.refresh(false).await;
    let state = tracker.state();
    assert!(state.stale);
    assert_eq!(state.arbitrage.len(), 1);

    // the background failure reaches the consumer without another refresh
    tokio::time::sleep(Duration::from_secs(1)).await;
    let state = tracker.state();
    assert!(state.stale);
    assert!(matches!(state.error, Some(SharplineError::Network { .. })));
    assert_eq!(state.arbitrage.len(), 1);

    // and stays reported on the next stale read
    tracker.refresh(false).await;
    assert!(matches!(tracker.state().error, Some(SharplineError::Network { .. })));

    // forced: waits for the retries, then falls back to the stale payload
    tracker.refresh(true).await;
    let state = tracker.state();
    assert!(state.stale);
    assert!(matches!(state.error, Some(SharplineError::Network { .. })));
    assert_eq!(state.arbitrage.len(), 1);

    // recovery clears both flags
    source.set_error(None);
    tracker.refresh(true).await;
    let state = tracker.state();
    assert!(!state.stale);
    assert!(state.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failure_without_cache_reports_error() {
    let source = Arc::new(MockSource::new(vec![]));
    source.set_error(Some(network_error()));
    let cache = make_cache();
    let tracker = make_tracker(&cache, source.clone(), Arc::new(SharedBankroll::new(5_000.0)));

    tracker.refresh(false).await;
    let state = tracker.state();
    assert!(!state.loading);
    assert!(state.arbitrage.is_empty());
    assert!(matches!(state.error, Some(SharplineError::Network { .. })));
    // one attempt plus one retry
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_three_way_markets_are_skipped_with_diagnostic() {
    let source = Arc::new(MockSource::new(vec![three_way_snapshot("s1"), arb_snapshot("e1")]));
    let cache = make_cache();
    let tracker = make_tracker(&cache, source, Arc::new(SharedBankroll::new(5_000.0)));

    tracker.refresh(false).await;
    let state = tracker.state();
    assert_eq!(state.events_scanned, 2);
    assert_eq!(state.arbitrage.len(), 1);
    assert!(state.diagnostics.iter().any(|r| matches!(
        r,
        DetectionRecord::ArbRejected {
            reason: ArbRejection::MultiOutcome { outcomes: 3 },
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_new_payload_replaces_lists() {
    let source = Arc::new(MockSource::new(vec![arb_snapshot("e1")]));
    let cache = make_cache();
    let tracker = make_tracker(&cache, source.clone(), Arc::new(SharedBankroll::new(5_000.0)));

    tracker.refresh(false).await;
    let first = tracker.state();
    assert_eq!(first.arbitrage.len(), 1);

    source.set_snapshots(vec![three_way_snapshot("s1")]);
    tracker.refresh(true).await;
    let second = tracker.state();
    assert!(second.arbitrage.is_empty());
    assert!(second.generation > first.generation);
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_bankroll_caps_stakes_end_to_end() {
    let source = Arc::new(MockSource::new(vec![arb_snapshot("e1")]));
    let cache = make_cache();
    let bankroll = Arc::new(SharedBankroll::new(500.0));
    let tracker = make_tracker(&cache, source, bankroll);

    tracker.refresh(false).await;
    let state = tracker.state();
    let arb = &state.arbitrage[0];
    assert!((arb.total_stake - 500.0).abs() < 0.011);
    assert!(arb.legs[0].bookmaker != arb.legs[1].bookmaker);
    // middles are capped at 10% of bankroll
    assert!(state.middles[0].total_stake <= 50.0);
}
