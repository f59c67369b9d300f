use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use sharpline::bankroll::SharedBankroll;
use sharpline::engine::{HostStatus, PollingConfig, PollingState, SimulatedHost};
use sharpline::types::SharplineError;

use crate::mock_source::*;

fn make_polling(interval_secs: u64, continuous: bool) -> PollingConfig {
    PollingConfig {
        interval: Duration::from_secs(interval_secs),
        continuous,
        refresh_on_start: true,
    }
}

#[tokio::test(start_paused = true)]
async fn test_polling_refreshes_through_the_cache() {
    let source = Arc::new(MockSource::new(vec![arb_snapshot("e1")]));
    let cache = make_cache();
    let tracker = make_tracker(&cache, source.clone(), Arc::new(SharedBankroll::new(5_000.0)));
    let host = Arc::new(SimulatedHost::new(HostStatus::default()));

    // 30s interval against a 60s TTL: every other tick hits the network
    assert!(tracker.start_polling(host, make_polling(30, false)));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(source.calls(), 1);
    assert_eq!(tracker.state().arbitrage.len(), 1);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(source.calls(), 2);
    assert_eq!(tracker.polling_state(), PollingState::Polling);

    tracker.stop_polling();
    assert_eq!(tracker.polling_state(), PollingState::Idle);
    sleep(Duration::from_secs(300)).await;
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_polling_reports_dead_feed_while_serving_stale() {
    let source = Arc::new(MockSource::new(vec![arb_snapshot("e1")]));
    let cache = make_cache();
    let tracker = make_tracker(&cache, source.clone(), Arc::new(SharedBankroll::new(5_000.0)));
    let host = Arc::new(SimulatedHost::new(HostStatus::default()));

    tracker.start_polling(host, make_polling(30, false));
    sleep(Duration::from_secs(1)).await;
    assert!(tracker.state().error.is_none());

    source.set_error(Some(network_error()));
    // well inside the 600s staleness bound
    sleep(Duration::from_secs(120)).await;
    let state = tracker.state();
    assert!(state.stale);
    assert!(matches!(state.error, Some(SharplineError::Network { .. })));
    assert_eq!(state.arbitrage.len(), 1);

    source.set_error(None);
    sleep(Duration::from_secs(60)).await;
    let state = tracker.state();
    assert!(!state.stale);
    assert!(state.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_hidden_host_pauses_until_visible() {
    let source = Arc::new(MockSource::new(vec![arb_snapshot("e1")]));
    let cache = make_cache();
    let tracker = make_tracker(&cache, source.clone(), Arc::new(SharedBankroll::new(5_000.0)));
    let host = Arc::new(SimulatedHost::new(HostStatus {
        visible: false,
        online: true,
    }));

    tracker.start_polling(host.clone(), make_polling(30, false));
    sleep(Duration::from_secs(120)).await;
    assert_eq!(source.calls(), 0);
    assert_eq!(tracker.polling_state(), PollingState::Paused);

    // the resume refresh is forced, so it reaches the network
    host.set_visible(true);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(source.calls(), 1);
    assert_eq!(tracker.state().arbitrage.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_offline_pauses_continuous_feed() {
    let source = Arc::new(MockSource::new(vec![arb_snapshot("e1")]));
    let cache = make_cache();
    let tracker = make_tracker(&cache, source.clone(), Arc::new(SharedBankroll::new(5_000.0)));
    let host = Arc::new(SimulatedHost::new(HostStatus {
        visible: false,
        online: true,
    }));

    // continuous feeds keep going while hidden
    tracker.start_polling(host.clone(), make_polling(30, true));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(source.calls(), 1);

    host.set_online(false);
    sleep(Duration::from_secs(300)).await;
    assert_eq!(source.calls(), 1);
    assert_eq!(tracker.polling_state(), PollingState::Paused);

    host.set_online(true);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_polling_and_publishing() {
    let source = Arc::new(MockSource::new(vec![arb_snapshot("e1")]).with_delay(Duration::from_secs(5)));
    let cache = make_cache();
    let tracker = make_tracker(&cache, source.clone(), Arc::new(SharedBankroll::new(5_000.0)));
    let host = Arc::new(SimulatedHost::new(HostStatus::default()));

    tracker.start_polling(host, make_polling(30, false));
    sleep(Duration::from_secs(1)).await;
    tracker.shutdown();

    sleep(Duration::from_secs(120)).await;
    let state = tracker.state();
    assert_eq!(state.generation, 0);
    assert!(state.arbitrage.is_empty());
    assert_eq!(tracker.polling_state(), PollingState::Idle);
}
