use std::sync::Arc;
use std::time::Duration;

use rabbitmq_adapter::rabbitmq::{
    ConnectionConfig, ConnectionManager, ConnectionState, LogFailures, MemoryBroker, RabbitMQError,
    DEFAULT_STABLE_AFTER,
};

use crate::support::{config, connected, eventually, harness_with, within};

#[tokio::test]
async fn channel_is_available_from_connect_until_close() {
    let h = connected(3).await;

    for _ in 0..3 {
        let channel = h.manager.get_channel().unwrap();
        assert!(channel.is_open());
        assert_eq!(channel.generation(), 1);
    }
    assert!(h.manager.is_connected());

    h.manager.close().await.unwrap();
    assert!(matches!(
        h.manager.get_channel(),
        Err(RabbitMQError::NotConnected(ConnectionState::Disconnected))
    ));
    assert_eq!(h.broker.open_channels(), 0);
}

#[tokio::test]
async fn failed_connect_is_not_retried() {
    let h = harness_with(config(3));
    h.broker.set_available(false);

    let err = h.manager.connect().await.unwrap_err();

    assert!(matches!(err, RabbitMQError::ConnectionError(_)));
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.broker.connect_attempts(), 1);
    assert!(h.observer.failures().is_empty());
}

#[test]
fn invalid_uri_is_rejected_at_construction() {
    let result = ConnectionManager::new(
        ConnectionConfig::new(""),
        Arc::new(MemoryBroker::new()),
        Arc::new(LogFailures),
    );

    assert!(matches!(result, Err(RabbitMQError::ConfigError(_))));
}

#[tokio::test]
async fn one_outage_triggers_one_reconnect() {
    let h = connected(3).await;

    // closing the connection fires both the connection and the channel watcher
    assert_eq!(h.broker.force_close_connections(), 1);
    let channel = within(h.manager.wait_for_recovery(1)).await.unwrap();

    assert_eq!(channel.generation(), 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.manager.reconnect_attempts_used(), 1);
    assert_eq!(h.manager.generation(), 2);
    assert_eq!(h.broker.connect_attempts(), 2);
    assert_eq!(h.broker.open_connections(), 1);
}

#[tokio::test]
async fn channel_closure_replaces_the_whole_pair() {
    let h = connected(3).await;

    h.broker.force_close_channels();
    within(h.manager.wait_for_recovery(1)).await.unwrap();

    assert_eq!(h.broker.open_connections(), 1);
    assert_eq!(h.broker.open_channels(), 1);
    assert!(h.observer.warnings().is_empty());
}

#[tokio::test]
async fn reconnect_attempts_never_exceed_the_maximum() {
    let h = connected(2).await;
    h.broker.set_available(false);

    h.broker.force_close_connections();
    assert!(eventually(|| !h.observer.failures().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // initial connect plus two reconnect attempts
    assert_eq!(h.broker.connect_attempts(), 3);
    let failures = h.observer.failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0],
        RabbitMQError::ReconnectExhausted { attempts: 2, .. }
    ));
    assert!(failures[0].is_connection_error());
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);

    let err = within(h.manager.wait_for_recovery(1)).await.unwrap_err();
    assert!(matches!(err, RabbitMQError::ReconnectExhausted { .. }));
}

#[tokio::test]
async fn zero_budget_gives_up_immediately() {
    let h = connected(0).await;

    h.broker.force_close_channels();

    assert!(eventually(|| h.observer.failures().len() == 1).await);
    assert_eq!(h.broker.connect_attempts(), 1);
}

#[tokio::test]
async fn explicit_connect_after_exhaustion_starts_a_fresh_budget() {
    let h = connected(1).await;
    h.broker.force_close_channels();
    within(h.manager.wait_for_recovery(1)).await.unwrap();
    h.broker.force_close_channels();
    assert!(eventually(|| h.observer.failures().len() == 1).await);

    h.manager.connect().await.unwrap();

    assert_eq!(h.manager.reconnect_attempts_used(), 0);
    let generation = h.manager.generation();
    h.broker.force_close_channels();
    let channel = within(h.manager.wait_for_recovery(generation)).await.unwrap();
    assert_eq!(channel.generation(), generation + 1);
    assert_eq!(h.observer.failures().len(), 1);
}

#[tokio::test]
async fn stable_connections_earn_their_budget_back() {
    let h = harness_with(config(1).with_stable_after(Duration::ZERO));
    h.manager.connect().await.unwrap();

    for round in 1..=3u64 {
        h.broker.force_close_channels();
        let channel = within(h.manager.wait_for_recovery(round)).await.unwrap();
        assert_eq!(channel.generation(), round + 1);
    }
    assert!(h.observer.failures().is_empty());
}

#[tokio::test(start_paused = true)]
async fn long_lived_connections_get_a_fresh_budget_by_default() {
    let h = connected(1).await;
    assert_eq!(h.manager.config().stable_after, Some(DEFAULT_STABLE_AFTER));

    h.broker.force_close_connections();
    within(h.manager.wait_for_recovery(1)).await.unwrap();
    assert_eq!(h.manager.reconnect_attempts_used(), 1);

    // the replacement connection outlives the stability window
    tokio::time::advance(DEFAULT_STABLE_AFTER).await;
    h.broker.force_close_connections();
    let channel = within(h.manager.wait_for_recovery(2)).await.unwrap();
    assert_eq!(channel.generation(), 3);
    assert_eq!(h.manager.reconnect_attempts_used(), 1);
    assert!(h.observer.failures().is_empty());

    // a young connection does not earn anything back
    h.broker.force_close_connections();
    assert!(eventually(|| h.observer.failures().len() == 1).await);
    assert!(matches!(
        h.observer.failures()[0],
        RabbitMQError::ReconnectExhausted { attempts: 1, .. }
    ));
}

#[tokio::test]
async fn reconnect_waits_between_attempts() {
    let h = harness_with(config(3).with_reconnect_policy(2, Duration::from_millis(100)));
    h.manager.connect().await.unwrap();
    h.broker.set_available(false);

    let started = tokio::time::Instant::now();
    h.broker.force_close_connections();
    assert!(eventually(|| h.observer.failures().len() == 1).await);

    // the first attempt is immediate, the second waits 100ms ±15%
    assert!(started.elapsed() >= Duration::from_millis(85));
    assert_eq!(h.broker.connect_attempts(), 3);
}

#[tokio::test]
async fn close_does_not_trigger_a_reconnect() {
    let h = connected(3).await;

    h.manager.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.broker.connect_attempts(), 1);
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert!(h.observer.failures().is_empty());
    assert!(matches!(
        within(h.manager.wait_for_recovery(1)).await,
        Err(RabbitMQError::NotConnected(ConnectionState::Disconnected))
    ));
}

#[tokio::test]
async fn close_abandons_an_outage_in_progress() {
    let h = harness_with(config(3).with_reconnect_policy(5, Duration::from_millis(200)));
    h.manager.connect().await.unwrap();
    h.broker.set_available(false);
    h.broker.force_close_connections();
    assert!(eventually(|| h.manager.is_reconnecting()).await);

    h.manager.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert!(h.observer.failures().is_empty());
    assert!(h.broker.connect_attempts() <= 3);
}

#[tokio::test]
async fn clones_share_one_connection() {
    let h = connected(3).await;
    let other = h.manager.clone();

    other.connect().await.unwrap();

    assert_eq!(h.broker.open_connections(), 1);
    assert_eq!(
        other.get_channel().unwrap().generation(),
        h.manager.get_channel().unwrap().generation()
    );
}
