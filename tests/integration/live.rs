// Requires a running RabbitMQ; SRV_RMQ_URI selects it.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use rabbitmq_adapter::env::Settings;
use rabbitmq_adapter::rabbitmq::{
    ConnectionManager, Consumer, ConsumerConfig, ExchangeKind, ExchangeSpec, LogFailures, Message,
    Producer, ProducerConfig, QueueSpec, BindSpec, TopologyDeclarator,
};

use crate::support::{forwarding_handler, next_body};

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn lapin_round_trip() {
    let settings = Settings::load().expect("SRV_RMQ_URI must point at a broker");
    let manager =
        ConnectionManager::with_lapin(settings.connection_config(), Arc::new(LogFailures)).unwrap();
    manager.connect().await.unwrap();

    let errors = TopologyDeclarator::new(manager.clone())
        .declare_all(
            &[QueueSpec::new("rabbitmq_adapter.it")
                .auto_delete(true)
                .bind(BindSpec::new("rabbitmq_adapter.events", "it.#"))],
            &[ExchangeSpec::new("rabbitmq_adapter.events", ExchangeKind::Topic).auto_delete(true)],
        )
        .await;
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");

    let (handler, mut bodies) = forwarding_handler();
    let subscription = Consumer::new(manager.clone())
        .consume(&ConsumerConfig::new("rabbitmq_adapter.it"), handler)
        .await
        .unwrap();

    Producer::new(manager.clone())
        .publish(
            &CancellationToken::new(),
            &ProducerConfig::new("rabbitmq_adapter.events", "it.ping"),
            &Message::new(b"ping".to_vec()),
        )
        .await
        .unwrap();

    assert_eq!(next_body(&mut bodies).await, b"ping");
    subscription.stop().await.unwrap();
    manager.close().await.unwrap();
}
