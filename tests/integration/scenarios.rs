use tokio_util::sync::CancellationToken;

use rabbitmq_adapter::rabbitmq::{
    BindSpec, ConnectionState, Consumer, ConsumerConfig, ExchangeKind, ExchangeSpec, Message,
    Producer, ProducerConfig, QueueSpec, RabbitMQError, TopologyDeclarator,
};

use crate::support::{connected, eventually, forwarding_handler, next_body, nothing_more, within};

#[tokio::test]
async fn orders_flow_end_to_end() {
    let h = connected(2).await;

    let errors = TopologyDeclarator::new(h.manager.clone())
        .declare_all(
            &[QueueSpec::new("orders.created").bind(BindSpec::new("orders", "created"))],
            &[ExchangeSpec::new("orders", ExchangeKind::Topic)],
        )
        .await;
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");

    let (handler, mut bodies) = forwarding_handler();
    let _subscription = Consumer::new(h.manager.clone())
        .consume(&ConsumerConfig::new("orders.created"), handler)
        .await
        .unwrap();

    let body = br#"{"order_id":"o-1001","total":59.99}"#.to_vec();
    Producer::new(h.manager.clone())
        .publish(
            &CancellationToken::new(),
            &ProducerConfig::new("orders", "created"),
            &Message::new(body.clone()).with_content_type("application/json"),
        )
        .await
        .unwrap();

    assert_eq!(next_body(&mut bodies).await, body);
    assert!(nothing_more(&mut bodies).await);
    assert_eq!(h.broker.message_count("orders.created"), Some(0));
}

#[tokio::test]
async fn supervised_consumer_survives_two_outages_then_reports_exhaustion() {
    let h = connected(2).await;
    TopologyDeclarator::new(h.manager.clone())
        .declare_queue(&QueueSpec::new("orders.created").durable(true))
        .await
        .unwrap();
    let producer = Producer::new(h.manager.clone());
    let publish = |body: &'static str| {
        let producer = producer.clone();
        async move {
            producer
                .publish(
                    &CancellationToken::new(),
                    &ProducerConfig::new("", "orders.created"),
                    &Message::new(body.as_bytes().to_vec()),
                )
                .await
        }
    };

    let (handler, mut bodies) = forwarding_handler();
    let handle = Consumer::new(h.manager.clone())
        .start_consumer(ConsumerConfig::new("orders.created"), handler)
        .await
        .unwrap();

    // first outage: exactly one resubscribe, delivery resumes
    h.broker.force_close_channels();
    assert!(eventually(|| handle.resubscribe_count() == 1).await);
    publish("after-first").await.unwrap();
    assert_eq!(next_body(&mut bodies).await, b"after-first");
    assert_eq!(handle.resubscribe_count(), 1);

    // second outage uses the last reconnect attempt
    h.broker.force_close_channels();
    assert!(eventually(|| handle.resubscribe_count() == 2).await);
    publish("after-second").await.unwrap();
    assert_eq!(next_body(&mut bodies).await, b"after-second");
    assert!(h.observer.failures().is_empty());

    // third outage exhausts the budget
    h.broker.force_close_channels();
    assert!(eventually(|| !h.observer.failures().is_empty()).await);

    let err = within(handle.wait()).await.unwrap_err();
    assert!(matches!(err, RabbitMQError::ReconnectExhausted { attempts: 2, .. }));

    let failures = h.observer.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].is_connection_error());
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert_eq!(h.broker.connect_attempts(), 3);
    assert_eq!(h.broker.message_count("orders.created"), Some(0));
}
