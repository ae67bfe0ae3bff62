use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use rabbitmq_adapter::rabbitmq::{
    BindSpec, ConnectionState, Consumer, ConsumerConfig, ExchangeKind, ExchangeSpec, Message,
    Producer, ProducerConfig, QueueSpec, RabbitMQError, TopologyDeclarator,
};

use crate::support::{config, connected, forwarding_handler, harness_with, next_body, nothing_more, within};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct InvoiceIssued {
    invoice_id: String,
    amount_cents: u64,
}

#[tokio::test]
async fn cancelled_context_never_reaches_the_broker() {
    let h = connected(3).await;
    TopologyDeclarator::new(h.manager.clone())
        .declare_queue(&QueueSpec::new("jobs"))
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = Producer::new(h.manager.clone())
        .publish(&cancel, &ProducerConfig::new("", "jobs"), &Message::new(b"job".to_vec()))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(h.broker.message_count("jobs"), Some(0));
    assert!(h.manager.get_channel().unwrap().is_open());
}

#[tokio::test]
async fn cancellation_wins_even_when_disconnected() {
    let h = harness_with(config(3));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = Producer::new(h.manager.clone())
        .publish(&cancel, &ProducerConfig::default(), &Message::new(Vec::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, RabbitMQError::Cancelled(_)));
}

#[tokio::test]
async fn publishing_requires_a_connection() {
    let h = harness_with(config(3));

    let err = Producer::new(h.manager.clone())
        .publish(
            &CancellationToken::new(),
            &ProducerConfig::new("", "jobs"),
            &Message::new(b"job".to_vec()),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RabbitMQError::NotConnected(ConnectionState::Disconnected)
    ));
}

#[tokio::test]
async fn publish_to_a_missing_exchange_only_costs_the_channel() {
    let h = connected(3).await;
    let producer = Producer::new(h.manager.clone());

    let err = producer
        .publish(
            &CancellationToken::new(),
            &ProducerConfig::new("nowhere", "jobs"),
            &Message::new(b"job".to_vec()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::PublishError(ref msg) if msg.contains("NOT_FOUND")));

    let channel = within(h.manager.wait_for_recovery(1)).await.unwrap();
    assert_eq!(channel.generation(), 2);
    assert_eq!(h.manager.reconnect_attempts_used(), 0);
    assert_eq!(h.broker.connect_attempts(), 1);
    assert_eq!(h.broker.open_connections(), 1);
}

#[tokio::test]
async fn json_messages_are_routed_by_topic() {
    let h = connected(3).await;
    let declarator = TopologyDeclarator::new(h.manager.clone());
    let errors = declarator
        .declare_all(
            &[
                QueueSpec::new("invoices.eu").bind(BindSpec::new("invoices", "invoice.eu.*")),
                QueueSpec::new("invoices.all").bind(BindSpec::new("invoices", "invoice.#")),
            ],
            &[ExchangeSpec::new("invoices", ExchangeKind::Topic)],
        )
        .await;
    assert!(errors.is_empty());

    let (handler, mut bodies) = forwarding_handler();
    let _eu = Consumer::new(h.manager.clone())
        .consume(&ConsumerConfig::new("invoices.eu"), handler)
        .await
        .unwrap();

    let producer = Producer::new(h.manager.clone());
    let invoice = InvoiceIssued {
        invoice_id: "inv-42".to_string(),
        amount_cents: 1999,
    };
    for routing_key in ["invoice.eu.issued", "invoice.us.issued"] {
        producer
            .publish_json(
                &CancellationToken::new(),
                &ProducerConfig::new("invoices", routing_key),
                &invoice,
            )
            .await
            .unwrap();
    }

    let body = next_body(&mut bodies).await;
    assert_eq!(serde_json::from_slice::<InvoiceIssued>(&body).unwrap(), invoice);
    assert!(nothing_more(&mut bodies).await);
    assert_eq!(h.broker.message_count("invoices.all"), Some(2));
}

#[tokio::test]
async fn headers_exchange_matches_on_message_headers() {
    let h = connected(3).await;
    let errors = TopologyDeclarator::new(h.manager.clone())
        .declare_all(
            &[QueueSpec::new("reports.pdf").bind(
                BindSpec::new("reports", "")
                    .argument("x-match", "all")
                    .argument("format", "pdf"),
            )],
            &[ExchangeSpec::new("reports", ExchangeKind::Headers)],
        )
        .await;
    assert!(errors.is_empty());

    let producer = Producer::new(h.manager.clone());
    let target = ProducerConfig::new("reports", "").with_timeout(Duration::from_secs(1));
    for format in ["pdf", "csv"] {
        producer
            .publish(
                &CancellationToken::new(),
                &target,
                &Message::new(format.as_bytes().to_vec()).with_header("format", format),
            )
            .await
            .unwrap();
    }

    assert_eq!(h.broker.message_count("reports.pdf"), Some(1));
}

#[tokio::test]
async fn mandatory_unroutable_publish_is_refused() {
    let h = connected(3).await;

    let err = Producer::new(h.manager.clone())
        .publish(
            &CancellationToken::new(),
            &ProducerConfig::new("amq.topic", "nobody.listens").mandatory(true),
            &Message::new(b"lost".to_vec()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RabbitMQError::PublishError(_)));
    assert!(h.manager.get_channel().unwrap().is_open());
}
