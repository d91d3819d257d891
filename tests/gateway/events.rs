//! Emitter → broker → consumer, on the in-memory broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_gateway::connect::{ConnectionManager, RetryPolicy};
use relay_gateway::dispatch::{Dispatcher, ServiceEndpoints};
use relay_gateway::events::{
    listen_with_reconnect, AckMode, Broker, BrokerChannel, BrokerError, Consumer, Emitter,
    EventError, ExchangeKind, ExchangeSpec, InMemoryBroker, InMemoryChannel, LogForwarder,
};
use relay_gateway::transport::EventLogTransport;
use relay_gateway::{gateway, BoxError, EventMessage, GatewayConfig, Severity, TransportKind};
use serde_json::json;

use crate::support::{eventually, init, CountingJson, CountingLog, FailingHandler};

async fn emitter(broker: &InMemoryBroker) -> Emitter<InMemoryBroker> {
    Emitter::new(Arc::new(broker.clone()), ExchangeSpec::default())
        .await
        .unwrap()
}

async fn consumer(broker: &InMemoryBroker) -> Consumer<InMemoryBroker> {
    Consumer::new(Arc::new(broker.clone()), ExchangeSpec::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn published_log_reaches_matching_consumer_only() {
    init();
    let broker = InMemoryBroker::new();
    let emitter = emitter(&broker).await;

    let logs = CountingLog::new(TransportKind::Http);
    let mails = CountingLog::new(TransportKind::Http);

    let log_sub = consumer(&broker).await.subscribe(&["log.*"]).await.unwrap();
    let mail_sub = consumer(&broker).await.subscribe(&["mail.*"]).await.unwrap();
    tokio::spawn(log_sub.run(Arc::new(LogForwarder::new(logs.clone()))));
    tokio::spawn(mail_sub.run(Arc::new(LogForwarder::new(mails.clone()))));

    emitter
        .emit(&EventMessage::new("log", "x"), Severity::Info)
        .await
        .unwrap();

    eventually(|| {
        let logs = logs.clone();
        async move { logs.count() == 1 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(logs.sent(), [EventMessage::new("log", "x")]);
    assert_eq!(mails.count(), 0);
}

#[tokio::test]
async fn every_consumer_gets_its_own_copy() {
    let broker = InMemoryBroker::new();
    let emitter = emitter(&broker).await;

    let a = CountingLog::new(TransportKind::Http);
    let b = CountingLog::new(TransportKind::Http);
    let sub_a = consumer(&broker).await.subscribe(&["log.#"]).await.unwrap();
    let sub_b = consumer(&broker)
        .await
        .subscribe(&["log.INFO", "log.ERROR"])
        .await
        .unwrap();
    tokio::spawn(sub_a.run(Arc::new(LogForwarder::new(a.clone()))));
    tokio::spawn(sub_b.run(Arc::new(LogForwarder::new(b.clone()))));

    for severity in Severity::all() {
        emitter
            .emit(&EventMessage::new("log", severity.to_string()), severity)
            .await
            .unwrap();
    }

    eventually(|| {
        let (a, b) = (a.clone(), b.clone());
        async move { a.count() == 3 && b.count() == 2 }
    })
    .await;
}

#[tokio::test]
async fn auto_ack_never_redelivers_a_failed_message() {
    let broker = InMemoryBroker::new();
    let emitter = emitter(&broker).await;
    let handler = Arc::new(FailingHandler::default());

    let sub = consumer(&broker).await.subscribe(&["log.*"]).await.unwrap();
    let queue = sub.queue().to_string();
    tokio::spawn(sub.run(handler.clone()));

    emitter.publish("log.INFO", br#"{"name":"log","data":"x"}"#).await.unwrap();

    eventually(|| {
        let handler = handler.clone();
        async move { handler.calls() == 1 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.calls(), 1);
    assert_eq!(broker.queue_depth(&queue), Some(0));
    assert_eq!(broker.unacked(&queue), Some(0));
    assert_eq!(broker.stats().delivered, 1);
    assert!(broker.dead_letters().is_empty());
}

#[tokio::test]
async fn after_processing_rejects_failures_to_dead_letters() {
    let broker = InMemoryBroker::new();
    let emitter = emitter(&broker).await;
    let handler = Arc::new(FailingHandler::default());

    let sub = consumer(&broker)
        .await
        .with_ack_mode(AckMode::AfterProcessing)
        .subscribe(&["log.*"])
        .await
        .unwrap();
    tokio::spawn(sub.run(handler.clone()));

    emitter.publish("log.ERROR", br#"{"name":"log","data":"boom"}"#).await.unwrap();
    emitter.publish("log.ERROR", b"not json").await.unwrap();

    eventually(|| {
        let broker = broker.clone();
        async move { broker.dead_letters().len() == 2 }
    })
    .await;

    assert_eq!(handler.calls(), 1);
    assert_eq!(broker.stats().rejected, 2);
    assert_eq!(broker.stats().acked, 0);
}

#[tokio::test]
async fn after_processing_acks_successes() {
    let broker = InMemoryBroker::new();
    let emitter = emitter(&broker).await;
    let logs = CountingLog::new(TransportKind::Http);

    let sub = consumer(&broker)
        .await
        .with_ack_mode(AckMode::AfterProcessing)
        .subscribe(&["log.*"])
        .await
        .unwrap();
    let queue = sub.queue().to_string();
    tokio::spawn(sub.run(Arc::new(LogForwarder::new(logs.clone()))));

    emitter
        .emit(&EventMessage::new("log", "x"), Severity::Warning)
        .await
        .unwrap();

    eventually(|| {
        let broker = broker.clone();
        async move { broker.stats().acked == 1 }
    })
    .await;
    assert_eq!(broker.unacked(&queue), Some(0));
    assert_eq!(logs.count(), 1);
}

#[tokio::test]
async fn exchange_declaration_is_idempotent() {
    let broker = InMemoryBroker::new();

    let _a = emitter(&broker).await;
    let _b = emitter(&broker).await;
    let _c = consumer(&broker).await;

    assert_eq!(broker.exchange_count(), 1);
    assert_eq!(broker.stats().exchange_declarations, 3);
    assert_eq!(broker.exchange("logs_topic"), Some(ExchangeSpec::default()));
}

#[tokio::test]
async fn consumer_queue_disappears_with_the_consumer() {
    let broker = InMemoryBroker::new();
    let sub = consumer(&broker).await.subscribe(&["log.*"]).await.unwrap();
    let task = tokio::spawn(sub.run(Arc::new(FailingHandler::default())));
    assert_eq!(broker.queue_names().len(), 1);

    task.abort();
    let _ = task.await;

    assert!(broker.queue_names().is_empty());
}

#[tokio::test]
async fn consumer_survives_a_broker_restart() {
    init();
    let broker = InMemoryBroker::new();
    let manager = Arc::new(
        ConnectionManager::establish(
            "memory://broker",
            RetryPolicy::new(5, Duration::from_millis(10)),
            broker.connector(),
        )
        .await
        .unwrap(),
    );
    let logs = CountingLog::new(TransportKind::Http);

    let listener = {
        let manager = Arc::clone(&manager);
        let handler = Arc::new(LogForwarder::new(logs.clone()));
        tokio::spawn(async move {
            listen_with_reconnect(
                &manager,
                ExchangeSpec::default(),
                AckMode::Auto,
                &["log.*".to_string()],
                handler,
            )
            .await
        })
    };

    let queues_ready = || {
        let broker = broker.clone();
        async move { broker.queue_names().len() == 1 }
    };
    eventually(queues_ready).await;
    let ch = broker.open_channel().await.unwrap();
    ch.publish("logs_topic", "log.INFO", br#"{"name":"log","data":"before"}"#)
        .await
        .unwrap();
    eventually(|| {
        let logs = logs.clone();
        async move { logs.count() == 1 }
    })
    .await;

    broker.set_offline(true);
    tokio::time::sleep(Duration::from_millis(30)).await;
    broker.set_offline(false);

    eventually(queues_ready).await;
    let emitter = emitter(&broker).await;
    emitter
        .emit(&EventMessage::new("log", "after"), Severity::Info)
        .await
        .unwrap();
    eventually(|| {
        let logs = logs.clone();
        async move { logs.count() == 2 }
    })
    .await;

    assert!(manager.generation() >= 1);
    assert_eq!(
        logs.sent(),
        [EventMessage::new("log", "before"), EventMessage::new("log", "after")]
    );
    listener.abort();
}

#[tokio::test]
async fn listener_gives_up_when_the_broker_stays_down() {
    let broker = InMemoryBroker::new();
    let manager = ConnectionManager::establish(
        "memory://broker",
        RetryPolicy::new(2, Duration::from_millis(1)),
        broker.connector(),
    )
    .await
    .unwrap();

    let patterns = vec!["log.*".to_string()];
    let listening = listen_with_reconnect(
        &manager,
        ExchangeSpec::default(),
        AckMode::Auto,
        &patterns,
        Arc::new(FailingHandler::default()),
    );
    let outage = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.set_offline(true);
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(listening, outage)
    })
    .await
    .unwrap();

    assert!(result.is_err());
}

#[tokio::test]
async fn listener_stops_on_an_inequivalent_exchange() {
    let broker = InMemoryBroker::new();
    let ch = broker.open_channel().await.unwrap();
    ch.declare_exchange(&ExchangeSpec {
        kind: ExchangeKind::Fanout,
        ..ExchangeSpec::default()
    })
    .await
    .unwrap();
    let manager = ConnectionManager::establish(
        "memory://broker",
        RetryPolicy::new(5, Duration::from_millis(10)),
        broker.connector(),
    )
    .await
    .unwrap();

    let patterns = vec!["log.*".to_string()];
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        listen_with_reconnect(
            &manager,
            ExchangeSpec::default(),
            AckMode::Auto,
            &patterns,
            Arc::new(FailingHandler::default()),
        ),
    )
    .await
    .unwrap();

    assert!(matches!(
        result,
        Err(EventError::Broker(BrokerError::PreconditionFailed(_)))
    ));
    assert_eq!(manager.generation(), 0);
}

#[tokio::test]
async fn listener_counts_lost_cycles_even_when_reconnects_succeed() {
    let broker = InMemoryBroker::new();
    // Hands out the broker whether or not it is up, so every reconnect
    // "succeeds" and only the next subscribe notices.
    let connector = {
        let broker = broker.clone();
        move |_target: String| {
            let broker = broker.clone();
            async move { Ok::<_, BoxError>(broker) }
        }
    };
    let manager = ConnectionManager::establish(
        "memory://broker",
        RetryPolicy::new(3, Duration::from_millis(1)),
        connector,
    )
    .await
    .unwrap();
    broker.set_offline(true);

    let patterns = vec!["log.*".to_string()];
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        listen_with_reconnect(
            &manager,
            ExchangeSpec::default(),
            AckMode::Auto,
            &patterns,
            Arc::new(FailingHandler::default()),
        ),
    )
    .await
    .unwrap();

    assert!(matches!(
        result,
        Err(EventError::Broker(BrokerError::ConnectionClosed(_)))
    ));
    assert_eq!(manager.generation(), 3);
}

/// One connection to a shared [`InMemoryBroker`]. Once `alive` is cleared
/// the handle refuses channels, like a socket the broker reset.
struct Connection {
    broker: InMemoryBroker,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Broker for Connection {
    type Channel = InMemoryChannel;

    async fn open_channel(&self) -> Result<InMemoryChannel, BrokerError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed("connection reset".into()));
        }
        self.broker.open_channel().await
    }
}

#[tokio::test]
async fn event_action_recovers_after_the_connection_dies() {
    init();
    let broker = InMemoryBroker::new();
    let connections: Arc<Mutex<Vec<Arc<AtomicBool>>>> = Arc::default();
    let connector = {
        let (broker, connections) = (broker.clone(), Arc::clone(&connections));
        move |_target: String| {
            let alive = Arc::new(AtomicBool::new(true));
            connections.lock().push(Arc::clone(&alive));
            let connection = Connection {
                broker: broker.clone(),
                alive,
            };
            async move { Ok::<_, BoxError>(connection) }
        }
    };
    let manager = Arc::new(
        ConnectionManager::establish(
            "memory://broker",
            RetryPolicy::new(3, Duration::from_millis(1)),
            connector,
        )
        .await
        .unwrap(),
    );

    let env: HashMap<String, String> =
        [("GATEWAY_BROKER__CHANNEL_POOL_SIZE".to_string(), "0".to_string())].into();
    let config = GatewayConfig::load_with_env(None, Some(env)).unwrap();
    let dispatcher = gateway::dispatcher(&config, Arc::clone(&manager))
        .await
        .unwrap();

    let ch = broker.open_channel().await.unwrap();
    let queue = ch.declare_transient_queue().await.unwrap();
    ch.bind_queue(&queue, "logs_topic", "log.#").await.unwrap();
    let body = br#"{"action":"event","log":{"name":"event","data":"x"}}"#;

    let (status, _) = dispatcher.handle(body).await;
    assert_eq!(status, 202);

    connections.lock()[0].store(false, Ordering::SeqCst);
    let (status, _) = dispatcher.handle(body).await;

    assert_eq!(status, 202);
    assert_eq!(manager.generation(), 1);
    assert_eq!(connections.lock().len(), 2);
    assert_eq!(broker.queue_depth(&queue), Some(2));
}

#[tokio::test]
async fn event_action_publishes_onto_the_exchange() {
    let broker = InMemoryBroker::new();
    let emitter = Arc::new(emitter(&broker).await);
    let logs = CountingLog::new(TransportKind::Http);

    let sub = consumer(&broker).await.subscribe(&["log.INFO"]).await.unwrap();
    tokio::spawn(sub.run(Arc::new(LogForwarder::new(logs.clone()))));

    let dispatcher = Dispatcher::new(
        CountingJson::new(202, json!({})),
        CountingLog::new(TransportKind::Rpc),
        Arc::new(EventLogTransport::new(emitter)),
        ServiceEndpoints::default(),
    );
    let (status, response) = dispatcher
        .handle(br#"{"action":"event","log":{"name":"event","data":"via bus"}}"#)
        .await;

    assert_eq!(status, 202);
    assert_eq!(response.message, "logged via event bus");
    eventually(|| {
        let logs = logs.clone();
        async move { logs.count() == 1 }
    })
    .await;
    assert_eq!(logs.sent(), [EventMessage::new("event", "via bus")]);
}
