use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use mom_bus::{
    //
    create_memory_broker,
    handler,
    BindingOptions,
    BrokerCall,
    Bus,
    BusError,
    ConnectionConfig,
    ExchangeKind,
    ExchangeOptions,
    MemoryBroker,
    Message,
    QueueOptions,
    Result,
    SubscribeOptions,
    TopologyEvent,
};

const WAIT: Duration = Duration::from_secs(2);

async fn new_bus(broker: &MemoryBroker) -> Result<Bus> {
    // ---
    let config = ConnectionConfig::with_servers("integration", ["localhost"])
        .with_ack_interval(Duration::from_millis(10));
    let bus = Bus::new(config, create_memory_broker(broker)).await?;
    bus.connect().await?;
    Ok(bus)
}

/// Exchange `orders` (topic) bound to queue `orders.q` with `order.*`.
async fn orders_topology(bus: &Bus) -> Result<()> {
    // ---
    bus.create_exchange(ExchangeOptions::new("orders").with_kind(ExchangeKind::Topic))
        .await?;
    bus.create_queue(QueueOptions::new("orders.q")).await?;
    bus.create_binding(BindingOptions::queue("orders", "orders.q").with_keys(["order.*"]))
        .await
}

async fn wait_for_call(broker: &MemoryBroker, call: BrokerCall) {
    // ---
    let seen = timeout(WAIT, async {
        while !broker.calls().contains(&call) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(seen.is_ok(), "never saw {call:?}: {:?}", broker.calls());
}

#[tokio::test]
async fn test_publish_consume_ack() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = new_bus(&broker).await?;
    bus.create_exchange(ExchangeOptions::new("results")).await?;
    bus.create_queue(QueueOptions::new("results.q")).await?;
    bus.create_binding(BindingOptions::queue("results", "results.q").with_keys(["succeed"]))
        .await?;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    bus.subscribe(
        "results.q",
        handler(move |delivery, ops| {
            let seen_tx = seen_tx.clone();
            async move {
                ops.ack().await?;
                let _ = seen_tx.send((delivery.tag, delivery.routing_key));
                Ok(())
            }
        }),
        SubscribeOptions::default(),
    )
    .await?;

    bus.publish("results", Message::new("succeed", r#"{"id":1}"#))
        .await?;

    let (tag, key) = timeout(WAIT, seen_rx.recv())
        .await
        .expect("no delivery")
        .expect("handler dropped");
    assert_eq!(key, "succeed");

    wait_for_call(&broker, BrokerCall::Ack { tag, multiple: true }).await;
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("results.q"), 0);

    bus.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_unrouted_key_is_not_delivered() -> Result<()> {
    // ---
    let broker = MemoryBroker::new();
    let bus = new_bus(&broker).await?;
    orders_topology(&bus).await?;

    bus.publish("orders", Message::new("invoice.created", "{}")).await?;

    assert_eq!(broker.queue_depth("orders.q"), 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_declarations_share_one_call() -> Result<()> {
    // ---
    let broker = MemoryBroker::new();
    let bus = new_bus(&broker).await?;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let bus = bus.clone();
        handles.push(tokio::spawn(async move {
            bus.create_queue(QueueOptions::new("shared")).await.map(|_| ())
        }));
    }
    for handle in handles {
        handle.await.expect("declare task panicked")?;
    }

    let declares = broker
        .calls()
        .iter()
        .filter(|call| matches!(call, BrokerCall::DeclareQueue(name) if name == "shared"))
        .count();
    assert_eq!(declares, 1);
    Ok(())
}

#[tokio::test]
async fn test_reconnect_replays_checks_then_bindings_once() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = new_bus(&broker).await?;
    orders_topology(&bus).await?;
    let mut events = bus.topology_events();

    broker.clear_calls();
    broker.disconnect_all();

    let event = timeout(WAIT, events.recv())
        .await
        .expect("no bindings-completed event")
        .expect("topology events closed");
    assert_eq!(event, TopologyEvent::BindingsCompleted { epoch: 2 });

    let calls = broker.calls();
    let position = |wanted: BrokerCall| {
        calls
            .iter()
            .position(|call| *call == wanted)
            .unwrap_or_else(|| panic!("missing {wanted:?} in {calls:?}"))
    };
    let bind = position(BrokerCall::BindQueue {
        queue: "orders.q".into(),
        exchange: "orders".into(),
        key: "order.*".into(),
    });
    assert!(position(BrokerCall::DeclareExchange("orders".into())) < bind);
    assert!(position(BrokerCall::DeclareQueue("orders.q".into())) < bind);

    // One completion per reconnect cycle.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    // The replayed binding routes again.
    bus.publish("orders", Message::new("order.shipped", "{}")).await?;
    assert_eq!(broker.queue_depth("orders.q"), 1);
    Ok(())
}

#[tokio::test]
async fn test_unconfirmed_publish_survives_reconnect() -> Result<()> {
    // ---
    let broker = MemoryBroker::new();
    let bus = new_bus(&broker).await?;
    orders_topology(&bus).await?;
    let mut events = bus.topology_events();

    broker.set_blocked(true);
    let publish = tokio::spawn({
        let bus = bus.clone();
        async move { bus.publish("orders", Message::new("order.created", "{}")).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    broker.disconnect_all();
    timeout(WAIT, events.recv())
        .await
        .expect("no bindings-completed event")
        .expect("topology events closed");
    broker.set_blocked(false);

    timeout(WAIT, publish)
        .await
        .expect("publish never resolved")
        .expect("publish task panicked")?;
    assert_eq!(broker.queue_depth("orders.q"), 1);
    Ok(())
}

#[tokio::test]
async fn test_publish_timeout_is_reported() -> Result<()> {
    // ---
    let broker = MemoryBroker::new();
    let bus = new_bus(&broker).await?;
    bus.create_exchange(ExchangeOptions::new("slow").with_publish_timeout(Duration::from_millis(30)))
        .await?;

    broker.set_blocked(true);
    let err = bus
        .publish("slow", Message::new("key", "body"))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::PublishTimeout { .. }), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn test_config_aliases_round_trip_through_configure() -> Result<()> {
    // ---
    let broker = MemoryBroker::new();
    let bus = new_bus(&broker).await?;

    let topology = mom_bus::TopologyConfig::from_json(
        r#"{
            "exchanges": [
                { "name": "dlx", "type": "fanout" },
                { "name": "main", "type": "direct", "alternateExchange": "dlx" }
            ],
            "queues": [
                { "name": "dead" },
                { "name": "work", "deadLetterExchange": "dlx", "queueLimit": 2 }
            ],
            "bindings": [
                { "exchange": "dlx", "target": "dead" },
                { "exchange": "main", "target": "work", "keys": ["job"] }
            ]
        }"#,
    )?;
    bus.configure(topology).await?;

    // Unroutable messages fall through to the alternate exchange.
    bus.publish("main", Message::new("unknown", "x")).await?;
    assert_eq!(broker.queue_depth("dead"), 1);

    // queueLimit drops the oldest message.
    for body in ["1", "2", "3"] {
        bus.publish("main", Message::new("job", body)).await?;
    }
    assert_eq!(broker.queue_depth("work"), 2);
    Ok(())
}

#[tokio::test]
async fn test_handler_failure_rejects_and_logs() -> Result<()> {
    // ---
    #[cfg(feature = "logging")]
    let (captured, _guard) = capture::install();

    let broker = MemoryBroker::new();
    let bus = new_bus(&broker).await?;
    orders_topology(&bus).await?;

    bus.subscribe(
        "orders.q",
        handler(|_, _| async move { Err(BusError::Handler("cannot process order".into())) }),
        SubscribeOptions::default(),
    )
    .await?;
    bus.publish("orders", Message::new("order.created", "{}")).await?;

    wait_for_call(&broker, BrokerCall::Reject { tag: 1, multiple: true }).await;

    #[cfg(feature = "logging")]
    {
        let output = captured.contents();
        assert!(output.contains("ERROR"), "{output}");
        assert!(output.contains("cannot process order"), "{output}");
    }
    Ok(())
}

#[cfg(feature = "logging")]
mod capture {
    use std::sync::{Arc, Mutex};

    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::util::SubscriberInitExt;

    /// Log sink shared with the test.
    #[derive(Clone, Default)]
    pub struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        pub fn contents(&self) -> String {
            let sink = self.0.lock().unwrap();
            String::from_utf8_lossy(&sink).into_owned()
        }
    }

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Route this thread's logs into a fresh [`Capture`] until the guard drops.
    pub fn install() -> (Capture, DefaultGuard) {
        // ---
        let captured = Capture::default();
        let writer = captured.clone();
        let guard = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish()
            .set_default();
        (captured, guard)
    }
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
