//! AMQP/RabbitMQ integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required, but Docker must be running.

use std::sync::Arc;
use std::time::Duration;

use replica::bus::{
    AmqpConnector, BusError, ConnectionSupervisor, EventConsumer, EventPublisher, PublishRoute,
    Role, Subscription,
};
use replica::envelope::EventType;
use replica::projection::{Catalog, ProjectionApplier};
use replica::storage::{MemoryProjectionStore, NaturalKey, ProjectionStore};
use replica::topology::{ExchangeKind, Topology};
use serde_json::json;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

/// Fanout exchange with one bound durable queue, uniquely named per test.
fn course_topology(suffix: &str) -> (Topology, String, String) {
    let exchange = format!("course.events.{}", suffix);
    let queue = format!("grades.course.{}", suffix);
    let mut topology = Topology::new();
    topology
        .declare_exchange(exchange.as_str(), ExchangeKind::Fanout, true)
        .unwrap()
        .declare_queue(queue.as_str(), true, false)
        .unwrap()
        .bind(queue.as_str(), exchange.as_str(), "")
        .unwrap();
    (topology, exchange, queue)
}

fn supervisor(url: &str, service: &str, role: Role, topology: Topology) -> Arc<ConnectionSupervisor> {
    Arc::new(
        ConnectionSupervisor::new(service, role, url, Arc::new(AmqpConnector::default()))
            .with_topology(topology),
    )
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_publish_and_project() {
    println!("=== AMQP Publish and Project Test ===");
    println!("Starting RabbitMQ container...");

    let (_container, url) = start_rabbitmq().await;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let (topology, exchange, queue) = course_topology(&suffix);

    let consumer_supervisor = supervisor(&url, "grades", Role::Consume, topology.clone());
    consumer_supervisor
        .connect()
        .await
        .expect("Failed to connect consumer");

    let store = Arc::new(MemoryProjectionStore::new());
    let applier = Arc::new(ProjectionApplier::new(
        store.clone(),
        Arc::new(Catalog::campus()),
    ));
    let consumer = EventConsumer::subscribe(
        consumer_supervisor.clone(),
        Subscription::new(queue.as_str()),
        applier.handlers(),
    );

    let publisher_supervisor = supervisor(&url, "courses", Role::Publish, topology);
    publisher_supervisor
        .connect()
        .await
        .expect("Failed to connect publisher");
    let publisher = EventPublisher::new(publisher_supervisor.clone())
        .with_route(PublishRoute::fanout("course", exchange.as_str()));

    assert!(
        publisher
            .publish("course", EventType::Created, &json!({"id": 7, "code": "CS101"}))
            .await
    );
    assert!(
        publisher
            .publish("course", EventType::Updated, &json!({"id": 7, "department": "CS"}))
            .await
    );

    let stats = consumer.stats();
    tokio::time::timeout(Duration::from_secs(10), async {
        while stats.acked() < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Timed out waiting for deliveries");

    let row = store
        .get("course", &NaturalKey::from("7"))
        .await
        .unwrap()
        .expect("course replicated");
    assert_eq!(row.fields["code"], json!("CS101"));
    assert_eq!(row.fields["department"], json!("CS"));
    println!("Projection row: {:?}", row.fields);

    consumer.shutdown().await;
    consumer_supervisor.shutdown().await;
    publisher_supervisor.shutdown().await;

    println!("=== AMQP Publish and Project Test PASSED ===");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_conflicting_exchange_declaration() {
    println!("=== AMQP Topology Conflict Test ===");

    let (_container, url) = start_rabbitmq().await;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let exchange = format!("course.events.{}", suffix);

    let mut fanout = Topology::new();
    fanout
        .declare_exchange(exchange.as_str(), ExchangeKind::Fanout, true)
        .unwrap();
    let first = supervisor(&url, "courses", Role::Publish, fanout);
    first.connect().await.expect("Failed to declare fanout");

    let mut direct = Topology::new();
    direct
        .declare_exchange(exchange.as_str(), ExchangeKind::Direct, true)
        .unwrap();
    let second = supervisor(&url, "grades", Role::Consume, direct);
    let result = second.connect().await;

    assert!(
        matches!(result, Err(BusError::TopologyConflict(_))),
        "expected topology conflict, got {:?}",
        result.err()
    );
    assert!(!second.is_connected());

    first.shutdown().await;
    println!("=== AMQP Topology Conflict Test PASSED ===");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redeclaring_same_topology_is_idempotent() {
    let (_container, url) = start_rabbitmq().await;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let (topology, _, _) = course_topology(&suffix);

    let first = supervisor(&url, "courses", Role::Publish, topology.clone());
    first.connect().await.expect("first declaration");
    let second = supervisor(&url, "grades", Role::Consume, topology);
    second.connect().await.expect("identical redeclaration");

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unroutable_entity_is_not_published() {
    let (_container, url) = start_rabbitmq().await;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let (topology, exchange, _) = course_topology(&suffix);

    let publisher_supervisor = supervisor(&url, "courses", Role::Publish, topology);
    publisher_supervisor.connect().await.unwrap();
    let publisher = EventPublisher::new(publisher_supervisor.clone())
        .with_route(PublishRoute::fanout("course", exchange.as_str()));

    assert!(
        !publisher
            .publish("invoice", EventType::Created, &json!({"id": 1}))
            .await
    );

    publisher_supervisor.shutdown().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_channel_error_then_close() {
    use replica::bus::Connector;

    let (_container, url) = start_rabbitmq().await;
    let channel = AmqpConnector::default()
        .connect(&url, Role::Consume)
        .await
        .expect("Failed to connect");

    // Consuming an undeclared queue closes the channel but not the connection.
    let queue = format!("missing.{}", uuid::Uuid::new_v4().simple());
    assert!(channel.consume(&queue, "test", 1).await.is_err());
    tokio::time::timeout(Duration::from_secs(5), channel.closed())
        .await
        .expect("channel should report closed");
    assert!(!channel.is_open());

    channel.close().await.expect("close after channel error");
    channel.close().await.expect("second close is a no-op");
}
