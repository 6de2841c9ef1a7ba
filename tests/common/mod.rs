//! Shared utilities for integration tests.
//!
//! Builds small replica deployments on top of the in-process broker.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use replica::bus::{
    ConnectionSupervisor, ConsumerHandle, ConsumerStats, EventConsumer, EventPublisher,
    InProcessBroker, PublishRoute, Role, Subscription,
};
use replica::projection::{Catalog, ProjectionApplier};
use replica::storage::{MemoryProjectionStore, NaturalKey, ProjectionRow, ProjectionStore};
use replica::topology::{ExchangeKind, Topology};

pub const BROKER_URL: &str = "memory://campus";

/// Course and grade events fanned out to the services that replicate them.
pub fn campus_topology() -> Topology {
    let mut topology = Topology::new();
    topology
        .declare_exchange("course.events", ExchangeKind::Fanout, true)
        .unwrap()
        .declare_exchange("grade.events", ExchangeKind::Fanout, true)
        .unwrap()
        .declare_queue("grades.course", true, false)
        .unwrap()
        .declare_queue("students.course", true, false)
        .unwrap()
        .declare_queue("students.grade", true, false)
        .unwrap()
        .bind("grades.course", "course.events", "")
        .unwrap()
        .bind("students.course", "course.events", "")
        .unwrap()
        .bind("students.grade", "grade.events", "")
        .unwrap();
    topology
}

pub fn supervisor(broker: &InProcessBroker, service: &str, role: Role) -> Arc<ConnectionSupervisor> {
    Arc::new(
        ConnectionSupervisor::new(service, role, BROKER_URL, Arc::new(broker.clone()))
            .with_topology(campus_topology()),
    )
}

/// A publishing service.
pub async fn start_publisher(broker: &InProcessBroker) -> (Arc<ConnectionSupervisor>, EventPublisher) {
    let supervisor = supervisor(broker, "courses", Role::Publish);
    supervisor.connect().await.expect("publisher connect");
    let publisher = EventPublisher::new(supervisor.clone())
        .with_route(PublishRoute::fanout("course", "course.events"))
        .with_route(PublishRoute::fanout("grade", "grade.events"));
    (supervisor, publisher)
}

/// A consuming service projecting into its own store.
pub struct Replica {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub store: Arc<MemoryProjectionStore>,
    pub consumers: Vec<ConsumerHandle>,
}

impl Replica {
    pub async fn start(broker: &InProcessBroker, service: &str, queues: &[&str]) -> Self {
        let supervisor = supervisor(broker, service, Role::Consume);
        supervisor.connect().await.expect("consumer connect");

        let store = Arc::new(MemoryProjectionStore::new());
        let applier = Arc::new(ProjectionApplier::new(
            store.clone(),
            Arc::new(Catalog::campus()),
        ));
        let consumers = queues
            .iter()
            .map(|queue| {
                EventConsumer::subscribe(
                    supervisor.clone(),
                    Subscription::new(*queue),
                    applier.handlers(),
                )
            })
            .collect();

        Self {
            supervisor,
            store,
            consumers,
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.consumers[0].stats()
    }

    pub async fn row(&self, entity: &str, key: &str) -> Option<ProjectionRow> {
        self.store
            .get(entity, &NaturalKey::from(key))
            .await
            .expect("memory store")
    }

    pub async fn stop(self) {
        for consumer in self.consumers {
            consumer.shutdown().await;
        }
        self.supervisor.shutdown().await;
    }
}

/// Poll until `stats` has settled `count` deliveries.
pub async fn wait_settled(stats: &ConsumerStats, count: u64) {
    for _ in 0..500 {
        if stats.settled() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} settled deliveries, got {:?}", count, stats);
}
