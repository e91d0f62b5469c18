use std::sync::{Arc, Mutex, PoisonError};

use skiff_core::{ClientConfig, ConsumerError};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::member::{HeartbeatSink, ManagedAdmin, ManagedConsumer, ManagedProducer};
use crate::registry::Registry;

/// One process-wide client: tracks attached producers/consumers/admins, drives
/// periodic rebalancing of the consumers and sends heartbeats.
pub struct ClientInstance {
    client_id: String,
    config: ClientConfig,
    producers: Registry<Arc<dyn ManagedProducer>>,
    consumers: Registry<Arc<dyn ManagedConsumer>>,
    admins: Registry<Arc<dyn ManagedAdmin>>,
    heartbeat_sink: Arc<dyn HeartbeatSink>,
    heartbeat_wakeup: Notify,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInstance {
    pub fn new(config: ClientConfig, heartbeat_sink: Arc<dyn HeartbeatSink>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let client_id = format!("{}@{}", config.instance_name, &Uuid::now_v7().to_string()[..8]);

        Arc::new(Self {
            client_id,
            config,
            producers: Registry::new(),
            consumers: Registry::new(),
            admins: Registry::new(),
            heartbeat_sink,
            heartbeat_wakeup: Notify::new(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn register_consumer(&self, consumer: Arc<dyn ManagedConsumer>) -> Result<(), ConsumerError> {
        let group = consumer.group().to_string();
        if group.is_empty() {
            return Err(ConsumerError::EmptyGroup);
        }
        self.consumers
            .put_if_absent(&group, consumer)
            .map_err(|_| ConsumerError::GroupAlreadyRegistered(group.clone()))?;
        info!(client = %self.client_id, group = %group, "Consumer registered");
        Ok(())
    }

    pub fn unregister_consumer(&self, group: &str) {
        if self.consumers.delete(group).is_some() {
            info!(client = %self.client_id, group, "Consumer unregistered");
        }
    }

    pub fn register_producer(&self, producer: Arc<dyn ManagedProducer>) -> Result<(), ConsumerError> {
        let group = producer.group().to_string();
        if group.is_empty() {
            return Err(ConsumerError::EmptyGroup);
        }
        self.producers
            .put_if_absent(&group, producer)
            .map_err(|_| ConsumerError::GroupAlreadyRegistered(group))
    }

    pub fn unregister_producer(&self, group: &str) {
        self.producers.delete(group);
    }

    pub fn register_admin(&self, admin: Arc<dyn ManagedAdmin>) -> Result<(), ConsumerError> {
        let group = admin.group().to_string();
        if group.is_empty() {
            return Err(ConsumerError::EmptyGroup);
        }
        self.admins
            .put_if_absent(&group, admin)
            .map_err(|_| ConsumerError::GroupAlreadyRegistered(group))
    }

    pub fn unregister_admin(&self, group: &str) {
        self.admins.delete(group);
    }

    pub fn consumer(&self, group: &str) -> Option<Arc<dyn ManagedConsumer>> {
        self.consumers.get(group)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn admin_count(&self) -> usize {
        self.admins.len()
    }

    /// Ask the heartbeat loop to send as soon as possible. Bursts collapse into one send.
    pub fn send_heartbeat(&self) {
        self.heartbeat_wakeup.notify_one();
    }

    /// One rebalance pass over every registered consumer.
    pub async fn rebalance_all(&self) {
        for consumer in self.consumers.snapshot() {
            consumer.rebalance_all().await;
        }
    }

    async fn heartbeat_once(&self) {
        let producer_groups = self.producers.groups();
        let consumer_groups = self.consumers.groups();
        if producer_groups.is_empty() && consumer_groups.is_empty() {
            debug!(client = %self.client_id, "No groups registered, skipping heartbeat");
            return;
        }

        if let Err(e) = self
            .heartbeat_sink
            .send_heartbeat(producer_groups, consumer_groups)
            .await
        {
            error!(client = %self.client_id, error = %e, "Heartbeat failed");
        }
    }

    /// Spawn the periodic rebalance driver and the heartbeat loop.
    pub fn start(self: &Arc<Self>) {
        let rebalance = tokio::spawn(run_rebalance_driver(
            self.clone(),
            self.shutdown_tx.subscribe(),
        ));
        let heartbeat = tokio::spawn(run_heartbeat_loop(self.clone(), self.shutdown_tx.subscribe()));

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([rebalance, heartbeat]);

        info!(client = %self.client_id, "Client instance started");
    }

    /// Stop the background loops and wait for the pass in flight to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }

        info!(client = %self.client_id, "Client instance stopped");
    }
}

async fn run_rebalance_driver(client: Arc<ClientInstance>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = time::interval(client.config.rebalance_interval());

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Rebalance driver shutting down");
                    break;
                }
            }
            _ = interval.tick() => {
                client.rebalance_all().await;
            }
        }
    }
}

async fn run_heartbeat_loop(client: Arc<ClientInstance>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = time::interval(client.config.heartbeat_interval());

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
            _ = interval.tick() => {
                client.heartbeat_once().await;
            }
            _ = client.heartbeat_wakeup.notified() => {
                client.heartbeat_once().await;
            }
        }
    }
}
