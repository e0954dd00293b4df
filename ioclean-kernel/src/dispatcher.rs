/**
 * COMMAND DISPATCHER - File globale des commandes et corrélation des ACK
 *
 * RÔLE :
 * Reçoit les CMD de tous les liens, résout l'équipement cible, puis écrit
 * la commande CMO sur le lien cible en garantissant au plus une commande
 * en vol par clé (équipement cible, métrique).
 *
 * FONCTIONNEMENT :
 * - File FIFO unique (mpsc) alimentée par tous les liens et par l'API
 * - Un seul consommateur : backlog ordonné, une requête dont la clé est
 *   PENDING attend sur place, les autres clés passent devant
 * - ACK → la clé repasse IDLE et le consommateur est réveillé
 * - Deadline dépassée → nouvel essai si la politique le permet, sinon la
 *   clé est libérée et un TimedOut est publié
 * - stop() → plus aucune requête acceptée, rapport d'arrêt déterministe
 */

use crate::config::DispatchConf;
use crate::frame::{is_wire_safe, render_command, Frame, FrameKind};
use crate::health::HealthTracker;
use crate::registry::DeviceRegistry;
use crate::routing::RoutingTable;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no registered device handles metric {metric:?} (requested by {requester})")]
    Unroutable { requester: String, metric: String },
    #[error("device not found: {0}")]
    UnknownDevice(String),
    #[error("frame kind {0} is not a command")]
    NotCommand(FrameKind),
    #[error("{0} must be non-empty and free of ',' and line breaks")]
    InvalidField(&'static str),
    #[error("dispatcher is stopped")]
    Stopped,
}

/// Clé de sérialisation : une seule commande en vol par (cible, métrique)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PendingKey {
    pub target: String,
    pub metric: String,
}

impl PendingKey {
    pub fn new(target: &str, metric: &str) -> Self {
        Self { target: target.to_string(), metric: metric.to_string() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRequest {
    pub id: Uuid,
    pub requester: String,
    pub target: String,
    pub metric_name: String,
    pub value: String,
    /// Ligne écrite sur le lien cible, `CMO,<metric>,<value>`
    pub wire_command: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Nombre d'écritures déjà faites
    pub attempts: u32,
}

impl CommandRequest {
    pub fn new(requester: &str, target: &str, metric_name: &str, value: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester: requester.to_string(),
            target: target.to_string(),
            metric_name: metric_name.to_string(),
            value: value.to_string(),
            wire_command: render_command(metric_name, value),
            created_at: OffsetDateTime::now_utc(),
            attempts: 0,
        }
    }

    pub fn key(&self) -> PendingKey {
        PendingKey::new(&self.target, &self.metric_name)
    }
}

#[derive(Debug)]
struct PendingEntry {
    request: CommandRequest,
    deadline: Instant,
}

/// Transitions publiées par le dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    Queued { request_id: Uuid, key: PendingKey },
    Sent { request_id: Uuid, key: PendingKey, attempt: u32 },
    Retried { request_id: Uuid, key: PendingKey, attempt: u32 },
    Acked { request_id: Uuid, key: PendingKey },
    TimedOut { request_id: Uuid, key: PendingKey },
    WriteFailed { request_id: Uuid, key: PendingKey, reason: String },
    Unroutable { requester: String, metric: String },
}

/// Commandes encore en vol ou en attente au moment de l'arrêt
#[derive(Debug, Default, Clone, Serialize)]
pub struct ShutdownReport {
    pub in_flight: Vec<CommandRequest>,
    pub queued: Vec<CommandRequest>,
}

impl ShutdownReport {
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty() && self.queued.is_empty()
    }

    fn log(&self) {
        if self.is_empty() {
            info!("dispatcher stopped with no command in flight");
            return;
        }
        for req in &self.in_flight {
            warn!(request_id = %req.id, target = %req.target, metric = %req.metric_name,
                  attempts = req.attempts, "shutdown: command still awaiting ACK");
        }
        for req in &self.queued {
            warn!(request_id = %req.id, target = %req.target, metric = %req.metric_name,
                  "shutdown: command never sent");
        }
    }
}

pub struct Dispatcher {
    routing: RoutingTable,
    registry: DeviceRegistry,
    policy: DispatchConf,
    health: HealthTracker,
    queue_tx: mpsc::UnboundedSender<CommandRequest>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<CommandRequest>>>,
    pending: Mutex<HashMap<PendingKey, PendingEntry>>,
    released: Notify,
    stop: watch::Sender<bool>,
    queued: AtomicUsize,
    events: broadcast::Sender<DispatchEvent>,
}

pub type SharedDispatcher = Arc<Dispatcher>;

impl Dispatcher {
    pub fn new(routing: RoutingTable, registry: DeviceRegistry, policy: DispatchConf) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        Self {
            routing,
            registry,
            policy,
            health: HealthTracker::new(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            pending: Mutex::new(HashMap::new()),
            released: Notify::new(),
            stop,
            queued: AtomicUsize::new(0),
            events,
        }
    }

    pub fn with_health(mut self, health: HealthTracker) -> Self {
        self.health = health;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn is_pending(&self, target: &str, metric: &str) -> bool {
        self.pending.lock().contains_key(&PendingKey::new(target, metric))
    }

    fn emit(&self, event: DispatchEvent) {
        // personne n'écoute : pas une erreur
        let _ = self.events.send(event);
    }

    /// Route une Frame CMD vers l'équipement responsable de sa métrique
    pub fn submit(&self, frame: &Frame) -> Result<CommandRequest, DispatchError> {
        if frame.kind != FrameKind::Cmd {
            return Err(DispatchError::NotCommand(frame.kind));
        }
        if self.is_stopped() {
            return Err(DispatchError::Stopped);
        }
        let devices = self.registry.device_ids();
        let Some(target) = self.routing.resolve(&frame.metric_name, devices.iter().map(String::as_str)) else {
            warn!(requester = %frame.origin, metric = %frame.metric_name, "unroutable command dropped");
            self.emit(DispatchEvent::Unroutable {
                requester: frame.origin.clone(),
                metric: frame.metric_name.clone(),
            });
            return Err(DispatchError::Unroutable {
                requester: frame.origin.clone(),
                metric: frame.metric_name.clone(),
            });
        };
        self.enqueue(CommandRequest::new(&frame.origin, &target, &frame.metric_name, &frame.value))
    }

    /// Commande vers une cible explicite (API), même file et même discipline que submit()
    pub fn submit_to(&self, requester: &str, target: &str, metric_name: &str, value: &str) -> Result<CommandRequest, DispatchError> {
        if self.is_stopped() {
            return Err(DispatchError::Stopped);
        }
        if !is_wire_safe(metric_name) {
            return Err(DispatchError::InvalidField("metric_name"));
        }
        if !is_wire_safe(value) {
            return Err(DispatchError::InvalidField("value"));
        }
        if !self.registry.contains(target) {
            return Err(DispatchError::UnknownDevice(target.to_string()));
        }
        self.enqueue(CommandRequest::new(requester, target, metric_name, value))
    }

    fn enqueue(&self, request: CommandRequest) -> Result<CommandRequest, DispatchError> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        if self.queue_tx.send(request.clone()).is_err() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(DispatchError::Stopped);
        }
        info!(request_id = %request.id, requester = %request.requester, target = %request.target,
              command = %request.wire_command, "command queued");
        self.emit(DispatchEvent::Queued { request_id: request.id, key: request.key() });
        Ok(request)
    }

    /// ACK reçu de `device_id` : libère la clé et réveille le consommateur
    pub fn handle_ack(&self, device_id: &str, metric_name: &str) -> bool {
        let key = PendingKey::new(device_id, metric_name);
        let entry = self.pending.lock().remove(&key);
        match entry {
            Some(entry) => {
                let latency = OffsetDateTime::now_utc() - entry.request.created_at;
                info!(request_id = %entry.request.id, device = device_id, metric = metric_name,
                      latency_ms = latency.whole_milliseconds() as i64, "command acknowledged");
                self.health.record_acked();
                self.emit(DispatchEvent::Acked { request_id: entry.request.id, key });
                self.released.notify_one();
                true
            }
            None => {
                debug!(device = device_id, metric = metric_name, "ACK without pending command ignored");
                false
            }
        }
    }

    /// Arrête le consommateur ; idempotent
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            info!("dispatcher stopping");
        }
    }

    /// Démarre l'unique consommateur de la file ; None s'il tourne déjà
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<ShutdownReport>> {
        let rx = self.queue_rx.lock().take()?;
        let dispatcher = Arc::clone(self);
        Some(tokio::spawn(async move { dispatcher.run(rx).await }))
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<CommandRequest>) -> ShutdownReport {
        let mut backlog: VecDeque<CommandRequest> = VecDeque::new();
        let mut stop = self.stop.subscribe();

        loop {
            if *stop.borrow_and_update() {
                break;
            }
            self.expire_deadlines().await;
            self.drain_backlog(&mut backlog).await;

            let wake_at = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(request) => backlog.push_back(request),
                    None => break,
                },
                _ = self.released.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = stop.changed() => {}
            }
        }

        rx.close();
        while let Ok(request) = rx.try_recv() {
            backlog.push_back(request);
        }
        self.shutdown_report(backlog)
    }

    /// Envoie, dans l'ordre d'arrivée, chaque requête dont la clé est libre
    async fn drain_backlog(&self, backlog: &mut VecDeque<CommandRequest>) {
        let mut i = 0;
        while i < backlog.len() && !self.is_stopped() {
            if self.pending.lock().contains_key(&backlog[i].key()) {
                i += 1;
                continue;
            }
            if let Some(request) = backlog.remove(i) {
                self.queued.fetch_sub(1, Ordering::Relaxed);
                self.send(request).await;
            }
        }
    }

    /// Marque la clé PENDING avant d'écrire : un ACK rapide trouve toujours son entrée.
    /// L'écriture est bornée par `ack_timeout` et abandonnée dès stop().
    async fn send(&self, mut request: CommandRequest) {
        let key = request.key();
        let Some(link) = self.registry.get(&request.target) else {
            self.write_failed(&request, "device not connected".to_string());
            return;
        };
        request.attempts += 1;
        let attempt = request.attempts;
        let request_id = request.id;
        let wire = request.wire_command.clone();
        self.pending.lock().insert(
            key.clone(),
            PendingEntry { request: request.clone(), deadline: Instant::now() + self.policy.ack_timeout() },
        );

        let limit = self.policy.ack_timeout();
        let mut stop = self.stop.subscribe();
        let outcome = tokio::select! {
            biased;
            res = tokio::time::timeout(limit, link.write(&wire)) => match res {
                Ok(written) => written.map_err(|e| e.to_string()),
                Err(_) => Err(format!("device did not drain the command within {limit:?}")),
            },
            _ = stop.wait_for(|stopped| *stopped) => {
                // reste PENDING : le rapport d'arrêt le liste en vol
                warn!(request_id = %request_id, target = %key.target, "write interrupted by stop");
                return;
            }
        };

        match outcome {
            Ok(()) => {
                info!(request_id = %request_id, target = %key.target, command = %wire, attempt, "command sent");
                self.health.record_sent();
                let event = if attempt == 1 {
                    DispatchEvent::Sent { request_id, key, attempt }
                } else {
                    DispatchEvent::Retried { request_id, key, attempt }
                };
                self.emit(event);
            }
            Err(reason) => {
                self.pending.lock().remove(&key);
                self.write_failed(&request, reason);
            }
        }
    }

    fn write_failed(&self, request: &CommandRequest, reason: String) {
        warn!(request_id = %request.id, target = %request.target, metric = %request.metric_name,
              reason = %reason, "command rejected: write failed");
        self.emit(DispatchEvent::WriteFailed { request_id: request.id, key: request.key(), reason });
    }

    async fn expire_deadlines(&self) {
        let now = Instant::now();
        let expired: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            let keys: Vec<PendingKey> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| pending.remove(key)).collect()
        };

        for entry in expired {
            let request = entry.request;
            if request.attempts <= self.policy.max_retries {
                debug!(request_id = %request.id, attempt = request.attempts, "no ACK before deadline, retrying");
                self.send(request).await;
            } else {
                warn!(request_id = %request.id, target = %request.target, metric = %request.metric_name,
                      attempts = request.attempts, "command timed out waiting for ACK");
                self.health.record_timeout();
                self.emit(DispatchEvent::TimedOut { request_id: request.id, key: request.key() });
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.lock().values().map(|entry| entry.deadline).min()
    }

    fn shutdown_report(&self, backlog: VecDeque<CommandRequest>) -> ShutdownReport {
        let mut in_flight: Vec<CommandRequest> =
            self.pending.lock().drain().map(|(_, entry)| entry.request).collect();
        let mut queued: Vec<CommandRequest> = backlog.into_iter().collect();
        self.queued.store(0, Ordering::Relaxed);

        let order = |a: &CommandRequest, b: &CommandRequest| {
            a.key().cmp(&b.key()).then(a.created_at.cmp(&b.created_at))
        };
        in_flight.sort_by(order);
        queued.sort_by(order);

        let report = ShutdownReport { in_flight, queued };
        report.log();
        report
    }
}
