/**
 * BUS SUPERVISOR - Cycle de vie des liens et aiguillage des Frames
 *
 * RÔLE :
 * Ouvre un lien par équipement configuré, le maintient ouvert (reconnexion
 * sans limite) et aiguille chaque Frame reçue :
 * - toute Frame → état partagé (dernière lecture)
 * - SEN → sink de télémétrie
 * - CMD → dispatcher (routage + file globale)
 * - ACK → dispatcher (libération de la clé PENDING)
 *
 * ARRÊT : dispatcher d'abord (plus aucune écriture), liens ensuite.
 */

use crate::config::{BusConfig, DeviceConf};
use crate::dispatcher::{Dispatcher, SharedDispatcher, ShutdownReport};
use crate::facade::StateFacade;
use crate::frame::{Frame, FrameKind};
use crate::health::{BusHealth, HealthTracker};
use crate::link::{Connector, DeviceLink, LinkExit, SharedLink};
use crate::registry::DeviceRegistry;
use crate::routing::RoutingTable;
use crate::sink::LogSink;
use crate::state::SystemState;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Supervisor {
    config: BusConfig,
    registry: DeviceRegistry,
    state: SystemState,
    dispatcher: SharedDispatcher,
    health: HealthTracker,
    sink: Arc<dyn LogSink>,
    connector: Arc<dyn Connector>,
    consumer: Mutex<Option<JoinHandle<ShutdownReport>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

pub type SharedSupervisor = Arc<Supervisor>;

impl Supervisor {
    pub fn new(config: BusConfig, connector: Arc<dyn Connector>, sink: Arc<dyn LogSink>) -> SharedSupervisor {
        let registry = DeviceRegistry::new();
        let health = HealthTracker::new();
        let dispatcher = Dispatcher::new(
            RoutingTable::new(config.routes.clone()),
            registry.clone(),
            config.dispatch.clone(),
        )
        .with_health(health.clone());
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            config,
            registry,
            state: SystemState::new(),
            dispatcher: Arc::new(dispatcher),
            health,
            sink,
            connector,
            consumer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    pub fn dispatcher(&self) -> &SharedDispatcher {
        &self.dispatcher
    }

    pub fn facade(&self) -> StateFacade {
        StateFacade::new(self.state.clone(), self.dispatcher.clone())
    }

    pub fn health(&self) -> BusHealth {
        self.health.get_health(
            &self.registry,
            self.config.devices.len(),
            self.dispatcher.queued_count(),
            self.dispatcher.pending_count(),
        )
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Aiguillage d'une Frame lue sur n'importe quel lien
    pub fn handle_frame(&self, frame: Frame) {
        self.state.update(frame.clone());
        match frame.kind {
            FrameKind::Sen => {
                if let Err(e) = self.sink.insert(&frame.origin, frame.kind, &frame.metric_name, &frame.value) {
                    warn!(device = %frame.origin, sink = self.sink.name(), error = %e, "telemetry not persisted");
                }
            }
            FrameKind::Cmd => {
                if let Err(e) = self.dispatcher.submit(&frame) {
                    debug!(device = %frame.origin, error = %e, "command not queued");
                }
            }
            FrameKind::Ack => {
                self.dispatcher.handle_ack(&frame.origin, &frame.metric_name);
            }
        }
    }

    /// Démarre le consommateur du dispatcher, tente une première connexion de
    /// chaque équipement puis lance sa tâche de supervision. Retourne le nombre
    /// d'équipements connectés au démarrage.
    pub fn start(self: &Arc<Self>) -> usize {
        if let Some(consumer) = self.dispatcher.spawn() {
            *self.consumer.lock() = Some(consumer);
        } else {
            warn!("bus already started");
            return self.registry.len();
        }

        let mut tasks = Vec::with_capacity(self.config.devices.len());
        for (device_id, conf) in &self.config.devices {
            let initial = self.connect_device(device_id, conf);
            let supervisor = Arc::clone(self);
            let device_id = device_id.clone();
            let conf = conf.clone();
            tasks.push(tokio::spawn(async move { supervisor.supervise(device_id, conf, initial).await }));
        }
        self.tasks.lock().extend(tasks);

        let connected = self.registry.len();
        info!(connected, configured = self.config.devices.len(), "bus started");
        connected
    }

    fn connect_device(&self, device_id: &str, conf: &DeviceConf) -> Option<SharedLink> {
        match DeviceLink::connect(device_id, conf, self.connector.as_ref()) {
            Ok(link) => {
                let link = Arc::new(link);
                self.registry.insert(link.clone());
                Some(link)
            }
            Err(e) => {
                warn!(device = device_id, error = %e, "device unavailable");
                None
            }
        }
    }

    /// Garde un équipement connecté jusqu'à l'arrêt du bus
    async fn supervise(self: Arc<Self>, device_id: String, conf: DeviceConf, initial: Option<SharedLink>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut link = initial;

        loop {
            if let Some(current) = link.take() {
                if *shutdown.borrow_and_update() {
                    self.registry.remove(&current);
                    current.close().await;
                    break;
                }
                let exit = current.read_loop(|frame| self.handle_frame(frame)).await;
                self.registry.remove(&current);
                current.close().await;
                match exit {
                    LinkExit::Closed if self.is_shutting_down() => break,
                    LinkExit::Closed => info!(device = %device_id, "link closed, reopening"),
                    LinkExit::Failed(e) => warn!(device = %device_id, error = %e, "link lost"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                _ = shutdown.changed() => {}
            }
            if self.is_shutting_down() {
                break;
            }

            debug!(device = %device_id, "reconnecting");
            link = self.connect_device(&device_id, &conf);
            if link.is_some() {
                self.health.increment_reconnects();
                info!(device = %device_id, "device reconnected");
            }
        }
        debug!(device = %device_id, "supervision ended");
    }

    /// Arrêt ordonné : le dispatcher s'arrête avant la fermeture des liens.
    /// Un second appel retourne un rapport vide.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shutdown.send_replace(true) {
            return ShutdownReport::default();
        }
        info!("bus shutting down");

        self.dispatcher.stop();
        let consumer = self.consumer.lock().take();
        let report = match consumer {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                warn!(error = %e, "dispatcher task failed");
                ShutdownReport::default()
            }),
            None => ShutdownReport::default(),
        };

        for link in self.registry.links() {
            link.close().await;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("bus stopped");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{DynSerial, LinkError};
    use crate::sink::MemorySink;
    use ioclean_devkit::{LineBuilder, MockBus};
    use std::collections::BTreeMap;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn config(ids: &[&str]) -> BusConfig {
        let devices: BTreeMap<String, DeviceConf> = ids
            .iter()
            .map(|id| (id.to_string(), DeviceConf { path: format!("/dev/mock/{id}"), baud: 9600 }))
            .collect();
        BusConfig { devices, reconnect_delay_ms: 20, telemetry_log: None, ..BusConfig::default() }
    }

    fn connector(bus: &MockBus) -> Arc<dyn Connector> {
        let bus = bus.clone();
        Arc::new(move |id: &str, conf: &DeviceConf| -> Result<DynSerial, LinkError> {
            bus.open(id)
                .map(|io| Box::new(io) as DynSerial)
                .map_err(|e| LinkError::Connect { device: id.into(), path: conf.path.clone(), reason: e.to_string() })
        })
    }

    #[tokio::test]
    async fn test_frames_are_routed_by_kind() {
        let bus = MockBus::new();
        let mut ele = bus.plug("ele_00");
        let mut ent = bus.plug("ent_00");
        let mut dht = bus.plug("dht_00");
        let sink = Arc::new(MemorySink::new());
        let supervisor = Supervisor::new(config(&["dht_00", "ele_00", "ent_00"]), connector(&bus), sink.clone());
        assert_eq!(supervisor.start(), 3);

        dht.send_line(&LineBuilder::sen("TEM", "22.5")).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while sink.records().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        ent.send_line(&LineBuilder::cmd("FLOOR", "2")).await.unwrap();
        assert_eq!(ele.expect_line(WAIT).await.unwrap(), "CMO,FLOOR,2");
        assert!(supervisor.dispatcher().is_pending("ele_00", "FLOOR"));

        ele.send_line(&LineBuilder::ack("FLOOR", "2")).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while supervisor.dispatcher().is_pending("ele_00", "FLOOR") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!((records[0].device_id.as_str(), records[0].metric_name.as_str()), ("dht_00", "TEM"));
        assert_eq!(supervisor.state().latest().unwrap().kind, FrameKind::Ack);

        let report = supervisor.shutdown().await;
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_device_is_retried_until_plugged() {
        let bus = MockBus::new();
        let _ent = bus.plug("ent_00");
        let supervisor = Supervisor::new(config(&["ele_00", "ent_00"]), connector(&bus), Arc::new(MemorySink::new()));
        assert_eq!(supervisor.start(), 1);
        assert_eq!(supervisor.health().status, "degraded");

        let _ele = bus.plug("ele_00");
        tokio::time::timeout(WAIT, async {
            while !supervisor.registry().contains("ele_00") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(bus.open_attempts("ele_00") >= 2);
        assert_eq!(supervisor.health().status, "ok");

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_link_is_reopened() {
        let bus = MockBus::new();
        let ele = bus.plug("ele_00");
        let supervisor = Supervisor::new(config(&["ele_00"]), connector(&bus), Arc::new(MemorySink::new()));
        supervisor.start();

        let mut replacement = bus.plug("ele_00");
        drop(ele);
        tokio::time::timeout(WAIT, async {
            while supervisor.health().reconnects == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        supervisor.dispatcher().submit_to("test", "ele_00", "FLOOR", "4").unwrap();
        assert_eq!(replacement.expect_line(WAIT).await.unwrap(), "CMO,FLOOR,4");
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_reports_unacked_commands_and_closes_links() {
        let bus = MockBus::new();
        let mut ele = bus.plug("ele_00");
        let supervisor = Supervisor::new(config(&["ele_00"]), connector(&bus), Arc::new(MemorySink::new()));
        supervisor.start();

        let req = supervisor.dispatcher().submit_to("test", "ele_00", "FLOOR", "1").unwrap();
        ele.expect_line(WAIT).await.unwrap();

        let report = supervisor.shutdown().await;
        assert_eq!(report.in_flight.len(), 1);
        assert_eq!(report.in_flight[0].id, req.id);
        assert!(supervisor.registry().is_empty());
        assert!(supervisor.shutdown().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_completes_while_a_device_stops_reading() {
        let bus = MockBus::new();
        let _ele = bus.plug("ele_00");
        let mut cfg = config(&["ele_00"]);
        cfg.dispatch.ack_timeout_ms = 60_000;
        let supervisor = Supervisor::new(cfg, connector(&bus), Arc::new(MemorySink::new()));
        supervisor.start();

        let req = supervisor.dispatcher().submit_to("test", "ele_00", "FLOOR", &"7".repeat(16 * 1024)).unwrap();
        tokio::time::timeout(WAIT, async {
            while !supervisor.dispatcher().is_pending("ele_00", "FLOOR") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let report = tokio::time::timeout(WAIT, supervisor.shutdown()).await.unwrap();
        assert_eq!(report.in_flight.len(), 1);
        assert_eq!(report.in_flight[0].id, req.id);
        assert!(supervisor.registry().is_empty());
    }
}
