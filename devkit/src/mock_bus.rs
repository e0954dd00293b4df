/*!
Banc de test multi-équipements

MockBus joue le rôle du système d'exploitation : chaque `plug()` branche un
équipement simulé, chaque `open()` (appelé par le connecteur du bus) consomme
le prochain branchement de cet id. Un id sans branchement disponible échoue,
ce qui permet de tester reconnexions et équipements absents.
*/

use crate::mock_serial::MockSerial;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::DuplexStream;

#[derive(Default)]
struct BusInner {
    plugged: HashMap<String, VecDeque<DuplexStream>>,
    attempts: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct MockBus {
    inner: Arc<Mutex<BusInner>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Branche un équipement ; il sera servi au prochain open() de cet id
    pub fn plug(&self, device_id: &str) -> MockSerial {
        let (host, device) = MockSerial::pair(device_id);
        self.inner
            .lock()
            .plugged
            .entry(device_id.to_string())
            .or_default()
            .push_back(host);
        log::debug!("[mock-bus] plugged {device_id}");
        device
    }

    /// Ouverture côté bus, à appeler depuis un connecteur
    pub fn open(&self, device_id: &str) -> Result<DuplexStream> {
        let mut inner = self.inner.lock();
        *inner.attempts.entry(device_id.to_string()).or_default() += 1;
        match inner.plugged.get_mut(device_id).and_then(VecDeque::pop_front) {
            Some(host) => Ok(host),
            None => bail!("no device plugged as {device_id}"),
        }
    }

    pub fn open_attempts(&self, device_id: &str) -> usize {
        self.inner.lock().attempts.get(device_id).copied().unwrap_or(0)
    }
}
