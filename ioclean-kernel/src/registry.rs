use crate::link::SharedLink;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// device_id → lien ouvert. Un équipement n'y figure que tant que son lien est ouvert.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    links: Arc<RwLock<BTreeMap<String, SharedLink>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, link: SharedLink) {
        self.links.write().insert(link.device_id().to_string(), link);
    }

    /// Retire le lien seulement s'il s'agit encore du même (une reconnexion a pu le remplacer)
    pub fn remove(&self, link: &SharedLink) -> bool {
        let mut links = self.links.write();
        match links.get(link.device_id()) {
            Some(current) if Arc::ptr_eq(current, link) => {
                links.remove(link.device_id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<SharedLink> {
        self.links.read().get(device_id).cloned()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.links.read().contains_key(device_id)
    }

    /// Ids triés des équipements actuellement connectés
    pub fn device_ids(&self) -> Vec<String> {
        self.links.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    pub fn links(&self) -> Vec<SharedLink> {
        self.links.read().values().cloned().collect()
    }
}
