/**
 * TELEMETRY SINK - Persistance des lectures SEN
 *
 * RÔLE :
 * Chaque Frame SEN reçue est confiée à un sink. Le bus ne connaît que le
 * trait LogSink ; le stockage concret est choisi au démarrage.
 *
 * FONCTIONNEMENT :
 * - JsonlSink = une ligne JSON par lecture, ajoutée en fin de fichier
 * - MemorySink = lectures gardées en mémoire (tests, mode sans disque)
 * - Une erreur de sink est loggée par l'appelant, jamais propagée au lien série
 */

use crate::frame::FrameKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Une lecture capteur horodatée à la réception
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub device_id: String,
    pub data_type: String,
    pub metric_name: String,
    pub value: String,
}

impl TelemetryRecord {
    pub fn new(device_id: &str, kind: FrameKind, metric_name: &str, value: &str) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            device_id: device_id.to_string(),
            data_type: kind.as_str().to_string(),
            metric_name: metric_name.to_string(),
            value: value.to_string(),
        }
    }
}

pub trait LogSink: Send + Sync {
    fn insert(&self, device_id: &str, kind: FrameKind, metric_name: &str, value: &str) -> Result<(), SinkError>;

    fn name(&self) -> &'static str;
}

/// Fichier JSON Lines en ajout seul
pub struct JsonlSink {
    storage_path: PathBuf,
    // sérialise les ajouts concurrents de plusieurs liens
    file_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(storage_path: P) -> Result<Self, SinkError> {
        let storage_path = storage_path.into();
        if let Some(parent) = storage_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        tracing::info!(path = %storage_path.display(), "telemetry sink ready");
        Ok(Self { storage_path, file_lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &PathBuf {
        &self.storage_path
    }
}

impl LogSink for JsonlSink {
    fn insert(&self, device_id: &str, kind: FrameKind, metric_name: &str, value: &str) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(&TelemetryRecord::new(device_id, kind, metric_name, value))?;
        line.push('\n');

        let _guard = self.file_lock.lock();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.storage_path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().clone()
    }
}

impl LogSink for MemorySink {
    fn insert(&self, device_id: &str, kind: FrameKind, metric_name: &str, value: &str) -> Result<(), SinkError> {
        self.records.lock().push(TelemetryRecord::new(device_id, kind, metric_name, value));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_appends_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/telemetry.jsonl");
        let sink = JsonlSink::new(&path).unwrap();

        sink.insert("dht_00", FrameKind::Sen, "TEM", "22.5").unwrap();
        sink.insert("dht_00", FrameKind::Sen, "HUM", "41").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let records: Vec<TelemetryRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].metric_name, "TEM");
        assert_eq!(records[0].data_type, "SEN");
        assert_eq!(records[1].value, "41");
        assert!(records[0].timestamp <= records[1].timestamp);
    }

    #[test]
    fn test_jsonl_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.jsonl");
        JsonlSink::new(&path).unwrap().insert("dht_00", FrameKind::Sen, "TEM", "20").unwrap();
        JsonlSink::new(&path).unwrap().insert("dht_00", FrameKind::Sen, "TEM", "21").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.insert("ele_00", FrameKind::Sen, "FLOOR", "3").unwrap();
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device_id, "ele_00");
        assert_eq!(sink.name(), "memory");
    }
}
