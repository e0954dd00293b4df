use crate::routing::{default_routes, Route};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BusConfig {
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConf>,
    #[serde(default = "default_routes")]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub dispatch: DispatchConf,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default)]
    pub http: HttpConf,
    pub telemetry_log: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceConf {
    pub path: String, // ex: "/dev/ttyACM0"
    #[serde(default = "default_baud")]
    pub baud: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConf {
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid device entry {0:?} (expected id=path[:baud])")]
    InvalidDevice(String),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

fn default_baud() -> u32 {
    9600
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

impl Default for DispatchConf {
    fn default() -> Self {
        Self { ack_timeout_ms: 3000, max_retries: 0 }
    }
}

impl DispatchConf {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:5000".into() }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            devices: BTreeMap::new(),
            routes: default_routes(),
            dispatch: DispatchConf::default(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            http: HttpConf::default(),
            telemetry_log: Some("./data/telemetry.jsonl".into()),
        }
    }
}

impl BusConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Applique les surcharges IOCLEAN_* ; une valeur invalide est ignorée avec un warning
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(list) = lookup("IOCLEAN_DEVICES") {
            match parse_devices(&list) {
                Ok(devices) => self.devices = devices,
                Err(e) => warn!("ignoring IOCLEAN_DEVICES: {e}"),
            }
        }
        if let Some(bind) = lookup("IOCLEAN_HTTP_BIND") {
            self.http.bind = bind;
        }
        if let Some(path) = lookup("IOCLEAN_TELEMETRY_LOG") {
            self.telemetry_log = Some(path);
        }
        if let Some(raw) = lookup("IOCLEAN_ACK_TIMEOUT_MS") {
            match parse_number("IOCLEAN_ACK_TIMEOUT_MS", &raw) {
                Ok(ms) => self.dispatch.ack_timeout_ms = ms,
                Err(e) => warn!("{e}"),
            }
        }
        if let Some(raw) = lookup("IOCLEAN_MAX_RETRIES") {
            match parse_number("IOCLEAN_MAX_RETRIES", &raw) {
                Ok(n) => self.dispatch.max_retries = n,
                Err(e) => warn!("{e}"),
            }
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value: raw.to_string() })
}

/// Parse `ele_00=/dev/ttyACM0:9600,ent_00=/dev/ttyUSB0`
pub fn parse_devices(list: &str) -> Result<BTreeMap<String, DeviceConf>, ConfigError> {
    let mut devices = BTreeMap::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let invalid = || ConfigError::InvalidDevice(entry.to_string());
        let (id, target) = entry.split_once('=').ok_or_else(invalid)?;
        let (id, target) = (id.trim(), target.trim());
        if id.is_empty() || target.is_empty() {
            return Err(invalid());
        }
        let conf = match target.rsplit_once(':') {
            Some((path, baud)) if !path.is_empty() && baud.chars().all(|c| c.is_ascii_digit()) => {
                DeviceConf { path: path.to_string(), baud: baud.parse().map_err(|_| invalid())? }
            }
            _ => DeviceConf { path: target.to_string(), baud: default_baud() },
        };
        devices.insert(id.to_string(), conf);
    }
    Ok(devices)
}

pub async fn load_config() -> BusConfig {
    let path = std::env::var("IOCLEAN_CONFIG").unwrap_or_else(|_| "bus.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            BusConfig::default()
        } else {
            serde_yaml::from_str(&txt).unwrap_or_else(|e| {
                warn!("invalid config {path}: {e}");
                BusConfig::default()
            })
        }
    } else {
        warn!("no {path}, using default config");
        BusConfig::default()
    };
    cfg.apply_env(|key| std::env::var(key).ok());
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_devices() {
        let devices = parse_devices("ele_00=/dev/ttyACM0:115200, ent_00=/dev/ttyUSB0").unwrap();
        assert_eq!(devices["ele_00"], DeviceConf { path: "/dev/ttyACM0".into(), baud: 115200 });
        assert_eq!(devices["ent_00"], DeviceConf { path: "/dev/ttyUSB0".into(), baud: 9600 });

        let devices = parse_devices("cur_00=COM3").unwrap();
        assert_eq!(devices["cur_00"].path, "COM3");
    }

    #[test]
    fn test_parse_devices_rejects_malformed() {
        assert!(matches!(parse_devices("ele_00"), Err(ConfigError::InvalidDevice(_))));
        assert!(matches!(parse_devices("=/dev/ttyACM0"), Err(ConfigError::InvalidDevice(_))));
        assert!(matches!(parse_devices("ele_00=/dev/tty:99999999999"), Err(ConfigError::InvalidDevice(_))));
    }

    #[test]
    fn test_yaml_defaults() {
        let yaml = "devices:\n  ele_00:\n    path: /dev/ttyACM0\n";
        let cfg: BusConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.devices["ele_00"].baud, 9600);
        assert_eq!(cfg.routes, default_routes());
        assert_eq!(cfg.dispatch.ack_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.dispatch.max_retries, 0);
        assert_eq!(cfg.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(cfg.http.bind, "0.0.0.0:5000");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("IOCLEAN_DEVICES", "ele_00=/dev/ttyACM1"),
            ("IOCLEAN_ACK_TIMEOUT_MS", "250"),
            ("IOCLEAN_MAX_RETRIES", "two"),
        ]);
        let mut cfg = BusConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.devices.len(), 1);
        assert_eq!(cfg.devices["ele_00"].path, "/dev/ttyACM1");
        assert_eq!(cfg.dispatch.ack_timeout_ms, 250);
        // valeur invalide ignorée
        assert_eq!(cfg.dispatch.max_retries, 0);
    }
}
