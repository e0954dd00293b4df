/**
 * DEVICE LINK - Propriétaire d'une connexion série vers un équipement
 *
 * RÔLE :
 * Un DeviceLink possède le transport d'un seul équipement (ascenseur, entrée,
 * rideau, capteur climat). Il lit des lignes, les passe au parser et écrit
 * les commandes CMO sous un verrou d'écriture unique.
 *
 * FONCTIONNEMENT :
 * - Connector = fabrique de transports (port série réel ou tube mémoire en test)
 * - read_loop = boucle de lecture ; une ligne invalide est loggée puis ignorée
 * - une ligne de plus de MAX_LINE_LEN octets est jetée jusqu'au prochain `\n`
 * - EOF / erreur I/O = fin de boucle avec LinkExit::Failed (le superviseur reconnecte)
 * - close() = arrêt de la boucle + libération du transport, idempotent
 */

use crate::config::DeviceConf;
use crate::frame::{self, Frame};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

/// Tout flux async bidirectionnel utilisable comme port série
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> SerialIo for T {}

pub type DynSerial = Box<dyn SerialIo>;

/// Longueur maximale d'une ligne reçue, terminateur compris
pub const MAX_LINE_LEN: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to open {path} for {device}: {reason}")]
    Connect { device: String, path: String, reason: String },
    #[error("link {0} is not open")]
    NotOpen(String),
    #[error("IO error on {device}: {source}")]
    Io {
        device: String,
        #[source]
        source: std::io::Error,
    },
}

/// Ouvre le transport d'un équipement
pub trait Connector: Send + Sync + 'static {
    fn open(&self, device_id: &str, conf: &DeviceConf) -> Result<DynSerial, LinkError>;
}

impl<F> Connector for F
where
    F: Fn(&str, &DeviceConf) -> Result<DynSerial, LinkError> + Send + Sync + 'static,
{
    fn open(&self, device_id: &str, conf: &DeviceConf) -> Result<DynSerial, LinkError> {
        self(device_id, conf)
    }
}

/// Ports série réels via tokio-serial, 8N1 sans contrôle de flux
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(&self, device_id: &str, conf: &DeviceConf) -> Result<DynSerial, LinkError> {
        let port = tokio_serial::new(&conf.path, conf.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| LinkError::Connect {
                device: device_id.to_string(),
                path: conf.path.clone(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(port))
    }
}

/// Raison de sortie d'une boucle de lecture
#[derive(Debug)]
pub enum LinkExit {
    /// close() a été appelé
    Closed,
    /// Le transport a lâché (EOF ou erreur I/O)
    Failed(LinkError),
}

pub struct DeviceLink {
    device_id: String,
    reader: Mutex<Option<ReadHalf<DynSerial>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<DynSerial>>>,
    closed: watch::Sender<bool>,
}

impl DeviceLink {
    pub fn connect(device_id: &str, conf: &DeviceConf, connector: &dyn Connector) -> Result<Self, LinkError> {
        let io = connector.open(device_id, conf)?;
        info!(device = device_id, path = %conf.path, baud = conf.baud, "serial link opened");
        Ok(Self::from_transport(device_id, io))
    }

    pub fn from_transport(device_id: &str, io: DynSerial) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let (closed, _) = watch::channel(false);
        Self {
            device_id: device_id.to_string(),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Lit les lignes jusqu'à close() ou perte du transport.
    /// Une seule boucle par lien : un second appel retourne Closed immédiatement.
    pub async fn read_loop<F>(&self, mut on_frame: F) -> LinkExit
    where
        F: FnMut(Frame),
    {
        let Some(reader) = self.reader.lock().take() else {
            return LinkExit::Closed;
        };
        let mut reader = BufReader::new(reader);
        let mut closed = self.closed.subscribe();
        let mut buf = Vec::with_capacity(128);
        let mut oversized = false;

        loop {
            if *closed.borrow_and_update() {
                return LinkExit::Closed;
            }
            buf.clear();
            let mut limited = (&mut reader).take(MAX_LINE_LEN as u64);
            tokio::select! {
                res = limited.read_until(b'\n', &mut buf) => match res {
                    Ok(0) => {
                        return LinkExit::Failed(LinkError::Io {
                            device: self.device_id.clone(),
                            source: std::io::ErrorKind::UnexpectedEof.into(),
                        });
                    }
                    Ok(_) => self.accept_chunk(&buf, &mut oversized, &mut on_frame),
                    Err(source) => {
                        return LinkExit::Failed(LinkError::Io { device: self.device_id.clone(), source });
                    }
                },
                _ = closed.changed() => return LinkExit::Closed,
            }
        }
    }

    fn accept_chunk<F: FnMut(Frame)>(&self, chunk: &[u8], oversized: &mut bool, on_frame: &mut F) {
        let terminated = chunk.last() == Some(&b'\n');
        if *oversized {
            *oversized = !terminated;
            return;
        }
        if !terminated && chunk.len() >= MAX_LINE_LEN {
            warn!(device = %self.device_id, limit = MAX_LINE_LEN, "discarding oversized line");
            *oversized = true;
            return;
        }
        self.handle_line(chunk, on_frame);
    }

    fn handle_line<F: FnMut(Frame)>(&self, raw: &[u8], on_frame: &mut F) {
        let decoded = frame::decode_line(raw);
        let line = decoded.trim();
        if line.is_empty() {
            return;
        }
        debug!(device = %self.device_id, line, "received");
        match frame::parse(line, &self.device_id) {
            Ok(frame) => on_frame(frame),
            Err(e) => warn!(device = %self.device_id, line, error = %e, "skipping malformed line"),
        }
    }

    /// Écrit une commande suivie de `\n` ; atomique vis-à-vis des autres écrivains du lien
    pub async fn write(&self, command: &str) -> Result<(), LinkError> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(w) if self.is_open() => w,
            _ => return Err(LinkError::NotOpen(self.device_id.clone())),
        };
        let line = format!("{command}\n");
        let io_err = |source| LinkError::Io { device: self.device_id.clone(), source };
        writer.write_all(line.as_bytes()).await.map_err(io_err)?;
        writer.flush().await.map_err(io_err)?;
        debug!(device = %self.device_id, command, "sent");
        Ok(())
    }

    pub async fn close(&self) {
        let was_open = !self.closed.send_replace(true);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        // si aucune boucle ne tourne, la moitié lecture est encore ici
        drop(self.reader.lock().take());
        if was_open {
            info!(device = %self.device_id, "serial link closed");
        }
    }
}

pub type SharedLink = Arc<DeviceLink>;

#[cfg(test)]
mod tests {
    use super::*;
    use ioclean_devkit::MockSerial;
    use std::time::Duration;

    fn mock_link(id: &str) -> (Arc<DeviceLink>, MockSerial) {
        let (host, device) = MockSerial::pair(id);
        (Arc::new(DeviceLink::from_transport(id, Box::new(host))), device)
    }

    #[tokio::test]
    async fn test_read_loop_skips_bad_lines_and_keeps_going() {
        let (link, mut device) = mock_link("dht_00");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reader = {
            let link = link.clone();
            tokio::spawn(async move { link.read_loop(move |f| { let _ = tx.send(f); }).await })
        };

        device.send_line("SEN,TEM,22.5,HUM,41").await.unwrap();
        device.send_line("   ").await.unwrap();
        device.send_raw(b"SEN,HUM,4\xff1\n").await.unwrap();
        device.send_line("garbage").await.unwrap();
        device.send_line("ack,FLOOR,1").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!((first.metric_name.as_str(), first.value.as_str()), ("HUM", "41"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, crate::frame::FrameKind::Ack);
        assert_eq!(second.origin, "dht_00");

        link.close().await;
        assert!(matches!(reader.await.unwrap(), LinkExit::Closed));
    }

    #[tokio::test]
    async fn test_oversized_line_is_dropped_whole() {
        let (link, mut device) = mock_link("dht_00");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reader = {
            let link = link.clone();
            tokio::spawn(async move { link.read_loop(move |f| { let _ = tx.send(f); }).await })
        };

        // la fin de la ligne trop longue ressemble à une trame valide : elle doit être jetée aussi
        let mut noise = vec![b'A'; MAX_LINE_LEN + 100];
        noise.extend_from_slice(b"SEN,HUM,2\n");
        device.send_raw(&noise).await.unwrap();
        device.send_raw(&vec![b'B'; MAX_LINE_LEN * 3]).await.unwrap();
        device.send_raw(b"\nSEN,TEM,21\n").await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!((frame.metric_name.as_str(), frame.value.as_str()), ("TEM", "21"));
        assert!(link.is_open());

        link.close().await;
        assert!(matches!(reader.await.unwrap(), LinkExit::Closed));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_appends_terminator() {
        let (link, mut device) = mock_link("ele_00");
        link.write("CMO,FLOOR,2").await.unwrap();
        assert_eq!(device.expect_line(Duration::from_secs(1)).await.unwrap(), "CMO,FLOOR,2");
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_interleave() {
        let (link, mut device) = mock_link("ele_00");
        let writers: Vec<_> = (0..10)
            .map(|i| {
                let link = link.clone();
                tokio::spawn(async move { link.write(&format!("CMO,FLOOR,{i}")).await })
            })
            .collect();
        for w in writers {
            w.await.unwrap().unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(device.expect_line(Duration::from_secs(1)).await.unwrap());
        }
        seen.sort();
        let mut expected: Vec<String> = (0..10).map(|i| format!("CMO,FLOOR,{i}")).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_device_hangup_fails_the_loop() {
        let (link, device) = mock_link("ent_00");
        drop(device);
        let exit = link.read_loop(|_| {}).await;
        assert!(matches!(exit, LinkExit::Failed(LinkError::Io { .. })));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_writes() {
        let (link, _device) = mock_link("cur_00");
        link.close().await;
        link.close().await;
        assert!(!link.is_open());
        assert!(matches!(link.write("CMO,MOTOR,OPEN").await, Err(LinkError::NotOpen(_))));
        assert!(matches!(link.read_loop(|_| {}).await, LinkExit::Closed));
    }

    #[tokio::test]
    async fn test_connector_closure() {
        let connector = |id: &str, conf: &DeviceConf| -> Result<DynSerial, LinkError> {
            Err(LinkError::Connect { device: id.into(), path: conf.path.clone(), reason: "busy".into() })
        };
        let conf = DeviceConf { path: "/dev/ttyACM9".into(), baud: 9600 };
        let err = DeviceLink::connect("ele_00", &conf, &connector).err().unwrap();
        assert!(err.to_string().contains("/dev/ttyACM9"));
    }
}
