/*!
Équipement série simulé

Un MockSerial est l'extrémité "équipement" d'un tube mémoire. L'autre
extrémité (DuplexStream) est donnée au bus comme s'il s'agissait d'un port
série ouvert. Le test écrit des lignes SEN/CMD/ACK et lit les commandes CMO.
*/

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

const PIPE_CAPACITY: usize = 4096;

pub struct MockSerial {
    device_id: String,
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    // octets d'une ligne pas encore terminée (lecture interrompue par un timeout)
    partial: Vec<u8>,
}

impl MockSerial {
    /// Retourne (côté bus, côté équipement)
    pub fn pair(device_id: &str) -> (DuplexStream, MockSerial) {
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        let (reader, writer) = tokio::io::split(device);
        let mock = MockSerial {
            device_id: device_id.to_string(),
            reader: BufReader::new(reader),
            writer,
            partial: Vec::new(),
        };
        (host, mock)
    }

    /// Émet une ligne, terminateur `\n` ajouté
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.send_raw(format!("{line}\n").as_bytes()).await
    }

    /// Émet des octets tels quels (lignes invalides, UTF-8 cassé, fragments)
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .await
            .with_context(|| format!("{} failed to write", self.device_id))?;
        self.writer.flush().await?;
        log::debug!("[{}] -> {:?}", self.device_id, String::from_utf8_lossy(bytes));
        Ok(())
    }

    /// Lit la prochaine ligne ; `None` si le bus a fermé le tube
    async fn next_line(&mut self) -> Result<Option<String>> {
        let n = self.reader.read_until(b'\n', &mut self.partial).await?;
        if n == 0 && self.partial.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.partial).trim_end_matches(['\r', '\n']).to_string();
        self.partial.clear();
        log::debug!("[{}] <- {:?}", self.device_id, line);
        Ok(Some(line))
    }

    /// Attend une ligne écrite par le bus
    pub async fn expect_line(&mut self, wait: Duration) -> Result<String> {
        match timeout(wait, self.next_line()).await {
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => bail!("{}: link closed while waiting for a line", self.device_id),
            Ok(Err(e)) => Err(e),
            Err(_) => bail!("{}: no line within {:?}", self.device_id, wait),
        }
    }

    /// Vérifie que le bus n'écrit rien pendant `wait` (un tube fermé compte comme silence)
    pub async fn expect_silence(&mut self, wait: Duration) -> Result<()> {
        match timeout(wait, self.next_line()).await {
            Err(_) | Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some(line))) => bail!("{}: unexpected line {:?}", self.device_id, line),
            Ok(Err(e)) => Err(e),
        }
    }
}

/// Lignes du protocole côté équipement
pub struct LineBuilder;

impl LineBuilder {
    pub fn sen(metric: &str, value: &str) -> String {
        format!("SEN,{metric},{value}")
    }

    pub fn cmd(metric: &str, value: &str) -> String {
        format!("CMD,{metric},{value}")
    }

    pub fn ack(metric: &str, value: &str) -> String {
        format!("ACK,{metric},{value}")
    }

    /// Commande telle que le bus doit l'écrire vers l'équipement cible
    pub fn cmo(metric: &str, value: &str) -> String {
        format!("CMO,{metric},{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_lines_flow_both_ways() {
        let (mut host, mut device) = MockSerial::pair("ele_00");

        device.send_line(&LineBuilder::ack("FLOOR", "1")).await.unwrap();
        let mut buf = [0u8; 12];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ACK,FLOOR,1\n");

        host.write_all(b"CMO,FLOOR,2\r\n").await.unwrap();
        assert_eq!(device.expect_line(Duration::from_millis(200)).await.unwrap(), "CMO,FLOOR,2");
    }

    #[tokio::test]
    async fn test_expect_silence() {
        let (mut host, mut device) = MockSerial::pair("cur_00");
        device.expect_silence(Duration::from_millis(50)).await.unwrap();

        host.write_all(b"CMO,MOTOR,OPEN\n").await.unwrap();
        assert!(device.expect_silence(Duration::from_millis(50)).await.is_err());

        drop(host);
        device.expect_silence(Duration::from_millis(50)).await.unwrap();
        assert!(device.expect_line(Duration::from_millis(50)).await.is_err());
    }

    #[tokio::test]
    async fn test_line_split_across_writes() {
        let (mut host, mut device) = MockSerial::pair("dht_00");
        host.write_all(b"CMO,MO").await.unwrap();
        assert!(device.expect_line(Duration::from_millis(50)).await.is_err());
        host.write_all(b"DE,AUTO\n").await.unwrap();
        assert_eq!(device.expect_line(Duration::from_millis(200)).await.unwrap(), "CMO,MODE,AUTO");
    }
}
