/**
 * FRAME - Protocole ligne des équipements série
 *
 * RÔLE : Transforme une ligne brute `KIND,METRIC,VALUE` en Frame typée.
 * Les équipements émettent SEN (télémétrie), CMD (demande de commande)
 * et ACK (acquittement). Les commandes sortantes utilisent le préfixe CMO.
 */

use serde::Serialize;
use std::fmt;

/// Préfixe des commandes écrites vers un équipement (les équipements attendent CMO, pas CMD)
pub const OUTBOUND_PREFIX: &str = "CMO";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameKind {
    /// Télémétrie capteur
    Sen,
    /// Demande de commande vers un autre équipement
    Cmd,
    /// Acquittement d'une commande reçue
    Ack,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Sen => "SEN",
            FrameKind::Cmd => "CMD",
            FrameKind::Ack => "ACK",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Une ligne décodée du protocole, avec l'équipement dont le lien l'a lue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub origin: String,
    pub kind: FrameKind,
    pub metric_name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("expected 3 comma-separated fields, got {0}")]
    FieldCount(usize),
    #[error("unknown frame kind: {0:?}")]
    UnknownKind(String),
    #[error("empty {0} field")]
    EmptyField(&'static str),
}

/// Décode une ligne brute du fil ; les séquences UTF-8 invalides sont supprimées
pub fn decode_line(bytes: &[u8]) -> String {
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}

/// Parse `kind,metric_name,value` ; aucune Frame partielle n'est jamais produite
pub fn parse(raw_line: &str, origin: &str) -> Result<Frame, ParseError> {
    let fields: Vec<&str> = raw_line.split(',').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(ParseError::FieldCount(fields.len()));
    }

    let kind = match fields[0].to_ascii_uppercase().as_str() {
        "SEN" => FrameKind::Sen,
        "CMD" => FrameKind::Cmd,
        "ACK" => FrameKind::Ack,
        _ => return Err(ParseError::UnknownKind(fields[0].to_string())),
    };
    if fields[1].is_empty() {
        return Err(ParseError::EmptyField("metric_name"));
    }
    if fields[2].is_empty() {
        return Err(ParseError::EmptyField("value"));
    }

    Ok(Frame {
        origin: origin.to_string(),
        kind,
        metric_name: fields[1].to_string(),
        value: fields[2].to_string(),
    })
}

/// Un champ sortant ne doit ni créer un 4e champ ni terminer la ligne
pub fn is_wire_safe(field: &str) -> bool {
    !field.is_empty() && !field.contains([',', '\r', '\n'])
}

/// Rend la ligne de commande sortante, sans terminateur
pub fn render_command(metric_name: &str, value: &str) -> String {
    format!("{OUTBOUND_PREFIX},{metric_name},{value}")
}
