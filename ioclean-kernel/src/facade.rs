use crate::dispatcher::{DispatchError, SharedDispatcher};
use crate::frame::Frame;
use crate::state::SystemState;
use serde::Serialize;
use uuid::Uuid;

/// Requérant utilisé pour les commandes qui ne viennent pas d'un lien série
pub const API_REQUESTER: &str = "api";

/// Dernière lecture, champs vides tant qu'aucune Frame n'a été reçue
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct LatestReading {
    pub device_id: String,
    pub data_type: String,
    pub metric_name: String,
    pub value: String,
}

impl From<&Frame> for LatestReading {
    fn from(frame: &Frame) -> Self {
        Self {
            device_id: frame.origin.clone(),
            data_type: frame.kind.as_str().to_string(),
            metric_name: frame.metric_name.clone(),
            value: frame.value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub request_id: Uuid,
    pub device_id: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),
    #[error("invalid parameter: {0} must not contain ',' or line breaks")]
    InvalidParameter(&'static str),
    #[error("device not found: {0}")]
    UnknownDevice(String),
    #[error("command bus is stopped")]
    Unavailable,
}

/// Point d'entrée externe : lecture de l'état et soumission de commandes
#[derive(Clone)]
pub struct StateFacade {
    state: SystemState,
    dispatcher: SharedDispatcher,
}

impl StateFacade {
    pub fn new(state: SystemState, dispatcher: SharedDispatcher) -> Self {
        Self { state, dispatcher }
    }

    pub fn read_latest(&self) -> Option<Frame> {
        self.state.latest()
    }

    pub fn latest_reading(&self) -> LatestReading {
        self.read_latest().as_ref().map(LatestReading::from).unwrap_or_default()
    }

    /// Passe par la même file que les CMD série ; la cible est explicite
    pub fn submit_command(&self, device_id: &str, metric_name: &str, value: &str) -> Result<Accepted, Rejected> {
        let device_id = device_id.trim();
        let metric_name = metric_name.trim();
        let value = value.trim();
        if device_id.is_empty() {
            return Err(Rejected::MissingParameter("device_id"));
        }
        if metric_name.is_empty() {
            return Err(Rejected::MissingParameter("metric_name"));
        }
        if value.is_empty() {
            return Err(Rejected::MissingParameter("value"));
        }

        match self.dispatcher.submit_to(API_REQUESTER, device_id, metric_name, value) {
            Ok(request) => Ok(Accepted {
                request_id: request.id,
                device_id: request.target,
                command: request.wire_command,
            }),
            Err(DispatchError::UnknownDevice(id)) => Err(Rejected::UnknownDevice(id)),
            Err(DispatchError::InvalidField(field)) => Err(Rejected::InvalidParameter(field)),
            Err(_) => Err(Rejected::Unavailable),
        }
    }
}
