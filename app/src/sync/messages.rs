use protocol::{Identifier, SignedConsensusMessage};
use serde_derive::{Deserialize, Serialize};
use strum::AsRefStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr)]
pub enum SyncProtocol {
    #[strum(serialize = "/dv/sync/decided/last/0.0.1")]
    LastDecided,
    #[strum(serialize = "/dv/sync/decided/history/0.0.1")]
    DecidedHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum StatusCode {
    Success,
    NotFound,
    BadRequest,
    InternalError,
}

/// Request and response of both sync protocols.
///
/// Requests leave `data` empty and `status` at `Success`. `heights` is empty
/// for last decided requests and `[from, to]` for history requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub protocol: SyncProtocol,
    pub identifier: Identifier,
    pub heights: Vec<u64>,
    pub data: Vec<SignedConsensusMessage>,
    pub status: StatusCode,
}

impl SyncMessage {
    pub fn last_decided(identifier: Identifier) -> Self {
        Self {
            protocol: SyncProtocol::LastDecided,
            identifier,
            heights: vec![],
            data: vec![],
            status: StatusCode::Success,
        }
    }

    pub fn history(identifier: Identifier, from: u64, to: u64) -> Self {
        Self {
            protocol: SyncProtocol::DecidedHistory,
            identifier,
            heights: vec![from, to],
            data: vec![],
            status: StatusCode::Success,
        }
    }

    /// Turns a request into its response.
    pub fn respond(mut self, status: StatusCode, data: Vec<SignedConsensusMessage>) -> Self {
        self.status = status;
        self.data = data;
        self
    }

    pub fn range(&self) -> Option<(u64, u64)> {
        match self.heights.as_slice() {
            [from, to] => Some((*from, *to)),
            _ => None,
        }
    }
}
