use crate::network::PeerId;
use thiserror::Error;

#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Request to {0} timed out")]
    Timeout(PeerId),
    #[error("Peer {0} is unreachable")]
    PeerUnreachable(PeerId),
    #[error("Peer {peer} has no handler for {protocol}")]
    NoHandler { peer: PeerId, protocol: String },
    #[error("Codec error: {0}")]
    CodecError(#[from] protocol::Error),
}
