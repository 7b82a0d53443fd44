pub(crate) mod error;
pub mod local;

pub use error::Error;
pub use local::{Fault, LocalNetwork, LocalNode};

use async_trait::async_trait;
use protocol::{Envelope, PublicKey};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Answers a raw request of one protocol with a raw response.
pub type RequestHandler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// The node's view of the p2p layer: topics keyed by public key, plus
/// request/response protocols keyed by protocol id.
#[async_trait]
pub trait Network: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    async fn subscribe(&self, public_key: &PublicKey) -> Result<(), Error>;

    async fn unsubscribe(&self, public_key: &PublicKey) -> Result<(), Error>;

    /// Publishes on the topic of the envelope's public key.
    async fn broadcast(&self, envelope: Envelope) -> Result<(), Error>;

    /// Remote peers currently subscribed to the topic of `public_key`, in a stable order.
    fn peers(&self, public_key: &PublicKey) -> Vec<PeerId>;

    fn register_handler(&self, protocol: &str, handler: RequestHandler);

    async fn request(
        &self,
        peer: &PeerId,
        protocol: &str,
        request: Vec<u8>,
    ) -> Result<Vec<u8>, Error>;
}
