use parking_lot::RwLock;
use protocol::{Decode, Encode, Identifier, SignedConsensusMessage};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use strum::IntoStaticStr;
use thiserror::Error;
use tracing::*;

#[derive(Error, Debug)]
pub enum Error {
    #[error("DB write error")]
    DbWriteError,
    #[error("DB read error")]
    DbReadError,
    #[error("Batch mixes identifiers {0} and {1}")]
    MixedBatch(Identifier, Identifier),
    #[error("Codec error: {0}")]
    CodecError(#[from] protocol::Error),
}

/// Durable log of decided messages per identifier, plus the last decided pointer.
///
/// A single `save_decided` call is all-or-nothing.
pub trait DecidedStore: Send + Sync {
    fn save_decided(&self, messages: &[SignedConsensusMessage]) -> Result<(), Error>;
    fn save_last_decided(&self, message: &SignedConsensusMessage) -> Result<(), Error>;
    fn get_last_decided(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<SignedConsensusMessage>, Error>;
    /// Stored messages with `from <= height <= to`, ordered by height.
    fn get_decided_range(
        &self,
        identifier: &Identifier,
        from: u64,
        to: u64,
    ) -> Result<Vec<SignedConsensusMessage>, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, IntoStaticStr)]
pub enum DbColumn {
    #[strum(serialize = "dcd")]
    Decided,
    #[strum(serialize = "lst")]
    LastDecided,
}

pub enum KeyValueStoreOp {
    PutKeyValue(Vec<u8>, Vec<u8>),
}

pub fn get_key_for_col(column: &str, key: &[u8]) -> Vec<u8> {
    let mut result = column.as_bytes().to_vec();
    result.extend_from_slice(key);
    result
}

// length-prefixed so identifiers with different key sizes never share a prefix
fn identifier_key(identifier: &Identifier) -> Vec<u8> {
    let pk = identifier.public_key.as_bytes();
    let mut key = Vec::with_capacity(pk.len() + 2);
    key.push(pk.len() as u8);
    key.extend_from_slice(pk);
    key.push(identifier.role as u8);
    key
}

fn decided_key(identifier: &Identifier, height: u64) -> Vec<u8> {
    let mut key = identifier_key(identifier);
    key.extend_from_slice(&height.to_be_bytes());
    get_key_for_col(DbColumn::Decided.into(), &key)
}

fn last_decided_key(identifier: &Identifier) -> Vec<u8> {
    get_key_for_col(DbColumn::LastDecided.into(), &identifier_key(identifier))
}

/// In-memory key value store, used by tests and the local devnet.
#[derive(Default)]
pub struct MemoryStore {
    db: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn commit_ops(&self, ops: Vec<KeyValueStoreOp>) -> Result<(), Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::DbWriteError);
        }
        let mut db = self.db.write();
        for op in ops {
            match op {
                KeyValueStoreOp::PutKeyValue(key, value) => {
                    db.insert(key, value);
                }
            }
        }
        Ok(())
    }

    fn get_bytes(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db.read().get(key).cloned()
    }
}

impl DecidedStore for MemoryStore {
    fn save_decided(&self, messages: &[SignedConsensusMessage]) -> Result<(), Error> {
        let Some(first) = messages.first() else {
            return Ok(());
        };
        // encode everything up front, nothing is written if any message fails
        let ops = messages
            .iter()
            .map(|msg| {
                if msg.identifier != first.identifier {
                    return Err(Error::MixedBatch(
                        first.identifier.clone(),
                        msg.identifier.clone(),
                    ));
                }
                Ok(KeyValueStoreOp::PutKeyValue(
                    decided_key(&msg.identifier, msg.height),
                    msg.encode()?,
                ))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        trace!(identifier = %first.identifier, count = ops.len(), "Saving decided messages");
        self.commit_ops(ops)
    }

    fn save_last_decided(&self, message: &SignedConsensusMessage) -> Result<(), Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::DbWriteError);
        }
        let bytes = message.encode()?;
        let pointer_key = last_decided_key(&message.identifier);

        let mut db = self.db.write();
        let current = db
            .get(&pointer_key)
            .map(|raw| SignedConsensusMessage::decode(raw))
            .transpose()
            .map_err(|_| Error::DbReadError)?
            .map(|msg| msg.height);

        // the pointer always references an entry of the log and never moves back
        db.entry(decided_key(&message.identifier, message.height))
            .or_insert_with(|| bytes.clone());
        if current.map_or(true, |height| message.height > height) {
            db.insert(pointer_key, bytes);
        } else {
            trace!(
                identifier = %message.identifier,
                height = message.height,
                ?current,
                "Last decided pointer not moved"
            );
        }
        Ok(())
    }

    fn get_last_decided(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<SignedConsensusMessage>, Error> {
        self.get_bytes(&last_decided_key(identifier))
            .map(|bytes| SignedConsensusMessage::decode(&bytes))
            .transpose()
            .map_err(|_| Error::DbReadError)
    }

    fn get_decided_range(
        &self,
        identifier: &Identifier,
        from: u64,
        to: u64,
    ) -> Result<Vec<SignedConsensusMessage>, Error> {
        if from > to {
            return Ok(vec![]);
        }
        let start = decided_key(identifier, from);
        let end = decided_key(identifier, to);
        self.db
            .read()
            .range(start..=end)
            .map(|(_, bytes)| {
                SignedConsensusMessage::decode(bytes).map_err(|_| Error::DbReadError)
            })
            .collect()
    }
}
