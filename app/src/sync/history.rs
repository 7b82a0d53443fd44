use super::messages::{StatusCode, SyncMessage};
use super::validation::{combine, IdentifierCheck, Pipeline};
use super::Error;
use crate::config::SyncConfig;
use crate::metrics::{LAST_DECIDED_HEIGHT, SYNC_DECIDED_MESSAGES, SYNC_RUNS};
use crate::network::{self, Network, PeerId};
use crate::store::DecidedStore;
use futures::future::join_all;
use protocol::{Decode, Encode, Identifier, SignedConsensusMessage};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Decided sync requester.
///
/// Asks the peers subscribed to an identifier's topic for their last decided
/// message, then pulls the missing heights page by page and persists every
/// complete page. Syncs of the same identifier never overlap.
pub struct History {
    store: Arc<dyn DecidedStore>,
    network: Arc<dyn Network>,
    pipeline: Arc<dyn Pipeline>,
    config: SyncConfig,
    locks: parking_lot::Mutex<HashMap<Identifier, Arc<tokio::sync::Mutex<()>>>>,
}

impl History {
    pub fn new(
        store: Arc<dyn DecidedStore>,
        network: Arc<dyn Network>,
        pipeline: Arc<dyn Pipeline>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            network,
            pipeline: combine(vec![Arc::new(IdentifierCheck), pipeline]),
            config,
            locks: Default::default(),
        }
    }

    /// Returns `Ok(true)` once the local log reaches the best height reported by peers.
    ///
    /// When the sync stops early, `Ok(false)` is returned if `must_sync_all` is unset
    /// and at least one page was persisted, the stopping error otherwise.
    pub async fn sync_decided(
        &self,
        identifier: &Identifier,
        must_sync_all: bool,
    ) -> Result<bool, Error> {
        self.sync_decided_with_cancel(identifier, must_sync_all, &CancellationToken::new())
            .await
    }

    /// Like [`History::sync_decided`], giving up once `cancel` fires, also while
    /// another sync of the same identifier still holds the lock.
    #[instrument(skip_all, fields(identifier = %identifier, must_sync_all))]
    pub async fn sync_decided_with_cancel(
        &self,
        identifier: &Identifier,
        must_sync_all: bool,
        cancel: &CancellationToken,
    ) -> Result<bool, Error> {
        let lock = self
            .locks
            .lock()
            .entry(identifier.clone())
            .or_default()
            .clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(identifier.clone())),
            _guard = lock.lock() => self.sync(identifier, must_sync_all, cancel).await,
        };
        self.release_lock(identifier, lock);

        let label = match &result {
            Ok(true) => "synced",
            Ok(false) => "partial",
            Err(_) => "failed",
        };
        SYNC_RUNS.with_label_values(&[label]).inc();
        result
    }

    /// Drops the identifier's lock once no other sync holds or waits for it.
    fn release_lock(&self, identifier: &Identifier, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(identifier);
        }
    }

    async fn sync(
        &self,
        identifier: &Identifier,
        must_sync_all: bool,
        cancel: &CancellationToken,
    ) -> Result<bool, Error> {
        let peers = self.network.peers(&identifier.public_key);
        let responses = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled(identifier.clone())),
            responses = self.last_decided_from(identifier, &peers) => responses,
        };

        // strictly greater, so the first response in peer order wins ties
        let Some((best_peer, best)) = responses.iter().fold(None, |best, (peer, msg)| match best {
            Some((_, current)) if msg.height <= current => best,
            _ => Some((peer, msg.height)),
        }) else {
            info!(peers = peers.len(), "No valid last decided from peers, nothing to sync");
            return Ok(true);
        };

        let local = self
            .store
            .get_last_decided(identifier)?
            .map(|msg| msg.height);
        if local.map_or(false, |height| height >= best) {
            debug!(?local, best, "Already synced");
            return Ok(true);
        }

        let start = local.map_or(0, |height| height + 1);
        let mut sources = vec![best_peer.clone()];
        sources.extend(
            responses
                .iter()
                .filter(|(peer, msg)| peer != best_peer && local.map_or(true, |h| msg.height > h))
                .map(|(peer, _)| peer.clone()),
        );
        info!(?local, best, peers = sources.len(), "Syncing decided history");

        let page_size = self.config.page_size.max(1);
        let mut cursor = 0;
        let mut persisted = None;
        let mut from = start;
        while from <= best {
            let to = best.min(from.saturating_add(page_size - 1));
            let page = match self
                .fetch_page(identifier, from, to, &sources, &mut cursor, cancel)
                .await
            {
                Ok(page) => page,
                Err(err) if !must_sync_all && persisted.is_some() => {
                    warn!(?persisted, best, "Sync stopped after partial progress: {err}");
                    return Ok(false);
                }
                Err(err) => return Err(err),
            };

            self.store.save_decided(&page)?;
            if let Some(last) = page.last() {
                self.store.save_last_decided(last)?;
            }
            SYNC_DECIDED_MESSAGES
                .with_label_values(&["persisted"])
                .inc_by(page.len() as u64);
            record_last_decided(identifier, to);
            debug!(from, to, "Persisted decided page");

            persisted = Some(to);
            from = to + 1;
        }

        info!(height = best, "Decided history synced");
        Ok(true)
    }

    /// Valid last decided messages, in peer order.
    async fn last_decided_from(
        &self,
        identifier: &Identifier,
        peers: &[PeerId],
    ) -> Vec<(PeerId, SignedConsensusMessage)> {
        let request = SyncMessage::last_decided(identifier.clone());
        let wait = self.config.last_decided_wait();
        let responses = join_all(peers.iter().map(|peer| {
            let request = &request;
            async move { (peer, timeout(wait, self.request(peer, request)).await) }
        }))
        .await;

        responses
            .into_iter()
            .filter_map(|(peer, response)| {
                let response = match response {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => {
                        debug!(%peer, "Last decided request failed: {err}");
                        return None;
                    }
                    Err(_) => {
                        debug!(%peer, "Last decided request timed out");
                        return None;
                    }
                };
                if response.status != StatusCode::Success {
                    trace!(%peer, status = response.status.as_ref(), "No last decided");
                    return None;
                }
                let msg = response.data.into_iter().next()?;
                if let Err(err) = self.pipeline.run(identifier, &msg) {
                    debug!(%peer, height = msg.height, "Discarding invalid last decided: {err}");
                    SYNC_DECIDED_MESSAGES.with_label_values(&["invalid"]).inc();
                    return None;
                }
                Some((peer.clone(), msg))
            })
            .collect()
    }

    /// Fetches the complete page `[from, to]`, rotating through `sources`.
    ///
    /// Validated messages are kept across attempts, each retry only asks for
    /// the heights still missing.
    async fn fetch_page(
        &self,
        identifier: &Identifier,
        from: u64,
        to: u64,
        sources: &[PeerId],
        cursor: &mut usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SignedConsensusMessage>, Error> {
        let mut collected = BTreeMap::new();
        let mut validation_error = None;
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(identifier.clone()));
            }
            let Some(peer) = sources.get(*cursor % sources.len().max(1)) else {
                break;
            };
            *cursor += 1;

            let missing = from + collected.len() as u64;
            let request = SyncMessage::history(identifier.clone(), missing, to);
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled(identifier.clone())),
                response = timeout(self.config.request_timeout(), self.request(peer, &request)) => response,
            };
            let response = match response {
                Ok(Ok(response)) if response.status == StatusCode::Success => response,
                Ok(Ok(response)) => {
                    debug!(%peer, attempt, status = response.status.as_ref(), "History request refused");
                    continue;
                }
                Ok(Err(err)) => {
                    warn!(%peer, attempt, from = missing, to, "History request failed: {err}");
                    continue;
                }
                Err(_) => {
                    warn!(%peer, attempt, from = missing, to, "History request timed out");
                    continue;
                }
            };

            let mut msgs = response.data;
            msgs.sort_by_key(|msg| msg.height);
            let mut expected = missing;
            for msg in msgs {
                if msg.height < expected {
                    continue;
                }
                if msg.height != expected || msg.height > to {
                    break;
                }
                if let Err(source) = self.pipeline.run(identifier, &msg) {
                    warn!(%peer, height = msg.height, "Dropping invalid decided message: {source}");
                    SYNC_DECIDED_MESSAGES.with_label_values(&["invalid"]).inc();
                    validation_error = Some(Error::ValidationFailed {
                        height: msg.height,
                        source,
                    });
                    break;
                }
                collected.insert(msg.height, msg);
                expected += 1;
            }

            if expected > to {
                return Ok(collected.into_values().collect());
            }
            debug!(%peer, attempt, got = expected - missing, from = missing, to, "Incomplete page");
        }

        Err(validation_error.unwrap_or_else(|| Error::SyncIncomplete {
            identifier: identifier.clone(),
            from,
            to,
            attempts,
        }))
    }

    async fn request(&self, peer: &PeerId, request: &SyncMessage) -> Result<SyncMessage, Error> {
        let raw = request.encode().map_err(network::Error::from)?;
        let response = self
            .network
            .request(peer, request.protocol.as_ref(), raw)
            .await?;
        Ok(SyncMessage::decode(&response).map_err(network::Error::from)?)
    }
}

fn record_last_decided(identifier: &Identifier, height: u64) {
    LAST_DECIDED_HEIGHT
        .with_label_values(&[
            identifier.public_key.to_string().as_str(),
            identifier.role.as_ref(),
        ])
        .set(i64::try_from(height).unwrap_or(i64::MAX));
}
