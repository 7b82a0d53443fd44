use super::messages::{StatusCode, SyncMessage, SyncProtocol};
use crate::metrics::SYNC_HANDLER_REQUESTS;
use crate::network::{Network, RequestHandler};
use crate::store::DecidedStore;
use protocol::{Decode, Encode, Identifier, PublicKey, RunnerRole};
use std::sync::Arc;
use tracing::*;

/// Registers the last decided and decided history handlers on `network`.
pub fn register_sync_handlers(
    network: &dyn Network,
    store: Arc<dyn DecidedStore>,
    max_batch: u64,
) {
    network.register_handler(
        SyncProtocol::LastDecided.as_ref(),
        last_decided_handler(store.clone()),
    );
    network.register_handler(
        SyncProtocol::DecidedHistory.as_ref(),
        history_handler(store, max_batch),
    );
}

/// Answers with the highest decided message stored for the requested identifier.
pub fn last_decided_handler(store: Arc<dyn DecidedStore>) -> RequestHandler {
    Arc::new(move |raw: &[u8]| {
        let response = match parse_request(raw, SyncProtocol::LastDecided) {
            Err(response) => response,
            Ok(request) => match store.get_last_decided(&request.identifier) {
                Ok(Some(msg)) => request.respond(StatusCode::Success, vec![msg]),
                Ok(None) => request.respond(StatusCode::NotFound, vec![]),
                Err(err) => {
                    warn!(identifier = %request.identifier, "Could not read last decided: {err}");
                    request.respond(StatusCode::InternalError, vec![])
                }
            },
        };
        finish(response)
    })
}

/// Answers with the decided messages stored in `[from, to]`, at most `max_batch`
/// of them starting from `from`.
pub fn history_handler(store: Arc<dyn DecidedStore>, max_batch: u64) -> RequestHandler {
    Arc::new(move |raw: &[u8]| {
        let response = match parse_request(raw, SyncProtocol::DecidedHistory) {
            Err(response) => response,
            Ok(request) => match request.range() {
                Some((from, to)) if from <= to => {
                    let to = to.min(from.saturating_add(max_batch.max(1) - 1));
                    match store.get_decided_range(&request.identifier, from, to) {
                        Ok(msgs) if msgs.is_empty() => request.respond(StatusCode::NotFound, msgs),
                        Ok(msgs) => request.respond(StatusCode::Success, msgs),
                        Err(err) => {
                            warn!(identifier = %request.identifier, from, to, "Could not read decided range: {err}");
                            request.respond(StatusCode::InternalError, vec![])
                        }
                    }
                }
                _ => request.respond(StatusCode::BadRequest, vec![]),
            },
        };
        finish(response)
    })
}

fn parse_request(raw: &[u8], expected: SyncProtocol) -> Result<SyncMessage, SyncMessage> {
    match SyncMessage::decode(raw) {
        Ok(request) if request.protocol == expected => Ok(request),
        Ok(request) => Err(request.respond(StatusCode::BadRequest, vec![])),
        Err(err) => {
            debug!(protocol = expected.as_ref(), "Malformed sync request: {err}");
            // nothing to echo back, answer on behalf of an empty identifier
            let unknown = Identifier::new(PublicKey::new(vec![]), RunnerRole::Committee);
            Err(SyncMessage {
                protocol: expected,
                ..SyncMessage::last_decided(unknown)
            }
            .respond(StatusCode::BadRequest, vec![]))
        }
    }
}

fn finish(response: SyncMessage) -> Vec<u8> {
    SYNC_HANDLER_REQUESTS
        .with_label_values(&[response.protocol.as_ref(), response.status.as_ref()])
        .inc();
    trace!(
        identifier = %response.identifier,
        status = response.status.as_ref(),
        count = response.data.len(),
        "Answering sync request"
    );
    response.encode().unwrap_or_else(|err| {
        error!("Could not encode sync response: {err}");
        vec![]
    })
}
