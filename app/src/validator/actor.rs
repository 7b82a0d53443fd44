use super::msgqueue::{spawn_consumer, Consumer, MsgQueue};
use super::{ActorState, Error, Options};
use crate::config::{Mode, QueueConfig};
use crate::metrics::{DUTIES_STARTED, MESSAGES_PROCESSED};
use crate::network::Network;
use crate::runner::{DutyRunners, SharedRunner};
use crate::sync::History;
use async_trait::async_trait;
use parking_lot::Mutex;
use protocol::{
    Decode, DutyInfo, Envelope, Identifier, MsgType, PartialSigPhase, PartialSignatureMessage,
    PublicKey, SignedConsensusMessage,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Lifecycle, routing and queueing shared by validator and committee actors.
pub(crate) struct ActorCore<D> {
    public_key: PublicKey,
    runners: DutyRunners<D>,
    network: Arc<dyn Network>,
    history: Arc<History>,
    mode: Mode,
    queue_config: QueueConfig,
    queue: Option<Arc<MsgQueue>>,
    state: Mutex<ActorState>,
    cancel: CancellationToken,
}

impl<D: DutyInfo> ActorCore<D> {
    pub(crate) fn new(public_key: PublicKey, committee_size: usize, options: Options<D>) -> Self {
        let options = options.defaults();
        let queue = (options.mode == Mode::ReadWrite)
            .then(|| Arc::new(MsgQueue::with_default_indexers(committee_size)));
        Self {
            public_key,
            runners: options.runners,
            network: options.network,
            history: options.history,
            mode: options.mode,
            queue_config: options.queue,
            queue,
            state: Mutex::new(ActorState::NotStarted),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub(crate) fn state(&self) -> ActorState {
        *self.state.lock()
    }

    pub(crate) fn queue(&self) -> Option<&Arc<MsgQueue>> {
        self.queue.as_ref()
    }

    pub(crate) fn ensure_not_stopped(&self) -> Result<(), Error> {
        match self.state() {
            ActorState::Stopped => Err(Error::AlreadyStopped),
            _ => Ok(()),
        }
    }

    fn identifiers(&self) -> Vec<Identifier> {
        self.runners
            .roles()
            .into_iter()
            .map(|role| Identifier::new(self.public_key.clone(), role))
            .collect()
    }

    /// Returns `true` when this call performed the transition to started.
    #[instrument(skip_all, fields(public_key = %self.public_key))]
    pub(crate) async fn start(self: &Arc<Self>) -> Result<bool, Error> {
        {
            let mut state = self.state.lock();
            match *state {
                ActorState::Stopped => return Err(Error::AlreadyStopped),
                ActorState::Started => return Ok(false),
                ActorState::NotStarted => *state = ActorState::Started,
            }
        }

        if let Err(err) = self.network.subscribe(&self.public_key).await {
            let mut state = self.state.lock();
            if *state == ActorState::Started {
                *state = ActorState::NotStarted;
            }
            return Err(err.into());
        }
        // a stop that ran while subscribing has already unsubscribed
        if self.state() == ActorState::Stopped {
            if let Err(err) = self.network.unsubscribe(&self.public_key).await {
                warn!("Could not unsubscribe: {err}");
            }
            return Err(Error::AlreadyStopped);
        }

        if let Some(queue) = &self.queue {
            self.spawn_consumers(queue.clone());
        }
        for identifier in self.identifiers() {
            let history = self.history.clone();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                match history
                    .sync_decided_with_cancel(&identifier, false, &cancel)
                    .await
                {
                    Ok(synced) => debug!(%identifier, synced, "Initial decided sync done"),
                    Err(err) => warn!(%identifier, "Initial decided sync failed: {err}"),
                }
            });
        }

        info!(roles = self.runners.len(), mode = ?self.mode, "Actor started");
        Ok(true)
    }

    fn spawn_consumers(self: &Arc<Self>, queue: Arc<MsgQueue>) {
        let identifiers = self.identifiers();
        let consumers = self.queue_config.consumers.clamp(1, identifiers.len().max(1));
        let mut groups = vec![Vec::new(); consumers];
        // roles never share two consumers, which keeps each role in receipt order
        for (i, identifier) in identifiers.into_iter().enumerate() {
            groups[i % consumers].push(identifier);
        }
        for group in groups.into_iter().filter(|group| !group.is_empty()) {
            spawn_consumer(
                queue.clone(),
                group,
                self.queue_config.batch_size,
                self.cancel.child_token(),
                self.clone(),
            );
        }
    }

    /// Idempotent. Cancels consumers and background syncs and drops queued envelopes.
    pub(crate) async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ActorState::Stopped);
        if previous == ActorState::Stopped {
            return;
        }
        self.cancel.cancel();

        if let Some(queue) = &self.queue {
            let dropped: usize = self
                .identifiers()
                .iter()
                .flat_map(|identifier| queue.indices_for(identifier))
                .map(|index| queue.purge(&index))
                .sum();
            if dropped > 0 {
                debug!(dropped, "Dropped queued envelopes");
            }
        }
        if previous == ActorState::Started {
            if let Err(err) = self.network.unsubscribe(&self.public_key).await {
                warn!(public_key = %self.public_key, "Could not unsubscribe: {err}");
            }
        }
        info!(public_key = %self.public_key, "Actor stopped");
    }

    pub(crate) async fn start_duty(&self, duty: D) -> Result<(), Error> {
        self.ensure_not_stopped()?;
        let role = duty.role();
        let result = match self.runners.runner_for_role(role) {
            None => Err(Error::UnsupportedDutyType(role)),
            Some(runner) => runner
                .lock()
                .await
                .start_new_duty(duty)
                .await
                .map_err(Error::from),
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        DUTIES_STARTED.with_label_values(&[role.as_ref(), status]).inc();
        result
    }

    pub(crate) async fn process_message(&self, envelope: Envelope) -> Result<(), Error> {
        let kind = format!("{:?}", envelope.msg_type);
        let result = self.route(envelope).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        MESSAGES_PROCESSED
            .with_label_values(&[kind.as_str(), status])
            .inc();
        result
    }

    /// Checks that need no decoding: the actor is running, a runner exists
    /// for the role, the key is the actor's own and there is a payload.
    fn check_envelope(&self, envelope: &Envelope) -> Result<SharedRunner<D>, Error> {
        self.ensure_not_stopped()?;
        let runner = self
            .runners
            .duty_runner_for(&envelope.msg_id)
            .ok_or_else(|| Error::NoRunnerForMessage(envelope.msg_id.clone()))?;

        if !envelope.msg_id.belongs_to(&self.public_key) {
            return Err(Error::IdentityMismatch {
                expected: self.public_key.clone(),
                got: envelope.msg_id.public_key.clone(),
            });
        }
        if envelope.data.is_empty() {
            return Err(Error::EmptyPayload);
        }
        Ok(runner)
    }

    async fn route(&self, envelope: Envelope) -> Result<(), Error> {
        let runner = self.check_envelope(&envelope)?;

        // decode before locking, a malformed payload never reaches the runner
        match envelope.msg_type {
            MsgType::Consensus => {
                let msg = SignedConsensusMessage::decode(&envelope.data).map_err(Error::Decode)?;
                trace!(identifier = %envelope.msg_id, height = msg.height, "Processing consensus message");
                runner.lock().await.process_consensus(msg).await?;
            }
            MsgType::PartialSignature => {
                let msg = PartialSignatureMessage::decode(&envelope.data).map_err(Error::Decode)?;
                let mut runner = runner.lock().await;
                match msg.phase {
                    PartialSigPhase::PostConsensus => runner.process_post_consensus(msg).await?,
                    PartialSigPhase::PreConsensus => runner.process_pre_consensus(msg).await?,
                }
            }
            kind => return Err(Error::UnknownMessageKind(kind)),
        }
        Ok(())
    }

    /// Network entry point for consensus and partial signature envelopes.
    pub(crate) async fn handle_message(&self, envelope: Envelope) {
        match &self.queue {
            Some(queue) if self.state() != ActorState::Stopped => {
                // only envelopes a consumer will drain are queued
                if let Err(err) = self.check_envelope(&envelope) {
                    debug!(identifier = %envelope.msg_id, "Dropping message: {err}");
                    MESSAGES_PROCESSED
                        .with_label_values(&[format!("{:?}", envelope.msg_type).as_str(), "error"])
                        .inc();
                    return;
                }
                if queue.add(envelope).is_none() {
                    trace!("Envelope matched no queue index");
                }
            }
            _ => {
                let identifier = envelope.msg_id.clone();
                if let Err(err) = self.process_message(envelope).await {
                    debug!(%identifier, "Could not process message: {err}");
                }
            }
        }
    }
}

#[async_trait]
impl<D: DutyInfo> Consumer for ActorCore<D> {
    async fn consume(&self, envelope: Envelope) {
        let identifier = envelope.msg_id.clone();
        if let Err(err) = self.process_message(envelope).await {
            debug!(%identifier, "Could not process queued message: {err}");
        }
    }
}
