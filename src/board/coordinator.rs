//! Orchestrates send, refresh and decrypt against the wallet session, the FHE
//! instance, the signature store and the contract.
//!
//! Every operation captures a [`Context`] before its first suspension and
//! re-checks it against the live session, deployment and instance before each
//! write. A result computed for a replaced context is dropped and reported as
//! [`Outcome::Discarded`].

use alloy::primitives::Address;
use log::{debug, error, info, warn};
use std::{str::FromStr, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::board::{
    decode_text, encode_text, BoardSnapshot, BoardState, ClearMessage, Outcome, RefreshSummary,
};
use crate::contract::{ContractGateway, MessageId, TransactionReceipt};
use crate::error::MessageBoardError;
use crate::fhe::{FheInstance, FheInstanceManager, FheStatus, HandleContractPair};
use crate::signature::DecryptionSignatureStore;
use crate::wallet::{WalletSession, WalletSessionProvider};

/// What an operation started under.
#[derive(Clone)]
struct Context {
    session: WalletSession,
    contract: Address,
}

/// Ready instance plus the generation it was published under.
struct ReadyInstance {
    instance: Arc<dyn FheInstance>,
    generation: u64,
}

struct CoordinatorInner {
    sessions: Arc<WalletSessionProvider>,
    fhe: Arc<FheInstanceManager>,
    signatures: DecryptionSignatureStore,
    gateway: Arc<dyn ContractGateway>,
    state: watch::Sender<BoardState>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct MessageBoardCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl MessageBoardCoordinator {
    pub fn new(
        sessions: Arc<WalletSessionProvider>,
        fhe: Arc<FheInstanceManager>,
        signatures: DecryptionSignatureStore,
        gateway: Arc<dyn ContractGateway>,
    ) -> Self {
        let (state, _) = watch::channel(BoardState::default());
        Self {
            inner: Arc::new(CoordinatorInner {
                sessions,
                fhe,
                signatures,
                gateway,
                state,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Current session, instance and board state with derived flags.
    pub fn snapshot(&self) -> BoardSnapshot {
        BoardSnapshot {
            session: self.inner.sessions.current(),
            fhe: self.inner.fhe.current(),
            board: self.inner.state.borrow().clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BoardState> {
        self.inner.state.subscribe()
    }

    /// Resolve once `ready` holds for the live snapshot.
    pub async fn wait_for(&self, mut ready: impl FnMut(&BoardSnapshot) -> bool) -> BoardSnapshot {
        let mut board = self.inner.state.subscribe();
        let mut fhe = self.inner.fhe.subscribe();
        let mut sessions = self.inner.sessions.subscribe();
        loop {
            let snapshot = self.snapshot();
            if ready(&snapshot) {
                return snapshot;
            }
            tokio::select! {
                _ = board.changed() => {}
                _ = fhe.changed() => {}
                _ = sessions.changed() => {}
            }
        }
    }

    pub fn sessions(&self) -> &Arc<WalletSessionProvider> {
        &self.inner.sessions
    }

    pub fn fhe(&self) -> &Arc<FheInstanceManager> {
        &self.inner.fhe
    }

    /// Look up the contract on the session's chain and record it.
    pub async fn resolve_deployment(&self) -> Result<Outcome<Option<Address>>, MessageBoardError> {
        let session = self
            .inner
            .sessions
            .current()
            .ok_or(MessageBoardError::WalletNotConnected)?;
        let chain_id = session.chain_id;

        let deployment = match self.inner.gateway.deployment(chain_id).await {
            Ok(deployment) => deployment,
            Err(e) => {
                let err = MessageBoardError::from(e);
                self.record_error(&err);
                return Err(err);
            }
        };

        let committed = self.inner.state.send_if_modified(|state| {
            if !self.session_unchanged(&session) {
                return false;
            }
            if !state.bound_to(&session) {
                state.reset_context(Some(session.address), Some(chain_id));
            }
            state.contract_address = deployment;
            state.is_deployed = Some(deployment.is_some());
            true
        });
        if !committed {
            debug!("[resolve_deployment] Discarding deployment lookup for chain {chain_id}");
            return Ok(Outcome::Discarded);
        }

        match deployment {
            Some(address) => info!("[resolve_deployment] Contract deployed at {address} on chain {chain_id}"),
            None => warn!("[resolve_deployment] Contract is not deployed on chain {chain_id}"),
        }
        Ok(Outcome::Committed(deployment))
    }

    /// Encrypt `text` for the connected account and send it to `recipient`.
    /// A successful transaction is followed by a refresh.
    pub async fn send_message(
        &self,
        recipient: &str,
        text: &str,
    ) -> Result<Outcome<TransactionReceipt>, MessageBoardError> {
        let prepared = Address::from_str(recipient.trim())
            .map_err(|_| MessageBoardError::InvalidRecipient(recipient.to_string()))
            .and_then(|recipient| Ok((recipient, encode_text(text)?)))
            .and_then(|(recipient, value)| {
                let context = self.capture()?;
                let ready = self.ready_instance(context.session.chain_id)?;
                Ok((recipient, value, context, ready))
            });
        let (recipient, value, context, ready) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        let mut busy = false;
        self.inner.state.send_modify(|state| {
            if state.is_sending {
                busy = true;
                return;
            }
            state.is_sending = true;
            state.last_error = None;
            state.message = "Encrypting message...".to_string();
        });
        if busy {
            return Err(MessageBoardError::Busy("send"));
        }
        info!(
            "[send_message] Sending message from {} to {recipient}",
            context.session.address
        );

        let result = self.submit_message(&context, &ready, recipient, value).await;

        let outcome = self.finish(&context, result, |state, receipt| {
            state.is_sending = false;
            if receipt.is_some() {
                state.message = "Message sent".to_string();
            }
        });
        if let Ok(Outcome::Committed(receipt)) = &outcome {
            info!(
                "[send_message] Message sent in transaction {}",
                receipt.transaction_hash
            );
            match self.refresh_with(true).await {
                Ok(_) => {}
                Err(MessageBoardError::Busy(_)) => {
                    debug!("[send_message] Refresh in progress, queued another");
                }
                Err(e) => warn!("[send_message] Refresh after send failed: {e}"),
            }
        }
        outcome
    }

    /// Replace the sent and received id lists of the connected account.
    pub async fn refresh_messages(&self) -> Result<Outcome<RefreshSummary>, MessageBoardError> {
        self.refresh_with(false).await
    }

    /// Refresh, and with `queue_if_busy` have a running refresh read the lists
    /// once more when it completes instead of failing with `Busy`.
    async fn refresh_with(
        &self,
        queue_if_busy: bool,
    ) -> Result<Outcome<RefreshSummary>, MessageBoardError> {
        let outcome = self.refresh_once(queue_if_busy).await;
        if !matches!(outcome, Err(MessageBoardError::Busy(_))) {
            while self.take_queued_refresh() {
                debug!("[refresh_messages] Running queued refresh");
                match self.refresh_once(false).await {
                    Ok(_) | Err(MessageBoardError::Busy(_)) => {}
                    Err(e) => warn!("[refresh_messages] Queued refresh failed: {e}"),
                }
            }
        }
        outcome
    }

    async fn refresh_once(
        &self,
        queue_if_busy: bool,
    ) -> Result<Outcome<RefreshSummary>, MessageBoardError> {
        let context = match self.capture() {
            Ok(context) => context,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        let mut busy = false;
        self.inner.state.send_modify(|state| {
            if state.is_refreshing {
                state.refresh_queued |= queue_if_busy;
                busy = true;
                return;
            }
            state.is_refreshing = true;
        });
        if busy {
            return Err(MessageBoardError::Busy("refresh"));
        }

        let user = context.session.address;
        let result = tokio::try_join!(
            self.inner.gateway.sent_message_ids(context.contract, user),
            self.inner.gateway.received_message_ids(context.contract, user),
        )
        .map_err(MessageBoardError::from)
        .and_then(|(sent, received)| {
            self.ensure_current(&context, None)?;
            Ok(split_message_ids(sent, received))
        });

        self.finish(&context, result, |state, lists| {
            state.is_refreshing = false;
            if let Some((sent, received)) = lists {
                debug!(
                    "[refresh_messages] {} sent, {} received for {user}",
                    sent.len(),
                    received.len()
                );
                state.sent_messages = sent.clone();
                state.received_messages = received.clone();
            }
        })
        .map(|outcome| match outcome {
            Outcome::Committed((sent, received)) => Outcome::Committed(RefreshSummary {
                sent: sent.len(),
                received: received.len(),
            }),
            Outcome::Discarded => Outcome::Discarded,
        })
    }

    /// Decrypt message `id` for the connected account. An id decrypted before
    /// is answered from the stored contents.
    pub async fn decrypt_message(
        &self,
        id: MessageId,
    ) -> Result<Outcome<ClearMessage>, MessageBoardError> {
        if let Some(content) = self.cached_content(id) {
            return Ok(Outcome::Committed(content));
        }

        let prepared = self.capture().and_then(|context| {
            let ready = self.ready_instance(context.session.chain_id)?;
            Ok((context, ready))
        });
        let (context, ready) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        let mut busy = false;
        self.inner.state.send_modify(|state| {
            if !state.decrypting.insert(id) {
                busy = true;
                return;
            }
            state.last_error = None;
            state.message = format!("Decrypting message #{id}...");
        });
        if busy {
            return Err(MessageBoardError::Busy("decrypt"));
        }

        let result = self.decrypt_handle(&context, &ready, id).await;

        self.finish(&context, result, |state, content| {
            state.decrypting.remove(&id);
            if let Some(content) = content {
                state.message = format!("Message #{id} decrypted");
                state.message_contents.insert(id, content.clone());
            }
        })
    }

    /// Follow the wallet session: on every account or chain change drop the
    /// context-bound state, resolve the deployment and load the message ids.
    pub fn bind(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        let mut sessions = self.inner.sessions.subscribe();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut last: Option<WalletSession> = None;
            loop {
                let session = sessions.borrow_and_update().clone();
                let changed = match (&last, &session) {
                    (Some(a), Some(b)) => !a.same_context(b),
                    (None, None) => false,
                    _ => true,
                };
                if changed {
                    coordinator.on_session_changed(session.as_ref()).await;
                    last = session;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = sessions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Message board unbound from wallet session");
        })
    }

    /// Stop the task started by [`bind`](Self::bind).
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    async fn on_session_changed(&self, session: Option<&WalletSession>) {
        self.inner.state.send_modify(|state| {
            state.reset_context(session.map(|s| s.address), session.map(|s| s.chain_id));
        });
        if session.is_none() {
            return;
        }
        match self.resolve_deployment().await {
            Ok(Outcome::Committed(Some(_))) => match self.refresh_with(true).await {
                Ok(_) | Err(MessageBoardError::Busy(_)) => {}
                Err(e) => warn!("[on_session_changed] Initial refresh failed: {e}"),
            },
            Ok(_) => {}
            Err(e) => warn!("[on_session_changed] Deployment lookup failed: {e}"),
        }
    }

    async fn submit_message(
        &self,
        context: &Context,
        ready: &ReadyInstance,
        recipient: Address,
        value: u64,
    ) -> Result<TransactionReceipt, MessageBoardError> {
        let user = context.session.address;
        let input = ready
            .instance
            .encrypt_u64(value, context.contract, user)
            .await?;
        self.ensure_current(context, Some(ready.generation))?;

        self.inner.state.send_modify(|state| {
            state.message = "Sending message...".to_string();
        });
        let receipt = self
            .inner
            .gateway
            .send_message(context.contract, user, recipient, &input)
            .await?;
        self.ensure_current(context, None)?;
        Ok(receipt)
    }

    async fn decrypt_handle(
        &self,
        context: &Context,
        ready: &ReadyInstance,
        id: MessageId,
    ) -> Result<ClearMessage, MessageBoardError> {
        let known = self
            .inner
            .state
            .borrow()
            .messages
            .get(&id)
            .map(|record| record.handle);
        let handle = match known {
            Some(handle) => handle,
            None => {
                let record = self.inner.gateway.message(context.contract, id).await?;
                self.ensure_current(context, None)?;
                let handle = record.handle;
                self.inner.state.send_modify(|state| {
                    state.messages.insert(id, record);
                });
                handle
            }
        };

        let signature = self
            .inner
            .signatures
            .get_or_create(
                ready.instance.clone(),
                context.session.signer.clone(),
                context.contract,
            )
            .await?;
        self.ensure_current(context, Some(ready.generation))?;

        let pairs = [HandleContractPair {
            handle,
            contract: context.contract,
        }];
        let values = ready
            .instance
            .user_decrypt(&pairs, &signature, context.session.address)
            .await?;
        self.ensure_current(context, Some(ready.generation))?;

        let value = values.get(&handle).copied().ok_or_else(|| {
            MessageBoardError::DecryptionFailed(format!("no value returned for {handle}"))
        })?;
        Ok(ClearMessage {
            handle,
            value,
            clear: decode_text(value),
        })
    }

    /// Clear the operation's flag and, if `context` still holds, commit its
    /// result in the same state update.
    fn finish<T>(
        &self,
        context: &Context,
        result: Result<T, MessageBoardError>,
        apply: impl FnOnce(&mut BoardState, Option<&T>),
    ) -> Result<Outcome<T>, MessageBoardError> {
        match result {
            Ok(value) => {
                let mut current = false;
                self.inner.state.send_modify(|state| {
                    let holds = self.session_unchanged(&context.session)
                        && state.bound_to(&context.session)
                        && state.contract_address == Some(context.contract);
                    current = holds;
                    apply(state, holds.then_some(&value));
                });
                if current {
                    Ok(Outcome::Committed(value))
                } else {
                    debug!("Discarding result computed for a replaced session");
                    Ok(Outcome::Discarded)
                }
            }
            Err(MessageBoardError::ChainMismatch) => {
                self.inner.state.send_modify(|state| apply(state, None));
                debug!("Discarding result computed for a replaced session");
                Ok(Outcome::Discarded)
            }
            Err(e) => {
                error!("Message board operation failed: {e}");
                self.inner.state.send_modify(|state| {
                    apply(state, None);
                    state.message = e.to_string();
                    state.last_error = Some(e.clone());
                });
                Err(e)
            }
        }
    }

    fn capture(&self) -> Result<Context, MessageBoardError> {
        let session = self
            .inner
            .sessions
            .current()
            .ok_or(MessageBoardError::WalletNotConnected)?;
        let state = self.inner.state.borrow();
        match (state.is_deployed, state.contract_address) {
            (Some(true), Some(contract)) if state.bound_to(&session) => Ok(Context { session, contract }),
            _ => Err(MessageBoardError::ContractNotDeployed),
        }
    }

    fn ready_instance(&self, chain_id: u64) -> Result<ReadyInstance, MessageBoardError> {
        let fhe = self.inner.fhe.current();
        match (&fhe.instance, fhe.status) {
            (Some(instance), FheStatus::Ready) if fhe.chain_id == Some(chain_id) => {
                Ok(ReadyInstance {
                    instance: instance.clone(),
                    generation: fhe.generation,
                })
            }
            (_, FheStatus::Error) => Err(MessageBoardError::InstanceCreationFailed(
                fhe.error.unwrap_or_default(),
            )),
            _ => Err(MessageBoardError::InstanceNotReady),
        }
    }

    fn take_queued_refresh(&self) -> bool {
        self.inner
            .state
            .send_if_modified(|state| std::mem::take(&mut state.refresh_queued))
    }

    /// Stored contents of `id`, if the board is bound to the live session.
    fn cached_content(&self, id: MessageId) -> Option<ClearMessage> {
        let session = self.inner.sessions.current()?;
        let state = self.inner.state.borrow();
        if !state.bound_to(&session) {
            return None;
        }
        state.message_contents.get(&id).cloned()
    }

    fn session_unchanged(&self, captured: &WalletSession) -> bool {
        self.inner.sessions.same_chain(captured.chain_id)
            && self.inner.sessions.same_signer(captured.address)
    }

    /// `ChainMismatch` if the session, the deployment or (when given) the
    /// instance generation moved on since `context` was captured.
    fn ensure_current(
        &self,
        context: &Context,
        generation: Option<u64>,
    ) -> Result<(), MessageBoardError> {
        let deployment_current = {
            let state = self.inner.state.borrow();
            state.bound_to(&context.session) && state.contract_address == Some(context.contract)
        };
        let instance_current = generation.map_or(true, |g| self.inner.fhe.is_current(g));
        if self.session_unchanged(&context.session) && deployment_current && instance_current {
            Ok(())
        } else {
            Err(MessageBoardError::ChainMismatch)
        }
    }

    fn record_error(&self, err: &MessageBoardError) {
        if matches!(err, MessageBoardError::Busy(_)) {
            return;
        }
        self.inner.state.send_modify(|state| {
            state.message = err.to_string();
            state.last_error = Some(err.clone());
        });
    }
}

/// Deduplicate both lists keeping first-seen order. A self-addressed message
/// is listed as received only.
fn split_message_ids(
    sent: Vec<MessageId>,
    received: Vec<MessageId>,
) -> (Vec<MessageId>, Vec<MessageId>) {
    let mut seen = std::collections::HashSet::new();
    let received: Vec<MessageId> = received.into_iter().filter(|id| seen.insert(*id)).collect();
    let sent = sent.into_iter().filter(|id| seen.insert(*id)).collect();
    (sent, received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    #[test]
    fn test_split_message_ids() {
        let ids = |v: &[u64]| v.iter().map(|i| U256::from(*i)).collect::<Vec<_>>();
        let (sent, received) = split_message_ids(ids(&[0, 2, 2, 3]), ids(&[1, 3, 1]));
        assert_eq!(received, ids(&[1, 3]));
        assert_eq!(sent, ids(&[0, 2]));
    }
}
