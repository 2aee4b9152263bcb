//! Proposer: the threshold-signing coordinator for one source chain
//!
//! Validators dial in, log in, and receive a proposal for every Call that is
//! still collecting signatures. Returned signatures are checked against the
//! validator bound to the connection and recorded in the ledger, which is
//! also where the threshold promotion happens.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{Result, WrapErr};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::eip712::{recover_signer, LoginTypedData};
use crate::ledger::{Ledger, SignatureInsert};
use crate::metrics;
use crate::p2p::{
    accept, ClaimError, ConnectionId, Frame, FrameError, FrameKind, LoginPayload,
    ProposalPayload, SessionRegistry, SignPayload, OUTBOUND_QUEUE,
};
use crate::types::{ledger_int, MessageStatus, MessageType};
use crate::verification::{ProofClaim, SourceProof};

/// Maximum clock skew accepted on a login timestamp, in seconds
pub const LOGIN_WINDOW_SECS: u64 = 60;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_BATCH_SIZE: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginError {
    #[error("login for chain {actual}, this proposer serves chain {expected}")]
    ChainMismatch { expected: u64, actual: u64 },
    #[error("login timestamp is {skew}s away from now")]
    StaleTimestamp { skew: u64 },
    #[error("invalid account {0:?}")]
    InvalidAccount(String),
    #[error("{0:#x} is not a validator")]
    UnknownValidator(Address),
    #[error("login signature does not belong to {0:#x}")]
    BadSignature(Address),
    #[error("login for {0:#x} was already used")]
    Replayed(Address),
    #[error("connection closed before login completed")]
    ConnectionClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("signature received before login")]
    NotLoggedIn,
    #[error("message {0} does not exist")]
    UnknownMessage(i64),
    #[error("message {0} is not a Call on this proposer's chain")]
    WrongScope(i64),
    #[error("message {id} is {status}, not accepting signatures")]
    NotSignable { id: i64, status: MessageStatus },
    #[error("signed fields do not match message {0}")]
    FieldMismatch(i64),
    #[error(transparent)]
    Malformed(#[from] FrameError),
    #[error("signature recovers to {recovered:#x}, connection belongs to {expected:#x}")]
    SignerMismatch { expected: Address, recovered: Address },
    #[error("unrecoverable signature: {0}")]
    BadSignature(String),
}

pub struct Proposer {
    ledger: Arc<dyn Ledger>,
    verifier: Arc<dyn SourceProof>,
    sessions: SessionRegistry,
    chain_id: u64,
    weight: i32,
    validators: Vec<Address>,
    interval: Duration,
    batch_size: i64,
    label: String,
}

impl Proposer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        verifier: Arc<dyn SourceProof>,
        chain_id: u64,
        weight: i32,
        validators: Vec<Address>,
    ) -> Self {
        Self {
            ledger,
            verifier,
            sessions: SessionRegistry::new(),
            chain_id,
            weight,
            validators,
            interval: DEFAULT_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            label: chain_id.to_string(),
        }
    }

    /// Polling interval of the proposal and submit loops
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    fn ledger_chain_id(&self) -> Result<i64> {
        ledger_int(self.chain_id, "chain id")
    }

    /// Authenticate a connection and bind it to the validator's address
    pub async fn handle_login(
        &self,
        conn: ConnectionId,
        login: &LoginPayload,
        now: u64,
    ) -> Result<Address, LoginError> {
        if login.chain_id != self.chain_id {
            return Err(LoginError::ChainMismatch {
                expected: self.chain_id,
                actual: login.chain_id,
            });
        }

        let skew = now.abs_diff(login.timestamp);
        if skew > LOGIN_WINDOW_SECS {
            return Err(LoginError::StaleTimestamp { skew });
        }

        let account = Address::from_str(&login.account)
            .map_err(|_| LoginError::InvalidAccount(login.account.clone()))?;
        if !self.validators.contains(&account) {
            return Err(LoginError::UnknownValidator(account));
        }

        let typed = LoginTypedData {
            chain_id: login.chain_id,
            account,
            timestamp: login.timestamp,
        };
        match recover_signer(typed.signing_hash(), &login.signature) {
            Ok(recovered) if recovered == account => {}
            _ => return Err(LoginError::BadSignature(account)),
        }

        let oldest_valid = now.saturating_sub(LOGIN_WINDOW_SECS);
        match self
            .sessions
            .claim_login(conn, account, login.timestamp, oldest_valid)
            .await
        {
            Ok(Some(displaced)) => {
                info!(%conn, %displaced, signer = %account, "Validator logged in again, dropping previous connection");
            }
            Ok(None) => {}
            Err(ClaimError::Replayed) => return Err(LoginError::Replayed(account)),
            Err(ClaimError::Closed) => return Err(LoginError::ConnectionClosed),
        }
        metrics::set_validator_sessions(&self.label, self.sessions.authenticated_count().await);
        Ok(account)
    }

    /// Check a returned signature and record it
    pub async fn handle_sign(&self, conn: ConnectionId, sign: &SignPayload) -> Result<SignatureInsert> {
        let signer = self
            .sessions
            .signer(conn)
            .await
            .ok_or(SignError::NotLoggedIn)?;

        let id = sign.fields.message_id;
        let message = self
            .ledger
            .get_message(id)
            .await?
            .ok_or(SignError::UnknownMessage(id))?;
        if message.chain_id != self.ledger_chain_id()?
            || message.message_type != MessageType::Call
        {
            return Err(SignError::WrongScope(id).into());
        }
        if !matches!(message.status, MessageStatus::Validating | MessageStatus::Pending) {
            return Err(SignError::NotSignable {
                id,
                status: message.status,
            }
            .into());
        }
        if !sign.fields.matches(&message) {
            return Err(SignError::FieldMismatch(id).into());
        }

        let typed = sign.fields.send_typed_data().map_err(SignError::from)?;
        let recovered = recover_signer(typed.signing_hash(), &sign.signature)
            .map_err(|e| SignError::BadSignature(e.to_string()))?;
        if recovered != signer {
            return Err(SignError::SignerMismatch {
                expected: signer,
                recovered,
            }
            .into());
        }

        let outcome = self
            .ledger
            .add_message_signature(id, &format!("{:#x}", signer), &sign.signature)
            .await
            .wrap_err_with(|| format!("Failed to record signature for message {}", id))?;
        Ok(outcome)
    }

    /// Verify every Call still collecting signatures and fan it out to the
    /// logged-in validators. Returns the number of proposals queued.
    pub async fn propose_pending(&self) -> Result<usize> {
        let messages = self
            .ledger
            .validating_calls(self.ledger_chain_id()?, self.weight, self.batch_size)
            .await?;

        let mut queued = 0;
        for message in messages {
            match self.verifier.verify(&ProofClaim::from_message(&message)).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(message_id = message.id, tx_hash = %message.tx_hash, "Source proof rejected, marking message invalid");
                    if self
                        .ledger
                        .mark_message_invalid(message.id, MessageStatus::Validating)
                        .await?
                    {
                        metrics::record_invalid(&self.label);
                    }
                    continue;
                }
                Err(e) => {
                    warn!(message_id = message.id, error = %e, "Source chain unavailable, proposal deferred");
                    metrics::record_error(&self.label, "verification");
                    continue;
                }
            }

            let frame = Frame::new(FrameKind::Proposal, &ProposalPayload::from_message(&message))?;
            let sent = self.sessions.broadcast_authenticated(&frame.encode()?).await;
            debug!(message_id = message.id, validators = sent, "Proposal sent");
            queued += sent;
        }

        metrics::record_proposals(&self.label, queued);
        Ok(queued)
    }

    /// Move every Call that reached the threshold to Pending
    pub async fn promote_ready(&self) -> Result<u64> {
        let promoted = self
            .ledger
            .promote_ready(self.ledger_chain_id()?, self.weight)
            .await?;
        if promoted > 0 {
            info!(chain_id = self.chain_id, promoted, "Messages reached signature threshold");
            metrics::record_promoted(&self.label, promoted);
        }
        Ok(promoted)
    }

    /// Accept validator connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().ok();
        info!(chain_id = self.chain_id, addr = ?local, "Proposer listening for validators");

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .wrap_err("Failed to accept validator connection")?;
            let proposer = self.clone();
            tokio::spawn(async move {
                proposer.handle_connection(stream, peer).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let framed = match accept(stream).await {
            Ok(framed) => framed,
            Err(e) => {
                warn!(%peer, error = %e, "Handshake failed");
                return;
            }
        };

        let (mut sink, mut lines) = framed.split::<String>();
        let (outbound, mut queue) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let conn = self.sessions.register(peer, outbound).await;
        info!(%conn, %peer, "Validator connected");

        let writer = tokio::spawn(async move {
            while let Some(line) = queue.recv().await {
                if let Err(e) = sink.send(line).await {
                    debug!(%conn, error = %e, "Write failed, closing stream");
                    break;
                }
            }
        });

        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => self.handle_line(conn, &line).await,
                Err(e) => {
                    warn!(%conn, error = %e, "Read failed, closing stream");
                    break;
                }
            }
        }

        self.sessions.remove(conn).await;
        writer.abort();
        metrics::set_validator_sessions(&self.label, self.sessions.authenticated_count().await);
        info!(%conn, %peer, "Validator disconnected");
    }

    async fn handle_line(&self, conn: ConnectionId, line: &str) {
        let frame = match Frame::decode(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%conn, error = %e, "Dropping malformed frame");
                return;
            }
        };

        match frame.message_type {
            FrameKind::Login => {
                let login = match frame.payload::<LoginPayload>(FrameKind::Login) {
                    Ok(login) => login,
                    Err(e) => {
                        warn!(%conn, error = %e, "Dropping malformed login");
                        return;
                    }
                };
                let now = chrono::Utc::now().timestamp().max(0) as u64;
                match self.handle_login(conn, &login, now).await {
                    Ok(signer) => info!(%conn, signer = %signer, "Validator logged in"),
                    Err(e) => warn!(%conn, account = %login.account, error = %e, "Login rejected"),
                }
            }
            FrameKind::Sign => {
                let sign = match frame.payload::<SignPayload>(FrameKind::Sign) {
                    Ok(sign) => sign,
                    Err(e) => {
                        warn!(%conn, error = %e, "Dropping malformed signature");
                        return;
                    }
                };
                let message_id = sign.fields.message_id;
                match self.handle_sign(conn, &sign).await {
                    Ok(SignatureInsert::Inserted) => {
                        debug!(%conn, message_id, "Signature recorded");
                        metrics::record_signature(&self.label, "accepted");
                    }
                    Ok(SignatureInsert::Duplicate) => {
                        debug!(%conn, message_id, "Signature already recorded");
                        metrics::record_signature(&self.label, "duplicate");
                    }
                    Err(e) => {
                        warn!(%conn, message_id, error = %e, "Signature rejected");
                        metrics::record_signature(&self.label, "rejected");
                    }
                }
            }
            FrameKind::Proposal => {
                warn!(%conn, "Validators do not send proposals, ignoring");
            }
        }
    }

    async fn proposal_loop(&self) {
        let mut cycle_count: u64 = 0;
        loop {
            tokio::time::sleep(self.interval).await;
            cycle_count += 1;
            if let Err(e) = self.propose_pending().await {
                error!(chain_id = self.chain_id, error = %e, "Proposal round failed");
                metrics::record_error(&self.label, "proposal");
            }
            if cycle_count % 20 == 1 {
                let validators = self.sessions.authenticated_count().await;
                info!(
                    chain_id = self.chain_id,
                    cycle = cycle_count,
                    validators = validators,
                    "Proposer heartbeat"
                );
            }
        }
    }

    async fn submit_loop(&self) {
        loop {
            tokio::time::sleep(self.interval).await;
            if let Err(e) = self.promote_ready().await {
                error!(chain_id = self.chain_id, error = %e, "Promotion round failed");
                metrics::record_error(&self.label, "promotion");
            }
        }
    }

    /// Serve validators and run both loops until shutdown
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!(
            chain_id = self.chain_id,
            weight = self.weight,
            validators = self.validators.len(),
            "Starting proposer"
        );

        tokio::select! {
            _ = shutdown.recv() => {
                info!(chain_id = self.chain_id, "Shutdown signal received, stopping proposer");
                Ok(())
            }
            result = self.clone().serve(listener) => result,
            _ = self.proposal_loop() => Ok(()),
            _ = self.submit_loop() => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eip712::sign_hash;
    use crate::ledger::MemoryLedger;
    use crate::p2p::MessageFields;
    use crate::testing::{new_message, sample_message, StaticProof};
    use alloy::signers::local::PrivateKeySigner;

    const NOW: u64 = 1_700_000_000;

    struct Harness {
        proposer: Proposer,
        ledger: Arc<MemoryLedger>,
        verifier: Arc<StaticProof>,
        validators: Vec<PrivateKeySigner>,
    }

    fn harness(verifier: StaticProof) -> Harness {
        let validators: Vec<PrivateKeySigner> = (0..3).map(|_| PrivateKeySigner::random()).collect();
        let ledger = Arc::new(MemoryLedger::new());
        let verifier = Arc::new(verifier);
        let proposer = Proposer::new(
            ledger.clone(),
            verifier.clone(),
            1,
            2,
            validators.iter().map(|v| v.address()).collect(),
        );
        Harness {
            proposer,
            ledger,
            verifier,
            validators,
        }
    }

    fn login(signer: &PrivateKeySigner, chain_id: u64, timestamp: u64) -> LoginPayload {
        let typed = LoginTypedData {
            chain_id,
            account: signer.address(),
            timestamp,
        };
        LoginPayload {
            chain_id,
            account: format!("{:#x}", signer.address()),
            timestamp,
            signature: sign_hash(signer, typed.signing_hash()).unwrap(),
        }
    }

    fn sign(signer: &PrivateKeySigner, fields: MessageFields) -> SignPayload {
        let hash = fields.send_typed_data().unwrap().signing_hash();
        SignPayload {
            fields,
            signature: sign_hash(signer, hash).unwrap(),
        }
    }

    async fn connect(h: &Harness) -> (ConnectionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let conn = h.proposer.sessions().register("127.0.0.1:9000".parse().unwrap(), tx).await;
        (conn, rx)
    }

    async fn stored_message(h: &Harness) -> i64 {
        h.ledger
            .insert_message(&new_message(&sample_message()))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_binds_validator() {
        let h = harness(StaticProof::valid());
        let (conn, _rx) = connect(&h).await;

        let signer = h
            .proposer
            .handle_login(conn, &login(&h.validators[0], 1, NOW), NOW + 5)
            .await
            .unwrap();

        assert_eq!(signer, h.validators[0].address());
        assert_eq!(h.proposer.sessions().signer(conn).await, Some(signer));
    }

    #[tokio::test]
    async fn test_login_rejections() {
        let h = harness(StaticProof::valid());
        let (conn, _rx) = connect(&h).await;
        let outsider = PrivateKeySigner::random();

        let wrong_chain = h
            .proposer
            .handle_login(conn, &login(&h.validators[0], 5, NOW), NOW)
            .await;
        assert_eq!(
            wrong_chain,
            Err(LoginError::ChainMismatch {
                expected: 1,
                actual: 5
            })
        );

        let stale = h
            .proposer
            .handle_login(conn, &login(&h.validators[0], 1, NOW), NOW + 61)
            .await;
        assert_eq!(stale, Err(LoginError::StaleTimestamp { skew: 61 }));

        let unknown = h
            .proposer
            .handle_login(conn, &login(&outsider, 1, NOW), NOW)
            .await;
        assert_eq!(unknown, Err(LoginError::UnknownValidator(outsider.address())));

        // signed by an outsider on behalf of a validator
        let mut forged = login(&outsider, 1, NOW);
        forged.account = format!("{:#x}", h.validators[1].address());
        let forged = h.proposer.handle_login(conn, &forged, NOW).await;
        assert_eq!(forged, Err(LoginError::BadSignature(h.validators[1].address())));

        assert_eq!(h.proposer.sessions().signer(conn).await, None);
    }

    #[tokio::test]
    async fn test_sign_requires_login() {
        let h = harness(StaticProof::valid());
        let id = stored_message(&h).await;
        let (conn, _rx) = connect(&h).await;
        let message = h.ledger.get_message(id).await.unwrap().unwrap();

        let err = h
            .proposer
            .handle_sign(conn, &sign(&h.validators[0], MessageFields::from_message(&message)))
            .await
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<SignError>(), Some(SignError::NotLoggedIn)));
    }

    #[tokio::test]
    async fn test_sign_counts_each_validator_once() {
        let h = harness(StaticProof::valid());
        let id = stored_message(&h).await;
        let (conn, _rx) = connect(&h).await;
        h.proposer
            .handle_login(conn, &login(&h.validators[0], 1, NOW), NOW)
            .await
            .unwrap();
        let message = h.ledger.get_message(id).await.unwrap().unwrap();
        let payload = sign(&h.validators[0], MessageFields::from_message(&message));

        assert_eq!(
            h.proposer.handle_sign(conn, &payload).await.unwrap(),
            SignatureInsert::Inserted
        );
        assert_eq!(
            h.proposer.handle_sign(conn, &payload).await.unwrap(),
            SignatureInsert::Duplicate
        );
        assert_eq!(h.ledger.get_message(id).await.unwrap().unwrap().signatures_count, 1);
    }

    #[tokio::test]
    async fn test_sign_from_another_key_is_rejected() {
        let h = harness(StaticProof::valid());
        let id = stored_message(&h).await;
        let (conn, _rx) = connect(&h).await;
        h.proposer
            .handle_login(conn, &login(&h.validators[0], 1, NOW), NOW)
            .await
            .unwrap();
        let message = h.ledger.get_message(id).await.unwrap().unwrap();

        let payload = sign(&h.validators[1], MessageFields::from_message(&message));
        let err = h.proposer.handle_sign(conn, &payload).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SignError>(),
            Some(SignError::SignerMismatch { .. })
        ));
        assert_eq!(h.ledger.get_message(id).await.unwrap().unwrap().signatures_count, 0);
    }

    #[tokio::test]
    async fn test_sign_over_altered_fields_is_rejected() {
        let h = harness(StaticProof::valid());
        let id = stored_message(&h).await;
        let (conn, _rx) = connect(&h).await;
        h.proposer
            .handle_login(conn, &login(&h.validators[0], 1, NOW), NOW)
            .await
            .unwrap();
        let message = h.ledger.get_message(id).await.unwrap().unwrap();

        let mut fields = MessageFields::from_message(&message);
        fields.data = "0x00".to_string();
        let err = h
            .proposer
            .handle_sign(conn, &sign(&h.validators[0], fields))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SignError>(),
            Some(SignError::FieldMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_threshold_promotion() {
        let h = harness(StaticProof::valid());
        let id = stored_message(&h).await;
        let message = h.ledger.get_message(id).await.unwrap().unwrap();

        let mut promoted = Vec::new();
        for validator in &h.validators[..2] {
            let (conn, _rx) = connect(&h).await;
            h.proposer
                .handle_login(conn, &login(validator, 1, NOW), NOW)
                .await
                .unwrap();
            h.proposer
                .handle_sign(conn, &sign(validator, MessageFields::from_message(&message)))
                .await
                .unwrap();
            promoted.push(h.proposer.promote_ready().await.unwrap());
        }

        assert_eq!(promoted, vec![0, 1]);
        assert_eq!(
            h.ledger.get_message(id).await.unwrap().unwrap().status,
            MessageStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_proposals_reach_only_logged_in_validators() {
        let h = harness(StaticProof::valid());
        let id = stored_message(&h).await;
        let (conn, mut rx) = connect(&h).await;
        let (_anonymous, mut anonymous_rx) = connect(&h).await;
        h.proposer
            .handle_login(conn, &login(&h.validators[0], 1, NOW), NOW)
            .await
            .unwrap();

        assert_eq!(h.proposer.propose_pending().await.unwrap(), 1);

        let frame = Frame::decode(&rx.recv().await.unwrap()).unwrap();
        let proposal: ProposalPayload = frame.payload(FrameKind::Proposal).unwrap();
        assert_eq!(proposal.fields.message_id, id);
        assert!(anonymous_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unprovable_message_is_marked_invalid() {
        let h = harness(StaticProof::invalid());
        let id = stored_message(&h).await;
        let (conn, mut rx) = connect(&h).await;
        h.proposer
            .handle_login(conn, &login(&h.validators[0], 1, NOW), NOW)
            .await
            .unwrap();

        assert_eq!(h.proposer.propose_pending().await.unwrap(), 0);
        assert_eq!(
            h.ledger.get_message(id).await.unwrap().unwrap().status,
            MessageStatus::Invalid
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_source_chain_changes_nothing() {
        let h = harness(StaticProof::failing("connection refused"));
        let id = stored_message(&h).await;

        assert_eq!(h.proposer.propose_pending().await.unwrap(), 0);
        assert_eq!(h.verifier.calls(), 1);
        assert_eq!(
            h.ledger.get_message(id).await.unwrap().unwrap().status,
            MessageStatus::Validating
        );
    }

    #[tokio::test]
    async fn test_sign_for_foreign_rows_is_rejected() {
        let h = harness(StaticProof::valid());
        let (conn, _rx) = connect(&h).await;
        h.proposer
            .handle_login(conn, &login(&h.validators[0], 1, NOW), NOW)
            .await
            .unwrap();

        // a Send leg living on chain 3
        let mut foreign = new_message(&sample_message());
        foreign.chain_id = 3;
        foreign.message_type = MessageType::Send;
        foreign.status = MessageStatus::Pending;
        let foreign_id = h.ledger.insert_message(&foreign).await.unwrap().unwrap();
        // a Call on this chain's ledger scope but of the wrong type
        let mut send = new_message(&sample_message());
        send.message_type = MessageType::Send;
        send.tx_hash = format!("0x{}", "bb".repeat(32));
        let send_id = h.ledger.insert_message(&send).await.unwrap().unwrap();

        for id in [foreign_id, send_id] {
            let message = h.ledger.get_message(id).await.unwrap().unwrap();
            let payload = sign(&h.validators[0], MessageFields::from_message(&message));
            let err = h.proposer.handle_sign(conn, &payload).await.unwrap_err();

            assert!(matches!(
                err.downcast_ref::<SignError>(),
                Some(SignError::WrongScope(rejected)) if *rejected == id
            ));
            assert_eq!(h.ledger.get_message(id).await.unwrap().unwrap().signatures_count, 0);
        }
        assert!(h.ledger.message_signatures(foreign_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_signer_after_promotion_is_not_counted() {
        let h = harness(StaticProof::valid());
        let id = stored_message(&h).await;
        let message = h.ledger.get_message(id).await.unwrap().unwrap();

        let mut conns = Vec::new();
        for validator in &h.validators[..2] {
            let (conn, rx) = connect(&h).await;
            h.proposer
                .handle_login(conn, &login(validator, 1, NOW), NOW)
                .await
                .unwrap();
            h.proposer
                .handle_sign(conn, &sign(validator, MessageFields::from_message(&message)))
                .await
                .unwrap();
            conns.push((conn, rx));
        }
        assert_eq!(h.proposer.promote_ready().await.unwrap(), 1);

        let payload = sign(&h.validators[0], MessageFields::from_message(&message));
        assert_eq!(
            h.proposer.handle_sign(conns[0].0, &payload).await.unwrap(),
            SignatureInsert::Duplicate
        );

        let stored = h.ledger.get_message(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.signatures_count, 2);
        assert_eq!(h.ledger.message_signatures(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replayed_login_does_not_bind_another_connection() {
        let h = harness(StaticProof::valid());
        let (honest, _rx) = connect(&h).await;
        let (replayer, _replayer_rx) = connect(&h).await;
        let captured = login(&h.validators[0], 1, NOW);

        h.proposer.handle_login(honest, &captured, NOW).await.unwrap();
        let replay = h.proposer.handle_login(replayer, &captured, NOW + 1).await;

        assert_eq!(replay, Err(LoginError::Replayed(h.validators[0].address())));
        assert_eq!(h.proposer.sessions().signer(replayer).await, None);
        assert_eq!(
            h.proposer.sessions().signer(honest).await,
            Some(h.validators[0].address())
        );
    }

    #[tokio::test]
    async fn test_fresh_login_moves_validator_to_new_connection() {
        let h = harness(StaticProof::valid());
        let (old, _old_rx) = connect(&h).await;
        let (new, _new_rx) = connect(&h).await;

        h.proposer
            .handle_login(old, &login(&h.validators[0], 1, NOW), NOW)
            .await
            .unwrap();
        h.proposer
            .handle_login(new, &login(&h.validators[0], 1, NOW + 2), NOW + 2)
            .await
            .unwrap();

        assert_eq!(h.proposer.sessions().signer(old).await, None);
        assert_eq!(h.proposer.sessions().authenticated_count().await, 1);
    }
}
