//! Validator: holds one connection to a proposer, verifies each proposal
//! against the source chain and signs the ones that hold up.
//!
//! A failed proof is never answered; the missing signature is the rejection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::eip712::{sign_hash, LoginTypedData};
use crate::metrics;
use crate::p2p::transport::send_frame;
use crate::p2p::{connect, Frame, FrameKind, LoginPayload, ProposalPayload, SignPayload};
use crate::verification::{ProofClaim, SourceProof};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const IDLE_POLL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
}

pub struct Validator {
    signer: PrivateKeySigner,
    verifier: Arc<dyn SourceProof>,
    endpoint: String,
    chain_id: u64,
    state: watch::Sender<ConnectionState>,
    reconnect_delay: Duration,
    label: String,
    last_login: AtomicU64,
}

impl Validator {
    pub fn new(
        signer: PrivateKeySigner,
        verifier: Arc<dyn SourceProof>,
        endpoint: impl Into<String>,
        chain_id: u64,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            signer,
            verifier,
            endpoint: endpoint.into(),
            chain_id,
            state,
            reconnect_delay: RECONNECT_DELAY,
            label: chain_id.to_string(),
            last_login: AtomicU64::new(0),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Follow the connection state
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Each login gets a later timestamp than the last; the proposer refuses
    /// a repeated one.
    fn login_timestamp(&self, now: u64) -> u64 {
        let mut last = self.last_login.load(Ordering::SeqCst);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last_login
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    pub fn login_payload(&self, now: u64) -> Result<LoginPayload> {
        let typed = LoginTypedData {
            chain_id: self.chain_id,
            account: self.address(),
            timestamp: now,
        };
        Ok(LoginPayload {
            chain_id: self.chain_id,
            account: format!("{:#x}", self.address()),
            timestamp: now,
            signature: sign_hash(&self.signer, typed.signing_hash())?,
        })
    }

    /// Verify a proposal and sign it; `None` when the source chain disagrees
    pub async fn sign_proposal(&self, proposal: &ProposalPayload) -> Result<Option<SignPayload>> {
        let message_id = proposal.fields.message_id;
        match self.verifier.verify(&ProofClaim::from_proposal(proposal)).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(message_id, tx_hash = %proposal.tx_hash, "Source proof rejected, not signing");
                metrics::record_rejected_proposal(&self.label, "proof");
                return Ok(None);
            }
            Err(e) => {
                warn!(message_id, error = %e, "Could not verify proposal");
                metrics::record_rejected_proposal(&self.label, "unverifiable");
                return Err(e);
            }
        }

        let signature = match proposal
            .fields
            .send_typed_data()
            .map_err(eyre::Report::from)
            .and_then(|typed| sign_hash(&self.signer, typed.signing_hash()))
        {
            Ok(signature) => signature,
            Err(e) => {
                warn!(message_id, error = %e, "Failed to sign proposal");
                metrics::record_rejected_proposal(&self.label, "signing");
                return Err(e);
            }
        };
        Ok(Some(SignPayload {
            fields: proposal.fields.clone(),
            signature,
        }))
    }

    /// Connect, log in, and answer proposals until the stream ends
    pub async fn run_session(&self) -> Result<()> {
        self.state.send_replace(ConnectionState::Connecting);
        let mut stream = connect(&self.endpoint).await?;

        let now = self.login_timestamp(chrono::Utc::now().timestamp().max(0) as u64);
        let login = Frame::new(FrameKind::Login, &self.login_payload(now)?)?;
        send_frame(&mut stream, &login)
            .await
            .wrap_err("Failed to send login")?;
        self.state.send_replace(ConnectionState::Authenticated);
        info!(endpoint = %self.endpoint, account = %self.address(), "Logged in to proposer");

        let mut idle = tokio::time::interval(IDLE_POLL);
        idle.tick().await;
        loop {
            tokio::select! {
                line = stream.next() => {
                    let line = match line {
                        Some(Ok(line)) => line,
                        Some(Err(e)) => return Err(eyre!("read failed: {}", e)),
                        None => return Err(eyre!("proposer closed the stream")),
                    };
                    if let Some(reply) = self.handle_line(&line).await {
                        send_frame(&mut stream, &reply)
                            .await
                            .wrap_err("Failed to send signature")?;
                    }
                }
                _ = idle.tick() => {
                    debug!(endpoint = %self.endpoint, "Connection idle");
                }
            }
        }
    }

    async fn handle_line(&self, line: &str) -> Option<Frame> {
        let proposal = match Frame::decode(line)
            .and_then(|frame| frame.payload::<ProposalPayload>(FrameKind::Proposal))
        {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!(error = %e, "Ignoring frame");
                return None;
            }
        };

        let message_id = proposal.fields.message_id;
        match self.sign_proposal(&proposal).await {
            Ok(Some(sign)) => match Frame::new(FrameKind::Sign, &sign) {
                Ok(frame) => {
                    debug!(message_id, "Signed proposal");
                    Some(frame)
                }
                Err(e) => {
                    warn!(message_id, error = %e, "Failed to encode signature");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!(message_id, error = %e, "Proposal dropped");
                None
            }
        }
    }

    /// Keep a session alive until shutdown, reconnecting after every failure
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!(
            endpoint = %self.endpoint,
            chain_id = self.chain_id,
            account = %self.address(),
            "Starting validator"
        );

        let mut attempts: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping validator");
                    self.state.send_replace(ConnectionState::Disconnected);
                    return Ok(());
                }
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }

            attempts += 1;
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping validator");
                    self.state.send_replace(ConnectionState::Disconnected);
                    return Ok(());
                }
                result = self.run_session() => {
                    if let Err(e) = result {
                        warn!(endpoint = %self.endpoint, attempt = attempts, error = %e, "Session ended, reconnecting");
                    }
                }
            }
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }
}
