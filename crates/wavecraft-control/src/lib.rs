//! Control-plane client.
//!
//! Before every turn the caller asks the control plane for a fresh synthesis
//! endpoint ([`EndpointResolver`]); after the turn it reports the outcome
//! ([`TurnSettlement`]). Endpoints carry a short-lived credential and are
//! never cached or reused.

use async_trait::async_trait;
use thiserror::Error;

use wavecraft_core::types::Endpoint;

pub mod http;

pub use http::ControlPlaneClient;

/// Why a turn could not obtain an endpoint.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("control plane unreachable: {0}")]
    Network(String),

    #[error("control plane rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed control plane response: {0}")]
    Malformed(String),

    #[error("endpoint credential unusable: {0}")]
    Credential(String),
}

#[derive(Debug, Error)]
#[error("settlement failed: {0}")]
pub struct SettlementError(pub String);

/// Resolves a one-shot connection target for a turn.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Obtain a fresh endpoint. No retries are attempted.
    async fn resolve(&self, intent: &str) -> Result<Endpoint, ResolutionError>;
}

/// Reports a turn's outcome back to the control plane.
#[async_trait]
pub trait TurnSettlement: Send + Sync {
    /// Confirm a turn that reached the synthesis service.
    async fn confirm(
        &self,
        session_id: &str,
        success: bool,
        actual_text_length: usize,
    ) -> Result<(), SettlementError>;

    /// Cancel a turn that was abandoned before any text was sent.
    async fn cancel(&self, session_id: &str) -> Result<(), SettlementError>;
}
