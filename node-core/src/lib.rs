//! The node-side collaborators that sit outside consensus proper: the
//! AI safety kernel (§4.7), the sandbox capability guard fronting
//! mini-apps and AI agents, the API key/rate gate fronting the HTTP
//! surface, and the [`node::Node`] orchestrator wiring them together
//! with [`ledger_core`]'s chain, mempool, swap and sponsorship
//! engines.

pub mod ai_safety;
pub mod api_auth;
pub mod inspector;
pub mod node;
pub mod peer;
pub mod sandbox;

pub use ai_safety::{AiCapability, AiSafetyKernel, ProviderLimits, SafetyLevel, StopReason};
pub use api_auth::{ApiAuthGate, AuthOutcome, Scope};
pub use inspector::{inspect, Finding, SemanticAnalysisResult, Severity};
pub use node::{Node, StateSnapshot, UnavailableChainDataProvider};
pub use peer::{
    sign_peer_message, DiversityLimiter, OffenseSeverity, PeerAuthGate, PeerEnvelope, PeerLocation, PeerMessage,
    ReplayCache, ReputationTable,
};
pub use sandbox::{AccessLevel, AuditEntry, Capability, SandboxGuard};

pub use shared::{BlockchainError, Result};
