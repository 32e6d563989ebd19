//! # sting-auth
//!
//! Session assurance coordination for STING.
//!
//! This crate decides, for a given principal, whether they are
//! authenticated, at which assurance level (AAL1 or AAL2), and which
//! transition is required next. It provides:
//! - A versioned assurance store with compare-and-swap writes
//! - An identity provider adapter boundary with idempotent step-up completion
//! - The session state machine, including the read-then-bridge-then-confirm
//!   handling of just-completed authentication
//! - Short-lived transition markers
//! - A stateless route gate returning `allow`, `require_step_up`, `deny` or
//!   `pending`
//!
//! ## Modules
//!
//! - [`types`] - Sessions, assurance levels and transition markers
//! - [`storage`] - Storage traits and in-memory implementations
//! - [`provider`] - Identity provider adapter trait and HTTP adapter
//! - [`marker`] - Transition marker service
//! - [`coordinator`] - The session assurance state machine
//! - [`gate`] - Route authorization decisions
//! - [`audit`] - Audit events for durable transitions
//! - [`config`] - Configuration and loader
//! - [`error`] - Error taxonomy

#![warn(missing_docs)]

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod marker;
pub mod provider;
pub mod storage;
pub mod types;

pub use crate::config::{AssuranceConfig, ConfigError};
pub use coordinator::{
    Assessment, CleanupStats, EstablishedSession, SessionCoordinator, StepUpOutcome, StepUpStart,
};
pub use error::{AuthError, ErrorCategory};
pub use gate::{Authorization, GateDecision, RouteGate};
pub use marker::TransitionMarkers;
pub use provider::{
    Challenge, HttpIdentityProvider, IdentityProvider, PrimaryCredential, ProviderError,
    ReplayGuard, StepUpResponse, StepUpResult, VerifiedPrincipal, build_provider,
};
pub use storage::{
    AssuranceStore, InMemoryAssuranceStore, InMemoryMarkerStorage, MarkerClaim, MarkerStorage,
    StoreError,
};
pub use types::{
    AssuranceLevel, MarkerConsumption, MarkerToken, ResourceClass, RevocationReason, Session,
    SessionId, SessionState, StepUpMethod, TransitionMarker,
};

/// Type alias for assurance results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use sting_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::config::{AssuranceConfig, ConfigError};
    pub use crate::coordinator::{Assessment, SessionCoordinator, StepUpOutcome, StepUpStart};
    pub use crate::error::{AuthError, ErrorCategory};
    pub use crate::gate::{Authorization, GateDecision, RouteGate};
    pub use crate::provider::{IdentityProvider, PrimaryCredential, StepUpResponse};
    pub use crate::storage::{AssuranceStore, MarkerStorage};
    pub use crate::types::{
        AssuranceLevel, MarkerToken, ResourceClass, RevocationReason, Session, SessionId,
        SessionState, StepUpMethod,
    };
}
