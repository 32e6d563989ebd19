//! Core data model: assurance levels, sessions and transition markers.

pub mod assurance;
pub mod marker;
pub mod session;

pub use assurance::{AssuranceLevel, ResourceClass, StepUpMethod};
pub use marker::{MarkerConsumption, MarkerToken, TransitionMarker};
pub use session::{
    Elevation, PendingStepUp, RevocationReason, Session, SessionId, SessionState,
};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Generates a 256-bit random token, base64url-encoded without padding.
pub(crate) fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Returns at most the first eight characters of a token.
pub(crate) fn short_token(token: &str) -> &str {
    match token.char_indices().nth(8) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}
