//! Assurance levels, resource classes and step-up methods.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Authentication assurance level.
///
/// Levels are totally ordered: `None < Aal1 < Aal2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssuranceLevel {
    /// No verified identity.
    None,
    /// Single-factor authentication.
    Aal1,
    /// Multi-factor authentication (after a verified step-up).
    Aal2,
}

impl AssuranceLevel {
    /// Returns `true` if this level meets `required`.
    #[must_use]
    pub fn satisfies(self, required: AssuranceLevel) -> bool {
        self >= required
    }

    /// Returns the level as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Aal1 => "aal1",
            Self::Aal2 => "aal2",
        }
    }
}

impl fmt::Display for AssuranceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sensitivity class of a protected resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    /// Open to anyone.
    Public,
    /// Requires a signed-in principal.
    Basic,
    /// Requires a step-up verified session.
    Elevated,
}

impl ResourceClass {
    /// Returns the assurance level a session needs to reach this resource.
    #[must_use]
    pub fn required_level(self) -> AssuranceLevel {
        match self {
            Self::Public => AssuranceLevel::None,
            Self::Basic => AssuranceLevel::Aal1,
            Self::Elevated => AssuranceLevel::Aal2,
        }
    }

    /// Returns the class as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Basic => "basic",
            Self::Elevated => "elevated",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "basic" => Ok(Self::Basic),
            "elevated" => Ok(Self::Elevated),
            other => Err(format!("unknown resource class: {other}")),
        }
    }
}

/// A second-factor ceremony a principal can enroll in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepUpMethod {
    /// Hardware- or platform-backed passkey.
    Passkey,
    /// Time-based one-time code.
    Totp,
    /// Single-use recovery code.
    RecoveryCode,
}

impl StepUpMethod {
    /// Returns the method as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passkey => "passkey",
            Self::Totp => "totp",
            Self::RecoveryCode => "recovery_code",
        }
    }
}

impl fmt::Display for StepUpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepUpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passkey" | "webauthn" => Ok(Self::Passkey),
            "totp" => Ok(Self::Totp),
            "recovery_code" | "lookup_secret" => Ok(Self::RecoveryCode),
            other => Err(format!("unknown step-up method: {other}")),
        }
    }
}
