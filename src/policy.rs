use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt};

use crate::error::{AdmissionError, Result};

/// Caller classification that selects a rate budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Never metered
    Unlimited,
    /// Authenticated free-tier caller, metered by user ID
    Standard,
    /// Anonymous caller, metered by network address
    Guest,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Unlimited => "unlimited",
            Tier::Standard => "standard",
            Tier::Guest => "guest",
        }
    }

    pub fn is_metered(self) -> bool {
        !matches!(self, Tier::Unlimited)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity established by upstream token validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    pub role: Option<String>,
}

impl AuthContext {
    pub fn new(user_id: impl Into<String>, role: Option<&str>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.map(str::to_string),
        }
    }
}

/// What the admission layer knows about an inbound request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Absent for guest traffic
    pub auth: Option<AuthContext>,
    /// Caller network address as seen by the HTTP layer
    pub client_addr: String,
}

impl AdmissionRequest {
    pub fn guest(client_addr: impl Into<String>) -> Self {
        Self {
            auth: None,
            client_addr: client_addr.into(),
        }
    }

    pub fn authenticated(auth: AuthContext, client_addr: impl Into<String>) -> Self {
        Self {
            auth: Some(auth),
            client_addr: client_addr.into(),
        }
    }
}

/// Outcome of classifying a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub tier: Tier,
    /// Bucket key within the tier. For unlimited callers this is the user ID
    /// and is only used for logging.
    pub identity: String,
}

/// Maps a request onto a tier and identity key.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    unlimited_roles: HashSet<String>,
}

impl AdmissionPolicy {
    pub fn new<I, S>(unlimited_roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            unlimited_roles: unlimited_roles.into_iter().map(Into::into).collect(),
        }
    }

    /// Classify a request.
    ///
    /// Fails when the identity that would key the bucket is empty, since
    /// defaulting it would make unrelated callers share one budget.
    pub fn classify(&self, request: &AdmissionRequest) -> Result<Classification> {
        match &request.auth {
            Some(auth) => {
                let unlimited = auth
                    .role
                    .as_deref()
                    .is_some_and(|role| self.unlimited_roles.contains(role));

                if unlimited {
                    return Ok(Classification {
                        tier: Tier::Unlimited,
                        identity: auth.user_id.clone(),
                    });
                }

                let user_id = auth.user_id.trim();
                if user_id.is_empty() {
                    return Err(AdmissionError::Configuration(
                        "authenticated request has no user ID".to_string(),
                    ));
                }

                Ok(Classification {
                    tier: Tier::Standard,
                    identity: user_id.to_string(),
                })
            }
            None => {
                let addr = request.client_addr.trim();
                if addr.is_empty() {
                    return Err(AdmissionError::Configuration(
                        "guest request has no client address".to_string(),
                    ));
                }

                Ok(Classification {
                    tier: Tier::Guest,
                    identity: addr.to_string(),
                })
            }
        }
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::new(["user", "admin"])
    }
}
