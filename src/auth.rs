//! Pluggable shared-secret check for peers connecting to the router.

use std::sync::Arc;

use subtle::ConstantTimeEq;

/// Decides whether a peer presenting `secret` may register.
pub trait Authenticator: Send + Sync {
    fn verify(&self, presented: Option<&str>) -> bool;
}

/// Accepts every peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn verify(&self, _presented: Option<&str>) -> bool {
        true
    }
}

/// Requires the peer to present one fixed secret.
#[derive(Clone)]
pub struct SharedSecret {
    secret: String,
}

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl Authenticator for SharedSecret {
    fn verify(&self, presented: Option<&str>) -> bool {
        let Some(presented) = presented else {
            return false;
        };
        presented.as_bytes().ct_eq(self.secret.as_bytes()).into()
    }
}

/// Authenticator for an optional configured secret.
pub fn from_secret(secret: Option<&str>) -> Arc<dyn Authenticator> {
    match secret {
        Some(s) if !s.is_empty() => Arc::new(SharedSecret::new(s)),
        _ => Arc::new(AllowAll),
    }
}
