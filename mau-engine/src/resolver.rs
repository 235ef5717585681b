use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use mau_core::fingerprint::Fingerprint;

use crate::context::SyncContext;
use crate::discovery;

/// Maps a fingerprint to an address the sync client can dial.
///
/// Resolvers are tried in order; returning `None` passes to the next one.
#[async_trait]
pub trait FingerprintResolver: fmt::Debug + Send + Sync {
    async fn resolve(&self, ctx: &SyncContext, fingerprint: &Fingerprint) -> Option<String>;
}

/// Always answers with the same address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticAddress(String);

impl StaticAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }
}

#[async_trait]
impl FingerprintResolver for StaticAddress {
    async fn resolve(&self, _ctx: &SyncContext, _fingerprint: &Fingerprint) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Finds friends advertising themselves on the local network.
#[derive(Clone, Debug)]
pub struct LocalFriendAddress {
    pub timeout: Duration,
}

impl Default for LocalFriendAddress {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl LocalFriendAddress {
    /// Browse window for one lookup: the configured timeout, cut short by the
    /// context deadline so the blocking browse never outlives the sync.
    fn browse_window(&self, ctx: &SyncContext) -> Duration {
        ctx.remaining().map_or(self.timeout, |left| left.min(self.timeout))
    }
}

#[async_trait]
impl FingerprintResolver for LocalFriendAddress {
    async fn resolve(&self, ctx: &SyncContext, fingerprint: &Fingerprint) -> Option<String> {
        let window = self.browse_window(ctx);
        match ctx.run(discovery::discover(*fingerprint, window)).await {
            Ok(Ok(found)) => found.map(|addr| addr.to_string()),
            Ok(Err(e)) => {
                warn!(fingerprint = %fingerprint, error = %e, "Local discovery failed");
                None
            }
            Err(interrupted) => {
                debug!(fingerprint = %fingerprint, reason = %interrupted, "Local discovery interrupted");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_fingerprint() -> Fingerprint {
        "00112233445566778899aabbccddeeff00112233".parse().unwrap()
    }

    #[tokio::test]
    async fn given_static_address_when_resolved_then_returned_verbatim() {
        let resolver = StaticAddress::new("192.0.2.7:4242");
        let resolved = resolver.resolve(&SyncContext::background(), &some_fingerprint()).await;
        assert_eq!(resolved.as_deref(), Some("192.0.2.7:4242"));
    }

    #[tokio::test]
    async fn given_cancelled_context_when_discovering_then_none() {
        let ctx = SyncContext::background();
        ctx.cancel();
        let resolver = LocalFriendAddress {
            timeout: Duration::from_secs(30),
        };
        assert_eq!(resolver.resolve(&ctx, &some_fingerprint()).await, None);
    }

    #[test]
    fn given_context_deadline_sooner_than_timeout_when_browsing_then_window_follows_deadline() {
        let resolver = LocalFriendAddress {
            timeout: Duration::from_secs(30),
        };
        let window = resolver.browse_window(&SyncContext::with_timeout(Duration::from_secs(2)));
        assert!(window <= Duration::from_secs(2));
        assert!(window > Duration::from_secs(1));
    }

    #[test]
    fn given_context_without_deadline_when_browsing_then_configured_timeout_used() {
        let resolver = LocalFriendAddress {
            timeout: Duration::from_secs(3),
        };
        assert_eq!(resolver.browse_window(&SyncContext::background()), Duration::from_secs(3));
        let roomy = SyncContext::with_timeout(Duration::from_secs(60));
        assert_eq!(resolver.browse_window(&roomy), Duration::from_secs(3));
    }
}
