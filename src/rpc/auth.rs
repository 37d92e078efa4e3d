// Accept-time authorization for the overlay RPC transport.
//
// Denials are silent on the wire: the stream is closed without a reply so
// an unauthorized caller cannot distinguish "not on the list" from "rate
// limited". The server logs the reason at debug level with the peer id.

use libp2p::PeerId;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use super::rate_limit::RateLimiter;
use crate::config::RpcConfig;
use crate::error::{BibError, Result};

/// Durable allow-list lookup. `is_allowed` returns false for peers that
/// are absent or whose grant has expired.
#[async_trait::async_trait]
pub trait AllowListRepository: Send + Sync {
    async fn is_allowed(&self, peer: &PeerId) -> Result<bool>;
}

pub struct Authorizer {
    bootstrap: HashSet<PeerId>,
    repository: Option<Arc<dyn AllowListRepository>>,
    limiter: Arc<RateLimiter>,
}

impl Authorizer {
    pub fn new(config: &RpcConfig, repository: Option<Arc<dyn AllowListRepository>>) -> Self {
        let bootstrap = config
            .bootstrap_allowlist
            .iter()
            .filter_map(|s| match PeerId::from_str(s) {
                Ok(peer) => Some(peer),
                Err(_) => {
                    tracing::warn!(peer = %s, "Ignoring unparseable allow-list peer id");
                    None
                }
            })
            .collect();

        Self {
            bootstrap,
            repository,
            limiter: Arc::new(RateLimiter::new(
                config.requests_per_second,
                config.burst_size,
                config.cleanup_interval(),
            )),
        }
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Admit or silently reject a peer. Bootstrap peers skip every other
    /// check; everyone else must pass the repository lookup and then the
    /// rate limiter.
    pub async fn check(&self, peer: &PeerId) -> Result<()> {
        if self.bootstrap.contains(peer) {
            return Ok(());
        }

        match &self.repository {
            Some(repository) => {
                if !repository.is_allowed(peer).await? {
                    tracing::debug!(peer = %peer, "RPC peer not on allow-list");
                    return Err(BibError::Unauthorized);
                }
            }
            None => {
                tracing::debug!(peer = %peer, "RPC rejected: no allow-list repository configured");
                return Err(BibError::Unauthorized);
            }
        }

        if !self.limiter.allow(peer) {
            tracing::debug!(peer = %peer, "RPC peer rate limited");
            return Err(BibError::RateLimited);
        }
        Ok(())
    }
}

/// Server-side guard refusing administrative and emergency-access
/// services over the overlay, regardless of authorization.
pub struct RestrictedServiceInterceptor {
    prefixes: Vec<String>,
}

impl RestrictedServiceInterceptor {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    /// Check a method routing id (e.g. `/bib.admin.NodeAdmin/Restart`).
    pub fn check(&self, method: &str) -> Result<()> {
        for prefix in &self.prefixes {
            if method.starts_with(prefix.as_str()) {
                tracing::debug!(method, "Refusing restricted service over the overlay");
                return Err(BibError::Unauthorized);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRepo {
        allowed: HashSet<PeerId>,
    }

    #[async_trait::async_trait]
    impl AllowListRepository for StaticRepo {
        async fn is_allowed(&self, peer: &PeerId) -> Result<bool> {
            Ok(self.allowed.contains(peer))
        }
    }

    fn config_with(bootstrap: &[PeerId]) -> RpcConfig {
        RpcConfig {
            bootstrap_allowlist: bootstrap.iter().map(|p| p.to_string()).collect(),
            requests_per_second: 100.0,
            burst_size: 100.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bootstrap_peers_bypass_everything() {
        let boot = PeerId::random();
        // No repository configured at all.
        let authorizer = Authorizer::new(&config_with(&[boot]), None);
        assert!(authorizer.check(&boot).await.is_ok());
        assert!(matches!(
            authorizer.check(&PeerId::random()).await.unwrap_err(),
            BibError::Unauthorized
        ));
    }

    #[tokio::test]
    async fn test_repository_gate() {
        let allowed = PeerId::random();
        let repo = StaticRepo {
            allowed: [allowed].into_iter().collect(),
        };
        let authorizer = Authorizer::new(&config_with(&[]), Some(Arc::new(repo)));

        assert!(authorizer.check(&allowed).await.is_ok());
        assert!(matches!(
            authorizer.check(&PeerId::random()).await.unwrap_err(),
            BibError::Unauthorized
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_applies_after_allow_list() {
        let allowed = PeerId::random();
        let repo = StaticRepo {
            allowed: [allowed].into_iter().collect(),
        };
        let mut config = config_with(&[]);
        config.requests_per_second = 1.0;
        config.burst_size = 2.0;
        let authorizer = Authorizer::new(&config, Some(Arc::new(repo)));

        assert!(authorizer.check(&allowed).await.is_ok());
        assert!(authorizer.check(&allowed).await.is_ok());
        assert!(matches!(
            authorizer.check(&allowed).await.unwrap_err(),
            BibError::RateLimited
        ));
    }

    #[test]
    fn test_restricted_prefixes() {
        let interceptor = RestrictedServiceInterceptor::new(vec![
            "/bib.admin.".to_string(),
            "/bib.breakglass.".to_string(),
        ]);
        assert!(interceptor.check("/bib.data.Datasets/Get").is_ok());
        assert!(interceptor.check("/bib.admin.NodeAdmin/Restart").is_err());
        assert!(interceptor
            .check("/bib.breakglass.Sessions/Enable")
            .is_err());
    }
}
