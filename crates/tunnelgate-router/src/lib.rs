//! Target resolution for inbound HTTP requests
//!
//! Decides which upstream a request arriving at this node should be relayed
//! to. Resolution order:
//!
//! 1. An explicit `X-Tunnelgate-Target` header on the request
//! 2. The first configured rule whose pattern matches the request path

pub mod rules;

pub use rules::{ProxyRule, ProxyRules, RouterError};

/// Maps an inbound request to the target URL it should be relayed to
pub trait TargetResolver: Send + Sync {
    /// `None` means the request has nowhere to go
    fn resolve(&self, parts: &http::request::Parts) -> Option<String>;
}
