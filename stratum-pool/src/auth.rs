//! Worker authorization.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::codec;

/// A `mining.authorize` request.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub ip: IpAddr,
    pub port: u16,
    pub worker: String,
    pub password: String,
}

/// Authorizer verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeResult {
    pub authorized: bool,
    /// Error message returned to the miner alongside the result.
    pub error: Option<String>,
    /// Close the connection after replying.
    pub disconnect: bool,
}

impl AuthorizeResult {
    pub fn allow() -> Self {
        Self {
            authorized: true,
            error: None,
            disconnect: false,
        }
    }

    pub fn deny(error: impl Into<String>) -> Self {
        Self {
            authorized: false,
            error: Some(error.into()),
            disconnect: false,
        }
    }
}

/// Decides whether a worker may submit shares.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: &AuthorizeRequest) -> AuthorizeResult;
}

/// Authorizes every worker.
#[derive(Debug, Default)]
pub struct AcceptAll;

#[async_trait]
impl Authorizer for AcceptAll {
    async fn authorize(&self, _request: &AuthorizeRequest) -> AuthorizeResult {
        AuthorizeResult::allow()
    }
}

/// Requires the worker name to be a payout address, optionally followed
/// by `.rig` to tell a miner's machines apart.
#[derive(Debug, Default)]
pub struct AddressAuthorizer;

impl AddressAuthorizer {
    /// Address part of a worker name.
    pub fn address(worker: &str) -> &str {
        worker.split_once('.').map_or(worker, |(address, _)| address)
    }
}

#[async_trait]
impl Authorizer for AddressAuthorizer {
    async fn authorize(&self, request: &AuthorizeRequest) -> AuthorizeResult {
        match codec::decode_address(Self::address(&request.worker)) {
            Ok(_) => AuthorizeResult::allow(),
            Err(e) => AuthorizeResult::deny(format!("invalid payout address: {}", e)),
        }
    }
}

/// Built-in authorization policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationMode {
    /// Any worker name is accepted.
    Any,
    /// Worker names must start with a valid payout address.
    #[default]
    Address,
}

impl AuthorizationMode {
    pub fn authorizer(self) -> Arc<dyn Authorizer> {
        match self {
            AuthorizationMode::Any => Arc::new(AcceptAll),
            AuthorizationMode::Address => Arc::new(AddressAuthorizer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn request(worker: &str) -> AuthorizeRequest {
        AuthorizeRequest {
            ip: Ipv4Addr::LOCALHOST.into(),
            port: 3333,
            worker: worker.into(),
            password: "x".into(),
        }
    }

    #[tokio::test]
    async fn test_accept_all() {
        let result = AcceptAll.authorize(&request("anything")).await;
        assert_eq!(result, AuthorizeResult::allow());
    }

    #[tokio::test]
    async fn test_address_authorizer() {
        let auth = AddressAuthorizer;

        let ok = auth
            .authorize(&request("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa.rig1"))
            .await;
        assert!(ok.authorized);

        let bad = auth.authorize(&request("not-an-address")).await;
        assert!(!bad.authorized);
        assert!(bad.error.unwrap().starts_with("invalid payout address"));
        assert!(!bad.disconnect);
    }

    #[test]
    fn test_address_part() {
        assert_eq!(AddressAuthorizer::address("addr.rig.extra"), "addr");
        assert_eq!(AddressAuthorizer::address("addr"), "addr");
    }
}
