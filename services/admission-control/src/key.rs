// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Counter key derivation.
//!
//! Keys are namespaced (`user:` / `ip:`) so an authenticated caller and an
//! anonymous one can never share a counter.

use crate::config::KeyStrategyKind;
use axum::http::{Extensions, HeaderMap};
use std::net::IpAddr;
use std::sync::Arc;

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Identity attached to a request by the host application's auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity(pub String);

/// Resolves the authenticated identity of a request, if any.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap, extensions: &Extensions) -> Option<String>;
}

/// Reads an [`AuthenticatedIdentity`] extension inserted upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionIdentity;

impl IdentityResolver for ExtensionIdentity {
    fn resolve(&self, _headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
        extensions
            .get::<AuthenticatedIdentity>()
            .map(|identity| identity.0.clone())
            .filter(|id| !id.trim().is_empty())
    }
}

/// What the key strategies may look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub identity: Option<String>,
    /// Client address, already resolved from forwarding headers
    pub origin: Option<IpAddr>,
}

impl RequestContext {
    /// Build from request parts. The first `X-Forwarded-For` hop wins, then
    /// `X-Real-IP`, then the socket peer address.
    pub fn from_parts(headers: &HeaderMap, peer: Option<IpAddr>, identity: Option<String>) -> Self {
        Self {
            identity,
            origin: forwarded_origin(headers).or(peer),
        }
    }
}

fn forwarded_origin(headers: &HeaderMap) -> Option<IpAddr> {
    let first_hop = headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|hop| hop.trim().parse().ok());

    first_hop.or_else(|| {
        headers
            .get(REAL_IP)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

/// Derives the counter key for a request.
pub trait KeyStrategy: Send + Sync + std::fmt::Debug {
    /// `None` when the request carries nothing the strategy can key on.
    fn derive_key(&self, ctx: &RequestContext) -> Option<String>;
}

/// `user:<id>` when authenticated, `ip:<origin>` otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityOrOrigin;

impl KeyStrategy for IdentityOrOrigin {
    fn derive_key(&self, ctx: &RequestContext) -> Option<String> {
        match ctx.identity.as_deref() {
            Some(id) => Some(format!("user:{}", id)),
            None => OriginOnly.derive_key(ctx),
        }
    }
}

/// Always `ip:<origin>`. Used where the identity is attacker-chosen, such
/// as login attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginOnly;

impl KeyStrategy for OriginOnly {
    fn derive_key(&self, ctx: &RequestContext) -> Option<String> {
        ctx.origin.map(|ip| format!("ip:{}", ip))
    }
}

impl KeyStrategyKind {
    pub fn strategy(self) -> Arc<dyn KeyStrategy> {
        match self {
            Self::IdentityOrOrigin => Arc::new(IdentityOrOrigin),
            Self::OriginOnly => Arc::new(OriginOnly),
        }
    }
}
