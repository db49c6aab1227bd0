//! ABOUTME: Webhook trigger authorization - token digest and CIDR allow-list
//! ABOUTME: Source address is filtered before the token is checked

use ch_core::{Error, Result};
use ch_db::Workflow;
use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Authorizes webhook-triggered workflow executes
#[derive(Debug, Clone)]
pub struct WebhookGate {
    pepper: String,
}

impl WebhookGate {
    pub fn new(pepper: String) -> Self {
        Self { pepper }
    }

    /// Digest to persist on the workflow when an operator sets its token
    pub fn token_digest(&self, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.pepper.as_bytes());
        hasher.update(b":");
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Check source address and presented key against the stored digest.
    /// The CIDR allow-list filters first; an empty list admits any source.
    pub fn authorize(&self, workflow: &Workflow, key: &str, source: IpAddr) -> Result<()> {
        let cidrs = workflow.parse_allow_cidrs()?;
        if !cidrs.is_empty() {
            let admitted = cidrs
                .iter()
                .any(|cidr| cidr_contains(cidr, source).unwrap_or(false));
            if !admitted {
                return Err(Error::Forbidden(format!(
                    "Source {} is not on the webhook allow-list",
                    source
                )));
            }
        }

        let stored = workflow
            .webhook_token_digest
            .as_deref()
            .ok_or_else(|| Error::Forbidden("Workflow has no webhook token".to_string()))?;

        let presented = self.token_digest(key);
        if !constant_shape_eq(stored.as_bytes(), presented.as_bytes()) {
            return Err(Error::Forbidden("Webhook token mismatch".to_string()));
        }
        Ok(())
    }
}

/// Compare without early exit on the first differing byte
fn constant_shape_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// `a.b.c.d/len` membership test; a bare address means /32 (or /128)
fn cidr_contains(cidr: &str, addr: IpAddr) -> Result<bool> {
    let (net, len) = match cidr.split_once('/') {
        Some((net, len)) => {
            let len: u8 = len
                .parse()
                .map_err(|_| Error::BadRequest(format!("Invalid CIDR '{}'", cidr)))?;
            (net, Some(len))
        }
        None => (cidr, None),
    };
    let net: IpAddr = net
        .parse()
        .map_err(|_| Error::BadRequest(format!("Invalid CIDR '{}'", cidr)))?;

    match (net, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let len = len.unwrap_or(32);
            if len > 32 {
                return Err(Error::BadRequest(format!("Invalid CIDR '{}'", cidr)));
            }
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
            Ok(u32::from(net) & mask == u32::from(addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let len = len.unwrap_or(128);
            if len > 128 {
                return Err(Error::BadRequest(format!("Invalid CIDR '{}'", cidr)));
            }
            let mask = if len == 0 {
                0
            } else {
                u128::MAX << (128 - len)
            };
            Ok(u128::from(net) & mask == u128::from(addr) & mask)
        }
        _ => Ok(false),
    }
}
