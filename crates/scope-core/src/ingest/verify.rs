//! Webhook signature checks (HMAC-SHA256)

use anyhow::{anyhow, bail, Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// GitHub `X-Hub-Signature-256: sha256=<hex>` over the raw body.
pub fn verify_github(body: &[u8], signature_header: &str, secret: &str) -> Result<()> {
    let digest = signature_header
        .strip_prefix("sha256=")
        .ok_or_else(|| anyhow!("signature must use sha256=<hex> format"))?;
    verify(secret, &[body], digest)
}

/// Slack `X-Slack-Signature: v0=<hex>` over `v0:{timestamp}:{body}`.
pub fn verify_slack(body: &[u8], timestamp: &str, signature_header: &str, secret: &str) -> Result<()> {
    let digest = signature_header
        .strip_prefix("v0=")
        .ok_or_else(|| anyhow!("signature must use v0=<hex> format"))?;
    let prefix = format!("v0:{timestamp}:");
    verify(secret, &[prefix.as_bytes(), body], digest)
}

fn verify(secret: &str, parts: &[&[u8]], digest_hex: &str) -> Result<()> {
    let expected = decode_hex(digest_hex)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .context("failed to initialize hmac verifier")?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(&expected)
        .map_err(|_| anyhow!("signature verification failed"))
}

fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("signature digest cannot be empty");
    }
    hex::decode(trimmed).context("signature digest is not valid hex")
}

#[cfg(test)]
pub(crate) fn sign_hex(secret: &str, parts: &[&[u8]]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    for part in parts {
        mac.update(part);
    }
    hex::encode(mac.finalize().into_bytes())
}
