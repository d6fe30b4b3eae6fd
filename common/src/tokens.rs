//! HMAC-signed tokens and webhook signature verification.
//!
//! Manage/cancel tokens grant one-click, login-free access to subscription
//! management from subscriber emails. They are `payload:signature` pairs
//! where the payload is `{subscription_id}:{expires_ms}` and the signature
//! is HMAC-SHA256 under the platform session secret, the whole thing
//! Base64URL encoded. Verification is constant-time and UUID-validates the
//! id after decode.

use std::{str::FromStr, time::Duration};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use sha2::{Sha256, Sha512};
use uuid::Uuid;

use crate::{constants::MANAGE_TOKEN_TTL, time::TimestampMs};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Allowed skew between a webhook signature timestamp and our clock.
const SIGNATURE_TOLERANCE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token is malformed")]
    Malformed,
    #[error("Token signature mismatch")]
    BadSignature,
    #[error("Token is expired")]
    Expired,
    #[error("Token payload is not a valid id")]
    BadId,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signature header is missing or malformed")]
    Malformed,
    #[error("Signature mismatch")]
    Mismatch,
    #[error("Signature timestamp outside tolerance")]
    Stale,
}

fn mac_sha256(secret: &Secret<String>, msg: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

/// Mint a manage/cancel token for a subscription, valid for 30 days.
pub fn mint_manage_token(
    secret: &Secret<String>,
    subscription_id: Uuid,
    now: TimestampMs,
) -> String {
    let expires = now.saturating_add(MANAGE_TOKEN_TTL);
    let payload = format!("{subscription_id}:{}", expires.as_ms());
    let sig = mac_sha256(secret, payload.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
    URL_SAFE_NO_PAD.encode(format!("{payload}:{sig_b64}"))
}

/// Verify a manage/cancel token, returning the subscription id it grants
/// access to.
pub fn verify_manage_token(
    secret: &Secret<String>,
    token: &str,
    now: TimestampMs,
) -> Result<Uuid, TokenError> {
    let decoded = URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(TokenError::Malformed)?;

    // payload is `{uuid}:{expires_ms}`; the signature is the third segment.
    let mut parts = decoded.splitn(3, ':');
    let id_str = parts.next().ok_or(TokenError::Malformed)?;
    let expires_str = parts.next().ok_or(TokenError::Malformed)?;
    let sig_b64 = parts.next().ok_or(TokenError::Malformed)?;

    let payload = format!("{id_str}:{expires_str}");
    let sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Malformed)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

    let expires_ms =
        i64::from_str(expires_str).map_err(|_| TokenError::Malformed)?;
    if now.as_ms() > expires_ms {
        return Err(TokenError::Expired);
    }

    Uuid::from_str(id_str).map_err(|_| TokenError::BadId)
}

/// Verify a `Stripe-Signature`-style header: `t={unix_secs},v1={hex_mac}`
/// where the MAC is HMAC-SHA256 over `"{t}.{body}"`.
pub fn verify_stripe_signature(
    secret: &Secret<String>,
    header: &str,
    body: &[u8],
    now: TimestampMs,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();
    for pair in header.split(',') {
        match pair.trim().split_once('=') {
            Some(("t", t)) => timestamp = i64::from_str(t).ok(),
            Some(("v1", v1)) => {
                if let Ok(mac) = decode_hex(v1) {
                    candidates.push(mac);
                }
            }
            _ => (),
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }

    let tolerance_ms = SIGNATURE_TOLERANCE.as_millis() as i64;
    if (now.as_ms() - timestamp * 1000).abs() > tolerance_ms {
        return Err(SignatureError::Stale);
    }

    let mut signed = timestamp.to_string().into_bytes();
    signed.push(b'.');
    signed.extend_from_slice(body);

    // A header may carry multiple v1 entries during secret rotation; accept
    // if any verifies.
    for candidate in candidates {
        let mut mac =
            HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
                .expect("HMAC accepts any key length");
        mac.update(&signed);
        if mac.verify_slice(&candidate).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

/// Verify an `x-paystack-signature`-style header: hex HMAC-SHA512 of the
/// raw body.
pub fn verify_paystack_signature(
    secret: &Secret<String>,
    header: &str,
    body: &[u8],
) -> Result<(), SignatureError> {
    let sig = decode_hex(header).map_err(|_| SignatureError::Malformed)?;
    let mut mac =
        HmacSha512::new_from_slice(secret.expose_secret().as_bytes())
            .expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&sig).map_err(|_| SignatureError::Mismatch)
}

// --- Admin session tokens --- //

/// Role carried by an admin session token.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AdminRole {
    /// Full access, including destructive operations.
    Admin,
    /// Read/triage access.
    Ops,
}

impl AdminRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Ops => "ops",
        }
    }
}

/// A verified admin session. Destructive operations additionally require
/// the session to be fresh.
#[derive(Copy, Clone, Debug)]
pub struct AdminSession {
    pub role: AdminRole,
    pub issued_at: TimestampMs,
}

/// How recently a session must have been issued to authorize destructive
/// operations.
pub const FRESH_SESSION_WINDOW: Duration = Duration::from_secs(15 * 60);
/// Admin session lifetime.
const ADMIN_SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

impl AdminSession {
    pub fn is_fresh(&self, now: TimestampMs) -> bool {
        !self.issued_at.is_older_than(now, FRESH_SESSION_WINDOW)
    }
}

/// Mint an admin session token: `admin:{role}:{issued_ms}:{expires_ms}`
/// HMAC-signed and Base64URL encoded like the manage tokens.
pub fn mint_admin_token(
    secret: &Secret<String>,
    role: AdminRole,
    now: TimestampMs,
) -> String {
    let expires = now.saturating_add(ADMIN_SESSION_TTL);
    let payload = format!(
        "admin:{}:{}:{}",
        role.as_str(),
        now.as_ms(),
        expires.as_ms()
    );
    let sig = mac_sha256(secret, payload.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
    URL_SAFE_NO_PAD.encode(format!("{payload}:{sig_b64}"))
}

/// Verify an admin session token.
pub fn verify_admin_token(
    secret: &Secret<String>,
    token: &str,
    now: TimestampMs,
) -> Result<AdminSession, TokenError> {
    let decoded = URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(TokenError::Malformed)?;

    let parts: Vec<&str> = decoded.splitn(5, ':').collect();
    let &[tag, role_str, issued_str, expires_str, sig_b64] =
        parts.as_slice()
    else {
        return Err(TokenError::Malformed);
    };
    if tag != "admin" {
        return Err(TokenError::Malformed);
    }

    let payload = format!("admin:{role_str}:{issued_str}:{expires_str}");
    let sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Malformed)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

    let issued_ms =
        i64::from_str(issued_str).map_err(|_| TokenError::Malformed)?;
    let expires_ms =
        i64::from_str(expires_str).map_err(|_| TokenError::Malformed)?;
    if now.as_ms() > expires_ms {
        return Err(TokenError::Expired);
    }
    let role = match role_str {
        "admin" => AdminRole::Admin,
        "ops" => AdminRole::Ops,
        _ => return Err(TokenError::Malformed),
    };
    Ok(AdminSession {
        role,
        issued_at: TimestampMs::try_from_ms(issued_ms)
            .map_err(|_| TokenError::Malformed)?,
    })
}

/// Hex-encode bytes. Used when minting test signatures and formatting
/// provider MACs.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn decode_hex(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

/// Compute the hex HMAC-SHA256 a Stripe-style sender would place in `v1=`.
/// Exposed for tests and local webhook replay tooling.
pub fn stripe_signature_header(
    secret: &Secret<String>,
    body: &[u8],
    now: TimestampMs,
) -> String {
    let t = now.as_ms() / 1000;
    let mut signed = t.to_string().into_bytes();
    signed.push(b'.');
    signed.extend_from_slice(body);
    let mac = mac_sha256(secret, &signed);
    format!("t={t},v1={}", encode_hex(&mac))
}

/// Compute the hex HMAC-SHA512 a Paystack-style sender would place in the
/// signature header. Exposed for tests and local webhook replay tooling.
pub fn paystack_signature_header(
    secret: &Secret<String>,
    body: &[u8],
) -> String {
    let mut mac =
        HmacSha512::new_from_slice(secret.expose_secret().as_bytes())
            .expect("HMAC accepts any key length");
    mac.update(body);
    encode_hex(&mac.finalize().into_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    fn secret() -> Secret<String> {
        Secret::new("test-session-secret".to_owned())
    }

    #[test]
    fn manage_token_roundtrip() {
        let id = Uuid::new_v4();
        let now = TimestampMs::try_from_ms(1_700_000_000_000).unwrap();
        let token = mint_manage_token(&secret(), id, now);
        let verified = verify_manage_token(&secret(), &token, now).unwrap();
        assert_eq!(verified, id);
    }

    #[test]
    fn manage_token_expires() {
        let id = Uuid::new_v4();
        let now = TimestampMs::try_from_ms(1_700_000_000_000).unwrap();
        let token = mint_manage_token(&secret(), id, now);
        let later = now
            .saturating_add(MANAGE_TOKEN_TTL)
            .saturating_add(Duration::from_secs(1));
        assert_eq!(
            verify_manage_token(&secret(), &token, later),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn manage_token_rejects_tamper() {
        let id = Uuid::new_v4();
        let now = TimestampMs::try_from_ms(1_700_000_000_000).unwrap();
        let token = mint_manage_token(&secret(), id, now);

        // Re-encode with a different subscription id but the old signature.
        let decoded =
            String::from_utf8(URL_SAFE_NO_PAD.decode(&token).unwrap())
                .unwrap();
        let (_, rest) = decoded.split_once(':').unwrap();
        let forged = URL_SAFE_NO_PAD
            .encode(format!("{}:{rest}", Uuid::new_v4()));
        assert_eq!(
            verify_manage_token(&secret(), &forged, now),
            Err(TokenError::BadSignature)
        );

        let other_secret = Secret::new("wrong".to_owned());
        assert_eq!(
            verify_manage_token(&other_secret, &token, now),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn admin_token_roundtrip_and_freshness() {
        let now = TimestampMs::try_from_ms(1_700_000_000_000).unwrap();
        let token = mint_admin_token(&secret(), AdminRole::Ops, now);
        let session = verify_admin_token(&secret(), &token, now).unwrap();
        assert_eq!(session.role, AdminRole::Ops);
        assert!(session.is_fresh(now));

        let later = now.saturating_add(FRESH_SESSION_WINDOW)
            .saturating_add(Duration::from_secs(1));
        let session = verify_admin_token(&secret(), &token, later).unwrap();
        assert!(!session.is_fresh(later));

        let expired = now.saturating_add(Duration::from_secs(13 * 3600));
        assert!(matches!(
            verify_admin_token(&secret(), &token, expired),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn stripe_signature_roundtrip() {
        let body = br#"{"id":"evt_123","type":"invoice.paid"}"#;
        let now = TimestampMs::try_from_ms(1_700_000_000_000).unwrap();
        let header = stripe_signature_header(&secret(), body, now);
        verify_stripe_signature(&secret(), &header, body, now).unwrap();

        // Wrong body
        assert_eq!(
            verify_stripe_signature(&secret(), &header, b"{}", now),
            Err(SignatureError::Mismatch)
        );

        // Stale timestamp
        let later = now.saturating_add(Duration::from_secs(10 * 60));
        assert_eq!(
            verify_stripe_signature(&secret(), &header, body, later),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn paystack_signature_roundtrip() {
        let body = br#"{"event":"charge.success"}"#;
        let header = paystack_signature_header(&secret(), body);
        verify_paystack_signature(&secret(), &header, body).unwrap();
        assert_eq!(
            verify_paystack_signature(&secret(), &header, b"{}"),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_paystack_signature(&secret(), "zz", body),
            Err(SignatureError::Malformed)
        );
    }
}
