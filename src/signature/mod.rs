//! Webhook signature verification.
//!
//! The chat platform signs every webhook delivery with
//! `v0=hex(hmac_sha256(secret, "v0:{timestamp}:{raw_body}"))` and sends the
//! signature plus the timestamp as headers. Verification must run over the
//! exact bytes received — re-serializing parsed JSON would break it.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Version prefix mandated by the platform's signing scheme.
const SIGNATURE_VERSION: &str = "v0";

/// Maximum accepted clock skew between the signed timestamp and our clock.
/// Anything older is treated as a replay attempt.
const REPLAY_WINDOW_SECS: i64 = 300;

/// Compute the `v0=...` signature for a body and timestamp.
///
/// Used by tests and by clients of the config push channel; the gateway
/// itself only verifies.
pub fn sign(raw_body: &[u8], timestamp: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(SIGNATURE_VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(raw_body);
    format!(
        "{}={}",
        SIGNATURE_VERSION,
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Verify a webhook signature against the raw request body.
///
/// Rejects missing headers, timestamps outside the replay window, and any
/// signature that does not match in constant time.
pub fn verify(
    raw_body: &[u8],
    signature_header: Option<&str>,
    timestamp_header: Option<&str>,
    secret: &str,
) -> bool {
    verify_at(
        raw_body,
        signature_header,
        timestamp_header,
        secret,
        Utc::now().timestamp(),
    )
}

/// Clock-injected variant of [`verify`] so tests never sleep.
pub fn verify_at(
    raw_body: &[u8],
    signature_header: Option<&str>,
    timestamp_header: Option<&str>,
    secret: &str,
    now_unix: i64,
) -> bool {
    let (Some(signature), Some(timestamp)) = (signature_header, timestamp_header) else {
        debug!("signature check: missing signature or timestamp header");
        return false;
    };

    let Ok(ts) = timestamp.parse::<i64>() else {
        debug!("signature check: non-numeric timestamp header");
        return false;
    };

    if (now_unix - ts).abs() > REPLAY_WINDOW_SECS {
        debug!(
            "signature check: timestamp {} outside replay window (now {})",
            ts, now_unix
        );
        return false;
    }

    let expected = sign(raw_body, timestamp, secret);
    // ct_eq on byte slices is false on length mismatch without leaking
    // where the strings diverge.
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}
