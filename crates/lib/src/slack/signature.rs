//! Slack request signing (`X-Slack-Signature: v0=<hex hmac-sha256>` over `v0:{timestamp}:{body}`).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Slack-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Slack-Request-Timestamp";

/// Requests older (or newer) than this are rejected as possible replays.
pub const MAX_CLOCK_SKEW_SECS: i64 = 60 * 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("request timestamp outside the allowed window")]
    StaleTimestamp,
    #[error("malformed signature")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

fn mac_for(secret: &str, timestamp: &str, body: &[u8]) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac
}

/// Compute the `v0=` signature header value for a request.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let digest = mac_for(secret, timestamp, body).finalize().into_bytes();
    format!("v0={}", hex::encode(digest))
}

/// Verify a webhook request. `now_secs` is the current Unix time.
pub fn verify(
    secret: &str,
    timestamp: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    now_secs: i64,
) -> Result<(), SignatureError> {
    let timestamp = timestamp.ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?;
    let signature = signature.ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;

    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::StaleTimestamp)?;
    let skew = now_secs
        .checked_sub(ts)
        .map(i64::unsigned_abs)
        .ok_or(SignatureError::StaleTimestamp)?;
    if skew > MAX_CLOCK_SKEW_SECS as u64 {
        return Err(SignatureError::StaleTimestamp);
    }

    let provided = signature
        .trim()
        .strip_prefix("v0=")
        .and_then(|h| hex::decode(h).ok())
        .ok_or(SignatureError::Malformed)?;

    mac_for(secret, timestamp.trim(), body)
        .verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";
    const BODY: &[u8] = b"token=xyzz0WbapA4vBCDEFasx0q6G&team_id=T1DC2JH3J";

    #[test]
    fn accepts_own_signature() {
        let sig = sign(SECRET, "1531420618", BODY);
        assert!(sig.starts_with("v0="));
        assert_eq!(sig.len(), 3 + 64);
        assert_eq!(
            verify(SECRET, Some("1531420618"), Some(&sig), BODY, 1531420618 + 10),
            Ok(())
        );
    }

    #[test]
    fn rejects_tampered_body_and_wrong_secret() {
        let sig = sign(SECRET, "1531420618", BODY);
        assert_eq!(
            verify(SECRET, Some("1531420618"), Some(&sig), b"other", 1531420618),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify("nope", Some("1531420618"), Some(&sig), BODY, 1531420618),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_and_missing_headers() {
        let sig = sign(SECRET, "1000", BODY);
        assert_eq!(
            verify(SECRET, Some("1000"), Some(&sig), BODY, 1000 + MAX_CLOCK_SKEW_SECS + 1),
            Err(SignatureError::StaleTimestamp)
        );
        assert_eq!(
            verify(SECRET, None, Some(&sig), BODY, 1000),
            Err(SignatureError::MissingHeader(TIMESTAMP_HEADER))
        );
        assert_eq!(
            verify(SECRET, Some("1000"), None, BODY, 1000),
            Err(SignatureError::MissingHeader(SIGNATURE_HEADER))
        );
        assert_eq!(
            verify(SECRET, Some("1000"), Some("v1=abcd"), BODY, 1000),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn extreme_timestamps_are_stale_not_a_panic() {
        let now = 1_700_000_000;
        assert_eq!(
            verify("s", Some("-9223372036854775000"), Some("v0=00"), b"x", now),
            Err(SignatureError::StaleTimestamp)
        );
        assert_eq!(
            verify("s", Some(&i64::MAX.to_string()), Some("v0=00"), b"x", now),
            Err(SignatureError::StaleTimestamp)
        );
        assert_eq!(
            verify("s", Some(&i64::MIN.to_string()), Some("v0=00"), b"x", -1),
            Err(SignatureError::StaleTimestamp)
        );
    }
}
