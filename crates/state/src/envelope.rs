use chrono::{Duration as ChronoDuration, Utc};
use conduit_domain::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::canonical::canonical_json;
use crate::secret::StateSecret;
use crate::snapshot::{SignedEnvelope, SnapshotState, CURRENT_VERSION};

type HmacSha256 = Hmac<Sha256>;

fn checksum_of(state: &SnapshotState) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(state).as_bytes());
    hex::encode(hasher.finalize())
}

fn signature_of(secret: &StateSecret, state: &SnapshotState, timestamp_rfc3339: &str, version: u32) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.key_bytes())
    .expect("HMAC accepts a key of any length");
    mac.update(canonical_json(state).as_bytes());
    mac.update(timestamp_rfc3339.as_bytes());
    mac.update(&version.to_be_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Sign a snapshot into its client-held envelope.
pub fn sign(secret: &StateSecret, state: SnapshotState) -> SignedEnvelope {
    let timestamp = Utc::now();
    let timestamp_str = timestamp.to_rfc3339();
    let checksum = checksum_of(&state);
    let signature = signature_of(secret, &state, &timestamp_str, CURRENT_VERSION);
    SignedEnvelope {
        state,
        timestamp,
        signature,
        version: CURRENT_VERSION,
        checksum,
    }
}

/// Verify and unwrap a client-submitted envelope.
///
/// Check order is load-bearing: `state_expired` and `version_unsupported`
/// are reported before any cryptographic comparison, and `checksum`
/// before `signature` — a single mutated byte in `state` must surface as
/// `checksum_mismatch`, which only holds if checksum is evaluated first.
pub fn verify(secret: &StateSecret, envelope: &SignedEnvelope, max_age_days: i64) -> Result<SnapshotState> {
    let age = Utc::now().signed_duration_since(envelope.timestamp);
    if age > ChronoDuration::days(max_age_days) {
        return Err(Error::StateExpired);
    }

    if envelope.version != CURRENT_VERSION {
        return Err(Error::VersionUnsupported(envelope.version));
    }

    let expected_checksum = checksum_of(&envelope.state);
    if !bool::from(
        expected_checksum
        .as_bytes()
        .ct_eq(envelope.checksum.as_bytes()),
    ) {
        return Err(Error::ChecksumMismatch);
    }

    let expected_signature = signature_of(
        secret,
        &envelope.state,
        &envelope.timestamp.to_rfc3339(),
        envelope.version,
    );
    if !bool::from(
        expected_signature
        .as_bytes()
        .ct_eq(envelope.signature.as_bytes()),
    ) {
        return Err(Error::SignatureMismatch);
    }

    Ok(envelope.state.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use uuid::Uuid;

    fn sample_state() -> SnapshotState {
        SnapshotState {
            session_id: Uuid::new_v4(),
            current_step: 3,
            agent_state: json!({"foo": "bar"}),
            created_at: Utc::now(),
            last_active_at: Utc::now(),
            memory_snapshot: vec![json!({"role": "user", "content": "hi"})],
            tool_states: json!({}),
            pending_confirmations: vec![],
            metadata: Map::new(),
        }
    }

    #[test]
    fn round_trips_through_sign_and_verify() {
        let secret = StateSecret::ephemeral();
        let state = sample_state();
        let envelope = sign(&secret, state.clone());
        let restored = verify(&secret, &envelope, 7).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn mutated_state_reports_checksum_mismatch() {
        let secret = StateSecret::ephemeral();
        let mut envelope = sign(&secret, sample_state());
        envelope.state.current_step += 1;
        let err = verify(&secret, &envelope, 7).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch));
    }

    #[test]
    fn mutated_signature_reports_signature_mismatch() {
        let secret = StateSecret::ephemeral();
        let mut envelope = sign(&secret, sample_state());
        envelope.signature = {
            let mut s = envelope.signature.clone();
            let last = s.pop().unwrap();
            s.push(if last == '0' { '1' } else { '0' });
            s
        };
        let err = verify(&secret, &envelope, 7).unwrap_err();
        assert!(matches!(err, Error::SignatureMismatch));
    }

    #[test]
    fn stale_timestamp_reports_state_expired() {
        let secret = StateSecret::ephemeral();
        let mut envelope = sign(&secret, sample_state());
        envelope.timestamp = Utc::now() - ChronoDuration::days(8);
        // re-sign so only the age check can fail
        envelope.checksum = checksum_of(&envelope.state);
        envelope.signature = signature_of(
            &secret,
            &envelope.state,
            &envelope.timestamp.to_rfc3339(),
            envelope.version,
        );
        let err = verify(&secret, &envelope, 7).unwrap_err();
        assert!(matches!(err, Error::StateExpired));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let secret = StateSecret::ephemeral();
        let mut envelope = sign(&secret, sample_state());
        envelope.version = CURRENT_VERSION + 1;
        let err = verify(&secret, &envelope, 7).unwrap_err();
        assert!(matches!(err, Error::VersionUnsupported(v) if v == CURRENT_VERSION + 1));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let a = StateSecret::ephemeral();
        let b = StateSecret::ephemeral();
        let envelope = sign(&a, sample_state());
        let err = verify(&b, &envelope, 7).unwrap_err();
        assert!(matches!(err, Error::SignatureMismatch));
    }
}
