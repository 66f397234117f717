//! Secrets-at-rest envelope sealing for persisted `PausedRunState`.
//!
//! A paused run's context snapshot may carry values derived from `secrets`
//! (e.g. a fetch response bound to state after a secret-bearing request).
//! Before a `PausedRunState` is written to the `StateStore`, the orchestrator
//! seals it through this module rather than persisting plaintext.
//!
//! Built from `blake3`'s keyed XOF as a stream cipher plus a random nonce
//! (`fastrand`) — both already teacher dependencies — since no dedicated
//! AEAD crate appears anywhere in the retrieval pack (see DESIGN.md).

use crate::error::{WorkflowError, WorkflowResult};

const NONCE_LEN: usize = 24;

/// Derive a keystream from `key` and `nonce` via BLAKE3's keyed XOF, then
/// XOR it into `data` in place. Calling this twice with the same key/nonce
/// is its own inverse (stream cipher), so it serves as both seal and open.
fn xor_keystream(key: &[u8; 32], nonce: &[u8], data: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(nonce);
    let mut reader = hasher.finalize_xof();
    let mut keystream = vec![0u8; data.len()];
    reader.fill(&mut keystream);
    for (b, k) in data.iter_mut().zip(keystream.iter()) {
        *b ^= k;
    }
}

/// Derive a 32-byte key from an arbitrary-length passphrase via BLAKE3.
fn derive_key(key_material: &[u8]) -> [u8; 32] {
    *blake3::hash(key_material).as_bytes()
}

/// Seal `plaintext` under `key_material`. Output is `nonce || ciphertext`,
/// hex-encoded. A fresh random nonce is drawn on every call, so sealing the
/// same plaintext twice yields different ciphertexts.
pub fn seal(plaintext: &[u8], key_material: &[u8]) -> String {
    let key = derive_key(key_material);
    let mut nonce = vec![0u8; NONCE_LEN];
    for byte in nonce.iter_mut() {
        *byte = fastrand::u8(..);
    }
    let mut buf = plaintext.to_vec();
    xor_keystream(&key, &nonce, &mut buf);
    let mut envelope = nonce;
    envelope.extend_from_slice(&buf);
    hex::encode(envelope)
}

/// Inverse of `seal`. Fails loudly on malformed envelopes rather than
/// returning garbage.
pub fn open(sealed_hex: &str, key_material: &[u8]) -> WorkflowResult<Vec<u8>> {
    let envelope = hex::decode(sealed_hex).map_err(|e| WorkflowError::Validation(format!("invalid sealed envelope: {e}")))?;
    if envelope.len() < NONCE_LEN {
        return Err(WorkflowError::Validation("sealed envelope too short".to_string()));
    }
    let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
    let key = derive_key(key_material);
    let mut buf = ciphertext.to_vec();
    xor_keystream(&key, nonce, &mut buf);
    Ok(buf)
}
