//! The signed intro packet binding a peer's identity to its session.
//!
//! Immediately after a candidate session reaches `SignalStable`, each side
//! sends a binary packet over the default channel:
//!
//! ```text
//! byte 0     : pubLen (always 32)
//! byte 1     : sdpHashLen (always 40)
//! bytes 2..34: Ed25519 public key
//! bytes 34..74: ASCII hex SHA-1 of the signer's local SDP
//! bytes 74.. : Ed25519 signature over (pub || sdpHash)
//! ```
//!
//! The SDP hash is what defeats a malicious rendezvous: the signer commits to
//! the exact session description it negotiated, and the verifier checks that
//! commitment against the remote SDP *it* observed. A rendezvous that swapped
//! SDPs to splice itself into the session produces a mismatch.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::{Result, SwitchboardError};
use crate::identity::{Identity, ids_match, make_full_id, sha1_hex};

const PUB_LEN: usize = 32;
const SDP_HASH_LEN: usize = 40;
const SIG_LEN: usize = 64;

/// A successfully verified intro.
#[derive(Debug, Clone)]
pub struct VerifiedIntro {
    pub full_id: String,
    pub public_key: [u8; PUB_LEN],
}

/// Build the signed intro packet for our side of a session.
pub fn make_sig_packet(identity: &Identity, local_sdp: &str) -> Vec<u8> {
    let public = identity.public_key_bytes();
    let sdp_hash = sha1_hex(local_sdp.as_bytes());

    let mut signed = Vec::with_capacity(PUB_LEN + SDP_HASH_LEN);
    signed.extend_from_slice(&public);
    signed.extend_from_slice(sdp_hash.as_bytes());
    let signature = identity.sign(&signed);

    let mut packet = Vec::with_capacity(2 + PUB_LEN + SDP_HASH_LEN + SIG_LEN);
    packet.push(PUB_LEN as u8);
    packet.push(SDP_HASH_LEN as u8);
    packet.extend_from_slice(&signed);
    packet.extend_from_slice(&signature.to_bytes());
    packet
}

/// Verify a peer's intro packet.
///
/// `remote_sdp` is the remote session description as *we* observed it, which
/// must equal what the peer signed. `known_id` is the ShortID or FullID
/// learned during signaling, if any; `wanted_id` is the supervisor's
/// specific-peer filter. Both are prefix-compared symmetrically so a ShortID
/// on either side still matches.
pub fn verify_packet(
    packet: &[u8],
    remote_sdp: &str,
    known_id: Option<&str>,
    wanted_id: Option<&str>,
) -> Result<VerifiedIntro> {
    if packet.len() < 2 {
        return Err(SwitchboardError::ClientAuth("truncated intro".into()));
    }
    let pub_len = packet[0] as usize;
    let hash_len = packet[1] as usize;
    if pub_len != PUB_LEN || hash_len != SDP_HASH_LEN {
        return Err(SwitchboardError::ClientAuth(format!(
            "unexpected intro lengths ({pub_len}/{hash_len})"
        )));
    }
    if packet.len() != 2 + pub_len + hash_len + SIG_LEN {
        return Err(SwitchboardError::ClientAuth(format!(
            "unexpected intro size ({})",
            packet.len()
        )));
    }

    let public: [u8; PUB_LEN] = packet[2..2 + pub_len].try_into().expect("sliced to length");
    let sdp_hash = &packet[2 + pub_len..2 + pub_len + hash_len];
    let sig_bytes: [u8; SIG_LEN] = packet[2 + pub_len + hash_len..]
        .try_into()
        .expect("sliced to length");

    let full_id = make_full_id(&public);
    if let Some(known) = known_id
        && !ids_match(&full_id, known)
    {
        return Err(SwitchboardError::ClientAuth(format!(
            "key does not match advertised id {known}"
        )));
    }
    if let Some(wanted) = wanted_id
        && !ids_match(&full_id, wanted)
    {
        return Err(SwitchboardError::ClientAuth(
            "peer is not the wanted target".into(),
        ));
    }

    let verifying = VerifyingKey::from_bytes(&public)
        .map_err(|e| SwitchboardError::ClientAuth(format!("bad public key: {e}")))?;
    let signature = Signature::from_bytes(&sig_bytes);
    let signed = &packet[2..2 + pub_len + hash_len];
    verifying
        .verify(signed, &signature)
        .map_err(|_| SwitchboardError::ClientAuth("bad intro signature".into()))?;

    let expected_hash = sha1_hex(remote_sdp.as_bytes());
    if sdp_hash != expected_hash.as_bytes() {
        return Err(SwitchboardError::ClientAuth(
            "SDP hash does not match the observed session".into(),
        ));
    }

    Ok(VerifiedIntro { full_id, public_key: public })
}
