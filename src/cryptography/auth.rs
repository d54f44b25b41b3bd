// FC8 CORE — CRYPTOGRAPHY: PEER SESSIONS
// Default peer-to-peer (outer) session layer. Keys come from x25519
// static-static agreement hashed through HKDF-SHA512 with a per-layer info
// string; framing is AES-256-GCM over the shared frame buffer.
//
// Handshake frames carry sequence values 0..=3 and the sender's static key;
// anything higher is established traffic with a strictly-increasing replay
// window. A session created without a pinned key learns the counterparty
// during the handshake; a pinned session refuses any other identity.
//
// Wire format:
//   handshake:  seq(4, BE) || sender static key(32) || ciphertext || tag(16)
//   data:       seq(4, BE) || ciphertext || tag(16)

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead;
use sha2::Sha512;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::cryptography::aead::{build_nonce, open_in_place, seal_in_place, TAG_SIZE};
use crate::network::{Frame, Opened, PeerAuthenticator, PeerSession, SessionError};

/// Sequence values up to this are handshake frames.
pub const HANDSHAKE_SEQ_MAX: u32 = 3;
pub const HANDSHAKE_HDR_SIZE: usize = 4 + 32;
pub const DATA_HDR_SIZE: usize = 4;

const PEER_INFO: &[u8] = b"FC8-PEER-SESSION-v1";
pub(crate) const CONTENT_INFO: &[u8] = b"FC8-CONTENT-SESSION-v1";

fn derive_cipher(
    local_secret: &[u8; 32],
    remote_public: &[u8; 32],
    info: &[u8],
) -> aead::LessSafeKey {
    let shared = StaticSecret::from(*local_secret).diffie_hellman(&PublicKey::from(*remote_public));
    let hk = Hkdf::<Sha512>::new(None, shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(info, &mut key).unwrap();
    aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_256_GCM, &key).unwrap())
}

/// Nonce direction byte: the lexicographically greater static key transmits
/// as 0, the lesser as 1. Role-free and symmetric; a reflected frame
/// reconstructs with the wrong direction and fails authentication.
#[inline(always)]
fn direction(sender: &[u8; 32], receiver: &[u8; 32]) -> u8 {
    if sender > receiver {
        0
    } else {
        1
    }
}

// ============================================================================
// SECURE CHANNEL — shared by both session layers
// ============================================================================

pub(crate) struct SecureChannel {
    local_secret: [u8; 32],
    local_public: [u8; 32],
    remote_key: Option<[u8; 32]>,
    /// A pinned channel refuses handshakes from any other identity; an
    /// unpinned one learns (and may re-learn) its counterparty.
    pinned: bool,
    cipher: Option<aead::LessSafeKey>,
    info: &'static [u8],
    tx_seq: u32,
    rx_high: u32,
    established: bool,
}

impl SecureChannel {
    pub(crate) fn new(
        local_secret: [u8; 32],
        pinned_key: Option<[u8; 32]>,
        info: &'static [u8],
    ) -> Self {
        let local_public = PublicKey::from(&StaticSecret::from(local_secret)).to_bytes();
        SecureChannel {
            local_secret,
            local_public,
            remote_key: pinned_key,
            pinned: pinned_key.is_some(),
            cipher: None,
            info,
            tx_seq: 0,
            rx_high: 0,
            established: false,
        }
    }

    /// Pin (or re-pin) the counterparty identity.
    pub(crate) fn pin(&mut self, key: [u8; 32]) {
        if self.remote_key != Some(key) {
            self.remote_key = Some(key);
            self.cipher = None;
        }
        self.pinned = true;
    }

    pub(crate) fn remote_key(&self) -> Option<[u8; 32]> {
        self.remote_key
    }

    pub(crate) fn established(&self) -> bool {
        self.established
    }

    fn ensure_cipher(&mut self, remote: &[u8; 32]) {
        if self.cipher.is_none() {
            self.cipher = Some(derive_cipher(&self.local_secret, remote, self.info));
        }
    }

    pub(crate) fn seal(&mut self, frame: &mut Frame) -> Result<(), SessionError> {
        let remote = self.remote_key.ok_or(SessionError::UnknownKey)?;
        let dir = direction(&self.local_public, &remote);

        if !self.established && self.tx_seq <= HANDSHAKE_SEQ_MAX {
            let seq = self.tx_seq;
            self.tx_seq += 1;
            let mut header = [0u8; HANDSHAKE_HDR_SIZE];
            header[..4].copy_from_slice(&seq.to_be_bytes());
            header[4..].copy_from_slice(&self.local_public);
            self.ensure_cipher(&remote);
            let cipher = self.cipher.as_ref().unwrap();
            seal_in_place(frame, cipher, build_nonce(seq, dir), &header)?;
            frame
                .shift(HANDSHAKE_HDR_SIZE as isize)
                .map_err(|_| SessionError::Buffer)?;
            frame.bytes_mut()[..HANDSHAKE_HDR_SIZE].copy_from_slice(&header);
            Ok(())
        } else {
            if self.tx_seq <= HANDSHAKE_SEQ_MAX {
                self.tx_seq = HANDSHAKE_SEQ_MAX + 1;
            }
            let seq = self.tx_seq;
            self.tx_seq = seq.checked_add(1).ok_or(SessionError::SequenceExhausted)?;
            let header = seq.to_be_bytes();
            self.ensure_cipher(&remote);
            let cipher = self.cipher.as_ref().unwrap();
            seal_in_place(frame, cipher, build_nonce(seq, dir), &header)?;
            frame
                .shift(DATA_HDR_SIZE as isize)
                .map_err(|_| SessionError::Buffer)?;
            frame.bytes_mut()[..DATA_HDR_SIZE].copy_from_slice(&header);
            Ok(())
        }
    }

    pub(crate) fn open(&mut self, frame: &mut Frame) -> Result<Opened, SessionError> {
        if frame.len() < DATA_HDR_SIZE {
            return Err(SessionError::Truncated);
        }
        let seq = u32::from_be_bytes(frame.bytes()[..4].try_into().unwrap());

        if seq <= HANDSHAKE_SEQ_MAX {
            if frame.len() < HANDSHAKE_HDR_SIZE + TAG_SIZE {
                return Err(SessionError::Truncated);
            }
            let mut header = [0u8; HANDSHAKE_HDR_SIZE];
            header.copy_from_slice(&frame.bytes()[..HANDSHAKE_HDR_SIZE]);
            let mut claimed = [0u8; 32];
            claimed.copy_from_slice(&header[4..]);

            if self.pinned && self.remote_key != Some(claimed) {
                return Err(SessionError::KeyMismatch);
            }

            let dir = direction(&claimed, &self.local_public);
            let cipher = derive_cipher(&self.local_secret, &claimed, self.info);
            frame
                .shift(-(HANDSHAKE_HDR_SIZE as isize))
                .map_err(|_| SessionError::Truncated)?;
            open_in_place(frame, &cipher, build_nonce(seq, dir), &header)?;

            self.remote_key = Some(claimed);
            self.cipher = Some(cipher);
            self.established = true;
            if frame.is_empty() {
                return Ok(Opened::Absorbed);
            }
            Ok(Opened::Plaintext)
        } else {
            let remote = self.remote_key.ok_or(SessionError::Authentication)?;
            if seq <= self.rx_high {
                return Err(SessionError::Replay);
            }
            let header: [u8; DATA_HDR_SIZE] = frame.bytes()[..DATA_HDR_SIZE].try_into().unwrap();
            let dir = direction(&remote, &self.local_public);
            self.ensure_cipher(&remote);
            let cipher = self.cipher.as_ref().unwrap();
            frame
                .shift(-(DATA_HDR_SIZE as isize))
                .map_err(|_| SessionError::Truncated)?;
            open_in_place(frame, cipher, build_nonce(seq, dir), &header)?;
            self.rx_high = seq;
            self.established = true;
            Ok(Opened::Plaintext)
        }
    }
}

// ============================================================================
// PEER AUTHENTICATOR — the outer layer's handle
// ============================================================================

/// Owns the node's static identity and mints per-peer outer sessions.
pub struct PeerAuth {
    secret: [u8; 32],
    public: [u8; 32],
}

impl PeerAuth {
    pub fn new(private_key: [u8; 32]) -> Self {
        let public = PublicKey::from(&StaticSecret::from(private_key)).to_bytes();
        PeerAuth { secret: private_key, public }
    }

    /// A fresh random identity. Callers needing an fc00::/8 identity grind
    /// keys until the derived address lands in the overlay prefix.
    pub fn generate() -> Self {
        let mut private_key = [0u8; 32];
        OsRng.fill_bytes(&mut private_key);
        Self::new(private_key)
    }
}

impl PeerAuthenticator for PeerAuth {
    fn public_key(&self) -> [u8; 32] {
        self.public
    }

    fn open_session(&mut self, pinned_key: Option<[u8; 32]>) -> Box<dyn PeerSession> {
        Box::new(PeerCryptoSession {
            channel: SecureChannel::new(self.secret, pinned_key, PEER_INFO),
        })
    }
}

pub struct PeerCryptoSession {
    channel: SecureChannel,
}

impl PeerSession for PeerCryptoSession {
    fn seal(&mut self, frame: &mut Frame) -> Result<(), SessionError> {
        self.channel.seal(frame)
    }

    fn open(&mut self, frame: &mut Frame) -> Result<Opened, SessionError> {
        self.channel.open(frame)
    }

    fn remote_key(&self) -> Option<[u8; 32]> {
        self.channel.remote_key()
    }

    fn established(&self) -> bool {
        self.channel.established()
    }
}

// ============================================================================
// TESTS
// ============================================================================
