// FC8 CORE — AES-256-GCM AEAD
// In-place seal/open over a frame window. The tag rides at the tail; the
// caller owns the header bytes and binds them as AAD.
//
// Nonce layout: seq(4, big-endian) || direction(1) || zeros(7) = 12 bytes.
// The direction byte is derived from the two static keys, so a reflected
// frame reconstructs with the wrong nonce and fails authentication.

use ring::aead;

use crate::network::{Frame, SessionError};

pub const TAG_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;

#[inline(always)]
pub fn build_nonce(seq: u32, direction: u8) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&seq.to_be_bytes());
    nonce[4] = direction;
    nonce
}

/// Encrypt the window in place and append the 16-byte tag at the tail.
pub fn seal_in_place(
    frame: &mut Frame,
    key: &aead::LessSafeKey,
    nonce_bytes: [u8; NONCE_SIZE],
    aad: &[u8],
) -> Result<(), SessionError> {
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
    let tag = key
        .seal_in_place_separate_tag(nonce, aead::Aad::from(aad), frame.bytes_mut())
        .map_err(|_| SessionError::Authentication)?;
    frame.grow_tail(TAG_SIZE).map_err(|_| SessionError::Buffer)?;
    let len = frame.len();
    frame.bytes_mut()[len - TAG_SIZE..].copy_from_slice(tag.as_ref());
    Ok(())
}

/// Verify and strip the trailing tag, decrypting the rest of the window in
/// place. On failure the frame contents are garbage and the caller drops it.
pub fn open_in_place(
    frame: &mut Frame,
    key: &aead::LessSafeKey,
    nonce_bytes: [u8; NONCE_SIZE],
    aad: &[u8],
) -> Result<(), SessionError> {
    if frame.len() < TAG_SIZE {
        return Err(SessionError::Truncated);
    }
    let len = frame.len();
    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&frame.bytes()[len - TAG_SIZE..]);
    frame.shrink_tail(TAG_SIZE).map_err(|_| SessionError::Truncated)?;

    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
    key.open_in_place_separate_tag(
        nonce,
        aead::Aad::from(aad),
        aead::Tag::from(tag_bytes),
        frame.bytes_mut(),
        0..,
    )
    .map_err(|_| SessionError::Authentication)?;
    Ok(())
}
