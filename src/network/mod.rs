// FC8 CORE — NETWORK MODULE
// The structures the datapath moves and the seams it moves them across:
//   Frame        — window over a shared buffer; headers come and go by
//                  shifting the window, never by copying the body
//   traits       — the collaborators the core is wired to (outer auth,
//                  content sessions, routing module, switch and tun ports)
//   datapath.rs  — everything about moving packets

pub mod datapath;

use thiserror::Error;

use crate::engine::protocol::{Address, DhtMessage};
use crate::engine::runtime::Scratch;

// ============================================================================
// FRAME — The fundamental unit every dispatch stage operates on
// ============================================================================

/// Head padding for frames entering the dispatch: worst case is switch +
/// IPv6 + outer-crypto + inner-crypto + UDP headers plus slack.
pub const DEFAULT_HEADROOM: usize = 512;
/// Tail padding: room for the authentication tags both crypto layers append.
pub const DEFAULT_TAILROOM: usize = 64;

/// Where the content layer reads its 16-byte session handle, in bytes behind
/// the window start. On receive the handle is the source address of the IPv6
/// header that was just stripped; on send it is the destination address.
pub const CONTENT_KEY_INCOMING: usize = 32;
pub const CONTENT_KEY_OUTGOING: usize = 16;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("shift of {needed} exceeds {available} bytes of headroom")]
    Headroom { needed: usize, available: usize },
    #[error("shift of {needed} exceeds the {available}-byte window")]
    Underflow { needed: usize, available: usize },
    #[error("tail growth of {needed} exceeds {available} bytes of tailroom")]
    Tailroom { needed: usize, available: usize },
    #[error("{len} bytes at {back} behind the window are out of bounds")]
    Behind { back: usize, len: usize },
}

/// A mutable window over an owned buffer. All header layering is done by
/// moving the window edges; the bytes of stripped headers stay in place
/// behind the window, which is what the content-key offset contract reads.
pub struct Frame {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl Frame {
    pub fn new(headroom: usize, payload: &[u8], tailroom: usize) -> Self {
        let mut buf = vec![0u8; headroom + payload.len() + tailroom];
        buf[headroom..headroom + payload.len()].copy_from_slice(payload);
        Frame { buf, start: headroom, end: headroom + payload.len() }
    }

    /// A frame with the default padding, ready to enter any entry point.
    pub fn wire(payload: &[u8]) -> Self {
        Self::new(DEFAULT_HEADROOM, payload, DEFAULT_TAILROOM)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    #[inline(always)]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.end]
    }

    #[inline(always)]
    pub fn headroom(&self) -> usize {
        self.start
    }

    #[inline(always)]
    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.end
    }

    /// Move the front edge of the window. Positive `n` grows the window
    /// backward into the headroom (a header is about to be written); negative
    /// `n` strips `-n` bytes off the front.
    pub fn shift(&mut self, n: isize) -> Result<(), FrameError> {
        if n >= 0 {
            let n = n as usize;
            if n > self.start {
                return Err(FrameError::Headroom { needed: n, available: self.start });
            }
            self.start -= n;
        } else {
            let n = n.unsigned_abs();
            if n > self.len() {
                return Err(FrameError::Underflow { needed: n, available: self.len() });
            }
            self.start += n;
        }
        Ok(())
    }

    /// Extend the window at the tail (an authentication tag is about to be
    /// appended).
    pub fn grow_tail(&mut self, n: usize) -> Result<(), FrameError> {
        if n > self.tailroom() {
            return Err(FrameError::Tailroom { needed: n, available: self.tailroom() });
        }
        self.end += n;
        Ok(())
    }

    /// Drop `n` bytes from the tail (a verified tag is being discarded).
    pub fn shrink_tail(&mut self, n: usize) -> Result<(), FrameError> {
        if n > self.len() {
            return Err(FrameError::Underflow { needed: n, available: self.len() });
        }
        self.end -= n;
        Ok(())
    }

    /// The `len` bytes starting `back` bytes behind the window.
    pub fn behind(&self, back: usize, len: usize) -> Result<&[u8], FrameError> {
        if back > self.start || len > back {
            return Err(FrameError::Behind { back, len });
        }
        Ok(&self.buf[self.start - back..self.start - back + len])
    }

    pub fn write_behind(&mut self, back: usize, bytes: &[u8]) -> Result<(), FrameError> {
        if back > self.start || bytes.len() > back {
            return Err(FrameError::Behind { back, len: bytes.len() });
        }
        self.buf[self.start - back..self.start - back + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Failures inside a crypto session layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("authentication failed")]
    Authentication,
    #[error("replayed or out-of-order sequence")]
    Replay,
    #[error("frame too short for its crypto header")]
    Truncated,
    #[error("handshake key does not match the pinned identity")]
    KeyMismatch,
    #[error("no key known for the remote endpoint")]
    UnknownKey,
    #[error("sequence space exhausted")]
    SequenceExhausted,
    #[error("frame buffer exhausted")]
    Buffer,
}

/// Dispatch results. `Ok(())` is success; a frame that cannot proceed is
/// dropped with one of these.
#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("malformed frame or identity mismatch")]
    Invalid,
    #[error("hop limit exhausted, no route known, or no local delivery target")]
    Undeliverable,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    #[error("node key hashes outside fc00::/8")]
    KeyOutsideOverlay,
}

// ============================================================================
// COLLABORATOR SEAMS
// ============================================================================

/// What an outer-session decrypt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    /// Plaintext in the window, aligned on the IPv6 header.
    Plaintext,
    /// A handshake frame was consumed; there is nothing to route.
    Absorbed,
}

/// What a content-session decrypt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentOpened {
    /// Plaintext content, with the sender's authenticated static key.
    Content { remote_key: [u8; 32] },
    /// A handshake frame was consumed; there is nothing to deliver.
    Absorbed,
    /// The session produced an immediate handshake answer in the window;
    /// it must travel back out toward the initiator.
    Reply,
}

/// One peer-to-peer authenticated-encryption session. Both calls transform
/// the window in place; `open` leaves the frame aligned on the plaintext
/// IPv6 header.
pub trait PeerSession {
    fn seal(&mut self, frame: &mut Frame) -> Result<(), SessionError>;
    fn open(&mut self, frame: &mut Frame) -> Result<Opened, SessionError>;
    /// The counterparty's static key: pinned at creation or learned during
    /// the handshake; `None` until one of those has happened.
    fn remote_key(&self) -> Option<[u8; 32]>;
    fn established(&self) -> bool;
}

/// The outer crypto layer's handle: owns the node identity and mints
/// per-peer sessions.
pub trait PeerAuthenticator {
    fn public_key(&self) -> [u8; 32];
    fn open_session(&mut self, pinned_key: Option<[u8; 32]>) -> Box<dyn PeerSession>;
}

/// The inner (content) session manager: end-to-end crypto keyed by the
/// remote 16-byte address. The manager reads its session handle from the
/// bytes behind the window — `CONTENT_KEY_INCOMING` back on `open`,
/// `CONTENT_KEY_OUTGOING` back on `seal` and `set_key`.
pub trait ContentSessions {
    fn set_key(&mut self, frame: &Frame, key: &[u8; 32], outgoing: bool);
    fn seal(&mut self, frame: &mut Frame) -> Result<(), SessionError>;
    fn open(&mut self, frame: &mut Frame) -> Result<ContentOpened, SessionError>;
}

/// The overlay routing table, as the core consumes it.
pub trait RouterModule {
    /// Best next hop toward a destination, or `None` if this node is the
    /// closest it knows.
    fn get_best(&mut self, dest: &[u8; 16]) -> Option<Address>;
    /// Offer a freshly authenticated peer to the routing table.
    fn add_node(&mut self, addr: &Address);
    /// A path the fabric reported broken.
    fn broken_path(&mut self, label: u64);
    /// In-band router traffic, with the per-message scratch arena attached.
    fn handle_incoming(&mut self, message: &DhtMessage, scratch: &mut Scratch);
}

/// Emission into the switch fabric. Fire-and-forget: delivery problems are
/// the fabric's to report, via control frames.
pub trait SwitchPort {
    fn forward(&mut self, frame: &Frame);
}

/// Emission into the local tunnel device.
pub trait TunPort {
    fn deliver(&mut self, frame: &Frame);
}

// ============================================================================
// DISPATCH STATISTICS
// ============================================================================

#[derive(Default, Clone)]
pub struct DispatchStats {
    pub from_switch: u64,
    pub from_tun: u64,
    pub control: u64,
    pub broken_paths: u64,
    pub outer_ok: u64,
    pub outer_fail: u64,
    pub inner_fail: u64,
    pub tun_writes: u64,
    pub emitted: u64,
    pub router_in: u64,
    pub router_out: u64,
    pub invalid: u64,
    pub undeliverable: u64,
    pub spoofed: u64,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_strips_and_restores() {
        let mut frame = Frame::new(8, &[1, 2, 3, 4], 0);
        assert_eq!(frame.bytes(), &[1, 2, 3, 4]);
        frame.shift(-2).unwrap();
        assert_eq!(frame.bytes(), &[3, 4]);
        frame.shift(2).unwrap();
        assert_eq!(frame.bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn shift_prepend_exposes_headroom() {
        let mut frame = Frame::new(4, &[9], 0);
        frame.shift(4).unwrap();
        assert_eq!(frame.len(), 5);
        assert_eq!(frame.headroom(), 0);
        frame.bytes_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(frame.bytes(), &[1, 2, 3, 4, 9]);
    }

    #[test]
    fn shift_bounds_checked() {
        let mut frame = Frame::new(2, &[1, 2, 3], 0);
        assert_eq!(
            frame.shift(3),
            Err(FrameError::Headroom { needed: 3, available: 2 })
        );
        assert_eq!(
            frame.shift(-4),
            Err(FrameError::Underflow { needed: 4, available: 3 })
        );
    }

    #[test]
    fn tail_grow_and_shrink() {
        let mut frame = Frame::new(0, &[5, 6], 3);
        frame.grow_tail(3).unwrap();
        assert_eq!(frame.len(), 5);
        assert_eq!(
            frame.grow_tail(1),
            Err(FrameError::Tailroom { needed: 1, available: 0 })
        );
        frame.shrink_tail(3).unwrap();
        assert_eq!(frame.bytes(), &[5, 6]);
    }

    #[test]
    fn behind_reads_stripped_bytes() {
        let mut frame = Frame::new(0, &[0xFC, 0xAA, 0xBB, 0xCC], 0);
        frame.shift(-3).unwrap();
        assert_eq!(frame.behind(3, 2).unwrap(), &[0xFC, 0xAA]);
        assert_eq!(frame.behind(1, 1).unwrap(), &[0xBB]);
        assert!(frame.behind(4, 1).is_err());
        assert!(frame.behind(2, 3).is_err(), "read must not cross the window edge");
    }

    #[test]
    fn write_behind_plants_key_bytes() {
        let mut frame = Frame::new(16, &[1], 0);
        frame.write_behind(16, &[0xEE; 16]).unwrap();
        assert_eq!(frame.behind(16, 16).unwrap(), &[0xEE; 16]);
        let mut shallow = Frame::new(4, &[1], 0);
        assert!(shallow.write_behind(16, &[0xEE; 16]).is_err());
    }
}
