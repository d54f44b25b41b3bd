// FC8 CORE — ENGINE: PROTOCOL MODULE
// Everything about the overlay protocol: wire format, addresses, the
// outer-session table, and router-layer messages.
// Wire format:   SwitchHeader, Ip6Header, UdpHeader, ControlHeader — zero-copy
// Address:       32-byte static key bound to its fc00::/8 address by a
//                one-way hash truncation
// Session table: flat array keyed by 8-byte switch label, FNV-1a probing,
//                oldest-first eviction when full
// Router msgs:   bounded-copy messages exchanged with the routing module

use std::fmt;
use std::mem;
use bytemuck::{Pod, Zeroable};
use sha2::{Digest, Sha512};

use crate::network::PeerSession;

// ============================================================================
// WIRE CONSTANTS
// ============================================================================

/// Every legitimate overlay address begins with this byte (fc00::/8).
pub const OVERLAY_PREFIX: u8 = 0xFC;

/// Static-key and address sizes.
pub const KEY_SIZE: usize = 32;
pub const IP6_SIZE: usize = 16;

// Switch-header message types (top byte of the type/priority word)
pub const MSG_TYPE_DATA: u32 = 0;
pub const MSG_TYPE_CONTROL: u32 = 1;

/// IPv6 next-header value marking router traffic (zero-ported UDP).
pub const NEXT_HEADER_UDP: u8 = 17;

// Control frame types
pub const CTRL_TYPE_ERROR: u16 = 2;

// Fabric error codes carried in CTRL_TYPE_ERROR frames
pub const ERROR_NONE: u32 = 0;
pub const ERROR_MALFORMED_ADDRESS: u32 = 1;
pub const ERROR_FLOOD: u32 = 2;
pub const ERROR_UNDELIVERABLE: u32 = 3;
pub const ERROR_LOOP_ROUTE: u32 = 4;

// ============================================================================
// WIRE HEADERS
// ============================================================================

/// Switch-fabric header. 12 bytes: 64-bit route label + type/priority word.
/// The label arrives bit-reversed (the fabric does not know we are the last
/// hop); it is un-reversed once on ingress and written as-is on egress.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct SwitchHeader {
    pub label_be: u64,
    pub type_and_priority_be: u32,
}
pub const SWITCH_HDR_SIZE: usize = mem::size_of::<SwitchHeader>();
const _: () = assert!(SWITCH_HDR_SIZE == 12);

impl SwitchHeader {
    pub fn zeroed() -> Self {
        Zeroable::zeroed()
    }

    #[inline(always)]
    pub fn label(&self) -> u64 {
        u64::from_be(self.label_be)
    }

    #[inline(always)]
    pub fn set_label(&mut self, label: u64) {
        self.label_be = label.to_be();
    }

    /// Message type lives in the top 8 bits of the type/priority word.
    #[inline(always)]
    pub fn message_type(&self) -> u32 {
        u32::from_be(self.type_and_priority_be) >> 24
    }

    pub fn set_message_type(&mut self, msg_type: u32) {
        let raw = u32::from_be(self.type_and_priority_be);
        self.type_and_priority_be = ((raw & 0x00FF_FFFF) | (msg_type << 24)).to_be();
    }

    pub fn read(buf: &[u8]) -> Option<Self> {
        (buf.len() >= SWITCH_HDR_SIZE).then(|| bytemuck::pod_read_unaligned(&buf[..SWITCH_HDR_SIZE]))
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..SWITCH_HDR_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }
}

/// Standard 40-byte IPv6 header. Source and destination MUST be fc00::/8 on
/// this network and the payload length MUST account for every byte after the
/// header, crypto headers included.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct Ip6Header {
    pub version_class_flow: u32,
    pub payload_len_be: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub source_addr: [u8; 16],
    pub dest_addr: [u8; 16],
}
pub const IP6_HDR_SIZE: usize = mem::size_of::<Ip6Header>();
const _: () = assert!(IP6_HDR_SIZE == 40);

impl Ip6Header {
    pub fn new(source_addr: [u8; 16], dest_addr: [u8; 16], next_header: u8, hop_limit: u8) -> Self {
        Ip6Header {
            version_class_flow: 0x6000_0000u32.to_be(),
            payload_len_be: 0,
            next_header,
            hop_limit,
            source_addr,
            dest_addr,
        }
    }

    #[inline(always)]
    pub fn payload_len(&self) -> u16 {
        u16::from_be(self.payload_len_be)
    }

    pub fn read(buf: &[u8]) -> Option<Self> {
        (buf.len() >= IP6_HDR_SIZE).then(|| bytemuck::pod_read_unaligned(&buf[..IP6_HDR_SIZE]))
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..IP6_HDR_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }
}

/// UDP header as used for router traffic: both ports zero, the length field
/// covering the payload only, checksum unused (not validated on receive).
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct UdpHeader {
    pub src_port_be: u16,
    pub dst_port_be: u16,
    pub length_be: u16,
    pub checksum_be: u16,
}
pub const UDP_HDR_SIZE: usize = mem::size_of::<UdpHeader>();
const _: () = assert!(UDP_HDR_SIZE == 8);

impl UdpHeader {
    pub fn read(buf: &[u8]) -> Option<Self> {
        (buf.len() >= UDP_HDR_SIZE).then(|| bytemuck::pod_read_unaligned(&buf[..UDP_HDR_SIZE]))
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..UDP_HDR_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }
}

/// Switch-layer control frame header.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ControlHeader {
    pub checksum_be: u16,
    pub type_be: u16,
}
pub const CTRL_HDR_SIZE: usize = mem::size_of::<ControlHeader>();
const _: () = assert!(CTRL_HDR_SIZE == 4);

impl ControlHeader {
    #[inline(always)]
    pub fn ctrl_type(&self) -> u16 {
        u16::from_be(self.type_be)
    }

    pub fn read(buf: &[u8]) -> Option<Self> {
        (buf.len() >= CTRL_HDR_SIZE).then(|| bytemuck::pod_read_unaligned(&buf[..CTRL_HDR_SIZE]))
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..CTRL_HDR_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }
}

/// Payload of a CTRL_TYPE_ERROR frame: the failure code plus the label of the
/// path the error is about. The cause label must match the label the frame
/// itself arrived on, anything else indicates corruption.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ErrorPayload {
    pub error_type_be: u32,
    pub cause_label_be: u64,
}
pub const ERROR_PAYLOAD_SIZE: usize = mem::size_of::<ErrorPayload>();
const _: () = assert!(ERROR_PAYLOAD_SIZE == 12);

impl ErrorPayload {
    pub fn new(error_type: u32, cause_label: u64) -> Self {
        ErrorPayload {
            error_type_be: error_type.to_be(),
            cause_label_be: cause_label.to_be(),
        }
    }

    #[inline(always)]
    pub fn error_type(&self) -> u32 {
        u32::from_be(self.error_type_be)
    }

    #[inline(always)]
    pub fn cause_label(&self) -> u64 {
        u64::from_be(self.cause_label_be)
    }

    pub fn read(buf: &[u8]) -> Option<Self> {
        (buf.len() >= ERROR_PAYLOAD_SIZE)
            .then(|| bytemuck::pod_read_unaligned(&buf[..ERROR_PAYLOAD_SIZE]))
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..ERROR_PAYLOAD_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }
}

// ============================================================================
// OVERLAY ADDRESS
// ============================================================================

/// The address an overlay identity owns: the first 16 bytes of
/// SHA-512(SHA-512(key)). One-way, so the address cannot be chosen without
/// grinding keys; only identities hashing into fc00::/8 are usable.
pub fn address_for_key(key: &[u8; KEY_SIZE]) -> [u8; IP6_SIZE] {
    let first = Sha512::digest(key);
    let second = Sha512::digest(first);
    let mut ip6 = [0u8; IP6_SIZE];
    ip6.copy_from_slice(&second[..IP6_SIZE]);
    ip6
}

/// A peer as the core knows it: static key, the address derived from it, and
/// the switch label that reaches it. Immutable once observed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub key: [u8; KEY_SIZE],
    pub ip6: [u8; IP6_SIZE],
    pub label: u64,
}

impl Address {
    pub fn from_key(key: [u8; KEY_SIZE], label: u64) -> Self {
        Address { key, ip6: address_for_key(&key), label }
    }

    /// The network-wide identity invariant: ip6 = hash(key) inside fc00::/8.
    pub fn is_valid(&self) -> bool {
        self.ip6[0] == OVERLAY_PREFIX && self.ip6 == address_for_key(&self.key)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @{:016x}", fmt_ip6(&self.ip6), self.label)
    }
}

/// Render a 16-byte address in the usual colon-grouped form.
pub fn fmt_ip6(ip6: &[u8; IP6_SIZE]) -> String {
    let groups: Vec<String> = ip6
        .chunks(2)
        .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
        .collect();
    groups.join(":")
}

// ============================================================================
// ROUTER-LAYER MESSAGES
// ============================================================================

/// Upper bound on a single router-layer message; longer frames are truncated
/// on the way in (the routing module never sees more than this).
pub const MAX_MESSAGE_SIZE: usize = 1536;

/// A message crossing the boundary to the routing module. `address` is the
/// remote end: the authenticated sender on receive, the target on send.
#[derive(Clone)]
pub struct DhtMessage {
    pub bytes: [u8; MAX_MESSAGE_SIZE],
    pub len: usize,
    pub address: Address,
}

impl DhtMessage {
    pub fn from_payload(address: Address, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_MESSAGE_SIZE);
        let mut bytes = [0u8; MAX_MESSAGE_SIZE];
        bytes[..len].copy_from_slice(&payload[..len]);
        DhtMessage { bytes, len, address }
    }

    #[inline(always)]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

// ============================================================================
// OUTER-SESSION TABLE
// ============================================================================

/// Capacity of the outer-session table. Must be a power of 2.
pub const MAX_SESSIONS: usize = 256;

/// FNV-1a over the 8 label bytes.
#[inline(always)]
fn label_hash(label: u64) -> usize {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in label.to_le_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h as usize
}

/// Peer-to-peer session table keyed by switch label. Flat array with linear
/// probing; at most one session per label; insertion is timestamped and the
/// oldest entry is evicted when the table fills. Single-threaded (owned by
/// the dispatch core).
pub struct SessionTable {
    labels: [u64; MAX_SESSIONS],
    used: [bool; MAX_SESSIONS],
    created_rel_s: [u32; MAX_SESSIONS],
    sessions: Vec<Option<Box<dyn PeerSession>>>,
    count: u16,
    epoch_ns: u64,
}

impl SessionTable {
    pub fn new(epoch_ns: u64) -> Self {
        let mut sessions = Vec::with_capacity(MAX_SESSIONS);
        for _ in 0..MAX_SESSIONS {
            sessions.push(None);
        }
        SessionTable {
            labels: [0; MAX_SESSIONS],
            used: [false; MAX_SESSIONS],
            created_rel_s: [0; MAX_SESSIONS],
            sessions,
            count: 0,
            epoch_ns,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn rel_s(&self, now_ns: u64) -> u32 {
        (now_ns.saturating_sub(self.epoch_ns) / 1_000_000_000) as u32
    }

    pub fn lookup(&self, label: u64) -> Option<usize> {
        let mut idx = label_hash(label) & (MAX_SESSIONS - 1);
        for _ in 0..MAX_SESSIONS {
            if self.used[idx] && self.labels[idx] == label {
                return Some(idx);
            }
            idx = (idx + 1) & (MAX_SESSIONS - 1);
        }
        None
    }

    /// Fetch the session for a label, creating one with `make` if absent.
    pub fn get_or_create(
        &mut self,
        label: u64,
        now_ns: u64,
        make: impl FnOnce() -> Box<dyn PeerSession>,
    ) -> &mut dyn PeerSession {
        let idx = match self.lookup(label) {
            Some(idx) => idx,
            None => {
                let idx = self.free_slot(label);
                self.labels[idx] = label;
                self.used[idx] = true;
                self.created_rel_s[idx] = self.rel_s(now_ns);
                self.sessions[idx] = Some(make());
                self.count += 1;
                eprintln!(
                    "[FC8-SESS] new session label={:016x} → slot {} (total: {})",
                    label, idx, self.count
                );
                idx
            }
        };
        self.sessions[idx].as_mut().unwrap().as_mut()
    }

    /// First empty slot along the probe chain, evicting the oldest entry if
    /// the table is full. Lookups displaced by eviction holes simply miss and
    /// re-create lazily.
    fn free_slot(&mut self, label: u64) -> usize {
        let mut idx = label_hash(label) & (MAX_SESSIONS - 1);
        for _ in 0..MAX_SESSIONS {
            if !self.used[idx] {
                return idx;
            }
            idx = (idx + 1) & (MAX_SESSIONS - 1);
        }
        let mut oldest = 0;
        for i in 1..MAX_SESSIONS {
            if self.created_rel_s[i] < self.created_rel_s[oldest] {
                oldest = i;
            }
        }
        eprintln!(
            "[FC8-SESS] table full, evicting label={:016x} from slot {}",
            self.labels[oldest], oldest
        );
        self.evict(oldest);
        oldest
    }

    pub fn evict(&mut self, idx: usize) {
        if idx >= MAX_SESSIONS || !self.used[idx] {
            return;
        }
        self.used[idx] = false;
        self.labels[idx] = 0;
        self.sessions[idx] = None;
        if self.count > 0 {
            self.count -= 1;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
