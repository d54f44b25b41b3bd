// FC8 CORE — CRYPTOGRAPHY: CONTENT SESSIONS
// Default inner (content) session manager: one end-to-end channel per remote
// 16-byte address, regardless of how many hops separate the endpoints.
//
// The manager never sees addresses as arguments. Its handle rides in the
// bytes behind the frame window: the source address of the stripped IPv6
// header on receive (32 back), the destination on send (16 back). The
// dispatcher plants those bytes when no real header precedes the window.

use std::collections::HashMap;

use crate::cryptography::auth::{SecureChannel, CONTENT_INFO};
use crate::network::{
    ContentOpened, ContentSessions, Frame, Opened, SessionError, CONTENT_KEY_INCOMING,
    CONTENT_KEY_OUTGOING,
};

pub struct ContentManager {
    local_secret: [u8; 32],
    sessions: HashMap<[u8; 16], SecureChannel>,
}

impl ContentManager {
    pub fn new(private_key: [u8; 32]) -> Self {
        ContentManager { local_secret: private_key, sessions: HashMap::new() }
    }

    /// Associate a remote endpoint with its static key ahead of traffic —
    /// what the routing layer does when a search resolves an address.
    pub fn seed(&mut self, endpoint: [u8; 16], key: [u8; 32]) {
        self.channel(endpoint).pin(key);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn channel(&mut self, endpoint: [u8; 16]) -> &mut SecureChannel {
        let secret = self.local_secret;
        self.sessions
            .entry(endpoint)
            .or_insert_with(|| SecureChannel::new(secret, None, CONTENT_INFO))
    }

    fn endpoint_at(frame: &Frame, back: usize) -> Result<[u8; 16], SessionError> {
        let bytes = frame.behind(back, 16).map_err(|_| SessionError::Truncated)?;
        Ok(bytes.try_into().unwrap())
    }
}

impl ContentSessions for ContentManager {
    fn set_key(&mut self, frame: &Frame, key: &[u8; 32], outgoing: bool) {
        let back = if outgoing { CONTENT_KEY_OUTGOING } else { CONTENT_KEY_INCOMING };
        let Ok(endpoint) = Self::endpoint_at(frame, back) else {
            return;
        };
        self.channel(endpoint).pin(*key);
    }

    fn seal(&mut self, frame: &mut Frame) -> Result<(), SessionError> {
        let endpoint = Self::endpoint_at(frame, CONTENT_KEY_OUTGOING)?;
        self.channel(endpoint).seal(frame)
    }

    fn open(&mut self, frame: &mut Frame) -> Result<ContentOpened, SessionError> {
        let endpoint = Self::endpoint_at(frame, CONTENT_KEY_INCOMING)?;
        let channel = self.channel(endpoint);
        match channel.open(frame)? {
            Opened::Plaintext => {
                let remote_key = channel.remote_key().ok_or(SessionError::Authentication)?;
                Ok(ContentOpened::Content { remote_key })
            }
            Opened::Absorbed => Ok(ContentOpened::Absorbed),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
