// FC8 CORE — NETWORK: DATAPATH
// Everything about moving packets — one file, one truth.
//
// Ingress:  incoming_from_switch → outer open → received_from_crypto_auth
//           → decrypted_incoming → { content open → incoming_for_me → tun
//                                  | forward → send_to_router → switch }
// Egress:   ip6_from_tun / handle_outgoing → content seal → outgoing_from_me
//           → decrypted_incoming → send_to_router → outer seal → switch
// Control:  switch-layer error frames → broken-path reports to the router
//
// Every stage is a plain function of (frame, dispatch record); the record
// carries exactly the state one stage writes for the next synchronous call.

use crate::engine::protocol::*;
use crate::engine::runtime::{clock_ns, Scratch};
use crate::network::{
    ContentOpened, ContentSessions, DispatchError, DispatchStats, Frame, Opened,
    PeerAuthenticator, RegisterError, RouterModule, SwitchPort, TunPort,
    CONTENT_KEY_OUTGOING, DEFAULT_HEADROOM, DEFAULT_TAILROOM,
};

// ============================================================================
// PER-FRAME DISPATCH RECORD
// ============================================================================

/// State written by one dispatch stage and read by the next call in the same
/// synchronous chain. One record per entry-point invocation, never shared.
#[derive(Default)]
struct DispatchState {
    switch_header: Option<SwitchHeader>,
    ip6_header: Option<Ip6Header>,
    her_key: Option<[u8; 32]>,
    /// Set only for router traffic, where the routing layer already chose
    /// the next hop. Router-to-router traffic must never be forwarded.
    forward_to: Option<Address>,
}

// ============================================================================
// VALIDATION HELPERS
// ============================================================================

/// Parse and validate the IPv6 header at the front of the window: both
/// addresses inside fc00::/8 and the payload length covering exactly the
/// rest of the frame.
fn checked_ip6(frame: &Frame) -> Option<Ip6Header> {
    let ip6 = Ip6Header::read(frame.bytes())?;
    let valid = ip6.source_addr[0] == OVERLAY_PREFIX
        && ip6.dest_addr[0] == OVERLAY_PREFIX
        && ip6.payload_len() as usize == frame.len() - IP6_HDR_SIZE;
    valid.then_some(ip6)
}

/// Router traffic is zero-ported UDP whose enclosing header arrived with a
/// hop limit of zero. The zero hop limit is intentional: any node that tried
/// to forward such a frame would drop it, so router traffic can never travel
/// further than the peer it was addressed to.
fn is_router_traffic(frame: &Frame, ip6: &Ip6Header) -> bool {
    if ip6.next_header != NEXT_HEADER_UDP || ip6.hop_limit != 0 {
        return false;
    }
    match UdpHeader::read(frame.bytes()) {
        Some(udp) => {
            udp.src_port_be == 0
                && udp.dst_port_be == 0
                && u16::from_be(udp.length_be) as usize == frame.len() - UDP_HDR_SIZE
        }
        None => false,
    }
}

// ============================================================================
// DISPATCH CORE
// ============================================================================

/// The packet-glue core: one per node, single-threaded, wired between the
/// switch fabric, the routing module, the tunnel device, and the two crypto
/// layers. Each frame is processed to completion before the next.
pub struct Core<A, C, R, S, T>
where
    A: PeerAuthenticator,
    C: ContentSessions,
    R: RouterModule,
    S: SwitchPort,
    T: TunPort,
{
    addr: Address,
    auth: A,
    content: C,
    router: R,
    switch: S,
    tun: Option<T>,
    sessions: SessionTable,
    scratch: Scratch,
    stats: DispatchStats,
}

impl<A, C, R, S, T> Core<A, C, R, S, T>
where
    A: PeerAuthenticator,
    C: ContentSessions,
    R: RouterModule,
    S: SwitchPort,
    T: TunPort,
{
    /// Wire the core up. The node's address is derived from the
    /// authenticator's public key and must land inside fc00::/8; the
    /// embedding daemon connects the entry points to its event loop.
    pub fn register(
        auth: A,
        content: C,
        router: R,
        switch: S,
        tun: Option<T>,
    ) -> Result<Self, RegisterError> {
        let key = auth.public_key();
        let addr = Address::from_key(key, 0);
        if addr.ip6[0] != OVERLAY_PREFIX {
            return Err(RegisterError::KeyOutsideOverlay);
        }
        eprintln!("[FC8-PIPE] core registered as {}", fmt_ip6(&addr.ip6));
        Ok(Core {
            addr,
            auth,
            content,
            router,
            switch,
            tun,
            sessions: SessionTable::new(clock_ns()),
            scratch: Scratch::new(),
            stats: DispatchStats::default(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.addr
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn outer_sessions(&self) -> usize {
        self.sessions.len()
    }

    // ------------------------------------------------------------------
    // INGRESS — switch → local
    // ------------------------------------------------------------------

    /// Entry point for every frame the switch hands us. Frame is aligned on
    /// the switch header.
    pub fn incoming_from_switch(&mut self, frame: &mut Frame) -> Result<(), DispatchError> {
        self.stats.from_switch += 1;

        let Some(mut header) = SwitchHeader::read(frame.bytes()) else {
            self.stats.invalid += 1;
            return Err(DispatchError::Invalid);
        };
        frame.shift(-(SWITCH_HDR_SIZE as isize))?;

        // The label comes in bit-reversed: the fabric doesn't know we are
        // the last hop. Reversing it yields the route back to the sender.
        header.set_label(header.label().reverse_bits());

        if header.message_type() == MSG_TYPE_CONTROL {
            return self.control_incoming(frame, &header);
        }

        let now = clock_ns();
        let (open_result, her_key) = {
            let Core { sessions, auth, .. } = self;
            let session = sessions.get_or_create(header.label(), now, || auth.open_session(None));
            let result = session.open(frame);
            (result, session.remote_key())
        };

        match open_result {
            Ok(Opened::Plaintext) => {
                let mut state = DispatchState {
                    switch_header: Some(header),
                    her_key,
                    ..Default::default()
                };
                // Failures past this point were already counted and logged;
                // the switch gets no feedback either way.
                if let Err(e) = self.received_from_crypto_auth(frame, &mut state) {
                    if cfg!(debug_assertions) {
                        eprintln!("[FC8-PIPE] inbound frame dropped: {e}");
                    }
                }
                Ok(())
            }
            Ok(Opened::Absorbed) => Ok(()),
            Err(e) => {
                self.stats.outer_fail += 1;
                if cfg!(debug_assertions) {
                    eprintln!(
                        "[FC8-SESS] outer decrypt failed on label={:016x}: {e}",
                        header.label()
                    );
                }
                Ok(())
            }
        }
    }

    /// Switch-layer control traffic. Error frames about the path the frame
    /// itself arrived on are acted upon; everything else is logged.
    fn control_incoming(
        &mut self,
        frame: &mut Frame,
        header: &SwitchHeader,
    ) -> Result<(), DispatchError> {
        self.stats.control += 1;

        let Some(ctrl) = ControlHeader::read(frame.bytes()) else {
            if cfg!(debug_assertions) {
                eprintln!("[FC8-CTRL] runt control frame, dropping");
            }
            return Ok(());
        };
        if ctrl.ctrl_type() != CTRL_TYPE_ERROR {
            eprintln!("[FC8-CTRL] unhandled control type {}", ctrl.ctrl_type());
            return Ok(());
        }
        let Some(err) = ErrorPayload::read(&frame.bytes()[CTRL_HDR_SIZE..]) else {
            if cfg!(debug_assertions) {
                eprintln!("[FC8-CTRL] truncated error payload, dropping");
            }
            return Ok(());
        };
        if err.cause_label() != header.label() {
            // Shouldn't happen; most likely the frame was corrupted in flight.
            if cfg!(debug_assertions) {
                eprintln!(
                    "[FC8-CTRL] cause label {:016x} differs from return label {:016x}, ignoring",
                    err.cause_label(),
                    header.label()
                );
            }
            return Ok(());
        }
        if err.error_type() == ERROR_MALFORMED_ADDRESS {
            eprintln!(
                "[FC8-CTRL] malformed-address error, removing route {:016x}",
                header.label()
            );
            self.router.broken_path(header.label());
            self.stats.broken_paths += 1;
            return Ok(());
        }
        eprintln!("[FC8-CTRL] error frame, type {}", err.error_type());
        Ok(())
    }

    /// Plaintext from the outer session, aligned on the IPv6 header. The
    /// only place a peer can enter the routing table.
    fn received_from_crypto_auth(
        &mut self,
        frame: &mut Frame,
        state: &mut DispatchState,
    ) -> Result<(), DispatchError> {
        let header = state.switch_header.as_ref().ok_or(DispatchError::Invalid)?;
        let key = state.her_key.unwrap_or([0u8; 32]);
        let addr = Address::from_key(key, header.label());

        if addr.ip6[0] != OVERLAY_PREFIX {
            // A decrypted frame with no key at all is a wiring bug, not a
            // peer problem.
            assert!(key != [0u8; 32], "authenticated frame with a zero public key");
            if cfg!(debug_assertions) {
                eprintln!("[FC8-PIPE] peer key hashes outside fc00::/8, ignoring frame");
            }
            return Ok(());
        }

        if checked_ip6(frame).is_none() {
            self.stats.invalid += 1;
            if cfg!(debug_assertions) {
                eprintln!("[FC8-PIPE] invalid ipv6 after outer decrypt, dropping");
            }
            return Err(DispatchError::Invalid);
        }

        self.stats.outer_ok += 1;
        self.router.add_node(&addr);
        self.decrypted_incoming(frame, state)
    }

    /// Plaintext at the outer layer, aligned on the IPv6 header. Decides
    /// local delivery versus forwarding. Reached from ingress and, for
    /// outbound frames, from `outgoing_from_me`.
    fn decrypted_incoming(
        &mut self,
        frame: &mut Frame,
        state: &mut DispatchState,
    ) -> Result<(), DispatchError> {
        let Some(ip6) = checked_ip6(frame) else {
            self.stats.invalid += 1;
            if cfg!(debug_assertions) {
                eprintln!("[FC8-PIPE] invalid ipv6 header, dropping");
            }
            return Err(DispatchError::Invalid);
        };
        state.ip6_header = Some(ip6);

        if ip6.dest_addr == self.addr.ip6 {
            frame.shift(-(IP6_HDR_SIZE as isize))?;
            // The content layer finds its session handle in the source
            // address bytes of the header we just stripped.
            return match self.content.open(frame) {
                Ok(ContentOpened::Content { remote_key }) => {
                    self.incoming_for_me(frame, state, remote_key)
                }
                Ok(ContentOpened::Absorbed) => Ok(()),
                Ok(ContentOpened::Reply) => self.outgoing_from_me(frame, state),
                Err(e) => {
                    self.stats.inner_fail += 1;
                    if cfg!(debug_assertions) {
                        eprintln!("[FC8-SESS] content decrypt failed: {e}");
                    }
                    Err(e.into())
                }
            };
        }

        if ip6.hop_limit == 0 {
            self.stats.undeliverable += 1;
            if cfg!(debug_assertions) {
                eprintln!("[FC8-PIPE] hop limit exhausted, dropping");
            }
            return Err(DispatchError::Undeliverable);
        }
        let mut ip6 = ip6;
        ip6.hop_limit -= 1;
        ip6.write(frame.bytes_mut());
        state.ip6_header = Some(ip6);

        if let Some(forward_to) = state.forward_to.take() {
            // Router traffic: the routing layer already chose the next hop.
            return self.send_to_router(&forward_to, frame, state);
        }

        match self.router.get_best(&ip6.dest_addr) {
            Some(next_hop) => self.send_to_router(&next_hop, frame, state),
            None => {
                self.stats.undeliverable += 1;
                if cfg!(debug_assertions) {
                    eprintln!(
                        "[FC8-PIPE] no route toward {}, we are the closest known node",
                        fmt_ip6(&ip6.dest_addr)
                    );
                }
                Err(DispatchError::Undeliverable)
            }
        }
    }

    /// Content plaintext addressed to this node, aligned on the content
    /// payload. The sender's content key must hash to the IPv6 source.
    fn incoming_for_me(
        &mut self,
        frame: &mut Frame,
        state: &mut DispatchState,
        remote_key: [u8; 32],
    ) -> Result<(), DispatchError> {
        let header = state.switch_header.as_ref().ok_or(DispatchError::Invalid)?;
        let ip6 = state.ip6_header.ok_or(DispatchError::Invalid)?;

        let addr = Address::from_key(remote_key, header.label());
        if addr.ip6 != ip6.source_addr {
            self.stats.spoofed += 1;
            if cfg!(debug_assertions) {
                eprintln!(
                    "[FC8-PIPE] source address is not the hash of the key, dropping\n\
                     [FC8-PIPE]   {} source addr\n\
                     [FC8-PIPE]   {} hash of key",
                    fmt_ip6(&ip6.source_addr),
                    fmt_ip6(&addr.ip6)
                );
            }
            return Err(DispatchError::Invalid);
        }

        if is_router_traffic(frame, &ip6) {
            frame.shift(-(UDP_HDR_SIZE as isize))?;
            return self.incoming_dht(frame, &addr);
        }

        if self.tun.is_none() {
            eprintln!("[FC8-TUN] no tunnel device configured, dropping");
            self.stats.undeliverable += 1;
            return Err(DispatchError::Undeliverable);
        }

        // Restore the IPv6 header in front of the content. The crypto
        // headers that sat between them are gone, so the payload length is
        // now exactly the content length.
        let content_len = frame.len();
        frame.shift(IP6_HDR_SIZE as isize)?;
        let mut header = ip6;
        header.payload_len_be = (content_len as u16).to_be();
        header.write(frame.bytes_mut());

        self.tun.as_mut().unwrap().deliver(frame);
        self.stats.tun_writes += 1;
        Ok(())
    }

    /// Router traffic for the local routing module: bounded copy, scratch
    /// reset, delivery.
    fn incoming_dht(&mut self, frame: &Frame, sender: &Address) -> Result<(), DispatchError> {
        let message = DhtMessage::from_payload(*sender, frame.bytes());
        // The scratch arena is a bump allocator: freeing is resetting.
        self.scratch.reset();
        self.router.handle_incoming(&message, &mut self.scratch);
        self.stats.router_in += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // EGRESS — local → switch
    // ------------------------------------------------------------------

    /// Entry point for plaintext IPv6 read off the tunnel device.
    pub fn ip6_from_tun(&mut self, frame: &mut Frame) -> Result<(), DispatchError> {
        self.stats.from_tun += 1;

        let Some(ip6) = checked_ip6(frame) else {
            self.stats.invalid += 1;
            if cfg!(debug_assertions) {
                eprintln!("[FC8-TUN] frame from tun is not valid ipv6, dropping");
            }
            return Err(DispatchError::Invalid);
        };

        if ip6.source_addr != self.addr.ip6 {
            self.stats.spoofed += 1;
            eprintln!("[FC8-TUN] only the node's own address may source traffic, dropping");
            return Err(DispatchError::Invalid);
        }

        let mut state = DispatchState {
            ip6_header: Some(ip6),
            switch_header: Some(SwitchHeader::zeroed()),
            ..Default::default()
        };

        frame.shift(-(IP6_HDR_SIZE as isize))?;
        // The content layer reads the endpoint handle from the destination
        // address bytes of the header we just stripped.
        if let Err(e) = self.content.seal(frame) {
            self.stats.inner_fail += 1;
            if cfg!(debug_assertions) {
                eprintln!("[FC8-SESS] content encrypt failed: {e}");
            }
            return Err(e.into());
        }
        self.outgoing_from_me(frame, &mut state)
    }

    /// Entry point for the routing module: emit a control message to a peer
    /// whose address it already knows.
    pub fn handle_outgoing(&mut self, message: &DhtMessage) -> Result<(), DispatchError> {
        self.stats.router_out += 1;
        let target = message.address;

        let mut frame = Frame::new(DEFAULT_HEADROOM, message.payload(), DEFAULT_TAILROOM);
        frame.shift(UDP_HDR_SIZE as isize)?;
        let udp = UdpHeader {
            src_port_be: 0,
            dst_port_be: 0,
            length_be: (message.len as u16).to_be(),
            checksum_be: 0,
        };
        udp.write(frame.bytes_mut());

        // Hop limit 1: the send-side decrement below takes it to zero, and
        // zero is the receive-side router-traffic marker. Router-to-router
        // traffic must never be forwarded. Payload length is filled in
        // after the crypto.
        let ip6 = Ip6Header::new(self.addr.ip6, target.ip6, NEXT_HEADER_UDP, 1);
        let mut state = DispatchState {
            ip6_header: Some(ip6),
            forward_to: Some(target),
            ..Default::default()
        };

        // There is no real IPv6 header behind this window; plant the
        // destination where the content layer expects its handle.
        frame.write_behind(CONTENT_KEY_OUTGOING, &target.ip6)?;
        self.content.set_key(&frame, &target.key, true);

        if let Err(e) = self.content.seal(&mut frame) {
            self.stats.inner_fail += 1;
            if cfg!(debug_assertions) {
                eprintln!("[FC8-SESS] content encrypt failed for router traffic: {e}");
            }
            return Err(e.into());
        }
        self.outgoing_from_me(&mut frame, &mut state)
    }

    /// Inner-encrypted frame aligned on the content-crypto header; the
    /// outbound IPv6 header must be reapplied over it.
    fn outgoing_from_me(
        &mut self,
        frame: &mut Frame,
        state: &mut DispatchState,
    ) -> Result<(), DispatchError> {
        let mut ip6 = state.ip6_header.take().ok_or(DispatchError::Invalid)?;

        // The content-crypto headers are hidden under the IPv6 header now;
        // the payload length must cover them.
        ip6.payload_len_be = (frame.len() as u16).to_be();
        frame.shift(IP6_HDR_SIZE as isize)?;

        if ip6.dest_addr == self.addr.ip6 {
            // The content layer answered a remote initiator's handshake
            // while decrypting; flip the addresses so the reply travels
            // back to the other node.
            ip6.dest_addr = ip6.source_addr;
            ip6.source_addr = self.addr.ip6;
        }
        ip6.write(frame.bytes_mut());
        state.ip6_header = Some(ip6);

        // Not for us, so this routes the frame outward.
        self.decrypted_incoming(frame, state)
    }

    // ------------------------------------------------------------------
    // SWITCH EMISSION
    // ------------------------------------------------------------------

    /// Wrap a plaintext-at-the-outer-layer frame for one peer and emit it.
    fn send_to_router(
        &mut self,
        target: &Address,
        frame: &mut Frame,
        state: &mut DispatchState,
    ) -> Result<(), DispatchError> {
        // Copy the switch header out before the outer-crypto headers clobber
        // the region it was parsed from, then point it at the next hop.
        let mut header = state.switch_header.take().unwrap_or_else(SwitchHeader::zeroed);
        header.set_label(target.label);
        state.switch_header = Some(header);

        let now = clock_ns();
        let seal_result = {
            let Core { sessions, auth, .. } = self;
            let session =
                sessions.get_or_create(target.label, now, || auth.open_session(Some(target.key)));
            session.seal(frame)
        };
        if let Err(e) = seal_result {
            self.stats.outer_fail += 1;
            if cfg!(debug_assertions) {
                eprintln!(
                    "[FC8-SESS] outer encrypt failed toward label={:016x}: {e}",
                    target.label
                );
            }
            return Err(e.into());
        }

        self.send_to_switch(frame, &header)
    }

    /// Prepend the switch header and hand the frame to the fabric. The label
    /// goes out as-is; reversal is an ingress-only artifact.
    fn send_to_switch(
        &mut self,
        frame: &mut Frame,
        header: &SwitchHeader,
    ) -> Result<(), DispatchError> {
        frame.shift(SWITCH_HDR_SIZE as isize)?;
        header.write(frame.bytes_mut());
        self.switch.forward(frame);
        self.stats.emitted += 1;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_ip6(ip6: Ip6Header, payload: &[u8]) -> Frame {
        let mut bytes = vec![0u8; IP6_HDR_SIZE + payload.len()];
        ip6.write(&mut bytes);
        bytes[IP6_HDR_SIZE..].copy_from_slice(payload);
        Frame::wire(&bytes)
    }

    fn fc(last: u8) -> [u8; 16] {
        let mut addr = [0u8; 16];
        addr[0] = 0xFC;
        addr[15] = last;
        addr
    }

    #[test]
    fn checked_ip6_requires_overlay_prefix() {
        let mut ip6 = Ip6Header::new(fc(1), fc(2), 59, 4);
        ip6.payload_len_be = 4u16.to_be();
        let frame = frame_with_ip6(ip6, &[0; 4]);
        assert!(checked_ip6(&frame).is_some());

        let mut bad_src = ip6;
        bad_src.source_addr[0] = 0x20;
        let frame = frame_with_ip6(bad_src, &[0; 4]);
        assert!(checked_ip6(&frame).is_none());
    }

    #[test]
    fn checked_ip6_requires_exact_payload_length() {
        let mut ip6 = Ip6Header::new(fc(1), fc(2), 59, 4);
        ip6.payload_len_be = 3u16.to_be();
        let frame = frame_with_ip6(ip6, &[0; 4]);
        assert!(checked_ip6(&frame).is_none());
    }

    #[test]
    fn router_traffic_predicate() {
        let mut ip6 = Ip6Header::new(fc(1), fc(2), NEXT_HEADER_UDP, 0);
        let payload = [0xAB; 10];
        let udp = UdpHeader {
            src_port_be: 0,
            dst_port_be: 0,
            length_be: (payload.len() as u16).to_be(),
            checksum_be: 0,
        };
        let mut body = vec![0u8; UDP_HDR_SIZE + payload.len()];
        udp.write(&mut body);
        body[UDP_HDR_SIZE..].copy_from_slice(&payload);
        ip6.payload_len_be = (body.len() as u16).to_be();

        let mut frame = frame_with_ip6(ip6, &body);
        frame.shift(-(IP6_HDR_SIZE as isize)).unwrap();
        assert!(is_router_traffic(&frame, &ip6));

        // Any hop limit other than zero disqualifies the frame.
        let mut hop = ip6;
        hop.hop_limit = 1;
        assert!(!is_router_traffic(&frame, &hop));

        // So does a nonzero port.
        let mut ported = frame_with_ip6(ip6, &body);
        ported.shift(-(IP6_HDR_SIZE as isize)).unwrap();
        ported.bytes_mut()[0] = 0x12;
        assert!(!is_router_traffic(&ported, &ip6));

        // And a UDP length that disagrees with the frame.
        let mut short = frame_with_ip6(ip6, &body);
        short.shift(-(IP6_HDR_SIZE as isize)).unwrap();
        short.bytes_mut()[4..6].copy_from_slice(&1u16.to_be_bytes());
        assert!(!is_router_traffic(&short, &ip6));
    }
}
