#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::BTreeMap;
use std::time::Instant;

use crate::*;
use behaviour::{ClientSetup, ServerSetup};
use channel::{ChanData, ChanNum, ChanState, ReqId};
use cliauth::ClientAuth;
use completion::Completion;
use config::{Config, Policy};
use conn::{Conn, Dispatched};
use encrypt::KeyState;
use event::Event;
use packets::{ChannelOpenType, ChannelReqType};
use sshnames::DisconnectReason;
use traffic::{Payload, Stats, TrafIn, TrafOut, TrafSend};

/// A SSH connection, client or server.
///
/// `Runner` doesn't perform any IO itself. Bytes from the socket are passed
/// to [`input()`](Self::input), bytes for the socket are taken with
/// [`output()`](Self::output). Everything else happens in between, on the
/// caller's thread. Operations that complete later (authentication, channel
/// opens, requests) return a [`Completion`].
///
/// Errors returned from [`input()`](Self::input) and
/// [`handle_timeouts()`](Self::handle_timeouts) are fatal. A DISCONNECT has
/// already been queued for output and an [`Event::Disconnected`] is pending.
pub struct Runner {
    conn: Conn,

    /// Binary packet handling from the network buffer
    traf_in: TrafIn,
    /// Binary packet handling to the network buffer
    traf_out: TrafOut,

    /// Current encryption/integrity keys
    keys: KeyState,

    stats: Stats,
    /// `bytes_in + bytes_out` and `packets_in + packets_out` when the
    /// last key exchange completed
    rekey_mark: (u64, u64),

    /// Our ident and first KexInit have been queued
    started: bool,
    closed: bool,

    properties: BTreeMap<String, String>,
}

impl core::fmt::Debug for Runner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runner")
            .field("client", &self.conn.is_client())
            .field("closed", &self.closed)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new_client(conf: Config, setup: ClientSetup) -> Result<Runner> {
        conf.validate()?;
        let conn = Conn::new_client(conf, setup)?;
        Ok(Self::new(conn))
    }

    pub fn new_server(conf: Config, setup: ServerSetup) -> Result<Runner> {
        conf.validate()?;
        let conn = Conn::new_server(conf, setup)?;
        Ok(Self::new(conn))
    }

    fn new(conn: Conn) -> Self {
        Runner {
            conn,
            traf_in: TrafIn::new(),
            traf_out: TrafOut::new(),
            keys: KeyState::new_cleartext(),
            stats: Stats::default(),
            rekey_mark: (0, 0),
            started: false,
            closed: false,
            properties: BTreeMap::new(),
        }
    }

    pub fn is_client(&self) -> bool {
        self.conn.is_client()
    }

    /// Fatal errors disconnect before being returned
    fn check<T>(&mut self, r: Result<T>) -> Result<T> {
        r.map_err(|e| self.fail(e))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Disconnected)
        } else {
            Ok(())
        }
    }

    fn check_authed(&self) -> Result<()> {
        self.check_open()?;
        if self.conn.is_authed() {
            Ok(())
        } else {
            Err(Error::bad_usage("Not authenticated"))
        }
    }

    fn sender(&mut self) -> TrafSend<'_> {
        self.traf_out.sender(&mut self.keys, &mut self.stats)
    }

    /// Queues any packets that are due without input: the initial
    /// identification and KexInit, and automatic rekeying.
    ///
    /// [`input()`](Self::input) and [`output()`](Self::output) call this.
    pub fn progress(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        if !self.started {
            self.started = true;
            self.traf_out.send_version(&self.conn.config().ident);
            let r = {
                let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
                self.conn.start(&mut s)
            };
            self.check(r)?;
        }

        if self.rekey_due() {
            info!("Rekeying after {} bytes", self.stats.bytes_in + self.stats.bytes_out - self.rekey_mark.0);
            let r = {
                let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
                self.conn.rekey(&mut s)
            };
            self.check(r)?;
        }
        Ok(())
    }

    fn rekey_due(&self) -> bool {
        let conf = self.conn.config();
        if !conf.policies.flag(Policy::AutoRekey) || self.stats.rekeys == 0 || !self.conn.kex_is_idle() {
            return false;
        }
        let bytes = self.stats.bytes_in + self.stats.bytes_out - self.rekey_mark.0;
        let packets = self.stats.packets_in + self.stats.packets_out - self.rekey_mark.1;
        bytes >= conf.rekey_bytes || packets >= conf.rekey_packets
    }

    /// Consumes bytes received from the socket.
    ///
    /// Returns the length consumed, which is all of `buf` unless the
    /// connection closed part way. Input after close is discarded.
    pub fn input(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            trace!("Discarding {} bytes after close", buf.len());
            return Ok(buf.len());
        }
        self.progress()?;

        let mut r = buf;
        while !r.is_empty() && !self.closed {
            let res = self.traf_in.input(&mut self.keys, r);
            let (n, payload) = self.check(res)?;
            r = &r[n..];
            self.stats.bytes_in += n as u64;
            if let Some(payload) = payload {
                self.stats.packets_in += 1;
                self.handle_payload(payload)?;
            }
        }

        self.progress()?;
        Ok(buf.len() - r.len())
    }

    fn handle_payload(&mut self, payload: Payload) -> Result<()> {
        let remote_version = self.traf_in.remote_version().unwrap_or_default();
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        let d = self.conn.handle_payload(&payload, remote_version, &mut s);
        match self.check(d)? {
            Dispatched::None => (),
            Dispatched::KexDone => {
                self.stats.rekeys += 1;
                self.rekey_mark = (
                    self.stats.bytes_in + self.stats.bytes_out,
                    self.stats.packets_in + self.stats.packets_out,
                );
            }
            Dispatched::Disconnect { reason, desc } => {
                self.close(reason, desc);
            }
        }
        Ok(())
    }

    /// Writes pending output to `buf`, returning the size written.
    ///
    /// Output queued before a close, including the DISCONNECT message,
    /// can still be taken afterwards.
    pub fn output(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.progress()?;
        Ok(self.traf_out.output(buf))
    }

    pub fn output_pending(&self) -> bool {
        self.traf_out.output_pending() || (!self.started && !self.closed)
    }

    /// Disconnects if authentication has timed out
    pub fn handle_timeouts(&mut self, now: Instant) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        match self.conn.auth_deadline() {
            Some(d) if now >= d => {
                info!("Authentication timed out");
                Err(self.fail(Error::AuthTimeout))
            }
            _ => Ok(()),
        }
    }

    /// When [`handle_timeouts()`](Self::handle_timeouts) should next be called
    pub fn next_timeout(&self) -> Option<Instant> {
        if self.closed {
            None
        } else {
            self.conn.auth_deadline()
        }
    }

    /// Sends a DISCONNECT and closes. Calling again has no effect.
    pub fn disconnect(&mut self, reason: DisconnectReason, desc: &str) {
        if self.closed {
            return;
        }
        info!("Disconnecting: {desc}");
        self.send_disconnect(reason, desc);
        self.close(reason as u32, desc.into());
    }

    fn send_disconnect(&mut self, reason: DisconnectReason, desc: &str) {
        self.traf_out.discard_held();
        let p = packets::Disconnect { reason: reason as u32, desc: desc.into(), lang: "".into() };
        if let Err(e) = self.sender().send(p) {
            debug!("Failed sending disconnect: {e}");
        }
    }

    /// Handles a fatal error, returning it
    fn fail(&mut self, e: Error) -> Error {
        if !self.closed {
            let reason = e.disconnect_reason();
            warn!("Fatal error, disconnecting: {e}");
            let desc = e.to_string();
            self.send_disconnect(reason, &desc);
            self.close(reason as u32, desc);
        }
        e
    }

    fn close(&mut self, reason: u32, desc: String) {
        self.closed = true;
        self.traf_out.discard_held();
        self.conn.disconnected();
        self.conn.events.push_back(Event::Disconnected { reason, desc });
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Starts a key exchange, unless one is in progress
    pub fn rekey(&mut self) -> Result<()> {
        self.check_open()?;
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        self.conn.rekey(&mut s)
    }

    /// The exchange hash of the first key exchange
    pub fn session_id(&self) -> Option<&[u8]> {
        self.conn.sess_id().map(|s| s.as_slice())
    }

    pub fn authenticated(&self) -> bool {
        self.conn.is_authed()
    }

    /// The peer's identification string, once received
    pub fn remote_version(&self) -> Option<&str> {
        self.traf_in.remote_version()
    }

    /// Client only. Queues an authentication method. Methods are tried in
    /// the order they are added.
    pub fn add_auth_method(&mut self, method: ClientAuth) -> Result<Completion<()>> {
        self.check_open()?;
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        let (auth, ctx) = self.conn.cli_auth()?;
        auth.add(method, ctx, &mut s)
    }

    /// Opens a channel. The completion finishes once the peer confirms or refuses.
    pub fn open_channel(&mut self, ty: ChannelOpenType) -> Result<(ChanNum, Completion<()>)> {
        self.check_authed()?;
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        let (channels, factory) = self.conn.channels_factory();
        channels.open(ty, factory, &mut s)
    }

    /// Sends a channel request. Replies complete in the order requests were sent.
    pub fn channel_request(&mut self, chan: ChanNum, req: ChannelReqType, want_reply: bool) -> Result<Completion<()>> {
        self.check_authed()?;
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        self.conn.channels.request(chan, req, want_reply, &mut s)
    }

    /// Answers an [`Event::ChannelRequest`]
    pub fn channel_reply(&mut self, chan: ChanNum, id: ReqId, success: bool) -> Result<()> {
        self.check_authed()?;
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        self.conn.channels.reply(chan, id, success, &mut s)
    }

    /// Sends channel data, returning the length consumed.
    ///
    /// Returns `Ok(0)` when the peer's window is full or too much
    /// output is waiting, [`Error::ChannelEOF`] after our EOF.
    pub fn channel_send(&mut self, chan: ChanNum, dt: ChanData, data: &[u8]) -> Result<usize> {
        self.check_authed()?;
        if data.is_empty() {
            return Ok(0);
        }
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        if s.is_full() {
            trace!("Output full");
            return Ok(0);
        }
        self.conn.channels.send_data(chan, dt, data, &mut s)
    }

    /// How much could be sent on a channel now
    pub fn channel_send_space(&self, chan: ChanNum) -> Result<usize> {
        self.check_authed()?;
        self.conn.channels.send_space(chan)
    }

    /// Reads received channel data.
    ///
    /// Returns `Ok(0)` when nothing is buffered, [`Error::ChannelEOF`] when
    /// nothing more will arrive.
    pub fn channel_read(&mut self, chan: ChanNum, dt: ChanData, buf: &mut [u8]) -> Result<usize> {
        self.check_authed()?;
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        self.conn.channels.read(chan, dt, buf, &mut s)
    }

    /// Received data waiting to be read
    pub fn channel_readable(&self, chan: ChanNum, dt: ChanData) -> Result<usize> {
        self.check_authed()?;
        self.conn.channels.readable(chan, dt)
    }

    pub fn channel_eof(&mut self, chan: ChanNum) -> Result<()> {
        self.check_authed()?;
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        self.conn.channels.send_eof(chan, &mut s)
    }

    /// Sends CLOSE. [`Event::ChannelClosed`] follows once the peer has closed too.
    pub fn channel_close(&mut self, chan: ChanNum) -> Result<()> {
        self.check_authed()?;
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        self.conn.channels.close(chan, &mut self.conn.events, &mut s)
    }

    pub fn channel_state(&self, chan: ChanNum) -> Result<ChanState> {
        self.conn.channels.state(chan)
    }

    /// Client only. Asks the server to listen on `address` and `port`,
    /// completing with the bound port.
    pub fn tcpip_forward(&mut self, address: &str, port: u32) -> Result<Completion<u32>> {
        self.check_authed()?;
        if !self.is_client() {
            return Err(Error::bad_usage("Only clients request forwarding"));
        }
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        self.conn.global.tcpip_forward(address, port, &mut s)
    }

    pub fn cancel_tcpip_forward(&mut self, address: &str, port: u32) -> Result<Completion<()>> {
        self.check_authed()?;
        if !self.is_client() {
            return Err(Error::bad_usage("Only clients request forwarding"));
        }
        let mut s = self.traf_out.sender(&mut self.keys, &mut self.stats);
        self.conn.global.cancel_tcpip_forward(address, port, &mut s)
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.conn.events.pop_front()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Application values attached to this connection
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.properties
    }

    #[cfg(test)]
    pub(crate) fn keys_mut(&mut self) -> &mut KeyState {
        &mut self.keys
    }
}

#[cfg(test)]
mod tests {
    use crate::behaviour::{AcceptAnyHostKey, ClientSetup};
    use crate::dusklog::init_test_log;
    use crate::runner::*;

    fn client() -> Runner {
        Runner::new_client(Config::default(), ClientSetup::new("me", AcceptAnyHostKey)).unwrap()
    }

    #[test]
    fn ident_first() {
        init_test_log();
        let mut r = client();
        assert!(r.output_pending());
        let mut buf = vec![0u8; 4096];
        let n = r.output(&mut buf).unwrap();
        assert!(buf[..n].starts_with(b"SSH-2.0-dusk_"));
        // KexInit follows the ident line
        let line = buf[..n].iter().position(|&b| b == b'\n').unwrap();
        assert!(n > line + 1);
        assert_eq!(r.stats().packets_out, 1);
    }

    #[test]
    fn bad_config_refused() {
        let conf = Config { max_packet: 0, ..Default::default() };
        assert!(Runner::new_client(conf, ClientSetup::new("me", AcceptAnyHostKey)).is_err());
    }

    #[test]
    fn not_ssh() {
        init_test_log();
        let mut r = client();
        let mut junk = Vec::new();
        for _ in 0..60 {
            junk.extend_from_slice(b"hello there\r\n");
        }
        assert!(r.input(&junk).is_err());
        assert!(r.is_closed());
        assert!(matches!(r.next_event(), Some(Event::Disconnected { .. })));
        // further input is ignored
        assert_eq!(r.input(b"more").unwrap(), 4);
    }

    #[test]
    fn disconnect_idempotent() {
        init_test_log();
        let mut r = client();
        let mut buf = vec![0u8; 4096];
        r.output(&mut buf).unwrap();
        r.disconnect(DisconnectReason::ByApplication, "done");
        r.disconnect(DisconnectReason::ByApplication, "again");
        assert!(r.is_closed());
        assert!(matches!(r.next_event(), Some(Event::Disconnected { reason: 11, .. })));
        assert!(r.next_event().is_none());
        // the DISCONNECT is still output
        assert!(r.output(&mut buf).unwrap() > 0);
        assert!(matches!(r.open_channel(ChannelOpenType::Session), Err(Error::Disconnected)));
    }

    #[test]
    fn channels_need_auth() {
        let mut r = client();
        assert!(matches!(r.open_channel(ChannelOpenType::Session), Err(Error::BadUsage { .. })));
        assert!(r.add_auth_method(ClientAuth::password("pw")).is_ok());
        assert!(r.next_timeout().is_none());
    }
}
