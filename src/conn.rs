//! Represents the state of a SSH connection.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;
use std::time::Instant;

use pretty_hex::PrettyHex;

use crate::*;
use behaviour::{ChannelFactory, ClientSetup, ForwardingHandler, ServerSetup};
use channel::Channels;
use cliauth::CliAuth;
use config::{Config, Policy};
use event::Event;
use forward::GlobalRequests;
use kex::{Kex, KexParams, SessId};
use packets::{Category, Packet, ParseContext};
use servauth::ServAuth;
use traffic::{Payload, TrafSend};

#[derive(Debug, Clone, Copy, PartialEq)]
enum ConnState {
    /// Waiting for first Kex to complete
    FirstKex,
    /// Binary protocol has started, auth hasn't succeeded
    PreAuth,
    /// After auth success
    Authed,
}

/// Side specific state and collaborators
pub(crate) enum Role {
    Client { auth: CliAuth, setup: ClientSetup },
    Server { auth: ServAuth, setup: ServerSetup },
}

/// Returned from [`Conn::handle_payload()`] for the `Runner` to act on
#[must_use]
#[derive(Debug, PartialEq)]
pub(crate) enum Dispatched {
    None,
    /// A key exchange completed in both directions
    KexDone,
    /// The peer sent SSH_MSG_DISCONNECT
    Disconnect { reason: u32, desc: String },
}

/// The core state of a SSH instance.
pub(crate) struct Conn {
    state: ConnState,

    // State of any current Key Exchange
    kex: Kex,

    /// Fixed by the first exchange
    sess_id: Option<SessId>,

    conf: Config,
    parse_ctx: ParseContext,
    role: Role,

    pub(crate) channels: Channels,
    pub(crate) global: GlobalRequests,

    /// Application events not yet taken
    pub(crate) events: VecDeque<Event>,
}

/// Algorithm and identity inputs for a key exchange
fn kex_params<'a>(conf: &'a Config, role: &'a Role) -> KexParams<'a> {
    let (is_client, hostkeys) = match role {
        Role::Client { .. } => (true, [].as_slice()),
        Role::Server { setup, .. } => (false, setup.hostkeys.as_slice()),
    };
    KexParams {
        conf: &conf.algos,
        is_client,
        strict: conf.policies.flag(Policy::StrictKex),
        our_version: &conf.ident,
        hostkeys,
    }
}

impl Conn {
    pub fn new_client(conf: Config, setup: ClientSetup) -> Result<Self> {
        let auth = CliAuth::new(&setup.username, &conf.policies)?;
        Ok(Self::new(conf, Role::Client { auth, setup }))
    }

    pub fn new_server(conf: Config, setup: ServerSetup) -> Result<Self> {
        if setup.hostkeys.is_empty() {
            return Err(Error::bad_usage("Server needs a host key"));
        }
        let auth = ServAuth::new(&conf);
        Ok(Self::new(conf, Role::Server { auth, setup }))
    }

    fn new(conf: Config, role: Role) -> Self {
        let is_client = matches!(role, Role::Client { .. });
        Conn {
            state: ConnState::FirstKex,
            kex: Kex::new(),
            sess_id: None,
            channels: Channels::new(&conf, is_client),
            global: GlobalRequests::new(),
            parse_ctx: ParseContext::new(),
            events: VecDeque::new(),
            conf,
            role,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client { .. })
    }

    pub fn config(&self) -> &Config {
        &self.conf
    }

    pub fn sess_id(&self) -> Option<&SessId> {
        self.sess_id.as_ref()
    }

    pub fn is_authed(&self) -> bool {
        self.state == ConnState::Authed
    }

    pub fn kex_is_idle(&self) -> bool {
        self.kex.is_idle()
    }

    /// Sends our first KexInit
    pub fn start(&mut self, s: &mut TrafSend) -> Result<()> {
        self.kex.send_kexinit(&kex_params(&self.conf, &self.role), s)
    }

    /// Starts a key exchange unless one is running
    pub fn rekey(&mut self, s: &mut TrafSend) -> Result<()> {
        if self.state == ConnState::FirstKex {
            return Err(Error::bad_usage("First key exchange hasn't completed"));
        }
        if !self.kex.is_idle() {
            trace!("Key exchange already in progress");
            return Ok(());
        }
        debug!("Starting rekey");
        self.kex.send_kexinit(&kex_params(&self.conf, &self.role), s)
    }

    /// When authentication times out, if it hasn't completed
    pub fn auth_deadline(&self) -> Option<Instant> {
        if self.state == ConnState::Authed {
            return None;
        }
        match &self.role {
            Role::Client { auth, .. } => auth.idle_since().map(|t| t + self.conf.auth_idle_timeout),
            Role::Server { auth, .. } => auth.deadline(),
        }
    }

    pub fn cli_auth(&mut self) -> Result<(&mut CliAuth, &mut ParseContext)> {
        match &mut self.role {
            Role::Client { auth, .. } => Ok((auth, &mut self.parse_ctx)),
            Role::Server { .. } => Err(Error::bad_usage("Not a client")),
        }
    }

    /// The application's channel factory, with the channel table
    pub fn channels_factory(&mut self) -> (&mut Channels, &mut dyn ChannelFactory) {
        let f = match &mut self.role {
            Role::Client { setup, .. } => setup.channels.as_mut(),
            Role::Server { setup, .. } => setup.channels.as_mut(),
        };
        (&mut self.channels, f)
    }

    /// Fails everything outstanding
    pub fn disconnected(&mut self) {
        if let Role::Client { auth, .. } = &mut self.role {
            auth.disconnected();
        }
        self.channels.disconnected();
        self.global.disconnected();
    }

    /// Handles one decrypted packet. Response packets are queued with `s`.
    pub fn handle_payload(&mut self, payload: &Payload, remote_version: &str, s: &mut TrafSend) -> Result<Dispatched> {
        self.parse_ctx.last_req_port = self.global.expects_port();
        match sshwire::packet_from_bytes(&payload.data, &self.parse_ctx) {
            Ok(p) => {
                let num = p.message_num() as u8;
                let r = self.dispatch_packet(p, payload, remote_version, s);
                if let Err(e) = &r {
                    debug!("Error handling {num} packet: {e}");
                }
                r
            }
            Err(Error::UnknownPacket { number }) => {
                if self.state == ConnState::FirstKex && self.kex.is_strict() {
                    debug!("Unknown packet {number} during strict kex");
                    return Err(Error::SSHProtoError);
                }
                debug!("Unimplemented packet type {number}");
                s.send(packets::Unimplemented { seq: payload.seq })?;
                Ok(Dispatched::None)
            }
            Err(e) => {
                debug!("Error decoding packet: {e}");
                trace!("Input:\n{:?}", payload.data.hex_dump());
                Err(e)
            }
        }
    }

    /// Check that a packet is received in the correct state
    fn check_packet(&self, p: &Packet) -> Result<()> {
        let cat = p.category();
        let r = if let Packet::Disconnect(_) = p {
            Ok(())
        } else if self.state == ConnState::FirstKex && self.kex.is_strict() {
            // Strict Kex doesn't allow even packets like Ignore or Debug
            match cat {
                Category::Kex => Ok(()),
                _ => {
                    debug!("Non-kex packet during strict kex");
                    Err(Error::SSHProtoError)
                }
            }
        } else if self.kex.peer_in_kex() {
            // Normal KEX only allows certain packets
            match cat {
                Category::All | Category::Kex => Ok(()),
                _ => {
                    debug!("Invalid packet during kex");
                    Err(Error::SSHProtoError)
                }
            }
        } else {
            match cat {
                Category::All | Category::Kex => Ok(()),
                Category::Auth => match self.state {
                    ConnState::PreAuth | ConnState::Authed => Ok(()),
                    ConnState::FirstKex => Err(Error::SSHProtoError),
                },
                Category::Sess => match self.state {
                    ConnState::Authed => Ok(()),
                    _ => Err(Error::SSHProtoError),
                },
            }
        };

        if r.is_err() {
            debug!("Received unexpected packet {}", p.message_num() as u8);
            trace!("state is {:?}", self.state);
        }
        r
    }

    fn set_authed(&mut self) {
        info!("Authentication succeeded");
        self.state = ConnState::Authed;
        self.events.push_back(Event::Authenticated);
    }

    fn dispatch_packet(
        &mut self,
        packet: Packet,
        payload: &Payload,
        remote_version: &str,
        s: &mut TrafSend,
    ) -> Result<Dispatched> {
        trace!("Incoming {packet:?}");
        self.check_packet(&packet)?;

        if matches!(packet, Packet::KexDHInit(_) | Packet::KexDHReply(_)) && self.kex.discard_guess() {
            debug!("Discarding wrong kex guess");
            return Ok(Dispatched::None);
        }

        match packet {
            Packet::KexInit(k) => {
                let first = self.state == ConnState::FirstKex;
                let params = kex_params(&self.conf, &self.role);
                self.kex.handle_kexinit(&k, &payload.data, payload.seq, first, &params, remote_version, s)?;
            }
            Packet::KexDHInit(p) => {
                let Role::Server { setup, .. } = &self.role else {
                    debug!("Client received KexDHInit");
                    return Err(Error::SSHProtoError);
                };
                self.kex.handle_kexdhinit(&p, &setup.hostkeys, &mut self.sess_id, s)?;
            }
            Packet::KexDHReply(p) => {
                let Role::Client { setup, .. } = &mut self.role else {
                    debug!("Server received KexDHReply");
                    return Err(Error::SSHProtoError);
                };
                self.kex.handle_kexdhreply(&p, setup.verifier.as_mut(), &mut self.sess_id, s)?;
            }
            Packet::NewKeys(_) => {
                self.kex.handle_newkeys(s)?;
                if self.state == ConnState::FirstKex {
                    info!("Key exchange complete");
                    self.state = ConnState::PreAuth;
                    match &mut self.role {
                        Role::Client { auth, .. } => auth.start(s)?,
                        Role::Server { auth, .. } => auth.touch(),
                    }
                } else {
                    debug!("Rekey complete");
                }
                return Ok(Dispatched::KexDone);
            }
            Packet::ServiceRequest(p) => {
                let Role::Server { auth, setup } = &mut self.role else {
                    debug!("Server sent a service request");
                    return Err(Error::SSHProtoError);
                };
                auth.service_request(&p, setup.banner.as_deref(), s)?;
            }
            Packet::ServiceAccept(p) => {
                let Role::Client { auth, .. } = &mut self.role else {
                    debug!("Client sent a service accept");
                    return Err(Error::SSHProtoError);
                };
                auth.service_accept(&p, s)?;
            }
            Packet::Ignore(_) => {
                // nothing to do
            }
            Packet::Unimplemented(p) => {
                warn!("Received SSH unimplemented message for seq {}", p.seq);
            }
            Packet::DebugPacket(p) => {
                let level = match p.always_display {
                    true => log::Level::Info,
                    false => log::Level::Debug,
                };
                log!(level, "SSH debug message from remote host: {}", String::from_utf8_lossy(&p.message.0));
            }
            Packet::Disconnect(p) => {
                let desc = String::from_utf8_lossy(&p.desc.0).into_owned();
                info!("Peer disconnected, reason {}: {desc}", p.reason);
                return Ok(Dispatched::Disconnect { reason: p.reason, desc });
            }
            Packet::UserauthRequest(p) => {
                let Role::Server { auth, setup } = &mut self.role else {
                    debug!("Server sent an auth request");
                    return Err(Error::SSHProtoError);
                };
                let sess_id = self.sess_id.as_ref().trap()?;
                if auth.request(p, sess_id, setup.mechanisms.as_mut(), s)? {
                    self.set_authed();
                }
            }
            Packet::UserauthInfoResponse(p) => {
                let Role::Server { auth, .. } = &mut self.role else {
                    debug!("Server sent an info response");
                    return Err(Error::SSHProtoError);
                };
                if auth.info_response(p, s)? {
                    self.set_authed();
                }
            }
            Packet::UserauthFailure(p) => {
                let Role::Client { auth, .. } = &mut self.role else {
                    debug!("Received UserauthFailure as a server");
                    return Err(Error::SSHProtoError);
                };
                auth.failure(&p, &mut self.parse_ctx, s)?;
            }
            Packet::UserauthSuccess(_) => {
                let Role::Client { auth, .. } = &mut self.role else {
                    debug!("Received UserauthSuccess as a server");
                    return Err(Error::SSHProtoError);
                };
                if self.state == ConnState::PreAuth {
                    auth.success(&mut self.parse_ctx)?;
                    self.set_authed();
                } else {
                    debug!("Received UserauthSuccess unrequested")
                }
            }
            Packet::UserauthBanner(b) => {
                if !self.is_client() {
                    debug!("Received banner as a server");
                    return Err(Error::SSHProtoError);
                }
                if self.state == ConnState::PreAuth {
                    let message = String::from_utf8_lossy(&b.message.0).into_owned();
                    self.events.push_back(Event::Banner { message });
                } else {
                    debug!("Ignoring banner after authentication");
                }
            }
            Packet::Userauth60(p) => {
                let Role::Client { auth, .. } = &mut self.role else {
                    debug!("Received userauth60 as a server");
                    return Err(Error::SSHProtoError);
                };
                let sess_id = self.sess_id.as_ref().trap()?;
                auth.auth60(&p, sess_id, &mut self.parse_ctx, s)?;
            }
            Packet::GlobalRequest(_) | Packet::RequestSuccess(_) | Packet::RequestFailure(_) => {
                let fwd: Option<&mut dyn ForwardingHandler> = match &mut self.role {
                    Role::Server { setup, .. } => Some(setup.forwarding.as_mut()),
                    Role::Client { .. } => None,
                };
                self.global.dispatch(packet, fwd, s)?;
            }
            Packet::ChannelOpen(_)
            | Packet::ChannelOpenConfirmation(_)
            | Packet::ChannelOpenFailure(_)
            | Packet::ChannelWindowAdjust(_)
            | Packet::ChannelData(_)
            | Packet::ChannelDataExt(_)
            | Packet::ChannelEof(_)
            | Packet::ChannelClose(_)
            | Packet::ChannelRequest(_)
            | Packet::ChannelSuccess(_)
            | Packet::ChannelFailure(_) => {
                let factory = match &mut self.role {
                    Role::Client { setup, .. } => setup.channels.as_mut(),
                    Role::Server { setup, .. } => setup.channels.as_mut(),
                };
                self.channels.dispatch(packet, factory, &mut self.events, s)?;
            }
        };
        Ok(Dispatched::None)
    }
}

#[cfg(test)]
mod tests {
    use crate::behaviour::{AcceptAnyHostKey, NoMechanisms};
    use crate::conn::*;
    use crate::dusklog::init_test_log;
    use crate::encrypt::KeyState;
    use crate::sign::{KeyType, SignKey};
    use crate::traffic::{Stats, TrafOut};

    fn payload(p: impl Into<Packet>, seq: u32) -> Payload {
        Payload { data: sshwire::ssh_vec(&p.into(), None).unwrap(), seq }
    }

    fn server() -> Conn {
        let keys = vec![SignKey::generate(KeyType::Ed25519).unwrap()];
        Conn::new_server(Config::default(), ServerSetup::new(keys, NoMechanisms)).unwrap()
    }

    #[test]
    fn server_needs_hostkey() {
        let r = Conn::new_server(Config::default(), ServerSetup::new(vec![], NoMechanisms));
        assert!(matches!(r, Err(Error::BadUsage { .. })));
    }

    #[test]
    fn early_packets_rejected() {
        init_test_log();
        let mut c = Conn::new_client(Config::default(), ClientSetup::new("me", AcceptAnyHostKey)).unwrap();
        let mut out = TrafOut::new();
        let mut keys = KeyState::new_cleartext();
        let mut stats = Stats::default();
        let mut s = out.sender(&mut keys, &mut stats);

        // transport packets are fine before kex
        let r = c.handle_payload(&payload(packets::Ignore { data: b"x".as_slice().into() }, 0), "SSH-2.0-x", &mut s);
        assert_eq!(r.unwrap(), Dispatched::None);

        let r = c.handle_payload(&payload(packets::UserauthSuccess {}, 1), "SSH-2.0-x", &mut s);
        assert!(matches!(r, Err(Error::SSHProtoError)));
        let r = c.handle_payload(&payload(packets::ChannelEof { num: 0 }, 2), "SSH-2.0-x", &mut s);
        assert!(matches!(r, Err(Error::SSHProtoError)));
    }

    #[test]
    fn unknown_packet_unimplemented() {
        init_test_log();
        let mut c = server();
        let mut out = TrafOut::new();
        let mut keys = KeyState::new_cleartext();
        let mut stats = Stats::default();
        let mut s = out.sender(&mut keys, &mut stats);
        let p = Payload { data: vec![199, 1, 2, 3], seq: 7 };
        assert_eq!(c.handle_payload(&p, "SSH-2.0-x", &mut s).unwrap(), Dispatched::None);
        assert_eq!(stats.packets_out, 1);
    }

    #[test]
    fn peer_disconnect() {
        init_test_log();
        let mut c = server();
        let mut out = TrafOut::new();
        let mut keys = KeyState::new_cleartext();
        let mut stats = Stats::default();
        let mut s = out.sender(&mut keys, &mut stats);
        let d = packets::Disconnect { reason: 11, desc: "bye".into(), lang: "".into() };
        let r = c.handle_payload(&payload(d, 0), "SSH-2.0-x", &mut s).unwrap();
        assert_eq!(r, Dispatched::Disconnect { reason: 11, desc: "bye".into() });
    }

    #[test]
    fn rekey_needs_first_kex() {
        let mut c = server();
        let mut out = TrafOut::new();
        let mut keys = KeyState::new_cleartext();
        let mut stats = Stats::default();
        let mut s = out.sender(&mut keys, &mut stats);
        assert!(matches!(c.rekey(&mut s), Err(Error::BadUsage { .. })));
        assert!(c.auth_deadline().is_some());
    }
}
