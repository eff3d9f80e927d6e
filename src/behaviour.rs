//! Application collaborators consulted by the engine.
//!
//! Clients supply a [`ClientSetup`], servers a [`ServerSetup`]. Each holds
//! boxed trait objects, so the [`Runner`](crate::Runner) can be moved to
//! another thread or task.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::*;
use channel::ChanNum;
use packets::{ChannelOpenType, ChannelReqType, PubKey, UserauthInfoRequest};
use sign::SignKey;
use sshnames::*;

/// Decides whether to trust a server's host key
pub trait HostKeyVerifier: Send {
    /// Return `true` to accept. The exchange signature has already been
    /// checked against `key` before this is called.
    fn verify(&mut self, key: &PubKey) -> bool;
}

/// Accepts any host key.
///
/// Only for tests or when the transport is otherwise authenticated.
#[derive(Debug, Default)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&mut self, key: &PubKey) -> bool {
        warn!("Accepting unverified host key {:?}", key.algorithm_name());
        true
    }
}

/// Accepts a single expected key
#[derive(Debug, Clone)]
pub struct KnownHostKey(pub PubKey);

impl HostKeyVerifier for KnownHostKey {
    fn verify(&mut self, key: &PubKey) -> bool {
        *key == self.0
    }
}

/// One step of a user authentication request, as passed to a [`Mechanism`]
#[derive(Debug)]
pub enum AuthAttempt<'a> {
    /// The "none" method
    None,
    Password { password: &'a str },
    /// `signed` is set once the engine has verified the request's
    /// signature. Unsigned requests are probes for [`MechStep::PkOk`].
    PubKey { key: &'a PubKey, signed: bool },
    /// Start of keyboard-interactive
    KbdInteractive { submethods: &'a str },
    /// Answers to a previous [`MechStep::Prompt`]
    InfoResponse { responses: &'a [String] },
}

/// A mechanism's answer to an [`AuthAttempt`]
#[derive(Debug)]
pub enum MechStep {
    /// The method is complete for this user
    Success,
    Failure,
    /// The key would be acceptable, the client should send a signed request
    PkOk,
    /// Ask keyboard-interactive questions
    Prompt(UserauthInfoRequest),
}

/// Server side verification of one authentication method for one user
pub trait Mechanism: Send {
    fn attempt(&mut self, attempt: AuthAttempt) -> MechStep;
}

/// Creates [`Mechanism`]s for the server by method name
pub trait MechanismFactory: Send {
    /// Methods that must all succeed before a user is authenticated.
    ///
    /// An empty list allows the "none" method.
    fn required_methods(&mut self, username: &str) -> Vec<String>;

    /// Returns `None` if `method` isn't supported
    fn mechanism(&mut self, method: &str, username: &str) -> Option<Box<dyn Mechanism>>;
}

/// Refuses every user
#[derive(Debug, Default)]
pub struct NoMechanisms;

impl MechanismFactory for NoMechanisms {
    fn required_methods(&mut self, _username: &str) -> Vec<String> {
        vec![SSH_AUTHMETHOD_PUBLICKEY.to_string()]
    }

    fn mechanism(&mut self, _method: &str, _username: &str) -> Option<Box<dyn Mechanism>> {
        None
    }
}

/// A handler's answer to an incoming channel request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReqReply {
    Success,
    Failure,
    /// The application will answer with
    /// [`Runner::channel_reply()`](crate::Runner::channel_reply) after
    /// receiving [`Event::ChannelRequest`](crate::Event::ChannelRequest).
    Deferred,
}

/// Behaviour specific to a kind of channel.
///
/// Channel data itself is buffered by the engine and read with
/// [`Runner::channel_read()`](crate::Runner::channel_read), these hooks
/// are notifications.
pub trait ChannelHandler: Send {
    #[allow(unused)]
    fn opened(&mut self, chan: ChanNum) {}

    /// An incoming request. Requests without `want_reply` ignore
    /// the return value other than `Deferred`, which still emits an event.
    #[allow(unused)]
    fn request(&mut self, chan: ChanNum, req: &ChannelReqType, want_reply: bool) -> ReqReply {
        ReqReply::Deferred
    }

    #[allow(unused)]
    fn data(&mut self, chan: ChanNum, ext: bool, len: usize) {}

    #[allow(unused)]
    fn eof(&mut self, chan: ChanNum) {}

    #[allow(unused)]
    fn closed(&mut self, chan: ChanNum) {}
}

/// A handler that leaves every request to the application's event loop
#[derive(Debug, Default)]
pub struct EventHandler;

impl ChannelHandler for EventHandler {}

/// Creates handlers for new channels
pub trait ChannelFactory: Send {
    /// `local` is true for channels we opened. An `Err` refuses a
    /// channel the peer opened.
    fn create(&mut self, ty: &ChannelOpenType, local: bool) -> Result<Box<dyn ChannelHandler>, ChanFail>;
}

/// Accepts `kinds` from the peer, and any channel opened locally.
#[derive(Debug, Clone)]
pub struct DefaultChannels {
    pub sessions: bool,
    pub forwarded: bool,
    pub direct: bool,
}

impl DefaultChannels {
    /// Servers accept sessions
    pub fn server() -> Self {
        Self { sessions: true, forwarded: false, direct: false }
    }

    /// Clients refuse everything from the server
    pub fn client() -> Self {
        Self { sessions: false, forwarded: false, direct: false }
    }
}

impl ChannelFactory for DefaultChannels {
    fn create(&mut self, ty: &ChannelOpenType, local: bool) -> Result<Box<dyn ChannelHandler>, ChanFail> {
        let allow = match ty {
            _ if local => true,
            ChannelOpenType::Session => self.sessions,
            ChannelOpenType::ForwardedTcpip(_) => self.forwarded,
            ChannelOpenType::DirectTcpip(_) => self.direct,
            ChannelOpenType::AuthAgent => false,
            ChannelOpenType::Unknown(_) => return Err(ChanFail::SSH_OPEN_UNKNOWN_CHANNEL_TYPE),
        };
        if allow {
            Ok(Box::new(EventHandler))
        } else {
            Err(ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED)
        }
    }
}

/// Server side remote port forwarding, RFC4254 section 7.1
pub trait ForwardingHandler: Send {
    /// Returns the bound port, which is relevant when `port` is 0.
    /// `None` refuses.
    fn tcpip_forward(&mut self, address: &str, port: u32) -> Option<u32>;

    fn cancel_tcpip_forward(&mut self, address: &str, port: u32) -> bool;
}

/// Refuses all forwarding requests
#[derive(Debug, Default)]
pub struct NoForwarding;

impl ForwardingHandler for NoForwarding {
    fn tcpip_forward(&mut self, address: &str, port: u32) -> Option<u32> {
        debug!("Refusing forward for {address}:{port}");
        None
    }

    fn cancel_tcpip_forward(&mut self, _address: &str, _port: u32) -> bool {
        false
    }
}

/// Client collaborators
pub struct ClientSetup {
    /// Used for authentication
    pub username: String,
    pub verifier: Box<dyn HostKeyVerifier>,
    pub channels: Box<dyn ChannelFactory>,
}

impl ClientSetup {
    pub fn new(username: impl Into<String>, verifier: impl HostKeyVerifier + 'static) -> Self {
        Self { username: username.into(), verifier: Box::new(verifier), channels: Box::new(DefaultChannels::client()) }
    }
}

/// Server collaborators
pub struct ServerSetup {
    /// At least one key is required
    pub hostkeys: Vec<SignKey>,
    pub mechanisms: Box<dyn MechanismFactory>,
    pub channels: Box<dyn ChannelFactory>,
    pub forwarding: Box<dyn ForwardingHandler>,
    /// Sent before authentication completes
    pub banner: Option<String>,
}

impl ServerSetup {
    pub fn new(hostkeys: Vec<SignKey>, mechanisms: impl MechanismFactory + 'static) -> Self {
        Self {
            hostkeys,
            mechanisms: Box::new(mechanisms),
            channels: Box::new(DefaultChannels::server()),
            forwarding: Box::new(NoForwarding),
            banner: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::behaviour::*;
    use crate::packets::ForwardedTcpip;
    use crate::sign::KeyType;

    #[test]
    fn default_channel_policy() {
        let mut s = DefaultChannels::server();
        assert!(s.create(&ChannelOpenType::Session, false).is_ok());
        let fwd = ChannelOpenType::ForwardedTcpip(ForwardedTcpip {
            address: "localhost".into(),
            port: 22,
            origin: "1.2.3.4".into(),
            origin_port: 4000,
        });
        assert_eq!(s.create(&fwd, false).err(), Some(ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED));
        let unk = ChannelOpenType::Unknown(b"x11".as_slice().into());
        assert_eq!(s.create(&unk, false).err(), Some(ChanFail::SSH_OPEN_UNKNOWN_CHANNEL_TYPE));

        let mut c = DefaultChannels::client();
        assert!(c.create(&ChannelOpenType::Session, false).is_err());
        assert!(c.create(&ChannelOpenType::Session, true).is_ok());
    }

    #[test]
    fn known_host_key() {
        let k = SignKey::generate(KeyType::Ed25519).unwrap();
        let other = SignKey::generate(KeyType::Ed25519).unwrap();
        let mut v = KnownHostKey(k.pubkey());
        assert!(v.verify(&k.pubkey()));
        assert!(!v.verify(&other.pubkey()));
    }
}
