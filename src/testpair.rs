//! A client and server [`Runner`] joined back to back, for testing the
//! whole protocol without sockets.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::time::{Duration, Instant};

use crate::*;
use behaviour::*;
use channel::{ChanData, ChanNum};
use cliauth::ClientAuth;
use completion::Outcome;
use config::Config;
use dusklog::init_test_log;
use event::Event;
use packets::{ChannelOpenType, ChannelReqType, InfoPrompt, PubKey, UserauthInfoRequest};
use runner::Runner;
use sign::{KeyType, SignKey};
use sshnames::*;

pub(crate) struct TestPair {
    pub cli: Runner,
    pub serv: Runner,
}

impl TestPair {
    pub fn new(cli_conf: Config, cli: ClientSetup, serv_conf: Config, serv: ServerSetup) -> Self {
        let cli = Runner::new_client(cli_conf, cli).unwrap();
        let serv = Runner::new_server(serv_conf, serv).unwrap();
        TestPair { cli, serv }
    }

    /// Moves output to the other side's input until neither has anything
    /// to send. Returns the first error, a later call delivers the
    /// resulting DISCONNECT.
    pub fn pump(&mut self) -> Result<()> {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let mut idle = true;
            let n = self.cli.output(&mut buf)?;
            if n > 0 {
                idle = false;
                self.serv.input(&buf[..n])?;
            }
            let n = self.serv.output(&mut buf)?;
            if n > 0 {
                idle = false;
                self.cli.input(&buf[..n])?;
            }
            if idle {
                return Ok(());
            }
        }
    }
}

pub(crate) fn events(r: &mut Runner) -> Vec<Event> {
    core::iter::from_fn(|| r.next_event()).collect()
}

struct PwMech(String);

impl Mechanism for PwMech {
    fn attempt(&mut self, attempt: AuthAttempt) -> MechStep {
        match attempt {
            AuthAttempt::Password { password } if password == self.0 => MechStep::Success,
            _ => MechStep::Failure,
        }
    }
}

struct PubKeyMech(PubKey);

impl Mechanism for PubKeyMech {
    fn attempt(&mut self, attempt: AuthAttempt) -> MechStep {
        match attempt {
            AuthAttempt::PubKey { key, signed } if *key == self.0 => {
                if signed {
                    MechStep::Success
                } else {
                    MechStep::PkOk
                }
            }
            _ => MechStep::Failure,
        }
    }
}

/// Asks for the password as a hidden prompt
struct KbdMech(String);

impl Mechanism for KbdMech {
    fn attempt(&mut self, attempt: AuthAttempt) -> MechStep {
        match attempt {
            AuthAttempt::KbdInteractive { .. } => MechStep::Prompt(UserauthInfoRequest {
                name: "".into(),
                instruction: "".into(),
                lang: "".into(),
                prompts: vec![InfoPrompt { prompt: "Password: ".into(), echo: false }],
            }),
            AuthAttempt::InfoResponse { responses } if responses.len() == 1 && responses[0] == self.0 => {
                MechStep::Success
            }
            _ => MechStep::Failure,
        }
    }
}

struct Mechs {
    required: Vec<&'static str>,
    password: String,
    key: Option<PubKey>,
}

impl Mechs {
    fn password(pw: &str) -> Self {
        Mechs { required: vec![SSH_AUTHMETHOD_PASSWORD], password: pw.into(), key: None }
    }
}

impl MechanismFactory for Mechs {
    fn required_methods(&mut self, _username: &str) -> Vec<String> {
        self.required.iter().map(|m| m.to_string()).collect()
    }

    fn mechanism(&mut self, method: &str, _username: &str) -> Option<Box<dyn Mechanism>> {
        match method {
            SSH_AUTHMETHOD_PASSWORD => Some(Box::new(PwMech(self.password.clone()))),
            SSH_AUTHMETHOD_INTERACTIVE => Some(Box::new(KbdMech(self.password.clone()))),
            SSH_AUTHMETHOD_PUBLICKEY => {
                self.key.clone().map(|k| Box::new(PubKeyMech(k)) as Box<dyn Mechanism>)
            }
            _ => None,
        }
    }
}

/// Session handler with fixed answers for pty-req and shell
struct SessHandler {
    pty: ReqReply,
    shell: ReqReply,
}

impl ChannelHandler for SessHandler {
    fn request(&mut self, _chan: ChanNum, req: &ChannelReqType, _want_reply: bool) -> ReqReply {
        match req {
            ChannelReqType::Pty(_) => self.pty,
            ChannelReqType::Shell => self.shell,
            _ => ReqReply::Failure,
        }
    }
}

struct SessFactory {
    pty: ReqReply,
    shell: ReqReply,
}

impl ChannelFactory for SessFactory {
    fn create(&mut self, ty: &ChannelOpenType, _local: bool) -> Result<Box<dyn ChannelHandler>, ChanFail> {
        match ty {
            ChannelOpenType::Session => Ok(Box::new(SessHandler { pty: self.pty, shell: self.shell })),
            _ => Err(ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED),
        }
    }
}

/// Binds every forward to a fixed port
struct Binder(u32);

impl ForwardingHandler for Binder {
    fn tcpip_forward(&mut self, _address: &str, port: u32) -> Option<u32> {
        Some(if port == 0 { self.0 } else { port })
    }

    fn cancel_tcpip_forward(&mut self, _address: &str, port: u32) -> bool {
        port == self.0
    }
}

fn hostkey() -> SignKey {
    SignKey::generate(KeyType::Ed25519).unwrap()
}

fn serv_setup(mechs: Mechs) -> ServerSetup {
    ServerSetup::new(vec![hostkey()], mechs)
}

fn cli_setup() -> ClientSetup {
    ClientSetup::new("matt", AcceptAnyHostKey)
}

fn password_pair() -> TestPair {
    TestPair::new(Config::default(), cli_setup(), Config::default(), serv_setup(Mechs::password("hunter2")))
}

/// Authenticates a default pair, leaving no events
fn authed(mut p: TestPair) -> TestPair {
    let done = p.cli.add_auth_method(ClientAuth::password("hunter2")).unwrap();
    p.pump().unwrap();
    assert!(done.wait().is_success());
    assert!(p.cli.authenticated());
    assert!(p.serv.authenticated());
    events(&mut p.cli);
    events(&mut p.serv);
    p
}

/// Opens a session from the client, returning the client and server channel numbers
fn session(p: &mut TestPair) -> (ChanNum, ChanNum) {
    let (cchan, done) = p.cli.open_channel(ChannelOpenType::Session).unwrap();
    p.pump().unwrap();
    assert!(done.wait().is_success());
    let schan = events(&mut p.serv)
        .into_iter()
        .find_map(|e| match e {
            Event::ChannelOpened { chan, ty: ChannelOpenType::Session } => Some(chan),
            _ => None,
        })
        .unwrap();
    (cchan, schan)
}

fn read_all(r: &mut Runner, chan: ChanNum) -> Vec<u8> {
    let mut out = Vec::new();
    let mut b = [0u8; 300];
    loop {
        let n = r.channel_read(chan, ChanData::Normal, &mut b).unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&b[..n]);
    }
}

fn disconnect_reason(r: &mut Runner) -> Option<u32> {
    events(r).into_iter().find_map(|e| match e {
        Event::Disconnected { reason, .. } => Some(reason),
        _ => None,
    })
}

#[test]
fn kex_and_password() {
    init_test_log();
    let mut p = password_pair();
    let done = p.cli.add_auth_method(ClientAuth::password("hunter2")).unwrap();
    p.pump().unwrap();

    assert!(done.wait().is_success());
    assert!(p.cli.session_id().is_some());
    assert_eq!(p.cli.session_id(), p.serv.session_id());
    assert!(p.serv.remote_version().unwrap().starts_with("SSH-2.0-dusk_"));
    assert_eq!(p.cli.stats().rekeys, 1);
    assert!(p.cli.next_timeout().is_none());
    assert!(p.serv.next_timeout().is_none());

    for r in [&mut p.cli, &mut p.serv] {
        let n = events(r).iter().filter(|e| matches!(e, Event::Authenticated)).count();
        assert_eq!(n, 1);
    }
}

#[test]
fn host_key_rejected() {
    init_test_log();
    let other = hostkey().pubkey();
    let cli = ClientSetup::new("matt", KnownHostKey(other));
    let mut p = TestPair::new(Config::default(), cli, Config::default(), serv_setup(Mechs::password("x")));
    assert!(matches!(p.pump(), Err(Error::HostKeyRejected)));
    p.pump().unwrap();
    assert!(p.cli.is_closed());
    assert!(p.serv.is_closed());
    assert_eq!(disconnect_reason(&mut p.serv), Some(DisconnectReason::HostKeyNotVerifiable as u32));
}

#[test]
fn known_host_key_accepted() {
    init_test_log();
    let key = hostkey();
    let cli = ClientSetup::new("matt", KnownHostKey(key.pubkey()));
    let serv = ServerSetup::new(vec![key], Mechs::password("hunter2"));
    let p = TestPair::new(Config::default(), cli, Config::default(), serv);
    authed(p);
}

#[test]
fn password_chain() {
    init_test_log();
    let mut p = TestPair::new(Config::default(), cli_setup(), Config::default(), serv_setup(Mechs::password("c")));
    let a = p.cli.add_auth_method(ClientAuth::password("a")).unwrap();
    let b = p.cli.add_auth_method(ClientAuth::password("b")).unwrap();
    let c = p.cli.add_auth_method(ClientAuth::password("c")).unwrap();
    p.pump().unwrap();

    assert!(matches!(a.wait(), Outcome::Failure(Error::AuthFailed)));
    assert!(matches!(b.wait(), Outcome::Failure(Error::AuthFailed)));
    assert!(c.wait().is_success());
    let n = events(&mut p.cli).iter().filter(|e| matches!(e, Event::Authenticated)).count();
    assert_eq!(n, 1);
}

#[test]
fn exhausted_disconnects() {
    init_test_log();
    let mut p = TestPair::new(Config::default(), cli_setup(), Config::default(), serv_setup(Mechs::password("c")));
    let a = p.cli.add_auth_method(ClientAuth::password("a")).unwrap();
    assert!(matches!(p.pump(), Err(Error::AuthExhausted)));
    assert!(matches!(a.wait(), Outcome::Failure(Error::AuthFailed)));
    p.pump().unwrap();
    assert_eq!(disconnect_reason(&mut p.serv), Some(DisconnectReason::NoMoreAuthMethodsAvailable as u32));
}

#[test]
fn pubkey_then_password() {
    init_test_log();
    let user = hostkey();
    let mechs = Mechs {
        required: vec![SSH_AUTHMETHOD_PUBLICKEY, SSH_AUTHMETHOD_PASSWORD],
        password: "hunter2".into(),
        key: Some(user.pubkey()),
    };
    let mut p = TestPair::new(Config::default(), cli_setup(), Config::default(), serv_setup(mechs));
    let k = p.cli.add_auth_method(ClientAuth::PubKey(user)).unwrap();
    p.pump().unwrap();
    // partial success, still waiting for a password
    assert!(k.wait().is_success());
    assert!(!p.cli.authenticated());
    assert!(!p.serv.authenticated());
    assert!(p.cli.next_timeout().is_some());

    let pw = p.cli.add_auth_method(ClientAuth::password("hunter2")).unwrap();
    p.pump().unwrap();
    assert!(pw.wait().is_success());
    assert!(p.cli.authenticated());
    assert!(p.serv.authenticated());
}

#[test]
fn wrong_pubkey() {
    init_test_log();
    let mechs = Mechs { required: vec![SSH_AUTHMETHOD_PUBLICKEY], password: "".into(), key: Some(hostkey().pubkey()) };
    let mut p = TestPair::new(Config::default(), cli_setup(), Config::default(), serv_setup(mechs));
    let k = p.cli.add_auth_method(ClientAuth::PubKey(hostkey())).unwrap();
    assert!(p.pump().is_err());
    assert!(matches!(k.wait(), Outcome::Failure(Error::AuthFailed)));
    assert!(!p.serv.authenticated());
}

#[test]
fn password_as_kbd_interactive() {
    init_test_log();
    let mechs = Mechs { required: vec![SSH_AUTHMETHOD_INTERACTIVE], password: "hunter2".into(), key: None };
    let p = TestPair::new(Config::default(), cli_setup(), Config::default(), serv_setup(mechs));
    authed(p);
}

#[test]
fn banner_before_auth() {
    init_test_log();
    let mut serv = serv_setup(Mechs::password("hunter2"));
    serv.banner = Some("Welcome".into());
    let mut p = TestPair::new(Config::default(), cli_setup(), Config::default(), serv);
    p.cli.add_auth_method(ClientAuth::password("hunter2")).unwrap();
    p.pump().unwrap();
    let ev = events(&mut p.cli);
    assert!(ev.iter().any(|e| matches!(e, Event::Banner { message } if message == "Welcome")));
}

#[test]
fn rekey_keeps_data_order() {
    init_test_log();
    let mut p = authed(password_pair());
    let sess_id = p.cli.session_id().unwrap().to_vec();
    let (cchan, schan) = session(&mut p);

    assert_eq!(p.cli.channel_send(cchan, ChanData::Normal, b"hello").unwrap(), 5);
    p.cli.rekey().unwrap();
    // held until the new keys are in use
    assert_eq!(p.cli.channel_send(cchan, ChanData::Normal, b"world").unwrap(), 5);
    p.pump().unwrap();

    assert_eq!(read_all(&mut p.serv, schan), b"helloworld");
    assert_eq!(p.cli.stats().rekeys, 2);
    assert_eq!(p.serv.stats().rekeys, 2);
    assert_eq!(p.cli.session_id().unwrap(), sess_id.as_slice());
    assert_eq!(p.serv.session_id().unwrap(), sess_id.as_slice());
}

#[test]
fn simultaneous_rekey() {
    init_test_log();
    let mut p = authed(password_pair());
    p.cli.rekey().unwrap();
    p.serv.rekey().unwrap();
    // already running, no effect
    p.cli.rekey().unwrap();
    p.pump().unwrap();
    assert_eq!(p.cli.stats().rekeys, 2);
    assert_eq!(p.serv.stats().rekeys, 2);

    let (cchan, schan) = session(&mut p);
    p.cli.channel_send(cchan, ChanData::Normal, b"after").unwrap();
    p.pump().unwrap();
    assert_eq!(read_all(&mut p.serv, schan), b"after");
}

#[test]
fn auto_rekey() {
    init_test_log();
    let conf = Config { rekey_packets: 30, ..Default::default() };
    let mut p = TestPair::new(conf, cli_setup(), Config::default(), serv_setup(Mechs::password("hunter2")));
    p = authed(p);
    let (cchan, schan) = session(&mut p);

    let mut sent = Vec::new();
    for i in 0..40u8 {
        p.cli.channel_send(cchan, ChanData::Normal, &[i]).unwrap();
        sent.push(i);
        p.pump().unwrap();
    }
    assert!(p.cli.stats().rekeys >= 2);
    assert_eq!(p.cli.stats().rekeys, p.serv.stats().rekeys);
    assert_eq!(read_all(&mut p.serv, schan), sent);
}

#[test]
fn no_auto_rekey_when_disabled() {
    init_test_log();
    let policies = Policies::new().with(Policy::AutoRekey, PolicyValue::Flag(false)).unwrap();
    let conf = Config { rekey_packets: 5, policies, ..Default::default() };
    let mut p = TestPair::new(conf, cli_setup(), Config::default(), serv_setup(Mechs::password("hunter2")));
    p = authed(p);
    let (cchan, _) = session(&mut p);
    for _ in 0..10 {
        p.cli.channel_send(cchan, ChanData::Normal, b"x").unwrap();
        p.pump().unwrap();
    }
    assert_eq!(p.cli.stats().rekeys, 1);
}

/// pty-req then shell, replies must arrive in order
fn pty_shell(pty: ReqReply, shell: ReqReply) -> (Outcome<()>, Outcome<()>) {
    let mut serv = serv_setup(Mechs::password("hunter2"));
    serv.channels = Box::new(SessFactory { pty, shell });
    let mut p = authed(TestPair::new(Config::default(), cli_setup(), Config::default(), serv));
    let (cchan, schan) = session(&mut p);

    let pty_req = packets::PtyReq {
        term: "xterm".into(),
        cols: 80,
        rows: 24,
        width: 0,
        height: 0,
        modes: sshwire::BinString(vec![0]),
    };
    let mut c1 = p.cli.channel_request(cchan, ChannelReqType::Pty(pty_req), true).unwrap();
    let mut c2 = p.cli.channel_request(cchan, ChannelReqType::Shell, true).unwrap();
    p.pump().unwrap();

    let deferred = events(&mut p.serv).into_iter().find_map(|e| match e {
        Event::ChannelRequest { chan, id, req: ChannelReqType::Pty(_), want_reply: true } if chan == schan => Some(id),
        _ => None,
    });
    match deferred {
        Some(id) => {
            // the shell reply waits behind the pty reply
            assert!(c1.try_take().is_none());
            assert!(c2.try_take().is_none());
            p.serv.channel_reply(schan, id, true).unwrap();
            p.pump().unwrap();
        }
        None => assert_ne!(pty, ReqReply::Deferred),
    }
    (c1.wait(), c2.wait())
}

#[test]
fn request_replies_in_order() {
    init_test_log();
    let (a, b) = pty_shell(ReqReply::Success, ReqReply::Failure);
    assert!(a.is_success());
    assert!(matches!(b, Outcome::Failure(Error::RequestFailed)));
}

#[test]
fn shell_after_refused_pty() {
    init_test_log();
    let (a, b) = pty_shell(ReqReply::Failure, ReqReply::Success);
    assert!(matches!(a, Outcome::Failure(Error::RequestFailed)));
    assert!(b.is_success());
}

#[test]
fn deferred_reply_holds_later_replies() {
    init_test_log();
    let (a, b) = pty_shell(ReqReply::Deferred, ReqReply::Success);
    assert!(a.is_success());
    assert!(b.is_success());
}

#[test]
fn close_from_either_side() {
    init_test_log();
    let mut p = authed(password_pair());

    let (cchan, schan) = session(&mut p);
    p.cli.channel_close(cchan).unwrap();
    p.pump().unwrap();
    for (r, chan) in [(&mut p.cli, cchan), (&mut p.serv, schan)] {
        let n = events(r).iter().filter(|e| matches!(e, Event::ChannelClosed { chan: c } if *c == chan)).count();
        assert_eq!(n, 1);
        assert!(matches!(r.channel_state(chan), Err(Error::BadChannel { .. })));
    }

    let (cchan, schan) = session(&mut p);
    p.serv.channel_close(schan).unwrap();
    p.pump().unwrap();
    for (r, chan) in [(&mut p.cli, cchan), (&mut p.serv, schan)] {
        let n = events(r).iter().filter(|e| matches!(e, Event::ChannelClosed { chan: c } if *c == chan)).count();
        assert_eq!(n, 1);
        assert!(r.channel_state(chan).is_err());
    }
}

#[test]
fn window_is_respected() {
    init_test_log();
    let serv_conf = Config { window: 1000, max_packet: 500, window_low_water: 500, ..Default::default() };
    let p = TestPair::new(Config::default(), cli_setup(), serv_conf, serv_setup(Mechs::password("hunter2")));
    let mut p = authed(p);
    let (cchan, schan) = session(&mut p);

    let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
    let mut sent = 0;
    let mut got = Vec::new();
    for _ in 0..100 {
        if got.len() == data.len() {
            break;
        }
        sent += p.cli.channel_send(cchan, ChanData::Normal, &data[sent..]).unwrap();
        let space = p.cli.channel_send_space(cchan).unwrap();
        assert!(space <= 500);
        assert!(space + (sent - got.len()) <= 1000);

        p.pump().unwrap();
        got.extend(read_all(&mut p.serv, schan));
        p.pump().unwrap();
        let space = p.cli.channel_send_space(cchan).unwrap();
        assert!(space + (sent - got.len()) <= 1000);
    }
    assert_eq!(got, data);
}

#[test]
fn strict_kex_rejects_early_packet() {
    init_test_log();
    let mut p = password_pair();
    let injected = inject_ignore(&mut p);
    assert!(matches!(p.cli.input(&injected), Err(Error::SSHProtoError)));
    assert!(p.cli.is_closed());
}

#[test]
fn early_ignore_without_strict_kex() {
    init_test_log();
    let policies = Policies::new().with(Policy::StrictKex, PolicyValue::Flag(false)).unwrap();
    let conf = Config { policies, ..Default::default() };
    let mut p = TestPair::new(conf, cli_setup(), Config::default(), serv_setup(Mechs::password("hunter2")));
    let injected = inject_ignore(&mut p);
    p.cli.input(&injected).unwrap();
    authed(p);
}

/// The server's first output with an IGNORE packet before its KEXINIT.
/// The server's send sequence counts the extra packet.
fn inject_ignore(p: &mut TestPair) -> Vec<u8> {
    use encrypt::KeyState;
    use traffic::{Stats, TrafOut};

    let mut buf = vec![0u8; 16 * 1024];
    let n = p.cli.output(&mut buf).unwrap();
    p.serv.input(&buf[..n]).unwrap();
    let n = p.serv.output(&mut buf).unwrap();
    let sout = &buf[..n];
    let line = sout.iter().position(|&b| b == b'\n').unwrap() + 1;

    let mut out = TrafOut::new();
    let mut keys = KeyState::new_cleartext();
    let mut stats = Stats::default();
    out.sender(&mut keys, &mut stats).send(packets::Ignore { data: sshwire::BinString(b"x".to_vec()) }).unwrap();
    let mut ign = vec![0u8; 1024];
    let m = out.output(&mut ign);
    p.serv.keys_mut().skip_seq_enc();

    let mut injected = sout[..line].to_vec();
    injected.extend_from_slice(&ign[..m]);
    injected.extend_from_slice(&sout[line..]);
    injected
}

#[test]
fn auth_idle_timeout() {
    init_test_log();
    let mut p = password_pair();
    p.pump().unwrap();
    // no methods queued, the client waits for the application
    let deadline = p.cli.next_timeout().unwrap();
    assert!(p.serv.next_timeout().is_some());
    p.cli.handle_timeouts(Instant::now()).unwrap();

    let r = p.cli.handle_timeouts(deadline + Duration::from_secs(1));
    assert!(matches!(r, Err(Error::AuthTimeout)));
    p.pump().unwrap();
    assert_eq!(disconnect_reason(&mut p.serv), Some(DisconnectReason::ByApplication as u32));
}

#[test]
fn server_auth_timeout() {
    init_test_log();
    let mut p = password_pair();
    p.pump().unwrap();
    let deadline = p.serv.next_timeout().unwrap();
    assert!(p.serv.handle_timeouts(deadline + Duration::from_secs(1)).is_err());
    p.pump().unwrap();
    assert!(p.cli.is_closed());
    assert_eq!(disconnect_reason(&mut p.cli), Some(DisconnectReason::ByApplication as u32));
}

#[test]
fn too_many_attempts() {
    init_test_log();
    let serv_conf = Config { max_auth_attempts: 2, ..Default::default() };
    let mut p = TestPair::new(Config::default(), cli_setup(), serv_conf, serv_setup(Mechs::password("c")));
    let a = p.cli.add_auth_method(ClientAuth::password("a")).unwrap();
    let b = p.cli.add_auth_method(ClientAuth::password("b")).unwrap();
    let c = p.cli.add_auth_method(ClientAuth::password("c")).unwrap();

    assert!(matches!(p.pump(), Err(Error::TooManyAuthAttempts)));
    p.pump().unwrap();
    assert!(p.cli.is_closed());
    assert_eq!(disconnect_reason(&mut p.cli), Some(DisconnectReason::NoMoreAuthMethodsAvailable as u32));
    assert!(matches!(a.wait(), Outcome::Failure(Error::AuthFailed)));
    assert!(matches!(b.wait(), Outcome::Failure(Error::Disconnected)));
    assert!(matches!(c.wait(), Outcome::Failure(Error::Disconnected)));
}

#[test]
fn remote_forward() {
    init_test_log();
    let mut serv = serv_setup(Mechs::password("hunter2"));
    serv.forwarding = Box::new(Binder(4321));
    let mut p = authed(TestPair::new(Config::default(), cli_setup(), Config::default(), serv));

    let bound = p.cli.tcpip_forward("localhost", 0).unwrap();
    let fixed = p.cli.tcpip_forward("localhost", 2222).unwrap();
    p.pump().unwrap();
    assert!(matches!(bound.wait(), Outcome::Success(4321)));
    assert!(matches!(fixed.wait(), Outcome::Success(2222)));

    let ok = p.cli.cancel_tcpip_forward("localhost", 4321).unwrap();
    let bad = p.cli.cancel_tcpip_forward("localhost", 9999).unwrap();
    p.pump().unwrap();
    assert!(ok.wait().is_success());
    assert!(matches!(bad.wait(), Outcome::Failure(Error::RequestFailed)));

    assert!(matches!(p.serv.tcpip_forward("localhost", 0), Err(Error::BadUsage { .. })));
}

#[test]
fn forward_refused_by_default() {
    init_test_log();
    let mut p = authed(password_pair());
    let f = p.cli.tcpip_forward("localhost", 0).unwrap();
    p.pump().unwrap();
    assert!(matches!(f.wait(), Outcome::Failure(Error::RequestFailed)));
    assert!(!p.cli.is_closed());
}

#[test]
fn exit_status_reaches_client() {
    init_test_log();
    let mut p = authed(password_pair());
    let (cchan, schan) = session(&mut p);
    let req = ChannelReqType::ExitStatus(packets::ExitStatus { status: 3 });
    p.serv.channel_request(schan, req, false).unwrap();
    p.serv.channel_eof(schan).unwrap();
    p.pump().unwrap();

    let ev = events(&mut p.cli);
    assert!(ev.iter().any(|e| matches!(e, Event::ExitStatus { chan, status: 3 } if *chan == cchan)));
    assert!(ev.iter().any(|e| matches!(e, Event::ChannelEof { chan } if *chan == cchan)));
    let mut b = [0u8; 10];
    assert!(matches!(p.cli.channel_read(cchan, ChanData::Normal, &mut b), Err(Error::ChannelEOF)));
}

#[test]
fn server_stderr() {
    init_test_log();
    let mut p = authed(password_pair());
    let (cchan, schan) = session(&mut p);
    assert_eq!(p.serv.channel_send(schan, ChanData::Stderr, b"oops").unwrap(), 4);
    p.pump().unwrap();
    assert_eq!(p.cli.channel_readable(cchan, ChanData::Stderr).unwrap(), 4);
    assert_eq!(p.cli.channel_readable(cchan, ChanData::Normal).unwrap(), 0);
    let mut b = [0u8; 10];
    assert_eq!(p.cli.channel_read(cchan, ChanData::Stderr, &mut b).unwrap(), 4);
    assert_eq!(&b[..4], b"oops");
    assert_eq!(p.cli.channel_readable(cchan, ChanData::Stderr).unwrap(), 0);
    assert!(p.cli.channel_send(cchan, ChanData::Stderr, b"no").is_err());
}

#[test]
fn client_refuses_server_channel() {
    init_test_log();
    let mut p = authed(password_pair());
    let (_, done) = p.serv.open_channel(ChannelOpenType::Session).unwrap();
    p.pump().unwrap();
    match done.wait() {
        Outcome::Failure(Error::ChannelOpenFailed { reason, .. }) => {
            assert_eq!(reason, ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED)
        }
        o => panic!("unexpected {o:?}"),
    }
    assert!(!p.cli.is_closed());
}

#[test]
fn disconnect_fails_outstanding() {
    init_test_log();
    let mut p = authed(password_pair());
    let (cchan, _) = session(&mut p);
    let req = p.cli.channel_request(cchan, ChannelReqType::Shell, true).unwrap();
    p.serv.disconnect(DisconnectReason::ByApplication, "bye");
    p.pump().unwrap();
    assert!(p.cli.is_closed());
    assert!(matches!(req.wait(), Outcome::Failure(_)));
    let ev = events(&mut p.cli);
    assert!(ev.iter().any(|e| matches!(e, Event::Disconnected { reason: 11, desc } if desc == "bye")));
}

#[test]
fn algorithm_combinations() {
    use namelist::LocalNames;
    init_test_log();

    let mut combos = vec![
        (SSH_NAME_CURVE25519, SSH_NAME_CHAPOLY, SSH_NAME_HMAC_SHA256),
        (SSH_NAME_CURVE25519_LIBSSH, SSH_NAME_AES256_CTR, SSH_NAME_HMAC_SHA256),
        (SSH_NAME_CURVE25519, SSH_NAME_AES128_CTR, SSH_NAME_HMAC_SHA512),
    ];
    #[cfg(feature = "rsa")]
    combos.push((SSH_NAME_DH_GROUP14_SHA256, SSH_NAME_AES256_CTR, SSH_NAME_HMAC_SHA512));

    for (kex, cipher, mac) in combos {
        debug!("Testing {kex} {cipher} {mac}");
        let mut conf = Config::default();
        conf.algos.kexs = LocalNames::try_from([kex].as_slice()).unwrap();
        conf.algos.ciphers = LocalNames::try_from([cipher].as_slice()).unwrap();
        conf.algos.macs = LocalNames::try_from([mac].as_slice()).unwrap();
        let p = TestPair::new(conf, cli_setup(), Config::default(), serv_setup(Mechs::password("hunter2")));
        let mut p = authed(p);
        let (cchan, schan) = session(&mut p);
        let data = vec![0x5a; 3000];
        assert_eq!(p.cli.channel_send(cchan, ChanData::Normal, &data).unwrap(), 3000);
        p.cli.rekey().unwrap();
        p.pump().unwrap();
        assert_eq!(read_all(&mut p.serv, schan), data);
        assert_eq!(p.serv.stats().rekeys, 2);
    }
}
