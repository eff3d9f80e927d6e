//! Client side user authentication, RFC4252 and RFC4256

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;
use std::collections::VecDeque;
use std::time::Instant;

use zeroize::Zeroizing;

use crate::*;
use auth::{AuthSigMsg, AuthType};
use completion::{Completer, Completion};
use config::{Policies, Policy};
use kex::SessId;
use packets::{AuthMethod, MethodKbdInteractive, MethodPassword, ParseContext};
use packets::{ServiceAccept, Userauth60, UserauthFailure, UserauthInfoRequest};
use packets::{UserauthInfoResponse, UserauthPkOk, UserauthRequest};
use sign::SignKey;
use sshnames::*;
use sshwire::Blob;
use traffic::TrafSend;

/// Answers keyboard-interactive prompts
pub trait KbdResponder: Send {
    /// One response per prompt. `None` abandons the method.
    fn respond(&mut self, req: &UserauthInfoRequest) -> Option<Vec<String>>;
}

/// An authentication method for [`Runner::add_auth_method()`](crate::Runner::add_auth_method)
pub enum ClientAuth {
    Password(Zeroizing<String>),
    PubKey(SignKey),
    KbdInteractive(Box<dyn KbdResponder>),
}

impl ClientAuth {
    pub fn password(p: impl Into<String>) -> Self {
        Self::Password(Zeroizing::new(p.into()))
    }
}

impl fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password"),
            Self::PubKey(k) => f.debug_tuple("PubKey").field(k).finish(),
            Self::KbdInteractive(_) => f.write_str("KbdInteractive"),
        }
    }
}

/// Answers hidden prompts with a password, for servers that only offer
/// keyboard-interactive
struct PasswordResponder(Zeroizing<String>);

impl KbdResponder for PasswordResponder {
    fn respond(&mut self, req: &UserauthInfoRequest) -> Option<Vec<String>> {
        Some(req.prompts.iter().map(|p| if p.echo { String::new() } else { self.0.to_string() }).collect())
    }
}

/// The method on the wire
enum Attempt {
    Password,
    /// Unsigned request, waiting for PK_OK
    PubKeyProbe(SignKey),
    PubKeySigned,
    KbdInteractive(Box<dyn KbdResponder>),
}

struct Current {
    attempt: Attempt,
    done: Completer<()>,
}

enum AuthState {
    Unstarted,
    ServiceRequested,
    /// The "none" request is outstanding
    Probing,
    InProgress(Current),
    /// Waiting for more methods from the application
    Idle { since: Instant },
    Success,
}

pub(crate) struct CliAuth {
    state: AuthState,
    username: String,
    queue: VecDeque<(ClientAuth, Completer<()>)>,
    /// From the most recent USERAUTH_FAILURE
    server_methods: Vec<String>,
    prefer_kbd: bool,
}

impl CliAuth {
    pub fn new(username: &str, policies: &Policies) -> Result<Self> {
        if username.len() > config::MAX_USERNAME {
            return Err(Error::bad_usage("Username too long"));
        }
        Ok(CliAuth {
            state: AuthState::Unstarted,
            username: username.into(),
            queue: VecDeque::new(),
            server_methods: Vec::new(),
            prefer_kbd: policies.flag(Policy::PreferKeyboardInteractive),
        })
    }

    /// After the first key exchange
    pub fn start(&mut self, s: &mut TrafSend) -> Result<()> {
        if let AuthState::Unstarted = self.state {
            s.send(packets::ServiceRequest { name: SSH_SERVICE_USERAUTH.into() })?;
            self.state = AuthState::ServiceRequested;
        }
        Ok(())
    }

    pub fn is_success(&self) -> bool {
        matches!(self.state, AuthState::Success)
    }

    pub fn service_accept(&mut self, p: &ServiceAccept, s: &mut TrafSend) -> Result<()> {
        if !matches!(self.state, AuthState::ServiceRequested) || p.name != SSH_SERVICE_USERAUTH {
            debug!("Unexpected service accept {:?}", p.name);
            return Err(Error::SSHProtoError);
        }
        // discover what the server allows
        s.send(self.request(AuthMethod::None))?;
        self.state = AuthState::Probing;
        Ok(())
    }

    fn request(&self, method: AuthMethod) -> UserauthRequest {
        UserauthRequest {
            username: self.username.as_str().into(),
            service: SSH_SERVICE_CONNECTION.into(),
            method,
        }
    }

    /// Queues a method, which starts immediately if nothing is in progress
    pub fn add(&mut self, method: ClientAuth, ctx: &mut ParseContext, s: &mut TrafSend) -> Result<Completion<()>> {
        if self.is_success() {
            return Err(Error::bad_usage("Already authenticated"));
        }
        let (done, completion) = completion::pair();
        self.queue.push_back((method, done));
        if let AuthState::Idle { .. } = self.state {
            self.next(ctx, s, false)?;
        }
        Ok(completion)
    }

    /// When authentication has stalled waiting for the application
    pub fn idle_since(&self) -> Option<Instant> {
        match self.state {
            AuthState::Idle { since } => Some(since),
            _ => None,
        }
    }

    fn server_has(&self, method: &str) -> bool {
        self.server_methods.iter().any(|m| m == method)
    }

    /// Starts the next queued method the server accepts.
    ///
    /// With an empty queue after a real failure, authentication is exhausted.
    fn next(&mut self, ctx: &mut ParseContext, s: &mut TrafSend, after_failure: bool) -> Result<()> {
        ctx.cli_auth_type = None;
        while let Some((method, done)) = self.queue.pop_front() {
            if done.is_cancelled() {
                trace!("Skipping cancelled {method:?}");
                continue;
            }
            let (req, attempt, ty) = match method {
                ClientAuth::Password(pw) => {
                    let kbd = self.server_has(SSH_AUTHMETHOD_INTERACTIVE);
                    if kbd && (self.prefer_kbd || !self.server_has(SSH_AUTHMETHOD_PASSWORD)) {
                        debug!("Password as keyboard-interactive");
                        let m = AuthMethod::KbdInteractive(MethodKbdInteractive { lang: "".into(), submethods: "".into() });
                        let resp: Box<dyn KbdResponder> = Box::new(PasswordResponder(pw));
                        (m, Attempt::KbdInteractive(resp), AuthType::KbdInteractive)
                    } else if self.server_has(SSH_AUTHMETHOD_PASSWORD) {
                        let m = AuthMethod::Password(MethodPassword { password: pw.as_str().into(), new: None });
                        (m, Attempt::Password, AuthType::Password)
                    } else {
                        done.fail(Error::AuthMethodUnavailable);
                        continue;
                    }
                }
                ClientAuth::PubKey(key) => {
                    if !self.server_has(SSH_AUTHMETHOD_PUBLICKEY) {
                        done.fail(Error::AuthMethodUnavailable);
                        continue;
                    }
                    let m = match AuthMethod::try_from(key.pubkey()) {
                        Ok(m) => m,
                        Err(e) => {
                            done.fail(e);
                            continue;
                        }
                    };
                    (m, Attempt::PubKeyProbe(key), AuthType::PubKey)
                }
                ClientAuth::KbdInteractive(resp) => {
                    if !self.server_has(SSH_AUTHMETHOD_INTERACTIVE) {
                        done.fail(Error::AuthMethodUnavailable);
                        continue;
                    }
                    let m = AuthMethod::KbdInteractive(MethodKbdInteractive { lang: "".into(), submethods: "".into() });
                    (m, Attempt::KbdInteractive(resp), AuthType::KbdInteractive)
                }
            };
            debug!("Trying auth {}", req.name());
            s.send(self.request(req))?;
            ctx.cli_auth_type = Some(ty);
            self.state = AuthState::InProgress(Current { attempt, done });
            return Ok(());
        }

        if after_failure {
            info!("No authentication methods left");
            return Err(Error::AuthExhausted);
        }
        self.state = AuthState::Idle { since: Instant::now() };
        Ok(())
    }

    /// USERAUTH_FAILURE, which also lists the server's methods
    pub fn failure(&mut self, p: &UserauthFailure, ctx: &mut ParseContext, s: &mut TrafSend) -> Result<()> {
        self.server_methods = p.methods.iter().map(|m| m.to_string()).collect();
        debug!("Server auth methods {:?}, partial {}", self.server_methods, p.partial);

        let state = core::mem::replace(&mut self.state, AuthState::Idle { since: Instant::now() });
        let after_failure = match state {
            AuthState::InProgress(cur) => {
                if p.partial {
                    cur.done.success(());
                    false
                } else {
                    cur.done.fail(Error::AuthFailed);
                    true
                }
            }
            AuthState::Probing => false,
            _ => {
                debug!("Unexpected userauth failure");
                return Err(Error::SSHProtoError);
            }
        };
        self.next(ctx, s, after_failure)
    }

    /// USERAUTH_SUCCESS
    pub fn success(&mut self, ctx: &mut ParseContext) -> Result<()> {
        ctx.cli_auth_type = None;
        match core::mem::replace(&mut self.state, AuthState::Success) {
            AuthState::InProgress(cur) => cur.done.success(()),
            AuthState::Probing => debug!("Server needs no authentication"),
            _ => return Err(Error::SSHProtoError),
        }
        // queued methods are cancelled by dropping their completers
        self.queue.clear();
        Ok(())
    }

    pub fn auth60(&mut self, p: &Userauth60, sess_id: &SessId, ctx: &mut ParseContext, s: &mut TrafSend) -> Result<()> {
        match p {
            Userauth60::PkOk(pkok) => self.pkok(pkok, sess_id, ctx, s),
            Userauth60::PwChangeReq(_) => {
                // password changes aren't supported, try something else
                debug!("Server requested a password change");
                match core::mem::replace(&mut self.state, AuthState::Idle { since: Instant::now() }) {
                    AuthState::InProgress(cur) => cur.done.fail(Error::AuthFailed),
                    _ => return Err(Error::SSHProtoError),
                }
                self.next(ctx, s, true)
            }
            Userauth60::InfoRequest(req) => self.info_request(req, ctx, s),
        }
    }

    fn pkok(&mut self, pkok: &UserauthPkOk, sess_id: &SessId, ctx: &mut ParseContext, s: &mut TrafSend) -> Result<()> {
        let AuthState::InProgress(cur) = &self.state else {
            return Err(Error::SSHProtoError);
        };
        let Attempt::PubKeyProbe(key) = &cur.attempt else {
            trace!("Unexpected PK_OK");
            return Err(Error::SSHProtoError);
        };
        if key.pubkey() != pkok.key.0 {
            trace!("Received PK_OK for a different key");
            return Err(Error::SSHProtoError);
        }

        let mut req = self.request(AuthMethod::try_from(key.pubkey())?);
        let msg = AuthSigMsg::new(&req, sess_id);
        let sig = key.sign(&msg, Some(&AuthSigMsg::parse_ctx()))?;
        if let AuthMethod::PubKey(m) = &mut req.method {
            m.sig = Some(Blob((&sig).into()));
        }
        s.send(req)?;
        if let AuthState::InProgress(cur) = &mut self.state {
            cur.attempt = Attempt::PubKeySigned;
        }
        ctx.cli_auth_type = None;
        Ok(())
    }

    fn info_request(&mut self, req: &UserauthInfoRequest, ctx: &mut ParseContext, s: &mut TrafSend) -> Result<()> {
        let AuthState::InProgress(Current { attempt: Attempt::KbdInteractive(resp), .. }) = &mut self.state else {
            return Err(Error::SSHProtoError);
        };
        trace!("Info request with {} prompts", req.prompts.len());
        match resp.respond(req) {
            Some(r) if r.len() == req.prompts.len() => {
                let responses = r.into_iter().map(|r| Zeroizing::new(r).as_str().into()).collect();
                s.send(UserauthInfoResponse { responses })?;
                Ok(())
            }
            r => {
                if r.is_some() {
                    warn!("Wrong number of keyboard-interactive responses");
                }
                if let AuthState::InProgress(cur) = core::mem::replace(&mut self.state, AuthState::Idle { since: Instant::now() }) {
                    cur.done.fail(Error::AuthFailed);
                }
                self.next(ctx, s, true)
            }
        }
    }

    /// The connection has ended
    pub fn disconnected(&mut self) {
        if let AuthState::InProgress(cur) = core::mem::replace(&mut self.state, AuthState::Unstarted) {
            cur.done.fail(Error::Disconnected);
        }
        for (_, done) in self.queue.drain(..) {
            done.fail(Error::Disconnected);
        }
    }
}
