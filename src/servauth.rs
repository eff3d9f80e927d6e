//! Server side user authentication, RFC4252 and RFC4256

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::time::{Duration, Instant};

use crate::*;
use behaviour::{AuthAttempt, MechStep, Mechanism, MechanismFactory};
use config::{Config, RecomputeMode};
use kex::SessId;
use namelist::NameList;
use packets::{AuthMethod, ServiceRequest, Userauth60, UserauthInfoResponse, UserauthPkOk};
use packets::{UserauthRequest, UserauthBanner};
use sshnames::*;
use traffic::TrafSend;

/// What to reply to a request
enum Reply {
    /// The method completed
    Success,
    Failure,
    /// A response was already sent, more messages will follow
    Continue,
    /// The "none" probe, which doesn't count as an attempt
    NoneProbe,
}

/// A keyboard-interactive exchange in progress
struct Active {
    method: String,
    mech: Box<dyn Mechanism>,
}

pub(crate) struct ServAuth {
    authed: bool,
    service_accepted: bool,

    username: Option<String>,
    /// Methods that must all complete, once computed
    required: Option<Vec<String>>,
    completed: Vec<String>,
    active: Option<Active>,

    failures: u32,
    max_attempts: u32,
    recompute: RecomputeMode,

    last_activity: Instant,
    idle_timeout: Duration,
}

impl ServAuth {
    pub fn new(conf: &Config) -> Self {
        Self {
            authed: false,
            service_accepted: false,
            username: None,
            required: None,
            completed: Vec::new(),
            active: None,
            failures: 0,
            max_attempts: conf.max_auth_attempts,
            recompute: conf.policies.recompute_mode(),
            last_activity: Instant::now(),
            idle_timeout: conf.auth_idle_timeout,
        }
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        self.authed
    }

    /// Authentication fails if nothing happens before this
    pub fn deadline(&self) -> Option<Instant> {
        (!self.authed).then(|| self.last_activity + self.idle_timeout)
    }

    /// Restarts the idle timer, once the key exchange is done
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn service_request(&mut self, p: &ServiceRequest, banner: Option<&str>, s: &mut TrafSend) -> Result<()> {
        if p.name != SSH_SERVICE_USERAUTH || self.service_accepted {
            debug!("Refusing service {:?}", p.name);
            return Err(Error::NotAvailable { what: "service" });
        }
        self.service_accepted = true;
        self.touch();
        s.send(packets::ServiceAccept { name: SSH_SERVICE_USERAUTH.into() })?;
        if let Some(b) = banner {
            s.send(UserauthBanner { message: b.into(), lang: "".into() })?;
        }
        Ok(())
    }

    /// Returns `true` once the user is authenticated
    pub fn request(
        &mut self,
        p: UserauthRequest,
        sess_id: &SessId,
        mechs: &mut dyn MechanismFactory,
        s: &mut TrafSend,
    ) -> Result<bool> {
        if !self.service_accepted {
            return Err(Error::PacketWrong);
        }
        if self.authed {
            // RFC4252 section 5.1, ignored after success
            debug!("Ignoring request after success");
            return Ok(false);
        }
        self.touch();
        // a new request abandons a keyboard-interactive exchange
        self.active = None;

        let username = p.username.as_str()?.to_string();
        if self.username.as_ref() != Some(&username) {
            if self.username.is_some() {
                debug!("Username changed, restarting");
            }
            self.username = Some(username.clone());
            self.required = None;
            self.completed.clear();
        }
        if self.required.is_none() || self.recompute == RecomputeMode::PerAttempt {
            self.required = Some(mechs.required_methods(&username));
        }

        let method = p.method.name();
        let reply = if p.service != SSH_SERVICE_CONNECTION {
            debug!("Request for service {:?}", p.service);
            Reply::Failure
        } else if let AuthMethod::None = p.method {
            if self.remaining().is_empty() { Reply::Success } else { Reply::NoneProbe }
        } else if !self.remaining().contains(&method) {
            debug!("Method {method} not wanted for {username}");
            Reply::Failure
        } else {
            match mechs.mechanism(&method, &username) {
                Some(mech) => self.attempt(p, mech, sess_id, s)?,
                None => {
                    debug!("No mechanism for {method}");
                    Reply::Failure
                }
            }
        };
        self.reply(reply, method, s)
    }

    /// Runs a method's first step
    fn attempt(
        &mut self,
        mut p: UserauthRequest,
        mut mech: Box<dyn Mechanism>,
        sess_id: &SessId,
        s: &mut TrafSend,
    ) -> Result<Reply> {
        let method = p.method.name();
        let signed = matches!(&p.method, AuthMethod::PubKey(m) if m.sig.is_some());
        if signed && !Self::verify_sig(&mut p, sess_id) {
            return Ok(Reply::Failure);
        }

        let step = match &p.method {
            AuthMethod::Password(m) => {
                if m.new.is_some() {
                    debug!("Password change not supported");
                    return Ok(Reply::Failure);
                }
                mech.attempt(AuthAttempt::Password { password: m.password.as_str()? })
            }

            AuthMethod::PubKey(m) => {
                match mech.attempt(AuthAttempt::PubKey { key: &m.pubkey.0, signed }) {
                    MechStep::PkOk if !signed => {
                        s.send(Userauth60::PkOk(UserauthPkOk { algo: m.sig_algo.clone(), key: m.pubkey.clone() }))?;
                        return Ok(Reply::Continue);
                    }
                    MechStep::Success if !signed => {
                        debug!("Refusing unsigned publickey success");
                        MechStep::Failure
                    }
                    step => step,
                }
            }

            AuthMethod::KbdInteractive(m) => {
                mech.attempt(AuthAttempt::KbdInteractive { submethods: m.submethods.as_str()? })
            }

            AuthMethod::None | AuthMethod::Unknown(_) => return Ok(Reply::Failure),
        };
        self.step(step, method, mech, s)
    }

    fn step(&mut self, step: MechStep, method: String, mech: Box<dyn Mechanism>, s: &mut TrafSend) -> Result<Reply> {
        Ok(match step {
            MechStep::Success => Reply::Success,
            MechStep::Failure => Reply::Failure,
            MechStep::Prompt(req) if method == SSH_AUTHMETHOD_INTERACTIVE => {
                s.send(Userauth60::InfoRequest(req))?;
                self.active = Some(Active { method, mech });
                Reply::Continue
            }
            step => {
                debug!("Mechanism {method} returned unexpected {step:?}");
                Reply::Failure
            }
        })
    }

    /// A keyboard-interactive response
    pub fn info_response(&mut self, p: UserauthInfoResponse, s: &mut TrafSend) -> Result<bool> {
        let Some(Active { method, mut mech }) = self.active.take() else {
            debug!("Unexpected info response");
            return Err(Error::SSHProtoError);
        };
        self.touch();
        let responses = p
            .responses
            .iter()
            .map(|r| r.as_str().map(|r| r.to_string()))
            .collect::<Result<Vec<_>>>()?;
        let step = mech.attempt(AuthAttempt::InfoResponse { responses: &responses });
        let reply = self.step(step, method.clone(), mech, s)?;
        self.reply(reply, method, s)
    }

    fn remaining(&self) -> Vec<String> {
        self.required
            .iter()
            .flatten()
            .filter(|m| !self.completed.contains(m))
            .cloned()
            .collect()
    }

    fn reply(&mut self, reply: Reply, method: String, s: &mut TrafSend) -> Result<bool> {
        let partial = match reply {
            Reply::Continue => return Ok(false),
            Reply::Success => {
                if !self.completed.contains(&method) && method != SSH_NAME_NONE {
                    self.completed.push(method);
                }
                if self.remaining().is_empty() {
                    info!("User {:?} authenticated", self.username.as_deref().unwrap_or(""));
                    self.authed = true;
                    s.send(packets::UserauthSuccess {})?;
                    return Ok(true);
                }
                debug!("Partial success, remaining {:?}", self.remaining());
                true
            }
            Reply::Failure => {
                self.failures += 1;
                debug!("Auth failure {} of {}", self.failures, self.max_attempts);
                if self.failures >= self.max_attempts {
                    return Err(Error::TooManyAuthAttempts);
                }
                false
            }
            Reply::NoneProbe => false,
        };
        let methods = NameList::try_from(self.remaining().join(",").as_str())?;
        s.send(packets::UserauthFailure { methods, partial })?;
        Ok(false)
    }

    /// Checks the signature of a signed publickey request
    fn verify_sig(p: &mut UserauthRequest, sess_id: &SessId) -> bool {
        // the signed message is the request without its signature
        let (sig, sig_algo) = match &mut p.method {
            AuthMethod::PubKey(m) => match m.sig.take() {
                Some(s) => (s.0, m.sig_algo.clone()),
                None => return false,
            },
            _ => return false,
        };

        let sig_type = match sig.sig_type() {
            Ok(t) if t.algorithm_name() == sig_algo => t,
            _ => {
                debug!("Signature type doesn't match {sig_algo:?}");
                return false;
            }
        };

        let AuthMethod::PubKey(m) = &p.method else {
            return false;
        };
        let msg = auth::AuthSigMsg::new(p, sess_id);
        let r = sig_type.verify(&m.pubkey.0, &msg, &sig, Some(&auth::AuthSigMsg::parse_ctx()));
        if let Err(e) = &r {
            trace!("Signature failed {e}");
        }
        // put it back for the mechanism
        if let AuthMethod::PubKey(m) = &mut p.method {
            m.sig = Some(sshwire::Blob(sig));
        }
        r.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use crate::behaviour::*;
    use crate::dusklog::init_test_log;
    use crate::encrypt::KeyState;
    use crate::packets::{MethodPassword, Packet, ParseContext};
    use crate::servauth::*;
    use crate::traffic::{Stats, TrafOut};

    /// Accepts password "pw" and any keyboard-interactive answer "yes"
    pub(crate) struct TestMechs {
        pub required: Vec<&'static str>,
    }

    struct PwMech;

    impl Mechanism for PwMech {
        fn attempt(&mut self, attempt: AuthAttempt) -> MechStep {
            match attempt {
                AuthAttempt::Password { password: "pw" } => MechStep::Success,
                _ => MechStep::Failure,
            }
        }
    }

    struct AllowAll;

    impl Mechanism for AllowAll {
        fn attempt(&mut self, _attempt: AuthAttempt) -> MechStep {
            MechStep::Success
        }
    }

    impl MechanismFactory for TestMechs {
        fn required_methods(&mut self, _username: &str) -> Vec<String> {
            self.required.iter().map(|m| m.to_string()).collect()
        }

        fn mechanism(&mut self, method: &str, _username: &str) -> Option<Box<dyn Mechanism>> {
            match method {
                SSH_AUTHMETHOD_PASSWORD => Some(Box::new(PwMech)),
                SSH_AUTHMETHOD_INTERACTIVE => Some(Box::new(AllowAll)),
                _ => None,
            }
        }
    }

    struct Side {
        a: ServAuth,
        out: TrafOut,
        keys: KeyState,
        stats: Stats,
    }

    impl Side {
        fn new(conf: &Config) -> Self {
            let mut s = Side { a: ServAuth::new(conf), out: TrafOut::new(), keys: KeyState::new_cleartext(), stats: Stats::default() };
            let mut t = s.out.sender(&mut s.keys, &mut s.stats);
            t.start_hold();
            s.a.service_request(&ServiceRequest { name: SSH_SERVICE_USERAUTH.into() }, None, &mut t).unwrap();
            s.out.take_held(&ParseContext::new());
            s
        }

        fn req(&mut self, method: AuthMethod, mechs: &mut TestMechs) -> Result<(bool, Vec<Packet>)> {
            let p = UserauthRequest { username: "matt".into(), service: SSH_SERVICE_CONNECTION.into(), method };
            let mut t = self.out.sender(&mut self.keys, &mut self.stats);
            let r = self.a.request(p, &SessId::new(), mechs, &mut t)?;
            Ok((r, self.out.take_held(&ParseContext::new())))
        }
    }

    fn password(p: &str) -> AuthMethod {
        AuthMethod::Password(MethodPassword { password: p.into(), new: None })
    }

    fn kbd() -> AuthMethod {
        AuthMethod::KbdInteractive(packets::MethodKbdInteractive { lang: "".into(), submethods: "".into() })
    }

    fn failure_of(p: &[Packet]) -> (Vec<String>, bool) {
        match p {
            [Packet::UserauthFailure(f)] => (f.methods.iter().map(|m| m.to_string()).collect(), f.partial),
            p => panic!("{p:?}"),
        }
    }

    #[test]
    fn two_required_methods() {
        init_test_log();
        let mut mechs = TestMechs { required: vec![SSH_AUTHMETHOD_PASSWORD, SSH_AUTHMETHOD_INTERACTIVE] };
        let mut s = Side::new(&Config::default());

        let (ok, p) = s.req(AuthMethod::None, &mut mechs).unwrap();
        assert!(!ok);
        assert_eq!(failure_of(&p), (vec!["password".into(), "keyboard-interactive".into()], false));

        let (ok, p) = s.req(password("pw"), &mut mechs).unwrap();
        assert!(!ok);
        assert_eq!(failure_of(&p), (vec!["keyboard-interactive".into()], true));

        let (ok, p) = s.req(kbd(), &mut mechs).unwrap();
        assert!(ok);
        assert!(matches!(p[..], [Packet::UserauthSuccess(_)]));
        assert!(s.a.is_success());
        assert!(s.a.deadline().is_none());
    }

    #[test]
    fn none_allowed_with_nothing_required() {
        init_test_log();
        let mut mechs = TestMechs { required: vec![] };
        let mut s = Side::new(&Config::default());
        let (ok, _) = s.req(AuthMethod::None, &mut mechs).unwrap();
        assert!(ok);
    }

    #[test]
    fn attempts_limited() {
        init_test_log();
        let mut mechs = TestMechs { required: vec![SSH_AUTHMETHOD_PASSWORD] };
        let conf = Config { max_auth_attempts: 3, ..Default::default() };
        let mut s = Side::new(&conf);
        // none probes don't count
        for _ in 0..5 {
            s.req(AuthMethod::None, &mut mechs).unwrap();
        }
        s.req(password("x"), &mut mechs).unwrap();
        s.req(password("x"), &mut mechs).unwrap();
        assert!(matches!(s.req(password("x"), &mut mechs), Err(Error::TooManyAuthAttempts)));
    }

    #[test]
    fn unwanted_method_fails() {
        init_test_log();
        let mut mechs = TestMechs { required: vec![SSH_AUTHMETHOD_INTERACTIVE] };
        let mut s = Side::new(&Config::default());
        let (ok, p) = s.req(password("pw"), &mut mechs).unwrap();
        assert!(!ok);
        assert_eq!(failure_of(&p), (vec!["keyboard-interactive".into()], false));
    }

    #[test]
    fn wrong_service_refused() {
        init_test_log();
        let mut s = Side::new(&Config::default());
        let mut t = s.out.sender(&mut s.keys, &mut s.stats);
        let r = s.a.service_request(&ServiceRequest { name: "ssh-connection".into() }, None, &mut t);
        assert!(matches!(r, Err(Error::NotAvailable { .. })));
    }
}
