//! A client and server connected over an in-memory duplex stream

use tokio::task::JoinHandle;

use dusk::sshnames::SSH_AUTHMETHOD_PASSWORD;
use dusk::{AcceptAnyHostKey, AuthAttempt, ChanNum, ClientSetup, Config, Event, KeyType, MechStep};
use dusk::{Mechanism, MechanismFactory, Result, Runner, ServerSetup, SignKey};

use crate::{spawn, Events, SshHandle};

pub const PASSWORD: &str = "hunter2";

pub fn init_test_log() {
    let conf = simplelog::ConfigBuilder::new().build();
    let _ = simplelog::TestLogger::init(log::LevelFilter::Trace, conf);
}

struct PwMech;

impl Mechanism for PwMech {
    fn attempt(&mut self, attempt: AuthAttempt) -> MechStep {
        match attempt {
            AuthAttempt::Password { password } if password == PASSWORD => MechStep::Success,
            _ => MechStep::Failure,
        }
    }
}

struct PwMechs;

impl MechanismFactory for PwMechs {
    fn required_methods(&mut self, _username: &str) -> Vec<String> {
        vec![SSH_AUTHMETHOD_PASSWORD.to_string()]
    }

    fn mechanism(&mut self, method: &str, _username: &str) -> Option<Box<dyn Mechanism>> {
        (method == SSH_AUTHMETHOD_PASSWORD).then(|| Box::new(PwMech) as Box<dyn Mechanism>)
    }
}

pub fn client_setup() -> ClientSetup {
    ClientSetup::new("matt", AcceptAnyHostKey)
}

pub fn server_setup() -> ServerSetup {
    let key = SignKey::generate(KeyType::Ed25519).unwrap();
    ServerSetup::new(vec![key], PwMechs)
}

pub struct Pair {
    pub cli: SshHandle,
    pub cli_ev: Events,
    pub cli_task: JoinHandle<Result<()>>,
    pub serv: SshHandle,
    pub serv_ev: Events,
    pub serv_task: JoinHandle<Result<()>>,
}

impl Pair {
    pub fn new(conf: Config) -> Self {
        Self::with_configs(conf.clone(), conf)
    }

    pub fn with_configs(cli_conf: Config, serv_conf: Config) -> Self {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cli = Runner::new_client(cli_conf, client_setup()).unwrap();
        let serv = Runner::new_server(serv_conf, server_setup()).unwrap();
        let (cli, cli_ev, cli_task) = spawn(a, cli);
        let (serv, serv_ev, serv_task) = spawn(b, serv);
        Pair { cli, cli_ev, cli_task, serv, serv_ev, serv_task }
    }
}

/// Waits for the peer to open a channel
pub async fn opened(ev: &mut Events) -> Option<ChanNum> {
    while let Some(e) = ev.next().await {
        if let Event::ChannelOpened { chan, .. } = e {
            return Some(chan);
        }
    }
    None
}

pub async fn disconnect_reason(ev: &mut Events) -> Option<u32> {
    while let Some(e) = ev.next().await {
        if let Event::Disconnected { reason, .. } = e {
            return Some(reason);
        }
    }
    None
}
