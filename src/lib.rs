//! A sans-IO SSH2 protocol engine.
//!
//! [`Runner`] implements the transport, authentication and connection
//! protocols for one client or server connection. It doesn't touch sockets,
//! see the `dusk-stdasync` crate for a tokio driver.

#![forbid(unsafe_code)]

// avoids headscratching
#![deny(unused_must_use)]

pub mod sshwire;
pub mod packets;
pub mod sshnames;
pub mod config;
// exported so that some Channel error variants can be created with .fail().
pub mod error;
pub mod random;

pub mod behaviour;
pub mod completion;
pub mod event;

mod conn;
mod encrypt;
mod ident;
mod kex;
mod namelist;
mod sign;

mod cliauth;
mod servauth;

mod dusklog;
mod auth;
mod channel;
mod forward;
mod runner;
mod ssh_chapoly;
mod traffic;
mod window;

#[cfg(test)]
mod testpair;

// Application API
pub use sshwire::TextString;

pub use sign::{SignKey, KeyType};
pub use packets::{PubKey, Signature, ChannelOpenType, ChannelReqType};
pub use error::{Error, Result};
pub use sshnames::{ChanFail, DisconnectReason};
pub use channel::{ChanData, ChanNum, ChanState, ReqId};
pub use cliauth::{ClientAuth, KbdResponder};
pub use kex::AlgoConfig;
pub use config::{Config, Policies, Policy, PolicyValue, RecomputeMode};
pub use traffic::Stats;

pub use behaviour::{
    AcceptAnyHostKey, AuthAttempt, ChannelFactory, ChannelHandler, ClientSetup, DefaultChannels,
    EventHandler, ForwardingHandler, HostKeyVerifier, KnownHostKey, MechStep, Mechanism, MechanismFactory,
    NoForwarding, NoMechanisms, ReqReply, ServerSetup,
};
pub use completion::{Completion, Outcome};
pub use runner::Runner;
pub use event::Event;
