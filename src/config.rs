//! Protocol limits and runtime configuration.
//!
//! [`Config`] is passed explicitly to [`Runner::new_client()`](crate::Runner::new_client)
//! or [`Runner::new_server()`](crate::Runner::new_server). There is no
//! process-wide default instance.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::mem::discriminant;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::ident::OUR_VERSION;
use crate::kex::AlgoConfig;

/// Largest packet length field accepted from a peer.
///
/// RFC4253 requires at least 35000, OpenSSH allows 256kB.
pub const MAX_RX_PACKET_LEN: usize = 256 * 1024;

/// Largest payload we will encode. Limits channel data per packet.
pub const MAX_TX_PAYLOAD: usize = 35000 - 64;

pub const DEFAULT_WINDOW: u32 = 2 * 1024 * 1024;
pub const DEFAULT_MAX_PACKET: u32 = 32 * 1024;

// This can be increased arbitrarily, channels are kept in a map.
pub const DEFAULT_MAX_CHANNELS: usize = 64;

pub const DEFAULT_AUTH_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 6;

/// RFC4253 section 9 recommends rekeying after a gigabyte
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;
/// RFC4344 section 3.1, well before sequence numbers wrap
pub const DEFAULT_REKEY_PACKETS: u64 = 1 << 28;

/// Channel sends are refused while this much is waiting in the output buffer.
pub const OUTPUT_HIGH_WATER: usize = 512 * 1024;

pub const MAX_USERNAME: usize = 256;

pub const DEFAULT_TERM: &str = "xterm";

/// Kinds of policy held in a [`Policies`] registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Policy {
    /// Client: run a password method as keyboard-interactive whenever the
    /// server offers keyboard-interactive, even if it also offers password.
    PreferKeyboardInteractive,
    /// Server: when the required-methods set is recomputed.
    RequiredMethodsRecompute,
    /// Advertise and honour OpenSSH strict key exchange.
    StrictKex,
    /// Start a key exchange when the rekey byte or packet limits are reached.
    AutoRekey,
}

/// When a server recomputes the set of methods a user must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeMode {
    /// Computed at the first request for a username, kept for the connection.
    PerConnection,
    /// Computed again for every authentication request.
    PerAttempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyValue {
    Flag(bool),
    Recompute(RecomputeMode),
}

impl Policy {
    pub const ALL: [Policy; 4] = [
        Policy::PreferKeyboardInteractive,
        Policy::RequiredMethodsRecompute,
        Policy::StrictKex,
        Policy::AutoRekey,
    ];

    pub fn default_value(self) -> PolicyValue {
        match self {
            Policy::PreferKeyboardInteractive => PolicyValue::Flag(false),
            Policy::RequiredMethodsRecompute => {
                PolicyValue::Recompute(RecomputeMode::PerConnection)
            }
            Policy::StrictKex => PolicyValue::Flag(true),
            Policy::AutoRekey => PolicyValue::Flag(true),
        }
    }
}

/// A typed registry of policies.
///
/// Unset policies read as [`Policy::default_value()`].
#[derive(Debug, Clone, Default)]
pub struct Policies {
    values: BTreeMap<Policy, PolicyValue>,
}

impl Policies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, policy: Policy) -> PolicyValue {
        self.values.get(&policy).copied().unwrap_or_else(|| policy.default_value())
    }

    /// Fails if `value` is a different type to the policy's default.
    pub fn set(&mut self, policy: Policy, value: PolicyValue) -> Result<()> {
        if discriminant(&value) != discriminant(&policy.default_value()) {
            return Err(Error::bad_usage("Wrong value type for policy"));
        }
        self.values.insert(policy, value);
        Ok(())
    }

    pub fn with(mut self, policy: Policy, value: PolicyValue) -> Result<Self> {
        self.set(policy, value)?;
        Ok(self)
    }

    /// Returns a boolean policy. Non-flag policies read as `false`.
    pub fn flag(&self, policy: Policy) -> bool {
        matches!(self.get(policy), PolicyValue::Flag(true))
    }

    pub fn recompute_mode(&self) -> RecomputeMode {
        match self.get(Policy::RequiredMethodsRecompute) {
            PolicyValue::Recompute(m) => m,
            _ => RecomputeMode::PerConnection,
        }
    }
}

/// Runtime configuration for one connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial local window for each channel.
    pub window: u32,
    /// Largest channel data packet we accept.
    pub max_packet: u32,
    /// A WINDOW_ADJUST is sent once more than this many bytes have been
    /// consumed by the application since the last adjustment.
    pub window_low_water: u32,
    pub max_channels: usize,
    pub algos: AlgoConfig,
    /// Authentication fails if no method is attempted for this long.
    pub auth_idle_timeout: Duration,
    /// Server: failed attempts allowed before disconnecting.
    pub max_auth_attempts: u32,
    pub rekey_bytes: u64,
    pub rekey_packets: u64,
    /// Local identification string, without the trailing CR LF.
    pub ident: String,
    pub policies: Policies,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_packet: DEFAULT_MAX_PACKET,
            window_low_water: DEFAULT_WINDOW / 2,
            max_channels: DEFAULT_MAX_CHANNELS,
            algos: AlgoConfig::default(),
            auth_idle_timeout: DEFAULT_AUTH_IDLE_TIMEOUT,
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            rekey_bytes: DEFAULT_REKEY_BYTES,
            rekey_packets: DEFAULT_REKEY_PACKETS,
            ident: OUR_VERSION.into(),
            policies: Policies::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 || self.max_packet == 0 {
            return Err(Error::bad_usage("Zero window or packet size"));
        }
        if self.max_packet as usize > MAX_TX_PAYLOAD {
            return Err(Error::bad_usage("max_packet too large"));
        }
        if self.window_low_water > self.window {
            return Err(Error::bad_usage("window_low_water exceeds window"));
        }
        if !self.ident.starts_with("SSH-2.0-")
            || self.ident.len() > crate::ident::MAX_IDENT_LEN
            || self.ident.contains(|c: char| c == '\r' || c == '\n')
        {
            return Err(Error::bad_usage("Bad identification string"));
        }
        if self.max_channels == 0 {
            return Err(Error::bad_usage("max_channels is zero"));
        }
        self.algos.validate()
    }
}
