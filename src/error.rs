use core::fmt::Arguments;
use core::str::Utf8Error;

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use snafu::prelude::*;

use crate::channel::ChanNum;
use crate::sshnames::{ChanFail, DisconnectReason};

/// The dusk error type.
#[non_exhaustive]
#[derive(Snafu, Debug)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum Error {
    /// Output buffer ran out of room
    NoRoom,

    /// Input buffer ran out
    RanOut,

    /// Not a UTF-8 string
    BadString,

    /// Not a valid SSH ASCII string
    BadName,

    /// Key exchange value out of range or otherwise invalid
    BadKex,

    /// Packet integrity failed
    BadDecrypt,

    /// Signature is incorrect
    BadSig,

    /// Integer overflow in packet
    BadNumber,

    /// Error in received SSH protocol. Will disconnect.
    SSHProtoError,

    /// Peer sent something we don't handle. Will disconnect.
    ///
    /// This differs to `SSHProtoError`. In this case the peer may be
    /// behaving within the SSH specifications, but it isn't supported here.
    SSHProtoUnsupported,

    /// Received a key with invalid structure, or too large.
    BadKeyFormat,

    /// Remote peer isn't SSH
    NotSSH,

    /// Bad key format
    BadKey,

    /// The host key verifier rejected the server's key
    HostKeyRejected,

    /// Ran out of channels
    NoChannels,

    #[snafu(display("Bad channel number {num}"))]
    BadChannel { num: ChanNum },

    /// Bad channel data type
    ///
    /// Returned from an API call that would send stderr data from a client.
    BadChannelData,

    /// Bad application usage
    #[snafu(display("Bad usage: {msg}"))]
    BadUsage { msg: &'static str },

    /// SSH packet contents doesn't match length
    WrongPacketLength,

    /// Channel EOF
    ///
    /// This is an expected error when a SSH channel completes. Can be returned
    /// by channel read/write functions. Any further calls in the same direction
    /// will fail similarly.
    ChannelEOF,

    /// The channel closed before the operation completed
    ChannelClosed,

    #[snafu(display("Channel open failed: {reason:?} {desc}"))]
    ChannelOpenFailed { reason: ChanFail, desc: String },

    /// The peer replied SSH_MSG_CHANNEL_FAILURE or SSH_MSG_REQUEST_FAILURE
    RequestFailed,

    /// Peer sent more data than the channel window allows
    WindowExceeded,

    /// A window adjustment pushed the window past 2^32-1
    WindowOverflow,

    /// Credentials were refused for this method
    AuthFailed,

    /// The server doesn't offer this authentication method
    AuthMethodUnavailable,

    /// No authentication methods remain to try
    AuthExhausted,

    /// The client failed authentication too many times
    TooManyAuthAttempts,

    /// Authentication didn't make progress within the idle timeout
    AuthTimeout,

    // Used for unknown key types etc.
    #[snafu(display("{what} is not available"))]
    NotAvailable { what: &'static str },

    #[snafu(display("Unknown packet type {number}"))]
    UnknownPacket { number: u8 },

    /// Received packet at a disallowed time.
    PacketWrong,

    #[snafu(display("No matching {algo} algorithm"))]
    AlgoNoMatch { algo: &'static str },

    #[snafu(display("Packet size {size} too large (or bad decrypt)"))]
    BigPacket { size: usize },

    /// An unknown SSH name is provided, for a key type, signature type,
    /// channel name etc.
    #[snafu(display("Unknown {kind} method"))]
    UnknownMethod { kind: &'static str },

    /// The peer sent SSH_MSG_DISCONNECT
    #[snafu(display("Peer disconnected, reason {reason}: {desc}"))]
    PeerDisconnected { reason: u32, desc: String },

    /// The connection has been closed. No further sends are possible.
    Disconnected,

    /// The operation was cancelled before it completed
    Cancelled,

    #[snafu(display("{msg}"))]
    Custom { msg: &'static str },

    /// IO Error
    IoError { source: std::io::Error },

    // This state should not be reached, previous logic should have prevented it.
    // Create this using [`Error::bug()`] or [`.trap()`](TrapBug::trap).
    /// Program bug
    Bug,
}

impl Error {
    pub fn msg(m: &'static str) -> Error {
        Error::Custom { msg: m }
    }

    pub fn bad_usage(msg: &'static str) -> Error {
        Error::BadUsage { msg }
    }

    #[cold]
    #[track_caller]
    /// Panics in debug builds, returns [`Error::Bug`] in release.
    pub fn bug() -> Error {
        // Easier to track the source of errors in development,
        // but release builds shouldn't panic.
        if cfg!(debug_assertions) {
            panic!("Hit a bug");
        } else {
            Error::Bug
        }
    }

    /// Like [`bug()`](Error::bug) but with a message
    ///
    /// The message can be used instead of a code comment, is logged at `trace` level.
    #[cold]
    #[track_caller]
    pub fn bug_fmt(args: Arguments) -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug: {args}");
        } else {
            trace!("Hit a bug: {args}");
            Error::Bug
        }
    }

    #[cold]
    #[track_caller]
    pub fn bug_msg<T>(msg: &str) -> Result<T, Error> {
        Err(Self::bug_fmt(format_args!("{}", msg)))
    }

    #[cold]
    #[track_caller]
    pub fn bug_err_msg(msg: &str) -> Error {
        Self::bug_fmt(format_args!("{}", msg))
    }

    /// The reason code sent in SSH_MSG_DISCONNECT when this error is fatal.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        use DisconnectReason as R;
        match self {
            Error::BadDecrypt => R::MacError,
            Error::AlgoNoMatch { .. } | Error::BadKex => R::KeyExchangeFailed,
            Error::HostKeyRejected | Error::BadSig => R::HostKeyNotVerifiable,
            Error::TooManyAuthAttempts | Error::AuthExhausted => R::NoMoreAuthMethodsAvailable,
            Error::NotAvailable { .. } => R::ServiceNotAvailable,
            Error::WindowOverflow | Error::NoChannels => R::TooManyConnections,
            Error::AuthTimeout => R::ByApplication,
            _ => R::ProtocolError,
        }
    }

    /// Whether this is a failure that only concerns one request or channel.
    ///
    /// Other errors returned from [`Runner::input()`](crate::Runner::input)
    /// are fatal for the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::AuthFailed
                | Error::AuthMethodUnavailable
                | Error::ChannelOpenFailed { .. }
                | Error::RequestFailed
                | Error::ChannelEOF
                | Error::ChannelClosed
                | Error::Cancelled
                | Error::BadUsage { .. }
        )
    }
}

/// A dusk-specific Result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub trait TrapBug<T> {
    /// `.trap()` should be used like `.unwrap()`, in situations
    /// never expected to fail. Instead it calls [`Error::bug()`].
    /// (or debug builds may panic)
    fn trap(self) -> Result<T, Error>;

    /// Like `trap()` but with a message, calls [`Error::bug_msg()`]
    /// The message can be used instead of a comment.
    fn trap_msg(self, args: Arguments) -> Result<T, Error>;
}

impl<T, E> TrapBug<T> for Result<T, E> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        // call directly so that Location::caller() works
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }

    #[track_caller]
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl<T> TrapBug<T> for Option<T> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }

    #[track_caller]
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(_e: Utf8Error) -> Error {
        Error::BadString
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IoError { source: value }
    }
}
