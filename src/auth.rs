#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::*;
use kex::SessId;
use packets::{MessageNumber, ParseContext, UserauthRequest};
use sshwire::{BinString, SSHEncode, SSHSink, WireResult};

/// The message to be signed in a pubkey authentication message,
/// RFC4252 Section 7.
///
/// The signature field of `u` is None, the encoding context forces the
/// "has signature" boolean.
#[derive(Debug)]
pub struct AuthSigMsg<'a> {
    pub(crate) sess_id: BinString,
    pub(crate) u: &'a UserauthRequest,
}

impl SSHEncode for AuthSigMsg<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.sess_id.enc(s)?;
        (MessageNumber::SSH_MSG_USERAUTH_REQUEST as u8).enc(s)?;
        self.u.enc(s)
    }
}

impl<'a> AuthSigMsg<'a> {
    pub fn new(u: &'a UserauthRequest, sess_id: &SessId) -> Self {
        AuthSigMsg { sess_id: BinString(sess_id.to_vec()), u }
    }

    /// Context to encode with, sets the signature boolean
    pub fn parse_ctx() -> ParseContext {
        let mut ctx = ParseContext::new();
        ctx.method_pubkey_force_sig_bool = true;
        ctx
    }
}

/// The client method in progress, selects how message 60 is decoded
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AuthType {
    Password,
    PubKey,
    KbdInteractive,
}
