//! SSH protocol packets.
//!
//! A [`Packet`] can be encoded/decoded to the
//! SSH Binary Packet Protocol using [`sshwire`].
//! SSH packet format is described in [RFC4253](https://tools.ietf.org/html/rfc4253) SSH Transport

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use pretty_hex::PrettyHex;

use dusk_sshwire_derive::*;

use crate::*;
use namelist::NameList;
use sign::{OwnedSig, SigType};
use sshnames::*;
use sshwire::{BinString, Blob, TextString};
use sshwire::{SSHDecode, SSHEncode, SSHSink, SSHSource, WireError, WireResult};
use sshwire::SSHEncodeEnum;

// Any `enum` needs to have special handling to select a variant when deserializing.
// This is mostly done with `#[sshwire(...)]` attributes.

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct KexInit {
    pub cookie: [u8; 16],
    pub kex: NameList,
    /// A list of signature algorithms
    ///
    /// RFC4253 refers to this as the host key algorithms, but actually they
    /// are signature algorithms.
    pub hostsig: NameList,
    pub cipher_c2s: NameList,
    pub cipher_s2c: NameList,
    pub mac_c2s: NameList,
    pub mac_s2c: NameList,
    pub comp_c2s: NameList,
    pub comp_s2c: NameList,
    pub lang_c2s: NameList,
    pub lang_s2c: NameList,
    pub first_follows: bool,
    pub reserved: u32,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct NewKeys {}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct Ignore {
    pub data: BinString,
}

/// Named to avoid clashing with [`fmt::Debug`]
#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct DebugPacket {
    pub always_display: bool,
    pub message: TextString,
    pub lang: TextString,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct Disconnect {
    pub reason: u32,
    pub desc: TextString,
    pub lang: TextString,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct Unimplemented {
    pub seq: u32,
}

/// Carries the client's ephemeral public value.
///
/// For curve25519 this is the raw 32 byte point, for finite field
/// diffie-hellman it is the mpint body of `e`.
#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct KexDHInit {
    pub q_c: BinString,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct KexDHReply {
    pub k_s: Blob<PubKey>,
    pub q_s: BinString,
    pub sig: Blob<Signature>,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ServiceRequest {
    pub name: String,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ServiceAccept {
    pub name: String,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct UserauthRequest {
    pub username: TextString,
    pub service: String,
    pub method: AuthMethod,
}

/// The method-specific part of a [`UserauthRequest`].
#[derive(Debug, Clone, SSHEncode, SSHDecode)]
#[sshwire(variant_prefix)]
pub enum AuthMethod {
    #[sshwire(variant = SSH_AUTHMETHOD_PASSWORD)]
    Password(MethodPassword),
    #[sshwire(variant = SSH_AUTHMETHOD_PUBLICKEY)]
    PubKey(MethodPubKey),
    #[sshwire(variant = SSH_AUTHMETHOD_INTERACTIVE)]
    KbdInteractive(MethodKbdInteractive),
    #[sshwire(variant = SSH_NAME_NONE)]
    None,
    #[sshwire(unknown)]
    Unknown(Unknown),
}

impl AuthMethod {
    /// The wire name, including for unknown methods
    pub fn name(&self) -> String {
        match self {
            AuthMethod::Unknown(u) => u.to_string(),
            m => m.variant_name().unwrap_or(SSH_NAME_NONE).to_string(),
        }
    }
}

impl TryFrom<PubKey> for AuthMethod {
    type Error = Error;
    fn try_from(pubkey: PubKey) -> Result<Self> {
        let sig_algo = Signature::sig_name_for_pubkey(&pubkey).trap()?;
        Ok(AuthMethod::PubKey(MethodPubKey {
            sig_algo: sig_algo.into(),
            pubkey: Blob(pubkey),
            sig: None,
        }))
    }
}

/// Message 60 has different contents depending on the method in progress.
#[derive(Debug, Clone, SSHEncode)]
#[sshwire(no_variant_names)]
pub enum Userauth60 {
    PkOk(UserauthPkOk),
    PwChangeReq(UserauthPwChangeReq),
    InfoRequest(UserauthInfoRequest),
}

impl SSHDecode for Userauth60 {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        match s.ctx().cli_auth_type {
            Some(auth::AuthType::Password) => Ok(Self::PwChangeReq(SSHDecode::dec(s)?)),
            Some(auth::AuthType::PubKey) => Ok(Self::PkOk(SSHDecode::dec(s)?)),
            Some(auth::AuthType::KbdInteractive) => {
                Ok(Self::InfoRequest(SSHDecode::dec(s)?))
            }
            _ => {
                trace!("Wrong packet state for userauth60");
                Err(WireError::PacketWrong)
            }
        }
    }
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct UserauthPkOk {
    pub algo: String,
    pub key: Blob<PubKey>,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct UserauthPwChangeReq {
    pub prompt: TextString,
    pub lang: TextString,
}

/// [RFC4256](https://tools.ietf.org/html/rfc4256) SSH_MSG_USERAUTH_INFO_REQUEST
#[derive(Debug, Clone)]
pub struct UserauthInfoRequest {
    pub name: TextString,
    pub instruction: TextString,
    pub lang: TextString,
    pub prompts: Vec<InfoPrompt>,
}

#[derive(Debug, Clone)]
pub struct InfoPrompt {
    pub prompt: TextString,
    pub echo: bool,
}

// Bounds allocation from a hostile count
const MAX_INFO_PROMPTS: u32 = 32;

impl SSHEncode for UserauthInfoRequest {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.name.enc(s)?;
        self.instruction.enc(s)?;
        self.lang.enc(s)?;
        let n: u32 = self.prompts.len().try_into().map_err(|_| WireError::NoRoom)?;
        n.enc(s)?;
        for p in self.prompts.iter() {
            p.prompt.enc(s)?;
            p.echo.enc(s)?;
        }
        Ok(())
    }
}

impl SSHDecode for UserauthInfoRequest {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        let name = SSHDecode::dec(s)?;
        let instruction = SSHDecode::dec(s)?;
        let lang = SSHDecode::dec(s)?;
        let n = u32::dec(s)?;
        if n > MAX_INFO_PROMPTS {
            return Err(WireError::SSHProtoError);
        }
        let prompts = (0..n)
            .map(|_| -> WireResult<InfoPrompt> {
                Ok(InfoPrompt { prompt: SSHDecode::dec(s)?, echo: SSHDecode::dec(s)? })
            })
            .collect::<WireResult<Vec<_>>>()?;
        Ok(Self { name, instruction, lang, prompts })
    }
}

/// [RFC4256](https://tools.ietf.org/html/rfc4256) SSH_MSG_USERAUTH_INFO_RESPONSE
#[derive(Clone)]
pub struct UserauthInfoResponse {
    pub responses: Vec<TextString>,
}

impl SSHEncode for UserauthInfoResponse {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        let n: u32 = self.responses.len().try_into().map_err(|_| WireError::NoRoom)?;
        n.enc(s)?;
        for r in self.responses.iter() {
            r.enc(s)?;
        }
        Ok(())
    }
}

impl SSHDecode for UserauthInfoResponse {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        let n = u32::dec(s)?;
        if n > MAX_INFO_PROMPTS {
            return Err(WireError::SSHProtoError);
        }
        let responses = (0..n).map(|_| SSHDecode::dec(s)).collect::<WireResult<Vec<_>>>()?;
        Ok(Self { responses })
    }
}

// Don't print responses, they are usually passwords
impl fmt::Debug for UserauthInfoResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserauthInfoResponse")
            .field("count", &self.responses.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct MethodPassword {
    pub password: TextString,
    /// A new password, only present for a change request.
    pub new: Option<TextString>,
}

impl SSHEncode for MethodPassword {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.new.is_some().enc(s)?;
        self.password.enc(s)?;
        self.new.enc(s)
    }
}

impl SSHDecode for MethodPassword {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        let change = bool::dec(s)?;
        let password = SSHDecode::dec(s)?;
        let new = if change { Some(SSHDecode::dec(s)?) } else { None };
        Ok(Self { password, new })
    }
}

// Don't print password
impl fmt::Debug for MethodPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodPassword")
            .field("change", &self.new.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct MethodPubKey {
    /// A signature algorithm name (not key algorithm name).
    pub sig_algo: String,
    pub pubkey: Blob<PubKey>,
    pub sig: Option<Blob<Signature>>,
}

impl SSHEncode for MethodPubKey {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        // byte      SSH_MSG_USERAUTH_REQUEST
        // string    user name
        // string    service name
        // string    "publickey"
        // boolean   TRUE
        // string    public key algorithm name
        // string    public key to be used for authentication
        // string    signature

        // Signature bool will be set when signing
        let force_sig_bool = s.ctx().is_some_and(|c| c.method_pubkey_force_sig_bool);
        let sig = self.sig.is_some() || force_sig_bool;
        sig.enc(s)?;
        self.sig_algo.enc(s)?;
        self.pubkey.enc(s)?;
        self.sig.enc(s)?;
        Ok(())
    }
}

impl SSHDecode for MethodPubKey {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        let sig = bool::dec(s)?;
        let sig_algo = SSHDecode::dec(s)?;
        let pubkey = SSHDecode::dec(s)?;
        let sig = if sig { Some(SSHDecode::dec(s)?) } else { None };
        Ok(Self { sig_algo, pubkey, sig })
    }
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct MethodKbdInteractive {
    pub lang: TextString,
    pub submethods: TextString,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct UserauthFailure {
    pub methods: NameList,
    pub partial: bool,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct UserauthSuccess {}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct UserauthBanner {
    pub message: TextString,
    pub lang: TextString,
}

#[derive(SSHEncode, SSHDecode, Debug, Clone, PartialEq)]
#[sshwire(variant_prefix)]
pub enum PubKey {
    #[sshwire(variant = SSH_NAME_ED25519)]
    Ed25519(Ed25519PubKey),
    #[sshwire(variant = SSH_NAME_RSA)]
    RSA(RSAPubKey),
    #[sshwire(unknown)]
    Unknown(Unknown),
}

impl PubKey {
    /// The algorithm name presented. May be invalid.
    pub fn algorithm_name(&self) -> Result<&str, &Unknown> {
        match self {
            PubKey::Ed25519(_) => Ok(SSH_NAME_ED25519),
            PubKey::RSA(_) => Ok(SSH_NAME_RSA),
            PubKey::Unknown(u) => Err(u),
        }
    }

    /// The public key blob, as sent in KEXDH_REPLY and hashed.
    pub fn blob(&self) -> Result<Vec<u8>> {
        sshwire::ssh_vec(self, None)
    }

    #[cfg(feature = "openssh-key")]
    pub fn matches_openssh(&self, k: &str) -> Result<bool> {
        let k = ssh_key::PublicKey::from_openssh(k)
            .map_err(|_| Error::msg("Unsupported OpenSSH key"))?;

        let m = match (k.key_data(), self) {
            (ssh_key::public::KeyData::Ed25519(kssh), PubKey::Ed25519(kself)) => {
                kssh.0.as_slice() == kself.key.0.as_slice()
            }
            _ => false,
        };
        Ok(m)
    }
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct Ed25519PubKey {
    pub key: BinString,
}

impl TryFrom<&Ed25519PubKey> for ed25519_dalek::VerifyingKey {
    type Error = Error;
    fn try_from(k: &Ed25519PubKey) -> Result<Self> {
        let b: [u8; 32] = k.key.0.as_slice().try_into().map_err(|_| Error::BadKey)?;
        ed25519_dalek::VerifyingKey::from_bytes(&b).map_err(|_| Error::BadKey)
    }
}

/// `e` and `n` are mpint bodies
#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct RSAPubKey {
    pub e: BinString,
    pub n: BinString,
}

#[cfg(feature = "rsa")]
impl TryFrom<&RSAPubKey> for rsa::RsaPublicKey {
    type Error = Error;
    fn try_from(k: &RSAPubKey) -> Result<Self> {
        use rsa::BigUint;
        rsa::RsaPublicKey::new(BigUint::from_bytes_be(&k.n.0), BigUint::from_bytes_be(&k.e.0))
            .map_err(|e| {
                debug!("Bad RSA key: {e}");
                Error::BadKey
            })
    }
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
#[sshwire(variant_prefix)]
pub enum Signature {
    #[sshwire(variant = SSH_NAME_ED25519)]
    Ed25519(Ed25519Sig),
    #[sshwire(variant = SSH_NAME_RSA_SHA256)]
    RSA256(RSASig),
    #[sshwire(variant = SSH_NAME_RSA_SHA512)]
    RSA512(RSASig),
    #[sshwire(unknown)]
    Unknown(Unknown),
}

impl Signature {
    /// The algorithm name presented. May be invalid.
    pub fn algorithm_name(&self) -> Result<&'static str, &Unknown> {
        match self {
            Signature::Unknown(u) => Err(u),
            s => Ok(s.sig_type().map(|t| t.algorithm_name()).unwrap_or(SSH_NAME_NONE)),
        }
    }

    /// Returns the default signature algorithm name for a public key.
    /// Returns (`Error::UnknownMethod`) if the PubKey is unknown
    pub fn sig_name_for_pubkey(pubkey: &PubKey) -> Result<&'static str> {
        match pubkey {
            PubKey::Ed25519(_) => Ok(SSH_NAME_ED25519),
            PubKey::RSA(_) => Ok(SSH_NAME_RSA_SHA256),
            PubKey::Unknown(u) => {
                warn!("Unknown key type \"{}\"", u);
                Err(Error::UnknownMethod { kind: "key" })
            }
        }
    }

    pub fn sig_type(&self) -> Result<SigType> {
        match self {
            Signature::Ed25519(_) => Ok(SigType::Ed25519),
            Signature::RSA256(_) => Ok(SigType::RSA256),
            Signature::RSA512(_) => Ok(SigType::RSA512),
            Signature::Unknown(u) => {
                warn!("Unknown signature type \"{}\"", u);
                Err(Error::UnknownMethod { kind: "signature" })
            }
        }
    }
}

impl From<&OwnedSig> for Signature {
    fn from(s: &OwnedSig) -> Self {
        match s {
            OwnedSig::Ed25519(e) => Signature::Ed25519(Ed25519Sig { sig: BinString(e.to_vec()) }),
            OwnedSig::RSA256(r) => Signature::RSA256(RSASig { sig: BinString(r.clone()) }),
            OwnedSig::RSA512(r) => Signature::RSA512(RSASig { sig: BinString(r.clone()) }),
        }
    }
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct Ed25519Sig {
    pub sig: BinString,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct RSASig {
    pub sig: BinString,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct GlobalRequest {
    #[sshwire(variant_name = req)]
    pub want_reply: bool,
    pub req: GlobalRequestMethod,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub enum GlobalRequestMethod {
    #[sshwire(variant = SSH_GLOBAL_TCPIP_FORWARD)]
    TcpipForward(TcpipForward),
    #[sshwire(variant = SSH_GLOBAL_CANCEL_TCPIP_FORWARD)]
    CancelTcpipForward(TcpipForward),
    #[sshwire(unknown)]
    Unknown(Unknown),
}

/// Used for both `tcpip-forward` and `cancel-tcpip-forward`
#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct TcpipForward {
    pub address: TextString,
    pub port: u32,
}

/// REQUEST_SUCCESS only carries a port in reply to a
/// `tcpip-forward` for port 0.
#[derive(Debug, Clone, SSHEncode)]
#[sshwire(no_variant_names)]
pub enum RequestSuccess {
    SuccessEmpty,
    TcpPort(TcpPort),
}

impl SSHDecode for RequestSuccess {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        if s.ctx().last_req_port {
            Ok(Self::TcpPort(TcpPort::dec(s)?))
        } else {
            Ok(Self::SuccessEmpty)
        }
    }
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct TcpPort {
    pub port: u32,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct RequestFailure {}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ChannelOpen {
    // channel_type is implicit in ty below
    #[sshwire(variant_name = ty)]
    pub num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
    pub ty: ChannelOpenType,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub enum ChannelOpenType {
    #[sshwire(variant = "session")]
    Session,
    #[sshwire(variant = "forwarded-tcpip")]
    ForwardedTcpip(ForwardedTcpip),
    #[sshwire(variant = "direct-tcpip")]
    DirectTcpip(DirectTcpip),
    #[sshwire(variant = "auth-agent@openssh.com")]
    AuthAgent,
    #[sshwire(unknown)]
    Unknown(Unknown),
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ChannelOpenConfirmation {
    pub num: u32,
    pub sender_num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ChannelOpenFailure {
    pub num: u32,
    pub reason: u32,
    pub desc: TextString,
    pub lang: TextString,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ChannelWindowAdjust {
    pub num: u32,
    pub adjust: u32,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ChannelData {
    pub num: u32,
    pub data: BinString,
}

impl ChannelData {
    // payload bytes that aren't data, includes packet type byte
    pub const DATA_OFFSET: usize = 9;
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ChannelDataExt {
    pub num: u32,
    pub code: u32,
    pub data: BinString,
}

impl ChannelDataExt {
    // payload bytes that aren't data, includes packet type byte
    pub const DATA_OFFSET: usize = 13;
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ChannelEof {
    pub num: u32,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ChannelClose {
    pub num: u32,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ChannelSuccess {
    pub num: u32,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ChannelFailure {
    pub num: u32,
}

#[derive(Debug, Clone, SSHEncode, SSHDecode)]
pub struct ChannelRequest {
    pub num: u32,

    // channel_type is implicit in req below
    #[sshwire(variant_name = req)]
    pub want_reply: bool,
    pub req: ChannelReqType,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub enum ChannelReqType {
    #[sshwire(variant = "shell")]
    Shell,
    #[sshwire(variant = "exec")]
    Exec(Exec),
    #[sshwire(variant = "pty-req")]
    Pty(PtyReq),
    #[sshwire(variant = "subsystem")]
    Subsystem(Subsystem),
    #[sshwire(variant = "window-change")]
    WinChange(WinChange),
    #[sshwire(variant = "env")]
    Env(Env),
    #[sshwire(variant = "signal")]
    Signal(Signal),
    #[sshwire(variant = "exit-status")]
    ExitStatus(ExitStatus),
    #[sshwire(variant = "exit-signal")]
    ExitSignal(ExitSignal),
    #[sshwire(variant = "break")]
    Break(Break),
    #[sshwire(variant = "xon-xoff")]
    XonXoff(XonXoff),
    #[sshwire(variant = "x11-req")]
    X11Req(X11Req),
    #[sshwire(variant = "auth-agent-req@openssh.com")]
    AuthAgentReq,
    #[sshwire(unknown)]
    Unknown(Unknown),
}

impl ChannelReqType {
    /// The wire name, including for unknown requests
    pub fn name(&self) -> String {
        match self {
            ChannelReqType::Unknown(u) => u.to_string(),
            r => r.variant_name().unwrap_or("").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct Exec {
    pub command: TextString,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct Subsystem {
    pub subsystem: TextString,
}

/// The contents of a `"pty-req"` request.
#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct PtyReq {
    pub term: TextString,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    /// Encoded terminal modes, passed through uninterpreted.
    pub modes: BinString,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct WinChange {
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct Env {
    pub name: TextString,
    pub value: TextString,
}

/// A unix signal channel request
#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct Signal {
    pub sig: String,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct ExitStatus {
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct ExitSignal {
    pub signal: String,
    pub core: bool,
    pub error: TextString,
    pub lang: TextString,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct Break {
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct XonXoff {
    pub client_can_do: bool,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct X11Req {
    pub single_connection: bool,
    pub auth_protocol: TextString,
    pub auth_cookie: TextString,
    pub screen: u32,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct ForwardedTcpip {
    pub address: TextString,
    pub port: u32,
    pub origin: TextString,
    pub origin_port: u32,
}

#[derive(Debug, Clone, PartialEq, SSHEncode, SSHDecode)]
pub struct DirectTcpip {
    pub address: TextString,
    pub port: u32,
    pub origin: TextString,
    pub origin_port: u32,
}

// Placeholder for unknown method names. These are sometimes non-fatal and
// need to be handled by the relevant code, for example newly invented pubkey types
// This is deliberately not Serializable, we only receive it.
#[derive(Clone, PartialEq)]
pub struct Unknown(pub Vec<u8>);

impl From<&[u8]> for Unknown {
    fn from(b: &[u8]) -> Self {
        Unknown(b.to_vec())
    }
}

impl fmt::Display for Unknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = sshwire::try_as_ascii_str(&self.0) {
            f.write_str(s)
        } else {
            write!(f, "non-ascii {:?}", self.0.hex_dump())
        }
    }
}

impl fmt::Debug for Unknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// State to be passed to decoding.
/// Use this so the parser can select the correct enum variant to decode.
#[derive(Default, Clone, Debug)]
pub struct ParseContext {
    // Beware that currently .ctx() is not used by `length_enc()` or `Blob`,
    // so if ParseContext needs to modify output length it may not work correctly.
    pub cli_auth_type: Option<auth::AuthType>,

    // Used by auth_sig_msg()
    pub method_pubkey_force_sig_bool: bool,

    // The oldest outstanding global request was a tcpip-forward for port 0,
    // so REQUEST_SUCCESS carries the allocated port.
    pub last_req_port: bool,

    // Set to true if an unknown variant is encountered.
    // Packet length checks should be omitted in that case.
    pub(crate) seen_unknown: bool,
}

impl ParseContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// We have repeated `match` statements for the various packet types, use a macro
macro_rules! messagetypes {
    (
        $( ( $message_num:literal,
            $SpecificPacketVariant:ident,
            $SpecificPacketType:ty,
            $SSH_MESSAGE_NAME:ident,
            $category:ident
            ),
             )*
    ) => {

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum MessageNumber {
    // variants are eg
    // SSH_MSG_KEXINIT = 20,
    $(
    $SSH_MESSAGE_NAME = $message_num,
    )*
}

impl TryFrom<u8> for MessageNumber {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            // eg
            // 20 = Ok(MessageNumber::SSH_MSG_KEXINIT)
            $(
            $message_num => Ok(MessageNumber::$SSH_MESSAGE_NAME),
            )*
            _ => {
                Err(Error::UnknownPacket { number: v })
            }
        }
    }
}

impl SSHEncode for Packet {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let t = self.message_num() as u8;
        t.enc(s)?;
        match self {
            // eg
            // Packet::KexInit(p) => {
            // ...
            $(
            Packet::$SpecificPacketVariant(p) => {
                p.enc(s)?
            }
            )*
        };
        Ok(())
    }
}

impl SSHDecode for Packet {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource {
        let msg_num = u8::dec(s)?;
        let ty = MessageNumber::try_from(msg_num);
        let ty = match ty {
            Ok(t) => t,
            Err(_) => return Err(WireError::UnknownPacket { number: msg_num })
        };

        // Decode based on the message number
        let p = match ty {
            // eg
            // MessageNumber::SSH_MSG_KEXINIT => Packet::KexInit(
            // ...
            $(
            MessageNumber::$SSH_MESSAGE_NAME => Packet::$SpecificPacketVariant(SSHDecode::dec(s)?),
            )*
        };
        Ok(p)
    }
}

/// Top level SSH packet enum
#[derive(Debug, Clone)]
pub enum Packet {
    // eg KexInit(KexInit),
    $(
    $SpecificPacketVariant($SpecificPacketType),
    )*
}

impl Packet {
    pub fn message_num(&self) -> MessageNumber {
        match self {
            // eg
            // Packet::KexInit() => {
            // ..
            $(
            Packet::$SpecificPacketVariant(_) => {
                MessageNumber::$SSH_MESSAGE_NAME
            }
            )*
        }
    }

    pub fn category(&self) -> Category {
        match self {
            // eg
            // Packet::KexInit() => Category::Kex,
            $(
            Packet::$SpecificPacketVariant(_) => Category::$category,
            )*
        }
    }
}

$(
impl From<$SpecificPacketType> for Packet {
    fn from(s: $SpecificPacketType) -> Packet {
        Packet::$SpecificPacketVariant(s)
    }
}
)*

} } // macro

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Allowed at any time, including during key exchange.
    All,
    /// After kexinit, before newkeys complete (other packets are not allowed during
    /// that time).
    Kex,
    /// Post-kex
    Auth,
    /// Post-auth
    Sess,
}

messagetypes![
(1, Disconnect, Disconnect, SSH_MSG_DISCONNECT, All),
(2, Ignore, Ignore, SSH_MSG_IGNORE, All),
(3, Unimplemented, Unimplemented, SSH_MSG_UNIMPLEMENTED, All),
(4, DebugPacket, DebugPacket, SSH_MSG_DEBUG, All),
(5, ServiceRequest, ServiceRequest, SSH_MSG_SERVICE_REQUEST, Auth),
(6, ServiceAccept, ServiceAccept, SSH_MSG_SERVICE_ACCEPT, Auth),
// 7        SSH_MSG_EXT_INFO       RFC 8308
// 8        SSH_MSG_NEWCOMPRESS    RFC 8308
(20, KexInit, KexInit, SSH_MSG_KEXINIT, All),
(21, NewKeys, NewKeys, SSH_MSG_NEWKEYS, Kex),
(30, KexDHInit, KexDHInit, SSH_MSG_KEXDH_INIT, Kex),
(31, KexDHReply, KexDHReply, SSH_MSG_KEXDH_REPLY, Kex),

(50, UserauthRequest, UserauthRequest, SSH_MSG_USERAUTH_REQUEST, Auth),
(51, UserauthFailure, UserauthFailure, SSH_MSG_USERAUTH_FAILURE, Auth),
(52, UserauthSuccess, UserauthSuccess, SSH_MSG_USERAUTH_SUCCESS, Auth),
(53, UserauthBanner, UserauthBanner, SSH_MSG_USERAUTH_BANNER, Auth),
// One of
// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ
// SSH_MSG_USERAUTH_PK_OK
// SSH_MSG_USERAUTH_INFO_REQUEST
(60, Userauth60, Userauth60, SSH_MSG_USERAUTH_60, Auth),
(61, UserauthInfoResponse, UserauthInfoResponse, SSH_MSG_USERAUTH_INFO_RESPONSE, Auth),

(80, GlobalRequest, GlobalRequest, SSH_MSG_GLOBAL_REQUEST, Sess),
(81, RequestSuccess, RequestSuccess, SSH_MSG_REQUEST_SUCCESS, Sess),
(82, RequestFailure, RequestFailure, SSH_MSG_REQUEST_FAILURE, Sess),

(90, ChannelOpen, ChannelOpen, SSH_MSG_CHANNEL_OPEN, Sess),
(91, ChannelOpenConfirmation, ChannelOpenConfirmation, SSH_MSG_CHANNEL_OPEN_CONFIRMATION, Sess),
(92, ChannelOpenFailure, ChannelOpenFailure, SSH_MSG_CHANNEL_OPEN_FAILURE, Sess),
(93, ChannelWindowAdjust, ChannelWindowAdjust, SSH_MSG_CHANNEL_WINDOW_ADJUST, Sess),
(94, ChannelData, ChannelData, SSH_MSG_CHANNEL_DATA, Sess),
(95, ChannelDataExt, ChannelDataExt, SSH_MSG_CHANNEL_EXTENDED_DATA, Sess),
(96, ChannelEof, ChannelEof, SSH_MSG_CHANNEL_EOF, Sess),
(97, ChannelClose, ChannelClose, SSH_MSG_CHANNEL_CLOSE, Sess),
(98, ChannelRequest, ChannelRequest, SSH_MSG_CHANNEL_REQUEST, Sess),
(99, ChannelSuccess, ChannelSuccess, SSH_MSG_CHANNEL_SUCCESS, Sess),
(100, ChannelFailure, ChannelFailure, SSH_MSG_CHANNEL_FAILURE, Sess),
];
