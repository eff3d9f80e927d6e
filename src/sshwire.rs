//! SSH wire format reading/writing.
//! Used in conjunction with [`dusk_sshwire_derive`] and the [`packet`](crate::packets) format
//! definitions.
//!
//! Decoded values own their contents, a packet doesn't borrow from the
//! receive buffer.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt::{self, Debug};

use ascii::{AsAsciiStr, AsciiChar, AsciiStr};
use pretty_hex::PrettyHex;

use crate::packets::{Packet, ParseContext};

/// A generic destination for serializing, used similarly to `serde::Serializer`
pub trait SSHSink {
    fn push(&mut self, v: &[u8]) -> WireResult<()>;
    fn ctx(&self) -> Option<&ParseContext> {
        None
    }
}

/// A generic source for a packet, used similarly to `serde::Deserializer`
pub trait SSHSource {
    fn take(&mut self, len: usize) -> WireResult<&[u8]>;
    fn pos(&self) -> usize;
    fn remaining(&self) -> usize;
    fn ctx(&mut self) -> &mut ParseContext;
}

/// Encodes the type in SSH wire format
pub trait SSHEncode {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink;
}

/// For enums with an externally provided name
pub trait SSHEncodeEnum {
    /// Returns the current variant, used for encoding parent structs.
    /// Fails if it is Unknown
    fn variant_name(&self) -> WireResult<&'static str>;
}

/// Decodes `struct` and `enum`s without an externally provided enum name
pub trait SSHDecode: Sized {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource;
}

/// Decodes enums with an externally provided name
pub trait SSHDecodeEnum: Sized {
    /// `variant` is the variant name to decode, as raw bytes off the wire.
    fn dec_enum<S>(s: &mut S, variant: &[u8]) -> WireResult<Self>
    where
        S: SSHSource;
}

/// A subset of [`Error`] for `SSHEncode` and `SSHDecode`.
#[derive(Debug)]
pub enum WireError {
    NoRoom,

    RanOut,

    BadString,

    BadName,

    UnknownVariant,

    PacketWrong,

    SSHProtoError,

    UnknownPacket { number: u8 },
}

impl From<WireError> for Error {
    fn from(w: WireError) -> Self {
        match w {
            WireError::NoRoom => Error::NoRoom,
            WireError::RanOut => Error::RanOut,
            WireError::BadString => Error::BadString,
            WireError::BadName => Error::BadName,
            WireError::SSHProtoError => Error::SSHProtoError,
            WireError::PacketWrong => Error::PacketWrong,
            WireError::UnknownVariant => Error::bug_err_msg("Can't encode Unknown"),
            WireError::UnknownPacket { number } => Error::UnknownPacket { number },
        }
    }
}

pub type WireResult<T> = core::result::Result<T, WireError>;

///////////////////////////////////////////////

/// Parses a [`Packet`] from a payload.
pub fn packet_from_bytes(b: &[u8], ctx: &ParseContext) -> Result<Packet> {
    let ctx = ParseContext { seen_unknown: false, ..ctx.clone() };
    let mut s = DecodeBytes { input: b, pos: 0, parse_ctx: ctx };
    let p = Packet::dec(&mut s)?;

    if s.remaining() != 0 && !s.parse_ctx.seen_unknown {
        // No length check if the packet had an unknown variant
        // - it skipped parsing the remainder of the packet.
        Err(Error::WrongPacketLength)
    } else {
        Ok(p)
    }
}

pub fn read_ssh<T: SSHDecode>(b: &[u8], ctx: Option<ParseContext>) -> Result<T> {
    let mut s = DecodeBytes { input: b, pos: 0, parse_ctx: ctx.unwrap_or_default() };
    Ok(T::dec(&mut s)?)
}

/// Appends the encoded `value` to `target`, returning the length written.
pub fn write_ssh<T>(target: &mut Vec<u8>, value: &T) -> Result<usize>
where
    T: SSHEncode + ?Sized,
{
    let start = target.len();
    let mut s = EncodeVec { target, ctx: None };
    value.enc(&mut s)?;
    Ok(s.target.len() - start)
}

/// Returns the encoded `value` in a new `Vec`
pub fn ssh_vec<T>(value: &T, ctx: Option<&ParseContext>) -> Result<Vec<u8>>
where
    T: SSHEncode + ?Sized,
{
    let mut v = Vec::new();
    let mut s = EncodeVec { target: &mut v, ctx: ctx.cloned() };
    value.enc(&mut s)?;
    Ok(v)
}

/// Hashes the SSH wire format representation of `value`, with a `u32` length prefix.
pub fn hash_ser_length<T>(hash_ctx: &mut impl digest::DynDigest, value: &T) -> Result<()>
where
    T: SSHEncode,
{
    let len: u32 = length_enc(value)?;
    hash_ctx.update(&len.to_be_bytes());
    hash_ser(hash_ctx, value, None)
}

/// Hashes the SSH wire format representation of `value`
pub fn hash_ser<T>(
    hash_ctx: &mut impl digest::DynDigest,
    value: &T,
    parse_ctx: Option<&ParseContext>,
) -> Result<()>
where
    T: SSHEncode,
{
    let mut s = EncodeHash { hash_ctx, parse_ctx: parse_ctx.cloned() };
    value.enc(&mut s)?;
    Ok(())
}

/// Returns `WireError::NoRoom` if larger than `u32`
pub(crate) fn length_enc<T>(value: &T) -> WireResult<u32>
where
    T: SSHEncode + ?Sized,
{
    let mut s = EncodeLen { pos: 0 };
    value.enc(&mut s)?;
    s.pos.try_into().map_err(|_| WireError::NoRoom)
}

struct EncodeVec<'a> {
    target: &'a mut Vec<u8>,
    ctx: Option<ParseContext>,
}

impl SSHSink for EncodeVec<'_> {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        self.target.extend_from_slice(v);
        Ok(())
    }

    fn ctx(&self) -> Option<&ParseContext> {
        self.ctx.as_ref()
    }
}

struct EncodeLen {
    pos: usize,
}

impl SSHSink for EncodeLen {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        self.pos += v.len();
        Ok(())
    }
}

struct EncodeHash<'a> {
    hash_ctx: &'a mut dyn digest::DynDigest,
    parse_ctx: Option<ParseContext>,
}

impl SSHSink for EncodeHash<'_> {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        self.hash_ctx.update(v);
        Ok(())
    }

    fn ctx(&self) -> Option<&ParseContext> {
        self.parse_ctx.as_ref()
    }
}

struct DecodeBytes<'a> {
    input: &'a [u8],
    pos: usize,
    parse_ctx: ParseContext,
}

impl SSHSource for DecodeBytes<'_> {
    fn take(&mut self, len: usize) -> WireResult<&[u8]> {
        if len > self.input.len() {
            return Err(WireError::RanOut);
        }
        let t;
        (t, self.input) = self.input.split_at(len);
        self.pos += len;
        Ok(t)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.input.len()
    }

    fn ctx(&mut self) -> &mut ParseContext {
        &mut self.parse_ctx
    }
}

/// Strips leading zero bytes from an unsigned big endian integer
fn mpint_trim(m: &[u8]) -> &[u8] {
    let z = m.iter().take_while(|b| **b == 0).count();
    &m[z..]
}

/// Returns the RFC4251 mpint body (without length) of an unsigned big
/// endian integer.
pub fn mpint_bytes(m: &[u8]) -> Vec<u8> {
    let m = mpint_trim(m);
    let mut v = Vec::with_capacity(m.len() + 1);
    if m.first().is_some_and(|b| b & 0x80 != 0) {
        v.push(0);
    }
    v.extend_from_slice(m);
    v
}

/// Hashes an unsigned big endian integer as a mpint. Has u32 length prefix,
/// no leading zeros, and an extra 0x00 byte if the MSB is set.
pub fn hash_mpint(hash_ctx: &mut dyn digest::DynDigest, m: &[u8]) {
    let m = mpint_trim(m);
    let pad = m.first().is_some_and(|b| b & 0x80 != 0);
    let l = m.len() as u32 + pad as u32;
    hash_ctx.update(&l.to_be_bytes());
    if pad {
        hash_ctx.update(&[0x00]);
    }
    hash_ctx.update(m);
}

///////////////////////////////////////////////

/// A SSH style binary string. Serialized as `u32` length followed by the bytes.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct BinString(pub Vec<u8>);

impl AsRef<[u8]> for BinString {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for BinString {
    fn from(b: &[u8]) -> Self {
        BinString(b.to_vec())
    }
}

impl From<Vec<u8>> for BinString {
    fn from(b: Vec<u8>) -> Self {
        BinString(b)
    }
}

impl Debug for BinString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinString(len={})", self.0.len())
    }
}

impl SSHEncode for BinString {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.0.as_slice().enc_prefixed(s)
    }
}

impl SSHDecode for BinString {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        let len = u32::dec(s)? as usize;
        Ok(BinString(s.take(len)?.to_vec()))
    }
}

/// A text string that may be presented to a user or used
/// for things such as a password, username, exec command, TCP hostname, etc.
///
/// The SSH protocol defines it to be UTF-8. It is kept as bytes,
/// decoding is left to the application.
///
/// Note that SSH protocol identifiers in `Packet` etc
/// are `String` rather than `TextString`, and always checked to be ASCII.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct TextString(pub Vec<u8>);

impl TextString {
    /// Returns the UTF-8 decoded string
    pub fn as_str(&self) -> Result<&str> {
        core::str::from_utf8(&self.0).map_err(|_| Error::BadString)
    }

    pub fn as_ascii(&self) -> Result<&str> {
        self.0.as_ascii_str().map_err(|_| Error::BadString).map(|s| s.as_str())
    }
}

impl AsRef<[u8]> for TextString {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for TextString {
    fn from(s: &str) -> Self {
        TextString(s.as_bytes().to_vec())
    }
}

impl From<String> for TextString {
    fn from(s: String) -> Self {
        TextString(s.into_bytes())
    }
}

impl Debug for TextString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = core::str::from_utf8(&self.0);
        if let Ok(s) = s {
            write!(f, "TextString(\"{}\")", s.escape_default())
        } else {
            write!(f, "TextString(not utf8!, {:#?})", self.0.hex_dump())
        }
    }
}

impl SSHEncode for TextString {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.0.as_slice().enc_prefixed(s)
    }
}

impl SSHDecode for TextString {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        let len = u32::dec(s)? as usize;
        Ok(TextString(s.take(len)?.to_vec()))
    }
}

/// A wrapper for a `u32` length prefixed data structure `B`, such as a public key blob
#[derive(Clone, PartialEq)]
pub struct Blob<B>(pub B);

impl<B> AsRef<B> for Blob<B> {
    fn as_ref(&self) -> &B {
        &self.0
    }
}

impl<B: SSHEncode + Debug> Debug for Blob<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(len) = length_enc(&self.0) {
            write!(f, "Blob(len={len}, {:?})", self.0)
        } else {
            write!(f, "Blob(len>u32, {:?})", self.0)
        }
    }
}

impl<B: SSHEncode> SSHEncode for Blob<B> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        let len: u32 = length_enc(&self.0)?;
        len.enc(s)?;
        self.0.enc(s)
    }
}

impl<B: SSHDecode> SSHDecode for Blob<B> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        let len = u32::dec(s)? as usize;
        let pos1 = s.pos();
        let inner = SSHDecode::dec(s)?;
        let pos2 = s.pos();

        // Sanity check the length matched
        let used_len = pos2 - pos1;
        if used_len == len {
            Ok(Blob(inner))
        } else {
            let extra = len.checked_sub(used_len).ok_or_else(|| {
                trace!(
                    "inner consumed past length of SSH Blob. \
                    Expected {} bytes, got {} bytes {}..{}",
                    len,
                    used_len,
                    pos1,
                    pos2
                );
                WireError::SSHProtoError
            })?;
            // Skip over unconsumed bytes in the blob.
            // This can occur with Unknown variants
            s.take(extra)?;
            Ok(Blob(inner))
        }
    }
}

///////////////////////////////////////////////

/// Encodes a byte slice with a `u32` length prefix
trait EncPrefixed {
    fn enc_prefixed<S: SSHSink>(&self, s: &mut S) -> WireResult<()>;
}

impl EncPrefixed for &[u8] {
    fn enc_prefixed<S: SSHSink>(&self, s: &mut S) -> WireResult<()> {
        let l: u32 = self.len().try_into().map_err(|_| WireError::NoRoom)?;
        l.enc(s)?;
        s.push(self)
    }
}

impl SSHEncode for u8 {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        s.push(&[*self])
    }
}

impl SSHEncode for bool {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        (*self as u8).enc(s)
    }
}

impl SSHEncode for u32 {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        s.push(&self.to_be_bytes())
    }
}

// no length prefix
impl SSHEncode for &[u8] {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        s.push(self)
    }
}

// no length prefix
impl<const N: usize> SSHEncode for [u8; N] {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        s.push(self)
    }
}

impl SSHEncode for &str {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.as_bytes().enc_prefixed(s)
    }
}

impl SSHEncode for str {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.as_bytes().enc_prefixed(s)
    }
}

/// SSH identifier names
impl SSHEncode for String {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.as_str().enc(s)
    }
}

impl<T: SSHEncode> SSHEncode for Option<T> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        if let Some(t) = self.as_ref() {
            t.enc(s)?;
        }
        Ok(())
    }
}

impl SSHDecode for bool {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        Ok(u8::dec(s)? != 0)
    }
}

impl SSHDecode for u8 {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        let t = s.take(1)?;
        Ok(t[0])
    }
}

impl SSHDecode for u32 {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        let t = s.take(core::mem::size_of::<u32>())?;
        let mut b = [0u8; 4];
        b.copy_from_slice(t);
        Ok(u32::from_be_bytes(b))
    }
}

/// Decodes a SSH name string. Must be ASCII
/// without control characters. RFC4251 section 6.
pub fn try_as_ascii(t: &[u8]) -> WireResult<&AsciiStr> {
    let n = t.as_ascii_str().map_err(|_| WireError::BadName)?;
    if n.chars().any(|ch| ch.is_ascii_control() || ch == AsciiChar::DEL) {
        return Err(WireError::BadName);
    }
    Ok(n)
}

pub fn try_as_ascii_str(t: &[u8]) -> WireResult<&str> {
    try_as_ascii(t).map(AsciiStr::as_str)
}

/// SSH identifier names, checked to be ASCII
impl SSHDecode for String {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        let len = u32::dec(s)?;
        let t = s.take(len as usize)?;
        try_as_ascii_str(t).map(|s| s.to_string())
    }
}

impl<const N: usize> SSHDecode for [u8; N] {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource,
    {
        let mut l = [0u8; N];
        l.copy_from_slice(s.take(N)?);
        Ok(l)
    }
}
