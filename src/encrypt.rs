//! Handles encryption/decryption and framing a payload in a SSH packet.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;
use core::fmt::Debug;
use core::num::Wrapping;

use aes::cipher::{BlockSizeUser, KeyIvInit, KeySizeUser, StreamCipher};
use digest::Digest;
use hmac::Mac;
use zeroize::Zeroize;

use crate::*;
use kex::{self, KexOutput, SessId};
use ssh_chapoly::SSHChaPoly;
use sshnames::*;

// The whole 16 byte block is the counter, RFC4344 section 4
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = hmac::Hmac<sha2::Sha256>;
type HmacSha512 = hmac::Hmac<sha2::Sha512>;

// RFC4253 Section 6. Including length u32 length field, excluding MAC
const SSH_MIN_PACKET_SIZE: usize = 16;
const SSH_MIN_PADLEN: usize = 4;
const SSH_MIN_BLOCK: usize = 8;
pub const SSH_LENGTH_SIZE: usize = 4;
pub const SSH_PAYLOAD_START: usize = SSH_LENGTH_SIZE + 1;

/// Largest is aes-ctr
const MAX_IV_LEN: usize = 16;
/// Largest is chacha and hmac-sha2-512
const MAX_KEY_LEN: usize = 64;

/// Stateful keys and sequence numbers, a single instance
/// is kept for the entire session.
///
/// The two directions are replaced independently. Outgoing keys change
/// once our NEWKEYS is sent, incoming keys once the peer's NEWKEYS arrives.
#[derive(Debug)]
pub(crate) struct KeyState {
    enc: EncKeys,
    dec: DecKeys,
    // Packet sequence numbers. These don't reset with rekeying,
    // unless strict kex is in use.
    seq_encrypt: Wrapping<u32>,
    seq_decrypt: Wrapping<u32>,
}

impl KeyState {
    /// A brand new `KeyState` with no encryption, zero sequence numbers
    pub fn new_cleartext() -> Self {
        KeyState {
            enc: EncKeys::cleartext(),
            dec: DecKeys::cleartext(),
            seq_encrypt: Wrapping(0),
            seq_decrypt: Wrapping(0),
        }
    }

    pub fn is_cleartext(&self) -> bool {
        matches!(self.enc.cipher, EncKey::NoCipher) || matches!(self.dec.cipher, DecKey::NoCipher)
    }

    /// Takes new outgoing keys into use, keeping the sequence number
    pub fn rekey_enc(&mut self, enc: EncKeys) {
        self.enc = enc
    }

    /// Takes new incoming keys into use, keeping the sequence number
    pub fn rekey_dec(&mut self, dec: DecKeys) {
        self.dec = dec
    }

    pub fn reset_seq_enc(&mut self) {
        self.seq_encrypt = Wrapping(0);
    }

    pub fn reset_seq_dec(&mut self) {
        self.seq_decrypt = Wrapping(0);
    }

    /// Counts a packet that was sent by other means
    #[cfg(test)]
    pub(crate) fn skip_seq_enc(&mut self) {
        self.seq_encrypt += 1;
    }

    /// Sequence number of the next packet to be decrypted
    pub fn recv_seq(&self) -> u32 {
        self.seq_decrypt.0
    }

    /// Decrypts the first block in the buffer, returning the length of the
    /// whole packet including length field and MAC.
    ///
    /// `buf` must be [`size_block_dec()`](Self::size_block_dec) long.
    pub fn decrypt_first_block(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.dec.decrypt_first_block(buf, self.seq_decrypt.0)
    }

    /// Decrypt the packet, validating the AEAD tag or MAC.
    ///
    /// Returns the payload length, the payload starts at [`SSH_PAYLOAD_START`].
    pub fn decrypt(&mut self, buf: &mut [u8]) -> Result<usize> {
        let e = self.dec.decrypt(buf, self.seq_decrypt.0);
        self.seq_decrypt += 1;
        e
    }

    /// Frames and encrypts `payload`, appending the packet to `out`.
    ///
    /// Returns the length written. This updates the sequence number.
    pub fn encrypt(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let e = self.enc.encrypt(payload, out, self.seq_encrypt.0);
        self.seq_encrypt += 1;
        e
    }

    pub fn size_block_dec(&self) -> usize {
        self.dec.cipher.size_block()
    }
}

/// Derives both directions' keys from a completed exchange.
///
/// RFC4253 7.2, letters A/C/E are client to server.
pub(crate) fn derive_keys(
    ko: &KexOutput,
    sess_id: &SessId,
    algos: &kex::Algos,
) -> Result<(EncKeys, DecKeys)> {
    let mut key = [0u8; MAX_KEY_LEN];
    let mut iv = [0u8; MAX_IV_LEN];

    let (iv_e, iv_d, k_e, k_d, i_e, i_d) =
        if algos.is_client { ('A', 'B', 'C', 'D', 'E', 'F') } else { ('B', 'A', 'D', 'C', 'F', 'E') };

    let cipher = {
        let i = ko.compute_key(iv_e, algos.cipher_enc.iv_len(), &mut iv, sess_id)?;
        let k = ko.compute_key(k_e, algos.cipher_enc.key_len(), &mut key, sess_id)?;
        EncKey::from_cipher(&algos.cipher_enc, k, i)?
    };
    let integ = {
        let k = ko.compute_key(i_e, algos.integ_enc.key_len(), &mut key, sess_id)?;
        IntegKey::from_integ(&algos.integ_enc, k)?
    };
    let enc = EncKeys { cipher, integ };

    let cipher = {
        let i = ko.compute_key(iv_d, algos.cipher_dec.iv_len(), &mut iv, sess_id)?;
        let k = ko.compute_key(k_d, algos.cipher_dec.key_len(), &mut key, sess_id)?;
        DecKey::from_cipher(&algos.cipher_dec, k, i)?
    };
    let integ = {
        let k = ko.compute_key(i_d, algos.integ_dec.key_len(), &mut key, sess_id)?;
        IntegKey::from_integ(&algos.integ_dec, k)?
    };
    let dec = DecKeys { cipher, integ };

    key.zeroize();
    iv.zeroize();
    Ok((enc, dec))
}

/// Outgoing cipher and MAC
#[derive(Debug)]
pub(crate) struct EncKeys {
    cipher: EncKey,
    integ: IntegKey,
}

impl EncKeys {
    fn cleartext() -> Self {
        Self { cipher: EncKey::NoCipher, integ: IntegKey::NoInteg }
    }

    /// Padding is required to meet
    /// - minimum packet length
    /// - minimum padding size,
    /// - encrypted length being a multiple of block length
    fn calc_encrypt_pad(&self, payload_len: usize) -> usize {
        let size_block = self.cipher.size_block();
        // aead ciphers don't include the initial length field in encrypted blocks
        let len = 1 + payload_len + if self.cipher.is_aead() { 0 } else { SSH_LENGTH_SIZE };

        // round padding length upwards so that len is a multiple of block size
        let mut padlen = size_block - len % size_block;

        // need at least 4 bytes padding
        if padlen < SSH_MIN_PADLEN {
            padlen += size_block
        }

        // The minimum size of a packet is 16 (plus mac)
        if SSH_LENGTH_SIZE + 1 + payload_len + padlen < SSH_MIN_PACKET_SIZE {
            padlen += size_block;
        }
        padlen
    }

    fn encrypt(&mut self, payload: &[u8], out: &mut Vec<u8>, seq: u32) -> Result<usize> {
        let size_block = self.cipher.size_block();
        let size_integ = self.integ.size_out();
        let padlen = self.calc_encrypt_pad(payload.len());
        // len is everything except the MAC
        let len = SSH_LENGTH_SIZE + 1 + payload.len() + padlen;

        if self.cipher.is_aead() {
            debug_assert_eq!((len - SSH_LENGTH_SIZE) % size_block, 0);
        } else {
            debug_assert_eq!(len % size_block, 0);
        };

        let plen: u32 = (len - SSH_LENGTH_SIZE).try_into().map_err(|_| Error::NoRoom)?;

        let start = out.len();
        out.extend_from_slice(&plen.to_be_bytes());
        out.push(padlen as u8);
        out.extend_from_slice(payload);
        let pad_start = out.len();
        out.resize(pad_start + padlen, 0);
        random::fill_random(&mut out[pad_start..])?;
        out.resize(start + len + size_integ, 0);

        let (enc, mac) = out[start..].split_at_mut(len);

        match &self.integ {
            IntegKey::ChaPoly | IntegKey::NoInteg => {}
            IntegKey::HmacSha256(k) => {
                let mut h = HmacSha256::new_from_slice(k).trap()?;
                h.update(&seq.to_be_bytes());
                h.update(enc);
                mac.copy_from_slice(&h.finalize().into_bytes());
            }
            IntegKey::HmacSha512(k) => {
                let mut h = HmacSha512::new_from_slice(k).trap()?;
                h.update(&seq.to_be_bytes());
                h.update(enc);
                mac.copy_from_slice(&h.finalize().into_bytes());
            }
        }

        match &mut self.cipher {
            EncKey::ChaPoly(k) => k.encrypt(seq, enc, mac).trap()?,
            EncKey::Aes256Ctr(a) => a.apply_keystream(enc),
            EncKey::Aes128Ctr(a) => a.apply_keystream(enc),
            EncKey::NoCipher => {}
        }

        Ok(len + size_integ)
    }
}

/// Incoming cipher and MAC
#[derive(Debug)]
pub(crate) struct DecKeys {
    cipher: DecKey,
    integ: IntegKey,
}

impl DecKeys {
    fn cleartext() -> Self {
        Self { cipher: DecKey::NoCipher, integ: IntegKey::NoInteg }
    }

    /// Returns the total packet length. Depending on the cipher the
    /// first block may be left decrypted in `buf`, [`decrypt()`](Self::decrypt)
    /// handles the remainder.
    fn decrypt_first_block(&mut self, buf: &mut [u8], seq: u32) -> Result<usize> {
        let size_block = self.cipher.size_block();
        if buf.len() < size_block {
            return Err(Error::bug());
        }

        let len = match &mut self.cipher {
            DecKey::ChaPoly(k) => k.packet_length(seq, buf)?,
            DecKey::Aes256Ctr(a) => {
                a.apply_keystream(&mut buf[..size_block]);
                read_u32(buf)?
            }
            DecKey::Aes128Ctr(a) => {
                a.apply_keystream(&mut buf[..size_block]);
                read_u32(buf)?
            }
            DecKey::NoCipher => read_u32(buf)?,
        } as usize;

        if len > config::MAX_RX_PACKET_LEN {
            return Err(Error::BigPacket { size: len });
        }

        Ok(len + SSH_LENGTH_SIZE + self.integ.size_out())
    }

    fn decrypt(&mut self, buf: &mut [u8], seq: u32) -> Result<usize> {
        let size_block = self.cipher.size_block();
        let size_integ = self.integ.size_out();

        if buf.len() < size_block + size_integ {
            debug!("Bad packet, {} smaller than block size", buf.len());
            return Err(Error::SSHProtoError);
        }
        if buf.len() < SSH_MIN_PACKET_SIZE + size_integ {
            debug!("Bad packet, {} smaller than min packet size", buf.len());
            return Err(Error::SSHProtoError);
        }
        // "MUST be a multiple of the cipher block size".
        // encrypted length for aead ciphers doesn't include the length prefix.
        let sublength = if self.cipher.is_aead() { SSH_LENGTH_SIZE } else { 0 };
        let len = buf.len() - size_integ - sublength;

        if len % size_block != 0 {
            debug!("Bad packet, not multiple of block size");
            return Err(Error::SSHProtoError);
        }

        let (data, mac) = buf.split_at_mut(buf.len() - size_integ);

        match &mut self.cipher {
            DecKey::ChaPoly(k) => {
                k.decrypt(seq, data, mac).map_err(|_| {
                    info!("Packet integrity failed");
                    Error::BadDecrypt
                })?;
            }
            // first block was already done
            DecKey::Aes256Ctr(a) => a.apply_keystream(&mut data[size_block..]),
            DecKey::Aes128Ctr(a) => a.apply_keystream(&mut data[size_block..]),
            DecKey::NoCipher => {}
        }

        let mac_ok = match &self.integ {
            IntegKey::ChaPoly | IntegKey::NoInteg => true,
            IntegKey::HmacSha256(k) => {
                let mut h = HmacSha256::new_from_slice(k).trap()?;
                h.update(&seq.to_be_bytes());
                h.update(data);
                h.verify_slice(mac).is_ok()
            }
            IntegKey::HmacSha512(k) => {
                let mut h = HmacSha512::new_from_slice(k).trap()?;
                h.update(&seq.to_be_bytes());
                h.update(data);
                h.verify_slice(mac).is_ok()
            }
        };
        if !mac_ok {
            info!("Packet integrity failed");
            return Err(Error::BadDecrypt);
        }

        let padlen = data[SSH_LENGTH_SIZE] as usize;
        if padlen < SSH_MIN_PADLEN {
            debug!("Packet padding too short");
            return Err(Error::SSHProtoError);
        }

        let payload_len =
            buf.len().checked_sub(SSH_LENGTH_SIZE + 1 + size_integ + padlen).ok_or_else(|| {
                debug!("Bad padding length");
                Error::SSHProtoError
            })?;

        Ok(payload_len)
    }
}

fn read_u32(buf: &[u8]) -> Result<u32> {
    let b: [u8; 4] = buf.get(..SSH_LENGTH_SIZE).and_then(|b| b.try_into().ok()).trap()?;
    Ok(u32::from_be_bytes(b))
}

/// A negotiated cipher type prior to creating an [`EncKey`] or [`DecKey`],
/// for use during key setup in [`kex`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Cipher {
    ChaPoly,
    Aes256Ctr,
    Aes128Ctr,
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::ChaPoly => SSH_NAME_CHAPOLY,
            Self::Aes256Ctr => SSH_NAME_AES256_CTR,
            Self::Aes128Ctr => SSH_NAME_AES128_CTR,
        };
        write!(f, "{n}")
    }
}

impl Cipher {
    /// Creates a cipher key by algorithm name. Must be passed a known name.
    pub fn from_name(name: &'static str) -> Result<Self> {
        match name {
            SSH_NAME_CHAPOLY => Ok(Cipher::ChaPoly),
            SSH_NAME_AES256_CTR => Ok(Cipher::Aes256Ctr),
            SSH_NAME_AES128_CTR => Ok(Cipher::Aes128Ctr),
            _ => Err(Error::bug()),
        }
    }

    /// Length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            Cipher::ChaPoly => SSHChaPoly::KEY_LEN,
            Cipher::Aes256Ctr => aes::Aes256::key_size(),
            Cipher::Aes128Ctr => aes::Aes128::key_size(),
        }
    }

    /// Length in bytes
    pub fn iv_len(&self) -> usize {
        match self {
            Cipher::ChaPoly => 0,
            Cipher::Aes256Ctr => aes::Aes256::block_size(),
            Cipher::Aes128Ctr => aes::Aes128::block_size(),
        }
    }

    /// Returns the [`Integ`] for this cipher, or None if not aead
    pub fn integ(&self) -> Option<Integ> {
        match self {
            Cipher::ChaPoly => Some(Integ::ChaPoly),
            Cipher::Aes256Ctr | Cipher::Aes128Ctr => None,
        }
    }
}

pub(crate) enum EncKey {
    ChaPoly(SSHChaPoly),
    Aes256Ctr(Aes256Ctr),
    Aes128Ctr(Aes128Ctr),
    NoCipher,
}

impl Debug for EncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::ChaPoly(_) => "ChaPoly",
            Self::Aes256Ctr(_) => "Aes256Ctr",
            Self::Aes128Ctr(_) => "Aes128Ctr",
            Self::NoCipher => "NoCipher",
        };
        f.write_fmt(format_args!("EncKey::{n}"))
    }
}

impl EncKey {
    pub fn from_cipher(cipher: &Cipher, key: &[u8], iv: &[u8]) -> Result<Self> {
        match cipher {
            Cipher::ChaPoly => Ok(EncKey::ChaPoly(SSHChaPoly::new_from_slice(key).trap()?)),
            Cipher::Aes256Ctr => Ok(EncKey::Aes256Ctr(Aes256Ctr::new_from_slices(key, iv).trap()?)),
            Cipher::Aes128Ctr => Ok(EncKey::Aes128Ctr(Aes128Ctr::new_from_slices(key, iv).trap()?)),
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(self, EncKey::ChaPoly(_))
    }

    pub fn size_block(&self) -> usize {
        match self {
            EncKey::Aes256Ctr(_) => aes::Aes256::block_size(),
            EncKey::Aes128Ctr(_) => aes::Aes128::block_size(),
            EncKey::ChaPoly(_) | EncKey::NoCipher => SSH_MIN_BLOCK,
        }
    }
}

pub(crate) enum DecKey {
    ChaPoly(SSHChaPoly),
    Aes256Ctr(Aes256Ctr),
    Aes128Ctr(Aes128Ctr),
    NoCipher,
}

impl Debug for DecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::ChaPoly(_) => "ChaPoly",
            Self::Aes256Ctr(_) => "Aes256Ctr",
            Self::Aes128Ctr(_) => "Aes128Ctr",
            Self::NoCipher => "NoCipher",
        };
        f.write_fmt(format_args!("DecKey::{n}"))
    }
}

impl DecKey {
    pub fn from_cipher(cipher: &Cipher, key: &[u8], iv: &[u8]) -> Result<Self> {
        match cipher {
            Cipher::ChaPoly => Ok(DecKey::ChaPoly(SSHChaPoly::new_from_slice(key).trap()?)),
            Cipher::Aes256Ctr => Ok(DecKey::Aes256Ctr(Aes256Ctr::new_from_slices(key, iv).trap()?)),
            Cipher::Aes128Ctr => Ok(DecKey::Aes128Ctr(Aes128Ctr::new_from_slices(key, iv).trap()?)),
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(self, DecKey::ChaPoly(_))
    }

    pub fn size_block(&self) -> usize {
        match self {
            DecKey::Aes256Ctr(_) => aes::Aes256::block_size(),
            DecKey::Aes128Ctr(_) => aes::Aes128::block_size(),
            DecKey::ChaPoly(_) | DecKey::NoCipher => SSH_MIN_BLOCK,
        }
    }
}

/// A negotiated MAC type prior to keying. For use during key setup in [`kex`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Integ {
    ChaPoly,
    HmacSha256,
    HmacSha512,
}

impl Integ {
    /// Matches a MAC name. Not used for AEAD ciphers, see [`Cipher::integ()`]
    pub fn from_name(name: &'static str) -> Result<Self> {
        match name {
            SSH_NAME_HMAC_SHA256 => Ok(Integ::HmacSha256),
            SSH_NAME_HMAC_SHA512 => Ok(Integ::HmacSha512),
            _ => Err(Error::bug()),
        }
    }

    /// length in bytes
    fn key_len(&self) -> usize {
        match self {
            Integ::ChaPoly => 0,
            Integ::HmacSha256 => sha2::Sha256::output_size(),
            Integ::HmacSha512 => sha2::Sha512::output_size(),
        }
    }
}

impl fmt::Display for Integ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::ChaPoly => SSH_NAME_CHAPOLY,
            Self::HmacSha256 => SSH_NAME_HMAC_SHA256,
            Self::HmacSha512 => SSH_NAME_HMAC_SHA512,
        };
        write!(f, "{n}")
    }
}

pub(crate) enum IntegKey {
    ChaPoly,
    HmacSha256([u8; 32]),
    HmacSha512([u8; 64]),
    NoInteg,
}

impl Drop for IntegKey {
    fn drop(&mut self) {
        match self {
            IntegKey::HmacSha256(k) => k.zeroize(),
            IntegKey::HmacSha512(k) => k.zeroize(),
            IntegKey::ChaPoly | IntegKey::NoInteg => (),
        }
    }
}

impl Debug for IntegKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::ChaPoly => "ChaPoly",
            Self::HmacSha256(_) => "HmacSha256",
            Self::HmacSha512(_) => "HmacSha512",
            Self::NoInteg => "NoInteg",
        };
        f.write_fmt(format_args!("IntegKey::{n}"))
    }
}

impl IntegKey {
    pub fn from_integ(integ: &Integ, key: &[u8]) -> Result<Self> {
        match integ {
            Integ::ChaPoly => Ok(IntegKey::ChaPoly),
            Integ::HmacSha256 => Ok(IntegKey::HmacSha256(key.try_into().trap()?)),
            Integ::HmacSha512 => Ok(IntegKey::HmacSha512(key.try_into().trap()?)),
        }
    }

    pub fn size_out(&self) -> usize {
        match self {
            IntegKey::ChaPoly => SSHChaPoly::TAG_LEN,
            IntegKey::HmacSha256(_) => sha2::Sha256::output_size(),
            IntegKey::HmacSha512(_) => sha2::Sha512::output_size(),
            IntegKey::NoInteg => 0,
        }
    }
}
