#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use digest::KeyInit;
use poly1305::Poly1305;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encrypt::SSH_LENGTH_SIZE;

/// `chacha20-poly1305@openssh.com` authenticated cipher
///
/// The packet length is encrypted separately with `header_key`, so that
/// it can be read before the whole packet has arrived.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SSHChaPoly {
    header_key: [u8; 32],
    main_key: [u8; 32],
}

// Payload keystream starts at block 1, block 0 is the poly1305 key
const PAYLOAD_BLOCK_OFFSET: u32 = 64;

impl SSHChaPoly {
    pub const TAG_LEN: usize = 16;
    pub const KEY_LEN: usize = 64;

    /// `key` must be 64 bytes. The second half is the header key.
    pub fn new_from_slice(key: &[u8]) -> Result<Self> {
        if key.len() != Self::KEY_LEN {
            return Err(Error::BadKey);
        }
        let (main, header) = key.split_at(32);
        let mut s = Self { header_key: [0u8; 32], main_key: [0u8; 32] };
        s.main_key.copy_from_slice(main);
        s.header_key.copy_from_slice(header);
        Ok(s)
    }

    // The sequence number is the 64 bit nonce of the original chacha20,
    // which lands in the last 4 bytes of the IETF nonce.
    fn stream(key: &[u8; 32], seq: u32) -> ChaCha20 {
        let mut nonce = [0u8; 12];
        nonce[8..].copy_from_slice(&seq.to_be_bytes());
        ChaCha20::new(key.into(), (&nonce).into())
    }

    fn tag(c: &mut ChaCha20, msg: &[u8]) -> poly1305::Tag {
        let mut poly_key = [0u8; 32];
        c.seek(0u32);
        c.apply_keystream(&mut poly_key);
        // compute_unpadded() adds the necessary trailing 1 byte when padding output
        let tag = Poly1305::new((&poly_key).into()).compute_unpadded(msg);
        poly_key.zeroize();
        tag
    }

    /// Decrypts the packet length.
    ///
    /// `buf` must be at least 4 bytes, extra data is ignored.
    pub fn packet_length(&self, seq: u32, buf: &[u8]) -> Result<u32> {
        let mut b: [u8; SSH_LENGTH_SIZE] = buf
            .get(..SSH_LENGTH_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(Error::BadDecrypt)?;
        Self::stream(&self.header_key, seq).apply_keystream(&mut b);
        Ok(u32::from_be_bytes(b))
    }

    /// Validates the MAC then decrypts in-place.
    ///
    /// `msg` includes the still-encrypted length.
    pub fn decrypt(&self, seq: u32, msg: &mut [u8], mac: &[u8]) -> Result<()> {
        if msg.len() < SSH_LENGTH_SIZE || mac.len() != Self::TAG_LEN {
            return Err(Error::BadDecrypt);
        }

        let mut c = Self::stream(&self.main_key, seq);
        let tag = Self::tag(&mut c, msg);
        if !bool::from(tag.as_slice().ct_eq(mac)) {
            return Err(Error::BadDecrypt);
        }

        let (len, payload) = msg.split_at_mut(SSH_LENGTH_SIZE);
        Self::stream(&self.header_key, seq).apply_keystream(len);
        c.seek(PAYLOAD_BLOCK_OFFSET);
        c.apply_keystream(payload);
        Ok(())
    }

    /// Encrypt in-place, including length, payload, MAC.
    ///
    /// The first 4 bytes of `msg` are overwritten with the length.
    pub fn encrypt(&self, seq: u32, msg: &mut [u8], mac: &mut [u8]) -> Result<()> {
        if msg.len() < SSH_LENGTH_SIZE || mac.len() != Self::TAG_LEN {
            return Err(Error::bug());
        }

        let l = (msg.len() - SSH_LENGTH_SIZE) as u32;
        let (len, payload) = msg.split_at_mut(SSH_LENGTH_SIZE);
        len.copy_from_slice(&l.to_be_bytes());
        Self::stream(&self.header_key, seq).apply_keystream(len);

        let mut c = Self::stream(&self.main_key, seq);
        c.seek(PAYLOAD_BLOCK_OFFSET);
        c.apply_keystream(payload);

        let tag = Self::tag(&mut c, msg);
        mac.copy_from_slice(tag.as_slice());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::dusklog::init_test_log;
    use crate::ssh_chapoly::*;

    fn key() -> SSHChaPoly {
        let k: Vec<u8> = (0..64).collect();
        SSHChaPoly::new_from_slice(&k).unwrap()
    }

    #[test]
    fn seal_open() {
        init_test_log();
        let c = key();
        let plain = b"\0\0\0\0\x04hello there pad".to_vec();
        let mut msg = plain.clone();
        let mut mac = [0u8; SSHChaPoly::TAG_LEN];
        c.encrypt(7, &mut msg, &mut mac).unwrap();
        assert_ne!(msg, plain);

        let len = c.packet_length(7, &msg).unwrap();
        assert_eq!(len as usize, plain.len() - 4);

        c.decrypt(7, &mut msg, &mac).unwrap();
        assert_eq!(msg[4..], plain[4..]);
        assert_eq!(msg[..4], (len).to_be_bytes());
    }

    #[test]
    fn tamper() {
        init_test_log();
        let c = key();
        let mut msg = vec![0u8; 36];
        let mut mac = [0u8; SSHChaPoly::TAG_LEN];
        c.encrypt(1, &mut msg, &mut mac).unwrap();

        let mut m2 = msg.clone();
        m2[20] ^= 1;
        assert!(matches!(c.decrypt(1, &mut m2, &mac), Err(Error::BadDecrypt)));
        // wrong sequence number
        let mut m3 = msg.clone();
        assert!(matches!(c.decrypt(2, &mut m3, &mac), Err(Error::BadDecrypt)));
        c.decrypt(1, &mut msg, &mac).unwrap();
    }

    #[test]
    fn bad_key_len() {
        assert!(SSHChaPoly::new_from_slice(&[0u8; 32]).is_err());
    }
}
