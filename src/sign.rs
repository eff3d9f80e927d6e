//! Host key and user key signatures.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::mem::discriminant;

use signature::{Signer, Verifier};

use crate::*;
use packets::{Ed25519PubKey, ParseContext, PubKey, Signature};
use sshnames::*;
use sshwire::{BinString, SSHEncode};

#[cfg(feature = "rsa")]
use packets::RSAPubKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigType {
    Ed25519,
    RSA256,
    RSA512,
}

impl SigType {
    /// Must be a valid name
    pub fn from_name(name: &'static str) -> Result<Self> {
        match name {
            SSH_NAME_ED25519 => Ok(SigType::Ed25519),
            SSH_NAME_RSA_SHA256 => Ok(SigType::RSA256),
            SSH_NAME_RSA_SHA512 => Ok(SigType::RSA512),
            _ => Err(Error::bug()),
        }
    }

    /// Returns a valid name
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            SigType::Ed25519 => SSH_NAME_ED25519,
            SigType::RSA256 => SSH_NAME_RSA_SHA256,
            SigType::RSA512 => SSH_NAME_RSA_SHA512,
        }
    }

    /// Returns `Ok(())` on success
    pub fn verify(
        &self,
        pubkey: &PubKey,
        msg: &impl SSHEncode,
        sig: &Signature,
        parse_ctx: Option<&ParseContext>,
    ) -> Result<()> {
        // Check that the signature type is known
        let sig_type = sig.sig_type().map_err(|_| Error::BadSig)?;

        // `self` is the expected signature type from kex/auth packet
        if discriminant(&sig_type) != discriminant(self) {
            warn!("Received {:?} signature, expecting {}", sig.algorithm_name(), self.algorithm_name());
            return Err(Error::BadSig);
        }

        let m = sshwire::ssh_vec(msg, parse_ctx)?;

        match (self, pubkey, sig) {
            (SigType::Ed25519, PubKey::Ed25519(k), Signature::Ed25519(s)) => {
                let k: ed25519_dalek::VerifyingKey = k.try_into()?;
                let s: [u8; 64] = s.sig.0.as_slice().try_into().map_err(|_| Error::BadSig)?;
                let s = ed25519_dalek::Signature::from_bytes(&s);
                k.verify(&m, &s).map_err(|_| Error::BadSig)
            }

            #[cfg(feature = "rsa")]
            (SigType::RSA256, PubKey::RSA(k), Signature::RSA256(s)) => {
                let k: rsa::RsaPublicKey = k.try_into()?;
                let v = rsa::pkcs1v15::VerifyingKey::<sha2::Sha256>::new(k);
                let s = rsa::pkcs1v15::Signature::try_from(s.sig.0.as_slice()).map_err(|_| Error::BadSig)?;
                v.verify(&m, &s).map_err(|e| {
                    trace!("RSA signature failed: {e}");
                    Error::BadSig
                })
            }

            #[cfg(feature = "rsa")]
            (SigType::RSA512, PubKey::RSA(k), Signature::RSA512(s)) => {
                let k: rsa::RsaPublicKey = k.try_into()?;
                let v = rsa::pkcs1v15::VerifyingKey::<sha2::Sha512>::new(k);
                let s = rsa::pkcs1v15::Signature::try_from(s.sig.0.as_slice()).map_err(|_| Error::BadSig)?;
                v.verify(&m, &s).map_err(|e| {
                    trace!("RSA signature failed: {e}");
                    Error::BadSig
                })
            }

            _ => {
                warn!(
                    "Signature \"{:?}\" doesn't match key type \"{:?}\"",
                    sig.algorithm_name(),
                    pubkey.algorithm_name(),
                );
                Err(Error::BadSig)
            }
        }
    }
}

/// A signature we created, raw bytes
#[derive(Debug, Clone)]
pub(crate) enum OwnedSig {
    Ed25519([u8; 64]),
    RSA256(Vec<u8>),
    RSA512(Vec<u8>),
}

/// Signing key types.
#[derive(Debug, Clone, Copy)]
pub enum KeyType {
    Ed25519,
    /// RSA with a modulus size in bits
    #[cfg(feature = "rsa")]
    RSA(usize),
}

/// A SSH signing key, used for host keys and user authentication.
///
/// Private key material is zeroized on drop by the underlying key types.
#[derive(Clone)]
pub enum SignKey {
    Ed25519(ed25519_dalek::SigningKey),
    #[cfg(feature = "rsa")]
    RSA(rsa::RsaPrivateKey),
}

impl SignKey {
    pub fn generate(ty: KeyType) -> Result<Self> {
        match ty {
            KeyType::Ed25519 => Ok(Self::Ed25519(ed25519_dalek::SigningKey::generate(&mut random::rng()))),
            #[cfg(feature = "rsa")]
            KeyType::RSA(bits) => {
                let k = rsa::RsaPrivateKey::new(&mut random::rng(), bits).map_err(|e| {
                    debug!("RSA generation failed: {e}");
                    Error::msg("RSA generation failed")
                })?;
                Ok(Self::RSA(k))
            }
        }
    }

    /// An ed25519 key from its 32 byte secret seed
    pub fn from_ed25519_seed(seed: &[u8; 32]) -> Self {
        Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(seed))
    }

    pub fn pubkey(&self) -> PubKey {
        match self {
            SignKey::Ed25519(k) => {
                PubKey::Ed25519(Ed25519PubKey { key: BinString(k.verifying_key().as_bytes().to_vec()) })
            }
            #[cfg(feature = "rsa")]
            SignKey::RSA(k) => {
                use rsa::traits::PublicKeyParts;
                PubKey::RSA(RSAPubKey {
                    e: BinString(sshwire::mpint_bytes(&k.e().to_bytes_be())),
                    n: BinString(sshwire::mpint_bytes(&k.n().to_bytes_be())),
                })
            }
        }
    }

    #[cfg(feature = "openssh-key")]
    pub fn from_openssh(k: impl AsRef<[u8]>) -> Result<Self> {
        let k = ssh_key::PrivateKey::from_openssh(k).map_err(|_| Error::msg("Unsupported OpenSSH key"))?;

        k.try_into()
    }

    /// Returns whether this `SignKey` can create a given signature type
    pub(crate) fn can_sign(&self, sig_type: SigType) -> bool {
        match self {
            SignKey::Ed25519(_) => matches!(sig_type, SigType::Ed25519),
            #[cfg(feature = "rsa")]
            SignKey::RSA(_) => matches!(sig_type, SigType::RSA256 | SigType::RSA512),
        }
    }

    /// Signs with the default signature type for the key
    pub(crate) fn sign(&self, msg: &impl SSHEncode, parse_ctx: Option<&ParseContext>) -> Result<OwnedSig> {
        let sig_type = match self {
            SignKey::Ed25519(_) => SigType::Ed25519,
            #[cfg(feature = "rsa")]
            SignKey::RSA(_) => SigType::RSA256,
        };
        self.sign_as(sig_type, msg, parse_ctx)
    }

    pub(crate) fn sign_as(
        &self,
        sig_type: SigType,
        msg: &impl SSHEncode,
        parse_ctx: Option<&ParseContext>,
    ) -> Result<OwnedSig> {
        if !self.can_sign(sig_type) {
            return Err(Error::bug_err_msg("Wrong signature type for key"));
        }
        let m = sshwire::ssh_vec(msg, parse_ctx)?;

        let sig = match self {
            SignKey::Ed25519(k) => OwnedSig::Ed25519(k.sign(&m).to_bytes()),
            #[cfg(feature = "rsa")]
            SignKey::RSA(k) => {
                use signature::SignatureEncoding;
                if sig_type == SigType::RSA512 {
                    let s = rsa::pkcs1v15::SigningKey::<sha2::Sha512>::new(k.clone());
                    OwnedSig::RSA512(s.sign(&m).to_vec())
                } else {
                    let s = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(k.clone());
                    OwnedSig::RSA256(s.sign(&m).to_vec())
                }
            }
        };

        {
            // Faults in signing can expose the private key. We verify the signature
            // just created to avoid this problem.
            let vsig: Signature = (&sig).into();
            sig_type.verify(&self.pubkey(), msg, &vsig, parse_ctx)?;
        }

        Ok(sig)
    }
}

impl core::fmt::Debug for SignKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            SignKey::Ed25519(_) => "Ed25519",
            #[cfg(feature = "rsa")]
            SignKey::RSA(_) => "RSA",
        };
        f.debug_struct("SignKey").field(s, &"...").finish()
    }
}

#[cfg(feature = "openssh-key")]
impl TryFrom<ssh_key::PrivateKey> for SignKey {
    type Error = Error;
    fn try_from(k: ssh_key::PrivateKey) -> Result<Self> {
        match k.key_data() {
            ssh_key::private::KeypairData::Ed25519(k) => Ok(Self::from_ed25519_seed(&k.private.to_bytes())),
            _ => Err(Error::NotAvailable { what: k.algorithm().as_str() }),
        }
    }
}
