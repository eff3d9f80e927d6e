//! Key exchange and algorithm negotiation, RFC4253 sections 7 and 8.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use digest::Digest;
use pretty_hex::PrettyHex;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::*;
use behaviour::HostKeyVerifier;
use encrypt::{Cipher, DecKeys, Integ};
use namelist::{LocalNames, NameList};
use packets::{Packet, PubKey, Signature};
use sign::{SigType, SignKey};
use sshnames::*;
use sshwire::{hash_mpint, hash_ser, hash_ser_length, BinString, Blob};
use traffic::TrafSend;

// both exchange methods use sha256
const MAX_SESSID: usize = 32;
pub type SessId = heapless::Vec<u8, MAX_SESSID>;

const KNOWN_KEX: &[&str] = &[
    SSH_NAME_CURVE25519,
    SSH_NAME_CURVE25519_LIBSSH,
    #[cfg(feature = "rsa")]
    SSH_NAME_DH_GROUP14_SHA256,
];

const KNOWN_HOSTSIG: &[&str] = &[
    SSH_NAME_ED25519,
    #[cfg(feature = "rsa")]
    SSH_NAME_RSA_SHA512,
    #[cfg(feature = "rsa")]
    SSH_NAME_RSA_SHA256,
];

const KNOWN_CIPHER: &[&str] = &[SSH_NAME_CHAPOLY, SSH_NAME_AES256_CTR, SSH_NAME_AES128_CTR];
const KNOWN_MAC: &[&str] = &[SSH_NAME_HMAC_SHA256, SSH_NAME_HMAC_SHA512];
const KNOWN_COMP: &[&str] = &[SSH_NAME_NONE];

/// Algorithm preferences, most preferred first.
///
/// Only names this crate implements may be listed, checked by
/// [`validate()`](Self::validate).
#[derive(Debug, Clone)]
pub struct AlgoConfig {
    pub kexs: LocalNames,
    pub hostsig: LocalNames,
    pub ciphers: LocalNames,
    pub macs: LocalNames,
    pub comps: LocalNames,
}

impl Default for AlgoConfig {
    fn default() -> Self {
        // Each list is shorter than MAX_LOCAL_NAMES, checked by a test.
        let l = |n: &[&'static str]| LocalNames::try_from(n).unwrap_or_default();
        AlgoConfig {
            kexs: l(KNOWN_KEX),
            hostsig: l(KNOWN_HOSTSIG),
            ciphers: l(KNOWN_CIPHER),
            macs: l(KNOWN_MAC),
            comps: l(KNOWN_COMP),
        }
    }
}

impl AlgoConfig {
    pub fn validate(&self) -> Result<()> {
        let lists = [
            (&self.kexs, KNOWN_KEX, "kex"),
            (&self.hostsig, KNOWN_HOSTSIG, "hostkey"),
            (&self.ciphers, KNOWN_CIPHER, "encryption"),
            (&self.macs, KNOWN_MAC, "mac"),
            (&self.comps, KNOWN_COMP, "compression"),
        ];
        for (list, known, what) in lists {
            if list.0.is_empty() {
                debug!("Empty {what} list");
                return Err(Error::bad_usage("Empty algorithm list"));
            }
            if let Some(n) = list.0.iter().find(|n| !known.contains(*n)) {
                debug!("Unsupported {what} algorithm {n}");
                return Err(Error::bad_usage("Unsupported algorithm"));
            }
        }
        // room for the strict-kex marker
        if self.kexs.0.is_full() {
            return Err(Error::bad_usage("Too many kex algorithms"));
        }
        Ok(())
    }
}

/// Inputs to a key exchange that come from the connection's setup
pub(crate) struct KexParams<'a> {
    pub conf: &'a AlgoConfig,
    pub is_client: bool,
    /// Advertise strict kex
    pub strict: bool,
    pub our_version: &'a str,
    /// Server host keys. Limits the signature algorithms offered.
    pub hostkeys: &'a [SignKey],
}

impl KexParams<'_> {
    fn hostsig(&self) -> Result<LocalNames> {
        if self.is_client {
            return Ok(self.conf.hostsig.clone());
        }
        let mut l = LocalNames::new();
        for &n in self.conf.hostsig.0.iter() {
            let t = SigType::from_name(n)?;
            if self.hostkeys.iter().any(|k| k.can_sign(t)) {
                l.0.push(n).trap()?;
            }
        }
        if l.0.is_empty() {
            return Err(Error::bad_usage("No usable host key"));
        }
        Ok(l)
    }

    fn kexs(&self) -> Result<LocalNames> {
        let mut l = self.conf.kexs.clone();
        if self.strict {
            let marker = if self.is_client { SSH_NAME_STRICT_KEX_C } else { SSH_NAME_STRICT_KEX_S };
            l.0.push(marker).map_err(|_| Error::bad_usage("Too many kex algorithms"))?;
        }
        Ok(l)
    }
}

/// The current state of the Kex
#[derive(Debug)]
pub(crate) enum Kex {
    /// No key exchange in progress
    Idle,

    /// Have sent a KexInit, waiting for the peer's.
    KexInit {
        /// Our KexInit payload, for the exchange hash
        our_kexinit: Vec<u8>,
    },

    /// Waiting for KexDHInit (server) or KexDHReply (client)
    KexDH { algos: Algos, kex_hash: KexHash },

    /// Our NewKeys is sent, waiting for the peer's.
    NewKeys { dec: DecKeys, strict: bool },

    /// A transient state used internally to transition between other states.
    /// A proper state will be set before returning, unless an error occurs.
    Taken,
}

impl Kex {
    pub fn new() -> Self {
        Kex::Idle
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Kex::Idle)
    }

    /// Whether the peer's KexInit has been received and its NewKeys hasn't.
    ///
    /// Only key exchange packets may arrive from the peer in this time.
    pub fn peer_in_kex(&self) -> bool {
        matches!(self, Kex::KexDH { .. } | Kex::NewKeys { .. })
    }

    /// The current exchange negotiated strict kex
    pub fn is_strict(&self) -> bool {
        match self {
            Kex::KexDH { algos, .. } => algos.strict_kex,
            Kex::NewKeys { strict, .. } => *strict,
            _ => false,
        }
    }

    /// Returns true if the packet should be dropped, when the peer
    /// sent a wrong first_kex_packet_follows guess.
    pub fn discard_guess(&mut self) -> bool {
        if let Kex::KexDH { algos, .. } = self {
            core::mem::take(&mut algos.discard_next)
        } else {
            false
        }
    }

    fn take(&mut self) -> Self {
        core::mem::replace(self, Kex::Taken)
    }

    /// Sends our KexInit and holds further outbound non-kex packets.
    pub fn send_kexinit(&mut self, params: &KexParams, s: &mut TrafSend) -> Result<()> {
        if !self.is_idle() {
            return Err(Error::bug_err_msg("kexinit while not idle"));
        }
        let p: Packet = Self::make_kexinit(params)?.into();
        let our_kexinit = sshwire::ssh_vec(&p, None)?;
        s.send(p)?;
        s.start_hold();
        *self = Kex::KexInit { our_kexinit };
        Ok(())
    }

    fn make_kexinit(params: &KexParams) -> Result<packets::KexInit> {
        let mut cookie = [0u8; 16];
        random::fill_random(&mut cookie)?;
        let conf = params.conf;
        Ok(packets::KexInit {
            cookie,
            kex: (&params.kexs()?).into(),
            hostsig: (&params.hostsig()?).into(),
            cipher_c2s: (&conf.ciphers).into(),
            cipher_s2c: (&conf.ciphers).into(),
            mac_c2s: (&conf.macs).into(),
            mac_s2c: (&conf.macs).into(),
            comp_c2s: (&conf.comps).into(),
            comp_s2c: (&conf.comps).into(),
            lang_c2s: NameList::empty(),
            lang_s2c: NameList::empty(),
            first_follows: false,
            reserved: 0,
        })
    }

    /// Handles the peer's KexInit. `payload` is the raw packet for hashing,
    /// `seq` its sequence number.
    pub fn handle_kexinit(
        &mut self,
        p: &packets::KexInit,
        payload: &[u8],
        seq: u32,
        first_kex: bool,
        params: &KexParams,
        remote_version: &str,
        s: &mut TrafSend,
    ) -> Result<()> {
        if self.is_idle() {
            // The peer started a (re)kex, we reply in kind
            self.send_kexinit(params, s)?;
        }

        let our_kexinit = match self.take() {
            Kex::KexInit { our_kexinit } => our_kexinit,
            _ => {
                debug!("Unexpected KexInit");
                return Err(Error::PacketWrong);
            }
        };

        let algos = Self::algo_negotiation(p, params)?;
        debug!("{algos}");

        if first_kex && algos.strict_kex && seq != 0 {
            info!("Strict kex: KexInit wasn't the first packet");
            return Err(Error::SSHProtoError);
        }

        let kex_hash = KexHash::new(params, remote_version, &our_kexinit, payload)?;

        if params.is_client {
            let q_c = BinString(algos.kex.pubkey().to_vec());
            s.send(packets::KexDHInit { q_c })?;
        }

        *self = Kex::KexDH { algos, kex_hash };
        Ok(())
    }

    fn algo_negotiation(p: &packets::KexInit, params: &KexParams) -> Result<Algos> {
        let is_client = params.is_client;
        let conf = params.conf;

        // For each algorithm we select the first name in the client's
        // list that is also present in the server's list.
        let kex_method =
            p.kex.first_match(is_client, &conf.kexs)?.ok_or(Error::AlgoNoMatch { algo: "kex" })?;
        let kex = SharedSecret::from_name(kex_method)?;
        let goodguess_kex = p.kex.first() == conf.kexs.first();

        // We always send strict-kex when enabled, so just check the other's list
        let other_strict = if is_client { SSH_NAME_STRICT_KEX_S } else { SSH_NAME_STRICT_KEX_C };
        let strict_kex = params.strict && p.kex.has_algo(other_strict)?;

        let our_hostsig = params.hostsig()?;
        let hostsig_method = p
            .hostsig
            .first_match(is_client, &our_hostsig)?
            .ok_or(Error::AlgoNoMatch { algo: "hostkey" })?;
        let hostsig = SigType::from_name(hostsig_method)?;
        let goodguess_hostkey = p.hostsig.first() == our_hostsig.first();

        // Switch between client/server tx/rx
        let c2s = (&p.cipher_c2s, &p.mac_c2s, &p.comp_c2s);
        let s2c = (&p.cipher_s2c, &p.mac_s2c, &p.comp_s2c);
        let ((cipher_tx, mac_tx, comp_tx), (cipher_rx, mac_rx, comp_rx)) =
            if is_client { (c2s, s2c) } else { (s2c, c2s) };

        let n = cipher_tx
            .first_match(is_client, &conf.ciphers)?
            .ok_or(Error::AlgoNoMatch { algo: "encryption" })?;
        let cipher_enc = Cipher::from_name(n)?;
        let n = cipher_rx
            .first_match(is_client, &conf.ciphers)?
            .ok_or(Error::AlgoNoMatch { algo: "encryption" })?;
        let cipher_dec = Cipher::from_name(n)?;

        // mac algorithms are ignored for AEAD ciphers
        let integ_enc = if let Some(integ) = cipher_enc.integ() {
            integ
        } else {
            let n = mac_tx.first_match(is_client, &conf.macs)?.ok_or(Error::AlgoNoMatch { algo: "mac" })?;
            Integ::from_name(n)?
        };
        let integ_dec = if let Some(integ) = cipher_dec.integ() {
            integ
        } else {
            let n = mac_rx.first_match(is_client, &conf.macs)?.ok_or(Error::AlgoNoMatch { algo: "mac" })?;
            Integ::from_name(n)?
        };

        // Compression only matches "none"
        comp_tx.first_match(is_client, &conf.comps)?.ok_or(Error::AlgoNoMatch { algo: "compression" })?;
        comp_rx.first_match(is_client, &conf.comps)?.ok_or(Error::AlgoNoMatch { algo: "compression" })?;

        // Language fields are ignored

        let discard_next = p.first_follows && !(goodguess_kex && goodguess_hostkey);

        Ok(Algos {
            kex,
            hostsig,
            cipher_enc,
            cipher_dec,
            integ_enc,
            integ_dec,
            discard_next,
            is_client,
            strict_kex,
        })
    }

    /// Server only. Replies with our ephemeral value and a host key signature,
    /// then sends NewKeys.
    pub fn handle_kexdhinit(
        &mut self,
        p: &packets::KexDHInit,
        hostkeys: &[SignKey],
        sess_id: &mut Option<SessId>,
        s: &mut TrafSend,
    ) -> Result<()> {
        let (mut algos, mut kex_hash) = match self.take() {
            Kex::KexDH { algos, kex_hash } if !algos.is_client => (algos, kex_hash),
            _ => return Err(Error::PacketWrong),
        };

        // hostkeys list must contain the signature type, checked when offering
        let hostkey = hostkeys
            .iter()
            .find(|k| k.can_sign(algos.hostsig))
            .ok_or(Error::bad_usage("No host key for signature type"))?;

        let q_s = algos.kex.pubkey().to_vec();
        kex_hash.prefinish(&hostkey.pubkey(), &p.q_c.0, &q_s, &algos.kex)?;
        let k = algos.kex.secret(&p.q_c.0)?;
        let ko = KexOutput::new(&k, kex_hash);

        trace!("sign kexreply h {:?}", ko.h.as_slice().hex_dump());
        let sig = hostkey.sign_as(algos.hostsig, &ko.h.as_slice(), None)?;
        let sig: Signature = (&sig).into();
        s.send(packets::KexDHReply { k_s: Blob(hostkey.pubkey()), q_s: BinString(q_s), sig: Blob(sig) })?;

        self.send_newkeys(ko, algos, sess_id, s)
    }

    /// Client only. Verifies the server's signature and host key,
    /// then sends NewKeys.
    pub fn handle_kexdhreply(
        &mut self,
        p: &packets::KexDHReply,
        verifier: &mut dyn HostKeyVerifier,
        sess_id: &mut Option<SessId>,
        s: &mut TrafSend,
    ) -> Result<()> {
        let (mut algos, mut kex_hash) = match self.take() {
            Kex::KexDH { algos, kex_hash } if algos.is_client => (algos, kex_hash),
            _ => return Err(Error::PacketWrong),
        };

        let q_c = algos.kex.pubkey().to_vec();
        kex_hash.prefinish(&p.k_s.0, &q_c, &p.q_s.0, &algos.kex)?;
        let k = algos.kex.secret(&p.q_s.0)?;
        let ko = KexOutput::new(&k, kex_hash);

        trace!("verify h {:?}", ko.h.as_slice().hex_dump());
        algos.hostsig.verify(&p.k_s.0, &ko.h.as_slice(), &p.sig.0, None)?;
        debug!("Hostkey signature is valid");
        if !verifier.verify(&p.k_s.0) {
            info!("Host key rejected");
            return Err(Error::HostKeyRejected);
        }

        self.send_newkeys(ko, algos, sess_id, s)
    }

    fn send_newkeys(
        &mut self,
        ko: KexOutput,
        algos: Algos,
        sess_id: &mut Option<SessId>,
        s: &mut TrafSend,
    ) -> Result<()> {
        // The first exchange hash is the session identifier for the connection
        let sid = sess_id.get_or_insert_with(|| ko.h.clone());
        let (enc, dec) = encrypt::derive_keys(&ko, sid, &algos)?;
        s.send_newkeys(enc, algos.strict_kex)?;
        *self = Kex::NewKeys { dec, strict: algos.strict_kex };
        Ok(())
    }

    /// The peer's NewKeys, incoming keys are switched. Completes the exchange.
    pub fn handle_newkeys(&mut self, s: &mut TrafSend) -> Result<()> {
        match self.take() {
            Kex::NewKeys { dec, strict } => {
                s.rekey_dec(dec, strict);
                *self = Kex::Idle;
                Ok(())
            }
            _ => Err(Error::PacketWrong),
        }
    }
}

/// The algorithms negotiated for one exchange
#[derive(Debug)]
pub(crate) struct Algos {
    pub kex: SharedSecret,
    pub hostsig: SigType,
    pub cipher_enc: Cipher,
    pub cipher_dec: Cipher,
    pub integ_enc: Integ,
    pub integ_dec: Integ,

    /// The peer sent a wrong first_kex_packet_follows guess
    pub discard_next: bool,

    pub is_client: bool,

    pub strict_kex: bool,
}

impl fmt::Display for Algos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (cc, cs, mc, ms) = if self.is_client {
            (&self.cipher_enc, &self.cipher_dec, &self.integ_enc, &self.integ_dec)
        } else {
            (&self.cipher_dec, &self.cipher_enc, &self.integ_dec, &self.integ_enc)
        };

        write!(
            f,
            "Negotiated algorithms {{\nkex {}\nhostkey {}\ncipher c->s {}\ncipher s->c {}\nmac c->s {}\nmac s->c {}\n}}",
            self.kex,
            self.hostsig.algorithm_name(),
            cc,
            cs,
            mc,
            ms
        )
    }
}

/// Running hash of the exchange, RFC4253 section 8
pub(crate) struct KexHash {
    hash_ctx: Sha256,
}

impl fmt::Debug for KexHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KexHash").finish_non_exhaustive()
    }
}

impl KexHash {
    fn new(params: &KexParams, remote_version: &str, our_kexinit: &[u8], their_kexinit: &[u8]) -> Result<Self> {
        let mut kh = KexHash { hash_ctx: Sha256::new() };

        let (v_c, v_s, i_c, i_s) = if params.is_client {
            (params.our_version, remote_version, our_kexinit, their_kexinit)
        } else {
            (remote_version, params.our_version, their_kexinit, our_kexinit)
        };
        hash_ser(&mut kh.hash_ctx, &v_c, None)?;
        hash_ser(&mut kh.hash_ctx, &v_s, None)?;
        kh.hash_string(i_c);
        kh.hash_string(i_s);
        Ok(kh)
    }

    fn hash_string(&mut self, b: &[u8]) {
        self.hash_ctx.update((b.len() as u32).to_be_bytes());
        self.hash_ctx.update(b);
    }

    /// Hashes the host key and both ephemeral values
    fn prefinish(&mut self, k_s: &PubKey, q_c: &[u8], q_s: &[u8], kex: &SharedSecret) -> Result<()> {
        hash_ser_length(&mut self.hash_ctx, k_s)?;
        if kex.values_are_mpint() {
            hash_mpint(&mut self.hash_ctx, q_c);
            hash_mpint(&mut self.hash_ctx, q_s);
        } else {
            self.hash_string(q_c);
            self.hash_string(q_s);
        }
        Ok(())
    }

    fn finish(mut self, k: &[u8]) -> SessId {
        hash_mpint(&mut self.hash_ctx, k);
        let mut h = SessId::new();
        // sha256 output is always MAX_SESSID
        let _ = h.extend_from_slice(&self.hash_ctx.finalize());
        h
    }
}

/// Output of a completed exchange, used for deriving keys.
pub(crate) struct KexOutput {
    /// `H` for this exchange, conn takes the first as sess_id
    pub h: SessId,
    /// A digest instance that has already hashed `K || H` (see rfc4253).
    partial_hash: Sha256,
}

impl fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KexOutput").finish_non_exhaustive()
    }
}

impl KexOutput {
    fn new(k: &[u8], kex_hash: KexHash) -> Self {
        let h = kex_hash.finish(k);
        Self::from_parts(k, h)
    }

    fn from_parts(k: &[u8], h: SessId) -> Self {
        let mut partial_hash = Sha256::new();
        hash_mpint(&mut partial_hash, k);
        partial_hash.update(h.as_slice());
        KexOutput { h, partial_hash }
    }

    /// Constructor from a direct exchange hash
    #[cfg(test)]
    pub fn new_test(k: &[u8], h: &SessId) -> Self {
        Self::from_parts(k, h.clone())
    }

    /// RFC4253 7.2. `K1 = HASH(K || H || "A" || session_id)` etc,
    /// extended with `K2 = HASH(K || H || K1)`.
    pub fn compute_key<'a>(&self, letter: char, len: usize, out: &'a mut [u8], sess_id: &SessId) -> Result<&'a [u8]> {
        let hsz = <Sha256 as Digest>::output_size();
        // two rounds is sufficient with sha256 and the largest key
        if len > out.len() || len > 2 * hsz {
            return Err(Error::bug());
        }

        let l = len.min(hsz);
        let (k1, rest) = out.split_at_mut(l);
        let (k2, _) = rest.split_at_mut(len - l);

        let mut hash_ctx = self.partial_hash.clone();
        // K || H is already included
        hash_ctx.update([letter as u8]);
        hash_ctx.update(sess_id.as_slice());
        let w = hash_ctx.finalize();
        k1.copy_from_slice(&w[..k1.len()]);

        if !k2.is_empty() {
            let mut hash_ctx = self.partial_hash.clone();
            hash_ctx.update(&*k1);
            let w = hash_ctx.finalize();
            k2.copy_from_slice(&w[..k2.len()]);
        }
        Ok(&out[..len])
    }
}

/// Ephemeral key agreement for one exchange
#[derive(Debug)]
pub(crate) enum SharedSecret {
    KexCurve25519(KexCurve25519),
    #[cfg(feature = "rsa")]
    KexDhGroup14(KexDhGroup14),
}

impl fmt::Display for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::KexCurve25519(_) => SSH_NAME_CURVE25519,
            #[cfg(feature = "rsa")]
            Self::KexDhGroup14(_) => SSH_NAME_DH_GROUP14_SHA256,
        };
        write!(f, "{n}")
    }
}

impl SharedSecret {
    pub fn from_name(name: &'static str) -> Result<Self> {
        match name {
            SSH_NAME_CURVE25519 | SSH_NAME_CURVE25519_LIBSSH => Ok(Self::KexCurve25519(KexCurve25519::new())),
            #[cfg(feature = "rsa")]
            SSH_NAME_DH_GROUP14_SHA256 => Ok(Self::KexDhGroup14(KexDhGroup14::new()?)),
            _ => Err(Error::bug()),
        }
    }

    /// Our public value as sent on the wire
    pub fn pubkey(&self) -> &[u8] {
        match self {
            Self::KexCurve25519(k) => &k.pubkey,
            #[cfg(feature = "rsa")]
            Self::KexDhGroup14(k) => &k.e,
        }
    }

    /// `e` and `f` are hashed as mpint rather than string
    fn values_are_mpint(&self) -> bool {
        match self {
            Self::KexCurve25519(_) => false,
            #[cfg(feature = "rsa")]
            Self::KexDhGroup14(_) => true,
        }
    }

    /// Computes `K` as unsigned big endian bytes. Can only be called once.
    fn secret(&mut self, theirs: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            Self::KexCurve25519(k) => k.secret(theirs),
            #[cfg(feature = "rsa")]
            Self::KexDhGroup14(k) => k.secret(theirs),
        }
    }
}

pub(crate) struct KexCurve25519 {
    // Cleared after deriving the secret
    ours: Option<x25519_dalek::EphemeralSecret>,
    pubkey: [u8; 32],
}

impl fmt::Debug for KexCurve25519 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KexCurve25519")
            .field("ours", &if self.ours.is_some() { "Some" } else { "None" })
            .field("pubkey", &self.pubkey.hex_dump())
            .finish()
    }
}

impl KexCurve25519 {
    fn new() -> Self {
        let ours = x25519_dalek::EphemeralSecret::random_from_rng(random::rng());
        let pubkey = x25519_dalek::PublicKey::from(&ours).to_bytes();
        KexCurve25519 { ours: Some(ours), pubkey }
    }

    fn secret(&mut self, theirs: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let theirs: [u8; 32] = theirs.try_into().map_err(|_| Error::BadKex)?;
        let theirs = x25519_dalek::PublicKey::from(theirs);
        let shsec = self.ours.take().trap()?.diffie_hellman(&theirs);
        // RFC8731 3. an all-zero output must be rejected
        if !shsec.was_contributory() {
            info!("Peer sent a low order curve25519 point");
            return Err(Error::BadKex);
        }
        Ok(Zeroizing::new(shsec.as_bytes().to_vec()))
    }
}

/// RFC3526 2048-bit MODP group, as used by RFC8268
#[cfg(feature = "rsa")]
const GROUP14_P: [u8; 256] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
    0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d,
    0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05, 0x98, 0xda, 0x48, 0x36,
    0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
    0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56,
    0x20, 0x85, 0x52, 0xbb, 0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d,
    0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04, 0xf1, 0x74, 0x6c, 0x08,
    0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b,
    0xe3, 0x9e, 0x77, 0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2,
    0xec, 0x07, 0xa2, 0x8f, 0xb5, 0xc5, 0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9,
    0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18, 0x39, 0x95, 0x49, 0x7c,
    0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
    0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff,
];

#[cfg(feature = "rsa")]
const GROUP14_G: u32 = 2;

// RFC8268 recommends at least twice the 112 bit security strength
#[cfg(feature = "rsa")]
const DH_EXPONENT_LEN: usize = 64;

#[cfg(feature = "rsa")]
pub(crate) struct KexDhGroup14 {
    // Secret exponent, cleared after deriving the secret
    x: Option<Zeroizing<Vec<u8>>>,
    /// Our public value, mpint body
    e: Vec<u8>,
}

#[cfg(feature = "rsa")]
impl fmt::Debug for KexDhGroup14 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KexDhGroup14").field("x", &if self.x.is_some() { "Some" } else { "None" }).finish()
    }
}

#[cfg(feature = "rsa")]
impl KexDhGroup14 {
    fn new() -> Result<Self> {
        use rsa::BigUint;
        let mut x = Zeroizing::new(vec![0u8; DH_EXPONENT_LEN]);
        random::fill_random(&mut x)?;
        // keep x > 1
        x[0] |= 0x80;
        let p = BigUint::from_bytes_be(&GROUP14_P);
        let e = BigUint::from(GROUP14_G).modpow(&BigUint::from_bytes_be(&x), &p);
        let e = sshwire::mpint_bytes(&e.to_bytes_be());
        Ok(Self { x: Some(x), e })
    }

    fn secret(&mut self, theirs: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        use rsa::BigUint;
        // a negative mpint
        if theirs.first().is_some_and(|b| b & 0x80 != 0) {
            return Err(Error::BadKex);
        }
        let p = BigUint::from_bytes_be(&GROUP14_P);
        let f = BigUint::from_bytes_be(theirs);
        let one = BigUint::from(1u32);
        let p_1 = p.clone() - one.clone();
        if f <= one || f >= p_1 {
            info!("Diffie-Hellman value out of range");
            return Err(Error::BadKex);
        }
        let x = self.x.take().trap()?;
        let k = f.modpow(&BigUint::from_bytes_be(&x), &p);
        Ok(Zeroizing::new(k.to_bytes_be()))
    }
}

#[cfg(test)]
mod tests {
    use crate::dusklog::init_test_log;
    use crate::encrypt::{self, Cipher, Integ};
    use crate::kex::*;
    use crate::namelist::MAX_LOCAL_NAMES;
    use crate::packets::{Packet, ParseContext};
    use crate::sign;

    #[test]
    fn test_name_match() {
        // check that the from_name() functions are complete
        for k in KNOWN_KEX.iter() {
            SharedSecret::from_name(k).unwrap();
        }
        for k in KNOWN_HOSTSIG.iter() {
            sign::SigType::from_name(k).unwrap();
        }
        for k in KNOWN_CIPHER.iter() {
            Cipher::from_name(k).unwrap();
        }
        for k in KNOWN_MAC.iter() {
            Integ::from_name(k).unwrap();
        }
        assert!(KNOWN_KEX.len() < MAX_LOCAL_NAMES);
        AlgoConfig::default().validate().unwrap();
    }

    // These are separate tests because they trigger `Error::bug()` which
    // is an explicit panic in debug builds.
    #[test]
    #[should_panic]
    fn test_unknown_kex() {
        SharedSecret::from_name("bad").unwrap();
    }
    #[test]
    #[should_panic]
    fn test_unknown_cipher() {
        Cipher::from_name("bad").unwrap();
    }
    #[test]
    #[should_panic]
    fn test_unknown_integ() {
        Integ::from_name("bad").unwrap();
    }

    #[test]
    fn config_validation() {
        let mut c = AlgoConfig::default();
        c.ciphers = ["aes192-cbc"].as_slice().try_into().unwrap();
        assert!(c.validate().is_err());
        let mut c = AlgoConfig::default();
        c.macs = LocalNames::new();
        assert!(c.validate().is_err());
    }

    /// Encodes and decodes so that namelists are remote lists
    fn wire_kexinit(params: &KexParams) -> packets::KexInit {
        let p: Packet = Kex::make_kexinit(params).unwrap().into();
        let b = sshwire::ssh_vec(&p, None).unwrap();
        match sshwire::packet_from_bytes(&b, &ParseContext::default()).unwrap() {
            Packet::KexInit(k) => k,
            _ => panic!(),
        }
    }

    fn params<'a>(conf: &'a AlgoConfig, is_client: bool, hostkeys: &'a [SignKey]) -> KexParams<'a> {
        KexParams { conf, is_client, strict: true, our_version: "SSH-2.0-test", hostkeys }
    }

    #[test]
    fn negotiate_hostsig() {
        init_test_log();
        let mut cconf = AlgoConfig::default();
        cconf.hostsig = [SSH_NAME_RSA_SHA512, SSH_NAME_ED25519].as_slice().try_into().unwrap();
        let mut sconf = AlgoConfig::default();
        sconf.hostsig = [SSH_NAME_ED25519, SSH_NAME_RSA_SHA256].as_slice().try_into().unwrap();

        let mut keys = vec![SignKey::generate(sign::KeyType::Ed25519).unwrap()];
        #[cfg(feature = "rsa")]
        keys.push(SignKey::generate(sign::KeyType::RSA(1024)).unwrap());

        let cp = params(&cconf, true, &[]);
        let sp = params(&sconf, false, &keys);
        let cli_init = wire_kexinit(&cp);
        let serv_init = wire_kexinit(&sp);

        let ca = Kex::algo_negotiation(&serv_init, &cp).unwrap();
        let sa = Kex::algo_negotiation(&cli_init, &sp).unwrap();
        assert_eq!(ca.hostsig, sign::SigType::Ed25519);
        assert_eq!(sa.hostsig, sign::SigType::Ed25519);
        assert!(ca.strict_kex && sa.strict_kex);
        assert_eq!(ca.cipher_enc, sa.cipher_dec);
        assert_eq!(ca.kex.to_string(), sa.kex.to_string());
    }

    #[test]
    fn negotiate_preference_order() {
        init_test_log();
        let mut cconf = AlgoConfig::default();
        cconf.ciphers = [SSH_NAME_AES128_CTR, SSH_NAME_CHAPOLY].as_slice().try_into().unwrap();
        let sconf = AlgoConfig::default();
        let keys = [SignKey::generate(sign::KeyType::Ed25519).unwrap()];
        let cp = params(&cconf, true, &[]);
        let sp = params(&sconf, false, &keys);

        // the client's preference wins on both sides
        let ca = Kex::algo_negotiation(&wire_kexinit(&sp), &cp).unwrap();
        let sa = Kex::algo_negotiation(&wire_kexinit(&cp), &sp).unwrap();
        assert_eq!(ca.cipher_enc, Cipher::Aes128Ctr);
        assert_eq!(sa.cipher_dec, Cipher::Aes128Ctr);
        assert_eq!(ca.integ_enc, sa.integ_dec);
    }

    #[test]
    fn negotiate_no_match() {
        init_test_log();
        let mut cconf = AlgoConfig::default();
        cconf.ciphers = [SSH_NAME_AES128_CTR].as_slice().try_into().unwrap();
        let mut sconf = AlgoConfig::default();
        sconf.ciphers = [SSH_NAME_CHAPOLY].as_slice().try_into().unwrap();
        let keys = [SignKey::generate(sign::KeyType::Ed25519).unwrap()];
        let cp = params(&cconf, true, &[]);
        let sp = params(&sconf, false, &keys);
        let r = Kex::algo_negotiation(&wire_kexinit(&sp), &cp);
        assert!(matches!(r, Err(Error::AlgoNoMatch { algo: "encryption" })));
    }

    #[test]
    fn server_offers_only_keys_it_has() {
        let conf = AlgoConfig::default();
        let keys = [SignKey::generate(sign::KeyType::Ed25519).unwrap()];
        let sp = params(&conf, false, &keys);
        let l = sp.hostsig().unwrap();
        assert_eq!(l.0.as_slice(), &[SSH_NAME_ED25519]);
        let none = params(&conf, false, &[]);
        assert!(none.hostsig().is_err());
    }

    #[test]
    fn strict_needs_both() {
        let conf = AlgoConfig::default();
        let keys = [SignKey::generate(sign::KeyType::Ed25519).unwrap()];
        let mut cp = params(&conf, true, &[]);
        cp.strict = false;
        let sp = params(&conf, false, &keys);
        let sa = Kex::algo_negotiation(&wire_kexinit(&cp), &sp).unwrap();
        assert!(!sa.strict_kex);
        // marker names are never chosen as a method
        let ca = Kex::algo_negotiation(&wire_kexinit(&sp), &cp).unwrap();
        assert_eq!(ca.kex.to_string(), SSH_NAME_CURVE25519);
    }

    #[test]
    fn curve25519_agree() {
        let mut a = SharedSecret::from_name(SSH_NAME_CURVE25519).unwrap();
        let mut b = SharedSecret::from_name(SSH_NAME_CURVE25519_LIBSSH).unwrap();
        let pa = a.pubkey().to_vec();
        let pb = b.pubkey().to_vec();
        assert_eq!(*a.secret(&pb).unwrap(), *b.secret(&pa).unwrap());
    }

    #[test]
    fn curve25519_reject_zero() {
        let mut a = SharedSecret::from_name(SSH_NAME_CURVE25519).unwrap();
        assert!(matches!(a.secret(&[0u8; 32]), Err(Error::BadKex)));
        let mut a = SharedSecret::from_name(SSH_NAME_CURVE25519).unwrap();
        assert!(matches!(a.secret(&[1u8; 31]), Err(Error::BadKex)));
    }

    #[cfg(feature = "rsa")]
    #[test]
    fn dh_group14_agree() {
        init_test_log();
        let mut a = SharedSecret::from_name(SSH_NAME_DH_GROUP14_SHA256).unwrap();
        let mut b = SharedSecret::from_name(SSH_NAME_DH_GROUP14_SHA256).unwrap();
        let pa = a.pubkey().to_vec();
        let pb = b.pubkey().to_vec();
        assert_eq!(*a.secret(&pb).unwrap(), *b.secret(&pa).unwrap());
    }

    #[cfg(feature = "rsa")]
    #[test]
    fn dh_group14_range() {
        init_test_log();
        let mut p_1 = GROUP14_P.to_vec();
        p_1[255] -= 1;
        // the top bit of p is set, an mpint would need a leading zero
        let mut p_1_mpint = vec![0u8];
        p_1_mpint.extend_from_slice(&p_1);
        for bad in [vec![], vec![1u8], p_1_mpint, GROUP14_P.to_vec(), vec![0xff; 3]] {
            let mut a = SharedSecret::from_name(SSH_NAME_DH_GROUP14_SHA256).unwrap();
            assert!(matches!(a.secret(&bad), Err(Error::BadKex)), "{bad:?}");
        }
        let mut a = SharedSecret::from_name(SSH_NAME_DH_GROUP14_SHA256).unwrap();
        a.secret(&[2u8]).unwrap();
    }

    #[test]
    fn compute_key_rounds() {
        let h = SessId::from_slice(&[3u8; 32]).unwrap();
        let ko = KexOutput::new_test(b"\x00\x90shared", &h);
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        let k16 = ko.compute_key('A', 16, &mut a, &h).unwrap().to_vec();
        let k64 = ko.compute_key('A', 64, &mut b, &h).unwrap().to_vec();
        assert_eq!(k16, k64[..16]);
        assert_ne!(k64[..32], k64[32..]);
        let mut c = [0u8; 32];
        let kc = ko.compute_key('C', 32, &mut c, &h).unwrap();
        assert_ne!(kc, &k64[..32]);

        // and it derives usable keys
        let algos = Algos {
            kex: SharedSecret::from_name(SSH_NAME_CURVE25519).unwrap(),
            hostsig: sign::SigType::Ed25519,
            cipher_enc: Cipher::ChaPoly,
            cipher_dec: Cipher::Aes256Ctr,
            integ_enc: Integ::ChaPoly,
            integ_dec: Integ::HmacSha512,
            discard_next: false,
            is_client: true,
            strict_kex: false,
        };
        encrypt::derive_keys(&ko, &h, &algos).unwrap();
    }
}
