// SPDX-License-Identifier: MIT

//! Intel manifest keys and signatures.
//!
//! Wire layouts (all little-endian):
//! - Key: version (0x10), algorithm (u16), key size in bits (u16), then the
//!   algorithm-specific data: RSA is a 4-byte exponent followed by the
//!   modulus, ECC and SM2 are X then Y coordinates.
//! - Signature: version (0x10), scheme (u16), key size in bits (u16), hash
//!   algorithm (u16), then raw RSA signature bytes or R ‖ S.
//!
//! Algorithm identifiers follow the TPM2 algorithm registry.

use crate::error::{Error, Result};
use crate::intel::element::Cursor;
use crate::range::reverse_bytes;
use core::convert::TryFrom;
use core::fmt::{self, Display};
use digest::{Digest, DynDigest};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::signature::Verifier;
use rsa::traits::PublicKeyParts;
use rsa::{pkcs1v15::Pkcs1v15Sign, pss::Pss, BigUint, RsaPublicKey};
use serde::Serialize;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use sm3::Sm3;

pub const KEY_VERSION: u8 = 0x10;
pub const SIGNATURE_VERSION: u8 = 0x10;

/// Fixed user id for SM2 signatures in observed firmware.
pub const SM2_USER_ID: &str = "1234567812345678";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[repr(u16)]
pub enum KeyAlg {
    Rsa = 0x0001,
    Sm2 = 0x001b,
    Ecc = 0x0023,
}

impl TryFrom<u16> for KeyAlg {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self> {
        match v {
            0x0001 => Ok(KeyAlg::Rsa),
            0x001b => Ok(KeyAlg::Sm2),
            0x0023 => Ok(KeyAlg::Ecc),
            other => Err(Error::UnsupportedAlgorithm(format!("key algorithm {:#06x}", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[repr(u16)]
pub enum SigScheme {
    RsaSsa = 0x0014,
    RsaPss = 0x0016,
    Ecdsa = 0x0018,
    Sm2 = 0x001b,
}

impl TryFrom<u16> for SigScheme {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self> {
        match v {
            0x0014 => Ok(SigScheme::RsaSsa),
            0x0016 => Ok(SigScheme::RsaPss),
            0x0018 => Ok(SigScheme::Ecdsa),
            0x001b => Ok(SigScheme::Sm2),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "signature scheme {:#06x}",
                other
            ))),
        }
    }
}

impl Display for SigScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SigScheme::RsaSsa => "RSA-SSA",
            SigScheme::RsaPss => "RSA-PSS",
            SigScheme::Ecdsa => "ECDSA",
            SigScheme::Sm2 => "SM2",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[repr(u16)]
pub enum HashAlg {
    Sha1 = 0x0004,
    Sha256 = 0x000b,
    Sha384 = 0x000c,
    Sha512 = 0x000d,
    Sm3 = 0x0012,
}

impl TryFrom<u16> for HashAlg {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self> {
        match v {
            0x0004 => Ok(HashAlg::Sha1),
            0x000b => Ok(HashAlg::Sha256),
            0x000c => Ok(HashAlg::Sha384),
            0x000d => Ok(HashAlg::Sha512),
            0x0012 => Ok(HashAlg::Sm3),
            other => Err(Error::UnsupportedAlgorithm(format!("hash algorithm {:#06x}", other))),
        }
    }
}

impl HashAlg {
    pub fn digest_size(&self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
            HashAlg::Sm3 => 32,
        }
    }

    pub fn new_hasher(&self) -> Box<dyn DynDigest> {
        match self {
            HashAlg::Sha1 => Box::new(Sha1::new()),
            HashAlg::Sha256 => Box::new(Sha256::new()),
            HashAlg::Sha384 => Box::new(Sha384::new()),
            HashAlg::Sha512 => Box::new(Sha512::new()),
            HashAlg::Sm3 => Box::new(Sm3::new()),
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.new_hasher();
        hasher.update(data);
        hasher.finalize_reset().to_vec()
    }
}

/// A public key embedded in a manifest.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Key {
    pub version: u8,
    pub alg: KeyAlg,
    pub key_bits: u16,
    /// Algorithm-specific, little-endian.
    pub data: Vec<u8>,
}

impl Key {
    fn data_size(alg: KeyAlg, key_bits: u16) -> usize {
        let bytes = key_bits as usize / 8;
        match alg {
            KeyAlg::Rsa => 4 + bytes,
            KeyAlg::Ecc | KeyAlg::Sm2 => 2 * bytes,
        }
    }

    pub fn parse(cursor: &mut Cursor<'_>) -> Result<Self> {
        let version = cursor.read_u8()?;
        let alg = KeyAlg::try_from(cursor.read_u16()?)?;
        let key_bits = cursor.read_u16()?;
        let data = cursor.take(Self::data_size(alg, key_bits))?.to_vec();
        Ok(Self { version, alg, key_bits, data })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.extend_from_slice(&(self.alg as u16).to_le_bytes());
        out.extend_from_slice(&self.key_bits.to_le_bytes());
        out.extend_from_slice(&self.data);
    }

    pub fn total_size(&self) -> usize {
        5 + self.data.len()
    }

    fn rsa_public_key(&self) -> Result<RsaPublicKey> {
        if self.alg != KeyAlg::Rsa {
            return Err(Error::format("not an RSA key"));
        }
        let exponent = BigUint::from_bytes_le(&self.data[..4]);
        let modulus = BigUint::from_bytes_le(&self.data[4..]);
        RsaPublicKey::new(modulus, exponent)
            .map_err(|e| Error::format(format!("unusable RSA key: {}", e)))
    }

    /// Big-endian X and Y affine coordinates of an ECC or SM2 key.
    fn curve_point(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let size = self.key_bits as usize / 8;
        if self.data.len() != 2 * size {
            return Err(Error::format("curve key data does not match its declared size"));
        }
        Ok((
            reverse_bytes(&self.data[..size]),
            reverse_bytes(&self.data[size..]),
        ))
    }
}

/// A signature embedded in a manifest.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Signature {
    pub version: u8,
    pub scheme: SigScheme,
    pub key_bits: u16,
    pub hash_alg: HashAlg,
    /// Raw signature bytes (RSA) or R ‖ S, little-endian per component.
    pub data: Vec<u8>,
}

impl Signature {
    fn data_size(scheme: SigScheme, key_bits: u16) -> usize {
        let bytes = key_bits as usize / 8;
        match scheme {
            SigScheme::RsaSsa | SigScheme::RsaPss => bytes,
            SigScheme::Ecdsa | SigScheme::Sm2 => 2 * bytes,
        }
    }

    pub fn parse(cursor: &mut Cursor<'_>) -> Result<Self> {
        let version = cursor.read_u8()?;
        let scheme = SigScheme::try_from(cursor.read_u16()?)?;
        let key_bits = cursor.read_u16()?;
        let hash_alg = HashAlg::try_from(cursor.read_u16()?)?;
        let data = cursor.take(Self::data_size(scheme, key_bits))?.to_vec();
        Ok(Self { version, scheme, key_bits, hash_alg, data })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.extend_from_slice(&(self.scheme as u16).to_le_bytes());
        out.extend_from_slice(&self.key_bits.to_le_bytes());
        out.extend_from_slice(&(self.hash_alg as u16).to_le_bytes());
        out.extend_from_slice(&self.data);
    }

    pub fn total_size(&self) -> usize {
        7 + self.data.len()
    }
}

/// The key/signature pair closing a manifest.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct KeySignature {
    pub key: Key,
    pub signature: Signature,
}

fn signature_error(scheme: SigScheme, cause: impl Display) -> Error {
    Error::SignatureCheck {
        signer: scheme.to_string(),
        item: None,
        cause: cause.to_string(),
    }
}

impl KeySignature {
    pub fn parse(cursor: &mut Cursor<'_>) -> Result<Self> {
        let key = Key::parse(cursor)?;
        let signature = Signature::parse(cursor)?;
        Ok(Self { key, signature })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.key.serialize(out);
        self.signature.serialize(out);
    }

    pub fn total_size(&self) -> usize {
        self.key.total_size() + self.signature.total_size()
    }

    /// Byte offset of the signature sub-element from the start of this
    /// key/signature pair.
    pub fn signature_offset(&self) -> usize {
        self.key.total_size()
    }

    /// Verifies the stored signature over `signed_data` with the embedded
    /// public key.
    pub fn verify(&self, signed_data: &[u8]) -> Result<()> {
        let scheme = self.signature.scheme;
        match scheme {
            SigScheme::RsaPss => {
                let public = self.key.rsa_public_key()?;
                let digest = self.signature.hash_alg.digest(signed_data);
                let result = match self.signature.hash_alg {
                    HashAlg::Sha256 => {
                        public.verify(Pss::new::<Sha256>(), &digest, &self.signature.data)
                    }
                    HashAlg::Sha384 => {
                        public.verify(Pss::new::<Sha384>(), &digest, &self.signature.data)
                    }
                    HashAlg::Sha512 => {
                        public.verify(Pss::new::<Sha512>(), &digest, &self.signature.data)
                    }
                    other => {
                        return Err(Error::UnsupportedAlgorithm(format!(
                            "RSA-PSS with {:?}",
                            other
                        )))
                    }
                };
                result.map_err(|e| signature_error(scheme, e))
            }
            SigScheme::RsaSsa => {
                let public = self.key.rsa_public_key()?;
                let digest = self.signature.hash_alg.digest(signed_data);
                let result = match self.signature.hash_alg {
                    HashAlg::Sha1 => {
                        public.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &self.signature.data)
                    }
                    HashAlg::Sha256 => {
                        public.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &self.signature.data)
                    }
                    HashAlg::Sha384 => {
                        public.verify(Pkcs1v15Sign::new::<Sha384>(), &digest, &self.signature.data)
                    }
                    HashAlg::Sha512 => {
                        public.verify(Pkcs1v15Sign::new::<Sha512>(), &digest, &self.signature.data)
                    }
                    other => {
                        return Err(Error::UnsupportedAlgorithm(format!(
                            "RSA-SSA with {:?}",
                            other
                        )))
                    }
                };
                result.map_err(|e| signature_error(scheme, e))
            }
            SigScheme::Ecdsa => {
                if self.key.key_bits != 256 {
                    return Err(Error::UnsupportedAlgorithm(format!(
                        "ECDSA with {}-bit keys",
                        self.key.key_bits
                    )));
                }
                let (x, y) = self.key.curve_point()?;
                let point = p256::EncodedPoint::from_affine_coordinates(
                    p256::FieldBytes::from_slice(&x),
                    p256::FieldBytes::from_slice(&y),
                    false,
                );
                let verifying_key = p256::ecdsa::VerifyingKey::from_encoded_point(&point)
                    .map_err(|e| Error::format(format!("unusable ECC key: {}", e)))?;
                let (r, s) = self.signature_scalars()?;
                let ecdsa_signature = p256::ecdsa::Signature::from_scalars(
                    p256::FieldBytes::clone_from_slice(&r),
                    p256::FieldBytes::clone_from_slice(&s),
                )
                .map_err(|e| signature_error(scheme, e))?;
                let digest = self.signature.hash_alg.digest(signed_data);
                verifying_key
                    .verify_prehash(&digest, &ecdsa_signature)
                    .map_err(|e| signature_error(scheme, e))
            }
            SigScheme::Sm2 => {
                if self.key.key_bits != 256 {
                    return Err(Error::UnsupportedAlgorithm(format!(
                        "SM2 with {}-bit keys",
                        self.key.key_bits
                    )));
                }
                let (x, y) = self.key.curve_point()?;
                let mut sec1 = Vec::with_capacity(65);
                sec1.push(0x04);
                sec1.extend_from_slice(&x);
                sec1.extend_from_slice(&y);
                let verifying_key = sm2::dsa::VerifyingKey::from_sec1_bytes(SM2_USER_ID, &sec1)
                    .map_err(|e| Error::format(format!("unusable SM2 key: {}", e)))?;
                let (r, s) = self.signature_scalars()?;
                let mut raw = r;
                raw.extend_from_slice(&s);
                let sm2_signature = sm2::dsa::Signature::from_slice(&raw)
                    .map_err(|e| signature_error(scheme, e))?;
                verifying_key
                    .verify(signed_data, &sm2_signature)
                    .map_err(|e| signature_error(scheme, e))
            }
        }
    }

    /// Big-endian R and S of an ECDSA or SM2 signature.
    fn signature_scalars(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let size = self.signature.key_bits as usize / 8;
        if self.signature.data.len() != 2 * size {
            return Err(Error::format("signature data does not match its declared size"));
        }
        Ok((
            reverse_bytes(&self.signature.data[..size]),
            reverse_bytes(&self.signature.data[size..]),
        ))
    }

    /// Signs `signed_data` with `signing_key`, embedding the matching
    /// public key and signature. With `scheme` absent, the scheme is
    /// derived from the private key's type.
    pub fn set_signature<R: rsa::rand_core::CryptoRngCore>(
        &mut self,
        rng: &mut R,
        scheme: Option<SigScheme>,
        signing_key: &SigningKey,
        signed_data: &[u8],
    ) -> Result<()> {
        match signing_key {
            SigningKey::Rsa(private) => {
                let scheme = scheme.unwrap_or(SigScheme::RsaPss);
                let key_bytes = private.size();
                let key_bits = (key_bytes * 8) as u16;
                let hash_alg = if key_bytes >= 384 { HashAlg::Sha384 } else { HashAlg::Sha256 };
                let digest = hash_alg.digest(signed_data);
                let raw = match scheme {
                    SigScheme::RsaPss => {
                        let padding = match hash_alg {
                            HashAlg::Sha384 => Pss::new::<Sha384>(),
                            _ => Pss::new::<Sha256>(),
                        };
                        private
                            .sign_with_rng(rng, padding, &digest)
                            .map_err(|e| signature_error(scheme, e))?
                    }
                    SigScheme::RsaSsa => {
                        let padding = match hash_alg {
                            HashAlg::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
                            _ => Pkcs1v15Sign::new::<Sha256>(),
                        };
                        private.sign(padding, &digest).map_err(|e| signature_error(scheme, e))?
                    }
                    other => {
                        return Err(Error::UnsupportedAlgorithm(format!(
                            "{} with an RSA key",
                            other
                        )))
                    }
                };

                let public = private.to_public_key();
                let mut data = public.e().to_bytes_le();
                data.resize(4, 0);
                let mut modulus = public.n().to_bytes_le();
                modulus.resize(key_bytes, 0);
                data.extend_from_slice(&modulus);
                self.key = Key { version: KEY_VERSION, alg: KeyAlg::Rsa, key_bits, data };
                self.signature = Signature {
                    version: SIGNATURE_VERSION,
                    scheme,
                    key_bits,
                    hash_alg,
                    data: raw,
                };
                Ok(())
            }
            SigningKey::EcdsaP256(private) => {
                let scheme = scheme.unwrap_or(SigScheme::Ecdsa);
                if scheme != SigScheme::Ecdsa {
                    return Err(Error::UnsupportedAlgorithm(format!(
                        "{} with a P-256 key",
                        scheme
                    )));
                }
                let hash_alg = HashAlg::Sha256;
                let digest = hash_alg.digest(signed_data);
                let ecdsa_signature: p256::ecdsa::Signature = private
                    .sign_prehash(&digest)
                    .map_err(|e| signature_error(scheme, e))?;
                let (r, s) = ecdsa_signature.split_bytes();
                let mut data = reverse_bytes(&r);
                data.extend_from_slice(&reverse_bytes(&s));

                let point = private.verifying_key().to_encoded_point(false);
                let x = point
                    .x()
                    .ok_or_else(|| Error::format("public key is the identity point"))?;
                let y = point
                    .y()
                    .ok_or_else(|| Error::format("public key is the identity point"))?;
                let mut key_data = reverse_bytes(x);
                key_data.extend_from_slice(&reverse_bytes(y));

                self.key = Key {
                    version: KEY_VERSION,
                    alg: KeyAlg::Ecc,
                    key_bits: 256,
                    data: key_data,
                };
                self.signature = Signature {
                    version: SIGNATURE_VERSION,
                    scheme,
                    key_bits: 256,
                    hash_alg,
                    data,
                };
                Ok(())
            }
        }
    }
}

/// Private keys supported by manifest-generation tooling.
pub enum SigningKey {
    Rsa(rsa::RsaPrivateKey),
    EcdsaP256(p256::ecdsa::SigningKey),
}
