// SPDX-License-Identifier: MIT

//! RSASSA-PSS verification of AMD signed blobs.
//!
//! Observed firmware signs with RSA-2048/SHA-256 or RSA-4096/SHA-384, salt
//! length equal to the digest length. Modulus and exponent come in
//! little-endian from the key formats.

use crate::amd::key::{Key, KeyId, KeySet};
use crate::error::{Error, Result};
use rsa::{pss::Pss, BigUint, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384};

/// A blob whose signature has been verified against a known key.
#[derive(Clone, Debug)]
pub struct SignedBlob {
    signed_data: Vec<u8>,
    signature: Vec<u8>,
    signing_key_id: KeyId,
}

impl SignedBlob {
    /// Verifies `signature` over `signed_data` with `key` and returns the
    /// blob on success.
    pub fn new(signature: &[u8], signed_data: &[u8], key: &Key) -> Result<Self> {
        let public = rsa_public_key(key)?;
        let result = match key.modulus_size_bits {
            2048 => {
                let digest = Sha256::digest(signed_data);
                public.verify(Pss::new::<Sha256>(), &digest, signature)
            }
            4096 => {
                let digest = Sha384::digest(signed_data);
                public.verify(Pss::new::<Sha384>(), &digest, signature)
            }
            bits => {
                return Err(Error::UnsupportedAlgorithm(format!("RSA-{} PSS", bits)));
            }
        };
        result.map_err(|e| Error::SignatureCheck {
            signer: key.key_id.to_string(),
            item: None,
            cause: e.to_string(),
        })?;
        Ok(Self {
            signed_data: signed_data.to_vec(),
            signature: signature.to_vec(),
            signing_key_id: key.key_id,
        })
    }

    pub fn signed_data(&self) -> &[u8] {
        &self.signed_data
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn signing_key_id(&self) -> KeyId {
        self.signing_key_id
    }
}

/// Tries every key in `keys`; the first one that verifies wins. The error
/// aggregates the keys tried.
pub fn new_multi_key_signed_blob(
    signature: &[u8],
    signed_data: &[u8],
    keys: &KeySet,
) -> Result<SignedBlob> {
    let mut tried = Vec::new();
    for key in keys.all() {
        match SignedBlob::new(signature, signed_data, key) {
            Ok(blob) => return Ok(blob),
            Err(e) => {
                log::debug!("key {} does not verify the blob: {}", key.key_id, e);
                tried.push(key.key_id.to_string());
            }
        }
    }
    Err(Error::SignatureCheck {
        signer: if tried.is_empty() { "(empty key set)".into() } else { tried.join(", ") },
        item: None,
        cause: "no key in the set verifies the signature".into(),
    })
}

pub(crate) fn rsa_public_key(key: &Key) -> Result<RsaPublicKey> {
    RsaPublicKey::new(
        BigUint::from_bytes_le(&key.modulus),
        BigUint::from_bytes_le(&key.exponent),
    )
    .map_err(|e| Error::format(format!("key {} is not a usable RSA key: {}", key.key_id, e)))
}
