// SPDX-License-Identifier: MIT

//! Boot-policy and key-manifest round trips with real signatures.

use rand::rngs::OsRng;
use trustrom::intel::bpm::{BootPolicyManifest, Bpmh, IbbSegment, Pme, Pmse, Se, SeFlags};
use trustrom::intel::element::{HashDigest, HashList};
use trustrom::intel::keysig::{
    HashAlg, Key, KeyAlg, KeySignature, SigScheme, Signature, SigningKey, KEY_VERSION,
    SIGNATURE_VERSION,
};
use trustrom::intel::km::{KeyManifest, KmHash, KmUsage};
use trustrom::intel::ManifestParseOptions;
use trustrom::Error;

fn placeholder_key_signature() -> KeySignature {
    KeySignature {
        key: Key {
            version: KEY_VERSION,
            alg: KeyAlg::Rsa,
            key_bits: 2048,
            data: vec![0u8; 4 + 256],
        },
        signature: Signature {
            version: SIGNATURE_VERSION,
            scheme: SigScheme::RsaPss,
            key_bits: 2048,
            hash_alg: HashAlg::Sha256,
            data: vec![0u8; 256],
        },
    }
}

fn sample_manifest() -> BootPolicyManifest {
    let mut manifest = BootPolicyManifest {
        bpmh: Bpmh {
            version: 0x21,
            key_signature_offset: 0,
            bpm_revision: 1,
            bpm_svn: 4,
            acm_svn_auth: 2,
            reserved: 0,
            nem_data_stack: 0x20,
        },
        se: vec![Se {
            version: 0x21,
            set_number: 0,
            pbet_value: 0x0f,
            flags: SeFlags::ENABLE_VTD_DMA_PROTECTION,
            ibb_mchbar: 0xfed1_0000,
            vtd_bar: 0xfed9_1000,
            dma_prot_base0: 0x10_0000,
            dma_prot_limit0: 0x80_0000,
            dma_prot_base1: 0,
            dma_prot_limit1: 0,
            post_ibb_hash: HashList::default(),
            ibb_entry_point: 0xffff_fff0,
            digest_list: HashList {
                digests: vec![HashDigest::new(HashAlg::Sha256, vec![0x5a; 32])],
            },
            obb_hash: HashDigest::new(HashAlg::Sha384, vec![0x5b; 48]),
            segments: vec![
                IbbSegment { flags: 0, base: 0xffff_0000, size: 0x1_0000 },
                IbbSegment { flags: 1, base: 0xfffd_0000, size: 0x2000 },
            ],
        }],
        txte: None,
        reserved: None,
        pcde: None,
        pme: Some(Pme { version: 0x20, reserved: 0, data: b"platform".to_vec() }),
        pmse: Pmse { version: 0x20, key_signature: placeholder_key_signature() },
    };
    manifest.rehash();
    manifest
}

#[test]
fn parse_of_serialize_is_identity_after_rehash() {
    let manifest = sample_manifest();
    let raw = manifest.serialize();
    let parsed = BootPolicyManifest::parse(&raw, &ManifestParseOptions::default()).unwrap();
    assert_eq!(parsed, manifest);

    // Serialising the parse result reproduces the input bytes.
    assert_eq!(parsed.serialize(), raw);
}

/// The signed span covers the embedded public key, so signing is a
/// two-pass affair: the first pass embeds the key (and settles every
/// derived size), the second signs the settled span.
fn sign_manifest(
    manifest: &mut BootPolicyManifest,
    scheme: Option<SigScheme>,
    signing_key: &SigningKey,
) {
    for _ in 0..2 {
        manifest.rehash();
        let span = manifest.signed_data().unwrap();
        manifest
            .pmse
            .key_signature
            .set_signature(&mut OsRng, scheme, signing_key, &span)
            .unwrap();
    }
}

#[test]
fn rsa_signed_manifest_verifies_until_tampered() {
    let mut manifest = sample_manifest();
    let private = rsa::RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
    let signing_key = SigningKey::Rsa(private);

    sign_manifest(&mut manifest, None, &signing_key);
    manifest.verify_signature().unwrap();

    // Round trip through bytes and verify again.
    let raw = manifest.serialize();
    let parsed = BootPolicyManifest::parse(&raw, &ManifestParseOptions::default()).unwrap();
    parsed.verify_signature().unwrap();

    // A tampered SVN breaks the signature.
    let mut tampered = parsed.clone();
    tampered.bpmh.bpm_svn ^= 1;
    assert!(matches!(
        tampered.verify_signature(),
        Err(Error::SignatureCheck { .. })
    ));
}

#[test]
fn ecdsa_signed_manifest_verifies() {
    let mut manifest = sample_manifest();
    let private = p256::ecdsa::SigningKey::random(&mut OsRng);
    let signing_key = SigningKey::EcdsaP256(private);

    sign_manifest(&mut manifest, None, &signing_key);
    manifest.verify_signature().unwrap();

    let raw = manifest.serialize();
    let parsed = BootPolicyManifest::parse(&raw, &ManifestParseOptions::default()).unwrap();
    assert_eq!(parsed.pmse.key_signature.key.alg, KeyAlg::Ecc);
    parsed.verify_signature().unwrap();
}

#[test]
fn key_manifest_signs_and_authorises() {
    let bpm_key_digest = vec![0x77u8; 32];
    let mut km = KeyManifest {
        version: 0x21,
        key_signature_offset: 0,
        km_version: 0x10,
        km_svn: 2,
        km_id: 1,
        reserved: 0,
        hashes: vec![KmHash {
            usage: KmUsage::BOOT_POLICY_MANIFEST,
            digest: HashDigest::new(HashAlg::Sha256, bpm_key_digest.clone()),
        }],
        key_signature: placeholder_key_signature(),
    };
    let private = rsa::RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
    let signing_key = SigningKey::Rsa(private);

    // Two passes: the signed span covers the embedded public key.
    for _ in 0..2 {
        km.rehash();
        let span = km.signed_data().unwrap();
        km.key_signature
            .set_signature(&mut OsRng, Some(SigScheme::RsaSsa), &signing_key, &span)
            .unwrap();
    }
    km.verify_signature().unwrap();

    let raw = km.serialize();
    let parsed = KeyManifest::parse(&raw).unwrap();
    assert_eq!(parsed, km);
    parsed.verify_signature().unwrap();
    assert!(parsed.authorises(KmUsage::BOOT_POLICY_MANIFEST, &bpm_key_digest));
    assert!(!parsed.authorises(KmUsage::ACM_MANIFEST, &bpm_key_digest));
}
