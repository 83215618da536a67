//! Wire encoding shared by the agent and the collector.
//!
//! A request body passes through an ordered list of stages. The agent applies
//! [`STAGES`] front to back, the collector undoes them back to front:
//!
//! ```text
//! agent:     JSON -> compress -> encrypt -> sign
//! collector: verify -> decrypt -> decompress -> JSON
//! ```
//!
//! The signature therefore always covers the exact bytes on the wire.

use std::io::{Read, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

/// Header carrying the base64 HMAC-SHA256 of the body.
pub const SIGNATURE_HEADER: &str = "HashSHA256";

/// Bytes of PKCS#1 v1.5 padding overhead per encrypted chunk.
const PKCS1_V15_OVERHEAD: usize = 11;

type HmacSha256 = Hmac<Sha256>;

/// One reversible transformation of a request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compress,
    Encrypt,
    Sign,
}

/// Encoding order on the agent. The collector walks it in reverse.
pub const STAGES: [Stage; 3] = [Stage::Compress, Stage::Encrypt, Stage::Sign];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("gzip: {0}")]
    Gzip(#[from] std::io::Error),

    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("ciphertext length {len} is not a multiple of the key size {size}")]
    CiphertextLength { len: usize, size: usize },

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("signature header is not valid base64")]
    SignatureEncoding,

    #[error("key file {path}: {reason}")]
    Key { path: String, reason: String },
}

/// Gzip-compresses `data`.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflates a gzip stream.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn mac(key: &str) -> HmacSha256 {
    // HMAC accepts keys of any length.
    <HmacSha256 as Mac>::new_from_slice(key.as_bytes()).unwrap_or_else(|_| unreachable!())
}

/// Returns the base64 HMAC-SHA256 of `data` under `key`.
pub fn sign(data: &[u8], key: &str) -> String {
    let mut m = mac(key);
    m.update(data);
    BASE64.encode(m.finalize().into_bytes())
}

/// Checks a base64 signature in constant time.
pub fn verify(data: &[u8], key: &str, signature: &str) -> Result<(), CodecError> {
    let expected = BASE64
        .decode(signature.trim())
        .map_err(|_| CodecError::SignatureEncoding)?;
    let mut m = mac(key);
    m.update(data);
    m.verify_slice(&expected)
        .map_err(|_| CodecError::SignatureMismatch)
}

/// Encrypts `data` with RSA PKCS#1 v1.5 in chunks.
///
/// Each plaintext chunk holds at most `size - 11` bytes and becomes one
/// ciphertext chunk of exactly the modulus size.
pub fn encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let size = key.size();
    let chunk = size - PKCS1_V15_OVERHEAD;
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(data.len().div_ceil(chunk) * size);
    for part in data.chunks(chunk) {
        out.extend(key.encrypt(&mut rng, Pkcs1v15Encrypt, part)?);
    }
    Ok(out)
}

/// Reverses [`encrypt`].
pub fn decrypt(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let size = key.size();
    if data.len() % size != 0 {
        return Err(CodecError::CiphertextLength {
            len: data.len(),
            size,
        });
    }
    let mut out = Vec::with_capacity(data.len());
    for part in data.chunks(size) {
        out.extend(key.decrypt(Pkcs1v15Encrypt, part)?);
    }
    Ok(out)
}

fn key_error(path: &Path, reason: impl ToString) -> CodecError {
    CodecError::Key {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Loads a PEM public key, PKCS#1 (`RSA PUBLIC KEY`) or SPKI (`PUBLIC KEY`).
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, CodecError> {
    let pem = std::fs::read_to_string(path).map_err(|e| key_error(path, e))?;
    RsaPublicKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPublicKey::from_public_key_pem(&pem))
        .map_err(|e| key_error(path, e))
}

/// Loads a PEM private key, PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, CodecError> {
    let pem = std::fs::read_to_string(path).map_err(|e| key_error(path, e))?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
        .map_err(|e| key_error(path, e))
}

/// Generates a key pair and renders both halves as PKCS#1 PEM.
pub fn generate_key_pair(bits: usize) -> Result<(String, String), CodecError> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, bits)?;
    let public = RsaPublicKey::from(&private);
    let private_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| CodecError::Key {
            path: "private.pem".into(),
            reason: e.to_string(),
        })?;
    let public_pem = public
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| CodecError::Key {
            path: "public.pem".into(),
            reason: e.to_string(),
        })?;
    Ok((private_pem.to_string(), public_pem))
}

/// Body and headers produced by [`Encoder::encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBody {
    pub payload: Vec<u8>,
    pub gzip: bool,
    pub signature: Option<String>,
}

/// Agent-side stage runner.
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    pub hash_key: Option<String>,
    pub public_key: Option<RsaPublicKey>,
}

impl Encoder {
    pub fn new(hash_key: Option<String>, public_key: Option<RsaPublicKey>) -> Self {
        Self {
            hash_key: hash_key.filter(|k| !k.is_empty()),
            public_key,
        }
    }

    /// Runs every configured stage over `body` in [`STAGES`] order.
    pub fn encode(&self, body: Vec<u8>, gzip: bool) -> Result<EncodedBody, CodecError> {
        let mut out = EncodedBody {
            payload: body,
            gzip: false,
            signature: None,
        };
        for stage in STAGES {
            match stage {
                Stage::Compress if gzip => {
                    out.payload = compress(&out.payload)?;
                    out.gzip = true;
                }
                Stage::Encrypt => {
                    if let Some(key) = &self.public_key {
                        out.payload = encrypt(key, &out.payload)?;
                    }
                }
                Stage::Sign => {
                    if let Some(key) = &self.hash_key {
                        out.signature = Some(sign(&out.payload, key));
                    }
                }
                Stage::Compress => {}
            }
        }
        Ok(out)
    }
}

/// Collector-side stage runner, the exact inverse of [`Encoder`].
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    pub hash_key: Option<String>,
    pub private_key: Option<RsaPrivateKey>,
}

impl Decoder {
    pub fn new(hash_key: Option<String>, private_key: Option<RsaPrivateKey>) -> Self {
        Self {
            hash_key: hash_key.filter(|k| !k.is_empty()),
            private_key,
        }
    }

    /// Undoes the stages of an [`EncodedBody`] in reverse [`STAGES`] order.
    pub fn decode(&self, body: &EncodedBody) -> Result<Vec<u8>, CodecError> {
        let mut payload = body.payload.clone();
        for stage in STAGES.iter().rev() {
            match stage {
                Stage::Sign => {
                    if let (Some(key), Some(signature)) = (&self.hash_key, &body.signature) {
                        verify(&payload, key, signature)?;
                    }
                }
                Stage::Encrypt => {
                    if let Some(key) = &self.private_key {
                        payload = decrypt(key, &payload)?;
                    }
                }
                Stage::Compress => {
                    if body.gzip {
                        payload = decompress(&payload)?;
                    }
                }
            }
        }
        Ok(payload)
    }
}


#[cfg(test)]
mod tests {
    use super::test_keys::{private_key, public_key};
    use super::*;

    const BODY: &[u8] = br#"[{"id":"Alloc","type":"gauge","value":1024.5},{"id":"PollCount","type":"counter","delta":3}]"#;

    #[test]
    fn test_stage_order_is_compress_encrypt_sign() {
        assert_eq!(STAGES, [Stage::Compress, Stage::Encrypt, Stage::Sign]);
    }

    #[test]
    fn test_gzip_roundtrip() {
        let packed = compress(BODY).unwrap();
        assert_eq!(decompress(&packed).unwrap(), BODY);
        assert!(decompress(b"not gzip").is_err());
    }

    #[test]
    fn test_sign_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let sig = sign(b"The quick brown fox jumps over the lazy dog", "key");
        assert_eq!(sig, "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=");
        assert!(verify(b"The quick brown fox jumps over the lazy dog", "key", &sig).is_ok());
    }

    #[test]
    fn test_encrypt_spans_multiple_chunks() {
        let key = private_key();
        let data: Vec<u8> = (0..400u32).map(|i| (i % 251) as u8).collect();
        let sealed = encrypt(&public_key(), &data).unwrap();
        // 400 bytes over 117-byte chunks of a 1024-bit key.
        assert_eq!(sealed.len(), 4 * 128);
        assert_eq!(decrypt(&key, &sealed).unwrap(), data);
        assert!(matches!(
            decrypt(&key, &sealed[..100]),
            Err(CodecError::CiphertextLength { .. })
        ));
    }

    #[test]
    fn test_encoder_decoder_roundtrip_all_variants() {
        let keys = [None, Some("secret".to_string())];
        let rsa = [None, Some(())];
        for hash_key in &keys {
            for with_rsa in &rsa {
                for gzip in [false, true] {
                    let encoder = Encoder::new(hash_key.clone(), with_rsa.map(|_| public_key()));
                    let decoder = Decoder::new(hash_key.clone(), with_rsa.map(|_| private_key()));
                    let encoded = encoder.encode(BODY.to_vec(), gzip).unwrap();
                    assert_eq!(encoded.signature.is_some(), hash_key.is_some());
                    assert_eq!(decoder.decode(&encoded).unwrap(), BODY);
                }
            }
        }
    }

    #[test]
    fn test_any_bit_flip_fails_verification() {
        let encoder = Encoder::new(Some("secret".into()), Some(public_key()));
        let encoded = encoder.encode(BODY.to_vec(), true).unwrap();
        let signature = encoded.signature.clone().unwrap();
        for byte in (0..encoded.payload.len()).step_by(7) {
            for bit in 0..8 {
                let mut tampered = encoded.payload.clone();
                tampered[byte] ^= 1 << bit;
                assert!(matches!(
                    verify(&tampered, "secret", &signature),
                    Err(CodecError::SignatureMismatch)
                ));
            }
        }
    }
}
