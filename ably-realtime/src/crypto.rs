//! AES-CBC payload encryption.
//!
//! Ciphertext layout is `iv (16 bytes) || AES-CBC(PKCS#7(plaintext))`.

use std::fmt;

use base64::Engine as _;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::{ErrorInfo, error_code};

/// AES block and IV size in bytes.
pub const IV_LENGTH: usize = 16;

const DEFAULT_ALGORITHM: &str = "aes";
const DEFAULT_MODE: &str = "cbc";
const SUPPORTED_KEY_LENGTHS: &[usize] = &[128, 256];

/// Accepts both the standard and URL-safe alphabets, with or without padding.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Validated cipher configuration for a channel.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherParams {
    algorithm: String,
    mode: String,
    key_length: usize,
    key: Vec<u8>,
    iv: Option<[u8; IV_LENGTH]>,
}

impl fmt::Debug for CipherParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherParams")
            .field("algorithm", &self.algorithm())
            .field("key", &"<redacted>")
            .field("iv", &self.iv.is_some())
            .finish()
    }
}

impl CipherParams {
    /// AES-CBC with a raw 128- or 256-bit key.
    pub fn from_key(key: &[u8]) -> Result<Self, ErrorInfo> {
        let key_length = key.len() * 8;
        if !SUPPORTED_KEY_LENGTHS.contains(&key_length) {
            return Err(ErrorInfo::new(
                error_code::BAD_REQUEST,
                400,
                format!("Unsupported key length {key_length} for aes-cbc encryption. Supported key lengths are 128 and 256 bits"),
            ));
        }
        Ok(Self {
            algorithm: DEFAULT_ALGORITHM.to_string(),
            mode: DEFAULT_MODE.to_string(),
            key_length,
            key: key.to_vec(),
            iv: None,
        })
    }

    /// AES-CBC with a base64 (standard or URL-safe) encoded key.
    pub fn from_base64_key(key: &str) -> Result<Self, ErrorInfo> {
        let normalised = key.replace('-', "+").replace('_', "/");
        let bytes = LENIENT_BASE64.decode(normalised).map_err(|e| {
            ErrorInfo::new(error_code::BAD_REQUEST, 400, format!("Invalid base64 key: {e}"))
        })?;
        Self::from_key(&bytes)
    }

    /// Uses `iv` for the first encrypted message only.
    pub fn with_iv(mut self, iv: [u8; IV_LENGTH]) -> Self {
        self.iv = Some(iv);
        self
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    /// Wire name of the algorithm, e.g. `aes-256-cbc`.
    pub fn algorithm(&self) -> String {
        format!("{}-{}-{}", self.algorithm, self.key_length, self.mode)
    }

    pub(crate) fn cipher(&self) -> Box<dyn ChannelCipher> {
        Box::new(AesCbcCipher {
            algorithm: self.algorithm(),
            key: self.key.clone(),
            next_iv: self.iv,
        })
    }
}

/// Random key suitable for [`CipherParams::from_key`].
pub fn generate_random_key(bits: usize) -> Result<Vec<u8>, ErrorInfo> {
    if !SUPPORTED_KEY_LENGTHS.contains(&bits) {
        return Err(ErrorInfo::new(
            error_code::BAD_REQUEST,
            400,
            format!("Unsupported key length {bits}"),
        ));
    }
    let mut key = vec![0u8; bits / 8];
    rand::thread_rng().fill_bytes(&mut key);
    Ok(key)
}

/// A per-channel cipher instance.
pub trait ChannelCipher: Send + Sync {
    fn algorithm(&self) -> &str;
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ErrorInfo>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ErrorInfo>;
}

struct AesCbcCipher {
    algorithm: String,
    key: Vec<u8>,
    next_iv: Option<[u8; IV_LENGTH]>,
}

impl AesCbcCipher {
    fn fresh_iv(&mut self) -> [u8; IV_LENGTH] {
        self.next_iv.take().unwrap_or_else(|| {
            let mut iv = [0u8; IV_LENGTH];
            rand::thread_rng().fill_bytes(&mut iv);
            iv
        })
    }
}

fn cipher_error(message: impl fmt::Display) -> ErrorInfo {
    ErrorInfo::new(error_code::UNSUPPORTED_ENCODING, 400, message.to_string())
}

impl ChannelCipher for AesCbcCipher {
    fn algorithm(&self) -> &str {
        &self.algorithm
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ErrorInfo> {
        let iv = self.fresh_iv();
        let body = match self.key.len() {
            16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(&self.key, &iv)
                .map_err(cipher_error)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            _ => cbc::Encryptor::<aes::Aes256>::new_from_slices(&self.key, &iv)
                .map_err(cipher_error)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        };
        let mut out = Vec::with_capacity(IV_LENGTH + body.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ErrorInfo> {
        let Some((iv, body)) = ciphertext.split_first_chunk::<IV_LENGTH>() else {
            return Err(cipher_error("Ciphertext shorter than the IV"));
        };
        if body.is_empty() || body.len() % IV_LENGTH != 0 {
            return Err(cipher_error("Ciphertext is not a whole number of blocks"));
        }
        let plain = match self.key.len() {
            16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(&self.key, iv)
                .map_err(cipher_error)?
                .decrypt_padded_vec_mut::<Pkcs7>(body),
            _ => cbc::Decryptor::<aes::Aes256>::new_from_slices(&self.key, iv)
                .map_err(cipher_error)?
                .decrypt_padded_vec_mut::<Pkcs7>(body),
        };
        plain.map_err(|_| cipher_error("Decryption failed: invalid padding"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_key_lengths() {
        let err = CipherParams::from_key(&[0u8; 24]).unwrap_err();
        assert_eq!(err.code, 40000);
        assert!(generate_random_key(192).is_err());
    }

    #[test]
    fn algorithm_name_includes_key_length() {
        let p = CipherParams::from_key(&[1u8; 16]).unwrap();
        assert_eq!(p.algorithm(), "aes-128-cbc");
        let p = CipherParams::from_key(&generate_random_key(256).unwrap()).unwrap();
        assert_eq!(p.algorithm(), "aes-256-cbc");
        assert_eq!(p.key_length(), 256);
    }

    #[test]
    fn base64_key_accepts_url_safe_alphabet() {
        let key = [0xfbu8; 32];
        let standard = base64::engine::general_purpose::STANDARD.encode(key);
        let url_safe = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key);
        assert!(standard.contains('+') || standard.contains('/'));
        assert_eq!(
            CipherParams::from_base64_key(&standard).unwrap(),
            CipherParams::from_base64_key(&url_safe).unwrap()
        );
    }

    #[test]
    fn encrypt_then_decrypt() {
        let params = CipherParams::from_key(&generate_random_key(256).unwrap()).unwrap();
        let mut cipher = params.cipher();
        let ct = cipher.encrypt(b"The quick brown fox").unwrap();
        assert_eq!(ct.len(), IV_LENGTH + 32);
        assert_eq!(cipher.decrypt(&ct).unwrap(), b"The quick brown fox");
    }

    #[test]
    fn configured_iv_is_used_once() {
        let iv = [7u8; IV_LENGTH];
        let params = CipherParams::from_key(&[3u8; 16]).unwrap().with_iv(iv);
        let mut cipher = params.cipher();
        let first = cipher.encrypt(b"one").unwrap();
        let second = cipher.encrypt(b"one").unwrap();
        assert_eq!(first.get(..IV_LENGTH), Some(&iv[..]));
        assert_ne!(second.get(..IV_LENGTH), Some(&iv[..]));
        assert_ne!(first, second);
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn aes_128_known_vector() {
        // zero key, zero iv, "Hello" padded to one block
        let iv = [0u8; IV_LENGTH];
        let expected = hex("00000000000000000000000000000000042dbe01027a650c746a5dc65db6be11");

        let mut cipher = CipherParams::from_key(&[0u8; 16]).unwrap().with_iv(iv).cipher();
        assert_eq!(cipher.encrypt(b"Hello").unwrap(), expected);

        let other = CipherParams::from_key(&[0u8; 16]).unwrap().cipher();
        assert_eq!(other.decrypt(&expected).unwrap(), b"Hello");
    }

    #[test]
    fn aes_256_known_vector() {
        let key = [1u8; 32];
        let iv: [u8; IV_LENGTH] = std::array::from_fn(|i| i as u8);
        let expected = hex(concat!(
            "000102030405060708090a0b0c0d0e0f",
            "b1c889f195ab8bf157d68ec46a2462751b5b05067111c6a14fdd66132a1a70c6",
        ));

        let mut cipher = CipherParams::from_key(&key).unwrap().with_iv(iv).cipher();
        assert_eq!(cipher.encrypt(b"The quick brown fox").unwrap(), expected);

        let other = CipherParams::from_key(&key).unwrap().cipher();
        assert_eq!(other.decrypt(&expected).unwrap(), b"The quick brown fox");
    }

    #[test]
    fn decrypt_rejects_truncated_input() {
        let cipher = CipherParams::from_key(&[1u8; 16]).unwrap().cipher();
        assert_eq!(cipher.decrypt(&[0u8; 10]).unwrap_err().code, 40013);
        assert_eq!(cipher.decrypt(&[0u8; 20]).unwrap_err().code, 40013);
    }
}
