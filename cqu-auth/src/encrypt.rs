//! Password encryption expected by the portals' login forms.

use aes::{
    cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyInit, KeyIvInit},
    Aes128, Aes192, Aes256,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use des::Des;
use rand::{seq::SliceRandom, Rng};
use thiserror::Error;

// Alphabet the authserver's own login script draws its random strings from.
const CHAR_SET: &[u8] = b"ABCDEFGHJKMNPQRSTWXYZabcdefhijkmnprstwxyz2345678";
const AUTHSERVER_PREFIX_LEN: usize = 64;
const AUTHSERVER_IV_LEN: usize = 16;
const EXAM_KEY: &[u8] = b"cquisse123456789";

pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, EncryptError> {
    if iv.len() != 16 {
        return Err(EncryptError::InvalidIvLength(iv.len()));
    }
    let invalid_key = |_| EncryptError::InvalidKeyLength(key.len());
    Ok(match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        len => return Err(EncryptError::InvalidKeyLength(len)),
    })
}

pub fn aes_ecb_encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, EncryptError> {
    let invalid_key = |_| EncryptError::InvalidKeyLength(key.len());
    Ok(match key.len() {
        16 => ecb::Encryptor::<Aes128>::new_from_slice(key)
            .map_err(invalid_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => ecb::Encryptor::<Aes192>::new_from_slice(key)
            .map_err(invalid_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => ecb::Encryptor::<Aes256>::new_from_slice(key)
            .map_err(invalid_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        len => return Err(EncryptError::InvalidKeyLength(len)),
    })
}

pub fn des_ecb_encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, EncryptError> {
    Ok(ecb::Encryptor::<Des>::new_from_slice(key)
        .map_err(|_| EncryptError::InvalidKeyLength(key.len()))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// A random string drawn from the authserver's alphabet.
pub fn random_string<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .filter_map(|_| CHAR_SET.choose(rng).map(|c| *c as char))
        .collect()
}

/// Encrypts a password for the legacy authserver login form.
///
/// The salt from the login page is the AES key. The iv is random and never sent; the server only
/// gets the first block wrong, which falls inside the 64 character random prefix it discards.
pub fn authserver_password(salt: &str, password: &str) -> Result<String, EncryptError> {
    authserver_password_with_rng(&mut rand::thread_rng(), salt, password)
}

pub fn authserver_password_with_rng<R: Rng + ?Sized>(
    rng: &mut R,
    salt: &str,
    password: &str,
) -> Result<String, EncryptError> {
    let plaintext = random_string(rng, AUTHSERVER_PREFIX_LEN) + password;
    let iv = random_string(rng, AUTHSERVER_IV_LEN);
    let ciphertext = aes_cbc_encrypt(salt.as_bytes(), iv.as_bytes(), plaintext.as_bytes())?;
    Ok(STANDARD.encode(ciphertext))
}

/// Encrypts a password for the SSO login form, keyed by the page's base64 `croypto` value.
pub fn sso_password(croypto: &str, password: &str) -> Result<String, EncryptError> {
    let key = STANDARD.decode(croypto.trim())?;
    Ok(STANDARD.encode(des_ecb_encrypt(&key, password.as_bytes())?))
}

/// The `studentId` query value of the exam list endpoint.
pub fn exam_student_id(student_id: &str) -> Result<String, EncryptError> {
    Ok(hex::encode_upper(aes_ecb_encrypt(
        EXAM_KEY,
        student_id.as_bytes(),
    )?))
}

#[derive(Debug, Error)]
pub enum EncryptError {
    #[error("invalid key length {0}")]
    InvalidKeyLength(usize),
    #[error("invalid iv length {0}, expected 16")]
    InvalidIvLength(usize),
    #[error("key is not valid base64")]
    InvalidBase64(#[from] base64::DecodeError),
}
