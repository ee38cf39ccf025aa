//! Salted OpenSSL-style enveloped keyfile decryption (spec.md C2).
//!
//! Loads a keyfile of the shape `Salted__` + 8-byte salt + ciphertext,
//! derives key and IV from a passphrase using the legacy OpenSSL
//! `EVP_BytesToKey` construction (iteration count 1), and decrypts.

use std::fs;
use std::path::Path;

use openssl::hash::{Hasher, MessageDigest};
use openssl::symm::{Cipher, Crypter, Mode};

use crate::error::{MountError, Result};

const SALT_MAGIC: &[u8; 8] = b"Salted__";
const SALT_LEN: usize = 8;
const HEADER_LEN: usize = 8 + SALT_LEN;

/// Resolve a digest by the name the configuration files have historically
/// used (OpenSSL-style, lowercase).
fn resolve_digest(name: &str) -> Result<MessageDigest> {
    match name.to_ascii_lowercase().as_str() {
        "md5" => Ok(MessageDigest::md5()),
        "sha1" => Ok(MessageDigest::sha1()),
        "sha256" => Ok(MessageDigest::sha256()),
        "sha384" => Ok(MessageDigest::sha384()),
        "sha512" => Ok(MessageDigest::sha512()),
        "ripemd160" => Ok(MessageDigest::ripemd160()),
        other => Err(MountError::KeyDigestUnknown(other.to_string())),
    }
}

/// Resolve a cipher by name, returning the cipher plus its key and IV
/// lengths (openssl's `Cipher` already knows these).
fn resolve_cipher(name: &str) -> Result<Cipher> {
    match name.to_ascii_lowercase().as_str() {
        "aes-128-cbc" => Ok(Cipher::aes_128_cbc()),
        "aes-192-cbc" => Ok(Cipher::aes_192_cbc()),
        "aes-256-cbc" => Ok(Cipher::aes_256_cbc()),
        "aes-128-ctr" => Ok(Cipher::aes_128_ctr()),
        "aes-256-ctr" => Ok(Cipher::aes_256_ctr()),
        "des-ede3-cbc" | "des3" => Ok(Cipher::des_ede3_cbc()),
        "bf-cbc" | "blowfish" => Ok(Cipher::bf_cbc()),
        "cast5-cbc" => Ok(Cipher::cast5_cbc()),
        other => Err(MountError::KeyCipherUnknown(other.to_string())),
    }
}

/// The legacy OpenSSL `EVP_BytesToKey` construction, iteration count 1: hash
/// `passphrase || salt`, then repeatedly hash the previous digest with
/// `passphrase || salt` again, concatenating until there are enough bytes
/// for the key and IV.
fn bytes_to_key(digest: MessageDigest, passphrase: &[u8], salt: &[u8; SALT_LEN], key_len: usize, iv_len: usize) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut derived = Vec::with_capacity(key_len + iv_len);
    let mut previous: Vec<u8> = Vec::new();

    while derived.len() < key_len + iv_len {
        let mut hasher =
            Hasher::new(digest).map_err(|e| MountError::KeyDecrypt(e.into()))?;
        hasher
            .update(&previous)
            .map_err(|e| MountError::KeyDecrypt(e.into()))?;
        hasher
            .update(passphrase)
            .map_err(|e| MountError::KeyDecrypt(e.into()))?;
        hasher
            .update(salt)
            .map_err(|e| MountError::KeyDecrypt(e.into()))?;
        previous = hasher
            .finish()
            .map_err(|e| MountError::KeyDecrypt(e.into()))?
            .to_vec();
        derived.extend_from_slice(&previous);
    }

    derived.truncate(key_len + iv_len);
    let iv = derived.split_off(key_len);
    Ok((derived, iv))
}

/// Key length in bits for a named cipher, for populating the `KEYBITS`
/// substitution variable; `None` if the name is not recognized.
pub fn cipher_key_bits(name: &str) -> Option<u32> {
    resolve_cipher(name).ok().map(|c| (c.key_len() * 8) as u32)
}

/// Decrypt a salted enveloped keyfile with the given digest/cipher names and
/// passphrase, returning the plaintext filesystem key. The caller must zero
/// the returned buffer after use.
pub fn decrypt_keyfile(
    path: impl AsRef<Path>,
    digest_name: &str,
    cipher_name: &str,
    passphrase: &[u8],
) -> Result<Vec<u8>> {
    let digest = resolve_digest(digest_name)?;
    let cipher = resolve_cipher(cipher_name)?;

    let contents = fs::read(path.as_ref())
        .map_err(|e| MountError::KeyIo(anyhow::anyhow!(e).context("failed to read keyfile")))?;

    if contents.len() < HEADER_LEN {
        return Err(MountError::KeyIo(anyhow::anyhow!(
            "keyfile shorter than the {HEADER_LEN}-byte salt header"
        )));
    }

    if &contents[..8] != SALT_MAGIC {
        return Err(MountError::KeyIo(anyhow::anyhow!(
            "keyfile is missing the 'Salted__' magic tag"
        )));
    }

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&contents[8..HEADER_LEN]);
    let ciphertext = &contents[HEADER_LEN..];

    let (key, iv) = bytes_to_key(digest, passphrase, &salt, cipher.key_len(), cipher.iv_len().unwrap_or(0))?;

    let mut crypter = Crypter::new(cipher, Mode::Decrypt, &key, Some(&iv))
        .map_err(|e| MountError::KeyDecrypt(e.into()))?;

    let mut plaintext = vec![0u8; ciphertext.len() + cipher.block_size()];
    let mut count = crypter
        .update(ciphertext, &mut plaintext)
        .map_err(|e| MountError::KeyDecrypt(e.into()))?;
    count += crypter
        .finalize(&mut plaintext[count..])
        .map_err(|e| MountError::KeyDecrypt(e.into()))?;
    plaintext.truncate(count);

    Ok(plaintext)
}

#[cfg(test)]
mod test {
    use super::*;

    use openssl::symm::encrypt;
    use tempfile::NamedTempFile;

    fn write_salted_keyfile(cipher_name: &str, digest_name: &str, passphrase: &[u8], plaintext: &[u8]) -> (NamedTempFile, [u8; SALT_LEN]) {
        let cipher = resolve_cipher(cipher_name).unwrap();
        let digest = resolve_digest(digest_name).unwrap();
        let salt: [u8; SALT_LEN] = [1, 2, 3, 4, 5, 6, 7, 8];
        let (key, iv) = bytes_to_key(digest, passphrase, &salt, cipher.key_len(), cipher.iv_len().unwrap_or(0)).unwrap();
        let ciphertext = encrypt(cipher, &key, Some(&iv), plaintext).unwrap();

        let mut file = NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(SALT_MAGIC).unwrap();
        file.write_all(&salt).unwrap();
        file.write_all(&ciphertext).unwrap();
        (file, salt)
    }

    #[test]
    fn test_decrypt_round_trip() {
        let plaintext = b"this is a filesystem key, 32 bytes long!";
        let (file, _salt) = write_salted_keyfile("aes-256-cbc", "sha256", b"hunter2", plaintext);

        let decrypted = decrypt_keyfile(file.path(), "sha256", "aes-256-cbc", b"hunter2").unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_passphrase_is_legal() {
        let plaintext = b"short key";
        let (file, _salt) = write_salted_keyfile("aes-128-cbc", "md5", b"", plaintext);

        let decrypted = decrypt_keyfile(file.path(), "md5", "aes-128-cbc", b"").unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_unknown_digest() {
        let err = decrypt_keyfile(Path::new("/nonexistent"), "bogus", "aes-256-cbc", b"x").unwrap_err();
        assert!(matches!(err, MountError::KeyDigestUnknown(_)));
    }

    #[test]
    fn test_unknown_cipher() {
        let err = decrypt_keyfile(Path::new("/nonexistent"), "sha256", "bogus", b"x").unwrap_err();
        assert!(matches!(err, MountError::KeyCipherUnknown(_)));
    }

    #[test]
    fn test_short_keyfile() {
        let mut file = NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(b"short").unwrap();

        let err = decrypt_keyfile(file.path(), "sha256", "aes-256-cbc", b"x").unwrap_err();
        assert!(matches!(err, MountError::KeyIo(_)));
    }

    #[test]
    fn test_missing_magic() {
        let mut file = NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(&[0u8; 32]).unwrap();

        let err = decrypt_keyfile(file.path(), "sha256", "aes-256-cbc", b"x").unwrap_err();
        assert!(matches!(err, MountError::KeyIo(_)));
    }
}
