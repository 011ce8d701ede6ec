//! Key derivation: Argon2id repository password → repository key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::KEY_SIZE;

/// Size of the KDF salt
pub const SALT_SIZE: usize = 16;

/// A 256-bit key derived from the repository password via Argon2id.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct RepositoryKey {
    bytes: [u8; KEY_SIZE],
}

impl RepositoryKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for RepositoryKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for RepositoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for KDF
///
/// Changing any of these makes metadata written under the old values
/// unreadable; they are fixed for the lifetime of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Salt used when a repository does not configure one: the first 16 bytes of
/// `SHA-256("blobseal-repository-salt:" || repository_name)`.
pub fn repository_salt(repository_name: &str) -> [u8; SALT_SIZE] {
    let digest = Sha256::new()
        .chain_update(b"blobseal-repository-salt:")
        .chain_update(repository_name.as_bytes())
        .finalize();
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&digest[..SALT_SIZE]);
    salt
}

/// Derive the repository key from the password and the repository salt using Argon2id.
pub fn derive_repository_key(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> CryptoResult<RepositoryKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::Kdf(format!("Argon2id failed: {e}")))?;

    Ok(RepositoryKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let password = SecretString::from("test-password-123");
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_repository_key(&password, &salt, &fast_params()).unwrap();
        let key2 = derive_repository_key(&password, &salt, &fast_params()).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_passwords() {
        let salt = [1u8; SALT_SIZE];

        let key1 =
            derive_repository_key(&SecretString::from("password-a"), &salt, &fast_params())
                .unwrap();
        let key2 =
            derive_repository_key(&SecretString::from("password-b"), &salt, &fast_params())
                .unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_invalid_params() {
        let params = KdfParams {
            mem_cost_kib: 1,
            time_cost: 0,
            parallelism: 1,
        };
        let result = derive_repository_key(&SecretString::from("pw"), &[0; SALT_SIZE], &params);
        assert!(matches!(result, Err(CryptoError::Kdf(_))));
    }

    #[test]
    fn test_repository_salt_fixed_per_name() {
        assert_eq!(repository_salt("backups"), repository_salt("backups"));
        assert_ne!(repository_salt("backups"), repository_salt("archive"));
    }
}
