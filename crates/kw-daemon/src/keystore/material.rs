//! System key material
//!
//! Wraps an `ssh_key::PrivateKey`. The private half only leaves this type as
//! OpenSSH text handed to a closure, so callers cannot keep a copy around.

use std::fmt;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use ssh_key::private::{EcdsaKeypair, Ed25519Keypair, KeypairData, RsaKeypair};
use ssh_key::{Algorithm, EcdsaCurve, HashAlg, LineEnding, PrivateKey, PublicKey};

use kw_core::{KeyType, KwError};

/// Smallest RSA modulus accepted for generated keys
pub const MIN_RSA_BITS: usize = 2048;

/// Private and public halves of the system key
pub struct KeyMaterial {
    private: PrivateKey,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Generate a fresh keypair
    ///
    /// RSA generation is slow; call this from a blocking thread.
    pub fn generate(key_type: KeyType, rsa_bits: usize, comment: &str) -> Result<Self, KwError> {
        let data = match key_type {
            KeyType::Ed25519 => KeypairData::from(Ed25519Keypair::random(&mut OsRng)),
            KeyType::Ecdsa => KeypairData::from(
                EcdsaKeypair::random(&mut OsRng, EcdsaCurve::NistP256).map_err(key_err)?,
            ),
            KeyType::Rsa => {
                if rsa_bits < MIN_RSA_BITS {
                    return Err(KwError::InvalidArgument(format!(
                        "RSA keys must be at least {} bits",
                        MIN_RSA_BITS
                    )));
                }
                KeypairData::from(RsaKeypair::random(&mut OsRng, rsa_bits).map_err(key_err)?)
            }
        };

        let private = PrivateKey::new(data, comment).map_err(key_err)?;
        Ok(Self { private })
    }

    /// Parse an unencrypted OpenSSH private key
    pub fn from_openssh(pem: &str) -> Result<Self, KwError> {
        let private = PrivateKey::from_openssh(pem).map_err(|e| {
            KwError::InvalidArgument(format!("not a valid OpenSSH private key: {}", e))
        })?;

        if private.is_encrypted() {
            return Err(KwError::InvalidArgument(
                "passphrase-protected private keys are not supported".into(),
            ));
        }

        let material = Self { private };
        material.key_type()?;
        Ok(material)
    }

    /// Load a keypair from disk for import
    ///
    /// When `public_path` is omitted the public half is expected next to the
    /// private key with a `.pub` suffix.
    pub fn import_files(private_path: &Path, public_path: Option<&Path>) -> Result<Self, KwError> {
        let pem = std::fs::read_to_string(private_path).map_err(|e| {
            KwError::NotFound(format!(
                "private key file {} is not readable: {}",
                private_path.display(),
                e
            ))
        })?;

        let public_path = match public_path {
            Some(path) => path.to_path_buf(),
            None => derived_public_path(private_path),
        };
        let public_text = std::fs::read_to_string(&public_path).map_err(|e| {
            KwError::NotFound(format!(
                "public key file {} is not readable: {}",
                public_path.display(),
                e
            ))
        })?;

        let material = Self::from_openssh(&pem)?;
        let public = PublicKey::from_openssh(public_text.trim()).map_err(|e| {
            KwError::InvalidArgument(format!(
                "{} is not a valid OpenSSH public key: {}",
                public_path.display(),
                e
            ))
        })?;

        if public.key_data() != material.private.public_key().key_data() {
            return Err(KwError::InvalidArgument(format!(
                "public key {} does not belong to private key {}",
                public_path.display(),
                private_path.display()
            )));
        }

        Ok(material)
    }

    /// Algorithm family of this key
    pub fn key_type(&self) -> Result<KeyType, KwError> {
        match self.private.algorithm() {
            Algorithm::Ed25519 => Ok(KeyType::Ed25519),
            Algorithm::Rsa { .. } => Ok(KeyType::Rsa),
            Algorithm::Ecdsa { .. } => Ok(KeyType::Ecdsa),
            other => Err(KwError::InvalidArgument(format!(
                "unsupported key algorithm {}",
                other.as_str()
            ))),
        }
    }

    /// SHA-256 fingerprint in `SHA256:<base64>` form
    pub fn fingerprint(&self) -> String {
        self.private
            .public_key()
            .fingerprint(HashAlg::Sha256)
            .to_string()
    }

    /// Public half as an `authorized_keys` line
    pub fn public_openssh(&self) -> Result<String, KwError> {
        self.private.public_key().to_openssh().map_err(key_err)
    }

    /// Run `f` with the private half encoded as OpenSSH text
    pub fn with_private_openssh<R>(&self, f: impl FnOnce(&str) -> R) -> Result<R, KwError> {
        let pem = self.private.to_openssh(LineEnding::LF).map_err(key_err)?;
        Ok(f(pem.as_str()))
    }
}

/// `<private>.pub`
pub fn derived_public_path(private_path: &Path) -> PathBuf {
    let mut name = private_path.as_os_str().to_os_string();
    name.push(".pub");
    PathBuf::from(name)
}

fn key_err(e: ssh_key::Error) -> KwError {
    KwError::Internal(format!("key encoding failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ed25519() {
        let material = KeyMaterial::generate(KeyType::Ed25519, 4096, "keyward").unwrap();
        assert_eq!(material.key_type().unwrap(), KeyType::Ed25519);
        assert!(material.fingerprint().starts_with("SHA256:"));

        let public = material.public_openssh().unwrap();
        assert!(public.starts_with("ssh-ed25519 "));
        assert!(public.ends_with("keyward"));
    }

    #[test]
    fn test_generate_ecdsa() {
        let material = KeyMaterial::generate(KeyType::Ecdsa, 4096, "").unwrap();
        assert_eq!(material.key_type().unwrap(), KeyType::Ecdsa);
        assert!(material
            .public_openssh()
            .unwrap()
            .starts_with("ecdsa-sha2-nistp256 "));
    }

    #[test]
    fn test_small_rsa_rejected() {
        let result = KeyMaterial::generate(KeyType::Rsa, 1024, "");
        assert!(matches!(result, Err(KwError::InvalidArgument(_))));
    }

    #[test]
    fn test_openssh_round_trip_keeps_fingerprint() {
        let material = KeyMaterial::generate(KeyType::Ed25519, 0, "").unwrap();
        let pem = material.with_private_openssh(|pem| pem.to_string()).unwrap();
        let parsed = KeyMaterial::from_openssh(&pem).unwrap();
        assert_eq!(parsed.fingerprint(), material.fingerprint());
    }

    #[test]
    fn test_garbage_is_invalid_argument() {
        let result = KeyMaterial::from_openssh("not a key");
        assert!(matches!(result, Err(KwError::InvalidArgument(_))));
    }

    #[test]
    fn test_import_uses_derived_public_path() {
        let dir = tempfile::tempdir().unwrap();
        let material = KeyMaterial::generate(KeyType::Ed25519, 0, "imported").unwrap();
        let private_path = dir.path().join("id_ed25519");
        material
            .with_private_openssh(|pem| std::fs::write(&private_path, pem))
            .unwrap()
            .unwrap();
        std::fs::write(
            derived_public_path(&private_path),
            material.public_openssh().unwrap(),
        )
        .unwrap();

        let imported = KeyMaterial::import_files(&private_path, None).unwrap();
        assert_eq!(imported.fingerprint(), material.fingerprint());
    }

    #[test]
    fn test_import_missing_public_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let material = KeyMaterial::generate(KeyType::Ed25519, 0, "").unwrap();
        let private_path = dir.path().join("id_ed25519");
        material
            .with_private_openssh(|pem| std::fs::write(&private_path, pem))
            .unwrap()
            .unwrap();

        let result = KeyMaterial::import_files(&private_path, None);
        assert!(matches!(result, Err(KwError::NotFound(_))));
    }

    #[test]
    fn test_import_missing_private_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = KeyMaterial::import_files(&dir.path().join("absent"), None);
        assert!(matches!(result, Err(KwError::NotFound(_))));
    }

    #[test]
    fn test_import_mismatched_public_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let first = KeyMaterial::generate(KeyType::Ed25519, 0, "").unwrap();
        let second = KeyMaterial::generate(KeyType::Ed25519, 0, "").unwrap();
        let private_path = dir.path().join("key");
        let public_path = dir.path().join("other.pub");
        first
            .with_private_openssh(|pem| std::fs::write(&private_path, pem))
            .unwrap()
            .unwrap();
        std::fs::write(&public_path, second.public_openssh().unwrap()).unwrap();

        let result = KeyMaterial::import_files(&private_path, Some(&public_path));
        assert!(matches!(result, Err(KwError::InvalidArgument(_))));
    }
}
