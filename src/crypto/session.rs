use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::CryptoError;

/// Length of the symmetric session key carried by the key exchange.
pub const SESSION_KEY_LEN: usize = 64;

/// Smallest modulus that can wrap a [`SESSION_KEY_LEN`] key with PKCS#1 v1.5.
pub const MIN_RSA_BITS: usize = 1024;

/// Server-side RSA key pair used to receive session keys.
pub struct SessionKeychain {
    private: RsaPrivateKey,
    public_pem: String,
}

impl SessionKeychain {
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let bits = bits.max(MIN_RSA_BITS);
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| CryptoError::Rsa(format!("key generation failed: {e}")))?;
        let public_pem = RsaPublicKey::from(&private)
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Rsa(format!("public key encoding failed: {e}")))?;

        let keychain = Self { private, public_pem };
        debug!("generated {}-bit session keychain {}", bits, keychain.fingerprint());
        Ok(keychain)
    }

    /// Short hex digest of the public PEM, for logs and operators.
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.public_pem.as_bytes())[..8])
    }

    /// PKCS#1 PEM of the public half, as sent to clients.
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .private
            .decrypt(Pkcs1v15Encrypt, wrapped)
            .map_err(|e| CryptoError::Rsa(format!("session key decryption failed: {e}")))?;
        if key.len() != SESSION_KEY_LEN {
            return Err(CryptoError::SessionKeyLength {
                expected: SESSION_KEY_LEN,
                actual: key.len(),
            });
        }
        Ok(key)
    }
}

pub fn parse_public_pem(pem: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    let pem = std::str::from_utf8(pem).map_err(|e| CryptoError::MalformedPublicKey(e.to_string()))?;
    RsaPublicKey::from_pkcs1_pem(pem.trim()).map_err(|e| CryptoError::MalformedPublicKey(e.to_string()))
}

/// Generate a fresh session key and wrap it for `public_key`.
/// Returns the wrapped bytes and the plain key.
pub fn wrap_session_key(public_key: &RsaPublicKey) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let mut rng = OsRng;
    let mut key = vec![0u8; SESSION_KEY_LEN];
    rng.fill_bytes(&mut key);

    let wrapped = public_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, &key)
        .map_err(|e| CryptoError::Rsa(format!("session key encryption failed: {e}")))?;
    Ok((wrapped, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_hex() -> Result<(), CryptoError> {
        let keychain = SessionKeychain::generate(1024)?;
        let fingerprint = keychain.fingerprint();
        assert_eq!(fingerprint.len(), 16);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fingerprint, keychain.fingerprint());
        Ok(())
    }

    #[test]
    fn session_key_roundtrip() -> Result<(), CryptoError> {
        let keychain = SessionKeychain::generate(1024)?;
        let public_key = parse_public_pem(keychain.public_pem().as_bytes())?;

        let (wrapped, key) = wrap_session_key(&public_key)?;
        assert_eq!(key.len(), SESSION_KEY_LEN);
        assert_ne!(wrapped, key);
        assert_eq!(keychain.unwrap_session_key(&wrapped)?, key);
        Ok(())
    }

    #[test]
    fn foreign_keychain_cannot_unwrap() -> Result<(), CryptoError> {
        let ours = SessionKeychain::generate(1024)?;
        let theirs = SessionKeychain::generate(1024)?;
        let (wrapped, _) = wrap_session_key(&parse_public_pem(theirs.public_pem().as_bytes())?)?;

        assert!(ours.unwrap_session_key(&wrapped).is_err());
        Ok(())
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(matches!(
            parse_public_pem(b"-----BEGIN RSA PUBLIC KEY-----\nnope\n-----END RSA PUBLIC KEY-----"),
            Err(CryptoError::MalformedPublicKey(_))
        ));
        assert!(parse_public_pem(&[0xff, 0xfe]).is_err());
    }
}
