//! SSH keypair generation for environment access.
//!
//! The public half is registered with the remote machine at creation time;
//! the private half is persisted by the caller next to the environment's
//! other local state and never leaves the workstation.

use std::fmt;

use rand::rngs::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use thiserror::Error;

/// Freshly generated access credential.
#[derive(Clone, Debug)]
pub struct AccessKeypair {
    /// Public key in `authorized_keys` format (`ssh-ed25519 AAAA...`).
    pub public_key: String,
    /// Private key in the OpenSSH PEM container.
    pub private_key: PrivateKeyText,
}

/// Errors raised while generating or encoding a keypair.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Raised when the platform cannot provide secure randomness or the key
    /// cannot be derived.
    #[error("failed to generate ed25519 keypair: {0}")]
    Generate(String),
    /// Raised when the key cannot be encoded for the SSH client.
    #[error("failed to encode {part} key: {message}")]
    Encode {
        /// Which half of the keypair failed to encode.
        part: &'static str,
        /// Encoder error message.
        message: String,
    },
}

/// Generates a new ed25519 keypair using the operating system's CSPRNG.
///
/// # Errors
///
/// Returns [`KeyError::Generate`] when randomness is unavailable and
/// [`KeyError::Encode`] when either half cannot be serialised.
pub fn generate_keypair() -> Result<AccessKeypair, KeyError> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|err| KeyError::Generate(err.to_string()))?;

    let private_key = key
        .to_openssh(LineEnding::LF)
        .map_err(|err| KeyError::Encode {
            part: "private",
            message: err.to_string(),
        })?;
    let public_key = key
        .public_key()
        .to_openssh()
        .map_err(|err| KeyError::Encode {
            part: "public",
            message: err.to_string(),
        })?;

    Ok(AccessKeypair {
        public_key,
        private_key: PrivateKeyText(private_key.as_str().to_owned()),
    })
}

/// Private key material that redacts itself in `Debug` output.
#[derive(Clone)]
pub struct PrivateKeyText(String);

impl PrivateKeyText {
    /// Returns the raw key text for persistence.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKeyText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKeyText(<redacted>)")
    }
}
