//! Greeting parsing and the credential scramble.

use crate::error::ProtocolError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

/// Authentication method advertised in the auth request tuple.
pub const CHAP_SHA1: &str = "chap-sha1";

/// Size of the server greeting in bytes.
pub const GREETING_SIZE: usize = 128;

/// Size of the scramble: the sha1 digest size.
pub const SCRAMBLE_SIZE: usize = 20;

/// The server's initial handshake line, sent once per connection: a version
/// banner in bytes 0..64 and a base64 authentication salt in bytes 64..108.
#[derive(Debug, Clone)]
pub struct Greeting {
    pub version: String,
    salt: String,
}

impl Greeting {
    /// Splits the fixed-size greeting into version text and salt.
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.len() < GREETING_SIZE {
            return Err(ProtocolError::ShortGreeting {
                expected: GREETING_SIZE,
                actual: raw.len(),
            });
        }
        let version = String::from_utf8_lossy(&raw[..64]).trim_end().to_string();
        let salt = String::from_utf8_lossy(&raw[64..108]).trim_end().to_string();
        Ok(Self { version, salt })
    }

    /// Base64-encoded authentication salt.
    pub fn salt(&self) -> &str {
        &self.salt
    }
}

/// Derives the credential scramble from the greeting salt and a password.
///
/// ```text
/// step1 = sha1(password)
/// step2 = sha1(step1)
/// step3 = sha1(salt[..20] || step2)
/// scramble = step1 xor step3
/// ```
///
/// The password itself never goes over the wire.
pub fn scramble(encoded_salt: &str, password: &str) -> Result<[u8; SCRAMBLE_SIZE], ProtocolError> {
    let salt = BASE64.decode(encoded_salt)?;
    if salt.len() < SCRAMBLE_SIZE {
        return Err(ProtocolError::SaltTooShort(salt.len()));
    }

    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);
    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SIZE]);
    hasher.update(step2);
    let step3 = hasher.finalize();

    let mut out = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = step1[i] ^ step3[i];
    }
    Ok(out)
}
