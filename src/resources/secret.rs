//! Secret payload holder.
//!
//! Decoded secret bytes live in memory only inside [`SecretBytes`], which redacts itself
//! in `Debug`, `Display` and serialization and zeroes its buffer on drop. The raw value
//! is reachable through [`SecretBytes::expose_secret`] only.

use serde::{Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::external::REDACTED;

#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn expose_secret(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for SecretBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes({})", REDACTED)
    }
}

impl fmt::Display for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl PartialEq for SecretBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretBytes {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_bytes_redacts_debug_and_display() {
        let secret = SecretBytes::new(b"super-secret".to_vec());
        assert_eq!(format!("{:?}", secret), "SecretBytes(**redacted**)");
        assert_eq!(secret.to_string(), "**redacted**");
    }

    #[test]
    fn test_secret_bytes_serializes_redacted() {
        let secret = SecretBytes::new(b"super-secret".to_vec());
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"**redacted**\"");
        assert_eq!(secret.expose_secret(), b"super-secret");
    }
}
