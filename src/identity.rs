//! Node identity: a 16-byte token that is stable for a node's lifetime
//! and appears in every handshake and message.

use std::fmt;

use rand_core::{OsRng, RngCore};

use crate::error::*;

/// A 16-byte token identifying a node. Generated randomly at startup
/// unless the embedder supplies one via `Config::identity`, and stable
/// for as long as the node runs — restarting a node changes its
/// identity, which is how peers notice a remote has reset.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Identity(pub(crate) [u8; 16]);

impl Identity {
    /// All-zero identity, used as the sentinel meaning "generate one".
    pub const ZERO: Identity = Identity([0; 16]);

    /// Generates a fresh random identity from the OS entropy source.
    ///
    /// Fails with `ErrorKind::Fatal` if the OS has no usable entropy
    /// source, matching the original's "we do not have an entropy
    /// source" `CH_FATAL` case.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut bytes)
            .simple_msg(ErrorKind::Fatal, "no entropy source available")?;
        Ok(Identity(bytes))
    }

    /// Builds an identity from raw bytes, e.g. one received over the
    /// wire in a handshake or message header.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Identity(bytes)
    }

    /// Returns the identity's raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// True if every byte is zero (the "generate a random one" sentinel
    /// used by `Config::identity`).
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_not_the_zero_sentinel() {
        // astronomically unlikely to fail legitimately
        let id = Identity::generate().unwrap();
        assert!(!id.is_zero());
    }

    #[test]
    fn zero_sentinel_detected() {
        assert!(Identity::ZERO.is_zero());
        assert!(!Identity::from_bytes([1; 16]).is_zero());
    }
}
