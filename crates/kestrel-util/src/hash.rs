use std::fmt;

/// BLAKE3 digest of a module's raw bytes.
///
/// Two loads of the same file compare equal exactly when their bytes do, which is
/// what the rebuild engine uses to decide whether a module was touched.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hex-encoded digest.
    #[must_use]
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// First `len` hex characters of the digest.
    #[must_use]
    pub fn short(&self, len: usize) -> String {
        let mut hex = self.to_hex();
        hex.truncate(len);
        hex
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short(12))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Fingerprint a byte slice.
#[must_use]
pub fn fingerprint(data: &[u8]) -> Fingerprint {
    Fingerprint(*blake3::hash(data).as_bytes())
}

/// Hex prefix of the BLAKE3 hash, used for `[contenthash]` in file names.
#[must_use]
pub fn short_hash(data: &[u8], len: usize) -> String {
    fingerprint(data).short(len)
}
