use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// SHA-1 digest (infohashes, store keys)
pub fn sha1_digest(data: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

/// SHA-256 digest (body digests, write tokens)
pub fn sha256_digest(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

/// SHA-512 digest (block hash chain)
pub fn sha512_digest(data: impl AsRef<[u8]>) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_vector() {
        // SHA-1("abc")
        assert_eq!(
            sha1_digest(b"abc"),
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
            ]
        );
    }

    #[test]
    fn test_digest_lengths() {
        assert_eq!(sha256_digest(b"x").len(), 32);
        assert_eq!(sha512_digest(b"x").len(), 64);
    }
}
