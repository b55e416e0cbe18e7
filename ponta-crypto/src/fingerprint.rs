use sha2::{Digest, Sha256};

use crate::PublicKey;

/// Short human-verifiable code for out-of-band channel verification.
///
/// Hashes the lexicographically sorted concatenation of both public
/// keys, so both parties compute the same code regardless of which
/// side of the handshake they were on.
pub fn channel_fingerprint(a: &PublicKey, b: &PublicKey) -> String {
    let (lo, hi) = if a.as_bytes() <= b.as_bytes() {
        (a, b)
    } else {
        (b, a)
    };

    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    let digest = hasher.finalize();

    // Safety-number style: five groups of five digits.
    digest
        .chunks(4)
        .take(5)
        .map(|chunk| {
            let n = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % 100_000;
            format!("{:05}", n)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;
    use k9::assert_equal;

    #[test]
    fn fingerprint_is_role_independent() {
        let alice = KeyPair::generate().public_key();
        let bob = KeyPair::generate().public_key();

        assert_equal!(
            channel_fingerprint(&alice, &bob),
            channel_fingerprint(&bob, &alice)
        );
    }

    #[test]
    fn fingerprint_format() {
        let a = KeyPair::generate().public_key();
        let b = KeyPair::generate().public_key();

        let fp = channel_fingerprint(&a, &b);
        let groups: Vec<&str> = fp.split(' ').collect();
        assert_eq!(groups.len(), 5);
        for group in groups {
            assert_eq!(group.len(), 5);
            assert!(group.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn different_channels_have_different_fingerprints() {
        let a = KeyPair::generate().public_key();
        let b = KeyPair::generate().public_key();
        let c = KeyPair::generate().public_key();

        assert_ne!(channel_fingerprint(&a, &b), channel_fingerprint(&a, &c));
    }
}
