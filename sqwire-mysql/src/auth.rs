//! Implementation of the authentication scrambles
use sha1::{Digest, Sha1};

/// Compute the `mysql_native_password` response.
///
/// SHA1( password ) XOR SHA1( scramble + SHA1( SHA1( password ) ) )
/// over the 20-byte server scramble. An empty password answers with an
/// empty buffer.
pub(crate) fn scramble_native(scramble: &[u8], password: &str) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let mut ctx = Sha1::new();
    ctx.update(password.as_bytes());
    let mut pw_hash = ctx.finalize_reset();
    ctx.update(pw_hash);
    let pw_hash_hash = ctx.finalize_reset();
    ctx.update(scramble);
    ctx.update(pw_hash_hash);
    let seeded = ctx.finalize();
    for (b, s) in pw_hash.iter_mut().zip(seeded.iter()) {
        *b ^= s;
    }
    pw_hash.to_vec()
}

const OLD_RAND_MAX: u32 = 0x3FFF_FFFF;

/// The weak PRNG of the pre-4.1 authentication scheme
struct OldRand {
    seed1: u32,
    seed2: u32,
}

impl OldRand {
    fn new(seed1: u32, seed2: u32) -> Self {
        OldRand {
            seed1: seed1 % OLD_RAND_MAX,
            seed2: seed2 % OLD_RAND_MAX,
        }
    }

    fn next_byte(&mut self) -> u8 {
        self.seed1 = self.seed1.wrapping_mul(3).wrapping_add(self.seed2) % OLD_RAND_MAX;
        self.seed2 = self.seed1.wrapping_add(self.seed2).wrapping_add(33) % OLD_RAND_MAX;
        ((self.seed1 as u64) * 31 / OLD_RAND_MAX as u64) as u8
    }
}

/// The pre-4.1 two-register password hash. Spaces and tabs in the
/// password are ignored, as the legacy servers did.
fn old_password_hash(password: &[u8]) -> [u32; 2] {
    let mut result = [1345345333u32, 0x12345671];
    let mut add: u32 = 7;
    for &c in password {
        if c == b' ' || c == b'\t' {
            continue;
        }
        let tmp = c as u32;
        result[0] ^= (result[0] & 63)
            .wrapping_add(add)
            .wrapping_mul(tmp)
            .wrapping_add(result[0] << 8);
        result[1] = result[1].wrapping_add((result[1] << 8) ^ result[0]);
        add = add.wrapping_add(tmp);
    }
    // Remove the sign bit. This mask is wider than the PRNG's modulus;
    // the seeds are reduced when the generator is constructed.
    result[0] &= 0x7FFF_FFFF;
    result[1] &= 0x7FFF_FFFF;
    result
}

/// Compute the pre-4.1 old-password response from the first 8 scramble
/// bytes. The 8-byte output goes on the wire null-terminated.
pub(crate) fn scramble_old(scramble: &[u8], password: &str) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let scramble = &scramble[..8];
    let hash_pw = old_password_hash(password.as_bytes());
    let hash_scramble = old_password_hash(scramble);
    let mut rng = OldRand::new(hash_pw[0] ^ hash_scramble[0], hash_pw[1] ^ hash_scramble[1]);
    let mut out = [0u8; 8];
    for b in &mut out {
        *b = rng.next_byte() + 64;
    }
    let mask = rng.next_byte();
    for b in &mut out {
        *b ^= mask;
    }
    out.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRAMBLE: [u8; 20] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
        0x10, 0x11, 0x12, 0x13, 0x14,
    ];

    #[test]
    fn native_scramble_shape() {
        let a = scramble_native(&SCRAMBLE, "secret");
        assert_eq!(a.len(), 20);
        // Deterministic, and sensitive to both inputs.
        assert_eq!(a, scramble_native(&SCRAMBLE, "secret"));
        assert_ne!(a, scramble_native(&SCRAMBLE, "Secret"));
        let mut other = SCRAMBLE;
        other[0] ^= 0xFF;
        assert_ne!(a, scramble_native(&other, "secret"));
    }

    #[test]
    fn native_scramble_empty_password() {
        assert!(scramble_native(&SCRAMBLE, "").is_empty());
    }

    #[test]
    fn old_scramble_shape() {
        let a = scramble_old(&SCRAMBLE, "secret");
        assert_eq!(a.len(), 8);
        assert_eq!(a, scramble_old(&SCRAMBLE, "secret"));
        assert_ne!(a, scramble_old(&SCRAMBLE, "terces"));
        assert!(scramble_old(&SCRAMBLE, "").is_empty());
    }

    #[test]
    fn old_hash_known_vectors() {
        // Empty input leaves the two registers at their seed values.
        assert_eq!(old_password_hash(b""), [1345345333, 0x1234_5671]);
        // One round of the mixing function; the first register lands with
        // bit 30 set, which catches a mask narrower than 0x7FFFFFFF.
        assert_eq!(old_password_hash(b"a"), [0x6067_1C89, 0x6665_C3FA]);
    }

    #[test]
    fn old_hash_skips_whitespace() {
        assert_eq!(old_password_hash(b"pass word"), old_password_hash(b"password"));
        assert_eq!(old_password_hash(b"pass\tword"), old_password_hash(b"password"));
    }
}
