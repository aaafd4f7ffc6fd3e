//! RTMP handshake: the Adobe HMAC-SHA256 digest variant with an echo
//! fallback for peers that send a zero version.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Length of the C1/S1/C2/S2 segments.
pub const HANDSHAKE_SIZE: usize = 1536;
/// RTMP protocol version carried in C0/S0.
pub const HANDSHAKE_VERSION: u8 = 3;
/// Server version field written into S1.
pub const SERVER_VERSION: u32 = 0x0d0e0a0d;

/// "Genuine Adobe Flash Player 001" + shared constant tail.
pub static CLIENT_FULL_KEY: [u8; 62] = [
    b'G', b'e', b'n', b'u', b'i', b'n', b'e', b' ', b'A', b'd', b'o', b'b', b'e', b' ', b'F', b'l',
    b'a', b's', b'h', b' ', b'P', b'l', b'a', b'y', b'e', b'r', b' ', b'0', b'0', b'1', 0xF0, 0xEE,
    0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E, 0x00, 0xD0, 0xD1, 0x02, 0x9E, 0x7E, 0x57, 0x6E, 0xEC,
    0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB, 0x93, 0xB8, 0xE6, 0x36, 0xCF, 0xEB, 0x31, 0xAE,
];

/// "Genuine Adobe Flash Media Server 001" + shared constant tail.
pub static SERVER_FULL_KEY: [u8; 68] = [
    b'G', b'e', b'n', b'u', b'i', b'n', b'e', b' ', b'A', b'd', b'o', b'b', b'e', b' ', b'F', b'l',
    b'a', b's', b'h', b' ', b'M', b'e', b'd', b'i', b'a', b' ', b'S', b'e', b'r', b'v', b'e', b'r',
    b' ', b'0', b'0', b'1', 0xF0, 0xEE, 0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E, 0x00, 0xD0, 0xD1,
    0x02, 0x9E, 0x7E, 0x57, 0x6E, 0xEC, 0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB, 0x93, 0xB8, 0xE6, 0x36,
    0xCF, 0xEB, 0x31, 0xAE,
];

/// The client digests with the first 30 key bytes, the server with the
/// first 36.
pub fn client_partial_key() -> &'static [u8] {
    &CLIENT_FULL_KEY[..30]
}

pub fn server_partial_key() -> &'static [u8] {
    &SERVER_FULL_KEY[..36]
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over `src`, skipping the 32 digest bytes at `gap` when
/// given.
pub fn make_digest(key: &[u8], src: &[u8], gap: Option<usize>) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    match gap {
        None => mac.update(src),
        Some(gap) => {
            mac.update(&src[..gap]);
            mac.update(&src[gap + 32..]);
        }
    }
    mac.finalize().into_bytes().into()
}

/// The digest offset scheme: sum of the four bytes at `base`, mod 728,
/// plus `base + 4`.
pub fn calc_digest_pos(p: &[u8], base: usize) -> usize {
    let sum: usize = p[base..base + 4].iter().map(|&b| b as usize).sum();
    (sum % 728) + base + 4
}

/// Verifies the digest at the position derived from `base`; returns its
/// offset when it matches.
pub fn find_digest(p: &[u8], key: &[u8], base: usize) -> Option<usize> {
    let gap = calc_digest_pos(p, base);
    let digest = make_digest(key, p, Some(gap));
    if p[gap..gap + 32] == digest {
        Some(gap)
    } else {
        None
    }
}

/// Locates the peer digest in a C1/S1 segment (base 772, then base 8)
/// and derives the key for the reply's second segment.
pub fn parse_1(p: &[u8], peer_key: &[u8], key: &[u8]) -> Option<[u8; 32]> {
    let pos = find_digest(p, peer_key, 772).or_else(|| find_digest(p, peer_key, 8))?;
    Some(make_digest(key, &p[pos..pos + 32], None))
}

/// Builds a version byte plus C1/S1 segment in `p` (1537 bytes): time,
/// version, random fill, and the embedded digest.
pub fn create_01(p: &mut [u8], time: u32, ver: u32, key: &[u8]) {
    p[0] = HANDSHAKE_VERSION;
    let p1 = &mut p[1..];
    rand::Rng::fill(&mut rand::thread_rng(), &mut p1[8..]);
    p1[0..4].copy_from_slice(&time.to_be_bytes());
    p1[4..8].copy_from_slice(&ver.to_be_bytes());
    let gap = calc_digest_pos(p1, 8);
    let digest = make_digest(key, p1, Some(gap));
    p1[gap..gap + 32].copy_from_slice(&digest);
}

/// Builds a C2/S2 segment: random fill with the keyed digest over the
/// first 1504 bytes in the last 32.
pub fn create_2(p: &mut [u8], key: &[u8]) {
    rand::Rng::fill(&mut rand::thread_rng(), p);
    let gap = p.len() - 32;
    let digest = make_digest(key, p, Some(gap));
    p[gap..].copy_from_slice(&digest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn server_accepts_digest_c1() {
        // a digest-scheme C1 as a Flash client would build it
        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        create_01(&mut c0c1, 0, 0x0a00_0c02, client_partial_key());
        let c1 = &c0c1[1..];

        let digest = parse_1(c1, client_partial_key(), SERVER_FULL_KEY.as_slice())
            .expect("client digest located");

        // S2's trailing 32 bytes must be the keyed digest of its first
        // 1504 bytes
        let mut s2 = vec![0u8; HANDSHAKE_SIZE];
        create_2(&mut s2, &digest);
        let expect = make_digest(&digest, &s2, Some(HANDSHAKE_SIZE - 32));
        assert_eq!(&s2[HANDSHAKE_SIZE - 32..], &expect[..]);
    }

    #[test]
    fn tampered_digest_is_rejected() {
        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        create_01(&mut c0c1, 0, 1, client_partial_key());
        let gap = calc_digest_pos(&c0c1[1..], 8);
        c0c1[1 + gap] ^= 0xff;
        assert!(parse_1(&c0c1[1..], client_partial_key(), SERVER_FULL_KEY.as_slice()).is_none());
    }

    #[test]
    fn digest_pos_in_range() {
        let mut p = vec![0u8; HANDSHAKE_SIZE];
        p[8..12].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        let pos = calc_digest_pos(&p, 8);
        assert!(pos + 32 <= 8 + 728 + 4 + 32);
        assert!(pos >= 12);
    }
}
