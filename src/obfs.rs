//! Size-hiding padding and timing jitter.
//!
//! Padding is applied inside the encrypted connection before encryption, so
//! on-wire frame sizes do not reveal real payload sizes. The padded plaintext
//! layout is `[2B BE original_length][original_bytes][random_padding]`.

use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Traffic obfuscation knobs. Padding bounds are bytes, delays milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfsConfig {
    pub enabled: bool,
    pub min_padding: usize,
    pub max_padding: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Frames smaller than this are never jittered; delaying mux keepalives
/// kills the session.
pub const JITTER_FLOOR: usize = 128;

/// Short ASCII decoys spliced into padding so that even the padding region's
/// byte distribution resembles HTTP chatter.
const DECOY_PATTERNS: &[&str] = &[
    "User-Agent: ",
    "GET / HTTP/1.1",
    "POST / HTTP/1.1",
    "Host: ",
    "Accept: */*",
    "Content-Type: application/octet-stream",
    "Connection: keep-alive",
    "Cache-Control: no-cache",
];

/// Uniform random integer in `[0, n)` from the OS entropy source.
/// Returns 0 for `n == 0`.
pub fn secure_rand(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    // Rejection sampling keeps the distribution uniform.
    let n = n as u64;
    let zone = u64::MAX - (u64::MAX % n);
    loop {
        let v = OsRng.next_u64();
        if v < zone {
            return (v % n) as usize;
        }
    }
}

/// Uniform random integer in `[lo, hi]` inclusive.
pub fn secure_rand_range(lo: usize, hi: usize) -> usize {
    if hi <= lo {
        return lo;
    }
    lo + secure_rand(hi - lo + 1)
}

/// Appends `[2B len][data][padding]` to `out`. Padding bytes are always
/// randomized, including on any fallback path, and carry a decoy string at a
/// random offset when there is room.
pub fn pad_into(data: &[u8], obfs: &ObfsConfig, out: &mut Vec<u8>) {
    debug_assert!(data.len() <= u16::MAX as usize);
    let pad_len = secure_rand_range(obfs.min_padding, obfs.max_padding);

    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);

    if pad_len > 0 {
        let start = out.len();
        out.resize(start + pad_len, 0);
        let padding = &mut out[start..];
        OsRng.fill_bytes(padding);

        if pad_len >= 13 {
            let decoy = DECOY_PATTERNS[secure_rand(DECOY_PATTERNS.len())].as_bytes();
            if decoy.len() < pad_len {
                let offset = secure_rand(pad_len - decoy.len() + 1);
                padding[offset..offset + decoy.len()].copy_from_slice(decoy);
            }
        }
    }
}

/// Strips the padding header, returning the original payload slice.
/// `None` signals a malformed padded payload; the connection must drop.
pub fn unpad(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 2 {
        return None;
    }
    let orig_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if orig_len + 2 > data.len() {
        return None;
    }
    Some(&data[2..2 + orig_len])
}

/// Post-write delay for large frames, or `None` when jitter does not apply.
pub fn jitter_delay(obfs: &ObfsConfig, unpadded_len: usize) -> Option<Duration> {
    if !obfs.enabled || obfs.max_delay_ms == 0 || unpadded_len <= JITTER_FLOOR {
        return None;
    }
    if obfs.max_delay_ms <= obfs.min_delay_ms {
        return None;
    }
    let ms = secure_rand_range(obfs.min_delay_ms as usize, obfs.max_delay_ms as usize);
    (ms > 0).then(|| Duration::from_millis(ms as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(min: usize, max: usize) -> ObfsConfig {
        ObfsConfig {
            enabled: true,
            min_padding: min,
            max_padding: max,
            ..Default::default()
        }
    }

    #[test]
    fn test_pad_unpad_roundtrip() {
        let data = b"some tunnel payload";
        for _ in 0..50 {
            let mut out = Vec::new();
            pad_into(data, &cfg(4, 64), &mut out);
            assert!(out.len() >= 2 + data.len() + 4);
            assert!(out.len() <= 2 + data.len() + 64);
            assert_eq!(unpad(&out).unwrap(), data);
        }
    }

    #[test]
    fn test_pad_zero_padding() {
        let mut out = Vec::new();
        pad_into(b"x", &cfg(0, 0), &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(unpad(&out).unwrap(), b"x");
    }

    #[test]
    fn test_pad_empty_payload() {
        let mut out = Vec::new();
        pad_into(b"", &cfg(8, 8), &mut out);
        assert_eq!(unpad(&out).unwrap(), b"");
    }

    #[test]
    fn test_unpad_rejects_short_header() {
        assert!(unpad(&[]).is_none());
        assert!(unpad(&[0]).is_none());
    }

    #[test]
    fn test_unpad_rejects_oversized_length() {
        // Claims 100 bytes of payload in a 4-byte buffer.
        let bad = [0x00, 0x64, 0xaa, 0xbb];
        assert!(unpad(&bad).is_none());
    }

    #[test]
    fn test_secure_rand_range_bounds() {
        for _ in 0..1000 {
            let v = secure_rand_range(4, 32);
            assert!((4..=32).contains(&v));
        }
        assert_eq!(secure_rand_range(7, 7), 7);
        assert_eq!(secure_rand_range(9, 3), 9);
    }

    #[test]
    fn test_jitter_skips_small_frames() {
        let obfs = ObfsConfig {
            enabled: true,
            min_delay_ms: 1,
            max_delay_ms: 5,
            ..Default::default()
        };
        assert!(jitter_delay(&obfs, 64).is_none());
        assert!(jitter_delay(&obfs, 129).is_some());
    }

    #[test]
    fn test_jitter_disabled() {
        let obfs = ObfsConfig::default();
        assert!(jitter_delay(&obfs, 100_000).is_none());
    }
}
