//! Change-log identifiers.
//!
//! An id is the base-36 encoding of a Unix-epoch nanosecond timestamp. The generator
//! never issues the same value twice: when the clock reads at or behind the last issued
//! value (burst submission, coarse clocks, clock steps) the next id is `last + 1`.

use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

static GLOBAL: Lazy<IdGenerator> = Lazy::new(IdGenerator::new);

/// Generate an id from the process-wide generator.
pub fn next_id() -> String {
    GLOBAL.next()
}

#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Mutex<u128>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        self.next_from(now)
    }

    fn next_from(&self, now: u128) -> String {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let value = if now > *last { now } else { *last + 1 };
        *last = value;
        encode_base36(value)
    }
}

pub fn encode_base36(mut value: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::with_capacity(26);
    while value > 0 {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

pub fn decode_base36(s: &str) -> Option<u128> {
    u128::from_str_radix(s, 36).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_base36() {
        assert_eq!(encode_base36(0), "0");
        assert_eq!(encode_base36(35), "z");
        assert_eq!(encode_base36(36), "10");
        assert_eq!(decode_base36("10"), Some(36));
    }

    #[test]
    fn test_tie_is_bumped() {
        let gen = IdGenerator::new();
        let a = gen.next_from(1_000);
        let b = gen.next_from(1_000);
        let c = gen.next_from(999);
        assert_eq!(decode_base36(&a), Some(1_000));
        assert_eq!(decode_base36(&b), Some(1_001));
        assert_eq!(decode_base36(&c), Some(1_002));
    }

    #[test]
    fn test_burst_ids_are_strictly_increasing() {
        let gen = IdGenerator::new();
        let ids: Vec<String> = (0..10_000).map(|_| gen.next()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    proptest! {
        #[test]
        fn prop_ids_strictly_increase(clock in proptest::collection::vec(0u64..1_000_000_000u64, 1..64)) {
            let gen = IdGenerator::new();
            let base = 1_700_000_000_000_000_000u128;
            let mut prev: Option<u128> = None;
            for t in clock {
                let id = gen.next_from(base + t as u128);
                let value = decode_base36(&id).unwrap();
                if let Some(p) = prev {
                    prop_assert!(value > p);
                }
                prev = Some(value);
            }
        }
    }
}
