//! Time-prefixed opaque identifiers.
//!
//! A qid starts with the base-32 rendering of seconds elapsed since
//! [`QID_TIME_ORIGIN`] and is padded with random alphanumeric characters up
//! to the requested length, so identifiers sort roughly by creation time.

use rand::Rng;

const QID_TIME_ORIGIN: i64 = 167253120;

const QID_RANDOM_BYTES: &[u8] = b"0123456789\
    ABCDEFGHIJKLMNOPQRSTUVWXYZ\
    abcdefghijklmnopqrstuvwxyz";

const BASE32_DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuv";

fn format_base32(mut v: u64) -> String {
    if v == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while v > 0 {
        buf.push(BASE32_DIGITS[(v % 32) as usize]);
        v /= 32;
    }
    buf.reverse();
    String::from_utf8(buf).expect("base32 digits are ascii")
}

/// Generate an opaque identifier of exactly `len` characters.
///
/// Panics if `len` is outside `[8, 8192]`; callers pass compile-time lengths.
pub fn generate_qid(len: usize) -> String {
    assert!(
        (8..=8192).contains(&len),
        "qid len must be in interval [8, 8192]"
    );

    let t = (chrono::Utc::now().timestamp() - QID_TIME_ORIGIN) as u64;
    let mut res = format_base32(t);
    res.reserve(len.saturating_sub(res.len()));

    let mut rng = rand::thread_rng();
    while res.len() < len {
        res.push(QID_RANDOM_BYTES[rng.gen_range(0..QID_RANDOM_BYTES.len())] as char);
    }
    res
}
