//! Frame checksums
//!
//! Sensor firmware uses a plain 8-bit sum over the frame body.

/// Sum of all bytes modulo 256
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Verify a frame whose last byte is the sum8 of everything before it
pub fn verify_sum8(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((&expected, body)) => sum8(body) == expected,
        None => false,
    }
}

/// Append the sum8 of `frame` to it
pub fn append_sum8(frame: &mut Vec<u8>) {
    let sum = sum8(frame);
    frame.push(sum);
}
