//! Displayable fingerprint codes.
//!
//! A privacy code is a stable, human-comparable rendering of a byte
//! sequence: the bytes are chunked into groups of five, each group is read
//! as a big-endian integer mod 10^5, and the result is printed as
//! space-separated zero-padded 5-digit decimal groups. Two clients holding
//! the same bytes always render the same code.

/// Bytes consumed per 5-digit group.
const GROUP_BYTES: usize = 5;

/// Decimal digits produced per group.
const GROUP_DIGITS: usize = 5;

/// Render `data` as a privacy code of `digits` decimal digits.
///
/// Returns an empty string when `digits` is not a multiple of five or
/// `data` is too short to fill every group.
pub fn generate_displayable_code(data: &[u8], digits: usize) -> String {
    if digits == 0 || digits % GROUP_DIGITS != 0 {
        return String::new();
    }
    let groups = digits / GROUP_DIGITS;
    if data.len() < groups * GROUP_BYTES {
        return String::new();
    }

    let mut code = String::with_capacity(digits + groups - 1);
    for group in data.chunks_exact(GROUP_BYTES).take(groups) {
        let mut value: u64 = 0;
        for &byte in group {
            value = (value << 8) | u64::from(byte);
        }
        if !code.is_empty() {
            code.push(' ');
        }
        code.push_str(&format!("{:05}", value % 100_000));
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_bytes_render_as_zeros() {
        assert_eq!(generate_displayable_code(&[0u8; 30], 30), "00000 00000 00000 00000 00000 00000");
    }

    #[test]
    fn groups_are_independent() {
        let mut data = [0u8; 30];
        // 1 in the last byte of the second group.
        data[9] = 1;
        let code = generate_displayable_code(&data, 30);
        assert_eq!(code, "00000 00001 00000 00000 00000 00000");
    }

    #[test]
    fn group_value_is_mod_100000() {
        // 5 bytes of 0xFF = 1099511627775; mod 100000 = 27775.
        let mut data = [0u8; 30];
        data[..5].copy_from_slice(&[0xFF; 5]);
        let code = generate_displayable_code(&data, 30);
        assert!(code.starts_with("27775 "));
    }

    #[test]
    fn identical_input_identical_code() {
        let data: Vec<u8> = (0..64).collect();
        assert_eq!(generate_displayable_code(&data, 45), generate_displayable_code(&data, 45));
    }

    #[test]
    fn short_input_yields_empty() {
        assert_eq!(generate_displayable_code(&[1, 2, 3], 30), "");
    }

    #[test]
    fn non_multiple_digits_yields_empty() {
        assert_eq!(generate_displayable_code(&[0u8; 64], 13), "");
    }

    #[test]
    fn forty_five_digit_code_has_nine_groups() {
        let data: Vec<u8> = (0..64).collect();
        let code = generate_displayable_code(&data, 45);
        assert_eq!(code.split(' ').count(), 9);
        assert!(code.split(' ').all(|group| group.len() == 5));
    }
}
