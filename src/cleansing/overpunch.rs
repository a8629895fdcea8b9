//! COBOL overpunch decoding: the last character of the field carries both
//! the final digit and the sign of the whole number.

use crate::error::BadValue;

/// Decode an overpunch signed number, inserting a decimal point `npos`
/// digits from the right. Returns the decoded number as text.
pub fn decode(input: &str, npos: usize) -> Result<String, BadValue> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let mut chars: Vec<char> = trimmed.chars().collect();
    let last = chars.pop().unwrap();
    let (digit, negative) = decode_last(last)
        .ok_or_else(|| BadValue::new(format!("invalid overpunch character '{last}'")))?;
    let mut digits = String::with_capacity(chars.len() + 1);
    for c in &chars {
        if !c.is_ascii_digit() {
            return Err(BadValue::new(format!("invalid overpunch digit '{c}'")));
        }
        digits.push(*c);
    }
    digits.push(digit);

    // left-pad so the decimal point has digits on both sides
    while digits.len() <= npos {
        digits.insert(0, '0');
    }
    if npos > 0 {
        digits.insert(digits.len() - npos, '.');
    }
    if negative {
        digits.insert(0, '-');
    }
    Ok(digits)
}

fn decode_last(c: char) -> Option<(char, bool)> {
    match c {
        '0'..='9' => Some((c, false)),
        '{' => Some(('0', false)),
        'A'..='I' => Some((char::from(b'1' + (c as u8 - b'A')), false)),
        '}' => Some(('0', true)),
        'J'..='R' => Some((char::from(b'1' + (c as u8 - b'J')), true)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_and_negative_overpunch() {
        assert_eq!(decode("123{", 0).unwrap(), "1230");
        assert_eq!(decode("123A", 0).unwrap(), "1231");
        assert_eq!(decode("123}", 0).unwrap(), "-1230");
        assert_eq!(decode("123J", 0).unwrap(), "-1231");
        assert_eq!(decode("1234", 0).unwrap(), "1234");
    }

    #[test]
    fn decimal_position_inserts_the_point() {
        assert_eq!(decode("12345", 2).unwrap(), "123.45");
        assert_eq!(decode("1N", 2).unwrap(), "-0.15");
    }

    #[test]
    fn invalid_characters_are_row_errors() {
        assert!(decode("12x4", 0).is_err());
        assert!(decode("12*", 0).is_err());
    }
}
