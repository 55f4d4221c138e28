//! Sender canonicalization applied at the dispatch boundary.
//!
//! WhatsApp reports senders as bare international digit strings
//! (`"16502530000"`). Downstream consumers expect E.164 (`"+16502530000"`).
//! Buffer and lock keys always use the raw id, so this mapping can change
//! without orphaning in-flight bursts.

use phonenumber::Mode;
use tracing::debug;

/// Normalize a raw sender id to E.164.
///
/// The id is read as an international number (a leading `00` counts as
/// `+`). Numbers that parse and validate against the numbering plan are
/// formatted as E.164; anything else is returned trimmed, with a leading
/// `+` added if missing.
pub fn canonicalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let international = match trimmed.strip_prefix("00") {
        Some(rest) => format!("+{rest}"),
        None if trimmed.starts_with('+') => trimmed.to_string(),
        None => format!("+{trimmed}"),
    };

    match phonenumber::parse(None, &international) {
        Ok(number) if phonenumber::is_valid(&number) => {
            number.format().mode(Mode::E164).to_string()
        }
        Ok(_) => {
            debug!(sender = %raw, "sender is not a valid phone number, passing through");
            fallback(trimmed)
        }
        Err(e) => {
            debug!(sender = %raw, error = %e, "sender does not parse as a phone number, passing through");
            fallback(trimmed)
        }
    }
}

fn fallback(trimmed: &str) -> String {
    if trimmed.starts_with('+') {
        trimmed.to_string()
    } else {
        format!("+{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_digits_get_plus() {
        assert_eq!(canonicalize("16502530000"), "+16502530000");
    }

    #[test]
    fn already_canonical_is_unchanged() {
        assert_eq!(canonicalize("+5511987654321"), "+5511987654321");
        assert_eq!(canonicalize("+442070313000"), "+442070313000");
    }

    #[test]
    fn formatting_is_stripped_from_valid_numbers() {
        assert_eq!(canonicalize("+1 (650) 253-0000"), "+16502530000");
        assert_eq!(canonicalize(" 44 20 7031 3000 "), "+442070313000");
    }

    #[test]
    fn double_zero_prefix_becomes_plus() {
        assert_eq!(canonicalize("00442070313000"), "+442070313000");
    }

    #[test]
    fn too_short_falls_back_to_plus_prefix() {
        assert_eq!(canonicalize("12345"), "+12345");
    }

    #[test]
    fn too_long_falls_back_untouched() {
        assert_eq!(canonicalize("+1234567890123456"), "+1234567890123456");
    }

    #[test]
    fn non_numeric_id_passes_through() {
        assert_eq!(canonicalize("abc-user"), "+abc-user");
    }
}
