//! Compiled regex patterns for reading telephony addresses.
//!
//! Compiled once on first use.

use once_cell::sync::Lazy;
use regex::Regex;

/// `scheme:user@host`, capturing the user-part.
pub static RE_ADDRESS_USER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*:([^@]+)@.+$").unwrap());

/// Extracts the short display identity from a telephony address.
///
/// Addresses of the form `scheme:user@host` collapse to `user`. Anything else
/// is returned trimmed but otherwise unchanged, so a display never comes back
/// empty for a non-empty input.
pub fn display_identity(address: &str) -> String {
    let trimmed = address.trim();
    RE_ADDRESS_USER
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|user| user.as_str().to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_user_part() {
        assert_eq!(display_identity("sip:1002@pbx.local"), "1002");
        assert_eq!(display_identity("sips:alice@example.com:5061"), "alice");
        assert_eq!(display_identity("  tel:+15551234@gw  "), "+15551234");
    }

    #[test]
    fn passes_through_unparseable_addresses() {
        assert_eq!(display_identity("1002"), "1002");
        assert_eq!(display_identity("sip:nohost"), "sip:nohost");
        assert_eq!(display_identity("operator@pbx.local"), "operator@pbx.local");
        assert_eq!(display_identity(""), "");
    }
}
