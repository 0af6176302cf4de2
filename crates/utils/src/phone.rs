//! Taiwanese mobile number handling. Phones double as login identifiers.

/// Normalizes a phone number to the local `09xxxxxxxx` form.
///
/// Non-digits are stripped and an international `886` prefix becomes `0`.
/// Returns `None` unless the result is a 10-digit number starting with `09`.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    let local = match digits.strip_prefix("886") {
        Some(rest) => format!("0{}", rest),
        None => digits,
    };

    (local.len() == 10 && local.starts_with("09")).then_some(local)
}

/// The default password of an account: the last three digits of its phone.
pub fn password_suffix(phone: &str) -> String {
    let start = phone.len().saturating_sub(3);
    phone[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_local_and_international_forms() {
        assert_eq!(normalize_phone("0912345678").as_deref(), Some("0912345678"));
        assert_eq!(normalize_phone("0912-345-678").as_deref(), Some("0912345678"));
        assert_eq!(normalize_phone("+886 912 345 678").as_deref(), Some("0912345678"));
    }

    #[test]
    fn rejects_landlines_and_short_numbers() {
        assert_eq!(normalize_phone("0223456789"), None);
        assert_eq!(normalize_phone("091234567"), None);
        assert_eq!(normalize_phone(""), None);
    }

    #[test]
    fn suffix_is_last_three_digits() {
        assert_eq!(password_suffix("0912345678"), "678");
        assert_eq!(password_suffix("12"), "12");
    }
}
