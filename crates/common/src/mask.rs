//! Display helper for credential values that must never be logged in full

/// Number of leading characters kept visible by [`mask_key`].
const VISIBLE_PREFIX: usize = 8;

/// Mask a credential for logs and admin responses: the first eight
/// characters followed by `***`. Values of eight characters or fewer are
/// fully hidden.
pub fn mask_key(key: &str) -> String {
    let visible: String = key.chars().take(VISIBLE_PREFIX).collect();
    if key.chars().count() <= VISIBLE_PREFIX {
        return "***".to_string();
    }
    format!("{visible}***")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_key_keeps_prefix() {
        assert_eq!(mask_key("AIzaSyD-abcdefghijkl"), "AIzaSyD-***");
    }

    #[test]
    fn short_key_fully_hidden() {
        assert_eq!(mask_key("sk-1234"), "***");
        assert_eq!(mask_key("12345678"), "***");
        assert_eq!(mask_key(""), "***");
    }

    #[test]
    fn multibyte_prefix_does_not_split_chars() {
        let masked = mask_key("ключключключ");
        assert_eq!(masked, "ключключ***");
    }
}
