//! Password storage that never prints its content

use std::fmt;

/// Placeholder shown wherever a secret would otherwise be rendered
pub const REDACTED: &str = "********";

/// Shortest secret that is also hidden inside longer words
pub const MIN_EMBEDDED_SECRET_LEN: usize = 4;

/// Hide `secret` in text that runas did not write itself
///
/// Secrets of at least [`MIN_EMBEDDED_SECRET_LEN`] characters are replaced
/// wherever they occur. Shorter ones only replace whole words, ignoring
/// surrounding punctuation, so ordinary words that merely contain them are
/// left alone.
pub fn scrub_secret(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    if secret.chars().count() >= MIN_EMBEDDED_SECRET_LEN {
        return text.replace(secret, REDACTED);
    }

    text.split_inclusive(char::is_whitespace)
        .map(|piece| {
            let word = piece.trim_end_matches(char::is_whitespace);
            let spacing = &piece[word.len()..];
            if word == secret {
                return format!("{}{}", REDACTED, spacing);
            }
            let is_punctuation = |c: char| c.is_ascii_punctuation();
            let core = word.trim_matches(is_punctuation);
            if core == secret {
                let start = word.len() - word.trim_start_matches(is_punctuation).len();
                let end = start + core.len();
                return format!("{}{}{}{}", &word[..start], REDACTED, &word[end..], spacing);
            }
            piece.to_string()
        })
        .collect()
}

/// A password that zeroes its buffer on drop
///
/// `Debug` and `Display` always render [`REDACTED`].
#[derive(Clone, Default)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        SecretString(secret.into())
    }

    /// Access the secret for an OS call
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        // SAFETY: zeroes are valid UTF-8 and the string is not used afterwards
        unsafe {
            for byte in self.0.as_bytes_mut() {
                std::ptr::write_volatile(byte, 0);
            }
        }
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString({})", REDACTED)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretString {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_and_display_are_redacted() {
        let secret = SecretString::new("hunter2");
        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert_eq!(secret.to_string(), REDACTED);
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_scrub_long_secret_anywhere() {
        assert_eq!(
            scrub_secret("user=bob;pass=hunter2 rejected", "hunter2"),
            "user=bob;pass=******** rejected"
        );
    }

    #[test]
    fn test_scrub_short_secret_whole_words_only() {
        assert_eq!(
            scrub_secret("logon rejected for password a", "a"),
            "logon rejected for password ********"
        );
        assert_eq!(scrub_secret("Domain: \"a\".", "a"), "Domain: \"********\".");
        assert_eq!(scrub_secret("error 0 at 10", "0"), "error ******** at 10");
    }

    #[test]
    fn test_scrub_keeps_line_breaks_and_empty_secret() {
        assert_eq!(scrub_secret("x\n  a\n", "a"), "x\n  ********\n");
        assert_eq!(scrub_secret("nothing to hide", ""), "nothing to hide");
    }

    #[test]
    fn test_empty_secret() {
        assert!(SecretString::new("").is_empty());
        assert!(!SecretString::new("x").is_empty());
    }
}
