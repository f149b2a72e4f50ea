use maestro_core::{MaestroError, MaestroResult};

/// Longest identifier accepted for anything that becomes part of a path.
const MAX_IDENTIFIER_LEN: usize = 128;

/// Validate an identifier that will be used to build an on-disk path.
///
/// Accepts ASCII letters, digits, `-` and `_` only, which rules out `..`,
/// path separators, drive prefixes and NUL bytes in one check.
pub fn validate_identifier(id: &str) -> MaestroResult<&str> {
    if id.is_empty() {
        return Err(MaestroError::Validation("identifier is empty".into()));
    }
    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(MaestroError::Validation(format!(
            "identifier longer than {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(MaestroError::Validation(format!(
            "identifier '{}' contains forbidden character {bad:?}",
            id.escape_default()
        )));
    }
    Ok(id)
}

/// Input sanitizer for text parsed out of agent output and HTTP bodies.
pub struct Sanitizer {
    max_message_length: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            max_message_length: 100_000,
        }
    }
}

impl Sanitizer {
    /// Create a sanitizer with a custom length limit.
    pub fn new(max_message_length: usize) -> Self {
        Self { max_message_length }
    }

    /// Sanitize a string: strip control characters, enforce length limits.
    pub fn sanitize(&self, input: &str) -> SanitizeResult {
        if input.len() > self.max_message_length {
            return SanitizeResult::Rejected("Input exceeds maximum length".to_string());
        }

        let cleaned: String = input
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
            .collect();

        if cleaned.trim().is_empty() && !input.is_empty() {
            return SanitizeResult::Rejected("Input contains no printable text".to_string());
        }

        if cleaned != input {
            SanitizeResult::Cleaned(cleaned)
        } else {
            SanitizeResult::Clean(cleaned)
        }
    }
}

/// Outcome of [`Sanitizer::sanitize`].
#[derive(Debug, PartialEq)]
pub enum SanitizeResult {
    /// Input was already clean.
    Clean(String),
    /// Input was cleaned (control characters removed).
    Cleaned(String),
    /// Input was rejected entirely.
    Rejected(String),
}

impl SanitizeResult {
    /// Whether the input was rejected.
    pub fn is_rejected(&self) -> bool {
        matches!(self, SanitizeResult::Rejected(_))
    }

    /// The usable text, if any.
    pub fn into_string(self) -> Option<String> {
        match self {
            SanitizeResult::Clean(s) | SanitizeResult::Cleaned(s) => Some(s),
            SanitizeResult::Rejected(_) => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_identifier("uw-20261017-abc_1").is_ok());
        assert!(validate_identifier("0f8fad5b-d9cb-469f-a165-70867728950e").is_ok());
    }

    #[test]
    fn test_path_traversal_rejected() {
        for bad in ["../etc", "..", "a/b", "a\\b", "", "x\0y", ".hidden", "c:evil"] {
            assert!(validate_identifier(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_overlong_identifier_rejected() {
        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_identifier(&long).is_err());
    }

    #[test]
    fn test_clean_input() {
        let s = Sanitizer::default();
        let result = s.sanitize("Summarize the report\nthen file it");
        assert!(matches!(result, SanitizeResult::Clean(_)));
    }

    #[test]
    fn test_control_chars_stripped() {
        let s = Sanitizer::default();
        let result = s.sanitize("fix\x00\x1b the build");
        assert_eq!(result, SanitizeResult::Cleaned("fix the build".to_string()));
    }

    #[test]
    fn test_length_rejection() {
        let s = Sanitizer::new(10);
        assert!(s.sanitize("This is too long for the limit").is_rejected());
    }

    #[test]
    fn test_only_control_chars_rejected() {
        let s = Sanitizer::default();
        assert!(s.sanitize("\x01\x02").is_rejected());
    }
}
