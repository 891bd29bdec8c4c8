use serde::Deserialize;
use url::{ParseError, Url};

use crate::error::ValidationError;

pub const MAX_TITLE_LEN: usize = 255;

/// Raw form input, untrimmed.
#[derive(Debug, Clone, Deserialize)]
pub struct BookmarkInput {
    pub title: String,
    pub url: String,
}

impl BookmarkInput {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidBookmark {
    pub title: String,
    pub url: String,
}

/// Trims and checks a submission, returning the title and the normalized URL.
///
/// Title length is counted in characters. An input with no scheme at all
/// (`example.com/x`) is rejected as an unsupported scheme rather than as an
/// invalid URL.
pub fn validate(input: &BookmarkInput) -> Result<ValidBookmark, ValidationError> {
    let title = input.title.trim();
    let url = input.url.trim();

    if title.is_empty() {
        return Err(ValidationError::TitleRequired);
    }

    if title.chars().count() > MAX_TITLE_LEN {
        return Err(ValidationError::TitleTooLong);
    }

    if url.is_empty() {
        return Err(ValidationError::UrlRequired);
    }

    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(ParseError::RelativeUrlWithoutBase) => return Err(ValidationError::UnsupportedScheme),
        Err(_) => return Err(ValidationError::UrlInvalid),
    };

    match parsed.scheme() {
        "http" | "https" => {}
        _ => return Err(ValidationError::UnsupportedScheme),
    }

    Ok(ValidBookmark {
        title: title.to_string(),
        url: parsed.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trims_and_normalizes() {
        let valid = validate(&BookmarkInput::new("A", "http://x.com")).unwrap();
        assert_eq!(valid.title, "A");
        assert_eq!(valid.url, "http://x.com/");

        let valid = validate(&BookmarkInput::new("  Docs  ", "  HTTPS://Docs.RS/tokio ")).unwrap();
        assert_eq!(valid.title, "Docs");
        assert_eq!(valid.url, "https://docs.rs/tokio");
    }

    #[test]
    fn test_missing_scheme_is_a_scheme_error() {
        let err = validate(&BookmarkInput::new(" A ", "example.com/x ")).unwrap_err();
        assert_eq!(err, ValidationError::UnsupportedScheme);
    }

    #[test]
    fn test_rejects_other_schemes() {
        for url in ["ftp://example.com/file", "javascript:alert(1)", "mailto:me@example.com"] {
            let err = validate(&BookmarkInput::new("A", url)).unwrap_err();
            assert_eq!(err, ValidationError::UnsupportedScheme, "{url}");
        }
    }

    #[test]
    fn test_rejects_malformed_urls() {
        for url in ["http://", "https://exa mple.com", "http://[::1"] {
            let err = validate(&BookmarkInput::new("A", url)).unwrap_err();
            assert_eq!(err, ValidationError::UrlInvalid, "{url}");
        }
    }

    #[test]
    fn test_required_fields() {
        assert_eq!(
            validate(&BookmarkInput::new("   ", "http://a")).unwrap_err(),
            ValidationError::TitleRequired
        );
        assert_eq!(
            validate(&BookmarkInput::new("A", " \t ")).unwrap_err(),
            ValidationError::UrlRequired
        );
    }

    #[test]
    fn test_title_length_boundary() {
        let at_limit = "a".repeat(MAX_TITLE_LEN);
        assert!(validate(&BookmarkInput::new(at_limit, "http://a")).is_ok());

        let over_limit = "a".repeat(MAX_TITLE_LEN + 1);
        assert_eq!(
            validate(&BookmarkInput::new(over_limit, "http://a")).unwrap_err(),
            ValidationError::TitleTooLong
        );

        let padded = format!("  {}  ", "é".repeat(MAX_TITLE_LEN));
        assert!(validate(&BookmarkInput::new(padded, "http://a")).is_ok());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(ValidationError::TitleRequired.to_string(), "title required");
        assert_eq!(ValidationError::TitleTooLong.to_string(), "title too long");
        assert_eq!(ValidationError::UrlRequired.to_string(), "url required");
        assert_eq!(ValidationError::UrlInvalid.to_string(), "url invalid");
        assert_eq!(ValidationError::UnsupportedScheme.to_string(), "unsupported scheme");
    }
}
