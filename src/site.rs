use std::fmt;

use serde::Serialize;

use crate::error::AttributionError;

/// A canonical registrable site (eTLD+1), e.g. `shop.example`.
///
/// Reduction of arbitrary host names to their registrable form is the
/// host's job; this type only verifies that the string is already in
/// canonical surface form: non-empty, ASCII lowercase letters, digits,
/// hyphens and interior dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Site(String);

impl Site {
    pub fn parse(raw: &str) -> Result<Self, AttributionError> {
        if raw.is_empty() {
            return Err(AttributionError::InvalidSyntax(
                "site must be a non-empty registrable site".into(),
            ));
        }
        if raw.starts_with('.') || raw.ends_with('.') {
            return Err(AttributionError::InvalidSyntax(format!(
                "site {raw:?} has a leading or trailing dot"
            )));
        }
        let canonical = raw.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-'
        });
        if !canonical {
            return Err(AttributionError::InvalidSyntax(format!(
                "site {raw:?} is not a canonical registrable site"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
