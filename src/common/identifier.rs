//! # Homework Id Validation
//!
//! The only gate between client-supplied bytes and a filesystem path. A
//! homework id is exactly nine uppercase hex digits (`[A-F0-9]{9}`), so a valid
//! id can never contain a separator, a dot, or a NUL byte.

use std::fmt;

use super::error::UploadError;

/// Length of every homework id, in bytes.
pub const HOMEWORK_ID_LENGTH: usize = 9;

/// A homework id that passed [`validate`].
///
/// The inner string is private, so holding an `Identifier` proves the value
/// is safe to use as a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_digit() || ('A'..='F').contains(&c)
}

/// Validate a candidate homework id.
///
/// # Returns
/// - `Ok(Identifier)`: the candidate is exactly nine characters of `[A-F0-9]`
/// - `Err(UploadError::ValidationRejected)`: empty, wrong length, reserved,
///   or containing any other character
///
/// # Example
/// ```ignore
/// let id = validate("ABC123456")?;
/// assert_eq!(id.as_str(), "ABC123456");
/// ```
pub fn validate(candidate: &str) -> Result<Identifier, UploadError> {
    let reject = |reason: String| UploadError::ValidationRejected {
        candidate: candidate.chars().take(50).collect(),
        reason,
    };

    if candidate.is_empty() {
        return Err(reject("empty".to_string()));
    }
    if candidate == "." || candidate == ".." {
        return Err(reject("reserved name".to_string()));
    }
    // Char-wise walk first so the reason names the offending character even
    // when the length is also wrong.
    if let Some(bad) = candidate.chars().find(|c| !is_allowed(*c)) {
        return Err(reject(format!("illegal character {:?}", bad)));
    }
    if candidate.len() > HOMEWORK_ID_LENGTH {
        return Err(reject(format!(
            "too long ({} > {})",
            candidate.len(),
            HOMEWORK_ID_LENGTH
        )));
    }
    if candidate.len() < HOMEWORK_ID_LENGTH {
        return Err(reject(format!(
            "too short ({} < {})",
            candidate.len(),
            HOMEWORK_ID_LENGTH
        )));
    }

    Ok(Identifier(candidate.to_string()))
}
