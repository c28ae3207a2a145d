use std::fmt;
use std::path::MAIN_SEPARATOR;

use rand::RngCore;
use thiserror::Error;

const PLACEHOLDER: char = '*';
const TOKEN_LEN: usize = 16;

/// A file name template for staging and backup artifacts.
///
/// The last `*` in the template is replaced by a random token; a template
/// without `*` gets the token appended. `".profile-*.tmp"` produces names like
/// `.profile-3f09a1c2b47de610.tmp`.
#[derive(Clone, PartialEq, Eq)]
pub struct NamePattern {
    prefix: String,
    suffix: String,
}

#[derive(Debug, Error)]
#[error("name pattern {0:?} contains a path separator")]
pub struct PatternError(pub String);

impl NamePattern {
    pub fn new(pattern: &str) -> Result<NamePattern, PatternError> {
        if pattern.contains('/') || pattern.contains(MAIN_SEPARATOR) {
            return Err(PatternError(pattern.to_string()));
        }

        Ok(match pattern.rfind(PLACEHOLDER) {
            Some(pos) => NamePattern {
                prefix: pattern[..pos].to_string(),
                suffix: pattern[pos + PLACEHOLDER.len_utf8()..].to_string(),
            },
            None => NamePattern {
                prefix: pattern.to_string(),
                suffix: String::new(),
            },
        })
    }

    /// The staging pattern used when the caller doesn't supply one:
    /// `.<file name>.*.tmp`.
    pub(crate) fn staging_for(file_name: &str) -> NamePattern {
        NamePattern {
            prefix: format!(".{}.", file_name),
            suffix: ".tmp".to_string(),
        }
    }

    /// An empty pattern; used by callers to decline a backup.
    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty() && self.suffix.is_empty()
    }

    /// Fill the placeholder with a fresh token drawn from `rng`.
    ///
    /// `rng` should be a cryptographic generator: the point of the token is
    /// that nobody else can predict the name and plant something there first.
    pub fn generate<R: RngCore + ?Sized>(&self, rng: &mut R) -> String {
        format!(
            "{}{:016x}{}",
            self.prefix,
            rng.next_u64(),
            self.suffix
        )
    }

    /// Whether `file_name` could have been produced by [`generate`](Self::generate).
    pub fn matches(&self, file_name: &str) -> bool {
        file_name
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_suffix(self.suffix.as_str()))
            .map_or(false, |token| {
                token.len() == TOKEN_LEN
                    && token
                        .bytes()
                        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
            })
    }
}

impl fmt::Debug for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NamePattern({:?})", self.to_string())
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}{}", self.prefix, PLACEHOLDER, self.suffix)
    }
}
