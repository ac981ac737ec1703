use std::fmt;
use std::str::FromStr;

use crate::error::{WorkspaceError, WorkspaceResult};

/// The longest key accepted.
///
/// Bookkeeping files append up to 15 bytes to a key (`<key>.lock`, `<key>.bin` and the
/// temporary `<key>-XXXXXX` directories), which still has to fit the 255 byte file name limit.
pub const MAX_KEY_LEN: usize = 240;

/// The key of a workspace, usable verbatim as a single path segment.
///
/// Keys are validated instead of sanitized, two different keys therefore always name two
/// different directories. A key may not:
/// - be empty or longer than [`MAX_KEY_LEN`] bytes,
/// - start with a `.`, which also rules out `.` and `..` and is reserved for bookkeeping,
/// - contain a path separator (`/`, `\`), a `:` or a NUL byte.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkspaceKey(String);

impl WorkspaceKey {
    pub fn new(key: impl Into<String>) -> WorkspaceResult<Self> {
        let key = key.into();
        match validate(&key) {
            Ok(()) => Ok(Self(key)),
            Err(reason) => Err(WorkspaceError::InvalidKey { key, reason }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("key is empty");
    }
    if key.len() > MAX_KEY_LEN {
        return Err("key is longer than 240 bytes");
    }
    if key.starts_with('.') {
        return Err("key starts with a `.`");
    }
    if key.contains(['/', '\\', ':', '\0']) {
        return Err("key contains a path separator, `:` or NUL");
    }
    Ok(())
}

impl fmt::Display for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WorkspaceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for WorkspaceKey {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorkspaceKey {
    type Error = WorkspaceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for WorkspaceKey {
    type Error = WorkspaceError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
