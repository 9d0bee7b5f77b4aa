//! Store key layout for a project.
//!
//! Every project owns three keys, `<projectID>.config`, `<projectID>.data`
//! and `<projectID>.count`. Project identifiers must not contain
//! [`SEPARATOR`]; identifiers are generated upstream and this is not checked
//! here.

use std::fmt;

pub const SEPARATOR: char = '.';

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// JSON project configuration, written by the control plane.
    Config,
    /// List of serialized messages, newest first.
    Data,
    /// Daily usage counter, expires at the next UTC midnight.
    Count,
}

impl KeyKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Config => "config",
            KeyKind::Data => "data",
            KeyKind::Count => "count",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn project_key(project_id: &str, kind: KeyKind) -> String {
    format!("{project_id}{SEPARATOR}{kind}")
}

pub fn project_id_of(key: &str) -> &str {
    key.split(SEPARATOR).next().unwrap_or(key)
}
