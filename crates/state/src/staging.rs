// SPDX-License-Identifier: Apache-2.0

//! Staging directives: the file operations attached to a unit description.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of file operation a staging directive requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagingAction {
    /// Symlink the source under the target.
    Link,
    /// Copy the source to the target.
    Copy,
    /// Rename the source to the target, falling back to copy + unlink
    /// across filesystems.
    Move,
    /// Hand the operation to the configured staging backend.
    Transfer,
}

impl fmt::Display for StagingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StagingAction::Link => "LINK",
            StagingAction::Copy => "COPY",
            StagingAction::Move => "MOVE",
            StagingAction::Transfer => "TRANSFER",
        };
        f.write_str(label)
    }
}

bitflags! {
    /// Modifiers for a staging directive.
    ///
    /// Travels the wire in the flags format, e.g.
    /// `"CREATE_PARENTS | RECURSIVE"`; absent means empty.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct StagingFlags: u8 {
        /// Create missing parent directories of the target.
        const CREATE_PARENTS = 1;
        /// Recurse into directories.
        const RECURSIVE = 2;
    }
}

/// One file operation: `{action, source, target, flags}`.
///
/// `source` and `target` are resolved against the unit sandbox unless
/// absolute; the `staging:` URL scheme resolves against the shared staging
/// area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingDirective {
    /// The operation to perform.
    pub action: StagingAction,
    /// Where the data comes from.
    pub source: String,
    /// Where the data goes.
    pub target: String,
    /// Operation modifiers.
    #[serde(default)]
    pub flags: StagingFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_round_trips() {
        let d = StagingDirective {
            action: StagingAction::Copy,
            source: "staging:///input.dat".to_owned(),
            target: "in/input.dat".to_owned(),
            flags: StagingFlags::CREATE_PARENTS,
        };
        let json = serde_json::to_string(&d).unwrap();
        let back: StagingDirective = serde_json::from_str(&json).unwrap();
        assert_eq!(back.action, StagingAction::Copy);
        assert!(back.flags.contains(StagingFlags::CREATE_PARENTS));
    }

    #[test]
    fn flags_default_to_empty() {
        let d: StagingDirective = serde_json::from_str(
            r#"{"action": "LINK", "source": "a", "target": "b"}"#,
        )
        .unwrap();
        assert!(d.flags.is_empty());
    }
}
