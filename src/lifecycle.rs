//! Application foreground/background signals.
//!
//! The host forwards visibility changes to the engine. Going to the
//! background resets key usage counters and force-burns messages that asked
//! for screenshot protection.

use serde::{Deserialize, Serialize};

/// Whether the host application is on screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Application is in the foreground
    Visible,
    /// Application was backgrounded or the screen locked
    Hidden,
}

impl Visibility {
    /// Map a platform `document.hidden`-style flag
    pub fn from_hidden(hidden: bool) -> Self {
        if hidden {
            Visibility::Hidden
        } else {
            Visibility::Visible
        }
    }

    /// True when the application is backgrounded
    pub fn is_hidden(self) -> bool {
        self == Visibility::Hidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_from_flag() {
        assert_eq!(Visibility::from_hidden(true), Visibility::Hidden);
        assert!(!Visibility::from_hidden(false).is_hidden());
        assert_eq!(serde_json::to_string(&Visibility::Hidden).unwrap(), "\"hidden\"");
    }
}
