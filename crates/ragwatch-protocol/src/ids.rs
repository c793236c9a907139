//! Typed identifiers for visualization sessions and process events.
//!
//! Both are opaque strings on the wire and are never minted on this side.
//! Event ids are only compared for equality (dedup) and lexically
//! (timestamp tie-break).

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_owned())
            }
        }
    };
}

string_id!(
    /// Groups process events into one visualization timeline.
    SessionId
);
string_id!(
    /// Unique within a session. Not monotonic, not sequential.
    EventId
);

impl SessionId {
    /// Blank or whitespace-only ids name no session.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Percent-encoded form for use as one URL path segment.
    pub fn url_segment(&self) -> Cow<'_, str> {
        urlencoding::encode(&self.0)
    }
}
