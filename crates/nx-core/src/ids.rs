//! Identifiers for requests and transcode jobs.
//!
//! Both are random v4 UUIDs. They travel in events and log fields, so they
//! serialize as the bare UUID string.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Short form keeps log lines readable.
                if f.alternate() {
                    write!(f, "{}", &self.0.simple().to_string()[..8])
                } else {
                    write!(f, "{}", self.0)
                }
            }
        }
    };
}

uuid_id!(
    /// A media request submitted to the orchestrator.
    RequestId
);

uuid_id!(
    /// A running transcode job.
    JobId
);
