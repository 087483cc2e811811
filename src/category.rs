//! Region categories

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category a region or trace event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Always-on coarse spans (`push_trace`/`pop_trace`)
    Host,
    /// User-visible spans (`push_region`/`pop_region`)
    User,
    /// Accelerator activity
    Device,
    /// Signal-driven call-stack samples
    Sampling,
    /// Process-level resource samples
    ProcessSampling,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Host,
        Category::User,
        Category::Device,
        Category::Sampling,
        Category::ProcessSampling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Host => "host",
            Category::User => "user",
            Category::Device => "device",
            Category::Sampling => "sampling",
            Category::ProcessSampling => "process_sampling",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
