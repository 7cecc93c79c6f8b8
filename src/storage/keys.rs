//! Reserved key layout inside a namespace.
//!
//! ```text
//! session:<app>                 serialized login state
//! user_info                     account the session belongs to (JSON)
//! dedup:<category>:<fp>         resume/dedup record for one work unit
//! meta:migration:started        legacy import in progress
//! meta:migration:done           legacy import finished
//! ```

use crate::core::Category;
use crate::remote::AppType;

pub const SESSION_PREFIX: &str = "session:";
pub const USER_INFO: &str = "user_info";
pub const DEDUP_PREFIX: &str = "dedup:";
pub const META_PREFIX: &str = "meta:";
pub const MIGRATION_STARTED: &str = "meta:migration:started";
pub const MIGRATION_DONE: &str = "meta:migration:done";

pub fn session(app: AppType) -> String {
    format!("{SESSION_PREFIX}{}", app.as_str())
}

/// Prefix of one category's dedup table.
pub fn dedup_table(category: Category) -> String {
    format!("{DEDUP_PREFIX}{}:", category.as_str())
}

pub fn dedup(category: Category, fingerprint: &str) -> String {
    format!("{}{}", dedup_table(category), fingerprint)
}

/// Bookkeeping keys that are never copied between backends.
pub fn is_meta(key: &str) -> bool {
    key.starts_with(META_PREFIX)
}
