#![forbid(unsafe_code)]

use gm_core::LoadMode;

// What to do when one incoming collection carries two members with the same
// matching identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicatePolicy {
    // The later occurrence wins; earlier ones are dropped before merging.
    LastWins,
    Reject,
}

#[derive(Clone, Copy, Debug)]
pub struct MergeOptions {
    // Leave members absent from the incoming graph in place instead of
    // removing them.
    pub never_remove: bool,
    // Resolve associated instances to their stored field values. When off,
    // the caller's copy of the fields is kept in the merged tree (the row is
    // still never written).
    pub reload_associated_on_attach: bool,
    // An instance whose natural key is unset cannot exist yet; skip the
    // existence lookup and insert directly.
    pub skip_load_for_new: bool,
    pub load_mode: LoadMode,
    pub duplicates: DuplicatePolicy,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            never_remove: false,
            reload_associated_on_attach: true,
            skip_load_for_new: true,
            load_mode: LoadMode::Batched,
            duplicates: DuplicatePolicy::LastWins,
        }
    }
}
