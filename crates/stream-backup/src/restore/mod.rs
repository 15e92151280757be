pub mod applier;
pub mod version_list;

pub use applier::{RestoreApplier, RestoreStats};
pub use version_list::{list_all_versions, reconcile, Reconciliation};
