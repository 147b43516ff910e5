//! Building a child's filesystem view.
//!
//! [`plan::MountPlan`] validates a [`crate::namespace::mount::MountNamespaceOptions`]
//! against a [`vfs::VfsBuilder`] in the parent; the resulting
//! [`mount::MountOp`]s are executed by the child.

pub mod mount;
pub mod pivot_root;
pub mod plan;
pub mod vfs;

pub use plan::{MountPlan, NamedTmpfsResolver};
pub use vfs::VfsBuilder;
