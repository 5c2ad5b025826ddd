//! Aggregate version numbers for optimistic concurrency control.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version stamp of a persisted aggregate.
///
/// A freshly created aggregate is at [`Version::INITIAL`] and has never been
/// saved. Each successful save moves the stored copy to the next version:
///
/// - The caller passes the version it loaded as `expected_version`
/// - If the stored version differs, the save fails with a conflict
/// - The caller reloads, reapplies the operation, and retries
///
/// # Examples
///
/// ```
/// use balance_ledger_core::version::Version;
///
/// let v0 = Version::INITIAL;
/// let v1 = v0.next();
/// assert_eq!(v1, Version::new(1));
/// assert_eq!(v1.value(), 1);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of an aggregate that has never been persisted.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether the aggregate has never been saved.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Implemented by every persisted aggregate.
///
/// The version is persistence metadata: only repositories advance it, via
/// [`Versioned::set_version`], after a successful save.
pub trait Versioned {
    /// The version this instance was loaded at (or saved as).
    fn version(&self) -> Version;

    /// Records the version assigned by a repository.
    fn set_version(&mut self, version: Version);
}
