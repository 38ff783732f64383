//! [`Options`] to configure a [`WeakValueTable`](crate::WeakValueTable).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Policy for storing one value identity under more than one key of the same table.
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ValueSharing {
    /// Any number of keys may store the same value.
    ///
    /// The keys are deduplicated in a single finalization hook per value, therefore the
    /// unused-data callback runs once when the value dies, no matter how many keys stored it.
    #[default]
    Shared,

    /// A value may be stored under at most one key at a time.
    ///
    /// Storing a value that is already live under a different key fails with
    /// [`Error::ValueAlreadyTracked`](crate::Error::ValueAlreadyTracked).
    Exclusive,
}

/// Construction options for a [`WeakValueTable`](crate::WeakValueTable).
///
/// # Examples
///
/// ```
/// use ephemera::{Options, ValueSharing, WeakValueTable};
///
/// let options = Options {
///     capacity: 64,
///     value_sharing: ValueSharing::Exclusive,
/// };
/// let table: WeakValueTable<u64, String> = WeakValueTable::with_options(options);
///
/// assert!(table.capacity() >= 64);
/// assert_eq!(table.value_sharing(), ValueSharing::Exclusive);
/// ```
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Options {
    /// Number of keys the table can hold without reallocating.
    pub capacity: usize,

    /// Whether one value identity may be stored under several keys.
    pub value_sharing: ValueSharing,
}
