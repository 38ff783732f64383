//! [`Error`] types.

use thiserror::Error;

/// Errors returned by the fallible [`WeakValueTable`](crate::WeakValueTable) operations.
///
/// Both variants hand the offending key back to the caller. The table is left exactly as it was
/// before the failed call.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error<K> {
    /// The key already denotes a live value, either the null sentinel or a reachable value.
    #[error("key already in use: {0:?}")]
    KeyAlreadyInUse(K),

    /// The value is already stored under another key, and the table was configured with
    /// [`ValueSharing::Exclusive`](crate::ValueSharing::Exclusive).
    #[error("value already tracked under another key; rejected key: {0:?}")]
    ValueAlreadyTracked(K),
}

impl<K> Error<K> {
    /// Returns a reference to the rejected key.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::Error;
    ///
    /// let error: Error<u64> = Error::KeyAlreadyInUse(11);
    /// assert_eq!(*error.key(), 11);
    /// ```
    #[inline]
    pub fn key(&self) -> &K {
        match self {
            Self::KeyAlreadyInUse(key) | Self::ValueAlreadyTracked(key) => key,
        }
    }

    /// Consumes the error and returns the rejected key.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::Error;
    ///
    /// let error: Error<String> = Error::ValueAlreadyTracked(String::from("k"));
    /// assert_eq!(error.into_key(), "k");
    /// ```
    #[inline]
    pub fn into_key(self) -> K {
        match self {
            Self::KeyAlreadyInUse(key) | Self::ValueAlreadyTracked(key) => key,
        }
    }
}
