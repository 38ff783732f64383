#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! A hash table whose values are held weakly.
//!
//! # ephemera::WeakValueTable
//! Each key maps to a [`Tracked`] value that the table does not keep alive: once every strong
//! [`Tracked`] outside the table is gone, the key stops being a member of the table. The table
//! is notified about the loss through a deferred finalization hook, and the owner physically
//! drops the dead slots by calling
//! [`WeakValueTable::reclaim_space_for_keys_with_unused_data`].
//!
//! # ephemera::AnyTable
//! A type-erased handle that lets tables of different key and value types live in one
//! collection; the table is reachable only through a [`TableVisitor`].

mod any_table;
pub use any_table::{AnyTable, TableVisitor};

mod error;
pub use error::Error;

mod finalizer;

mod options;
pub use options::{Options, ValueSharing};

mod reclaim_queue;

mod tracked;
pub use tracked::{Tracked, WeakTracked};

mod weak_value_table;
pub use weak_value_table::WeakValueTable;
