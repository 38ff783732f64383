//! [`AnyTable`] erases the key, value, and hasher types of a
//! [`WeakValueTable`](crate::WeakValueTable).

use super::WeakValueTable;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};

/// [`TableVisitor`] is the only way to reach the table inside an [`AnyTable`].
///
/// The visitor is generic over the types of the table it visits, and chooses the type of the
/// result through [`TableVisitor::Output`].
///
/// # Examples
///
/// ```
/// use ephemera::{AnyTable, TableVisitor, Tracked, WeakValueTable};
/// use std::hash::{BuildHasher, Hash};
///
/// struct Reclaim;
///
/// impl TableVisitor for Reclaim {
///     type Output = usize;
///
///     fn visit<K, V, H>(self, table: &mut WeakValueTable<K, V, H>) -> usize
///     where
///         K: 'static + Clone + Eq + Hash + Send + Sync,
///         H: BuildHasher,
///     {
///         table.reclaim_space_for_keys_with_unused_data()
///     }
/// }
///
/// let mut by_id: WeakValueTable<u64, String> = WeakValueTable::default();
/// let mut by_name: WeakValueTable<String, Vec<u8>> = WeakValueTable::default();
/// assert!(by_id.replace(1, Tracked::null()).is_ok());
/// assert!(by_name.replace(String::from("n"), Tracked::null()).is_ok());
///
/// let mut tables: Vec<AnyTable<Reclaim>> = vec![AnyTable::new(by_id), AnyTable::new(by_name)];
/// let reclaimed: usize = tables.iter_mut().map(|t| t.visit(Reclaim)).sum();
/// assert_eq!(reclaimed, 0);
/// ```
pub trait TableVisitor {
    /// The result of a visit.
    type Output;

    /// Visits the table.
    fn visit<K, V, H>(self, table: &mut WeakValueTable<K, V, H>) -> Self::Output
    where
        K: 'static + Clone + Eq + Hash + Send + Sync,
        H: BuildHasher;
}

/// [`AnyTable`] owns a [`WeakValueTable`] of any key, value, and hasher types.
///
/// The handle is only generic over the visitor type, so that tables of different types can be
/// kept in one collection and visited with the same [`TableVisitor`].
pub struct AnyTable<'t, Vis: TableVisitor> {
    table: Box<dyn Accept<Vis> + 't>,
}

/// Dispatches a visitor to the concrete table type.
trait Accept<Vis: TableVisitor> {
    fn accept(&mut self, visitor: Vis) -> Vis::Output;
}

impl<K, V, H, Vis> Accept<Vis> for WeakValueTable<K, V, H>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    H: BuildHasher,
    Vis: TableVisitor,
{
    #[inline]
    fn accept(&mut self, visitor: Vis) -> Vis::Output {
        visitor.visit(self)
    }
}

impl<'t, Vis: TableVisitor> AnyTable<'t, Vis> {
    /// Wraps a [`WeakValueTable`].
    #[inline]
    pub fn new<K, V, H>(table: WeakValueTable<K, V, H>) -> Self
    where
        K: 'static + Clone + Eq + Hash + Send + Sync,
        V: 't,
        H: 't + BuildHasher,
    {
        Self {
            table: Box::new(table),
        }
    }

    /// Passes the wrapped table to the visitor, and returns the result of the visit.
    #[inline]
    pub fn visit(&mut self, visitor: Vis) -> Vis::Output {
        self.table.accept(visitor)
    }
}

impl<Vis: TableVisitor> Debug for AnyTable<'_, Vis> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyTable").finish_non_exhaustive()
    }
}

impl<'t, K, V, H, Vis> From<WeakValueTable<K, V, H>> for AnyTable<'t, Vis>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    V: 't,
    H: 't + BuildHasher,
    Vis: TableVisitor,
{
    #[inline]
    fn from(table: WeakValueTable<K, V, H>) -> Self {
        Self::new(table)
    }
}
