use std::fmt::Debug;

/// A typed table in the key-value store.
///
/// Keys iterate in their `Ord` order; composite tuple keys give the same
/// layout a dup-sorted table would on a byte-ordered engine.
pub trait Table: Send + Sync + Debug + 'static {
    /// Table name, unique within the database.
    const NAME: &'static str;

    /// Key type.
    type Key: Ord + Clone + Debug + Send + Sync + 'static;
    /// Value type.
    type Value: Clone + Debug + Send + Sync + 'static;
}

/// Declares unit structs implementing [`Table`].
#[macro_export]
macro_rules! tables {
    ($(
        $(#[$attr:meta])*
        table $name:ident<Key = $key:ty, Value = $value:ty>;
    )*) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, Debug, Default)]
            pub struct $name;

            impl $crate::Table for $name {
                const NAME: &'static str = stringify!($name);
                type Key = $key;
                type Value = $value;
            }
        )*
    };
}
