//! Default implementations of the [crate::store::Store] interface.

pub mod memory;
