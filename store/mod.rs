pub mod atomic;
pub mod builder;
pub mod gauge;
pub mod results;
pub mod slice_store;

pub use builder::{BuildError, BuildReport, SliceStoreBuilder};
pub use gauge::ResidentGauge;
pub use results::{ResultFileError, ResultStore};
pub use slice_store::{BuildLock, ColumnState, LoadedSlice, SliceStore, StoreError};
