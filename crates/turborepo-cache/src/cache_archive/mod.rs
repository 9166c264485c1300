mod create;
mod restore;

pub use create::{CacheWriter, SharedBuffer};
pub use restore::CacheReader;
