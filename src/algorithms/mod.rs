pub mod initializer;
pub mod sgd;

pub use initializer::{FactorInitializer, InitializationMethod, KeyedInitializer};
pub use sgd::{predict, SgdDeltas, SgdUpdate};
