mod selector;

pub use selector::{partition, partition_by_ordinal, TodaySelector};
