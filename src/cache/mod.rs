mod read_state;

pub use read_state::{CacheSettings, ReadStateCache, ReadStats, SubmitOutcome};
