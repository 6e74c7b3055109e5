mod repository;
mod schema;

pub use repository::{ComicFilter, ReadOutcome, Repository};
