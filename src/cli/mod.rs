pub mod add;
pub mod delete;
pub mod query;
pub mod stats;
pub mod topsites;
