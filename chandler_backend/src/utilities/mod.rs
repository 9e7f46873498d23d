pub mod clock;
pub mod config;
pub mod expressions;
pub mod rate_limit;
pub mod recurrence;
pub mod serialized_data;
pub mod workers;
