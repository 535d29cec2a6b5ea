pub mod clock;
pub mod config;
pub mod decision_memory;
pub mod language;
pub mod types;
