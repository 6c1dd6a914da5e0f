// Expose modules for testing
pub mod backends;
pub mod cli;
pub mod domain;
pub mod export;
pub mod lock;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod tree;
