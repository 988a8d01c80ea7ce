// Expose modules for testing
pub mod caches;
pub mod cgroup;
pub mod cli;
pub mod domain;
pub mod output;
pub mod sampling;
pub mod symbolize;
pub mod timebase;
