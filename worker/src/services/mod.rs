//! Business logic services

pub mod active_jobs;
pub mod assignment;
pub mod auto_mapper;
pub mod commit_worker;
pub mod duplicates;
pub mod file_reader;
#[cfg(test)]
pub mod memory;
pub mod normalizer;
pub mod object_storage;
pub mod parse_worker;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod state_machine;
pub mod store;
