//! Database query modules

pub mod audit;
pub mod contact;
pub mod import_job;
pub mod import_row;
pub mod owner;
