//! Type definitions

pub mod contact;
pub mod import_job;
pub mod import_row;
pub mod mapping;
pub mod messages;
pub mod options;

pub use contact::*;
pub use import_job::*;
pub use import_row::*;
pub use mapping::*;
pub use messages::*;
pub use options::*;
