//! Database initialization shared by every consumer of the record store

pub mod init;

pub use init::*;
