pub mod backend;
pub mod config;
pub mod init;
pub mod policy;
