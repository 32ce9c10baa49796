//! Subcommand implementations.

pub mod apply;
pub mod cluster;
pub mod deform;
pub mod info;
pub mod init_map;
pub mod sphere;
