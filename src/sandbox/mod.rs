//! Everything that touches the host: path confinement, the filesystem
//! gateway and the command runner.

pub mod confine;
pub mod exec;
pub mod fs;
