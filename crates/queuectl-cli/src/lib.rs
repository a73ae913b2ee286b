//! The queuectl command-line surface and worker runtime.
//!
//! The binary in `main.rs` is a thin shell over this library: argument
//! parsing and dispatch live in [`cli`], the long-running worker loop in
//! [`worker`], and worker process lifecycle (spawn/stop/liveness) in
//! [`supervisor`].

pub mod cli;
pub mod exec;
pub mod paths;
pub mod supervisor;
pub mod worker;
