//! Domain types shared by every brandkit crate.
//!
//! Nothing in here touches the filesystem, the network, or a database.
//! The record store, pipeline, and HTTP layers build on these types.

pub mod brand;
pub mod build_job;
pub mod error;
pub mod hashing;
pub mod naming;
pub mod types;
