//! bosh-micro-lib: deployment orchestration for a single micro director VM.
//!
//! The library turns `(manifest, stemcell, releases)` into a running VM by
//! coordinating four external actors: the CPI child process, a blobstore,
//! the on-VM agent over its mbus channel, and an optional SSH tunnel back to
//! the workstation's registry. Every pipeline step reads the durable state
//! file first and becomes a no-op when already satisfied, so interrupted
//! runs are reconciled by simply running again.
//!
//! Leaves-first layout:
//! - `state`: the durable `deployment.json` records
//! - `release` / `manifest`: input models
//! - `compile` / `template`: package compilation and job rendering
//! - `cloud` / `registry` / `sshtunnel` / `agent` / `blobstore`: the
//!   external actor clients
//! - `installation`: local CPI install
//! - `deployment`: the deploy/delete orchestrators

pub mod agent;
pub mod blobstore;
pub mod cloud;
pub mod compile;
pub mod config;
pub mod deployment;
pub mod installation;
pub mod manifest;
pub mod registry;
pub mod release;
pub mod sshtunnel;
pub mod state;
pub mod template;
pub mod ui;
pub mod util;
