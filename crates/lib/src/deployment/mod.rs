//! Deployment orchestration.
//!
//! The staged pipelines that turn `(manifest, stemcell, releases)` into a
//! running VM and unwind it on delete, plus the managers they drive.

pub mod deleter;
pub mod deployer;
pub mod disk;
pub mod record;
pub mod state_builder;
pub mod stemcell;
pub mod vm;

pub use deleter::Deleter;
pub use deployer::{AgentWaits, Deployer};
pub use disk::{Disk, DiskDeployer, DiskManager};
pub use record::DeploymentRecord;
pub use state_builder::{InstanceState, StateBuilder};
pub use stemcell::{ExtractedStemcell, StemcellManager};
pub use vm::{Vm, VmManager};
