//! Core library for the `cirrus` EC2 provisioning tool.
//!
//! The crate signs and dispatches EC2-family query API calls, decodes their
//! XML replies into generic trees, and builds instance lifecycle operations
//! on top: launch and deploy, tags, volumes, snapshots, key pairs, security
//! groups, load balancers, VPC lookups and Redshift clusters.

pub mod config;
pub mod deploy;
pub mod keyfile;
pub mod model;
pub mod ops;
pub mod paths;
pub mod profile;
pub mod provision;
pub mod query;
pub mod resolve;
pub mod retry;
pub mod signer;
pub mod test_support;
pub mod xml;

pub use config::ProviderConfig;
pub use ops::{Ec2Client, LifecycleError};
pub use profile::VmProfile;
pub use provision::{ProvisionError, ProvisionOutcome, Provisioner};
