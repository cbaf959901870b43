//! Per-VM profiles and their layering.
//!
//! A profile describes one instance to provision. Profiles are merged from
//! most specific to least specific: the VM's own settings, then any named
//! profile it extends, then provider defaults (see
//! [`crate::config::ProviderConfig::as_profile`]). The first layer that sets a
//! value wins.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::paths::read_to_string_ambient;

/// Which address deployment connects to.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SshInterface {
    /// The instance's public address.
    #[default]
    PublicIps,
    /// The instance's private address.
    PrivateIps,
}

impl FromStr for SshInterface {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "public_ips" => Ok(Self::PublicIps),
            "private_ips" => Ok(Self::PrivateIps),
            other => Err(format!("unknown ssh interface '{other}'")),
        }
    }
}

impl fmt::Display for SshInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PublicIps => "public_ips",
            Self::PrivateIps => "private_ips",
        })
    }
}

/// One extra volume to create or attach after launch.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(default)]
pub struct VolumeSpec {
    /// Device name the volume is attached as, for example `/dev/sdf`.
    pub device: String,
    /// Attach this existing volume instead of creating one.
    pub volume_id: Option<String>,
    /// Create the volume from this snapshot.
    pub snapshot: Option<String>,
    /// Size in GiB for new volumes.
    pub size: Option<u32>,
    /// Volume type for new volumes.
    #[serde(rename = "type")]
    pub volume_type: Option<String>,
    /// Provisioned IOPS for `io1` volumes.
    pub iops: Option<u32>,
    /// Delete the volume when the instance terminates. Defaults to `true`.
    pub delete_on_termination: Option<bool>,
}

/// Description of a VM to provision.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(default)]
pub struct VmProfile {
    /// Instance name, applied as the `Name` tag.
    pub name: String,
    /// Image identifier.
    pub image: Option<String>,
    /// Instance type or a human-readable size alias.
    pub size: Option<String>,
    /// Region.
    pub location: Option<String>,
    /// Availability zone within the region.
    pub availability_zone: Option<String>,
    /// Key pair name.
    pub keyname: Option<String>,
    /// Path to the private key matching `keyname`.
    pub private_key: Option<String>,
    /// Security group names.
    pub securitygroup: Vec<String>,
    /// Security group identifiers or names resolved within `vpc_id`.
    pub securitygroupid: Vec<String>,
    /// Subnet identifier or name resolved within `vpc_id`.
    pub subnetid: Option<String>,
    /// VPC used to resolve group and subnet names.
    pub vpc_id: Option<String>,
    /// Delete the root volume when the instance terminates.
    pub delvol_on_destroy: Option<bool>,
    /// Root volume size in GiB.
    pub root_vol_size: Option<u32>,
    /// Root volume type.
    pub root_vol_type: Option<String>,
    /// Root volume provisioned IOPS; required when `root_vol_type` is `io1`.
    pub root_iops: Option<u32>,
    /// Ephemeral devices, mapped as `device -> virtual name`.
    pub ephemeral: BTreeMap<String, String>,
    /// Extra volumes to create or attach after launch.
    pub volumes: Vec<VolumeSpec>,
    /// Path to a user-data template.
    pub userdata_file: Option<String>,
    /// Login names tried, in order, before the built-in candidates.
    pub ssh_username: Vec<String>,
    /// Which address deployment connects to.
    pub ssh_interface: Option<SshInterface>,
    /// Run the deployment script after launch. Defaults to `true`.
    pub deploy: Option<bool>,
    /// Deployment script body.
    pub script: Option<String>,
    /// Arguments passed to the deployment script.
    pub script_args: Option<String>,
    /// Environment passed to the deployment script.
    pub script_env: BTreeMap<String, String>,
    /// Run the script through `sudo`. Defaults to `true` unless the login is
    /// `root`.
    pub sudo: Option<bool>,
    /// Echo the deployment command's output.
    pub display_ssh_output: Option<bool>,
    /// Identity private key delivered to the new host.
    pub minion_pem: Option<String>,
    /// Identity public key delivered to the new host.
    pub minion_pub: Option<String>,
    /// Configuration delivered alongside the identity keys.
    pub minion_config: Option<String>,
    /// Configure the host as an identity agent. Defaults to `true`.
    pub make_minion: Option<bool>,
    /// Configure the host as a master.
    pub make_master: Option<bool>,
    /// Master private key.
    pub master_pem: Option<String>,
    /// Master public key.
    pub master_pub: Option<String>,
    /// Master configuration.
    pub master_config: Option<String>,
    /// Master address substituted into user-data.
    pub master_host: Option<String>,
}

fn merge_vec<T: Clone>(preferred: &[T], fallback: &[T]) -> Vec<T> {
    if preferred.is_empty() {
        fallback.to_vec()
    } else {
        preferred.to_vec()
    }
}

fn merge_map(
    preferred: &BTreeMap<String, String>,
    fallback: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    if preferred.is_empty() {
        fallback.clone()
    } else {
        preferred.clone()
    }
}

impl VmProfile {
    /// Creates a profile for `name` from `image`.
    #[must_use]
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: Some(image.into()),
            ..Self::default()
        }
    }

    /// Loads a profile from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Profile`] if the file cannot be read or parsed.
    pub fn load_json(path: &Utf8Path) -> Result<Self, ConfigError> {
        let fail = |message: String| ConfigError::Profile {
            path: path.to_string(),
            message,
        };
        let body = read_to_string_ambient(path.as_str()).map_err(fail)?;
        serde_json::from_str(&body).map_err(|err| fail(err.to_string()))
    }

    /// Layers `self` over `base`: any value `self` sets wins, everything else
    /// comes from `base`.
    #[must_use]
    pub fn merged_over(&self, base: &Self) -> Self {
        Self {
            name: if self.name.is_empty() {
                base.name.clone()
            } else {
                self.name.clone()
            },
            image: self.image.clone().or_else(|| base.image.clone()),
            size: self.size.clone().or_else(|| base.size.clone()),
            location: self.location.clone().or_else(|| base.location.clone()),
            availability_zone: self
                .availability_zone
                .clone()
                .or_else(|| base.availability_zone.clone()),
            keyname: self.keyname.clone().or_else(|| base.keyname.clone()),
            private_key: self.private_key.clone().or_else(|| base.private_key.clone()),
            securitygroup: merge_vec(&self.securitygroup, &base.securitygroup),
            securitygroupid: merge_vec(&self.securitygroupid, &base.securitygroupid),
            subnetid: self.subnetid.clone().or_else(|| base.subnetid.clone()),
            vpc_id: self.vpc_id.clone().or_else(|| base.vpc_id.clone()),
            delvol_on_destroy: self.delvol_on_destroy.or(base.delvol_on_destroy),
            root_vol_size: self.root_vol_size.or(base.root_vol_size),
            root_vol_type: self
                .root_vol_type
                .clone()
                .or_else(|| base.root_vol_type.clone()),
            root_iops: self.root_iops.or(base.root_iops),
            ephemeral: merge_map(&self.ephemeral, &base.ephemeral),
            volumes: merge_vec(&self.volumes, &base.volumes),
            userdata_file: self
                .userdata_file
                .clone()
                .or_else(|| base.userdata_file.clone()),
            ssh_username: merge_vec(&self.ssh_username, &base.ssh_username),
            ssh_interface: self.ssh_interface.or(base.ssh_interface),
            deploy: self.deploy.or(base.deploy),
            script: self.script.clone().or_else(|| base.script.clone()),
            script_args: self.script_args.clone().or_else(|| base.script_args.clone()),
            script_env: merge_map(&self.script_env, &base.script_env),
            sudo: self.sudo.or(base.sudo),
            display_ssh_output: self.display_ssh_output.or(base.display_ssh_output),
            minion_pem: self.minion_pem.clone().or_else(|| base.minion_pem.clone()),
            minion_pub: self.minion_pub.clone().or_else(|| base.minion_pub.clone()),
            minion_config: self
                .minion_config
                .clone()
                .or_else(|| base.minion_config.clone()),
            make_minion: self.make_minion.or(base.make_minion),
            make_master: self.make_master.or(base.make_master),
            master_pem: self.master_pem.clone().or_else(|| base.master_pem.clone()),
            master_pub: self.master_pub.clone().or_else(|| base.master_pub.clone()),
            master_config: self
                .master_config
                .clone()
                .or_else(|| base.master_config.clone()),
            master_host: self.master_host.clone().or_else(|| base.master_host.clone()),
        }
    }

    /// Whether deployment runs after launch.
    #[must_use]
    pub fn deploy_enabled(&self) -> bool {
        self.deploy.unwrap_or(true)
    }
}
