//! The `RunInstances` request assembled from a profile.

use std::collections::BTreeMap;

use crate::ops::catalog::resolve_instance_type;
use crate::profile::VmProfile;
use crate::query::{ApiRequest, Params};

use super::ProvisionError;

/// Device the root volume is mapped to.
pub const ROOT_DEVICE: &str = "/dev/sda1";

/// Root volume overrides, written as `BlockDeviceMapping.1`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RootVolume {
    /// Delete the volume when the instance terminates.
    pub delete_on_termination: Option<bool>,
    /// Size in GiB.
    pub size: Option<u32>,
    /// Volume type.
    pub volume_type: Option<String>,
    /// Provisioned IOPS.
    pub iops: Option<u32>,
}

impl RootVolume {
    fn from_profile(profile: &VmProfile) -> Result<Option<Self>, ProvisionError> {
        let iops = match profile.root_vol_type.as_deref() {
            Some(kind @ "io1") => Some(profile.root_iops.ok_or_else(|| {
                ProvisionError::Config(format!(
                    "root_vol_type '{kind}' requires the 'root_iops' property"
                ))
            })?),
            _ => None,
        };
        let root = Self {
            delete_on_termination: profile.delvol_on_destroy,
            size: profile.root_vol_size,
            volume_type: profile.root_vol_type.clone(),
            iops,
        };
        Ok((root != Self::default()).then_some(root))
    }
}

/// `RunInstances` for a single instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunInstances {
    /// Image to launch.
    pub image_id: String,
    /// Provider instance type, aliases already resolved.
    pub instance_type: String,
    /// Key pair injected into the instance.
    pub key_name: String,
    /// Security groups by name.
    pub security_groups: Vec<String>,
    /// Security groups by id.
    pub security_group_ids: Vec<String>,
    /// Availability zone.
    pub availability_zone: Option<String>,
    /// Subnet id.
    pub subnet_id: Option<String>,
    /// Root volume overrides.
    pub root_volume: Option<RootVolume>,
    /// Ephemeral devices, `device -> virtual name`.
    pub ephemeral: BTreeMap<String, String>,
    /// Base64-encoded user data.
    pub user_data: Option<String>,
}

impl RunInstances {
    /// Builds the request from a merged profile.
    ///
    /// Group and subnet references must already be resolved to ids; they
    /// are passed separately because resolving them needs the provider.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Config`] when the root volume settings are
    /// inconsistent.
    pub fn from_profile(
        profile: &VmProfile,
        security_group_ids: Vec<String>,
        subnet_id: Option<String>,
        user_data: Option<String>,
    ) -> Result<Self, ProvisionError> {
        Ok(Self {
            image_id: profile.image.clone().unwrap_or_default(),
            instance_type: profile
                .size
                .as_deref()
                .map(resolve_instance_type)
                .unwrap_or_default()
                .to_owned(),
            key_name: profile.keyname.clone().unwrap_or_default(),
            security_groups: profile.securitygroup.clone(),
            security_group_ids,
            availability_zone: profile.availability_zone.clone(),
            subnet_id,
            root_volume: RootVolume::from_profile(profile)?,
            ephemeral: profile.ephemeral.clone(),
            user_data,
        })
    }
}

impl ApiRequest for RunInstances {
    const ACTION: &'static str = "RunInstances";
    const RESULT_SET: Option<&'static str> = Some("instancesSet");
    const RAW_ROOT: bool = false;

    fn write_params(&self, params: &mut Params) {
        params
            .set("MinCount", "1")
            .set("MaxCount", "1")
            .set("ImageId", self.image_id.as_str())
            .set("InstanceType", self.instance_type.as_str())
            .set("KeyName", self.key_name.as_str())
            .indexed("SecurityGroup", self.security_groups.iter().cloned())
            .indexed("SecurityGroupId", self.security_group_ids.iter().cloned())
            .set_opt(
                "Placement.AvailabilityZone",
                self.availability_zone.as_deref(),
            )
            .set_opt("SubnetId", self.subnet_id.as_deref())
            .set_opt("UserData", self.user_data.as_deref());

        if let Some(root) = &self.root_volume {
            params
                .scope("BlockDeviceMapping", 1)
                .set("DeviceName", ROOT_DEVICE)
                .set_opt("Ebs.DeleteOnTermination", root.delete_on_termination)
                .set_opt("Ebs.VolumeSize", root.size)
                .set_opt("Ebs.VolumeType", root.volume_type.as_deref())
                .set_opt("Ebs.Iops", root.iops);
        }

        for (offset, (device, virtual_name)) in self.ephemeral.iter().enumerate() {
            params
                .scope("BlockDeviceMapping", offset + 2)
                .set("DeviceName", device.as_str())
                .set("VirtualName", virtual_name.as_str());
        }
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("image", self.image_id.as_str()),
            ("size", self.instance_type.as_str()),
            ("keyname", self.key_name.as_str()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn profile() -> VmProfile {
        VmProfile {
            size: Some(String::from("Micro Instance")),
            keyname: Some(String::from("deploy")),
            securitygroup: vec![String::from("default"), String::from("web")],
            ..VmProfile::new("web-1", "ami-1234")
        }
    }

    #[rstest]
    #[case("Micro Instance", "t1.micro")]
    #[case("m3.medium", "m3.medium")]
    fn sizes_resolve_through_aliases(#[case] size: &str, #[case] expected: &str) {
        let with_size = VmProfile {
            size: Some(size.to_owned()),
            ..profile()
        };
        let params = RunInstances::from_profile(&with_size, Vec::new(), None, None)
            .expect("valid profile")
            .to_params();
        assert_eq!(params.get("InstanceType"), Some(expected));
        assert_eq!(params.get("ImageId"), Some("ami-1234"));
    }

    #[test]
    fn groups_and_placement_are_flattened() {
        let with_placement = VmProfile {
            availability_zone: Some(String::from("us-east-1b")),
            ..profile()
        };
        let params = RunInstances::from_profile(
            &with_placement,
            vec![String::from("sg-1")],
            Some(String::from("subnet-1")),
            Some(String::from("ZWNobw==")),
        )
        .expect("valid profile")
        .to_params();
        assert_eq!(params.get("SecurityGroup.1"), Some("default"));
        assert_eq!(params.get("SecurityGroup.2"), Some("web"));
        assert_eq!(params.get("SecurityGroupId.1"), Some("sg-1"));
        assert_eq!(params.get("Placement.AvailabilityZone"), Some("us-east-1b"));
        assert_eq!(params.get("SubnetId"), Some("subnet-1"));
        assert_eq!(params.get("UserData"), Some("ZWNobw=="));
        assert_eq!(params.get("MinCount"), Some("1"));
        assert_eq!(params.get("BlockDeviceMapping.1.DeviceName"), None);
    }

    #[test]
    fn root_volume_and_ephemerals_share_the_mapping_list() {
        let with_volumes = VmProfile {
            delvol_on_destroy: Some(false),
            root_vol_size: Some(50),
            root_vol_type: Some(String::from("io1")),
            root_iops: Some(500),
            ephemeral: BTreeMap::from([
                (String::from("/dev/sdb"), String::from("ephemeral0")),
                (String::from("/dev/sdc"), String::from("ephemeral1")),
            ]),
            ..profile()
        };
        let params = RunInstances::from_profile(&with_volumes, Vec::new(), None, None)
            .expect("valid profile")
            .to_params();
        assert_eq!(params.get("BlockDeviceMapping.1.DeviceName"), Some("/dev/sda1"));
        assert_eq!(
            params.get("BlockDeviceMapping.1.Ebs.DeleteOnTermination"),
            Some("false")
        );
        assert_eq!(params.get("BlockDeviceMapping.1.Ebs.VolumeSize"), Some("50"));
        assert_eq!(params.get("BlockDeviceMapping.1.Ebs.Iops"), Some("500"));
        assert_eq!(params.get("BlockDeviceMapping.2.DeviceName"), Some("/dev/sdb"));
        assert_eq!(params.get("BlockDeviceMapping.3.VirtualName"), Some("ephemeral1"));
    }

    #[test]
    fn io1_root_volume_requires_iops() {
        let missing_iops = VmProfile {
            root_vol_type: Some(String::from("io1")),
            ..profile()
        };
        let err = RunInstances::from_profile(&missing_iops, Vec::new(), None, None)
            .expect_err("iops required");
        assert!(matches!(err, ProvisionError::Config(message) if message.contains("root_iops")));
    }
}
