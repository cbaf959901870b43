//! Regions, availability zones, images, and instance sizes.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::error;

use super::{Ec2Client, LifecycleError, require};
use crate::query::{ApiRequest, Params, Transport};
use crate::xml::Node;

/// Human-readable size names accepted in place of provider instance types.
pub const SIZE_ALIASES: &[(&str, &str)] = &[
    ("Micro Instance", "t1.micro"),
    ("Small Instance", "m1.small"),
    ("Medium Instance", "m1.medium"),
    ("Large Instance", "m1.large"),
    ("Extra Large Instance", "m1.xlarge"),
    ("High-CPU Medium Instance", "c1.medium"),
    ("High-CPU Extra Large Instance", "c1.xlarge"),
    ("High-Memory Extra Large Instance", "m2.xlarge"),
    ("High-Memory Double Extra Large Instance", "m2.2xlarge"),
    ("High-Memory Quadruple Extra Large Instance", "m2.4xlarge"),
    ("Cluster GPU Quadruple Extra Large Instance", "cg1.4xlarge"),
    ("Cluster Compute Quadruple Extra Large Instance", "cc1.4xlarge"),
    ("Cluster Compute Eight Extra Large Instance", "cc2.8xlarge"),
];

/// Maps a size alias to its instance type; anything else is returned as
/// given and treated as a literal instance type.
#[must_use]
pub fn resolve_instance_type(size: &str) -> &str {
    SIZE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == size)
        .map_or(size, |(_, instance_type)| *instance_type)
}

/// One entry of the instance-type catalogue.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct SizeInfo {
    /// Instance type.
    pub id: &'static str,
    /// Processor description.
    pub cores: &'static str,
    /// Instance storage.
    pub disk: &'static str,
    /// Memory.
    pub ram: &'static str,
}

const fn size(
    id: &'static str,
    cores: &'static str,
    disk: &'static str,
    ram: &'static str,
) -> SizeInfo {
    SizeInfo {
        id,
        cores,
        disk,
        ram,
    }
}

const SIZES: &[(&str, SizeInfo)] = &[
    (
        "Cluster Compute",
        size(
            "cc2.8xlarge",
            "16 (2 x Intel Xeon E5-2670, eight-core with hyperthread)",
            "3360 GiB (4 x 840 GiB)",
            "60.5 GiB",
        ),
    ),
    (
        "Cluster Compute",
        size(
            "cc1.4xlarge",
            "8 (2 x Intel Xeon X5570, quad-core with hyperthread)",
            "1690 GiB (2 x 840 GiB)",
            "22.5 GiB",
        ),
    ),
    (
        "Cluster CPU",
        size(
            "cg1.4xlarge",
            "8 (2 x Intel Xeon X5570, quad-core with hyperthread), plus 2 NVIDIA Tesla M2050 GPUs",
            "1680 GiB (2 x 840 GiB)",
            "22.5 GiB",
        ),
    ),
    (
        "High CPU",
        size("c1.xlarge", "8 (with 2.5 ECUs each)", "1680 GiB (4 x 420 GiB)", "8 GiB"),
    ),
    (
        "High CPU",
        size("c1.medium", "2 (with 2.5 ECUs each)", "340 GiB (1 x 340 GiB)", "1.7 GiB"),
    ),
    (
        "High I/O",
        size("hi1.4xlarge", "8 (with 4.37 ECUs each)", "2 TiB", "60.5 GiB"),
    ),
    (
        "High Memory",
        size("m2.2xlarge", "4 (with 3.25 ECUs each)", "840 GiB (1 x 840 GiB)", "34.2 GiB"),
    ),
    (
        "High Memory",
        size("m2.xlarge", "2 (with 3.25 ECUs each)", "410 GiB (1 x 410 GiB)", "17.1 GiB"),
    ),
    (
        "High Memory",
        size("m2.4xlarge", "8 (with 3.25 ECUs each)", "1680 GiB (2 x 840 GiB)", "68.4 GiB"),
    ),
    (
        "High-Memory Cluster",
        size(
            "cr1.8xlarge",
            "16 (2 x Intel Xeon E5-2670, eight-core)",
            "240 GiB (2 x 120 GiB SSD)",
            "244 GiB",
        ),
    ),
    (
        "High Storage",
        size(
            "hs1.8xlarge",
            "16 (8 cores + 8 hyperthreads)",
            "48 TiB (24 x 2 TiB hard disk drives)",
            "117 GiB",
        ),
    ),
    ("Micro", size("t1.micro", "1", "EBS", "615 MiB")),
    (
        "Standard",
        size("m1.xlarge", "4 (with 2 ECUs each)", "1680 GB (4 x 420 GiB)", "15 GiB"),
    ),
    (
        "Standard",
        size("m1.large", "2 (with 2 ECUs each)", "840 GiB (2 x 420 GiB)", "7.5 GiB"),
    ),
    ("Standard", size("m1.medium", "1", "400 GiB", "3.75 GiB")),
    ("Standard", size("m1.small", "1", "150 GiB", "1.7 GiB")),
    ("Standard", size("m3.2xlarge", "8 (with 3.25 ECUs each)", "EBS", "30 GiB")),
    ("Standard", size("m3.xlarge", "4 (with 3.25 ECUs each)", "EBS", "15 GiB")),
];

/// The static instance-type catalogue, grouped by family.
#[must_use]
pub fn avail_sizes() -> BTreeMap<&'static str, BTreeMap<&'static str, SizeInfo>> {
    let mut families: BTreeMap<&'static str, BTreeMap<&'static str, SizeInfo>> = BTreeMap::new();
    for (family, info) in SIZES {
        families.entry(*family).or_default().insert(info.id, *info);
    }
    families
}

/// `DescribeRegions`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DescribeRegions;

impl ApiRequest for DescribeRegions {
    const ACTION: &'static str = "DescribeRegions";
    const RAW_ROOT: bool = false;

    fn write_params(&self, _params: &mut Params) {}
}

/// `DescribeAvailabilityZones` filtered by region.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeAvailabilityZones {
    /// Region whose zones are listed.
    pub region: String,
}

impl ApiRequest for DescribeAvailabilityZones {
    const ACTION: &'static str = "DescribeAvailabilityZones";
    const RAW_ROOT: bool = false;

    fn write_params(&self, params: &mut Params) {
        params.filter(1, "region-name", [self.region.as_str()]);
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("region", self.region.as_str())]
    }
}

/// `DescribeImages`, optionally narrowed to specific images.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeImages {
    /// Images to describe; empty means all visible images.
    pub image_ids: Vec<String>,
}

impl ApiRequest for DescribeImages {
    const ACTION: &'static str = "DescribeImages";
    const RAW_ROOT: bool = false;

    fn write_params(&self, params: &mut Params) {
        params.indexed("ImageId", self.image_ids.iter().cloned());
    }
}

/// A region and its compute endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Region {
    /// Region name.
    pub name: String,
    /// Compute endpoint host.
    pub endpoint: String,
}

impl<T: Transport> Ec2Client<T> {
    /// Regions visible to the account, keyed by name.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn avail_locations(&self) -> Result<BTreeMap<String, Region>, LifecycleError> {
        let records = self.call(&DescribeRegions).await?;
        Ok(records
            .iter()
            .filter_map(|record| {
                let name = record.text_at(&["regionName"])?.to_owned();
                let endpoint = record.text_at(&["regionEndpoint"]).unwrap_or_default();
                Some((
                    name.clone(),
                    Region {
                        name,
                        endpoint: endpoint.to_owned(),
                    },
                ))
            })
            .collect())
    }

    /// Zones of `region` (the configured region when `None`) mapped to
    /// their state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn list_availability_zones(
        &self,
        region: Option<&str>,
    ) -> Result<BTreeMap<String, String>, LifecycleError> {
        let request = DescribeAvailabilityZones {
            region: region.unwrap_or(&self.config().location).to_owned(),
        };
        let records = self.call_in(&request, region).await?;
        Ok(records
            .iter()
            .filter_map(|record| {
                Some((
                    record.text_at(&["zoneName"])?.to_owned(),
                    record.text_at(&["zoneState"]).unwrap_or_default().to_owned(),
                ))
            })
            .collect())
    }

    /// Checks that `zone` exists in `region` and is available.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidParameter`] for unknown or
    /// unavailable zones, and propagates request failures.
    pub async fn validate_availability_zone(
        &self,
        zone: &str,
        region: Option<&str>,
    ) -> Result<(), LifecycleError> {
        let zones = self.list_availability_zones(region).await?;
        let region_name = region.unwrap_or(&self.config().location);
        match zones.get(zone).map(String::as_str) {
            Some("available") => Ok(()),
            Some(state) => {
                error!(zone, state, "availability zone is not available");
                Err(LifecycleError::InvalidParameter(format!(
                    "the availability zone {zone} is currently {state}"
                )))
            }
            None => {
                error!(zone, region = region_name, "unknown availability zone");
                Err(LifecycleError::InvalidParameter(format!(
                    "the availability zone {zone} is not valid in {region_name}"
                )))
            }
        }
    }

    /// Images visible to the account, keyed by image id.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn avail_images(&self) -> Result<BTreeMap<String, Node>, LifecycleError> {
        let records = self.call(&DescribeImages::default()).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let id = record.text_at(&["imageId"])?.to_owned();
                Some((id, record))
            })
            .collect())
    }

    /// Describes one image.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::MissingField`] for an empty id, and
    /// propagates request failures.
    pub async fn show_image(&self, image_id: &str) -> Result<Vec<Node>, LifecycleError> {
        require(&[("image", image_id)])?;
        self.call(&DescribeImages {
            image_ids: vec![image_id.to_owned()],
        })
        .await
    }
}
