//! Typed views over decoded provider records.
//!
//! Decoded replies are loose trees (see [`crate::xml`]). The types here pick
//! out the fields lifecycle code and the CLI rely on, treating a collection
//! that holds one element the same as one that holds many.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::profile::SshInterface;
use crate::xml::{Node, Record};

fn text(node: &Node, path: &[&str]) -> Option<String> {
    node.text_at(path)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn number(node: &Node, path: &[&str]) -> Option<u32> {
    node.text_at(path).and_then(|value| value.trim().parse().ok())
}

/// Collects `tagSet.item` key/value pairs.
#[must_use]
pub fn tag_map(node: &Node) -> BTreeMap<String, String> {
    node.all_at(&["tagSet", "item"])
        .into_iter()
        .filter_map(|item| {
            let key = item.text_at(&["key"])?;
            Some((key.to_owned(), item.text_at(&["value"]).unwrap_or_default().to_owned()))
        })
        .collect()
}

/// Merges records that each carry one field, as produced by raw-root
/// replies, into a single record.
#[must_use]
pub fn merge_records(records: &[Node]) -> Node {
    let mut merged = Record::default();
    for record in records.iter().filter_map(Node::as_record) {
        for (key, field) in record.iter() {
            for node in field.iter() {
                merged.push(key.to_owned(), node.clone());
            }
        }
    }
    Node::Map(merged)
}

/// Finds the first `item` in raw-root records, skipping the request id.
#[must_use]
pub fn first_item(records: &[Node]) -> Option<&Node> {
    records
        .iter()
        .find_map(|record| record.get("item").and_then(|field| field.first()))
}

/// Every `item` across raw-root records.
#[must_use]
pub fn all_items(records: &[Node]) -> Vec<&Node> {
    records
        .iter()
        .filter_map(|record| record.get("item"))
        .flat_map(|field| field.iter())
        .collect()
}

/// Every node at `path` across raw-root records.
///
/// Member-style replies wrap their payload in an `{Action}Result` element;
/// its record is the first of the raw-root records.
#[must_use]
pub fn result_members<'a>(records: &'a [Node], path: &[&str]) -> Vec<&'a Node> {
    records.iter().flat_map(|record| record.all_at(path)).collect()
}

/// A key/value tag.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Reads a `DescribeTags` item.
    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(Self {
            key: node.text_at(&["key"])?.to_owned(),
            value: node.text_at(&["value"]).unwrap_or_default().to_owned(),
        })
    }
}

/// A block device attached to an instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BlockDevice {
    /// Device name, for example `/dev/sda1`.
    pub device_name: String,
    /// Backing volume.
    pub volume_id: Option<String>,
    /// Whether the volume is deleted with the instance.
    pub delete_on_termination: Option<bool>,
}

impl BlockDevice {
    /// Reads a `blockDeviceMapping` item.
    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(Self {
            device_name: node.text_at(&["deviceName"])?.to_owned(),
            volume_id: text(node, &["ebs", "volumeId"]),
            delete_on_termination: node
                .text_at(&["ebs", "deleteOnTermination"])
                .map(|value| value == "true"),
        })
    }
}

/// An instance as reported by `DescribeInstances` or `RunInstances`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Instance {
    /// Instance identifier.
    pub id: String,
    /// Value of the `Name` tag.
    pub name: Option<String>,
    /// Image the instance was launched from.
    pub image_id: Option<String>,
    /// Instance type.
    pub instance_type: Option<String>,
    /// Lifecycle state name, for example `running`.
    pub state: Option<String>,
    /// Public address.
    pub public_ip: Option<String>,
    /// Private address.
    pub private_ip: Option<String>,
    /// Availability zone.
    pub availability_zone: Option<String>,
    /// All tags.
    pub tags: BTreeMap<String, String>,
    /// Block device mappings.
    pub block_devices: Vec<BlockDevice>,
    /// Identifiers of the security groups the instance belongs to.
    pub security_groups: Vec<String>,
    /// The record the instance was read from.
    pub raw: Node,
}

impl Instance {
    /// Reads an instance record.
    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        let tags = tag_map(node);
        Some(Self {
            id: text(node, &["instanceId"])?,
            name: tags.get("Name").cloned(),
            image_id: text(node, &["imageId"]),
            instance_type: text(node, &["instanceType"]),
            state: text(node, &["instanceState", "name"]),
            public_ip: text(node, &["ipAddress"]),
            private_ip: text(node, &["privateIpAddress"]),
            availability_zone: text(node, &["placement", "availabilityZone"]),
            tags,
            block_devices: node
                .all_at(&["blockDeviceMapping", "item"])
                .into_iter()
                .filter_map(BlockDevice::from_node)
                .collect(),
            security_groups: node
                .all_at(&["groupSet", "item"])
                .into_iter()
                .filter_map(|group| group.text_at(&["groupId"]))
                .map(str::to_owned)
                .collect(),
            raw: node.clone(),
        })
    }

    /// Reads every instance from reservation records.
    #[must_use]
    pub fn from_reservations(reservations: &[Node]) -> Vec<Self> {
        reservations
            .iter()
            .flat_map(|reservation| reservation.all_at(&["instancesSet", "item"]))
            .filter_map(Self::from_node)
            .collect()
    }

    /// The `Name` tag, falling back to the instance id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Returns `true` once either address is assigned.
    #[must_use]
    pub const fn has_address(&self) -> bool {
        self.public_ip.is_some() || self.private_ip.is_some()
    }

    /// Address used for deployment over `interface`.
    #[must_use]
    pub fn address(&self, interface: SshInterface) -> Option<&str> {
        match interface {
            SshInterface::PublicIps => self.public_ip.as_deref(),
            SshInterface::PrivateIps => self.private_ip.as_deref(),
        }
    }

    /// The root device mapping, when exactly one is present.
    #[must_use]
    pub fn root_device(&self) -> Option<&BlockDevice> {
        match self.block_devices.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// Short listing form.
    #[must_use]
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id.clone(),
            image: self.image_id.clone(),
            size: self.instance_type.clone(),
            state: self.state.clone(),
            private_ips: self.private_ip.iter().cloned().collect(),
            public_ips: self.public_ip.iter().cloned().collect(),
        }
    }
}

/// Short listing form of an [`Instance`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NodeSummary {
    /// Instance identifier.
    pub id: String,
    /// Image identifier.
    pub image: Option<String>,
    /// Instance type.
    pub size: Option<String>,
    /// Lifecycle state.
    pub state: Option<String>,
    /// Private addresses.
    pub private_ips: Vec<String>,
    /// Public addresses.
    pub public_ips: Vec<String>,
}

/// An EBS volume.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Volume {
    /// Volume identifier.
    pub id: String,
    /// Size in GiB.
    pub size: Option<u32>,
    /// Source snapshot.
    pub snapshot_id: Option<String>,
    /// Availability zone.
    pub availability_zone: Option<String>,
    /// Status, for example `available`.
    pub status: Option<String>,
    /// Volume type.
    pub volume_type: Option<String>,
}

impl Volume {
    /// Reads a volume record.
    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(Self {
            id: text(node, &["volumeId"])?,
            size: number(node, &["size"]),
            snapshot_id: text(node, &["snapshotId"]),
            availability_zone: text(node, &["availabilityZone"]),
            status: text(node, &["status"]),
            volume_type: text(node, &["volumeType"]),
        })
    }
}

/// An EBS snapshot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Snapshot {
    /// Snapshot identifier.
    pub id: String,
    /// Source volume.
    pub volume_id: Option<String>,
    /// Status, for example `pending`.
    pub status: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
}

impl Snapshot {
    /// Reads a snapshot record.
    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(Self {
            id: text(node, &["snapshotId"])?,
            volume_id: text(node, &["volumeId"]),
            status: text(node, &["status"]),
            description: text(node, &["description"]),
        })
    }
}

/// A security group.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SecurityGroup {
    /// Group identifier.
    pub id: String,
    /// Group name.
    pub name: Option<String>,
    /// Group description.
    pub description: Option<String>,
    /// Owning VPC.
    pub vpc_id: Option<String>,
}

impl SecurityGroup {
    /// Reads a security group record.
    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(Self {
            id: text(node, &["groupId"])?,
            name: text(node, &["groupName"]),
            description: text(node, &["groupDescription"]),
            vpc_id: text(node, &["vpcId"]),
        })
    }
}

/// A VPC subnet.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Subnet {
    /// Subnet identifier.
    pub id: String,
    /// Owning VPC.
    pub vpc_id: Option<String>,
    /// Address block.
    pub cidr_block: Option<String>,
    /// Availability zone.
    pub availability_zone: Option<String>,
    /// Tags.
    pub tags: BTreeMap<String, String>,
}

impl Subnet {
    /// Reads a subnet record.
    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(Self {
            id: text(node, &["subnetId"])?,
            vpc_id: text(node, &["vpcId"]),
            cidr_block: text(node, &["cidrBlock"]),
            availability_zone: text(node, &["availabilityZone"]),
            tags: tag_map(node),
        })
    }
}

/// A VPC.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Vpc {
    /// VPC identifier.
    pub id: String,
    /// Address block.
    pub cidr_block: Option<String>,
    /// State, for example `available`.
    pub state: Option<String>,
    /// Tags.
    pub tags: BTreeMap<String, String>,
}

impl Vpc {
    /// Reads a VPC record.
    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(Self {
            id: text(node, &["vpcId"])?,
            cidr_block: text(node, &["cidrBlock"]),
            state: text(node, &["state"]),
            tags: tag_map(node),
        })
    }

    /// Value of the `Name` tag.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.tags.get("Name").map(String::as_str)
    }
}

/// A classic load balancer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LoadBalancer {
    /// Load balancer name.
    pub name: String,
    /// Public DNS name.
    pub dns_name: Option<String>,
    /// Zones served.
    pub availability_zones: Vec<String>,
    /// Registered instance identifiers.
    pub instances: Vec<String>,
}

impl LoadBalancer {
    /// Reads a `LoadBalancerDescriptions` member.
    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(Self {
            name: text(node, &["LoadBalancerName"])?,
            dns_name: text(node, &["DNSName"]),
            availability_zones: node
                .all_at(&["AvailabilityZones", "member"])
                .into_iter()
                .filter_map(Node::as_text)
                .map(str::to_owned)
                .collect(),
            instances: node
                .all_at(&["Instances", "member"])
                .into_iter()
                .filter_map(|member| member.text_at(&["InstanceId"]))
                .map(str::to_owned)
                .collect(),
        })
    }
}

/// A server certificate known to the identity service.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Certificate {
    /// Certificate name.
    pub name: String,
    /// Resource name used by listeners.
    pub arn: String,
    /// Certificate identifier.
    pub id: Option<String>,
}

impl Certificate {
    /// Reads a `ServerCertificateMetadataList` member.
    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(Self {
            name: text(node, &["ServerCertificateName"])?,
            arn: text(node, &["Arn"])?,
            id: text(node, &["ServerCertificateId"]),
        })
    }
}

/// A data-warehouse cluster.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Cluster {
    /// Cluster identifier.
    pub identifier: String,
    /// Status, for example `available`.
    pub status: Option<String>,
    /// Node type.
    pub node_type: Option<String>,
    /// Endpoint address.
    pub endpoint: Option<String>,
}

impl Cluster {
    /// Reads a `Clusters` entry.
    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(Self {
            identifier: text(node, &["ClusterIdentifier"])?,
            status: text(node, &["ClusterStatus"]),
            node_type: text(node, &["NodeType"]),
            endpoint: text(node, &["Endpoint", "Address"]),
        })
    }
}
