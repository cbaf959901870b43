//! EBS volumes and snapshots.

use tracing::{debug, info, warn};

use super::{Ec2Client, LifecycleError, require};
use crate::model::{Snapshot, Volume, all_items, merge_records};
use crate::profile::VolumeSpec;
use crate::query::{ApiRequest, Params, Transport};
use crate::retry::{Attempt, RetryError, retry};
use crate::xml::Node;

/// Size in GiB used when neither a size nor a snapshot is given.
pub const DEFAULT_VOLUME_SIZE: u32 = 10;

/// `CreateVolume`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateVolume {
    /// Availability zone for the volume.
    pub zone: String,
    /// Size in GiB.
    pub size: Option<u32>,
    /// Snapshot to restore.
    pub snapshot: Option<String>,
    /// Volume type, for example `gp2` or `io1`.
    pub volume_type: Option<String>,
    /// Provisioned IOPS; only sent for `io1`.
    pub iops: Option<u32>,
}

impl CreateVolume {
    /// Builds a request from a profile volume entry.
    #[must_use]
    pub fn from_spec(spec: &VolumeSpec, zone: &str) -> Self {
        Self {
            zone: zone.to_owned(),
            size: spec.size,
            snapshot: spec.snapshot.clone(),
            volume_type: spec.volume_type.clone(),
            iops: spec.iops,
        }
    }
}

impl ApiRequest for CreateVolume {
    const ACTION: &'static str = "CreateVolume";

    fn write_params(&self, params: &mut Params) {
        let size = match (self.size, &self.snapshot) {
            (None, None) => Some(DEFAULT_VOLUME_SIZE),
            (size, _) => size,
        };
        params
            .set("AvailabilityZone", self.zone.as_str())
            .set_opt("Size", size)
            .set_opt("SnapshotId", self.snapshot.as_deref())
            .set_opt("VolumeType", self.volume_type.as_deref());
        if self.volume_type.as_deref() == Some("io1") {
            params.set_opt("Iops", self.iops);
        }
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("zone", self.zone.as_str())]
    }
}

/// `AttachVolume`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttachVolume {
    /// Volume to attach.
    pub volume_id: String,
    /// Target instance.
    pub instance_id: String,
    /// Device name, for example `/dev/sdf`.
    pub device: String,
}

impl ApiRequest for AttachVolume {
    const ACTION: &'static str = "AttachVolume";

    fn write_params(&self, params: &mut Params) {
        params
            .set("VolumeId", self.volume_id.as_str())
            .set("InstanceId", self.instance_id.as_str())
            .set("Device", self.device.as_str());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("volume_id", self.volume_id.as_str()),
            ("instance_id", self.instance_id.as_str()),
            ("device", self.device.as_str()),
        ]
    }
}

macro_rules! volume_action {
    ($(#[$meta:meta])* $name:ident, $action:literal, $key:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, Eq, PartialEq)]
        pub struct $name {
            /// Target volume.
            pub volume_id: String,
        }

        impl ApiRequest for $name {
            const ACTION: &'static str = $action;

            fn write_params(&self, params: &mut Params) {
                params.set($key, self.volume_id.as_str());
            }

            fn required_fields(&self) -> Vec<(&'static str, &str)> {
                vec![("volume_id", self.volume_id.as_str())]
            }
        }
    };
}

volume_action!(
    /// `DescribeVolumes` for one volume.
    DescribeVolume,
    "DescribeVolumes",
    "VolumeId.1"
);
volume_action!(
    /// `DetachVolume`.
    DetachVolume,
    "DetachVolume",
    "VolumeId"
);
volume_action!(
    /// `DeleteVolume`.
    DeleteVolume,
    "DeleteVolume",
    "VolumeId"
);

/// `CreateSnapshot` for one volume.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateSnapshot {
    /// Volume to snapshot.
    pub volume_id: String,
    /// Description applied to the snapshot.
    pub description: Option<String>,
}

impl ApiRequest for CreateSnapshot {
    const ACTION: &'static str = "CreateSnapshot";

    fn write_params(&self, params: &mut Params) {
        params
            .set("VolumeId", self.volume_id.as_str())
            .set_opt("Description", self.description.as_deref());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("volume_id", self.volume_id.as_str())]
    }
}

/// `DescribeSnapshots`, optionally filtered by description.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeSnapshots {
    /// Exact description to match.
    pub description: Option<String>,
}

impl ApiRequest for DescribeSnapshots {
    const ACTION: &'static str = "DescribeSnapshots";

    fn write_params(&self, params: &mut Params) {
        if let Some(description) = &self.description {
            params.filter(1, "description", [description.as_str()]);
        }
    }
}

/// `ModifySnapshotAttribute` granting volume-creation rights to an account.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShareSnapshot {
    /// Snapshot to share.
    pub snapshot_id: String,
    /// Account granted access.
    pub share_to: String,
}

impl ApiRequest for ShareSnapshot {
    const ACTION: &'static str = "ModifySnapshotAttribute";

    fn write_params(&self, params: &mut Params) {
        params
            .set("SnapshotId", self.snapshot_id.as_str())
            .set("CreateVolumePermission.Add.1.UserId", self.share_to.as_str());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("snapshot_id", self.snapshot_id.as_str()),
            ("share_to", self.share_to.as_str()),
        ]
    }
}

fn read_volume(records: &[Node], action: &'static str) -> Result<Volume, LifecycleError> {
    Volume::from_node(&merge_records(records)).ok_or_else(|| LifecycleError::UnexpectedReply {
        action,
        detail: String::from("no volumeId in reply"),
    })
}

impl<T: Transport> Ec2Client<T> {
    /// Creates a volume.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::MissingField`] without a zone, and
    /// propagates request failures.
    pub async fn create_volume(&self, request: &CreateVolume) -> Result<Volume, LifecycleError> {
        let records = self.call(request).await?;
        let volume = read_volume(&records, CreateVolume::ACTION)?;
        info!(volume_id = %volume.id, zone = %request.zone, "volume created");
        Ok(volume)
    }

    /// Attaches `volume_id` to `instance_id` as `device`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is missing or the request
    /// fails.
    pub async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<Vec<Node>, LifecycleError> {
        self.call(&AttachVolume {
            volume_id: volume_id.to_owned(),
            instance_id: instance_id.to_owned(),
            device: device.to_owned(),
        })
        .await
    }

    /// Describes one volume.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn show_volume(&self, volume_id: &str) -> Result<Vec<Volume>, LifecycleError> {
        let records = self
            .call(&DescribeVolume {
                volume_id: volume_id.to_owned(),
            })
            .await?;
        Ok(all_items(&records)
            .into_iter()
            .filter_map(Volume::from_node)
            .collect())
    }

    /// Detaches a volume from whatever instance holds it.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn detach_volume(&self, volume_id: &str) -> Result<Vec<Node>, LifecycleError> {
        self.call(&DetachVolume {
            volume_id: volume_id.to_owned(),
        })
        .await
    }

    /// Deletes a volume.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<Vec<Node>, LifecycleError> {
        self.call(&DeleteVolume {
            volume_id: volume_id.to_owned(),
        })
        .await
    }

    /// Snapshots each volume in the comma-separated `volume_ids`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] on the first failed snapshot.
    pub async fn create_snapshot(
        &self,
        volume_ids: &str,
        description: Option<&str>,
    ) -> Result<Vec<Snapshot>, LifecycleError> {
        require(&[("volume_id", volume_ids)])?;
        let mut snapshots = Vec::new();
        for volume_id in volume_ids.split(',').map(str::trim).filter(|id| !id.is_empty()) {
            let request = CreateSnapshot {
                volume_id: volume_id.to_owned(),
                description: description.map(str::to_owned),
            };
            let records = self.call(&request).await?;
            let snapshot = Snapshot::from_node(&merge_records(&records)).ok_or_else(|| {
                LifecycleError::UnexpectedReply {
                    action: CreateSnapshot::ACTION,
                    detail: String::from("no snapshotId in reply"),
                }
            })?;
            info!(volume_id, snapshot_id = %snapshot.id, "snapshot started");
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    /// Lists snapshots, optionally only those with `description`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn describe_snapshots(
        &self,
        description: Option<&str>,
    ) -> Result<Vec<Snapshot>, LifecycleError> {
        let records = self
            .call(&DescribeSnapshots {
                description: description.map(str::to_owned),
            })
            .await?;
        Ok(all_items(&records)
            .into_iter()
            .filter_map(Snapshot::from_node)
            .collect())
    }

    /// Lets account `share_to` create volumes from `snapshot_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is missing or the request
    /// fails.
    pub async fn share_snapshot(
        &self,
        snapshot_id: &str,
        share_to: &str,
    ) -> Result<Vec<Node>, LifecycleError> {
        self.call(&ShareSnapshot {
            snapshot_id: snapshot_id.to_owned(),
            share_to: share_to.to_owned(),
        })
        .await
    }

    /// Creates (when needed) and attaches every volume in `volumes`.
    ///
    /// Volumes without an id are created in `zone` first. Each attach is
    /// retried under the attach policy; afterwards delete-on-termination is
    /// enabled unless the entry opts out. Returns one line per attached
    /// volume.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AttachFailed`] when an attach never
    /// succeeds, and propagates creation failures.
    pub async fn create_attach_volumes(
        &self,
        name: &str,
        instance_id: &str,
        zone: &str,
        volumes: &[VolumeSpec],
    ) -> Result<Vec<String>, LifecycleError> {
        require(&[("instance_id", instance_id), ("zone", zone)])?;
        let mut attached = Vec::with_capacity(volumes.len());
        for spec in volumes {
            require(&[("device", spec.device.as_str())])?;
            let volume_id = match &spec.volume_id {
                Some(existing) => existing.clone(),
                None => self.create_volume(&CreateVolume::from_spec(spec, zone)).await?.id,
            };
            self.attach_with_retry(&volume_id, instance_id, &spec.device)
                .await?;

            let line = format!(
                "{volume_id} attached to {instance_id} (aka {name}) as device {}",
                spec.device
            );
            info!("{line}");
            attached.push(line);

            if spec.delete_on_termination.unwrap_or(true) {
                self.set_delete_on_termination(instance_id, Some(spec.device.as_str()), true)
                    .await?;
            }
        }
        Ok(attached)
    }

    async fn attach_with_retry(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), LifecycleError> {
        let client = self;
        let outcome = retry(&self.attach_policy, "attach_volume", move || async move {
            match client.attach_volume(volume_id, instance_id, device).await {
                Ok(records) if records.is_empty() => {
                    warn!(volume_id, "empty reply to AttachVolume");
                    Ok(Attempt::Pending(String::from("empty reply")))
                }
                Ok(records) => {
                    debug!(volume_id, records = records.len(), "volume attached");
                    Ok(Attempt::Ready(()))
                }
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    warn!(volume_id, error = %err, "attach failed; retrying");
                    Ok(Attempt::Pending(err.to_string()))
                }
            }
        })
        .await;
        match outcome {
            Ok(()) => Ok(()),
            Err(RetryError::Fatal(err)) => Err(err),
            Err(RetryError::Exhausted { last, .. }) => Err(LifecycleError::AttachFailed {
                volume_id: volume_id.to_owned(),
                instance_id: instance_id.to_owned(),
                last,
            }),
        }
    }

    /// Creates one `size` GiB volume per letter in `drive_letters` and
    /// attaches each as `/dev/sd<letter>` to the instance named `name`.
    ///
    /// # Errors
    ///
    /// See [`Ec2Client::create_attach_volumes`].
    pub async fn create_attach_volumes_quick(
        &self,
        name: &str,
        drive_letters: &str,
        size: u32,
    ) -> Result<Vec<String>, LifecycleError> {
        require(&[("drive_letters", drive_letters)])?;
        let instance = self.find_node(name, None).await?;
        let zone = instance.availability_zone.clone().unwrap_or_default();
        let volumes: Vec<VolumeSpec> = drive_letters
            .chars()
            .filter(char::is_ascii_alphabetic)
            .map(|letter| VolumeSpec {
                device: format!("/dev/sd{letter}"),
                size: Some(size),
                ..VolumeSpec::default()
            })
            .collect();
        self.create_attach_volumes(name, &instance.id, &zone, &volumes)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedTransport, scripted_client, xml_error};

    const CREATED: &str = "<CreateVolumeResponse><requestId>req</requestId>\
        <volumeId>vol-9</volumeId><size>10</size><availabilityZone>us-east-1a</availabilityZone>\
        <status>creating</status></CreateVolumeResponse>";

    const ATTACHED: &str = "<AttachVolumeResponse><requestId>req</requestId>\
        <volumeId>vol-9</volumeId><instanceId>i-1</instanceId><device>/dev/sdf</device>\
        <status>attaching</status></AttachVolumeResponse>";

    const MAPPINGS: &str = "<DescribeInstanceAttributeResponse><requestId>req</requestId>\
        <instanceId>i-1</instanceId><blockDeviceMapping><item><deviceName>/dev/sdf</deviceName>\
        <ebs><volumeId>vol-9</volumeId><deleteOnTermination>true</deleteOnTermination></ebs>\
        </item></blockDeviceMapping></DescribeInstanceAttributeResponse>";

    #[test]
    fn size_defaults_without_snapshot() {
        let params = CreateVolume {
            zone: String::from("us-east-1a"),
            ..CreateVolume::default()
        }
        .to_params();
        assert_eq!(params.get("Size"), Some("10"));

        let from_snapshot = CreateVolume {
            zone: String::from("us-east-1a"),
            snapshot: Some(String::from("snap-1")),
            ..CreateVolume::default()
        }
        .to_params();
        assert_eq!(from_snapshot.get("Size"), None);
        assert_eq!(from_snapshot.get("SnapshotId"), Some("snap-1"));
    }

    #[test]
    fn iops_only_sent_for_io1() {
        let mut request = CreateVolume {
            zone: String::from("us-east-1a"),
            volume_type: Some(String::from("gp2")),
            iops: Some(300),
            ..CreateVolume::default()
        };
        assert_eq!(request.to_params().get("Iops"), None);
        request.volume_type = Some(String::from("io1"));
        assert_eq!(request.to_params().get("Iops"), Some("300"));
    }

    #[tokio::test]
    async fn create_volume_requires_zone() {
        let transport = ScriptedTransport::new();
        let err = scripted_client(&transport)
            .create_volume(&CreateVolume::default())
            .await
            .expect_err("zone is required");
        assert_eq!(err, LifecycleError::MissingField(String::from("zone")));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn volumes_are_created_attached_and_flagged() {
        let transport = ScriptedTransport::new();
        transport.push_ok(CREATED);
        transport.push_reply(400, xml_error("IncorrectState", "volume is creating"));
        transport.push_ok(ATTACHED);
        transport.push_ok(crate::test_support::xml_ok("ModifyInstanceAttribute"));
        transport.push_ok(MAPPINGS);

        let volumes = [VolumeSpec {
            device: String::from("/dev/sdf"),
            ..VolumeSpec::default()
        }];
        let attached = scripted_client(&transport)
            .create_attach_volumes("web-1", "i-1", "us-east-1a", &volumes)
            .await
            .expect("volume attached");

        assert_eq!(attached, ["vol-9 attached to i-1 (aka web-1) as device /dev/sdf"]);
        assert_eq!(
            transport.actions(),
            [
                "CreateVolume",
                "AttachVolume",
                "AttachVolume",
                "ModifyInstanceAttribute",
                "DescribeInstanceAttribute"
            ]
        );
    }

    #[tokio::test]
    async fn attach_gives_up_after_budget() {
        let transport = ScriptedTransport::new();
        for _ in 0..3 {
            transport.push_reply(400, xml_error("IncorrectState", "busy"));
        }
        let volumes = [VolumeSpec {
            device: String::from("/dev/sdf"),
            volume_id: Some(String::from("vol-1")),
            delete_on_termination: Some(false),
            ..VolumeSpec::default()
        }];
        let err = scripted_client(&transport)
            .create_attach_volumes("web-1", "i-1", "us-east-1a", &volumes)
            .await
            .expect_err("attach exhausted");
        assert!(matches!(err, LifecycleError::AttachFailed { ref volume_id, .. } if volume_id == "vol-1"));
        assert_eq!(transport.count_action("CreateVolume"), 0);
    }

    #[tokio::test]
    async fn snapshots_are_taken_per_volume() {
        let transport = ScriptedTransport::new();
        for (snapshot, volume) in [("snap-1", "vol-1"), ("snap-2", "vol-2")] {
            transport.push_ok(format!(
                "<CreateSnapshotResponse><requestId>req</requestId><snapshotId>{snapshot}</snapshotId>\
                 <volumeId>{volume}</volumeId><status>pending</status></CreateSnapshotResponse>"
            ));
        }
        let snapshots = scripted_client(&transport)
            .create_snapshot("vol-1, vol-2", Some("nightly"))
            .await
            .expect("snapshots started");
        let ids: Vec<&str> = snapshots.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["snap-1", "snap-2"]);
        let params = transport.request_params();
        assert!(params
            .iter()
            .all(|sent| sent.get("Description").map(String::as_str) == Some("nightly")));
    }
}
