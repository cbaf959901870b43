//! Instance listing, lookup and state changes.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Ec2Client, LifecycleError, require};
use crate::model::{BlockDevice, Instance, NodeSummary, all_items};
use crate::query::{ApiRequest, Params, Transport};
use crate::retry::{Attempt, RetryError, retry};
use crate::xml::Node;

/// `DescribeInstances`, optionally narrowed to specific ids.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeInstances {
    /// Instances to describe; empty means all.
    pub instance_ids: Vec<String>,
}

impl ApiRequest for DescribeInstances {
    const ACTION: &'static str = "DescribeInstances";
    const RAW_ROOT: bool = false;

    fn write_params(&self, params: &mut Params) {
        params.indexed("InstanceId", self.instance_ids.iter().cloned());
    }
}

macro_rules! instance_action {
    ($(#[$meta:meta])* $name:ident, $action:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, Eq, PartialEq)]
        pub struct $name {
            /// Target instance.
            pub instance_id: String,
        }

        impl ApiRequest for $name {
            const ACTION: &'static str = $action;
            const RAW_ROOT: bool = false;

            fn write_params(&self, params: &mut Params) {
                params.set("InstanceId.1", self.instance_id.as_str());
            }

            fn required_fields(&self) -> Vec<(&'static str, &str)> {
                vec![("instance_id", self.instance_id.as_str())]
            }
        }
    };
}

instance_action!(
    /// `StopInstances` for one instance.
    StopInstances,
    "StopInstances"
);
instance_action!(
    /// `StartInstances` for one instance.
    StartInstances,
    "StartInstances"
);
instance_action!(
    /// `RebootInstances` for one instance.
    RebootInstances,
    "RebootInstances"
);
instance_action!(
    /// `TerminateInstances` for one instance.
    TerminateInstances,
    "TerminateInstances"
);

/// Instance attributes readable through `DescribeInstanceAttribute`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceAttribute {
    /// Termination protection.
    DisableApiTermination,
    /// Source/destination checking.
    SourceDestCheck,
    /// Block device mappings.
    BlockDeviceMapping,
}

impl InstanceAttribute {
    /// Attribute name on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DisableApiTermination => "disableApiTermination",
            Self::SourceDestCheck => "sourceDestCheck",
            Self::BlockDeviceMapping => "blockDeviceMapping",
        }
    }
}

/// `DescribeInstanceAttribute`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DescribeInstanceAttribute {
    /// Target instance.
    pub instance_id: String,
    /// Attribute to read.
    pub attribute: InstanceAttribute,
}

impl ApiRequest for DescribeInstanceAttribute {
    const ACTION: &'static str = "DescribeInstanceAttribute";

    fn write_params(&self, params: &mut Params) {
        params
            .set("InstanceId", self.instance_id.as_str())
            .set("Attribute", self.attribute.as_str());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("instance_id", self.instance_id.as_str())]
    }
}

/// A change applied through `ModifyInstanceAttribute`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttributeChange {
    /// Enable or disable termination protection.
    DisableApiTermination(bool),
    /// Enable or disable source/destination checking.
    SourceDestCheck(bool),
    /// Set delete-on-termination for one device.
    DeleteOnTermination {
        /// Device name.
        device: String,
        /// New value.
        delete: bool,
    },
    /// Replace the instance's security groups.
    Groups(Vec<String>),
}

/// `ModifyInstanceAttribute`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModifyInstanceAttribute {
    /// Target instance.
    pub instance_id: String,
    /// Change to apply.
    pub change: AttributeChange,
}

impl ApiRequest for ModifyInstanceAttribute {
    const ACTION: &'static str = "ModifyInstanceAttribute";

    fn write_params(&self, params: &mut Params) {
        params.set("InstanceId", self.instance_id.as_str());
        match &self.change {
            AttributeChange::DisableApiTermination(enabled) => {
                params.set("DisableApiTermination.Value", enabled.to_string());
            }
            AttributeChange::SourceDestCheck(enabled) => {
                params.set("SourceDestCheck.Value", enabled.to_string());
            }
            AttributeChange::DeleteOnTermination { device, delete } => {
                let mut mapping = params.scope("BlockDeviceMapping", 1);
                mapping.set("DeviceName", device.as_str());
                mapping.set("Ebs.DeleteOnTermination", delete.to_string());
            }
            AttributeChange::Groups(groups) => {
                params.indexed("GroupId", groups.iter().cloned());
            }
        }
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![("instance_id", self.instance_id.as_str())];
        match &self.change {
            AttributeChange::DeleteOnTermination { device, .. } => {
                fields.push(("device", device.as_str()));
            }
            AttributeChange::Groups(groups) => {
                fields.push(("groups", groups.first().map_or("", String::as_str)));
            }
            AttributeChange::DisableApiTermination(_) | AttributeChange::SourceDestCheck(_) => {}
        }
        fields
    }
}

/// Result of [`Ec2Client::destroy`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DestroyOutcome {
    /// Terminated instance.
    pub instance_id: String,
    /// Name the instance was given before termination, if renamed.
    pub renamed_to: Option<String>,
    /// State transitions reported by the provider.
    pub state_changes: Vec<Node>,
}

/// Raw-root attribute replies decode the attribute element to `{value}`.
fn attribute_flag(records: &[Node]) -> Option<bool> {
    records
        .iter()
        .find_map(|record| record.text_at(&["value"]))
        .map(|value| value == "true")
}

impl<T: Transport> Ec2Client<T> {
    /// Every instance in `region`, keyed by `Name` tag (or id when untagged).
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the listing fails.
    pub async fn list_nodes_full(
        &self,
        region: Option<&str>,
    ) -> Result<BTreeMap<String, Instance>, LifecycleError> {
        let reservations = self.call_in(&DescribeInstances::default(), region).await?;
        Ok(Instance::from_reservations(&reservations)
            .into_iter()
            .map(|instance| (instance.display_name().to_owned(), instance))
            .collect())
    }

    /// Short listing of every instance in `region`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the listing fails.
    pub async fn list_nodes(
        &self,
        region: Option<&str>,
    ) -> Result<BTreeMap<String, NodeSummary>, LifecycleError> {
        Ok(self
            .list_nodes_full(region)
            .await?
            .into_iter()
            .map(|(name, instance)| (name, instance.summary()))
            .collect())
    }

    /// Finds the instance named `name`, retrying while listings lag behind.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NodeNotFound`] once the lookup budget is
    /// spent, or a fatal error from the listing.
    pub async fn find_node(
        &self,
        name: &str,
        region: Option<&str>,
    ) -> Result<Instance, LifecycleError> {
        require(&[("name", name)])?;
        let client = self;
        let outcome = retry(&self.lookup_policy, "find_node", move || async move {
            match client.list_nodes_full(region).await {
                Ok(mut nodes) => Ok(nodes.remove(name).map_or_else(
                    || Attempt::Pending(format!("{name} not listed")),
                    Attempt::Ready,
                )),
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => Ok(Attempt::Pending(err.to_string())),
            }
        })
        .await;
        match outcome {
            Ok(instance) => Ok(instance),
            Err(RetryError::Fatal(err)) => Err(err),
            Err(RetryError::Exhausted { .. }) => {
                error!(name, "instance not found");
                Err(LifecycleError::NodeNotFound(name.to_owned()))
            }
        }
    }

    /// Full details of the instance named `name`.
    ///
    /// # Errors
    ///
    /// See [`Ec2Client::find_node`].
    pub async fn show_instance(&self, name: &str) -> Result<Instance, LifecycleError> {
        self.find_node(name, None).await
    }

    /// Describes one instance by id.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn describe_instance(
        &self,
        instance_id: &str,
        region: Option<&str>,
    ) -> Result<Option<Instance>, LifecycleError> {
        require(&[("instance_id", instance_id)])?;
        let request = DescribeInstances {
            instance_ids: vec![instance_id.to_owned()],
        };
        let reservations = self.call_in(&request, region).await?;
        Ok(Instance::from_reservations(&reservations).into_iter().next())
    }

    /// Stops the instance named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the lookup or request fails.
    pub async fn stop(&self, name: &str) -> Result<Vec<Node>, LifecycleError> {
        let instance = self.find_node(name, None).await?;
        info!(name, instance_id = %instance.id, "stopping instance");
        self.call(&StopInstances {
            instance_id: instance.id,
        })
        .await
    }

    /// Starts the instance named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the lookup or request fails.
    pub async fn start(&self, name: &str) -> Result<Vec<Node>, LifecycleError> {
        let instance = self.find_node(name, None).await?;
        info!(name, instance_id = %instance.id, "starting instance");
        self.call(&StartInstances {
            instance_id: instance.id,
        })
        .await
    }

    /// Reboots the instance named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the lookup or request fails.
    pub async fn reboot(&self, name: &str) -> Result<Vec<Node>, LifecycleError> {
        let instance = self.find_node(name, None).await?;
        info!(name, instance_id = %instance.id, "rebooting instance");
        self.call(&RebootInstances {
            instance_id: instance.id,
        })
        .await
    }

    /// Terminates `instance_id` without any protection checks.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn terminate_instance(
        &self,
        instance_id: &str,
        region: Option<&str>,
    ) -> Result<Vec<Node>, LifecycleError> {
        self.call_in(
            &TerminateInstances {
                instance_id: instance_id.to_owned(),
            },
            region,
        )
        .await
    }

    /// Destroys the instance named `name`.
    ///
    /// Refuses to act on termination-protected instances. When
    /// `rename_on_destroy` is configured the instance is first renamed to
    /// `{name}-DEL{uuid}` so the name can be reused immediately.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TerminationProtected`] without sending a
    /// terminate request when protection is enabled, and propagates lookup,
    /// rename, and request failures.
    pub async fn destroy(&self, name: &str) -> Result<DestroyOutcome, LifecycleError> {
        let instance = self.find_node(name, None).await?;
        if self.show_term_protect(&instance.id).await? {
            error!(name, instance_id = %instance.id, "termination protection is enabled");
            return Err(LifecycleError::TerminationProtected {
                instance_id: instance.id,
            });
        }

        let renamed_to = if self.config().rename_on_destroy {
            let new_name = format!("{name}-DEL{}", Uuid::new_v4().simple());
            let tags = BTreeMap::from([(String::from("Name"), new_name.clone())]);
            self.set_tags(&instance.id, &tags, None).await?;
            info!(name, %new_name, "renamed instance before termination");
            Some(new_name)
        } else {
            None
        };

        let state_changes = self.terminate_instance(&instance.id, None).await?;
        info!(name, instance_id = %instance.id, "instance terminated");
        Ok(DestroyOutcome {
            instance_id: instance.id,
            renamed_to,
            state_changes,
        })
    }

    async fn read_flag(
        &self,
        instance_id: &str,
        attribute: InstanceAttribute,
    ) -> Result<bool, LifecycleError> {
        let request = DescribeInstanceAttribute {
            instance_id: instance_id.to_owned(),
            attribute,
        };
        let records = self.call(&request).await?;
        attribute_flag(&records).ok_or_else(|| LifecycleError::UnexpectedReply {
            action: DescribeInstanceAttribute::ACTION,
            detail: format!("{} has no value", attribute.as_str()),
        })
    }

    async fn modify(
        &self,
        instance_id: &str,
        change: AttributeChange,
    ) -> Result<(), LifecycleError> {
        self.call(&ModifyInstanceAttribute {
            instance_id: instance_id.to_owned(),
            change,
        })
        .await
        .map(|_| ())
    }

    /// Whether termination protection is enabled on `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the attribute cannot be read.
    pub async fn show_term_protect(&self, instance_id: &str) -> Result<bool, LifecycleError> {
        self.read_flag(instance_id, InstanceAttribute::DisableApiTermination)
            .await
    }

    /// Enables or disables termination protection on the instance named
    /// `name`, returning the value read back afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the lookup or requests fail.
    pub async fn set_term_protect(&self, name: &str, enabled: bool) -> Result<bool, LifecycleError> {
        let instance = self.find_node(name, None).await?;
        self.modify(&instance.id, AttributeChange::DisableApiTermination(enabled))
            .await?;
        self.show_term_protect(&instance.id).await
    }

    /// Whether source/destination checking is enabled on `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the attribute cannot be read.
    pub async fn show_sourcedest_check(&self, instance_id: &str) -> Result<bool, LifecycleError> {
        self.read_flag(instance_id, InstanceAttribute::SourceDestCheck)
            .await
    }

    /// Enables or disables source/destination checking on the instance
    /// named `name`, returning the value read back afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the lookup or requests fail.
    pub async fn set_sourcedest_check(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<bool, LifecycleError> {
        let instance = self.find_node(name, None).await?;
        self.modify(&instance.id, AttributeChange::SourceDestCheck(enabled))
            .await?;
        self.show_sourcedest_check(&instance.id).await
    }

    /// Block device mappings of `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the attribute cannot be read.
    pub async fn block_device_mappings(
        &self,
        instance_id: &str,
    ) -> Result<Vec<BlockDevice>, LifecycleError> {
        let request = DescribeInstanceAttribute {
            instance_id: instance_id.to_owned(),
            attribute: InstanceAttribute::BlockDeviceMapping,
        };
        let records = self.call(&request).await?;
        Ok(all_items(&records)
            .into_iter()
            .filter_map(BlockDevice::from_node)
            .collect())
    }

    /// Sets delete-on-termination for `device` on `instance_id`.
    ///
    /// Without a device, the root device is used; that requires the
    /// instance to report exactly one mapping.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidParameter`] when no device can be
    /// chosen, and propagates request failures.
    pub async fn set_delete_on_termination(
        &self,
        instance_id: &str,
        device: Option<&str>,
        delete: bool,
    ) -> Result<Vec<BlockDevice>, LifecycleError> {
        let device_name = match device {
            Some(name) => name.to_owned(),
            None => {
                let mappings = self.block_device_mappings(instance_id).await?;
                match mappings.as_slice() {
                    [only] => only.device_name.clone(),
                    _ => {
                        error!(
                            instance_id,
                            count = mappings.len(),
                            "cannot pick a root device; name the device explicitly"
                        );
                        return Err(LifecycleError::InvalidParameter(format!(
                            "{instance_id} has {} block devices; a device name is required",
                            mappings.len()
                        )));
                    }
                }
            }
        };
        self.modify(
            instance_id,
            AttributeChange::DeleteOnTermination {
                device: device_name,
                delete,
            },
        )
        .await?;
        self.block_device_mappings(instance_id).await
    }

    /// Keeps the volume behind `device` (or the root device) when the
    /// instance named `name` is destroyed.
    ///
    /// # Errors
    ///
    /// See [`Ec2Client::set_delete_on_termination`].
    pub async fn keepvol_on_destroy(
        &self,
        name: &str,
        device: Option<&str>,
    ) -> Result<Vec<BlockDevice>, LifecycleError> {
        let instance = self.find_node(name, None).await?;
        self.set_delete_on_termination(&instance.id, device, false)
            .await
    }

    /// Deletes the volume behind `device` (or the root device) when the
    /// instance named `name` is destroyed.
    ///
    /// # Errors
    ///
    /// See [`Ec2Client::set_delete_on_termination`].
    pub async fn delvol_on_destroy(
        &self,
        name: &str,
        device: Option<&str>,
    ) -> Result<Vec<BlockDevice>, LifecycleError> {
        let instance = self.find_node(name, None).await?;
        self.set_delete_on_termination(&instance.id, device, true)
            .await
    }

    /// Adds `group` (an id, or a name dereferenced within `vpc_id`) to the
    /// security groups of the instance named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when the group name cannot be
    /// resolved, and propagates lookup and request failures.
    pub async fn attach_security_group(
        &self,
        name: &str,
        group: &str,
        vpc_id: Option<&str>,
    ) -> Result<Vec<String>, LifecycleError> {
        require(&[("group", group)])?;
        let instance = self.find_node(name, None).await?;
        let new_group = self.security_group_id(group, vpc_id).await?;
        let mut groups = instance.security_groups.clone();
        if !groups.contains(&new_group) {
            groups.push(new_group);
        }
        self.modify(&instance.id, AttributeChange::Groups(groups.clone()))
            .await?;
        info!(name, groups = ?groups, "security groups updated");
        Ok(groups)
    }

    /// The `Name` tag of `instance_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the tags cannot be read.
    pub async fn get_instance_name(
        &self,
        instance_id: &str,
        region: Option<&str>,
    ) -> Result<Option<String>, LifecycleError> {
        let tags = self.get_tags(instance_id, region).await?;
        let name = tags
            .into_iter()
            .find(|tag| tag.key == "Name")
            .map(|tag| tag.value);
        if name.is_none() {
            warn!(instance_id, "instance has no Name tag");
        }
        Ok(name)
    }
}
