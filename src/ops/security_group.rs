//! Security groups and their ingress/egress rules.

use std::collections::BTreeMap;

use tracing::{error, info};

use super::parse::parse_str_parameters;
use super::{Ec2Client, LifecycleError};
use crate::model::{SecurityGroup, all_items, merge_records};
use crate::query::{ApiRequest, Params, Transport};
use crate::xml::Node;

/// One `IpPermissions.N` entry.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IpPermission {
    /// Protocol name or number; required.
    pub protocol: String,
    /// First port of the range.
    pub from_port: Option<String>,
    /// Last port of the range.
    pub to_port: Option<String>,
    /// Source or destination address block.
    pub cidr_ip: Option<String>,
    /// Peer group by name.
    pub group_name: Option<String>,
    /// Peer group by id.
    pub group_id: Option<String>,
    /// Account owning the peer group.
    pub user_id: Option<String>,
}

impl IpPermission {
    /// Reads a rule from parsed `key=value` fields.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidParameter`] when `protocol` is
    /// absent.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, LifecycleError> {
        let field = |key: &str| fields.get(key).cloned();
        let Some(protocol) = field("protocol") else {
            error!("rules.protocol is a required parameter");
            return Err(LifecycleError::InvalidParameter(String::from(
                "every rule needs a protocol",
            )));
        };
        Ok(Self {
            protocol,
            from_port: field("from-port"),
            to_port: field("to-port"),
            cidr_ip: field("ip-range"),
            group_name: field("group-name"),
            group_id: field("group-id"),
            user_id: field("user-id"),
        })
    }

    /// Writes the rule under `IpPermissions.{index}`.
    pub fn write(&self, params: &mut Params, index: usize) {
        let mut rule = params.scope("IpPermissions", index);
        rule.set("IpProtocol", self.protocol.as_str())
            .set_opt("FromPort", self.from_port.as_deref())
            .set_opt("ToPort", self.to_port.as_deref());
        if let Some(cidr) = &self.cidr_ip {
            rule.scope("IpRanges", 1).set("CidrIp", cidr.as_str());
        }
        if self.group_name.is_some() || self.group_id.is_some() || self.user_id.is_some() {
            rule.scope("Groups", 1)
                .set_opt("GroupName", self.group_name.as_deref())
                .set_opt("GroupId", self.group_id.as_deref())
                .set_opt("UserId", self.user_id.as_deref());
        }
    }
}

/// Parses a rule string such as
/// `protocol=tcp,from-port=22,to-port=22,ip-range=0.0.0.0/0;...`.
///
/// # Errors
///
/// Returns [`LifecycleError::InvalidParameter`] for malformed input or a
/// rule without a protocol.
pub fn parse_rules(rules: &str) -> Result<Vec<IpPermission>, LifecycleError> {
    parse_str_parameters(rules)?
        .iter()
        .map(IpPermission::from_fields)
        .collect()
}

/// Identifies the group a rule applies to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GroupRef {
    /// By group id.
    Id(String),
    /// By group name (non-VPC groups).
    Name(String),
}

/// `AuthorizeSecurityGroupIngress`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthorizeIngress {
    /// Group receiving the rules.
    pub group: GroupRef,
    /// Rules to add.
    pub permissions: Vec<IpPermission>,
}

impl ApiRequest for AuthorizeIngress {
    const ACTION: &'static str = "AuthorizeSecurityGroupIngress";

    fn write_params(&self, params: &mut Params) {
        match &self.group {
            GroupRef::Id(id) => params.set("GroupId", id.as_str()),
            GroupRef::Name(name) => params.set("GroupName", name.as_str()),
        };
        for (index, permission) in self.permissions.iter().enumerate() {
            permission.write(params, index + 1);
        }
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        let group = match &self.group {
            GroupRef::Id(value) | GroupRef::Name(value) => value.as_str(),
        };
        vec![
            ("group", group),
            (
                "rules",
                self.permissions.first().map_or("", |rule| rule.protocol.as_str()),
            ),
        ]
    }
}

/// `AuthorizeSecurityGroupEgress`; VPC groups only, so always by id.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AuthorizeEgress {
    /// Group receiving the rules.
    pub group_id: String,
    /// Rules to add.
    pub permissions: Vec<IpPermission>,
}

impl ApiRequest for AuthorizeEgress {
    const ACTION: &'static str = "AuthorizeSecurityGroupEgress";

    fn write_params(&self, params: &mut Params) {
        params.set("GroupId", self.group_id.as_str());
        for (index, permission) in self.permissions.iter().enumerate() {
            permission.write(params, index + 1);
        }
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("group-id", self.group_id.as_str()),
            (
                "rules",
                self.permissions.first().map_or("", |rule| rule.protocol.as_str()),
            ),
        ]
    }
}

/// `DescribeSecurityGroups` filtered by VPC and group name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeSecurityGroups {
    /// Owning VPC.
    pub vpc_id: String,
    /// Exact group name.
    pub group_name: String,
}

impl ApiRequest for DescribeSecurityGroups {
    const ACTION: &'static str = "DescribeSecurityGroups";

    fn write_params(&self, params: &mut Params) {
        params
            .filter(1, "vpc-id", [self.vpc_id.as_str()])
            .filter(2, "group-name", [self.group_name.as_str()]);
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("vpc-id", self.vpc_id.as_str()),
            ("group-name", self.group_name.as_str()),
        ]
    }
}

/// `CreateSecurityGroup`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateSecurityGroup {
    /// Group name.
    pub group_name: String,
    /// Group description.
    pub description: String,
    /// Owning VPC, for VPC groups.
    pub vpc_id: Option<String>,
}

impl ApiRequest for CreateSecurityGroup {
    const ACTION: &'static str = "CreateSecurityGroup";

    fn write_params(&self, params: &mut Params) {
        params
            .set("GroupName", self.group_name.as_str())
            .set("GroupDescription", self.description.as_str())
            .set_opt("VpcId", self.vpc_id.as_deref());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("group-name", self.group_name.as_str()),
            ("group-desc", self.description.as_str()),
        ]
    }
}

impl<T: Transport> Ec2Client<T> {
    /// Security groups in `vpc_id` named exactly `group_name`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is empty or the request
    /// fails.
    pub async fn describe_sg(
        &self,
        vpc_id: &str,
        group_name: &str,
    ) -> Result<Vec<SecurityGroup>, LifecycleError> {
        let records = self
            .call(&DescribeSecurityGroups {
                vpc_id: vpc_id.to_owned(),
                group_name: group_name.to_owned(),
            })
            .await?;
        Ok(all_items(&records)
            .into_iter()
            .filter_map(SecurityGroup::from_node)
            .collect())
    }

    /// Creates a security group, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is empty or the request
    /// fails.
    pub async fn create_sg(&self, request: &CreateSecurityGroup) -> Result<String, LifecycleError> {
        let records = self.call(request).await?;
        let group_id = merge_records(&records)
            .text_at(&["groupId"])
            .map(str::to_owned)
            .ok_or_else(|| LifecycleError::UnexpectedReply {
                action: CreateSecurityGroup::ACTION,
                detail: String::from("no groupId in reply"),
            })?;
        info!(%group_id, name = %request.group_name, "security group created");
        Ok(group_id)
    }

    /// Adds ingress rules parsed from `rules` to `group`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidParameter`] for malformed rules, and
    /// propagates request failures.
    pub async fn create_ingress_rule(
        &self,
        group: GroupRef,
        rules: &str,
    ) -> Result<Vec<Node>, LifecycleError> {
        let request = AuthorizeIngress {
            group,
            permissions: parse_rules(rules)?,
        };
        self.call(&request).await
    }

    /// Adds egress rules parsed from `rules` to `group_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidParameter`] for malformed rules, and
    /// propagates request failures.
    pub async fn create_egress_rule(
        &self,
        group_id: &str,
        rules: &str,
    ) -> Result<Vec<Node>, LifecycleError> {
        let request = AuthorizeEgress {
            group_id: group_id.to_owned(),
            permissions: parse_rules(rules)?,
        };
        self.call(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_references_are_nested_under_groups() {
        let rules = parse_rules("protocol=tcp,from-port=80,to-port=80,group-id=sg-9,user-id=111")
            .expect("valid rules");
        let params = AuthorizeEgress {
            group_id: String::from("sg-1"),
            permissions: rules,
        }
        .to_params();
        assert_eq!(params.get("IpPermissions.1.Groups.1.GroupId"), Some("sg-9"));
        assert_eq!(params.get("IpPermissions.1.Groups.1.UserId"), Some("111"));
        assert_eq!(params.get("IpPermissions.1.IpRanges.1.CidrIp"), None);
    }

    #[test]
    fn rules_are_numbered_from_one() {
        let rules = parse_rules("protocol=tcp,from-port=22,to-port=22;protocol=udp,from-port=53")
            .expect("valid rules");
        let params = AuthorizeIngress {
            group: GroupRef::Name(String::from("web")),
            permissions: rules,
        }
        .to_params();
        assert_eq!(params.get("GroupName"), Some("web"));
        assert_eq!(params.get("IpPermissions.2.IpProtocol"), Some("udp"));
        assert_eq!(params.get("IpPermissions.2.ToPort"), None);
    }

    #[test]
    fn protocol_is_required() {
        let err = parse_rules("from-port=22").expect_err("protocol missing");
        assert!(matches!(err, LifecycleError::InvalidParameter(_)));
    }
}
