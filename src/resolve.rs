//! Name-to-id resolution for VPC-scoped resources.
//!
//! Operators name subnets and security groups; the provider only accepts
//! ids. Within a VPC the convention is that a resource called `web` carries
//! the name `{vpc name}-web`, where the VPC name is its `Name` tag. Lookups
//! are performed on every call and never cached.

use tracing::{debug, warn};

use crate::ops::{Ec2Client, LifecycleError, ResourceKind, require};
use crate::query::Transport;

/// Prefix of security group ids.
pub const SECURITY_GROUP_PREFIX: &str = "sg-";
/// Prefix of subnet ids.
pub const SUBNET_PREFIX: &str = "subnet-";

fn scoped_name(vpc_name: &str, name: &str) -> String {
    format!("{vpc_name}-{name}")
}

fn first_match(
    ids: Vec<String>,
    kind: ResourceKind,
    name: &str,
    vpc_id: &str,
) -> Result<String, LifecycleError> {
    if ids.len() > 1 {
        warn!(%kind, name, vpc_id, matches = ids.len(), "name is ambiguous; using the first match");
    }
    ids.into_iter().next().ok_or_else(|| LifecycleError::NotFound {
        kind,
        name: name.to_owned(),
        vpc_id: Some(vpc_id.to_owned()),
    })
}

impl<T: Transport> Ec2Client<T> {
    /// The `Name` tag of `vpc_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when the VPC is unknown or
    /// untagged.
    pub async fn vpc_name(&self, vpc_id: &str) -> Result<String, LifecycleError> {
        let vpc = self.describe_vpc(vpc_id).await?;
        vpc.as_ref()
            .and_then(|found| found.name())
            .map(str::to_owned)
            .ok_or_else(|| LifecycleError::NotFound {
                kind: ResourceKind::Vpc,
                name: vpc_id.to_owned(),
                vpc_id: None,
            })
    }

    /// Resolves the security group called `name` in `vpc_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when no group matches.
    pub async fn resolve_security_group(
        &self,
        name: &str,
        vpc_id: &str,
    ) -> Result<String, LifecycleError> {
        let vpc_name = self.vpc_name(vpc_id).await?;
        let group_name = scoped_name(&vpc_name, name);
        debug!(vpc_id, %group_name, "resolving security group");
        let groups = self.describe_sg(vpc_id, &group_name).await?;
        first_match(
            groups.into_iter().map(|group| group.id).collect(),
            ResourceKind::SecurityGroup,
            &group_name,
            vpc_id,
        )
    }

    /// Resolves the subnet called `name` in `vpc_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when no subnet matches.
    pub async fn resolve_subnet(&self, name: &str, vpc_id: &str) -> Result<String, LifecycleError> {
        let vpc_name = self.vpc_name(vpc_id).await?;
        let subnet_name = scoped_name(&vpc_name, name);
        debug!(vpc_id, %subnet_name, "resolving subnet");
        let subnets = self.describe_subnet(vpc_id, &subnet_name).await?;
        first_match(
            subnets.into_iter().map(|subnet| subnet.id).collect(),
            ResourceKind::Subnet,
            &subnet_name,
            vpc_id,
        )
    }

    /// Returns `value` when it already is a group id, otherwise resolves it
    /// as a name within `vpc_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::MissingField`] when a name is given without
    /// a VPC, and [`LifecycleError::NotFound`] when resolution fails.
    pub async fn security_group_id(
        &self,
        value: &str,
        vpc_id: Option<&str>,
    ) -> Result<String, LifecycleError> {
        if value.starts_with(SECURITY_GROUP_PREFIX) {
            return Ok(value.to_owned());
        }
        let vpc = vpc_id.unwrap_or_default();
        require(&[("vpc_id", vpc)])?;
        self.resolve_security_group(value, vpc).await
    }

    /// Returns `value` when it already is a subnet id, otherwise resolves it
    /// as a name within `vpc_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::MissingField`] when a name is given without
    /// a VPC, and [`LifecycleError::NotFound`] when resolution fails.
    pub async fn subnet_id(
        &self,
        value: &str,
        vpc_id: Option<&str>,
    ) -> Result<String, LifecycleError> {
        if value.starts_with(SUBNET_PREFIX) {
            return Ok(value.to_owned());
        }
        let vpc = vpc_id.unwrap_or_default();
        require(&[("vpc_id", vpc)])?;
        self.resolve_subnet(value, vpc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedTransport, scripted_client};

    const VPC: &str = "<DescribeVpcsResponse><requestId>req</requestId><vpcSet><item>\
        <vpcId>vpc-1</vpcId><tagSet><item><key>env</key><value>x</value></item>\
        <item><key>Name</key><value>prod</value></item></tagSet></item></vpcSet>\
        </DescribeVpcsResponse>";

    #[tokio::test]
    async fn ids_pass_through_without_requests() {
        let transport = ScriptedTransport::new();
        let client = scripted_client(&transport);
        let group = client
            .security_group_id("sg-123", None)
            .await
            .expect("id passes through");
        let subnet = client
            .subnet_id("subnet-9", None)
            .await
            .expect("id passes through");
        assert_eq!((group.as_str(), subnet.as_str()), ("sg-123", "subnet-9"));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn subnet_name_is_scoped_by_vpc_name() {
        let transport = ScriptedTransport::new();
        transport.push_ok(VPC);
        transport.push_ok(
            "<DescribeSubnetsResponse><requestId>req</requestId><subnetSet><item>\
             <subnetId>subnet-7</subnetId><vpcId>vpc-1</vpcId></item></subnetSet>\
             </DescribeSubnetsResponse>",
        );
        let subnet = scripted_client(&transport)
            .subnet_id("private", Some("vpc-1"))
            .await
            .expect("subnet resolved");
        assert_eq!(subnet, "subnet-7");

        let params = transport.request_params();
        let lookup = params.get(1).expect("subnet lookup sent");
        assert_eq!(lookup.get("Filter.2.Name").map(String::as_str), Some("tag:Name"));
        assert_eq!(
            lookup.get("Filter.2.Value.1").map(String::as_str),
            Some("prod-private")
        );
    }

    #[tokio::test]
    async fn names_require_a_vpc() {
        let transport = ScriptedTransport::new();
        let err = scripted_client(&transport)
            .security_group_id("web", None)
            .await
            .expect_err("vpc needed");
        assert_eq!(err, LifecycleError::MissingField(String::from("vpc_id")));
    }
}
