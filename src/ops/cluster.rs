//! Data-warehouse clusters. Every request here is signed with SigV4.

use tracing::info;

use super::{Ec2Client, LifecycleError};
use crate::model::{Cluster, result_members};
use crate::query::{ApiFamily, ApiRequest, Params, Transport};
use crate::xml::Node;

/// `CreateClusterSubnetGroup`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateClusterSubnetGroup {
    /// Subnet group name.
    pub group_name: String,
    /// Description; the group name is used when absent.
    pub description: Option<String>,
    /// Subnet placed in the group.
    pub subnet_id: String,
}

impl ApiRequest for CreateClusterSubnetGroup {
    const ACTION: &'static str = "CreateClusterSubnetGroup";
    const FAMILY: ApiFamily = ApiFamily::DataWarehouse;

    fn write_params(&self, params: &mut Params) {
        params
            .set("ClusterSubnetGroupName", self.group_name.as_str())
            .set(
                "Description",
                self.description.as_deref().unwrap_or(&self.group_name),
            )
            .members("SubnetIds", [self.subnet_id.as_str()]);
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("subnet-id", self.subnet_id.as_str()),
            ("group-name", self.group_name.as_str()),
        ]
    }
}

/// `DescribeClusterSubnetGroups`, optionally paged.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeClusterSubnetGroups {
    /// Restrict to this group.
    pub group_name: Option<String>,
    /// Page size.
    pub max_records: Option<u32>,
    /// Continuation marker from a previous page.
    pub marker: Option<String>,
}

impl ApiRequest for DescribeClusterSubnetGroups {
    const ACTION: &'static str = "DescribeClusterSubnetGroups";
    const FAMILY: ApiFamily = ApiFamily::DataWarehouse;

    fn write_params(&self, params: &mut Params) {
        params
            .set_opt("ClusterSubnetGroupName", self.group_name.as_deref())
            .set_opt("MaxRecords", self.max_records)
            .set_opt("Marker", self.marker.as_deref());
    }
}

/// `CreateCluster`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateCluster {
    /// Cluster identifier.
    pub cluster_name: String,
    /// Master user name.
    pub master_user: String,
    /// Master user password.
    pub master_pass: String,
    /// Node type, for example `dw.hs1.xlarge`.
    pub node_type: String,
    /// Parameter group applied to the cluster.
    pub paramgroup_name: String,
    /// Subnet group to launch into.
    pub subnetgroup_name: Option<String>,
    /// `single-node` or `multi-node`.
    pub cluster_type: Option<String>,
    /// Whether the cluster is reachable from outside its VPC.
    pub public_access: Option<bool>,
    /// Whether data is encrypted at rest.
    pub encrypted: Option<bool>,
    /// Node count for multi-node clusters.
    pub number_of_nodes: Option<u32>,
    /// One VPC security group.
    pub vpc_security_group: Option<String>,
}

impl ApiRequest for CreateCluster {
    const ACTION: &'static str = "CreateCluster";
    const FAMILY: ApiFamily = ApiFamily::DataWarehouse;

    fn write_params(&self, params: &mut Params) {
        params
            .set("ClusterIdentifier", self.cluster_name.as_str())
            .set("MasterUsername", self.master_user.as_str())
            .set("MasterUserPassword", self.master_pass.as_str())
            .set("NodeType", self.node_type.as_str())
            .set("ClusterParameterGroupName", self.paramgroup_name.as_str())
            .set_opt("ClusterSubnetGroupName", self.subnetgroup_name.as_deref())
            .set_opt("ClusterType", self.cluster_type.as_deref())
            .set_opt("PubliclyAccessible", self.public_access)
            .set_opt("Encrypted", self.encrypted)
            .set_opt("NumberOfNodes", self.number_of_nodes)
            .members("VpcSecurityGroupIds", self.vpc_security_group.iter().cloned());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("cluster-name", self.cluster_name.as_str()),
            ("master-user", self.master_user.as_str()),
            ("master-pass", self.master_pass.as_str()),
            ("node-type", self.node_type.as_str()),
            ("paramgroup-name", self.paramgroup_name.as_str()),
        ]
    }
}

/// `DescribeClusters` for one cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeClusters {
    /// Cluster identifier.
    pub cluster_name: String,
}

impl ApiRequest for DescribeClusters {
    const ACTION: &'static str = "DescribeClusters";
    const FAMILY: ApiFamily = ApiFamily::DataWarehouse;

    fn write_params(&self, params: &mut Params) {
        params.set("ClusterIdentifier", self.cluster_name.as_str());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("cluster-name", self.cluster_name.as_str())]
    }
}

/// `EnableLogging`: ships audit logs to a bucket.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EnableLogging {
    /// Cluster identifier.
    pub cluster_name: String,
    /// Destination bucket.
    pub bucket_name: String,
    /// Key prefix inside the bucket.
    pub s3_key_prefix: String,
}

impl ApiRequest for EnableLogging {
    const ACTION: &'static str = "EnableLogging";
    const FAMILY: ApiFamily = ApiFamily::DataWarehouse;

    fn write_params(&self, params: &mut Params) {
        params
            .set("ClusterIdentifier", self.cluster_name.as_str())
            .set("BucketName", self.bucket_name.as_str())
            .set("S3KeyPrefix", self.s3_key_prefix.as_str());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("cluster-name", self.cluster_name.as_str()),
            ("bucket-name", self.bucket_name.as_str()),
            ("s3-key-prefix", self.s3_key_prefix.as_str()),
        ]
    }
}

impl<T: Transport> Ec2Client<T> {
    /// Creates a cluster subnet group.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is empty or the request
    /// fails.
    pub async fn create_cluster_subnet_group(
        &self,
        request: &CreateClusterSubnetGroup,
    ) -> Result<Vec<Node>, LifecycleError> {
        let records = self.call(request).await?;
        info!(group = %request.group_name, "cluster subnet group created");
        Ok(records)
    }

    /// Describes cluster subnet groups, one node per group.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn describe_cluster_subnet_groups(
        &self,
        request: &DescribeClusterSubnetGroups,
    ) -> Result<Vec<Node>, LifecycleError> {
        let records = self.call(request).await?;
        Ok(
            result_members(&records, &["ClusterSubnetGroups", "ClusterSubnetGroup"])
                .into_iter()
                .cloned()
                .collect(),
        )
    }

    /// Creates a cluster.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::MissingField`] naming every absent required
    /// field, and propagates request failures.
    pub async fn create_cluster(&self, request: &CreateCluster) -> Result<Vec<Node>, LifecycleError> {
        let records = self.call(request).await?;
        info!(cluster = %request.cluster_name, "cluster creation requested");
        Ok(records)
    }

    /// Describes one cluster.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the name is empty or the request
    /// fails.
    pub async fn describe_cluster(&self, cluster_name: &str) -> Result<Option<Cluster>, LifecycleError> {
        let records = self
            .call(&DescribeClusters {
                cluster_name: cluster_name.to_owned(),
            })
            .await?;
        Ok(result_members(&records, &["Clusters", "Cluster"])
            .into_iter()
            .find_map(Cluster::from_node))
    }

    /// Enables audit logging for a cluster.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is empty or the request
    /// fails.
    pub async fn enable_logging(&self, request: &EnableLogging) -> Result<Vec<Node>, LifecycleError> {
        self.call(request).await
    }
}
