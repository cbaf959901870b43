//! Flattening of structured request inputs into query parameters.
//!
//! The query API has no nested documents; lists and nested records are
//! spelled as dotted keys (`SecurityGroupId.1`, `Listeners.member.2.LoadBalancerPort`,
//! `IpPermissions.1.IpRanges.1.CidrIp`). Every request builds its parameters
//! through [`Params`] and [`ParamScope`] so the numbering rules live in one
//! place.

use std::collections::BTreeMap;

/// Flat parameter set sent as the query string.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    /// Starts a parameter set for `action`.
    #[must_use]
    pub fn action(action: &str) -> Self {
        let mut params = Self::default();
        params.set("Action", action);
        params
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Sets `key` when `value` is present.
    pub fn set_opt<V: ToString>(&mut self, key: &str, value: Option<V>) -> &mut Self {
        if let Some(present) = value {
            self.set(key, present.to_string());
        }
        self
    }

    /// Writes `values` as `prefix.1`, `prefix.2`, ...
    pub fn indexed<I, V>(&mut self, prefix: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        for (index, value) in values.into_iter().enumerate() {
            self.set(format!("{prefix}.{}", index + 1), value);
        }
        self
    }

    /// Writes `values` as `prefix.member.1`, `prefix.member.2`, ...
    pub fn members<I, V>(&mut self, prefix: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.indexed(&format!("{prefix}.member"), values)
    }

    /// Opens the nested scope `prefix.index`.
    pub fn scope(&mut self, prefix: &str, index: usize) -> ParamScope<'_> {
        ParamScope {
            prefix: format!("{prefix}.{index}"),
            params: self,
        }
    }

    /// Writes a `Filter.N.Name` / `Filter.N.Value.M` filter.
    pub fn filter<I, V>(&mut self, index: usize, name: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let mut scope = self.scope("Filter", index);
        scope.set("Name", name);
        scope.indexed("Value", values);
        self
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Borrows the underlying sorted map.
    #[must_use]
    pub const fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Consumes the set, returning the sorted map.
    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }
}

/// A view of [`Params`] that prefixes every key with `Parent.N.`.
#[derive(Debug)]
pub struct ParamScope<'a> {
    params: &'a mut Params,
    prefix: String,
}

impl ParamScope<'_> {
    fn key(&self, field: &str) -> String {
        format!("{}.{field}", self.prefix)
    }

    /// Sets `prefix.field` to `value`.
    pub fn set(&mut self, field: &str, value: impl Into<String>) -> &mut Self {
        let key = self.key(field);
        self.params.set(key, value);
        self
    }

    /// Sets `prefix.field` when `value` is present.
    pub fn set_opt<V: ToString>(&mut self, field: &str, value: Option<V>) -> &mut Self {
        let key = self.key(field);
        self.params.set_opt(&key, value);
        self
    }

    /// Writes `values` as `prefix.field.1`, `prefix.field.2`, ...
    pub fn indexed<I, V>(&mut self, field: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let key = self.key(field);
        self.params.indexed(&key, values);
        self
    }

    /// Opens the nested scope `prefix.field.index`.
    pub fn scope(&mut self, field: &str, index: usize) -> ParamScope<'_> {
        ParamScope {
            prefix: format!("{}.{field}.{index}", self.prefix),
            params: &mut *self.params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_lists_are_one_based() {
        let mut params = Params::action("RunInstances");
        params.indexed("SecurityGroupId", ["sg-1", "sg-2"]);
        assert_eq!(params.get("SecurityGroupId.1"), Some("sg-1"));
        assert_eq!(params.get("SecurityGroupId.2"), Some("sg-2"));
        assert_eq!(params.get("SecurityGroupId.0"), None);
    }

    #[test]
    fn member_lists_use_member_infix() {
        let mut params = Params::action("CreateLoadBalancer");
        params.members("AvailabilityZones", ["us-east-1a"]);
        assert_eq!(
            params.get("AvailabilityZones.member.1"),
            Some("us-east-1a")
        );
    }

    #[test]
    fn nested_scopes_compose_prefixes() {
        let mut params = Params::action("AuthorizeSecurityGroupIngress");
        {
            let mut permission = params.scope("IpPermissions", 1);
            permission.set("IpProtocol", "tcp");
            permission.scope("IpRanges", 1).set("CidrIp", "0.0.0.0/0");
        }
        assert_eq!(params.get("IpPermissions.1.IpProtocol"), Some("tcp"));
        assert_eq!(
            params.get("IpPermissions.1.IpRanges.1.CidrIp"),
            Some("0.0.0.0/0")
        );
    }

    #[test]
    fn filters_number_names_and_values() {
        let mut params = Params::action("DescribeSubnets");
        params.filter(1, "vpc-id", ["vpc-1"]);
        params.filter(2, "tag:Name", ["prod-web"]);
        assert_eq!(params.get("Filter.1.Name"), Some("vpc-id"));
        assert_eq!(params.get("Filter.1.Value.1"), Some("vpc-1"));
        assert_eq!(params.get("Filter.2.Value.1"), Some("prod-web"));
    }

    #[test]
    fn absent_optionals_are_omitted() {
        let mut params = Params::action("CreateVolume");
        params.set_opt("Iops", None::<u32>);
        params.set_opt("Size", Some(10));
        assert_eq!(params.get("Iops"), None);
        assert_eq!(params.get("Size"), Some("10"));
    }
}
