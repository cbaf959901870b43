//! Configuration loading via `ortho-config`.
//!
//! [`ProviderConfig`] carries credentials and endpoint settings shared by
//! every call. It is loaded once and passed by reference; nothing mutates it
//! afterwards.

use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::profile::{SshInterface, VmProfile};
use crate::query::ApiFamily;

/// Default base domain for provider endpoints.
pub const DEFAULT_SERVICE_URL: &str = "amazonaws.com";
/// Region used when none is configured.
pub const DEFAULT_LOCATION: &str = "us-east-1";

/// Provider credentials and endpoint settings derived from environment
/// variables, configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "EC2",
    discovery(
        app_name = "cirrus",
        env_var = "CIRRUS_CONFIG_PATH",
        config_file_name = "cirrus.toml",
        dotfile_name = ".cirrus.toml",
        project_file_name = "cirrus.toml"
    )
)]
pub struct ProviderConfig {
    /// Access key identifier.
    pub id: String,
    /// Secret access key used for signing.
    pub key: String,
    /// Name of the key pair injected into new instances.
    pub keyname: String,
    /// Default security group name for new instances.
    pub securitygroup: Option<String>,
    /// Path to the private key matching `keyname`.
    pub private_key: String,
    /// Base domain appended to `{service}.{region}.`.
    #[ortho_config(default = DEFAULT_SERVICE_URL.to_owned())]
    pub service_url: String,
    /// Explicit host for compute calls.
    pub endpoint: Option<String>,
    /// Explicit host for load-balancer calls.
    pub elb_endpoint: Option<String>,
    /// Explicit host for data-warehouse calls.
    pub redshift_endpoint: Option<String>,
    /// Explicit host for identity calls.
    pub iam_endpoint: Option<String>,
    /// Default region.
    #[ortho_config(default = DEFAULT_LOCATION.to_owned())]
    pub location: String,
    /// Rename instances to `{name}-DEL{uuid}` before terminating them.
    #[ortho_config(default = false)]
    pub rename_on_destroy: bool,
    /// Which address deployment connects to: `public_ips` or `private_ips`.
    #[ortho_config(default = "public_ips".to_owned())]
    pub ssh_interface: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl ProviderConfig {
    /// Builds a configuration from credentials, leaving every other setting
    /// at its default.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        key: impl Into<String>,
        keyname: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            keyname: keyname.into(),
            securitygroup: None,
            private_key: private_key.into(),
            service_url: DEFAULT_SERVICE_URL.to_owned(),
            endpoint: None,
            elb_endpoint: None,
            redshift_endpoint: None,
            iam_endpoint: None,
            location: DEFAULT_LOCATION.to_owned(),
            rename_on_destroy: false,
            ssh_interface: String::from("public_ips"),
        }
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to cirrus.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration, merging defaults, configuration files,
    /// environment variables, and CLI flags in that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("cirrus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the environment variable
    /// and configuration key for the first empty required field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.id,
            &FieldMetadata::new("access key id", "EC2_ID", "id"),
        )?;
        Self::require_field(
            &self.key,
            &FieldMetadata::new("secret access key", "EC2_KEY", "key"),
        )?;
        Self::require_field(
            &self.keyname,
            &FieldMetadata::new("key pair name", "EC2_KEYNAME", "keyname"),
        )?;
        Self::require_field(
            &self.private_key,
            &FieldMetadata::new("private key path", "EC2_PRIVATE_KEY", "private_key"),
        )?;
        Ok(())
    }

    /// Parsed [`SshInterface`]; unknown values fall back to public
    /// addresses.
    #[must_use]
    pub fn ssh_interface(&self) -> SshInterface {
        self.ssh_interface.parse().unwrap_or_default()
    }

    /// Host serving `family` in `region`, honouring explicit overrides.
    #[must_use]
    pub fn endpoint_for(&self, family: ApiFamily, region: &str) -> String {
        let explicit = match family {
            ApiFamily::Compute => self.endpoint.as_deref(),
            ApiFamily::LoadBalancer => self.elb_endpoint.as_deref(),
            ApiFamily::DataWarehouse => self.redshift_endpoint.as_deref(),
            ApiFamily::Identity => self.iam_endpoint.as_deref(),
        };
        if let Some(host) = explicit.filter(|host| !host.trim().is_empty()) {
            return host.to_owned();
        }
        if let Some(host) = family.fixed_host() {
            return host.to_owned();
        }
        format!("{}.{region}.{}", family.subdomain(), self.service_url)
    }

    /// Provider-level settings expressed as a profile, used as the lowest
    /// precedence layer when merging VM profiles.
    #[must_use]
    pub fn as_profile(&self) -> VmProfile {
        VmProfile {
            location: Some(self.location.clone()),
            keyname: Some(self.keyname.clone()),
            securitygroup: self.securitygroup.iter().cloned().collect(),
            private_key: Some(self.private_key.clone()),
            ssh_interface: Some(self.ssh_interface()),
            ..VmProfile::default()
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// A profile file could not be read or decoded.
    #[error("failed to load profile {path}: {message}")]
    Profile {
        /// Profile path as supplied.
        path: String,
        /// Underlying failure.
        message: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig::new("AKID", "secret", "deploy", "/keys/deploy.pem")
    }

    #[rstest]
    #[case(ApiFamily::Compute, "ec2.eu-west-1.amazonaws.com")]
    #[case(ApiFamily::LoadBalancer, "elasticloadbalancing.eu-west-1.amazonaws.com")]
    #[case(ApiFamily::DataWarehouse, "redshift.eu-west-1.amazonaws.com")]
    #[case(ApiFamily::Identity, "iam.amazonaws.com")]
    fn endpoints_follow_family_and_region(#[case] family: ApiFamily, #[case] host: &str) {
        assert_eq!(config().endpoint_for(family, "eu-west-1"), host);
    }

    #[test]
    fn explicit_endpoint_overrides_derived_host() {
        let cfg = ProviderConfig {
            endpoint: Some(String::from("ec2.internal.example")),
            ..config()
        };
        assert_eq!(
            cfg.endpoint_for(ApiFamily::Compute, "us-east-1"),
            "ec2.internal.example"
        );
        assert_eq!(
            cfg.endpoint_for(ApiFamily::LoadBalancer, "us-east-1"),
            "elasticloadbalancing.us-east-1.amazonaws.com"
        );
    }

    #[test]
    fn service_url_changes_derived_hosts() {
        let cfg = ProviderConfig {
            service_url: String::from("amazonaws.com.cn"),
            ..config()
        };
        assert_eq!(
            cfg.endpoint_for(ApiFamily::Compute, "cn-north-1"),
            "ec2.cn-north-1.amazonaws.com.cn"
        );
    }

    #[rstest]
    #[case("id", "EC2_ID")]
    #[case("key", "EC2_KEY")]
    #[case("keyname", "EC2_KEYNAME")]
    #[case("private_key", "EC2_PRIVATE_KEY")]
    fn validation_names_env_var_for_missing_field(#[case] field: &str, #[case] env_var: &str) {
        let mut cfg = config();
        match field {
            "id" => cfg.id.clear(),
            "key" => cfg.key.clear(),
            "keyname" => cfg.keyname.clear(),
            _ => cfg.private_key.clear(),
        }
        let err = cfg.validate().expect_err("field is required");
        let ConfigError::MissingField(message) = err else {
            panic!("expected MissingField, got {err:?}");
        };
        assert!(message.contains(env_var), "message: {message}");
        assert!(message.contains(field), "message: {message}");
    }

    #[test]
    fn provider_profile_carries_key_material() {
        let profile = config().as_profile();
        assert_eq!(profile.keyname.as_deref(), Some("deploy"));
        assert_eq!(profile.private_key.as_deref(), Some("/keys/deploy.pem"));
        assert_eq!(profile.location.as_deref(), Some("us-east-1"));
    }
}
