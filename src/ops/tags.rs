//! Resource tags.

use std::collections::BTreeMap;

use tracing::{info, warn};

use super::{Ec2Client, LifecycleError};
use crate::model::Tag;
use crate::query::{ApiRequest, Params, Transport};
use crate::retry::{Attempt, RetryError, retry};

/// `CreateTags`: adds or overwrites tags on resources.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateTags {
    /// Resources to tag.
    pub resource_ids: Vec<String>,
    /// Tags to write.
    pub tags: BTreeMap<String, String>,
}

impl ApiRequest for CreateTags {
    const ACTION: &'static str = "CreateTags";

    fn write_params(&self, params: &mut Params) {
        params.indexed("ResourceId", self.resource_ids.iter().cloned());
        for (index, (key, value)) in self.tags.iter().enumerate() {
            let mut tag = params.scope("Tag", index + 1);
            tag.set("Key", key.as_str());
            tag.set("Value", value.as_str());
        }
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![(
            "resource_id",
            self.resource_ids.first().map_or("", String::as_str),
        )]
    }
}

/// `DeleteTags`: removes tag keys from resources.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeleteTags {
    /// Resources to untag.
    pub resource_ids: Vec<String>,
    /// Keys to remove.
    pub keys: Vec<String>,
}

impl ApiRequest for DeleteTags {
    const ACTION: &'static str = "DeleteTags";

    fn write_params(&self, params: &mut Params) {
        params.indexed("ResourceId", self.resource_ids.iter().cloned());
        for (index, key) in self.keys.iter().enumerate() {
            params.scope("Tag", index + 1).set("Key", key.as_str());
        }
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            (
                "resource_id",
                self.resource_ids.first().map_or("", String::as_str),
            ),
            ("tags", self.keys.first().map_or("", String::as_str)),
        ]
    }
}

/// `DescribeTags` filtered to one resource.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeTags {
    /// Resource whose tags are listed.
    pub resource_id: String,
}

impl ApiRequest for DescribeTags {
    const ACTION: &'static str = "DescribeTags";
    const RESULT_SET: Option<&'static str> = Some("tagSet");
    const RAW_ROOT: bool = false;

    fn write_params(&self, params: &mut Params) {
        params.filter(1, "resource-id", [self.resource_id.as_str()]);
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("resource_id", self.resource_id.as_str())]
    }
}

fn tags_applied(expected: &BTreeMap<String, String>, actual: &[Tag]) -> bool {
    expected
        .iter()
        .all(|(key, value)| actual.iter().any(|tag| &tag.key == key && &tag.value == value))
}

impl<T: Transport> Ec2Client<T> {
    /// Lists the tags on `resource_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the lookup fails.
    pub async fn get_tags(
        &self,
        resource_id: &str,
        region: Option<&str>,
    ) -> Result<Vec<Tag>, LifecycleError> {
        let request = DescribeTags {
            resource_id: resource_id.to_owned(),
        };
        let records = self.call_in(&request, region).await?;
        Ok(records.iter().filter_map(Tag::from_node).collect())
    }

    /// Writes `tags` to `resource_id` and reads them back until every tag is
    /// visible.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TagVerification`] when the tags never
    /// appear, and propagates transport failures.
    pub async fn set_tags(
        &self,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
        region: Option<&str>,
    ) -> Result<Vec<Tag>, LifecycleError> {
        let request = CreateTags {
            resource_ids: vec![resource_id.to_owned()],
            tags: tags.clone(),
        };
        super::require(&request.required_fields())?;

        let client = self;
        let create = &request;
        let outcome = retry(&self.tag_policy, "set_tags", move || async move {
            match client.call_in(create, region).await {
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => return Ok(Attempt::Pending(err.to_string())),
            }
            let current = match client.get_tags(resource_id, region).await {
                Ok(current) => current,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => return Ok(Attempt::Pending(err.to_string())),
            };
            if tags_applied(&create.tags, &current) {
                Ok(Attempt::Ready(current))
            } else {
                Ok(Attempt::Pending(String::from("tags not yet visible")))
            }
        })
        .await;

        match outcome {
            Ok(current) => {
                info!(resource_id, count = tags.len(), "tags applied");
                Ok(current)
            }
            Err(RetryError::Fatal(err)) => Err(err),
            Err(RetryError::Exhausted { last, .. }) => {
                warn!(resource_id, %last, "tags could not be verified");
                Err(LifecycleError::TagVerification {
                    resource_id: resource_id.to_owned(),
                })
            }
        }
    }

    /// Removes `keys` from `resource_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn del_tags(
        &self,
        resource_id: &str,
        keys: &[String],
        region: Option<&str>,
    ) -> Result<(), LifecycleError> {
        let request = DeleteTags {
            resource_ids: vec![resource_id.to_owned()],
            keys: keys.to_vec(),
        };
        self.call_in(&request, region).await?;
        info!(resource_id, ?keys, "tags removed");
        Ok(())
    }

    /// Renames the instance called `name` by rewriting its `Name` tag.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the instance cannot be found or the
    /// tag cannot be verified.
    pub async fn rename(&self, name: &str, new_name: &str) -> Result<Vec<Tag>, LifecycleError> {
        super::require(&[("newname", new_name)])?;
        let instance = self.find_node(name, None).await?;
        let tags = BTreeMap::from([(String::from("Name"), new_name.to_owned())]);
        self.set_tags(&instance.id, &tags, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        ScriptedTransport, scripted_client as client, xml_describe_tags as describe_tags, xml_ok,
    };

    #[test]
    fn create_tags_numbers_tags_from_one() {
        let request = CreateTags {
            resource_ids: vec![String::from("i-1")],
            tags: BTreeMap::from([
                (String::from("Name"), String::from("web-1")),
                (String::from("role"), String::from("web")),
            ]),
        };
        let params = request.to_params();
        assert_eq!(params.get("ResourceId.1"), Some("i-1"));
        assert_eq!(params.get("Tag.1.Key"), Some("Name"));
        assert_eq!(params.get("Tag.1.Value"), Some("web-1"));
        assert_eq!(params.get("Tag.2.Key"), Some("role"));
    }

    #[tokio::test]
    async fn set_tags_retries_until_visible() {
        let transport = ScriptedTransport::new();
        transport.push_ok(xml_ok("CreateTags"));
        transport.push_ok(describe_tags("i-1", &[]));
        transport.push_ok(xml_ok("CreateTags"));
        transport.push_ok(describe_tags("i-1", &[("Name", "web-1")]));

        let tags = BTreeMap::from([(String::from("Name"), String::from("web-1"))]);
        let applied = client(&transport)
            .set_tags("i-1", &tags, None)
            .await
            .expect("tags verified");

        assert_eq!(applied.len(), 1);
        assert_eq!(transport.count_action("CreateTags"), 2);
        assert_eq!(transport.count_action("DescribeTags"), 2);
    }

    #[tokio::test]
    async fn set_tags_fails_when_never_visible() {
        let transport = ScriptedTransport::new();
        for _ in 0..6 {
            transport.push_ok(xml_ok("CreateTags"));
            transport.push_ok(describe_tags("i-1", &[]));
        }
        let tags = BTreeMap::from([(String::from("Name"), String::from("web-1"))]);
        let err = client(&transport)
            .set_tags("i-1", &tags, None)
            .await
            .expect_err("verification fails");

        assert_eq!(
            err,
            LifecycleError::TagVerification {
                resource_id: String::from("i-1")
            }
        );
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn empty_resource_id_is_rejected_before_sending() {
        let transport = ScriptedTransport::new();
        let err = client(&transport)
            .del_tags("", &[String::from("Name")], None)
            .await
            .expect_err("resource id is required");
        assert!(matches!(err, LifecycleError::MissingField(ref f) if f == "resource_id"));
        assert!(!err.is_fatal());
        assert!(transport.requests().is_empty());
    }
}
