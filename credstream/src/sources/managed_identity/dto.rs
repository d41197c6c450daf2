//! DTOs for the instance metadata service token endpoint

use serde::{Deserialize, Deserializer, Serialize};

use super::{ManagedIdentity, UserAssignedId};
use crate::{AccessTokenRef, ClientIdRef, ObjectIdRef, ResourceIdRef, ResourceRef};

/// The instance metadata service token endpoint
pub const DEFAULT_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// The instance metadata service API version requested
pub const API_VERSION: &str = "2018-02-01";

#[derive(Debug, Serialize)]
pub(super) struct TokenQuery<'a> {
    #[serde(rename = "api-version")]
    pub api_version: &'static str,
    pub resource: &'a ResourceRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<&'a ClientIdRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<&'a ObjectIdRef>,
    #[serde(rename = "msi_res_id", skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<&'a ResourceIdRef>,
}

impl<'a> TokenQuery<'a> {
    pub fn new(resource: &'a ResourceRef, identity: &'a ManagedIdentity) -> Self {
        let mut query = Self {
            api_version: API_VERSION,
            resource,
            client_id: None,
            object_id: None,
            resource_id: None,
        };

        match identity {
            ManagedIdentity::SystemAssigned => {}
            ManagedIdentity::UserAssigned(UserAssignedId::ClientId(id)) => {
                query.client_id = Some(&**id)
            }
            ManagedIdentity::UserAssigned(UserAssignedId::ObjectId(id)) => {
                query.object_id = Some(&**id)
            }
            ManagedIdentity::UserAssigned(UserAssignedId::ResourceId(id)) => {
                query.resource_id = Some(&**id)
            }
        }

        query
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse<'a> {
    #[serde(borrow)]
    pub access_token: &'a AccessTokenRef,
    #[serde(deserialize_with = "seconds")]
    pub expires_in: u64,
    #[serde(borrow, default)]
    pub token_type: Option<&'a str>,
}

/// The service reports durations as strings; other hosts use numbers
#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
    Number(u64),
    Text(String),
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Seconds::deserialize(deserializer)? {
        Seconds::Number(n) => Ok(n),
        Seconds::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use serde_json::json;

    use super::*;
    use crate::{ClientId, ObjectId, Resource, ResourceId};

    const RESOURCE: &str = "https://redis.azure.com";

    #[test]
    fn system_assigned_query_selects_no_identity() -> Result<()> {
        let resource = Resource::from_static(RESOURCE);
        let identity = ManagedIdentity::SystemAssigned;

        let query = serde_json::to_value(TokenQuery::new(&resource, &identity))?;
        assert_eq!(
            query,
            json!({ "api-version": API_VERSION, "resource": RESOURCE })
        );
        Ok(())
    }

    #[test]
    fn user_assigned_query_carries_exactly_one_selector() -> Result<()> {
        let resource = Resource::from_static(RESOURCE);
        let cases = [
            (
                ManagedIdentity::UserAssigned(UserAssignedId::ClientId(ClientId::from_static(
                    "client",
                ))),
                "client_id",
                "client",
            ),
            (
                ManagedIdentity::UserAssigned(UserAssignedId::ObjectId(ObjectId::from_static(
                    "object",
                ))),
                "object_id",
                "object",
            ),
            (
                ManagedIdentity::UserAssigned(UserAssignedId::ResourceId(
                    ResourceId::from_static("/subscriptions/s/resourceGroups/g"),
                )),
                "msi_res_id",
                "/subscriptions/s/resourceGroups/g",
            ),
        ];

        for (identity, key, value) in &cases {
            let query = serde_json::to_value(TokenQuery::new(&resource, identity))?;
            let fields = query.as_object().map(|o| o.len()).unwrap_or_default();
            assert_eq!(fields, 3, "{:?}", query);
            assert_eq!(query[*key], json!(value));
        }
        Ok(())
    }

    #[test]
    fn parses_string_and_numeric_lifetimes() -> Result<()> {
        let body = r#"{"access_token":"abc","expires_in":"86399","expires_on":"1700000000","resource":"https://redis.azure.com","token_type":"Bearer"}"#;
        let resp: TokenResponse = serde_json::from_str(body)?;
        assert_eq!(resp.access_token.as_str(), "abc");
        assert_eq!(resp.expires_in, 86399);
        assert_eq!(resp.token_type, Some("Bearer"));

        let resp: TokenResponse = serde_json::from_str(r#"{"access_token":"abc","expires_in":60}"#)?;
        assert_eq!(resp.expires_in, 60);
        assert_eq!(resp.token_type, None);
        Ok(())
    }

    #[test]
    fn rejects_unparseable_lifetimes() {
        let body = r#"{"access_token":"abc","expires_in":"soon"}"#;
        assert!(serde_json::from_str::<TokenResponse>(body).is_err());
    }
}
