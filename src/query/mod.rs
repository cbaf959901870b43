//! Signed query dispatch.
//!
//! [`QueryClient`] turns a [`Query`] into a signed URL for the right API
//! family and region, fetches it through a [`Transport`] and decodes the
//! reply into a sequence of records. Provider error replies are values
//! ([`Reply::Error`]), not Rust errors; only failures to obtain or decode a
//! reply surface as [`QueryError`].

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::signer::{self, Credentials, SignError, SignedRequest};
use crate::xml::{self, Element, Node, XmlError};

mod params;
mod transport;

#[cfg(test)]
mod tests;

pub use params::{ParamScope, Params};
pub use transport::{HttpReply, ReqwestTransport, Transport, TransportFuture};

/// Which signing scheme an API family uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureVersion {
    /// HMAC-SHA256 over the canonical query, base64 encoded.
    Legacy,
    /// Presigned SigV4.
    V4,
}

/// The API families the client talks to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApiFamily {
    /// Instances, volumes, networking.
    Compute,
    /// Classic load balancers.
    LoadBalancer,
    /// Data-warehouse clusters.
    DataWarehouse,
    /// Identity and server certificates.
    Identity,
}

impl ApiFamily {
    /// Service label used in derived hostnames and SigV4 scopes.
    #[must_use]
    pub const fn subdomain(self) -> &'static str {
        match self {
            Self::Compute => "ec2",
            Self::LoadBalancer => "elasticloadbalancing",
            Self::DataWarehouse => "redshift",
            Self::Identity => "iam",
        }
    }

    /// API version sent as `Version`.
    #[must_use]
    pub const fn version(self) -> &'static str {
        match self {
            Self::Compute => "2014-10-01",
            Self::LoadBalancer => "2012-06-01",
            Self::DataWarehouse => "2012-12-01",
            Self::Identity => "2010-05-08",
        }
    }

    /// Signing scheme for the family.
    #[must_use]
    pub const fn signature_version(self) -> SignatureVersion {
        match self {
            Self::DataWarehouse => SignatureVersion::V4,
            Self::Compute | Self::LoadBalancer | Self::Identity => SignatureVersion::Legacy,
        }
    }

    /// Region-independent host, for global services.
    #[must_use]
    pub const fn fixed_host(self) -> Option<&'static str> {
        match self {
            Self::Identity => Some("iam.amazonaws.com"),
            Self::Compute | Self::LoadBalancer | Self::DataWarehouse => None,
        }
    }
}

/// Errors that prevent a reply from being obtained or understood.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum QueryError {
    /// The request could not be sent or the body could not be read.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The reply body was not valid XML.
    #[error("could not decode provider reply: {0}")]
    Decode(#[from] XmlError),
    /// The request could not be signed.
    #[error("could not sign request: {0}")]
    Sign(#[from] SignError),
}

/// A provider-reported failure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorResponse {
    /// HTTP status code of the reply.
    pub status: u16,
    /// Provider error code, for example `InvalidInstanceID.NotFound`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// The undecoded body.
    pub body: String,
}

impl ErrorResponse {
    /// Extracts the error code and message from a reply body.
    ///
    /// Bodies that are not XML keep their raw text as the message.
    #[must_use]
    pub fn from_body(status: u16, body: &str) -> Self {
        let decoded = xml::parse(body).ok().map(|root| xml::decode(&root));
        let find = |key: &str| {
            decoded
                .as_ref()
                .and_then(|node| node.find_text(key))
                .map(str::to_owned)
        };
        Self {
            status,
            code: find("Code").unwrap_or_else(|| String::from("Unknown")),
            message: find("Message").unwrap_or_else(|| body.trim().to_owned()),
            body: body.to_owned(),
        }
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (HTTP {}): {}", self.code, self.status, self.message)
    }
}

/// Decoded reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    /// Records of the selected collection, in document order.
    Records(Vec<Node>),
    /// The provider rejected the request.
    Error(ErrorResponse),
}

impl Reply {
    /// Converts the reply into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the [`ErrorResponse`] for error replies.
    pub fn into_result(self) -> Result<Vec<Node>, ErrorResponse> {
        match self {
            Self::Records(records) => Ok(records),
            Self::Error(error) => Err(error),
        }
    }
}

/// The outcome of one dispatch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueryResponse {
    /// The URL that was fetched.
    pub request_url: String,
    /// Decoded reply.
    pub reply: Reply,
}

/// One request to dispatch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Query {
    params: Params,
    family: ApiFamily,
    result_set: Option<String>,
    raw_root: bool,
    region: Option<String>,
    request_url: Option<String>,
}

impl Query {
    /// Creates a compute query for `params`.
    #[must_use]
    pub const fn new(params: Params) -> Self {
        Self {
            params,
            family: ApiFamily::Compute,
            result_set: None,
            raw_root: false,
            region: None,
            request_url: None,
        }
    }

    /// Targets another API family.
    #[must_use]
    pub fn family(mut self, family: ApiFamily) -> Self {
        self.family = family;
        self
    }

    /// Selects the child of the root named `name` as the record collection.
    #[must_use]
    pub fn result_set(mut self, name: impl Into<String>) -> Self {
        self.result_set = Some(name.into());
        self
    }

    /// Uses the root's children as the record collection instead of the
    /// root's second child.
    #[must_use]
    pub fn raw_root(mut self) -> Self {
        self.raw_root = true;
        self
    }

    /// Sends the request to `region` instead of the configured location.
    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Fetches `url` verbatim, skipping signing.
    #[must_use]
    pub fn request_url(mut self, url: impl Into<String>) -> Self {
        self.request_url = Some(url.into());
        self
    }

    /// Borrows the parameter set.
    #[must_use]
    pub const fn params(&self) -> &Params {
        &self.params
    }
}

/// A typed request for one API action.
pub trait ApiRequest {
    /// Value of the `Action` parameter.
    const ACTION: &'static str;
    /// Family the action belongs to.
    const FAMILY: ApiFamily = ApiFamily::Compute;
    /// Child of the root holding the records, if any.
    const RESULT_SET: Option<&'static str> = None;
    /// Whether records are the root's children.
    const RAW_ROOT: bool = true;

    /// Writes the action's parameters.
    fn write_params(&self, params: &mut Params);

    /// Named fields that must be non-empty before the request is sent.
    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        Vec::new()
    }

    /// Full parameter set including `Action`.
    fn to_params(&self) -> Params {
        let mut params = Params::action(Self::ACTION);
        self.write_params(&mut params);
        params
    }

    /// The query for this request.
    fn to_query(&self) -> Query {
        let mut query = Query::new(self.to_params()).family(Self::FAMILY);
        if let Some(name) = Self::RESULT_SET {
            query = query.result_set(name);
        }
        if Self::RAW_ROOT {
            query = query.raw_root();
        }
        query
    }
}

/// Dispatches signed queries through a [`Transport`].
#[derive(Debug)]
pub struct QueryClient<T = ReqwestTransport> {
    config: ProviderConfig,
    transport: T,
    clock: fn() -> DateTime<Utc>,
}

impl QueryClient<ReqwestTransport> {
    /// Creates a client using the shared HTTP client.
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self::with_transport(config, ReqwestTransport)
    }
}

impl<T: Transport> QueryClient<T> {
    /// Creates a client using `transport`.
    #[must_use]
    pub fn with_transport(config: ProviderConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            clock: Utc::now,
        }
    }

    /// Replaces the clock used for request timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Shared configuration.
    #[must_use]
    pub const fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// The transport requests are sent through.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Signs `query` without sending it.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Sign`] if signing fails.
    pub fn sign(&self, query: &Query) -> Result<SignedRequest, QueryError> {
        let region = query.region.as_deref().unwrap_or(&self.config.location);
        let host = self.config.endpoint_for(query.family, region);
        let mut params = query.params.clone().into_map();
        params.insert(String::from("Version"), query.family.version().to_owned());

        let credentials = Credentials {
            access_key_id: &self.config.id,
            secret_key: &self.config.key,
        };
        let timestamp = (self.clock)();
        let signed = match query.family.signature_version() {
            SignatureVersion::Legacy => {
                signer::presign_legacy(credentials, &host, params, timestamp)?
            }
            SignatureVersion::V4 => signer::presign_v4(
                credentials,
                &host,
                region,
                query.family.subdomain(),
                params,
                timestamp,
            )?,
        };
        Ok(signed)
    }

    /// Dispatches `query` and decodes the reply.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] when signing fails, the transport fails, or a
    /// successful reply is not valid XML. Provider error replies are returned
    /// as [`Reply::Error`].
    pub async fn query(&self, query: Query) -> Result<QueryResponse, QueryError> {
        let url = match query.request_url.clone() {
            Some(url) => url,
            None => self.sign(&query)?.url,
        };
        let action = query.params.get("Action").unwrap_or_default();
        debug!(action, family = ?query.family, "dispatching query");

        let reply = self.transport.get(&url).await?;
        if !reply.is_success() {
            let error = ErrorResponse::from_body(reply.status, &reply.body);
            warn!(action, status = error.status, code = %error.code, "provider rejected request");
            return Ok(QueryResponse {
                request_url: url,
                reply: Reply::Error(error),
            });
        }

        let root = xml::parse(&reply.body)?;
        if is_error_document(&root) {
            let error = ErrorResponse::from_body(reply.status, &reply.body);
            warn!(action, code = %error.code, "provider returned an error document");
            return Ok(QueryResponse {
                request_url: url,
                reply: Reply::Error(error),
            });
        }

        let records = select_collection(&root, query.result_set.as_deref(), query.raw_root)
            .map(|items| items.children.iter().map(xml::decode_record).collect())
            .unwrap_or_default();
        Ok(QueryResponse {
            request_url: url,
            reply: Reply::Records(records),
        })
    }

    /// Dispatches a typed request.
    ///
    /// # Errors
    ///
    /// See [`QueryClient::query`].
    pub async fn send<R: ApiRequest + Sync>(
        &self,
        request: &R,
        region: Option<&str>,
    ) -> Result<QueryResponse, QueryError> {
        let mut query = request.to_query();
        if let Some(target) = region {
            query = query.region(target);
        }
        self.query(query).await
    }
}

fn is_error_document(root: &Element) -> bool {
    root.tag.ends_with("ErrorResponse") || root.last_child("Errors").is_some()
}

/// Picks the element whose children are the records.
///
/// A named result set wins when present (the last match, if repeated);
/// otherwise the root itself when `raw_root` is set, else the root's second
/// child, which follows the request id in compute replies.
fn select_collection<'a>(
    root: &'a Element,
    result_set: Option<&str>,
    raw_root: bool,
) -> Option<&'a Element> {
    if let Some(found) = result_set.and_then(|name| root.last_child(name)) {
        return Some(found);
    }
    if raw_root {
        return Some(root);
    }
    root.children.get(1)
}
