//! The fixed set of Fly.io API calls, rendered as plain request values.
//!
//! Building a request is pure so URLs and bodies can be checked without a
//! network; [`super::FlyBackend`] performs the actual exchange.

use reqwest::Method;
use serde_json::{Value, json};

const ALLOCATE_IP_MUTATION: &str = "mutation($input: AllocateIPAddressInput!) { allocateIpAddress(input: $input) { ipAddress { id address type region createdAt } } }";
const NEAREST_REGION_QUERY: &str = "query { nearestRegion { code name gatewayAvailable } }";
const VIEWER_QUERY: &str =
    "query { currentUser { email } organizations { nodes { id slug name type viewerRole } } }";

/// Where requests are sent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlyEndpoints {
    /// Machines REST API base URL, without a trailing slash.
    pub api_host: String,
    /// GraphQL endpoint URL.
    pub graphql_url: String,
}

impl FlyEndpoints {
    /// Creates endpoints, trimming a trailing slash from the API host.
    #[must_use]
    pub fn new(api_host: &str, graphql_url: &str) -> Self {
        Self {
            api_host: api_host.trim_end_matches('/').to_owned(),
            graphql_url: graphql_url.to_owned(),
        }
    }
}

/// One API call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FlyRequest<'a> {
    /// Create an application.
    CreateApp {
        /// Application name.
        app: &'a str,
        /// Owning organisation slug.
        org: &'a str,
    },
    /// Boot a machine in an application.
    RunMachine {
        /// Application name.
        app: &'a str,
        /// Region code; omitted to let the platform choose.
        region: Option<&'a str>,
        /// Image reference.
        image: &'a str,
        /// Public key exported to the guest as `VESSEL_PUBLIC_KEY`.
        public_key: &'a str,
    },
    /// Fetch one machine.
    GetMachine {
        /// Application name.
        app: &'a str,
        /// Machine identifier.
        machine_id: &'a str,
    },
    /// Delete an application with all its machines.
    DeleteApp {
        /// Application name.
        app: &'a str,
    },
    /// Allocate a public IP address.
    AllocateAddress {
        /// Application name.
        app: &'a str,
        /// Allocate IPv6 when `true`, IPv4 otherwise.
        ipv6: bool,
    },
    /// Look up the region closest to the caller.
    NearestRegion,
    /// Identify the token owner and the organisations it can use.
    Viewer,
}

/// A rendered HTTP request.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// JSON body, if any.
    pub body: Option<Value>,
}

impl FlyRequest<'_> {
    /// Renders the request against `endpoints`.
    #[must_use]
    pub fn build(&self, endpoints: &FlyEndpoints) -> ApiRequest {
        let api = endpoints.api_host.as_str();
        match self {
            Self::CreateApp { app, org } => ApiRequest {
                method: Method::POST,
                url: format!("{api}/v1/apps"),
                body: Some(json!({ "app_name": app, "org_slug": org })),
            },
            Self::RunMachine {
                app,
                region,
                image,
                public_key,
            } => {
                let mut body = json!({
                    "config": {
                        "image": image,
                        "env": { "VESSEL_PUBLIC_KEY": public_key },
                    },
                });
                if let (Some(code), Some(object)) = (region, body.as_object_mut()) {
                    object.insert(String::from("region"), json!(code));
                }
                ApiRequest {
                    method: Method::POST,
                    url: format!("{api}/v1/apps/{app}/machines"),
                    body: Some(body),
                }
            }
            Self::GetMachine { app, machine_id } => ApiRequest {
                method: Method::GET,
                url: format!("{api}/v1/apps/{app}/machines/{machine_id}"),
                body: None,
            },
            Self::DeleteApp { app } => ApiRequest {
                method: Method::DELETE,
                url: format!("{api}/v1/apps/{app}"),
                body: None,
            },
            Self::AllocateAddress { app, ipv6 } => ApiRequest {
                method: Method::POST,
                url: endpoints.graphql_url.clone(),
                body: Some(json!({
                    "query": ALLOCATE_IP_MUTATION,
                    "variables": {
                        "input": { "appId": app, "type": if *ipv6 { "v6" } else { "v4" } },
                    },
                })),
            },
            Self::NearestRegion => ApiRequest {
                method: Method::POST,
                url: endpoints.graphql_url.clone(),
                body: Some(json!({ "query": NEAREST_REGION_QUERY })),
            },
            Self::Viewer => ApiRequest {
                method: Method::POST,
                url: endpoints.graphql_url.clone(),
                body: Some(json!({ "query": VIEWER_QUERY })),
            },
        }
    }

    /// Short operation label for logs and errors.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::CreateApp { .. } => "create app",
            Self::RunMachine { .. } => "run machine",
            Self::GetMachine { .. } => "get machine",
            Self::DeleteApp { .. } => "delete app",
            Self::AllocateAddress { .. } => "allocateIpAddress",
            Self::NearestRegion => "nearestRegion",
            Self::Viewer => "viewer",
        }
    }
}
