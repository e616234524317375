//! Fly.io backend implementation of the provisioning contract.
//!
//! Machines are created through the Machines REST API; public addresses and
//! the nearest region come from the GraphQL API. Every call carries the
//! bearer token and is retried only when it times out.

mod error;
mod proxy;
mod request;
mod types;

use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendFuture, MachineHandle, MachineRequest, MachineStatus};
use crate::config::VesselConfig;

pub use error::FlyBackendError;
pub use proxy::{ApiProxy, PROXY_ARGS, PROXY_PROGRAM, PROXY_STARTUP, ProxyError, loopback_address};
pub use request::{ApiRequest, FlyEndpoints, FlyRequest};
pub use types::Organization;
use types::{AllocateIpData, GraphResponse, Machine, NearestRegionData, ViewerData};

/// Owner of an access token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Viewer {
    /// Account email address.
    pub email: String,
    /// Organisations the account belongs to.
    pub organizations: Vec<Organization>,
}

/// Attempts made per request before a timeout is reported.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Backend that provisions machines through the Fly.io APIs.
#[derive(Clone, Debug)]
pub struct FlyBackend {
    client: Client,
    endpoints: FlyEndpoints,
    token: String,
    max_attempts: u32,
}

impl FlyBackend {
    /// Constructs a backend from the loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FlyBackendError::Client`] when the HTTP client cannot be
    /// built.
    pub fn new(config: &VesselConfig) -> Result<Self, FlyBackendError> {
        Self::with_endpoints(
            FlyEndpoints::new(&config.api_host, &config.graphql_url),
            &config.access_token,
            config.http_timeout(),
        )
    }

    /// Constructs a backend against explicit endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`FlyBackendError::Client`] when the HTTP client cannot be
    /// built.
    pub fn with_endpoints(
        endpoints: FlyEndpoints,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, FlyBackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FlyBackendError::Client(err.to_string()))?;
        Ok(Self {
            client,
            endpoints,
            token: token.to_owned(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Overrides the number of attempts made per request.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        self
    }

    /// Endpoints this backend talks to.
    #[must_use]
    pub const fn endpoints(&self) -> &FlyEndpoints {
        &self.endpoints
    }

    /// Looks up the region closest to the caller.
    ///
    /// # Errors
    ///
    /// Returns the underlying request, status, or GraphQL failure.
    pub async fn nearest_region(&self) -> Result<String, FlyBackendError> {
        let request = FlyRequest::NearestRegion;
        let data: NearestRegionData = self.graphql(&request).await?;
        Ok(data.nearest_region.code)
    }

    /// Identifies the owner of the token and the organisations it can use.
    ///
    /// # Errors
    ///
    /// Returns [`FlyBackendError::Unauthorized`] for a rejected token and the
    /// underlying request or GraphQL failure otherwise.
    pub async fn viewer(&self) -> Result<Viewer, FlyBackendError> {
        let data: ViewerData = self.graphql(&FlyRequest::Viewer).await?;
        debug!(email = %data.current_user.email, orgs = data.organizations.nodes.len(), "token accepted");
        Ok(Viewer {
            email: data.current_user.email,
            organizations: data.organizations.nodes,
        })
    }

    async fn resolve_region(&self, requested: Option<&str>) -> Option<String> {
        if let Some(region) = requested {
            return Some(region.to_owned());
        }
        match self.nearest_region().await {
            Ok(code) => {
                debug!(region = %code, "using nearest region");
                Some(code)
            }
            Err(err) => {
                warn!(error = %err, "nearest region lookup failed; letting the platform choose");
                None
            }
        }
    }

    /// Sends `request` and returns the response, retrying on timeouts.
    async fn send(&self, request: &FlyRequest<'_>) -> Result<(ApiRequest, Response), FlyBackendError> {
        let api = request.build(&self.endpoints);
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            debug!(operation = request.operation(), url = %api.url, attempt, "sending request");
            let mut builder = self
                .client
                .request(api.method.clone(), &api.url)
                .bearer_auth(&self.token)
                .header(ACCEPT, "application/json");
            if let Some(body) = &api.body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(response) => return Ok((api, response)),
                Err(err) if err.is_timeout() && attempt < self.max_attempts => {
                    warn!(url = %api.url, attempt, "request timed out; retrying");
                }
                Err(err) if err.is_timeout() => {
                    return Err(FlyBackendError::Timeout {
                        url: api.url,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    return Err(FlyBackendError::Http {
                        url: api.url,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// Sends `request` and returns the body of a successful response.
    async fn exchange(&self, request: &FlyRequest<'_>) -> Result<String, FlyBackendError> {
        let (api, response) = self.send(request).await?;
        let status = response.status();
        let body = response.text().await.map_err(|err| FlyBackendError::Http {
            url: api.url.clone(),
            message: err.to_string(),
        })?;
        check_status(&api, status, body)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: &FlyRequest<'_>) -> Result<T, FlyBackendError> {
        let url = request.build(&self.endpoints).url;
        let body = self.exchange(request).await?;
        decode(&url, &body)
    }

    async fn graphql<T: DeserializeOwned>(&self, request: &FlyRequest<'_>) -> Result<T, FlyBackendError> {
        let envelope: GraphResponse<T> = self.fetch(request).await?;
        if !envelope.errors.is_empty() {
            let message = envelope
                .errors
                .iter()
                .map(|error| error.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(FlyBackendError::GraphQl {
                operation: request.operation(),
                message,
            });
        }
        envelope.data.ok_or_else(|| FlyBackendError::GraphQl {
            operation: request.operation(),
            message: String::from("response carried no data"),
        })
    }
}

fn check_status(api: &ApiRequest, status: StatusCode, body: String) -> Result<String, FlyBackendError> {
    if status.is_success() {
        return Ok(body);
    }
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(FlyBackendError::Unauthorized {
            status: status.as_u16(),
            url: api.url.clone(),
        });
    }
    Err(FlyBackendError::Status {
        method: api.method.to_string(),
        url: api.url.clone(),
        status: status.as_u16(),
        body,
    })
}

fn decode<T: DeserializeOwned>(url: &str, body: &str) -> Result<T, FlyBackendError> {
    serde_json::from_str(body).map_err(|err| FlyBackendError::Decode {
        url: url.to_owned(),
        message: err.to_string(),
    })
}

impl Backend for FlyBackend {
    type Error = FlyBackendError;

    fn create_app<'a>(&'a self, request: &'a MachineRequest) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let app = request.app_name.as_str();
            self.exchange(&FlyRequest::CreateApp {
                app,
                org: &request.org,
            })
            .await?;
            info!(app, "created application");
            Ok(())
        })
    }

    fn create_machine<'a>(
        &'a self,
        request: &'a MachineRequest,
    ) -> BackendFuture<'a, MachineHandle, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let app = request.app_name.as_str();
            let region = self.resolve_region(request.region.as_deref()).await;
            let machine: Machine = self
                .fetch(&FlyRequest::RunMachine {
                    app,
                    region: region.as_deref(),
                    image: &request.image,
                    public_key: &request.public_key,
                })
                .await?;
            info!(app, machine = %machine.id, state = %machine.state, "machine created");

            Ok(MachineHandle {
                app_name: request.app_name.clone(),
                machine_id: machine.id,
            })
        })
    }

    fn machine_status<'a>(
        &'a self,
        handle: &'a MachineHandle,
    ) -> BackendFuture<'a, MachineStatus, Self::Error> {
        Box::pin(async move {
            let machine: Machine = self
                .fetch(&FlyRequest::GetMachine {
                    app: &handle.app_name,
                    machine_id: &handle.machine_id,
                })
                .await?;
            Ok(machine.status())
        })
    }

    fn allocate_address<'a>(
        &'a self,
        app_name: &'a str,
        use_ipv6: bool,
    ) -> BackendFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let data: AllocateIpData = self
                .graphql(&FlyRequest::AllocateAddress {
                    app: app_name,
                    ipv6: use_ipv6,
                })
                .await?;
            let address = data.allocation.ip_address.address;
            info!(app = app_name, %address, "allocated public address");
            Ok(address)
        })
    }

    fn delete_app<'a>(&'a self, app_name: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            match self.exchange(&FlyRequest::DeleteApp { app: app_name }).await {
                Ok(_) => {
                    info!(app = app_name, "deleted application");
                    Ok(())
                }
                Err(FlyBackendError::Status { status: 404, .. }) => {
                    debug!(app = app_name, "application already gone");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        })
    }
}

#[cfg(test)]
mod tests;
