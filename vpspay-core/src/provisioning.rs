//! Seam to the VM-provisioning collaborator.
//!
//! The cloud wrapper itself is an external RPC façade; the reconciler only
//! needs `create → start` for a paid order, and `describe` to check an
//! instance an earlier attempt already created.
//! [`HttpProvisioner`] talks to that façade over JSON/HTTP.

use crate::config::ProvisionerConfig;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

/// Parameters of the instance a customer is buying.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub region_id: String,
    pub instance_type: String,
    pub image_id: String,
    #[serde(default)]
    pub security_group_id: Option<String>,
    pub period: i32,
    pub period_unit: String,
    #[serde(default)]
    pub system_disk_category: String,
    #[serde(default)]
    pub system_disk_size: i32,
    #[serde(default)]
    pub internet_max_bandwidth_out: i32,
}

/// Result of a successful `create_instance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedInstance {
    pub instance_id: String,
    /// Fiat price quoted by the provider; informational only.
    pub trade_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAttributes {
    pub instance_id: String,
    pub status: String,
    #[serde(default)]
    pub public_ip_address: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provider request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid provider url: {0}")]
    Url(#[from] url::ParseError),

    #[error("provider rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create_instance(
        &self,
        order_id: Uuid,
        spec: &InstanceSpec,
    ) -> Result<ProvisionedInstance, ProvisionError>;

    async fn start_instance(&self, instance_id: &str) -> Result<(), ProvisionError>;

    async fn describe_instance(&self, instance_id: &str)
    -> Result<InstanceAttributes, ProvisionError>;
}

/// Provider status of an instance that needs no start call.
const RUNNING: &str = "Running";

/// Why provisioning stopped, and the instance it left behind if any.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ProvisionFailure {
    /// Created before the failure; a retry must reuse it.
    pub instance: Option<ProvisionedInstance>,
    pub reason: String,
}

impl ProvisionFailure {
    fn new(instance: Option<ProvisionedInstance>, error: ProvisionError) -> Self {
        Self {
            instance,
            reason: error.to_string(),
        }
    }
}

/// Create and start the instance for a paid order.
///
/// `created` is the instance an earlier attempt already made for this order.
/// It is started (unless it already runs) and never created again.
pub async fn provision_order(
    provisioner: &dyn Provisioner,
    order_id: Uuid,
    spec: &InstanceSpec,
    created: Option<ProvisionedInstance>,
) -> Result<ProvisionedInstance, ProvisionFailure> {
    let instance = match created {
        Some(instance) => {
            let attributes = match provisioner.describe_instance(&instance.instance_id).await {
                Ok(attributes) => attributes,
                Err(e) => return Err(ProvisionFailure::new(Some(instance), e)),
            };
            if attributes.status.eq_ignore_ascii_case(RUNNING) {
                info!(%order_id, instance_id = %instance.instance_id, "Instance already running");
                return Ok(instance);
            }
            debug!(%order_id, instance_id = %instance.instance_id, status = %attributes.status, "Reusing instance, starting");
            instance
        }
        None => {
            let instance = provisioner
                .create_instance(order_id, spec)
                .await
                .map_err(|e| ProvisionFailure::new(None, e))?;
            debug!(%order_id, instance_id = %instance.instance_id, "Instance created, starting");
            instance
        }
    };
    if let Err(e) = provisioner.start_instance(&instance.instance_id).await {
        return Err(ProvisionFailure::new(Some(instance), e));
    }
    info!(%order_id, instance_id = %instance.instance_id, "Instance provisioned");
    Ok(instance)
}

/// JSON/HTTP client for the provisioning façade.
///
/// * `POST {base}/instances` with `{order_id, spec}` → [`ProvisionedInstance`]
/// * `POST {base}/instances/{id}/start`
/// * `GET  {base}/instances/{id}` → [`InstanceAttributes`]
pub struct HttpProvisioner {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpProvisioner {
    pub fn new(config: &ProvisionerConfig) -> Result<Self, ProvisionError> {
        let mut base_url = config.base_url.clone();
        // `Url::join` replaces the last segment unless the path ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            http_client: reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProvisionError> {
        Ok(self.base_url.join(path)?)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProvisionError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ProvisionError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[derive(Serialize)]
struct CreateInstanceBody<'a> {
    order_id: Uuid,
    spec: &'a InstanceSpec,
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn create_instance(
        &self,
        order_id: Uuid,
        spec: &InstanceSpec,
    ) -> Result<ProvisionedInstance, ProvisionError> {
        let response = self
            .http_client
            .post(self.endpoint("instances")?)
            .json(&CreateInstanceBody { order_id, spec })
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), ProvisionError> {
        let response = self
            .http_client
            .post(self.endpoint(&format!("instances/{instance_id}/start"))?)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<InstanceAttributes, ProvisionError> {
        let response = self
            .http_client
            .get(self.endpoint(&format!("instances/{instance_id}"))?)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
