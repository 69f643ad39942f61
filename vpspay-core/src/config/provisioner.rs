//! Provisioning collaborator configuration.

use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub base_url: Url,
    pub request_timeout: Duration,
}
