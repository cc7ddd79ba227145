//! Config gRPC client — controller side.
//!
//! Thin wrapper over the generated stub; the foreman keeps one per
//! machine and rebuilds it after a connection failure.

use tonic::transport::Channel;
use tonic::Status;

use crate::proto;
use crate::proto::minion_client;
use crate::MINION_PORT;

/// Client for one minion's config service.
pub struct MinionClient {
    inner: minion_client::MinionClient<Channel>,
}

impl MinionClient {
    /// Connect to the minion at the given public IP.
    pub async fn connect(ip: &str) -> Result<Self, tonic::transport::Error> {
        let endpoint = format!("http://{ip}:{MINION_PORT}");
        let inner = minion_client::MinionClient::connect(endpoint).await?;
        Ok(Self { inner })
    }

    /// Poll the minion's currently applied configuration.
    pub async fn get_config(&mut self) -> Result<proto::MinionConfig, Status> {
        let response = self
            .inner
            .get_minion_config(proto::ConfigRequest {})
            .await?;
        Ok(response.into_inner())
    }

    /// Push the desired configuration.
    pub async fn set_config(&mut self, config: proto::MinionConfig) -> Result<(), Status> {
        self.inner.set_minion_config(config).await?;
        Ok(())
    }
}
