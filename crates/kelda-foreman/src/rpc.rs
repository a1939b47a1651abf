//! The tonic-backed minion session used in production.

use async_trait::async_trait;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use kelda_proto::proto::minion_client::MinionClient as GrpcClient;
use kelda_proto::{MinionConfig, Request};

use crate::{ClientFactory, MinionClient};

const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Opens TLS-authenticated gRPC sessions to minions.
pub struct TonicClientFactory {
    port: u16,
    tls: Option<ClientTlsConfig>,
}

impl TonicClientFactory {
    pub fn new(port: u16, tls: Option<ClientTlsConfig>) -> TonicClientFactory {
        TonicClientFactory { port, tls }
    }
}

impl ClientFactory for TonicClientFactory {
    fn new_client(&self, public_ip: &str) -> anyhow::Result<Box<dyn MinionClient>> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        Ok(Box::new(TonicMinionClient {
            endpoint: format!("{scheme}://{public_ip}:{}", self.port),
            tls: self.tls.clone(),
            client: None,
        }))
    }
}

/// A lazily-connected session; the connection is (re)established on demand
/// so an unreachable minion just fails the tick's calls.
struct TonicMinionClient {
    endpoint: String,
    tls: Option<ClientTlsConfig>,
    client: Option<GrpcClient<Channel>>,
}

impl TonicMinionClient {
    async fn client(&mut self) -> anyhow::Result<&mut GrpcClient<Channel>> {
        if self.client.is_none() {
            let mut endpoint = Endpoint::from_shared(self.endpoint.clone())?.timeout(RPC_TIMEOUT);
            if let Some(tls) = &self.tls {
                endpoint = endpoint.tls_config(tls.clone())?;
            }
            let channel = endpoint.connect().await?;
            self.client = Some(GrpcClient::new(channel));
        }
        Ok(self.client.as_mut().unwrap())
    }
}

#[async_trait]
impl MinionClient for TonicMinionClient {
    async fn set_minion(&mut self, config: MinionConfig) -> anyhow::Result<()> {
        let client = self.client().await?;
        if let Err(status) = client.set_minion_config(config).await {
            self.client = None;
            return Err(status.into());
        }
        Ok(())
    }

    async fn get_minion(&mut self) -> anyhow::Result<MinionConfig> {
        let client = self.client().await?;
        match client.get_minion_config(Request {}).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                self.client = None;
                Err(status.into())
            }
        }
    }
}
