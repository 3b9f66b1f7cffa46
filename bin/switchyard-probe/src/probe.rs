use bytes::Bytes;
use futures::StreamExt as _;
use http::{Method, Request};
use switchyard::{
    pipeline::ServerSentEvent, ClientConfiguration, ClientFactory, HttpClient, SseClient, TcpClient, UdpClient,
};
use switchyard_config::GenericError;
use tracing::info;

use crate::config::{ProbeConfig, ProbeProtocol};

enum Client {
    Tcp(TcpClient<Bytes, Bytes>),
    Udp(UdpClient<Bytes, Bytes>),
    Http(HttpClient<Bytes, Bytes>),
    Sse(SseClient<Bytes, ServerSentEvent>),
}

/// Issues probe requests through a single client.
pub struct Probe {
    client: Client,
    payload: Bytes,
    path: String,
}

impl Probe {
    /// Builds the client described by the probe configuration.
    pub fn new(
        factory: &ClientFactory, probe_config: &ProbeConfig, client_config: ClientConfiguration,
    ) -> Result<Self, GenericError> {
        let client = match probe_config.protocol {
            ProbeProtocol::Tcp => Client::Tcp(factory.new_tcp_client().with_configuration(client_config).build()?),
            ProbeProtocol::Udp => Client::Udp(factory.new_udp_client().with_configuration(client_config).build()?),
            ProbeProtocol::Http => Client::Http(factory.new_http_client().with_configuration(client_config).build()?),
            ProbeProtocol::Sse => Client::Sse(factory.new_sse_client().with_configuration(client_config).build()?),
        };

        Ok(Self {
            client,
            payload: Bytes::from(probe_config.payload.clone()),
            path: probe_config.path.clone(),
        })
    }

    /// Sends a single request, logging what comes back.
    pub async fn send_once(&self) -> Result<(), GenericError> {
        match &self.client {
            Client::Tcp(client) => {
                let response = client.execute(self.payload.clone()).await?;
                info!(bytes = response.len(), response = %String::from_utf8_lossy(&response), "Received TCP response.");
            }
            Client::Udp(client) => {
                let response = client.execute(self.payload.clone()).await?;
                info!(bytes = response.len(), response = %String::from_utf8_lossy(&response), "Received UDP response.");
            }
            Client::Http(client) => {
                let response = client.execute(self.http_request()?).await?;
                let body = response.body();
                info!(
                    status = %response.status(),
                    bytes = body.len(),
                    body = %String::from_utf8_lossy(body),
                    "Received HTTP response."
                );
            }
            Client::Sse(client) => {
                let mut events = client.execute(self.http_request()?).await?;
                let mut received = 0usize;
                while let Some(event) = events.next().await {
                    let event = event?;
                    received += 1;
                    info!(
                        event_type = event.event_type.as_deref().unwrap_or("message"),
                        id = event.id.as_deref().unwrap_or(""),
                        data = %event.data,
                        "Received event."
                    );
                }
                info!(received, "Event stream ended.");
            }
        }

        Ok(())
    }

    fn http_request(&self) -> Result<Request<Bytes>, GenericError> {
        let method = if self.payload.is_empty() {
            Method::GET
        } else {
            Method::POST
        };

        Ok(Request::builder()
            .method(method)
            .uri(self.path.as_str())
            .body(self.payload.clone())?)
    }
}
