use std::net::{IpAddr, SocketAddr};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::Request;
use hyper_util::rt::TokioIo;
#[cfg(test)] use mockall::automock;
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::{debug, trace};
use url::form_urlencoded;

/// Turns a host name into socket addresses. Several resolvers can be configured to work around
///  interference with the local network's DNS.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostResolver: Send + Sync + 'static {
    async fn resolve(&self, host: &str, port: u16) -> anyhow::Result<Vec<SocketAddr>>;
}

/// the operating system's resolver
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> anyhow::Result<Vec<SocketAddr>> {
        let result = tokio::net::lookup_host((host, port)).await?
            .collect::<Vec<_>>();
        trace!("system resolver: {} -> {:?}", host, result);
        Ok(result)
    }
}


const DNS_TYPE_A: u16 = 1;
const DNS_TYPE_AAAA: u16 = 28;

#[derive(Deserialize)]
struct JsonDnsResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<JsonDnsAnswer>,
}

#[derive(Deserialize)]
struct JsonDnsAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// Resolves host names through a DNS-over-HTTP JSON endpoint (`GET /resolve?name=..&type=A`),
///  bypassing the local network's DNS.
pub struct HttpTunneledResolver {
    /// `host:port` of the endpoint
    endpoint: String,
    /// sent as the `Host` header, e.g. to reach the endpoint through a fronting domain
    host_header: String,
}

impl HttpTunneledResolver {
    pub fn new(endpoint: impl Into<String>, host_header: impl Into<String>) -> HttpTunneledResolver {
        HttpTunneledResolver {
            endpoint: endpoint.into(),
            host_header: host_header.into(),
        }
    }

    async fn fetch(&self, path: &str) -> anyhow::Result<Bytes> {
        let stream = TcpStream::connect(&self.endpoint).await?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("DNS over HTTP connection ended with error: {}", e);
            }
        });

        let request = Request::get(path)
            .header(hyper::header::HOST, &self.host_header)
            .header(hyper::header::ACCEPT, "application/dns-json")
            .body(Empty::<Bytes>::new())?;
        let response = sender.send_request(request).await?;
        if !response.status().is_success() {
            bail!("DNS over HTTP request failed with status {}", response.status());
        }
        Ok(response.into_body().collect().await?.to_bytes())
    }

    fn parse_response(body: &[u8], port: u16) -> anyhow::Result<Vec<SocketAddr>> {
        let response: JsonDnsResponse = serde_json::from_slice(body)?;
        Ok(response.answer.iter()
            .filter(|a| a.record_type == DNS_TYPE_A || a.record_type == DNS_TYPE_AAAA)
            .filter_map(|a| a.data.parse::<IpAddr>().ok())
            .map(|ip| SocketAddr::new(ip, port))
            .collect())
    }
}

#[async_trait]
impl HostResolver for HttpTunneledResolver {
    async fn resolve(&self, host: &str, port: u16) -> anyhow::Result<Vec<SocketAddr>> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("name", host)
            .append_pair("type", "A")
            .finish();
        let body = self.fetch(&format!("/resolve?{}", query)).await?;
        let result = Self::parse_response(&body, port)?;
        trace!("DNS over HTTP: {} -> {:?}", host, result);
        Ok(result)
    }
}
