use std::net::SocketAddr;
use std::time::Duration;
use async_trait::async_trait;
use serde::de::IgnoredAny;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use shared::call::{CallOutcome, ServiceCall};
use shared::types::Service;

/// Sends one service call and reports what came back.
///
/// Implementations never fail: transport problems are a failed outcome.
#[async_trait]
pub trait ServiceCaller: Send + Sync {
    async fn call(&self, service: &Service, call: &ServiceCall) -> CallOutcome;
}

/// Request/response over a fresh TCP connection to the Thing's control port
pub struct TcpCaller {
    port: u16,
    timeout: Duration,
}

impl TcpCaller {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    async fn exchange(&self, addr: SocketAddr, body: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(body).await?;

        // Things answer with one JSON object and may keep the socket open,
        // so stop as soon as a whole object has arrived.
        let mut response = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&chunk[..n]);
            if is_complete(&response) {
                break;
            }
        }
        Ok(response)
    }
}

fn is_complete(buf: &[u8]) -> bool {
    let text = String::from_utf8_lossy(buf);
    serde_json::from_str::<IgnoredAny>(text.trim_end_matches('\0').trim()).is_ok()
}

#[async_trait]
impl ServiceCaller for TcpCaller {
    async fn call(&self, service: &Service, call: &ServiceCall) -> CallOutcome {
        let Some(ip) = service.address else {
            tracing::warn!("No known address for {} on {}", service.name, service.thing_id);
            return CallOutcome::failed();
        };
        let addr = SocketAddr::new(ip, self.port);
        let body = call.to_json();

        tracing::debug!("Calling {} at {}: {}", service.name, addr, body);
        match tokio::time::timeout(self.timeout, self.exchange(addr, body.as_bytes())).await {
            Ok(Ok(response)) => CallOutcome::from_response(&response),
            Ok(Err(e)) => {
                tracing::warn!("Call to {} at {} failed: {}", service.name, addr, e);
                CallOutcome::failed()
            }
            Err(_) => {
                tracing::warn!("Call to {} at {} timed out after {:?}", service.name, addr, self.timeout);
                CallOutcome::failed()
            }
        }
    }
}
