//! REST control-plane client.
//!
//! A deliberately thin HTTP/1.1 client: one connection per request, no
//! pooling. Binding posts and reconciliation reads are low-rate, so the
//! handshake cost is irrelevant and the failure surface stays small.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::traits::{ClientError, ClientResult, ControlPlane};
use crate::types::{Binding, Pod, Service};

/// Control-plane client speaking the REST endpoints in §external-interfaces.
#[derive(Debug, Clone)]
pub struct RestControlPlane {
    /// host:port of the control plane API.
    authority: String,
}

impl RestControlPlane {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
        }
    }

    async fn request(
        &self,
        method: http::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ClientResult<(http::StatusCode, Bytes)> {
        let stream = tokio::net::TcpStream::connect(&self.authority)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let uri = format!("http://{}{}", self.authority, path);
        let mut builder = http::Request::builder()
            .method(method)
            .uri(&uri)
            .header("host", &self.authority)
            .header("accept", "application/json");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
            .to_bytes();
        debug!(%uri, status = status.as_u16(), "control plane request");
        Ok((status, bytes))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> ClientResult<T> {
        serde_json::from_slice(bytes).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ControlPlane for RestControlPlane {
    async fn post_binding(&self, binding: &Binding) -> ClientResult<()> {
        let body = serde_json::to_vec(binding).map_err(|e| ClientError::Decode(e.to_string()))?;
        let path = format!("/api/v1/namespaces/{}/bindings", binding.namespace);
        let (status, _) = self.request(http::Method::POST, &path, Some(body)).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::Status(status.as_u16()))
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> ClientResult<Option<Pod>> {
        let path = format!("/api/v1/namespaces/{namespace}/pods/{name}");
        let (status, bytes) = self.request(http::Method::GET, &path, None).await?;
        if status == http::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(Some(Self::decode(&bytes)?))
    }

    async fn list_pods(&self) -> ClientResult<Vec<Pod>> {
        let (status, bytes) = self.request(http::Method::GET, "/api/v1/pods", None).await?;
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        Self::decode(&bytes)
    }

    async fn list_services(&self, namespace: &str) -> ClientResult<Vec<Service>> {
        let path = format!("/api/v1/namespaces/{namespace}/services");
        let (status, bytes) = self.request(http::Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        Self::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_to_closed_port_is_transport_error() {
        let client = RestControlPlane::new("127.0.0.1:1");
        let err = client.get_pod("default", "api").await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
    }

    #[test]
    fn client_is_cheaply_cloneable() {
        let a = RestControlPlane::new("127.0.0.1:8443");
        let b = a.clone();
        assert_eq!(a.authority, b.authority);
    }
}
