//! Minimal JSON-over-HTTP/1.1 client shared by the Raft network and the
//! store client.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TransportError {
    /// Nothing was sent: the peer could not be reached.
    #[error("connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// The request may have been delivered but no usable answer came back.
    #[error("request to {addr}{path}: {reason}")]
    Request {
        addr: String,
        path: &'static str,
        reason: String,
    },

    #[error("{addr}{path} answered {status}")]
    Status {
        addr: String,
        path: &'static str,
        status: http::StatusCode,
    },
}

impl TransportError {
    /// True when the request certainly never reached the peer.
    pub fn is_connect(&self) -> bool {
        matches!(self, TransportError::Connect { .. })
    }
}

/// POST `body` as JSON to `http://{addr}{path}` and decode the JSON reply.
pub async fn post_json<Req, Resp>(
    addr: &str,
    path: &'static str,
    body: &Req,
) -> Result<Resp, TransportError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let request_err = |reason: String| TransportError::Request {
        addr: addr.to_string(),
        path,
        reason,
    };
    let connect_err = |reason: String| TransportError::Connect {
        addr: addr.to_string(),
        reason,
    };

    let payload = serde_json::to_vec(body).map_err(|e| request_err(format!("encode: {e}")))?;

    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(connect_err(e.to_string())),
        Err(_) => return Err(connect_err("timed out".to_string())),
    };
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| connect_err(format!("handshake: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "http connection closed with error");
        }
    });

    let req = http::Request::builder()
        .method(http::Method::POST)
        .uri(path)
        .header(http::header::HOST, addr)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(payload)))
        .map_err(|e| request_err(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| request_err(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(TransportError::Status {
            addr: addr.to_string(),
            path,
            status,
        });
    }

    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| request_err(format!("read body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| request_err(format!("decode: {e}")))
}
