//! HTTP client side of the peer protocol.
//!
//! `GET /packages/<id>/segments?i=1,2,3` streams the segments; 503 means choked, 404 carries
//! an `x-seedpod-fault` header naming what is missing. `POST /status` takes and returns
//! bincode.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use seedpod_core::{BoxFuture, PackageId, PackageStatus, SegmentStream, Transport, TransportFault};

pub const FAULT_HEADER: &str = "x-seedpod-fault";

pub struct HttpTransport {
    client: reqwest::Client,
}

fn io_err(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

pub fn segments_path(package: &PackageId, segments: &[u32]) -> String {
    let list: Vec<String> = segments.iter().map(u32::to_string).collect();
    format!("/packages/{package}/segments?i={}", list.join(","))
}

impl Transport for HttpTransport {
    fn fetch_segments(
        &self,
        endpoint: SocketAddr,
        package: PackageId,
        segments: Vec<u32>,
    ) -> BoxFuture<'_, Result<SegmentStream, TransportFault>> {
        Box::pin(async move {
            let url = format!("http://{endpoint}{}", segments_path(&package, &segments));
            let resp = self.client.get(url).send().await.map_err(io_err)?;
            match resp.status() {
                StatusCode::OK => Ok(resp.bytes_stream().map_err(io_err).boxed()),
                StatusCode::SERVICE_UNAVAILABLE => Err(TransportFault::Choked),
                StatusCode::NOT_FOUND => {
                    let fault = resp
                        .headers()
                        .get(FAULT_HEADER)
                        .and_then(|v| v.to_str().ok());
                    match fault {
                        Some("segments") => Err(TransportFault::SegmentsNotFound),
                        _ => Err(TransportFault::PackageNotFound),
                    }
                }
                other => Err(io_err(format!("unexpected status {other}")).into()),
            }
        })
    }

    fn fetch_remote_status(
        &self,
        endpoint: SocketAddr,
        packages: Vec<PackageId>,
    ) -> BoxFuture<'_, Result<Vec<PackageStatus>, TransportFault>> {
        Box::pin(async move {
            let body = bincode::serialize(&packages).map_err(io_err)?;
            let resp = self
                .client
                .post(format!("http://{endpoint}/status"))
                .body(body)
                .send()
                .await
                .map_err(io_err)?;
            if resp.status() != StatusCode::OK {
                return Err(io_err(format!("unexpected status {}", resp.status())).into());
            }
            let bytes = resp.bytes().await.map_err(io_err)?;
            let statuses: Vec<PackageStatus> = bincode::deserialize(&bytes).map_err(io_err)?;
            Ok(statuses)
        })
    }
}
