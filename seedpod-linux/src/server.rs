//! Minimal HTTP/1.1 package server: parses requests with httparse and answers from the
//! engine's segment server. One request per connection.

use std::io;

use seedpod_core::{PackageId, SegmentServer, ServeError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use futures::StreamExt;

use crate::transport::FAULT_HEADER;

const MAX_HEAD: usize = 16 * 1024;
const MAX_BODY: usize = 1024 * 1024;
const DEFAULT_OFFER: usize = 16;

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, server: SegmentServer) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, server).await {
                tracing::debug!(%peer, error = %e, "request failed");
            }
        });
    }
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

async fn read_request(stream: &mut TcpStream) -> io::Result<Option<Request>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        let head_len = match req.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) if buf.len() <= MAX_HEAD => continue,
            Ok(httparse::Status::Partial) => return Err(invalid("request head too large")),
            Err(_) => return Err(invalid("malformed request")),
        };
        let method = req.method.unwrap_or_default().to_string();
        let path = req.path.unwrap_or_default().to_string();
        let content_length = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("Content-Length"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if content_length > MAX_BODY {
            return Err(invalid("request body too large"));
        }
        let mut body = buf[head_len..].to_vec();
        while body.len() < content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(content_length);
        return Ok(Some(Request { method, path, body }));
    }
}

async fn respond(
    stream: &mut TcpStream,
    status: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

async fn respond_error(stream: &mut TcpStream, e: &ServeError) -> io::Result<()> {
    match e {
        ServeError::Choked => respond(stream, "503 Service Unavailable", &[], b"").await,
        ServeError::PackageNotFound(_) => {
            respond(stream, "404 Not Found", &[(FAULT_HEADER, "package")], b"").await
        }
        ServeError::SegmentsNotFound => {
            respond(stream, "404 Not Found", &[(FAULT_HEADER, "segments")], b"").await
        }
        ServeError::InvalidBitmap(_) => respond(stream, "400 Bad Request", &[], b"").await,
        ServeError::Storage(e) => {
            tracing::warn!(error = %e, "storage failed while serving");
            respond(stream, "500 Internal Server Error", &[], b"").await
        }
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn parse_indexes(query: &str) -> Option<Vec<u32>> {
    query_param(query, "i")?
        .split(',')
        .map(|s| s.parse::<u32>().ok())
        .collect()
}

async fn handle_client(mut stream: TcpStream, server: SegmentServer) -> io::Result<()> {
    let Some(req) = read_request(&mut stream).await? else {
        return Ok(());
    };
    let (path, query) = req.path.split_once('?').unwrap_or((req.path.as_str(), ""));
    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (req.method.as_str(), parts.as_slice()) {
        ("POST", ["status"]) => {
            let Ok(ids) = bincode::deserialize::<Vec<PackageId>>(&req.body) else {
                return respond(&mut stream, "400 Bad Request", &[], b"").await;
            };
            let statuses = server.local_status(&ids);
            let body = bincode::serialize(&statuses)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            respond(&mut stream, "200 OK", &[], &body).await
        }
        ("GET", ["packages", id, "segments"]) => {
            let (Ok(id), Some(indexes)) = (id.parse::<PackageId>(), parse_indexes(query)) else {
                return respond(&mut stream, "400 Bad Request", &[], b"").await;
            };
            let mut segments = match server.serve_segments(id, indexes).await {
                Ok(s) => s,
                Err(e) => return respond_error(&mut stream, &e).await,
            };
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
                .await?;
            while let Some(chunk) = segments.next().await {
                stream.write_all(&chunk?).await?;
            }
            stream.flush().await
        }
        ("POST", ["packages", id, "offer"]) => {
            let Ok(id) = id.parse::<PackageId>() else {
                return respond(&mut stream, "400 Bad Request", &[], b"").await;
            };
            let max = query_param(query, "max")
                .and_then(|m| m.parse().ok())
                .unwrap_or(DEFAULT_OFFER);
            match server.offer(&id, &req.body, max) {
                Ok(offered) => {
                    let body = bincode::serialize(&offered)
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                    respond(&mut stream, "200 OK", &[], &body).await
                }
                Err(e) => respond_error(&mut stream, &e).await,
            }
        }
        _ => respond(&mut stream, "404 Not Found", &[], b"").await,
    }
}
