//! Docker Engine API client over the daemon's Unix socket.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;
use log::{debug, info, warn};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;

use super::error::{RuntimeError, RuntimeResult};
use super::types::{
    ContainerInspect, ContainerSpec, CreateResponse, ErrorBody, NetworkInspect, NetworkSpec,
    RuntimeStats, VersionResponse, WaitResponse,
};
use super::{LogStream, RuntimeApi, StatsStream};

/// Newest API version this client speaks. The daemon may offer a newer one.
const MAX_API_VERSION: (u32, u32) = (1, 43);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkCreateResponse {
    id: String,
}

/// Parse an API version such as `1.41`.
fn parse_version(raw: &str) -> Option<(u32, u32)> {
    let (major, minor) = raw.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Pick the version both sides understand.
fn negotiate(server: &str) -> String {
    let chosen = match parse_version(server) {
        Some(server) if server < MAX_API_VERSION => server,
        _ => MAX_API_VERSION,
    };
    format!("{}.{}", chosen.0, chosen.1)
}

/// Client for one Docker daemon.
///
/// The API version is negotiated once in [`DockerClient::connect`] and every
/// later request is sent under that version's path prefix.
#[derive(Clone)]
pub struct DockerClient {
    client: Client<UnixConnector, Full<Bytes>>,
    socket: PathBuf,
    api_version: String,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient")
            .field("socket", &self.socket)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl DockerClient {
    /// Connect to the daemon at `socket` and negotiate the API version.
    pub async fn connect(socket: impl Into<PathBuf>) -> RuntimeResult<Self> {
        let mut client = Self {
            client: Client::builder(TokioExecutor::new()).build(UnixConnector),
            socket: socket.into(),
            api_version: String::new(),
        };

        let version: VersionResponse = client.json("version", Method::GET, "/version", None).await?;
        client.api_version = negotiate(&version.api_version);
        info!(
            "Connected to Docker {} at {} (API v{}, daemon offers v{})",
            version.version,
            client.socket.display(),
            client.api_version,
            version.api_version
        );
        Ok(client)
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn uri(&self, path: &str) -> hyper::Uri {
        let path = if self.api_version.is_empty() {
            path.to_string()
        } else {
            format!("/v{}{}", self.api_version, path)
        };
        hyperlocal::Uri::new(&self.socket, &path).into()
    }

    /// Send a request and turn non-success statuses into errors.
    ///
    /// `304 Not Modified` counts as success: the engine returns it when a
    /// container is already in the requested state.
    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> RuntimeResult<Response<Incoming>> {
        let mut builder = Request::builder().method(method).uri(self.uri(path));
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder.body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        debug!("docker {} {}", operation, path);
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| RuntimeError::Transport(format!("{}: {}", operation, e)))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }

        let body = read_body(response).await?;
        let message = serde_json::from_slice::<ErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).trim().to_string());

        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(message));
        }
        Err(RuntimeError::Api {
            operation,
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> RuntimeResult<T> {
        let response = self.send(operation, method, path, body).await?;
        let bytes = read_body(response).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn empty(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
    ) -> RuntimeResult<()> {
        let response = self.send(operation, method, path, None).await?;
        read_body(response).await?;
        Ok(())
    }
}

async fn read_body(response: Response<Incoming>) -> RuntimeResult<Bytes> {
    let collected = response
        .into_body()
        .collect()
        .await
        .map_err(|e| RuntimeError::Io(io::Error::other(e)))?;
    Ok(collected.to_bytes())
}

/// Split a streaming body into non-empty lines with trailing `\r\n` removed.
fn body_lines(body: Incoming) -> futures::stream::BoxStream<'static, RuntimeResult<Vec<u8>>> {
    let reader = BufReader::new(StreamReader::new(
        body.into_data_stream().map_err(io::Error::other),
    ));

    futures::stream::unfold((reader, false), |(mut reader, failed)| async move {
        if failed {
            return None;
        }
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => return None,
                Ok(_) => {
                    while matches!(line.last(), Some(b'\n' | b'\r')) {
                        line.pop();
                    }
                    if line.is_empty() {
                        continue;
                    }
                    return Some((Ok(line), (reader, false)));
                }
                Err(e) => return Some((Err(RuntimeError::Io(e)), (reader, true))),
            }
        }
    })
    .boxed()
}

fn escape(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

#[async_trait]
impl RuntimeApi for DockerClient {
    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> RuntimeResult<String> {
        let body = serde_json::to_vec(spec)?;
        let created: CreateResponse = self
            .json(
                "create container",
                Method::POST,
                &format!("/containers/create?name={}", escape(name)),
                Some(body),
            )
            .await?;
        for warning in created.warnings.unwrap_or_default() {
            warn!("docker warning creating {}: {}", name, warning);
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.empty(
            "start container",
            Method::POST,
            &format!("/containers/{}/start", escape(id)),
        )
        .await
    }

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> RuntimeResult<()> {
        self.empty(
            "stop container",
            Method::POST,
            &format!("/containers/{}/stop?t={}", escape(id), timeout_secs),
        )
        .await
    }

    async fn kill_container(&self, id: &str, signal: &str) -> RuntimeResult<()> {
        self.empty(
            "kill container",
            Method::POST,
            &format!("/containers/{}/kill?signal={}", escape(id), escape(signal)),
        )
        .await
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        self.empty(
            "remove container",
            Method::DELETE,
            &format!("/containers/{}?force=true&v=true", escape(id)),
        )
        .await
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInspect> {
        self.json(
            "inspect container",
            Method::GET,
            &format!("/containers/{}/json", escape(id)),
            None,
        )
        .await
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<WaitResponse> {
        self.json(
            "wait container",
            Method::POST,
            &format!("/containers/{}/wait?condition=not-running", escape(id)),
            None,
        )
        .await
    }

    async fn stats(&self, id: &str) -> RuntimeResult<StatsStream> {
        let response = self
            .send(
                "container stats",
                Method::GET,
                &format!("/containers/{}/stats?stream=true", escape(id)),
                None,
            )
            .await?;

        Ok(body_lines(response.into_body())
            .map(|line| {
                line.and_then(|line| {
                    serde_json::from_slice::<RuntimeStats>(&line).map_err(RuntimeError::from)
                })
            })
            .boxed())
    }

    async fn logs(&self, id: &str) -> RuntimeResult<LogStream> {
        // Managed containers run with a TTY, so the stream is raw text rather
        // than the multiplexed stdout/stderr framing.
        let response = self
            .send(
                "container logs",
                Method::GET,
                &format!(
                    "/containers/{}/logs?follow=true&stdout=true&stderr=true",
                    escape(id)
                ),
                None,
            )
            .await?;

        Ok(body_lines(response.into_body())
            .map_ok(|line| String::from_utf8_lossy(&line).into_owned())
            .boxed())
    }

    async fn inspect_network(&self, name: &str) -> RuntimeResult<NetworkInspect> {
        self.json(
            "inspect network",
            Method::GET,
            &format!("/networks/{}", escape(name)),
            None,
        )
        .await
    }

    async fn create_network(&self, spec: &NetworkSpec) -> RuntimeResult<String> {
        let body = serde_json::to_vec(spec)?;
        let created: NetworkCreateResponse = self
            .json("create network", Method::POST, "/networks/create", Some(body))
            .await?;
        Ok(created.id)
    }
}
