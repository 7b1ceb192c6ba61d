//! Kubernetes `exec` client.
//!
//! Commands run through the pod `exec` subresource over a WebSocket using the
//! `v4.channel.k8s.io` subprotocol. Cluster access is resolved on first use,
//! so building an executor never touches the cluster. The container name is
//! looked up once from the pod spec (first container) unless configured
//! explicitly. Both outcomes, success or failure, are kept for the lifetime of
//! the executor.

use super::access::ClusterAccess;
use super::channel::{encode_stdin, ChannelBuffers, EXEC_PROTOCOL};
use super::{shell_quote, ExecOutput, RemoteExecutor};
use crate::config::KubeConfig;
use crate::utils::{RestoreError, Result};
use futures_util::{SinkExt, StreamExt};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Size of each stdin frame when uploading files
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct Pod {
    spec: PodSpec,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    name: String,
}

/// HTTP and WebSocket clients bound to one API server
struct ApiClient {
    http: reqwest::Client,
    api_server: String,
    token: Option<String>,
    tls: Option<native_tls::TlsConnector>,
}

impl ApiClient {
    fn new(access: ClusterAccess) -> Result<Self> {
        let mut http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(access.insecure_skip_tls_verify);
        if let Some(pem) = &access.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| RestoreError::Config(format!("invalid CA certificate: {}", e)))?;
            http = http.add_root_certificate(cert);
        }
        let http = http.build()?;

        let tls = if access.api_server.starts_with("https://") {
            let mut builder = native_tls::TlsConnector::builder();
            if let Some(pem) = &access.ca_pem {
                let cert = native_tls::Certificate::from_pem(pem)
                    .map_err(|e| RestoreError::Config(format!("invalid CA certificate: {}", e)))?;
                builder.add_root_certificate(cert);
            }
            builder.danger_accept_invalid_certs(access.insecure_skip_tls_verify);
            Some(
                builder
                    .build()
                    .map_err(|e| RestoreError::Config(format!("TLS setup failed: {}", e)))?,
            )
        } else {
            None
        };

        Ok(Self {
            http,
            api_server: access.api_server,
            token: access.token,
            tls,
        })
    }
}

/// Executes commands in one pod through the Kubernetes API server
pub struct KubeExecutor {
    settings: KubeConfig,
    api: OnceLock<Result<ApiClient>>,
    container: OnceCell<Result<String>>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl KubeExecutor {
    /// Build an executor from configuration. See [`ClusterAccess::resolve`]
    /// for how the API server is found.
    pub fn new(config: &KubeConfig, cancel: CancellationToken) -> Self {
        Self {
            settings: config.clone(),
            api: OnceLock::new(),
            container: OnceCell::new_with(config.container.clone().map(Ok)),
            timeout: config.exec_timeout(),
            cancel,
        }
    }

    fn api(&self) -> Result<&ApiClient> {
        let api = self.api.get_or_init(|| {
            let api = ClusterAccess::resolve(&self.settings).and_then(ApiClient::new);
            match &api {
                Ok(api) => info!("Using API server {}", api.api_server),
                Err(e) => error!("Cannot reach the Kubernetes API: {}", e),
            }
            api
        });
        api.as_ref().map_err(RestoreError::replay)
    }

    fn pod_url(&self, api: &ApiClient) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            api.api_server, self.settings.namespace, self.settings.pod_name
        )
    }

    /// Container commands run in; resolved on first use and never retried.
    pub async fn resolve_container(&self) -> Result<String> {
        let resolved = self
            .container
            .get_or_init(|| async {
                let namespace = &self.settings.namespace;
                let pod = &self.settings.pod_name;
                match self.lookup_container().await {
                    Ok(name) => {
                        info!("Resolved execution target {}/{} container {}", namespace, pod, name);
                        Ok(name)
                    }
                    Err(e) => {
                        error!("Failed to resolve container for pod {}/{}: {}", namespace, pod, e);
                        Err(e)
                    }
                }
            })
            .await;

        resolved.as_ref().map(String::clone).map_err(RestoreError::replay)
    }

    async fn lookup_container(&self) -> Result<String> {
        let api = self.api()?;
        let mut request = api.http.get(self.pod_url(api));
        if let Some(token) = &api.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RestoreError::http("pod lookup", CONNECT_TIMEOUT, e)
            } else {
                RestoreError::Connection(format!("pod lookup: {}", e))
            }
        })?;

        let (namespace, pod) = (&self.settings.namespace, &self.settings.pod_name);
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(RestoreError::NotFound(format!("pod {}/{}", namespace, pod)));
            }
            status => {
                return Err(RestoreError::Connection(format!("pod lookup returned HTTP {}", status)));
            }
        }

        let pod_spec: Pod = response
            .json()
            .await
            .map_err(|e| RestoreError::Connection(format!("pod lookup: {}", e)))?;
        pod_spec
            .spec
            .containers
            .into_iter()
            .next()
            .map(|c| c.name)
            .ok_or_else(|| RestoreError::NotFound(format!("pod {}/{} has no containers", namespace, pod)))
    }

    fn exec_url(&self, api: &ApiClient, container: &str, command: &str, stdin: bool) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/exec", self.pod_url(api)))
            .map_err(|e| RestoreError::Config(format!("invalid API server URL: {}", e)))?;

        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| RestoreError::Config(format!("cannot use {} for exec", api.api_server)))?;

        url.query_pairs_mut()
            .append_pair("container", container)
            .append_pair("command", "sh")
            .append_pair("command", "-c")
            .append_pair("command", command)
            .append_pair("stdin", if stdin { "true" } else { "false" })
            .append_pair("stdout", "true")
            .append_pair("stderr", "true")
            .append_pair("tty", "false");

        Ok(url)
    }

    /// Run one exec session, optionally feeding `stdin` from a local file.
    async fn stream(&self, command: &str, stdin: Option<&Path>) -> Result<ExecOutput> {
        let api = self.api()?;
        let container = self.resolve_container().await?;
        let url = self.exec_url(api, &container, command, stdin.is_some())?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RestoreError::Connection(format!("exec request: {}", e)))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(EXEC_PROTOCOL));
        if let Some(token) = &api.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| RestoreError::Config(format!("invalid bearer token: {}", e)))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let connector = api.tls.clone().map(Connector::NativeTls);
        let (ws_stream, _) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) if response.status() == StatusCode::NOT_FOUND.as_u16() => {
                    RestoreError::NotFound(format!(
                        "exec endpoint for pod {}/{}",
                        self.settings.namespace, self.settings.pod_name
                    ))
                }
                other => RestoreError::Connection(format!("exec stream: {}", other)),
            })?;
        let (mut write, mut read) = ws_stream.split();

        if let Some(path) = stdin {
            let mut file = tokio::fs::File::open(path).await?;
            let mut chunk = vec![0u8; UPLOAD_CHUNK_SIZE];
            loop {
                let n = file.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                write
                    .send(Message::Binary(encode_stdin(&chunk[..n]).into()))
                    .await
                    .map_err(|e| RestoreError::Connection(format!("exec stdin: {}", e)))?;
            }
        }

        let mut buffers = ChannelBuffers::new();
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Binary(data)) => buffers.push(&data),
                Ok(Message::Ping(data)) => {
                    if write.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(tungstenite::Error::ConnectionClosed) => break,
                Err(e) => return Err(RestoreError::Connection(format!("exec stream: {}", e))),
            }
        }

        buffers.finish()
    }

    /// Bound `fut` by the exec deadline and the governing cancellation token.
    async fn guarded<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RestoreError::Cancelled(operation.to_string())),
            result = tokio::time::timeout(self.timeout, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(RestoreError::Timeout {
                    operation: operation.to_string(),
                    timeout: self.timeout,
                }),
            },
        }
    }
}

impl RemoteExecutor for KubeExecutor {
    async fn execute(&self, command: &str) -> Result<ExecOutput> {
        debug!("exec in {}/{}: {}", self.settings.namespace, self.settings.pod_name, command);
        self.guarded(command, self.stream(command, None)).await
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let size = tokio::fs::metadata(local_path).await?.len();
        let command = format!("head -c {} > {}", size, shell_quote(remote_path));
        info!(
            "Uploading {} ({} bytes) to {}:{}",
            local_path.display(),
            size,
            self.settings.pod_name,
            remote_path
        );
        self.guarded(&command, self.stream(&command, Some(local_path))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::channel::{ERROR_CHANNEL, STDERR_CHANNEL, STDOUT_CHANNEL};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn frame(channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![channel];
        f.extend_from_slice(payload);
        f
    }

    fn test_config(api_server: String, container: Option<&str>) -> KubeConfig {
        KubeConfig {
            api_server,
            namespace: "iotdb".to_string(),
            pod_name: "iotdb-datanode-0".to_string(),
            container: container.map(str::to_string),
            exec_timeout_secs: 5,
            ..KubeConfig::default()
        }
    }

    /// Accepts one exec session, records the request URI, collects `expect_stdin`
    /// bytes from the client, then replies with `frames` and closes.
    async fn spawn_exec_server(
        frames: Vec<Vec<u8>>,
        expect_stdin: usize,
    ) -> (String, Arc<Mutex<String>>, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let uri = Arc::new(Mutex::new(String::new()));
        let uri_clone = Arc::clone(&uri);

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, mut resp: Response| -> std::result::Result<Response, ErrorResponse> {
                *uri_clone.lock().unwrap() = req.uri().to_string();
                resp.headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(EXEC_PROTOCOL));
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();

            let mut stdin = Vec::new();
            while stdin.len() < expect_stdin {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        assert_eq!(data[0], 0);
                        stdin.extend_from_slice(&data[1..]);
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }

            for f in frames {
                ws.send(Message::Binary(f.into())).await.unwrap();
            }
            let _ = ws.close(None).await;
            stdin
        });

        (format!("http://{}", addr), uri, handle)
    }

    #[tokio::test]
    async fn test_execute_captures_streams() {
        let (url, uri, handle) = spawn_exec_server(
            vec![
                frame(STDOUT_CHANNEL, b"Load successfully\n"),
                frame(STDERR_CHANNEL, b"notice\n"),
                frame(ERROR_CHANNEL, br#"{"status":"Success"}"#),
            ],
            0,
        )
        .await;

        let executor = KubeExecutor::new(&test_config(url, Some("iotdb")), CancellationToken::new());
        let output = executor.execute("echo hi").await.unwrap();
        handle.await.unwrap();

        assert_eq!(output.stdout, "Load successfully\n");
        assert_eq!(output.stderr, "notice\n");
        assert_eq!(output.exit_code, Some(0));

        let uri = uri.lock().unwrap().clone();
        assert!(uri.starts_with("/api/v1/namespaces/iotdb/pods/iotdb-datanode-0/exec?"));
        assert!(uri.contains("container=iotdb"));
        assert!(uri.contains("command=sh&command=-c&command=echo+hi"));
        assert!(uri.contains("stdin=false"));
    }

    #[tokio::test]
    async fn test_execute_reports_exit_code() {
        let (url, _, handle) = spawn_exec_server(
            vec![
                frame(STDERR_CHANNEL, b"no such file"),
                frame(
                    ERROR_CHANNEL,
                    br#"{"status":"Failure","reason":"NonZeroExitCode","details":{"causes":[{"reason":"ExitCode","message":"1"}]}}"#,
                ),
            ],
            0,
        )
        .await;

        let executor = KubeExecutor::new(&test_config(url, Some("iotdb")), CancellationToken::new());
        let err = executor.execute("tar -xzf missing").await.unwrap_err();
        handle.await.unwrap();

        match err {
            RestoreError::Command { exit_code, message, .. } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(message, "no such file");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_upload_streams_file_over_stdin() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let local = temp_dir.path().join("backup.tar.gz");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&local, &payload).unwrap();

        let (url, uri, handle) = spawn_exec_server(
            vec![frame(ERROR_CHANNEL, br#"{"status":"Success"}"#)],
            payload.len(),
        )
        .await;

        let executor = KubeExecutor::new(&test_config(url, Some("iotdb")), CancellationToken::new());
        executor.upload(&local, "/tmp/backup.tar.gz").await.unwrap();

        let received = handle.await.unwrap();
        assert_eq!(received, payload);
        let uri = uri.lock().unwrap().clone();
        assert!(uri.contains("stdin=true"));
        assert!(uri.contains("head+-c+200000"));
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |_: &Request, mut resp: Response| -> std::result::Result<Response, ErrorResponse> {
                resp.headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(EXEC_PROTOCOL));
                Ok(resp)
            };
            let _ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut executor = KubeExecutor::new(
            &test_config(format!("http://{}", addr), Some("iotdb")),
            CancellationToken::new(),
        );
        executor.timeout = Duration::from_millis(200);

        let err = executor.execute("sleep 600").await.unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        server.abort();
    }

    #[tokio::test]
    async fn test_execute_cancelled() {
        let cancel = CancellationToken::new();
        let executor = KubeExecutor::new(
            &test_config("http://127.0.0.1:9".to_string(), Some("iotdb")),
            cancel.clone(),
        );
        cancel.cancel();

        let err = executor.execute("true").await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_container_resolved_from_pod_spec() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/namespaces/iotdb/pods/iotdb-datanode-0")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"spec":{"containers":[{"name":"iotdb-datanode"},{"name":"sidecar"}]}}"#)
            .expect(1)
            .create_async()
            .await;

        let executor = KubeExecutor::new(&test_config(server.url(), None), CancellationToken::new());
        assert_eq!(executor.resolve_container().await.unwrap(), "iotdb-datanode");
        assert_eq!(executor.resolve_container().await.unwrap(), "iotdb-datanode");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_container_resolution_failure_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/namespaces/iotdb/pods/iotdb-datanode-0")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let executor = KubeExecutor::new(&test_config(server.url(), None), CancellationToken::new());

        let first = executor.execute("true").await.unwrap_err();
        let second = executor.execute("true").await.unwrap_err();
        assert!(matches!(first, RestoreError::Connection(ref m) if m.contains("500")), "{first:?}");
        assert!(matches!(second, RestoreError::Connection(ref m) if m.contains("500")), "{second:?}");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_pod_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/namespaces/iotdb/pods/iotdb-datanode-0")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let executor = KubeExecutor::new(&test_config(server.url(), None), CancellationToken::new());

        assert!(matches!(executor.execute("true").await, Err(RestoreError::NotFound(_))));
        assert!(matches!(executor.execute("true").await, Err(RestoreError::NotFound(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_api_server_is_a_connection_error() {
        let executor = KubeExecutor::new(
            &test_config("http://127.0.0.1:9".to_string(), None),
            CancellationToken::new(),
        );

        let first = executor.resolve_container().await.unwrap_err();
        let second = executor.resolve_container().await.unwrap_err();
        assert!(matches!(first, RestoreError::Connection(_)), "{first:?}");
        assert!(matches!(second, RestoreError::Connection(_)), "{second:?}");
    }

    #[tokio::test]
    async fn test_cluster_access_from_kubeconfig() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/namespaces/iotdb/pods/iotdb-datanode-0")
            .match_header("authorization", "Bearer lab-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"spec":{"containers":[{"name":"iotdb-datanode"}]}}"#)
            .create_async()
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let kubeconfig = dir.path().join("config");
        std::fs::write(
            &kubeconfig,
            format!(
                "current-context: lab\nclusters:\n- name: lab\n  cluster:\n    server: {}\ncontexts:\n- name: lab\n  context:\n    cluster: lab\n    user: lab\nusers:\n- name: lab\n  user:\n    token: lab-token\n",
                server.url()
            ),
        )
        .unwrap();
        let config = KubeConfig {
            kubeconfig: Some(kubeconfig),
            ..test_config(String::new(), None)
        };

        let executor = KubeExecutor::new(&config, CancellationToken::new());

        assert_eq!(executor.resolve_container().await.unwrap(), "iotdb-datanode");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bad_cluster_access_surfaces_on_first_use() {
        let config = KubeConfig {
            kubeconfig: Some(std::path::PathBuf::from("/nonexistent/kubeconfig")),
            ..test_config(String::new(), Some("iotdb"))
        };

        // Building never fails; the error shows up when a command runs
        let executor = KubeExecutor::new(&config, CancellationToken::new());

        assert!(matches!(executor.execute("true").await, Err(RestoreError::Config(_))));
        assert!(matches!(executor.execute("true").await, Err(RestoreError::Config(_))));
    }
}
