//! Resolving how to reach the Kubernetes API server.
//!
//! Sources are tried in this order:
//! 1. an explicit `kubernetes.api_server`
//! 2. the kubeconfig named by `kubernetes.kubeconfig` (`~` is expanded)
//! 3. in-cluster settings (`KUBERNETES_SERVICE_HOST` plus the service-account files)
//! 4. `$HOME/.kube/config`
//!
//! `token`, `token_file`, `ca_cert` and `insecure_skip_tls_verify` from the
//! configuration apply on top of whichever source was picked.

use crate::config::KubeConfig;
use crate::utils::{RestoreError, Result};
use base64::Engine;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Endpoint and credentials for the API server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAccess {
    pub api_server: String,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
}

impl ClusterAccess {
    pub fn resolve(config: &KubeConfig) -> Result<Self> {
        let access = if !config.api_server.trim().is_empty() {
            Self {
                api_server: config.api_server.clone(),
                token: None,
                ca_pem: None,
                insecure_skip_tls_verify: false,
            }
        } else if let Some(path) = &config.kubeconfig {
            let path = expand_home(path, home_dir());
            Self::from_kubeconfig(&path, config.context.as_deref())?
        } else if let Ok(host) = std::env::var("KUBERNETES_SERVICE_HOST") {
            Self::in_cluster(&host)?
        } else {
            match home_dir().map(|home| home.join(".kube").join("config")) {
                Some(path) if path.is_file() => Self::from_kubeconfig(&path, config.context.as_deref())?,
                _ => {
                    return Err(RestoreError::Config(
                        "no cluster access: set kubernetes.api_server or kubernetes.kubeconfig, \
                         run in-cluster, or provide ~/.kube/config"
                            .into(),
                    ))
                }
            }
        };

        access.with_overrides(config)
    }

    fn in_cluster(host: &str) -> Result<Self> {
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let sa_dir = PathBuf::from(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(sa_dir.join("token"))?.trim().to_string();
        let ca_pem = std::fs::read(sa_dir.join("ca.crt"))?;

        info!("Using in-cluster service account");
        Ok(Self {
            api_server: format!("https://{}:{}", host, port),
            token: Some(token),
            ca_pem: Some(ca_pem),
            insecure_skip_tls_verify: false,
        })
    }

    /// Read server, CA and bearer token for `context` (or the current
    /// context) from a kubeconfig file.
    pub fn from_kubeconfig(path: &Path, context: Option<&str>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RestoreError::Config(format!("cannot read kubeconfig {}: {}", path.display(), e)))?;
        let kubeconfig: Kubeconfig = serde_yaml::from_str(&content)
            .map_err(|e| RestoreError::Config(format!("invalid kubeconfig {}: {}", path.display(), e)))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let context_name = context
            .map(str::to_string)
            .or(kubeconfig.current_context)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                RestoreError::Config(format!("kubeconfig {} has no current-context", path.display()))
            })?;
        let context = kubeconfig
            .contexts
            .into_iter()
            .find(|c| c.name == context_name)
            .map(|c| c.context)
            .ok_or_else(|| RestoreError::Config(format!("context {} not found in kubeconfig", context_name)))?;

        let cluster = kubeconfig
            .clusters
            .into_iter()
            .find(|c| c.name == context.cluster)
            .map(|c| c.cluster)
            .ok_or_else(|| RestoreError::Config(format!("cluster {} not found in kubeconfig", context.cluster)))?;

        let ca_pem = match (cluster.certificate_authority_data, cluster.certificate_authority) {
            (Some(data), _) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|e| RestoreError::Config(format!("invalid certificate-authority-data: {}", e)))?,
            ),
            (None, Some(file)) => Some(std::fs::read(base_dir.join(file))?),
            (None, None) => None,
        };

        let user = match context.user {
            Some(name) => kubeconfig
                .users
                .into_iter()
                .find(|u| u.name == name)
                .map(|u| u.user)
                .ok_or_else(|| RestoreError::Config(format!("user {} not found in kubeconfig", name)))?,
            None => User::default(),
        };
        let token = match (user.token, user.token_file) {
            (Some(token), _) => Some(token),
            (None, Some(file)) => Some(std::fs::read_to_string(base_dir.join(file))?.trim().to_string()),
            (None, None) if user.client_certificate_data.is_some() || user.client_certificate.is_some() => {
                return Err(RestoreError::Config(format!(
                    "context {} authenticates with a client certificate; configure a bearer token instead",
                    context_name
                )));
            }
            (None, None) => None,
        };

        info!(kubeconfig = %path.display(), context = %context_name, server = %cluster.server, "Using kubeconfig");
        Ok(Self {
            api_server: cluster.server,
            token,
            ca_pem,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
        })
    }

    fn with_overrides(mut self, config: &KubeConfig) -> Result<Self> {
        self.api_server = self.api_server.trim_end_matches('/').to_string();
        if let Some(token) = &config.token {
            self.token = Some(token.clone());
        } else if let Some(path) = &config.token_file {
            self.token = Some(std::fs::read_to_string(path)?.trim().to_string());
        }
        if let Some(path) = &config.ca_cert {
            self.ca_pem = Some(std::fs::read(path)?);
        }
        self.insecure_skip_tls_verify |= config.insecure_skip_tls_verify;
        Ok(self)
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
}

/// Replace a leading `~` with `home`.
fn expand_home(path: &Path, home: Option<PathBuf>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: String,
    certificate_authority: Option<PathBuf>,
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: Context,
}

#[derive(Debug, Deserialize)]
struct Context {
    cluster: String,
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: User,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct User {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
    client_certificate: Option<PathBuf>,
    client_certificate_data: Option<String>,
}
