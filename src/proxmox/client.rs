use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{ClusterNode, StoragePool, StorageVolume, TaskStatus, Upid, VmOption, VmSummary};
use super::ProxmoxApi;
use crate::config::ProxmoxSettings;
use crate::errors::{ApiError, ApiResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
// tickets are valid for two hours, renew well before that
const TICKET_LIFETIME: Duration = Duration::from_secs(90 * 60);

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TicketResponse {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Debug, Clone)]
enum Auth {
    Anonymous,
    ApiToken(String),
    Credentials { username: String, password: String },
}

#[derive(Debug, Clone)]
struct Ticket {
    cookie: String,
    csrf_token: String,
    issued_at: Instant,
}

/// Body of a request, rebuilt for every attempt so a request can be replayed
/// after a ticket renewal.
enum Body<'a> {
    Empty,
    Form(&'a [(String, String)]),
    Upload {
        content: &'a str,
        filename: &'a str,
        data: &'a [u8],
    },
}

/// REST client for the Proxmox VE `api2/json` endpoint.
pub struct ProxmoxClient {
    http: reqwest::Client,
    base: Url,
    auth: Auth,
    ticket: Mutex<Option<Ticket>>,
}

impl ProxmoxClient {
    pub fn new(settings: &ProxmoxSettings) -> ApiResult<Self> {
        let mut base = Url::parse(&settings.url).map_err(|e| ApiError::InvalidEndpoint {
            url: settings.url.clone(),
            message: e.to_string(),
        })?;

        // accept both https://pve:8006 and https://pve:8006/api2/json
        if !base.path().trim_end_matches('/').ends_with("api2/json") {
            base.path_segments_mut()
                .map_err(|_| ApiError::InvalidEndpoint {
                    url: settings.url.clone(),
                    message: "URL cannot be used as a base".to_string(),
                })?
                .pop_if_empty()
                .extend(["api2", "json"]);
        }

        let auth = if !settings.username.is_empty() && !settings.password.is_empty() {
            let username = if settings.realm.is_empty() || settings.username.contains('@') {
                settings.username.clone()
            } else {
                format!("{}@{}", settings.username, settings.realm)
            };
            Auth::Credentials {
                username,
                password: settings.password.clone(),
            }
        } else if !settings.token.is_empty() {
            Auth::ApiToken(settings.token.clone())
        } else if !settings.token_id.is_empty() && !settings.token_secret.is_empty() {
            Auth::ApiToken(format!("{}={}", settings.token_id, settings.token_secret))
        } else {
            Auth::Anonymous
        };

        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if settings.insecure_skip_verify {
            info!("using insecure connection to Proxmox");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            http: builder.build()?,
            base,
            auth,
            ticket: Mutex::new(None),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidEndpoint {
                url: self.base.to_string(),
                message: "URL cannot be used as a base".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn login(&self, username: &str, password: &str) -> ApiResult<Ticket> {
        let url = self.endpoint(&["access", "ticket"])?;
        debug!(username, "requesting Proxmox ticket");

        let response = self
            .http
            .post(url)
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ApiError::Auth(format!(
                "ticket request for {username} returned {}",
                response.status()
            )));
        }

        let envelope: Envelope<TicketResponse> = response.json().await?;

        Ok(Ticket {
            cookie: format!("PVEAuthCookie={}", envelope.data.ticket),
            csrf_token: envelope.data.csrf_token,
            issued_at: Instant::now(),
        })
    }

    async fn authorize(&self, request: RequestBuilder, method: &Method) -> ApiResult<RequestBuilder> {
        match &self.auth {
            Auth::Anonymous => Ok(request),
            Auth::ApiToken(token) => {
                Ok(request.header("Authorization", format!("PVEAPIToken={token}")))
            }
            Auth::Credentials { username, password } => {
                let mut guard = self.ticket.lock().await;
                let expired = guard
                    .as_ref()
                    .map(|t| t.issued_at.elapsed() >= TICKET_LIFETIME)
                    .unwrap_or(true);
                if expired {
                    *guard = Some(self.login(username, password).await?);
                }
                let ticket = guard
                    .as_ref()
                    .ok_or_else(|| ApiError::Auth("no ticket available".to_string()))?;

                let mut request = request.header("Cookie", ticket.cookie.clone());
                if *method != Method::GET {
                    request = request.header("CSRFPreventionToken", ticket.csrf_token.clone());
                }
                Ok(request)
            }
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: Body<'_>,
    ) -> ApiResult<T> {
        let url = self.endpoint(segments)?;
        let path = url.path().to_string();

        let mut renewed = false;
        loop {
            let mut request = self.http.request(method.clone(), url.clone());
            request = match &body {
                Body::Empty => request,
                Body::Form(fields) => request.form(fields),
                Body::Upload {
                    content,
                    filename,
                    data,
                } => {
                    let part = Part::bytes(data.to_vec())
                        .file_name(filename.to_string())
                        .mime_str("application/octet-stream")?;
                    request.multipart(Form::new().text("content", content.to_string()).part("filename", part))
                }
            };
            let request = self.authorize(request, &method).await?;

            debug!(%method, path, "Proxmox API request");
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED
                && !renewed
                && matches!(self.auth, Auth::Credentials { .. })
            {
                warn!(path, "Proxmox ticket rejected, logging in again");
                *self.ticket.lock().await = None;
                renewed = true;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::Status {
                    method: method.to_string(),
                    path,
                    status: status.as_u16(),
                    body,
                });
            }

            let envelope: Envelope<T> =
                response.json().await.map_err(|e| ApiError::Decode {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            return Ok(envelope.data);
        }
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> ApiResult<T> {
        self.call(Method::GET, segments, Body::Empty).await
    }
}

fn form(options: &[VmOption]) -> Vec<(String, String)> {
    options
        .iter()
        .map(|o| (o.name.clone(), o.value.clone()))
        .collect()
}

#[async_trait]
impl ProxmoxApi for ProxmoxClient {
    async fn nodes(&self) -> ApiResult<Vec<ClusterNode>> {
        self.get(&["nodes"]).await
    }

    async fn virtual_machines(&self, node: &str) -> ApiResult<Vec<VmSummary>> {
        self.get(&["nodes", node, "qemu"]).await
    }

    async fn storages(&self, node: &str) -> ApiResult<Vec<StoragePool>> {
        self.get(&["nodes", node, "storage"]).await
    }

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
        content: &str,
    ) -> ApiResult<Vec<StorageVolume>> {
        let volumes: Vec<StorageVolume> = self.get(&["nodes", node, "storage", storage, "content"]).await?;
        // the content filter is applied here so that the query string does not
        // have to be threaded through `call`
        let prefix = format!("{storage}:{content}/");
        Ok(volumes
            .into_iter()
            .filter(|v| v.volid.starts_with(&prefix))
            .collect())
    }

    async fn download_url(
        &self,
        node: &str,
        storage: &str,
        content: &str,
        filename: &str,
        url: &str,
    ) -> ApiResult<Upid> {
        let fields = vec![
            ("content".to_string(), content.to_string()),
            ("filename".to_string(), filename.to_string()),
            ("url".to_string(), url.to_string()),
        ];
        self.call(
            Method::POST,
            &["nodes", node, "storage", storage, "download-url"],
            Body::Form(&fields),
        )
        .await
    }

    async fn upload_file(
        &self,
        node: &str,
        storage: &str,
        content: &str,
        filename: &str,
        data: Vec<u8>,
    ) -> ApiResult<Upid> {
        self.call(
            Method::POST,
            &["nodes", node, "storage", storage, "upload"],
            Body::Upload {
                content,
                filename,
                data: &data,
            },
        )
        .await
    }

    async fn next_vmid(&self) -> ApiResult<u32> {
        let raw: serde_json::Value = self.get(&["cluster", "nextid"]).await?;
        let parsed = match &raw {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        };
        parsed.ok_or_else(|| ApiError::Decode {
            path: "/cluster/nextid".to_string(),
            message: format!("unexpected vmid {raw}"),
        })
    }

    async fn create_vm(&self, node: &str, vmid: u32, options: &[VmOption]) -> ApiResult<Upid> {
        let mut fields = vec![("vmid".to_string(), vmid.to_string())];
        fields.extend(form(options));
        self.call(Method::POST, &["nodes", node, "qemu"], Body::Form(&fields))
            .await
    }

    async fn update_vm_config(&self, node: &str, vmid: u32, options: &[VmOption]) -> ApiResult<()> {
        let vmid = vmid.to_string();
        let fields = form(options);
        let _: serde_json::Value = self
            .call(
                Method::PUT,
                &["nodes", node, "qemu", &vmid, "config"],
                Body::Form(&fields),
            )
            .await?;
        Ok(())
    }

    async fn virtual_machine(&self, node: &str, vmid: u32) -> ApiResult<VmSummary> {
        // The status endpoint answers a missing VM with a bare 500, so look the
        // VM up in the node listing instead.
        self.virtual_machines(node)
            .await?
            .into_iter()
            .find(|vm| vm.vmid == vmid)
            .ok_or_else(|| ApiError::NotFound {
                resource: format!("VM {vmid} on node {node}"),
            })
    }

    async fn start_vm(&self, node: &str, vmid: u32) -> ApiResult<Upid> {
        let vmid = vmid.to_string();
        self.call(
            Method::POST,
            &["nodes", node, "qemu", &vmid, "status", "start"],
            Body::Empty,
        )
        .await
    }

    async fn stop_vm(&self, node: &str, vmid: u32) -> ApiResult<Upid> {
        let vmid = vmid.to_string();
        self.call(
            Method::POST,
            &["nodes", node, "qemu", &vmid, "status", "stop"],
            Body::Empty,
        )
        .await
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> ApiResult<Upid> {
        let vmid = vmid.to_string();
        self.call(Method::DELETE, &["nodes", node, "qemu", &vmid], Body::Empty)
            .await
    }

    async fn task_status(&self, upid: &Upid) -> ApiResult<TaskStatus> {
        let node = upid.node().map_err(|e| ApiError::Decode {
            path: "tasks".to_string(),
            message: e.to_string(),
        })?;
        self.get(&["nodes", node, "tasks", upid.as_str(), "status"])
            .await
    }
}
