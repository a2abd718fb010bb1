/// REST client for the hypervisor API.
///
/// Construction validates the credential choice (token wins over password,
/// a malformed token_id fails fast). `connect` probes the configured
/// endpoints in order and pins the first responsive one for the remainder
/// of the cycle. Read and dispatch requests retry transport failures per
/// the configured policy; authentication rejections are never retried.
use crate::api::endpoint::Endpoint;
use crate::api::{
    ClusterTask, GuestConfig, GuestSummary, HaStatusEntry, MigrationRequest, NodeStatus,
    NodeSummary, PressureWire, ProxmoxApi, TaskStatus, VersionInfo,
};
use crate::config::ApiSection;
use crate::error::{BalancerError, Result};
use crate::inventory::GuestKind;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// All API payloads arrive wrapped in a `data` envelope.
#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Clone)]
enum Credentials {
    Token { header: String },
    Password { user: String, pass: String },
}

#[derive(Debug, Clone)]
struct Ticket {
    cookie: String,
    csrf: String,
}

#[derive(Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Debug)]
pub struct ProxmoxClient {
    http: reqwest::Client,
    endpoints: Vec<Endpoint>,
    active: RwLock<Option<String>>,
    credentials: Credentials,
    ticket: RwLock<Option<Ticket>>,
    retries: u32,
    wait_time: Duration,
}

impl ProxmoxClient {
    pub fn new(config: &ApiSection) -> Result<Self> {
        let endpoints = config
            .hosts
            .iter()
            .map(|h| Endpoint::parse(h))
            .collect::<Result<Vec<_>>>()?;
        if endpoints.is_empty() {
            return Err(BalancerError::Config("no API endpoints configured".into()));
        }

        let credentials = match (&config.token_id, &config.token_secret) {
            (Some(token_id), Some(secret)) => {
                if token_id.contains('@') || token_id.contains('!') {
                    return Err(BalancerError::Auth(format!(
                        "token_id '{}' must be the bare token name, not 'user@realm!token'",
                        token_id
                    )));
                }
                if config.pass.is_some() {
                    warn!("both password and API token configured; using the token");
                }
                Credentials::Token {
                    header: format!(
                        "PVEAPIToken={}!{}={}",
                        config.user, token_id, secret
                    ),
                }
            }
            _ => match &config.pass {
                Some(pass) => Credentials::Password {
                    user: config.user.clone(),
                    pass: pass.clone(),
                },
                None => {
                    return Err(BalancerError::Config(
                        "either a password or an API token must be configured".into(),
                    ));
                }
            },
        };

        let mut headers = reqwest::header::HeaderMap::new();
        if let Credentials::Token { header } = &credentials {
            let value = reqwest::header::HeaderValue::from_str(header).map_err(|_| {
                BalancerError::Auth("API token contains invalid header characters".into())
            })?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout_duration())
            .danger_accept_invalid_certs(!config.ssl_verification)
            .build()
            .map_err(|e| BalancerError::Transport(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoints,
            active: RwLock::new(None),
            credentials,
            ticket: RwLock::new(None),
            retries: config.retries,
            wait_time: config.wait_duration(),
        })
    }

    /// Credential scheme in use, for startup logging.
    pub fn auth_scheme(&self) -> &'static str {
        match self.credentials {
            Credentials::Token { .. } => "token",
            Credentials::Password { .. } => "password",
        }
    }

    /// Probe the endpoint list and pin the first responsive one.
    pub async fn connect(&self) -> Result<()> {
        let mut last_err: Option<BalancerError> = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.wait_time).await;
            }
            for endpoint in &self.endpoints {
                let base = endpoint.base_url();
                match self.probe(&base).await {
                    Ok(()) => {
                        debug!("active API endpoint: {}", endpoint);
                        *self.active.write().await = Some(base);
                        return Ok(());
                    }
                    Err(e @ BalancerError::Auth(_)) => return Err(e),
                    Err(e) => {
                        warn!("API endpoint {} unreachable: {}", endpoint, e);
                        last_err = Some(e);
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| BalancerError::Transport("no API endpoint reachable".into())))
    }

    async fn probe(&self, base: &str) -> Result<()> {
        match &self.credentials {
            Credentials::Token { .. } => {
                let url = format!("{}/version", base);
                let response = self.http.get(&url).send().await?;
                self.check_status(response.status())?;
                Ok(())
            }
            Credentials::Password { .. } => self.login(base).await,
        }
    }

    /// Acquire an authentication ticket; doubles as the endpoint probe for
    /// password credentials.
    async fn login(&self, base: &str) -> Result<()> {
        let (user, pass) = match &self.credentials {
            Credentials::Password { user, pass } => (user.clone(), pass.clone()),
            Credentials::Token { .. } => return Ok(()),
        };
        let url = format!("{}/access/ticket", base);
        let response = self
            .http
            .post(&url)
            .form(&[("username", user), ("password", pass)])
            .send()
            .await?;
        self.check_status(response.status())?;
        let envelope: Envelope<TicketData> = response
            .json()
            .await
            .map_err(|e| BalancerError::Serialization(format!("ticket response: {}", e)))?;
        let data = envelope
            .data
            .ok_or_else(|| BalancerError::Auth("empty ticket response".into()))?;
        *self.ticket.write().await = Some(Ticket {
            cookie: data.ticket,
            csrf: data.csrf_token,
        });
        Ok(())
    }

    fn check_status(&self, status: StatusCode) -> Result<()> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BalancerError::Auth(format!("API rejected request: {}", status)));
        }
        if !status.is_success() {
            return Err(BalancerError::Transport(format!("API returned {}", status)));
        }
        Ok(())
    }

    async fn active_base(&self) -> Result<String> {
        self.active
            .read()
            .await
            .clone()
            .ok_or_else(|| BalancerError::Transport("API client is not connected".into()))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, None).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: Vec<(&'static str, String)>,
    ) -> Result<T> {
        self.request(Method::POST, path, Some(form)).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: Option<Vec<(&'static str, String)>>,
    ) -> Result<T> {
        let base = self.active_base().await?;
        let url = format!("{}{}", base, path);
        let mut last_err: Option<BalancerError> = None;
        let mut reticketed = false;
        let mut attempt = 0;
        while attempt <= self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.wait_time).await;
            }
            match self.send_once(&method, &url, form.as_deref()).await {
                Ok(value) => return Ok(value),
                Err(BalancerError::Auth(msg)) => {
                    // A stale ticket earns one re-login; tokens never retry.
                    let password_auth =
                        matches!(self.credentials, Credentials::Password { .. });
                    if password_auth && !reticketed {
                        reticketed = true;
                        self.login(&base).await?;
                        continue;
                    }
                    return Err(BalancerError::Auth(msg));
                }
                Err(e) => {
                    debug!("API request {} failed (attempt {}): {}", path, attempt + 1, e);
                    last_err = Some(e);
                }
            }
            attempt += 1;
        }
        Err(last_err
            .unwrap_or_else(|| BalancerError::Transport(format!("request to {} failed", path))))
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: &Method,
        url: &str,
        form: Option<&[(&'static str, String)]>,
    ) -> Result<T> {
        let mut request = self.http.request(method.clone(), url);
        if matches!(self.credentials, Credentials::Password { .. }) {
            if let Some(ticket) = self.ticket.read().await.as_ref() {
                request = request.header(
                    reqwest::header::COOKIE,
                    format!("PVEAuthCookie={}", ticket.cookie),
                );
                if *method != Method::GET {
                    request = request.header("CSRFPreventionToken", ticket.csrf.clone());
                }
            }
        }
        if let Some(form) = form {
            request = request.form(form);
        }

        debug!("API request: {} {}", method, url);
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            // Capture the upstream payload for debug output before mapping.
            let body = response.text().await.unwrap_or_default();
            if !body.is_empty() {
                debug!("API error payload: {}", body);
            }
            self.check_status(status)?;
            return Err(BalancerError::Transport(format!("API returned {}", status)));
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| BalancerError::Serialization(format!("API response: {}", e)))?;
        envelope
            .data
            .ok_or_else(|| BalancerError::Transport(format!("empty API response from {}", url)))
    }
}

fn kind_segment(kind: GuestKind) -> &'static str {
    match kind {
        GuestKind::Vm => "qemu",
        GuestKind::Ct => "lxc",
    }
}

#[derive(Deserialize)]
struct RrdSample {
    #[serde(default, deserialize_with = "crate::api::lenient_opt_f64")]
    cpu: Option<f64>,
}

#[derive(Deserialize)]
struct GuestStatusData {
    #[serde(default)]
    pressure: Option<PressureWire>,
}

#[derive(Deserialize)]
struct PoolData {
    #[serde(default)]
    members: Vec<PoolMember>,
}

#[derive(Deserialize)]
struct PoolMember {
    #[serde(default, deserialize_with = "crate::api::lenient_opt_u32")]
    vmid: Option<u32>,
}

#[async_trait]
impl ProxmoxApi for ProxmoxClient {
    async fn version(&self) -> Result<VersionInfo> {
        self.get_json("/version").await
    }

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>> {
        self.get_json("/nodes").await
    }

    async fn node_status(&self, node: &str) -> Result<NodeStatus> {
        self.get_json(&format!("/nodes/{}/status", node)).await
    }

    async fn list_guests(&self, node: &str, kind: GuestKind) -> Result<Vec<GuestSummary>> {
        self.get_json(&format!("/nodes/{}/{}", node, kind_segment(kind))).await
    }

    async fn guest_config(&self, node: &str, kind: GuestKind, vmid: u32) -> Result<GuestConfig> {
        self.get_json(&format!("/nodes/{}/{}/{}/config", node, kind_segment(kind), vmid))
            .await
    }

    async fn guest_rrd_cpu(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<Option<f64>> {
        let samples: Vec<RrdSample> = self
            .get_json(&format!(
                "/nodes/{}/{}/{}/rrddata?timeframe=hour",
                node,
                kind_segment(kind),
                vmid
            ))
            .await?;
        let values: Vec<f64> = samples.iter().filter_map(|s| s.cpu).collect();
        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
    }

    async fn guest_pressure(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<Option<PressureWire>> {
        let status: GuestStatusData = self
            .get_json(&format!(
                "/nodes/{}/{}/{}/status/current",
                node,
                kind_segment(kind),
                vmid
            ))
            .await?;
        Ok(status.pressure)
    }

    async fn ha_state(&self) -> Result<Vec<HaStatusEntry>> {
        self.get_json("/cluster/ha/status/current").await
    }

    async fn pool_members(&self, pool: &str) -> Result<Vec<u32>> {
        let data: PoolData = self.get_json(&format!("/pools/{}", pool)).await?;
        Ok(data.members.iter().filter_map(|m| m.vmid).collect())
    }

    async fn migrate(&self, request: &MigrationRequest) -> Result<String> {
        let path = format!(
            "/nodes/{}/{}/{}/migrate",
            request.node,
            kind_segment(request.kind),
            request.vmid
        );
        let mut form: Vec<(&'static str, String)> =
            vec![("target", request.target.clone())];
        match request.kind {
            GuestKind::Vm => {
                if request.online {
                    form.push(("online", "1".into()));
                    if request.with_local_disks {
                        form.push(("with-local-disks", "1".into()));
                    }
                    if request.with_conntrack_state {
                        form.push(("with-conntrack-state", "1".into()));
                    }
                }
            }
            GuestKind::Ct => {
                // The API performs shutdown-move-start for containers.
                form.push(("restart", "1".into()));
            }
        }
        self.post_form(&path, form).await
    }

    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus> {
        self.get_json(&format!("/nodes/{}/tasks/{}/status", node, upid)).await
    }

    async fn cluster_tasks(&self) -> Result<Vec<ClusterTask>> {
        self.get_json("/cluster/tasks").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_section(hosts: Vec<String>) -> ApiSection {
        ApiSection {
            hosts,
            user: "root@pam".into(),
            pass: None,
            token_id: Some("balancer".into()),
            token_secret: Some("secret".into()),
            ssl_verification: true,
            timeout: 5,
            retries: 1,
            wait_time: 0,
        }
    }

    #[test]
    fn test_token_id_validation() {
        let mut section = api_section(vec!["pve1".into()]);
        section.token_id = Some("root@pam!balancer".into());
        let err = ProxmoxClient::new(&section).unwrap_err();
        assert!(matches!(err, BalancerError::Auth(_)));
    }

    #[test]
    fn test_token_wins_over_password() {
        let mut section = api_section(vec!["pve1".into()]);
        section.pass = Some("hunter2".into());
        let client = ProxmoxClient::new(&section).unwrap();
        assert_eq!(client.auth_scheme(), "token");
    }

    #[test]
    fn test_missing_credentials() {
        let mut section = api_section(vec!["pve1".into()]);
        section.token_id = None;
        section.token_secret = None;
        assert!(ProxmoxClient::new(&section).is_err());
    }

    #[tokio::test]
    async fn test_version_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"version": "8.2.4", "release": "8.2"}
            })))
            .mount(&server)
            .await;

        let client = ProxmoxClient::new(&api_section(vec![server.uri()])).unwrap();
        client.connect().await.unwrap();
        let version = client.version().await.unwrap();
        assert_eq!(version.major(), 8);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"version": "8.2.4"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"node": "pve1", "status": "online", "maxcpu": 8,
                          "maxmem": 68719476736u64, "mem": 17179869184u64}]
            })))
            .mount(&server)
            .await;

        let client = ProxmoxClient::new(&api_section(vec![server.uri()])).unwrap();
        client.connect().await.unwrap();
        let nodes = client.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node, "pve1");
    }

    #[tokio::test]
    async fn test_endpoint_failover() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"version": "9.0.3"}
            })))
            .mount(&server)
            .await;

        // First endpoint refuses connections; the probe moves on.
        let hosts = vec!["http://127.0.0.1:1".into(), server.uri()];
        let client = ProxmoxClient::new(&api_section(hosts)).unwrap();
        client.connect().await.unwrap();
        assert_eq!(client.version().await.unwrap().major(), 9);
    }

    #[tokio::test]
    async fn test_migrate_dispatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"version": "8.2.4"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve1/qemu/101/migrate"))
            .and(body_string_contains("target=pve2"))
            .and(body_string_contains("online=1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": "UPID:pve1:00001234:00000000:00000000:qmigrate:101:root@pam:"
            })))
            .mount(&server)
            .await;

        let client = ProxmoxClient::new(&api_section(vec![server.uri()])).unwrap();
        client.connect().await.unwrap();
        let upid = client
            .migrate(&MigrationRequest {
                kind: GuestKind::Vm,
                node: "pve1".into(),
                vmid: 101,
                target: "pve2".into(),
                online: true,
                with_local_disks: true,
                with_conntrack_state: false,
            })
            .await
            .unwrap();
        assert!(upid.contains("qmigrate"));
    }
}
