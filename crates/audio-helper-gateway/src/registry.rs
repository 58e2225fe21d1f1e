//! Nacos service-registry announcement.
//!
//! Registration is best-effort: every failure is logged and the server keeps
//! running. Instances are ephemeral, so a heartbeat keeps them alive.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use audio_helper_core::config::{RegistryConfig, ServerConfig};
use audio_helper_core::error::{AudioHelperError, Result};

const CLUSTER_NAME: &str = "DEFAULT";
const INSTANCE_VERSION: &str = "1.0.0";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginReply {
    access_token: String,
}

/// Announces this server instance to a Nacos naming service.
pub struct RegistryAnnouncer {
    client: reqwest::Client,
    base_url: String,
    settings: RegistryConfig,
    service_name: String,
    ip: String,
    port: u16,
    access_token: RwLock<Option<String>>,
}

impl RegistryAnnouncer {
    /// Build an announcer, or `None` when no registry address is configured.
    pub async fn new(settings: RegistryConfig, server: &ServerConfig) -> Option<Self> {
        let address = settings.server_address.clone()?;
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };

        let service_name = settings
            .service_name
            .clone()
            .unwrap_or_else(|| server.name.clone());
        let ip = match settings.ip.clone() {
            Some(ip) => ip,
            None => advertised_ip(&server.host, &address)
                .await
                .unwrap_or_else(|| "127.0.0.1".to_string()),
        };
        let port = settings.port.unwrap_or(server.port);

        Some(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            base_url,
            settings,
            service_name,
            ip,
            port,
            access_token: RwLock::new(None),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn instance(&self) -> (&str, u16) {
        (&self.ip, self.port)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Query parameters identifying this instance.
    fn instance_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("serviceName", self.service_name.clone()),
            ("ip", self.ip.clone()),
            ("port", self.port.to_string()),
            ("clusterName", CLUSTER_NAME.to_string()),
            ("ephemeral", "true".to_string()),
        ];
        if let Some(namespace) = &self.settings.namespace {
            params.push(("namespaceId", namespace.clone()));
        }
        params
    }

    async fn with_token(&self, mut params: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        if let Some(token) = self.access_token.read().await.clone() {
            params.push(("accessToken", token));
        }
        params
    }

    /// Fetch an access token when credentials are configured.
    async fn login(&self) -> Result<()> {
        let (Some(username), Some(password)) = (&self.settings.username, &self.settings.password)
        else {
            return Ok(());
        };

        let resp = self
            .client
            .post(self.url("/nacos/v1/auth/login"))
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .map_err(announcement_error)?;
        let resp = check(resp, "login").await?;
        let reply: LoginReply = resp.json().await.map_err(announcement_error)?;
        *self.access_token.write().await = Some(reply.access_token);
        debug!("Registry login succeeded");
        Ok(())
    }

    /// Register the instance (logging in first if credentials are set).
    pub async fn register(&self) -> Result<()> {
        self.login().await?;

        let mut params = self.instance_params();
        params.extend([
            ("weight", "1.0".to_string()),
            ("healthy", "true".to_string()),
            ("enabled", "true".to_string()),
            (
                "metadata",
                serde_json::json!({ "version": INSTANCE_VERSION }).to_string(),
            ),
        ]);
        let params = self.with_token(params).await;

        let resp = self
            .client
            .post(self.url("/nacos/v1/ns/instance"))
            .query(&params)
            .send()
            .await
            .map_err(announcement_error)?;
        check(resp, "register").await?;

        info!(
            service = %self.service_name,
            ip = %self.ip,
            port = self.port,
            "Registered with service registry"
        );
        Ok(())
    }

    /// Send one heartbeat for the ephemeral instance.
    pub async fn beat(&self) -> Result<()> {
        let beat = serde_json::json!({
            "serviceName": self.service_name,
            "ip": self.ip,
            "port": self.port,
            "cluster": CLUSTER_NAME,
            "weight": 1.0,
            "metadata": { "version": INSTANCE_VERSION },
        });
        let mut params = self.instance_params();
        params.push(("beat", beat.to_string()));
        let params = self.with_token(params).await;

        let resp = self
            .client
            .put(self.url("/nacos/v1/ns/instance/beat"))
            .query(&params)
            .send()
            .await
            .map_err(announcement_error)?;
        check(resp, "beat").await?;
        Ok(())
    }

    /// Remove the instance from the registry.
    pub async fn deregister(&self) -> Result<()> {
        let params = self.with_token(self.instance_params()).await;
        let resp = self
            .client
            .delete(self.url("/nacos/v1/ns/instance"))
            .query(&params)
            .send()
            .await
            .map_err(announcement_error)?;
        check(resp, "deregister").await?;
        info!(service = %self.service_name, "Deregistered from service registry");
        Ok(())
    }

    /// Beat every `beat_interval_secs` until `cancel` fires.
    pub fn spawn_heartbeat(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.settings.beat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.beat().await {
                            warn!(error = %e, "Registry heartbeat failed");
                        }
                    }
                }
            }
            debug!("Registry heartbeat stopped");
        })
    }
}

fn announcement_error(e: reqwest::Error) -> AudioHelperError {
    AudioHelperError::RegistryAnnouncementFailure(e.to_string())
}

async fn check(resp: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(AudioHelperError::RegistryAnnouncementFailure(format!(
            "{action} returned {status}: {body}"
        )));
    }
    Ok(resp)
}

/// Address to advertise: the bind host unless it is a wildcard, else the local
/// address the OS would route towards the registry.
async fn advertised_ip(bind_host: &str, registry_address: &str) -> Option<String> {
    if bind_host != "0.0.0.0" && bind_host != "::" && !bind_host.is_empty() {
        return Some(bind_host.to_string());
    }
    let host_port = registry_address
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    let target = tokio::net::lookup_host(host_port).await.ok()?.next()?;
    let socket = tokio::net::UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
    socket.connect(target).await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

/// A live registration and its heartbeat task.
pub struct Announcement {
    announcer: Arc<RegistryAnnouncer>,
    cancel: CancellationToken,
    heartbeat: JoinHandle<()>,
}

impl Announcement {
    pub fn announcer(&self) -> &RegistryAnnouncer {
        &self.announcer
    }

    /// Stop the heartbeat, wait for any in-flight beat, then deregister.
    pub async fn withdraw(self) -> Result<()> {
        self.cancel.cancel();
        if let Err(e) = self.heartbeat.await {
            warn!(error = %e, "Registry heartbeat task ended abnormally");
        }
        self.announcer.deregister().await
    }
}

/// Register with the registry if one is configured and start the heartbeat.
///
/// Failures are logged; `None` means there is nothing to withdraw later.
pub async fn announce(
    settings: Option<RegistryConfig>,
    server: &ServerConfig,
) -> Option<Announcement> {
    let announcer = Arc::new(RegistryAnnouncer::new(settings?, server).await?);
    match announcer.register().await {
        Ok(()) => {
            let cancel = CancellationToken::new();
            let heartbeat = announcer.clone().spawn_heartbeat(cancel.clone());
            Some(Announcement {
                announcer,
                cancel,
                heartbeat,
            })
        }
        Err(e) => {
            warn!(error = %e, "Service registry announcement failed, continuing without it");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::Router;
    use axum::routing::{post, put};

    type Journal = Arc<Mutex<Vec<&'static str>>>;

    fn settings(address: &str) -> RegistryConfig {
        RegistryConfig {
            server_address: Some(address.into()),
            beat_interval_secs: 5,
            ..RegistryConfig::default()
        }
    }

    /// Minimal naming service that journals instance calls; beats take 300 ms.
    async fn naming_service(journal: Journal) -> String {
        let record = |entry: &'static str, journal: &Journal| {
            let journal = journal.clone();
            move || {
                let journal = journal.clone();
                async move {
                    journal.lock().unwrap().push(entry);
                    "ok"
                }
            }
        };
        let beat = {
            let journal = journal.clone();
            move || {
                let journal = journal.clone();
                async move {
                    journal.lock().unwrap().push("beat-start");
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    journal.lock().unwrap().push("beat-done");
                    "ok"
                }
            }
        };
        let app = Router::new()
            .route(
                "/nacos/v1/ns/instance",
                post(record("register", &journal)).delete(record("deregister", &journal)),
            )
            .route("/nacos/v1/ns/instance/beat", put(beat));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        address
    }

    #[tokio::test]
    async fn test_no_address_means_no_announcer() {
        let announcer =
            RegistryAnnouncer::new(RegistryConfig::default(), &ServerConfig::default()).await;
        assert!(announcer.is_none());
    }

    #[tokio::test]
    async fn test_defaults_come_from_server_config() {
        let server = ServerConfig {
            name: "audio-helper-server".into(),
            host: "10.0.0.7".into(),
            port: 7500,
        };
        let announcer = RegistryAnnouncer::new(settings("nacos:8848"), &server)
            .await
            .unwrap();
        assert_eq!(announcer.base_url, "http://nacos:8848");
        assert_eq!(announcer.service_name(), "audio-helper-server");
        assert_eq!(announcer.instance(), ("10.0.0.7", 7500));
    }

    #[tokio::test]
    async fn test_explicit_instance_overrides() {
        let mut registry = settings("https://nacos.internal/");
        registry.service_name = Some("asr-tts".into());
        registry.ip = Some("192.168.1.20".into());
        registry.port = Some(9000);
        registry.namespace = Some("prod".into());

        let announcer = RegistryAnnouncer::new(registry, &ServerConfig::default())
            .await
            .unwrap();
        assert_eq!(announcer.base_url, "https://nacos.internal");
        assert_eq!(announcer.instance(), ("192.168.1.20", 9000));
        let params = announcer.instance_params();
        assert!(params.contains(&("namespaceId", "prod".to_string())));
        assert!(params.contains(&("clusterName", "DEFAULT".to_string())));
    }

    #[tokio::test]
    async fn test_wildcard_bind_advertises_routable_address() {
        let ip = advertised_ip("0.0.0.0", "http://127.0.0.1:8848").await;
        assert_eq!(ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(advertised_ip("10.1.2.3", "nacos:8848").await.as_deref(), Some("10.1.2.3"));
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_not_fatal() {
        let announcement = announce(Some(settings("127.0.0.1:1")), &ServerConfig::default()).await;
        assert!(announcement.is_none());
    }

    #[tokio::test]
    async fn test_withdraw_waits_for_in_flight_beat() {
        let journal = Journal::default();
        let address = naming_service(journal.clone()).await;
        let mut registry = settings(&address);
        registry.beat_interval_secs = 1;
        registry.ip = Some("127.0.0.1".into());

        let announcement = announce(Some(registry), &ServerConfig::default())
            .await
            .expect("registration should succeed");
        assert_eq!(announcement.announcer().instance().0, "127.0.0.1");

        for _ in 0..60 {
            if journal.lock().unwrap().contains(&"beat-start") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        announcement.withdraw().await.unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["register", "beat-start", "beat-done", "deregister"]
        );
    }
}
