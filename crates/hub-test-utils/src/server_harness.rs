//! Test server harness for E2E testing
//!
//! Provides `TestHubServer` for spawning a real, initialized orchestrator
//! (collector listener included) in tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry_hub::config::Config;
use telemetry_hub::orchestrator::bridge::MetricsSink;
use telemetry_hub::orchestrator::ShutdownReport;
use telemetry_hub::Orchestrator;

/// Services every test hub allows.
pub const TEST_KNOWN_SERVICES: &str = "reply_bot,admin_api,memory_service";

/// Test harness for spawning a Telemetry Hub in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health_flow_e2e() -> Result<()> {
///     let server = TestHubServer::spawn().await?;
///     let client = reqwest::Client::new();
///
///     let response = client
///         .get(&format!("{}/health", server.url()))
///         .send()
///         .await?;
///
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestHubServer {
    addr: SocketAddr,
    orchestrator: Arc<Orchestrator>,
}

impl TestHubServer {
    /// Spawn a hub with auto-discovery disabled and the default allow-list.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(&[]).await
    }

    /// Spawn a hub with extra configuration variables.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the collector, health poller and (if configured) bridge
    ///
    /// `overrides` are applied on top of the test defaults, so a test can
    /// re-enable auto-discovery or shorten intervals.
    pub async fn spawn_with(overrides: &[(&str, &str)]) -> Result<Self, anyhow::Error> {
        Self::build(overrides, None).await
    }

    /// Spawn a hub whose metrics bridge pushes into `sink`.
    pub async fn spawn_with_sink(
        overrides: &[(&str, &str)],
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, anyhow::Error> {
        Self::build(overrides, Some(sink)).await
    }

    async fn build(
        overrides: &[(&str, &str)],
        sink: Option<Arc<dyn MetricsSink>>,
    ) -> Result<Self, anyhow::Error> {
        let config = test_config(overrides)?;

        let mut orchestrator = Orchestrator::new(config, None);
        if let Some(sink) = sink {
            orchestrator = orchestrator.with_bridge_sink(sink);
        }
        let orchestrator = Arc::new(orchestrator);

        let addr = orchestrator
            .initialize()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize test hub: {}", e))?;

        Ok(Self { addr, orchestrator })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the orchestrator driving this server.
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// Run the orchestrator's shutdown sequence.
    pub async fn shutdown(&self) -> Result<ShutdownReport, anyhow::Error> {
        self.orchestrator
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to shut down test hub: {}", e))
    }
}

/// Build a test configuration: loopback listener, auto-discovery off,
/// fixed instance label, then `overrides`.
pub fn test_config(overrides: &[(&str, &str)]) -> Result<Config, anyhow::Error> {
    let mut vars = HashMap::from([
        ("HUB_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
        ("HUB_ENVIRONMENT".to_string(), "test".to_string()),
        ("HUB_INSTANCE_ID".to_string(), "hub-test".to_string()),
        ("HUB_AUTO_DISCOVERY".to_string(), "false".to_string()),
        (
            "HUB_KNOWN_SERVICES".to_string(),
            TEST_KNOWN_SERVICES.to_string(),
        ),
    ]);
    for (key, value) in overrides {
        vars.insert((*key).to_string(), (*value).to_string());
    }

    Config::from_vars(&vars).map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))
}
