//! WebSocket Anchor Server
//!
//! Async WebSocket server exposing the service operations.
//!
//! ```text
//! accept loop ──► per-connection task ──► dispatch ──► IotService
//!                    │      ▲                              │
//!                    │      └──── mpsc writer ◄────────────┤
//!                    └── event bus subscription ◄──────────┘
//! ```
//!
//! A background task evicts idle connections and runs service maintenance.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::network::auth::{authorize_operator, AuthConfig};
use crate::network::protocol::{
    ClientMessage, ErrorCode, OperatorAuthResult, ServerError, ServerMessage,
};
use crate::service::{IotService, NewProposal, ServiceConfig, ServiceResult};

/// Default bind address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Operator name used when operator auth is not configured.
const ANONYMOUS_OPERATOR: &str = "anonymous";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections idle longer than this are closed.
    pub idle_timeout: Duration,
    /// Period of the cleanup task.
    pub cleanup_interval: Duration,
    /// Operator token validation.
    pub auth: AuthConfig,
    /// Service configuration.
    pub service: ServiceConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            auth: AuthConfig::default(),
            service: ServiceConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("IOT_BIND_ADDR")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("IOT_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.max_connections),
            auth: AuthConfig::from_env(),
            service: ServiceConfig::from_env(),
            ..defaults
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum IotServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connected client bookkeeping.
struct ConnectedClient {
    /// Operator name after login.
    operator: Option<String>,
    /// Connection time.
    connected_at: Instant,
    /// Last activity.
    last_activity: Instant,
    /// Signals the connection task to close.
    close: Arc<Notify>,
}

/// Per-connection protocol state.
#[derive(Debug, Default)]
struct ConnectionState {
    operator: Option<String>,
    subscribed: bool,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// The anchor server.
pub struct IotServer {
    /// Server configuration.
    config: ServerConfig,
    /// Shared service.
    service: Arc<IotService>,
    /// Connected clients.
    clients: Clients,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl IotServer {
    /// Create a server around `service`.
    pub fn new(config: ServerConfig, service: Arc<IotService>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            service,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind and run until shutdown.
    pub async fn run(&self) -> Result<(), IotServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run on an already bound listener.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), IotServerError> {
        info!("Anchor server listening on {}", listener.local_addr()?);

        let cleanup_clients = self.clients.clone();
        let cleanup_service = self.service.clone();
        let idle_timeout = self.config.idle_timeout;
        let cleanup_interval = self.config.cleanup_interval;

        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_clients, cleanup_service, idle_timeout, cleanup_interval)
                .await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                Self::reject_connection(stream, addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Complete the handshake only to report overload, then close.
    fn reject_connection(stream: TcpStream, addr: SocketAddr) {
        tokio::spawn(async move {
            let mut ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("Handshake failed for rejected {}: {}", addr, e);
                    return;
                }
            };
            let msg = ServerMessage::Error(ServerError::new(
                ErrorCode::ServerOverloaded,
                "connection limit reached",
            ));
            if let Ok(text) = msg.to_json() {
                let _ = ws.send(Message::Text(text)).await;
            }
            let _ = ws.close(None).await;
        });
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let service = self.service.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);
            let mut events_rx = service.events().subscribe();
            let close = Arc::new(Notify::new());
            let mut state = ConnectionState::default();

            // Register client
            {
                let mut clients = clients.write().await;
                clients.insert(addr, ConnectedClient {
                    operator: None,
                    connected_at: Instant::now(),
                    last_activity: Instant::now(),
                    close: close.clone(),
                });
            }

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let reply = match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => {
                                        let reply = Self::handle_client_message(
                                            client_msg, &service, &config, &mut state,
                                        ).await;
                                        let mut clients = clients.write().await;
                                        if let Some(client) = clients.get_mut(&addr) {
                                            client.last_activity = Instant::now();
                                            client.operator = state.operator.clone();
                                        }
                                        reply
                                    }
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        ServerMessage::Error(ServerError::new(
                                            ErrorCode::InvalidMessage,
                                            format!("invalid message: {}", e),
                                        ))
                                    }
                                };
                                if msg_tx.send(reply).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    event = events_rx.recv() => {
                        match event {
                            Ok(event) if state.subscribed => {
                                let _ = msg_tx.send(ServerMessage::Event(event)).await;
                            }
                            Ok(_) => {}
                            Err(RecvError::Lagged(skipped)) => {
                                warn!("Client {} lagged, {} events dropped", addr, skipped);
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                    _ = close.notified() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "idle timeout".to_string(),
                        }).await;
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Let the writer flush queued frames, then close.
            drop(msg_tx);
            let _ = tokio::time::timeout(Duration::from_secs(1), sender_task).await;

            clients.write().await.remove(&addr);
            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle one client message and produce the reply.
    async fn handle_client_message(
        msg: ClientMessage,
        service: &IotService,
        config: &ServerConfig,
        state: &mut ConnectionState,
    ) -> ServerMessage {
        if let ClientMessage::OperatorLogin { token, operator } = msg {
            return Self::handle_login(token, operator, config, state);
        }

        let operator = if msg.is_operator_action() {
            if config.auth.is_configured() && state.operator.is_none() {
                return ServerMessage::Error(ServerError::new(
                    ErrorCode::Unauthorized,
                    "operator login required",
                ));
            }
            state.operator.clone().unwrap_or_else(|| ANONYMOUS_OPERATOR.to_string())
        } else {
            String::new()
        };

        match Self::dispatch(msg, operator, service, state).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(code = ?e.code(), error = %e, "request failed");
                ServerMessage::Error(e.into())
            }
        }
    }

    /// Handle operator login.
    fn handle_login(
        token: Option<String>,
        operator: Option<String>,
        config: &ServerConfig,
        state: &mut ConnectionState,
    ) -> ServerMessage {
        let result = authorize_operator(token.as_deref(), &config.auth).map(|claims| match claims {
            Some(claims) => claims.operator().to_string(),
            None => operator.unwrap_or_else(|| ANONYMOUS_OPERATOR.to_string()),
        });

        match result {
            Ok(name) => {
                info!(operator = %name, "operator logged in");
                state.operator = Some(name.clone());
                ServerMessage::OperatorAuth(OperatorAuthResult {
                    success: true,
                    operator: Some(name),
                    error: None,
                    server_version: config.version.clone(),
                })
            }
            Err(e) => {
                warn!(error = %e, "operator login rejected");
                state.operator = None;
                ServerMessage::OperatorAuth(OperatorAuthResult {
                    success: false,
                    operator: None,
                    error: Some(e.to_string()),
                    server_version: config.version.clone(),
                })
            }
        }
    }

    /// Route a message to the service.
    async fn dispatch(
        msg: ClientMessage,
        operator: String,
        service: &IotService,
        state: &mut ConnectionState,
    ) -> ServiceResult<ServerMessage> {
        let reply = match msg {
            ClientMessage::RegisterDevice { device_id, device_name, device_type, secret } => {
                ServerMessage::Registered(
                    service.register_device(&device_id, &device_name, &device_type, &secret).await?,
                )
            }
            ClientMessage::AuthenticateDevice { device_id, secret } => {
                ServerMessage::Authenticated(service.authenticate_device(&device_id, &secret).await?)
            }
            ClientMessage::VerifyProof { device_id, package } => {
                ServerMessage::ProofChecked(service.verify_proof(&device_id, &package)?)
            }
            ClientMessage::SubmitData { device_id, payload, timestamp } => {
                ServerMessage::DataAccepted(service.submit_data(&device_id, payload, timestamp).await?)
            }
            ClientMessage::ListDevices => {
                let devices = service.list_devices().await?;
                ServerMessage::Devices { total: devices.len(), devices }
            }
            ClientMessage::GetDevice { device_id } => {
                ServerMessage::Device(service.get_device(&device_id).await?)
            }
            ClientMessage::Heartbeat { device_id } => {
                ServerMessage::Presence(service.heartbeat(&device_id).await?)
            }
            ClientMessage::DeviceStatus { device_id } => {
                ServerMessage::Presence(service.device_status(&device_id).await?)
            }
            ClientMessage::DeviceStatuses => {
                ServerMessage::DeviceStatuses { devices: service.device_statuses().await? }
            }
            ClientMessage::PendingData => {
                let records = service.pending_data().await?;
                ServerMessage::PendingData { count: records.len(), records }
            }
            ClientMessage::AnchorBatch { metadata, chains } => {
                info!(%operator, "anchor requested");
                ServerMessage::Batch(service.anchor_batch(metadata, chains).await?)
            }
            ClientMessage::RetryBatch { batch_id } => {
                info!(%operator, %batch_id, "retry requested");
                ServerMessage::Batch(service.retry_batch(&batch_id).await?)
            }
            ClientMessage::VerifyData { data_hash, batch_id } => {
                ServerMessage::Verification(service.verify_data(&data_hash, &batch_id).await?)
            }
            ClientMessage::VerifyCrossChain { data_hash, batch_id, chains } => {
                ServerMessage::CrossChainVerification(
                    service.verify_cross_chain(&data_hash, &batch_id, chains).await?,
                )
            }
            ClientMessage::AnchorStatus { batch_id } => {
                ServerMessage::AnchorStatus(service.anchor_status(&batch_id).await?)
            }
            ClientMessage::ChainSyncStatus => {
                ServerMessage::ChainSync { chains: service.chain_sync_status().await? }
            }
            ClientMessage::ListBatches => {
                ServerMessage::Batches { batches: service.list_batches().await? }
            }
            ClientMessage::EstimateGas { request, chain } => {
                ServerMessage::GasEstimate(service.estimate_gas(request, chain).await?)
            }
            ClientMessage::NetworkInfo { chain } => {
                ServerMessage::NetworkInfo(service.network_info(chain).await?)
            }
            ClientMessage::Metrics => ServerMessage::Metrics(service.metrics().await?),
            ClientMessage::ProofSchemes => {
                ServerMessage::ProofSchemes { schemes: service.proof_schemes() }
            }
            ClientMessage::CreateProposal {
                device_id,
                device_name,
                device_type,
                public_key_hash,
                package,
                required_approvals,
            } => ServerMessage::Proposal(
                service
                    .create_proposal(NewProposal {
                        device_id,
                        device_name,
                        device_type,
                        public_key_hash,
                        package,
                        proposer: operator,
                        required_approvals,
                    })
                    .await?,
            ),
            ClientMessage::ApproveProposal { proposal_id, signature } => ServerMessage::Proposal(
                service.approve_proposal(&proposal_id, &operator, &signature).await?,
            ),
            ClientMessage::RejectProposal { proposal_id, reason } => ServerMessage::Proposal(
                service.reject_proposal(&proposal_id, &operator, &reason).await?,
            ),
            ClientMessage::ExecuteProposal { proposal_id } => {
                ServerMessage::Proposal(service.execute_proposal(&proposal_id).await?)
            }
            ClientMessage::AddSigner { address, name } => {
                info!(%operator, %address, "signer added");
                ServerMessage::Signer(service.add_signer(&address, &name).await?)
            }
            ClientMessage::ListSigners => {
                ServerMessage::Signers { signers: service.list_signers().await? }
            }
            ClientMessage::GetProposal { proposal_id } => {
                ServerMessage::Proposal(service.get_proposal(&proposal_id).await?)
            }
            ClientMessage::ListProposals { status } => {
                ServerMessage::Proposals { proposals: service.list_proposals(status).await? }
            }
            ClientMessage::Subscribe => {
                state.subscribed = true;
                ServerMessage::Subscription { active: true }
            }
            ClientMessage::Unsubscribe => {
                state.subscribed = false;
                ServerMessage::Subscription { active: false }
            }
            ClientMessage::Ping { timestamp } => ServerMessage::Pong {
                timestamp,
                server_time: u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0),
            },
            ClientMessage::OperatorLogin { .. } => ServerMessage::Error(ServerError::new(
                ErrorCode::InvalidMessage,
                "login handled separately",
            )),
        };
        Ok(reply)
    }

    /// Run cleanup loop.
    async fn run_cleanup_loop(
        clients: Clients,
        service: Arc<IotService>,
        idle_timeout: Duration,
        period: Duration,
    ) {
        let mut interval = interval(period);

        loop {
            interval.tick().await;

            // Close idle connections
            let now = Instant::now();
            {
                let clients = clients.read().await;
                for (addr, client) in clients.iter() {
                    if now.duration_since(client.last_activity) > idle_timeout {
                        info!(
                            "Closing idle client {} (connected {:?} ago, operator {:?})",
                            addr,
                            now.duration_since(client.connected_at),
                            client.operator
                        );
                        client.close.notify_one();
                    }
                }
            }

            match service.maintenance().await {
                Ok(report) => {
                    if report.purged_proofs + report.expired_proposals > 0
                        || !report.offline_devices.is_empty()
                    {
                        debug!(
                            purged = report.purged_proofs,
                            expired = report.expired_proposals,
                            offline = report.offline_devices.len(),
                            "maintenance pass"
                        );
                    }
                }
                Err(e) => error!("Maintenance failed: {}", e),
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Operators logged in on open connections.
    pub async fn operators(&self) -> Vec<String> {
        self.clients
            .read()
            .await
            .values()
            .filter_map(|c| c.operator.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainId, LocalLedger, SigningKey};
    use crate::network::auth::OperatorClaims;
    use crate::service::EventBus;
    use crate::store::MemoryStore;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;

    const OPERATOR_SECRET: &str = "operator-secret-key-256-bits!!";

    fn service() -> Arc<IotService> {
        let ledger = Arc::new(LocalLedger::new(SigningKey::generate(), [ChainId::new("sepolia")]));
        Arc::new(IotService::new(
            ServiceConfig::default(),
            Arc::new(MemoryStore::new()),
            ledger,
            EventBus::default(),
        ))
    }

    fn secured_config() -> ServerConfig {
        ServerConfig {
            auth: AuthConfig::hmac(OPERATOR_SECRET),
            ..Default::default()
        }
    }

    fn operator_token(sub: &str) -> String {
        let now = crate::core::unix_now();
        let claims = OperatorClaims { sub: sub.into(), exp: now + 600, iat: now, iss: None, aud: None };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(OPERATOR_SECRET.as_bytes()),
        )
        .unwrap()
    }

    async fn send(
        service: &IotService,
        config: &ServerConfig,
        state: &mut ConnectionState,
        msg: ClientMessage,
    ) -> ServerMessage {
        IotServer::handle_client_message(msg, service, config, state).await
    }

    fn error_code(msg: &ServerMessage) -> Option<ErrorCode> {
        match msg {
            ServerMessage::Error(e) => Some(e.code),
            _ => None,
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR.parse::<SocketAddr>().unwrap());
        assert!(!config.auth.is_configured());
    }

    #[tokio::test]
    async fn test_operator_gate() {
        let service = service();
        let config = secured_config();
        let mut state = ConnectionState::default();

        let anchor = || ClientMessage::AnchorBatch { metadata: json!(null), chains: None };
        let reply = send(&service, &config, &mut state, anchor()).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::Unauthorized));

        // Non-operator messages stay open
        let reply = send(&service, &config, &mut state, ClientMessage::Metrics).await;
        assert!(matches!(reply, ServerMessage::Metrics(_)));

        let login = ClientMessage::OperatorLogin { token: Some("bogus".into()), operator: None };
        match send(&service, &config, &mut state, login).await {
            ServerMessage::OperatorAuth(result) => assert!(!result.success),
            other => panic!("unexpected {:?}", other),
        }

        let login = ClientMessage::OperatorLogin { token: Some(operator_token("ops-alice")), operator: None };
        match send(&service, &config, &mut state, login).await {
            ServerMessage::OperatorAuth(result) => {
                assert!(result.success);
                assert_eq!(result.operator.as_deref(), Some("ops-alice"));
            }
            other => panic!("unexpected {:?}", other),
        }

        // Authorized now; fails only because nothing is pending
        let reply = send(&service, &config, &mut state, anchor()).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::ValidationError));
    }

    #[tokio::test]
    async fn test_dispatch_device_flow() {
        let service = service();
        let config = ServerConfig::default();
        let mut state = ConnectionState::default();

        let register = ClientMessage::RegisterDevice {
            device_id: "dev-1".into(),
            device_name: "Boiler".into(),
            device_type: "sensor".into(),
            secret: "correct horse battery".into(),
        };
        assert!(matches!(
            send(&service, &config, &mut state, register.clone()).await,
            ServerMessage::Registered(_)
        ));
        assert_eq!(
            error_code(&send(&service, &config, &mut state, register).await),
            Some(ErrorCode::Conflict)
        );

        let submit = ClientMessage::SubmitData {
            device_id: "dev-1".into(),
            payload: json!({"temp": 20}),
            timestamp: Some(10),
        };
        let data_hash = match send(&service, &config, &mut state, submit).await {
            ServerMessage::DataAccepted(s) => s.data_hash,
            other => panic!("unexpected {:?}", other),
        };

        // Auth not configured: anchoring is open
        let anchor = ClientMessage::AnchorBatch { metadata: json!({}), chains: None };
        let batch = match send(&service, &config, &mut state, anchor).await {
            ServerMessage::Batch(b) => b,
            other => panic!("unexpected {:?}", other),
        };

        let verify = ClientMessage::VerifyData { data_hash, batch_id: batch.batch_id };
        match send(&service, &config, &mut state, verify).await {
            ServerMessage::Verification(report) => assert!(report.valid),
            other => panic!("unexpected {:?}", other),
        }

        let missing = ClientMessage::GetDevice { device_id: "ghost".into() };
        assert_eq!(
            error_code(&send(&service, &config, &mut state, missing).await),
            Some(ErrorCode::NotFound)
        );
    }

    #[tokio::test]
    async fn test_dispatch_presence_and_chain_queries() {
        let service = service();
        let config = secured_config();
        let mut state = ConnectionState::default();

        let register = ClientMessage::RegisterDevice {
            device_id: "dev-1".into(),
            device_name: "Boiler".into(),
            device_type: "sensor".into(),
            secret: "correct horse battery".into(),
        };
        send(&service, &config, &mut state, register).await;

        let beat = ClientMessage::Heartbeat { device_id: "dev-1".into() };
        match send(&service, &config, &mut state, beat).await {
            ServerMessage::Presence(p) => assert_eq!(p.status, crate::service::PresenceStatus::Online),
            other => panic!("unexpected {:?}", other),
        }
        match send(&service, &config, &mut state, ClientMessage::DeviceStatuses).await {
            ServerMessage::DeviceStatuses { devices } => assert_eq!(devices.len(), 1),
            other => panic!("unexpected {:?}", other),
        }

        match send(&service, &config, &mut state, ClientMessage::NetworkInfo { chain: None }).await {
            ServerMessage::NetworkInfo(info) => assert!(info.is_connected),
            other => panic!("unexpected {:?}", other),
        }
        let estimate = ClientMessage::EstimateGas {
            request: crate::service::GasOperation::MerkleAnchor {
                root: "cd".repeat(32),
                batch_size: 4,
                metadata: json!(null),
            },
            chain: None,
        };
        assert!(matches!(
            send(&service, &config, &mut state, estimate).await,
            ServerMessage::GasEstimate(_)
        ));
        match send(&service, &config, &mut state, ClientMessage::ChainSyncStatus).await {
            ServerMessage::ChainSync { chains } => assert!(chains.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        let status = ClientMessage::AnchorStatus { batch_id: "missing".into() };
        assert_eq!(
            error_code(&send(&service, &config, &mut state, status).await),
            Some(ErrorCode::NotFound)
        );

        // Signer registration is an operator action
        let add = || ClientMessage::AddSigner { address: "0xa1".into(), name: "Alice".into() };
        assert_eq!(
            error_code(&send(&service, &config, &mut state, add()).await),
            Some(ErrorCode::Unauthorized)
        );
        let login = ClientMessage::OperatorLogin { token: Some(operator_token("ops-alice")), operator: None };
        send(&service, &config, &mut state, login).await;
        assert!(matches!(send(&service, &config, &mut state, add()).await, ServerMessage::Signer(_)));
        match send(&service, &config, &mut state, ClientMessage::ListSigners).await {
            ServerMessage::Signers { signers } => assert_eq!(signers[0].address, "0xa1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_proposal_votes_use_operator_name() {
        let service = service();
        let config = ServerConfig::default();
        let mut state = ConnectionState::default();

        let login = ClientMessage::OperatorLogin { token: None, operator: Some("bob".into()) };
        send(&service, &config, &mut state, login).await;

        let create = ClientMessage::CreateProposal {
            device_id: "dev-7".into(),
            device_name: "Gateway".into(),
            device_type: "gateway".into(),
            public_key_hash: "aa".repeat(32),
            package: Default::default(),
            required_approvals: 2,
        };
        let proposal = match send(&service, &config, &mut state, create).await {
            ServerMessage::Proposal(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(proposal.proposer, "bob");

        let approve = || ClientMessage::ApproveProposal {
            proposal_id: proposal.proposal_id.clone(),
            signature: "sig".into(),
        };
        match send(&service, &config, &mut state, approve()).await {
            ServerMessage::Proposal(p) => assert_eq!(p.approvals[0].approver, "bob"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            error_code(&send(&service, &config, &mut state, approve()).await),
            Some(ErrorCode::Conflict)
        );
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let service = service();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(IotServer::new(ServerConfig::default(), service));

        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.serve(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();

        async fn next_reply<S>(ws: &mut S) -> ServerMessage
        where
            S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                + Unpin,
        {
            loop {
                if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                    return ServerMessage::from_json(&text).unwrap();
                }
            }
        }

        ws.send(Message::Text(r#"{"type":"ping","timestamp":42}"#.into())).await.unwrap();
        assert!(matches!(next_reply(&mut ws).await, ServerMessage::Pong { timestamp: 42, .. }));

        ws.send(Message::Text("{bad".into())).await.unwrap();
        assert_eq!(error_code(&next_reply(&mut ws).await), Some(ErrorCode::InvalidMessage));

        ws.send(Message::Text(r#"{"type":"subscribe"}"#.into())).await.unwrap();
        assert!(matches!(next_reply(&mut ws).await, ServerMessage::Subscription { active: true }));

        let register = ClientMessage::RegisterDevice {
            device_id: "dev-ws".into(),
            device_name: "Meter".into(),
            device_type: "meter".into(),
            secret: "correct horse battery".into(),
        };
        ws.send(Message::Text(register.to_json().unwrap())).await.unwrap();
        let replies = [next_reply(&mut ws).await, next_reply(&mut ws).await];
        assert!(replies.iter().any(|m| matches!(m, ServerMessage::Registered(_))));
        assert!(replies
            .iter()
            .any(|m| matches!(m, ServerMessage::Event(crate::service::ServerEvent::DeviceRegistered { .. }))));
        assert_eq!(server.connection_count().await, 1);

        server.shutdown();
        assert!(matches!(next_reply(&mut ws).await, ServerMessage::Shutdown { .. }));
        handle.await.unwrap().unwrap();
    }
}
