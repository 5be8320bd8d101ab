//! Async runtimes wiring the sans-IO cores to real transports.
//!
//! Composition layers, no protocol logic of their own:
//!
//! ```text
//!     Application
//!          ↓
//!   RoutingHub / RoutingSpoke   ← this layer
//!          ↓
//!   HubCore / SpokeCore (state machines) + ConnectionActor (IO)
//! ```
//!
//! One task per connection (split-pump actor), one driver task decoding
//! frames and feeding the core, a registration worker serializing
//! register/deregister bursts, and timer tasks for watchdog, FSM
//! deadlines and the request-debounce flush. No lock is held across an
//! endpoint send: outputs are collected under the core lock, the lock is
//! dropped, then the frames go out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use chassis_core::actor::{ConnectionActor, ConnectionCmd, ConnectionEvent};
use chassis_core::buffer::FrameBuffer;
use chassis_core::config::FabricConfig;
use chassis_core::endpoint::Endpoint;
use chassis_core::error::CoreError;
use chassis_core::ipc;
use chassis_core::sink::{ChannelSink, FrameSink};
use chassis_core::tcp;
use chassis_proto::codec::FrameDecoder;
use chassis_proto::command::Command;
use chassis_proto::subscribe::SubscriptionRef;
use chassis_proto::types::{ClientId, Principal, ROUTING_CLIENT};

use crate::security::{IdentityMap, PolicyStore};

use super::hub::{HostEvent, HubCore, HubOutput};
use super::spoke::{SpokeAction, SpokeCore, SpokeEvent};

/// Read chunk handed to each kernel read.
const READ_CHUNK: usize = 8 * 1024;
/// Baseline FSM tick; deadlines are checked at this granularity.
const TICK_INTERVAL: Duration = Duration::from_millis(50);
/// Backoff between hub reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(100);
/// Grace period for distributed security updates.
const SECURITY_UPDATE_TIMEOUT: Duration = Duration::from_secs(3);

/// Async acceptance hook for subscriptions: a promise of a boolean.
pub type SubscriptionAcceptor =
    Arc<dyn Fn(ClientId, SubscriptionRef) -> BoxFuture<'static, bool> + Send + Sync>;

fn accept_all() -> SubscriptionAcceptor {
    Arc::new(|_, _| Box::pin(async { true }))
}

type ConnectionMap = Arc<parking_lot::Mutex<hashbrown::HashMap<ClientId, Arc<ChannelSink>>>>;

enum RegistrationAction {
    Register { port: u16 },
    Deregister,
    DeregisterOnError,
}

/// The hub runtime: owns the server endpoint and the authoritative core.
pub struct RoutingHub {
    config: FabricConfig,
    core: Arc<async_lock::Mutex<HubCore>>,
    identities: Arc<IdentityMap>,
    connections: ConnectionMap,
    host_tx: Sender<HostEvent>,
    reg_tx: Sender<(ClientId, RegistrationAction)>,
    reg_rx: Receiver<(ClientId, RegistrationAction)>,
    acceptor: SubscriptionAcceptor,
    running: Arc<AtomicBool>,
}

impl RoutingHub {
    /// Build the hub. `start` must be called to bind and serve.
    #[must_use]
    pub fn new(
        config: FabricConfig,
        policy: Arc<PolicyStore>,
        identities: Arc<IdentityMap>,
    ) -> (Self, Receiver<HostEvent>) {
        let (host_tx, host_rx) = flume::unbounded();
        let (reg_tx, reg_rx) = flume::unbounded();
        let core = Arc::new(async_lock::Mutex::new(HubCore::new(
            config.clone(),
            policy,
            Arc::clone(&identities),
        )));
        (
            Self {
                config,
                core,
                identities,
                connections: Arc::new(parking_lot::Mutex::new(hashbrown::HashMap::new())),
                host_tx,
                reg_tx,
                reg_rx,
                acceptor: accept_all(),
                running: Arc::new(AtomicBool::new(true)),
            },
            host_rx,
        )
    }

    /// Install the subscription-acceptance hook.
    pub fn set_subscription_acceptor(&mut self, acceptor: SubscriptionAcceptor) {
        self.acceptor = acceptor;
    }

    /// Bind the server endpoint and serve until `stop`.
    ///
    /// A failed bind is fatal and is returned to the host.
    pub async fn start(&self) -> Result<(), CoreError> {
        self.spawn_registration_worker();
        if self.config.watchdog_enabled {
            self.spawn_watchdog();
        }

        if self.config.is_local_routing {
            self.serve_local().await
        } else {
            self.serve_tcp().await
        }
    }

    async fn serve_local(&self) -> Result<(), CoreError> {
        let node = match Endpoint::for_client(
            &self.config.base_path,
            &self.config.network,
            ROUTING_CLIENT,
        ) {
            Endpoint::Local(path) => path,
            Endpoint::Tcp(_) => unreachable!("for_client always yields a local node"),
        };

        let listener = ipc::bind(&node).await.map_err(|source| CoreError::Bind {
            endpoint: node.display().to_string(),
            source,
        })?;
        info!("routing manager listening on {}", node.display());

        while self.running.load(Ordering::Relaxed) {
            let stream = match ipc::accept(&listener).await {
                Ok(stream) => stream,
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        warn!("accept failed: {e}");
                        continue;
                    }
                    break;
                }
            };
            // UDS peers are identified by socket credentials, resolved by
            // the host before policy checks matter.
            self.spawn_connection(stream, None);
        }

        ipc::unlink(&node);
        Ok(())
    }

    async fn serve_tcp(&self) -> Result<(), CoreError> {
        let addr = std::net::SocketAddr::new(
            self.config.routing_host_address,
            self.config.routing_host_port,
        );
        let listener = tcp::bind(addr).await.map_err(|source| CoreError::Bind {
            endpoint: format!("tcp://{addr}"),
            source,
        })?;
        info!("routing manager listening on tcp://{addr}");

        while self.running.load(Ordering::Relaxed) {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        warn!("accept failed: {e}");
                        continue;
                    }
                    break;
                }
            };
            let _ = tcp::enable_tcp_nodelay(&stream);
            let principal = Principal::Address {
                host: peer.ip(),
                port: peer.port(),
            };
            self.spawn_connection(stream, Some(principal));
        }

        Ok(())
    }

    /// Stop serving: flag down, abort parked subscriptions, close peers.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);

        let outputs = {
            let mut core = self.core.lock().await;
            core.stop()
        };
        dispatch_hub_outputs(
            outputs,
            None,
            &self.connections,
            &self.host_tx,
            &self.core,
            &self.acceptor,
        )
        .await;

        let sinks: Vec<Arc<ChannelSink>> = self.connections.lock().values().cloned().collect();
        for sink in sinks {
            sink.stop().await;
        }
    }

    /// Drop the connection bound to `client`, if any.
    pub async fn disconnect_from(&self, client: ClientId) {
        let sink = self.connections.lock().remove(&client);
        if let Some(sink) = sink {
            sink.stop().await;
        }
    }

    /// Log a one-line status summary of the accepted connections.
    pub fn print_status(&self) {
        let connections = self.connections.lock();
        info!(
            "routing manager: {} connection(s): [{}]",
            connections.len(),
            connections
                .keys()
                .map(|client| format!("{client:#06x}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    fn spawn_connection<S>(&self, stream: S, principal: Option<Principal>)
    where
        S: compio::io::AsyncRead + compio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (event_tx, event_rx) = flume::unbounded();
        let (cmd_tx, cmd_rx) = flume::unbounded();

        let actor = ConnectionActor::new(stream, event_tx, cmd_rx, READ_CHUNK);
        compio::runtime::spawn(actor.run()).detach();

        let core = Arc::clone(&self.core);
        let identities = Arc::clone(&self.identities);
        let connections = Arc::clone(&self.connections);
        let host_tx = self.host_tx.clone();
        let reg_tx = self.reg_tx.clone();
        let acceptor = Arc::clone(&self.acceptor);
        let max_frame = self.config.max_message_size_local;

        compio::runtime::spawn(async move {
            drive_hub_connection(
                event_rx, cmd_tx, principal, core, identities, connections, host_tx, reg_tx,
                acceptor, max_frame,
            )
            .await;
        })
        .detach();
    }

    /// Registration events are serialized through one worker so
    /// overlapping registrations for the same client cannot interleave.
    fn spawn_registration_worker(&self) {
        let reg_rx = self.reg_rx.clone();
        let core = Arc::clone(&self.core);
        let connections = Arc::clone(&self.connections);
        let host_tx = self.host_tx.clone();
        let acceptor = Arc::clone(&self.acceptor);
        let running = Arc::clone(&self.running);

        compio::runtime::spawn(async move {
            while let Ok((client, action)) = reg_rx.recv_async().await {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                let mut deregistered = false;
                let outputs = {
                    let mut core = core.lock().await;
                    match action {
                        RegistrationAction::Register { port } => core.handle_command(
                            Some(client),
                            false,
                            client,
                            Command::RegisterApplication { port },
                        ),
                        RegistrationAction::Deregister => {
                            deregistered = true;
                            core.handle_command(None, false, client, Command::DeregisterApplication)
                        }
                        RegistrationAction::DeregisterOnError => {
                            deregistered = true;
                            core.handle_client_error(client)
                        }
                    }
                };
                dispatch_hub_outputs(outputs, None, &connections, &host_tx, &core, &acceptor)
                    .await;
                if deregistered {
                    connections.lock().remove(&client);
                }
            }
        })
        .detach();
    }

    fn spawn_watchdog(&self) {
        let core = Arc::clone(&self.core);
        let connections = Arc::clone(&self.connections);
        let host_tx = self.host_tx.clone();
        let acceptor = Arc::clone(&self.acceptor);
        let running = Arc::clone(&self.running);
        let half_cycle = self.config.watchdog_timeout / 2;

        compio::runtime::spawn(async move {
            while running.load(Ordering::Relaxed) {
                compio::time::sleep(half_cycle).await;
                let outputs = {
                    let mut core = core.lock().await;
                    core.on_watchdog_half_cycle()
                };
                dispatch_hub_outputs(outputs, None, &connections, &host_tx, &core, &acceptor)
                    .await;
            }
        })
        .detach();
    }
}

/// Decode frames from one accepted connection and feed the core.
#[allow(clippy::too_many_arguments)]
async fn drive_hub_connection(
    event_rx: Receiver<ConnectionEvent>,
    cmd_tx: Sender<ConnectionCmd>,
    principal: Option<Principal>,
    core: Arc<async_lock::Mutex<HubCore>>,
    identities: Arc<IdentityMap>,
    connections: ConnectionMap,
    host_tx: Sender<HostEvent>,
    reg_tx: Sender<(ClientId, RegistrationAction)>,
    acceptor: SubscriptionAcceptor,
    max_frame: usize,
) {
    let mut decoder = FrameDecoder::new(max_frame);
    let mut buffer = FrameBuffer::new();
    let mut bound: Option<ClientId> = None;

    let sink = Arc::new(ChannelSink::new(cmd_tx.clone()));
    {
        // The per-peer error path folds into deregister-on-error.
        let reg_tx = reg_tx.clone();
        sink.register_error_handler(Box::new(move |client| {
            if let Some(client) = client {
                let _ = reg_tx.send((client, RegistrationAction::DeregisterOnError));
            }
        }));
    }

    while let Ok(event) = event_rx.recv_async().await {
        match event {
            ConnectionEvent::Connected => {}
            ConnectionEvent::Received(bytes) => {
                buffer.push(bytes);
                loop {
                    match decoder.decode(&mut buffer) {
                        Ok(Some(raw)) => {
                            let command = match Command::decode_payload(raw.id, &raw.payload) {
                                Ok(command) => command,
                                Err(e) => {
                                    warn!("dropping malformed {:?} frame: {e}", raw.id);
                                    continue;
                                }
                            };

                            // Register/deregister take the serialized
                            // worker path.
                            match &command {
                                Command::RegisterApplication { port } => {
                                    bound = Some(raw.sender);
                                    sink.bind(raw.sender);
                                    if let Some(principal) = principal {
                                        identities.store(raw.sender, principal);
                                    }
                                    connections.lock().insert(raw.sender, Arc::clone(&sink));
                                    let _ = reg_tx.send((
                                        raw.sender,
                                        RegistrationAction::Register { port: *port },
                                    ));
                                    continue;
                                }
                                Command::DeregisterApplication => {
                                    let _ =
                                        reg_tx.send((raw.sender, RegistrationAction::Deregister));
                                    continue;
                                }
                                _ => {}
                            }

                            let update_timer = match &command {
                                Command::UpdateSecurityPolicy { update_id, .. }
                                | Command::UpdateSecurityPolicyInt { update_id, .. } => {
                                    Some(*update_id)
                                }
                                _ => None,
                            };

                            let outputs = {
                                let mut core = core.lock().await;
                                core.handle_command(bound, false, raw.sender, command)
                            };

                            if let Some(update_id) = update_timer {
                                spawn_security_update_timer(
                                    Arc::clone(&core),
                                    Arc::clone(&connections),
                                    host_tx.clone(),
                                    Arc::clone(&acceptor),
                                    update_id,
                                );
                            }

                            // A fresh connection is bound once the hub
                            // assigns it an id.
                            if bound.is_none() {
                                for output in &outputs {
                                    if let HubOutput::Reply(Command::AssignClientAck {
                                        assigned,
                                    }) = output
                                    {
                                        bound = Some(*assigned);
                                        sink.bind(*assigned);
                                        connections.lock().insert(*assigned, Arc::clone(&sink));
                                    }
                                }
                            }

                            dispatch_hub_outputs(
                                outputs,
                                Some(&sink),
                                &connections,
                                &host_tx,
                                &core,
                                &acceptor,
                            )
                            .await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("frame error on connection: {e}, closing");
                            let _ = cmd_tx.send(ConnectionCmd::Close);
                            break;
                        }
                    }
                }
            }
            ConnectionEvent::Disconnected => {
                if let Some(client) = bound.take() {
                    let _ = reg_tx.send((client, RegistrationAction::DeregisterOnError));
                }
                break;
            }
        }
    }
}

/// Execute core outputs. The core lock is re-taken only for subscription
/// completions; sends never happen under it.
async fn dispatch_hub_outputs(
    outputs: Vec<HubOutput>,
    origin: Option<&Arc<ChannelSink>>,
    connections: &ConnectionMap,
    host_tx: &Sender<HostEvent>,
    core: &Arc<async_lock::Mutex<HubCore>>,
    acceptor: &SubscriptionAcceptor,
) {
    for output in outputs {
        match output {
            HubOutput::Reply(command) => {
                if let Some(origin) = origin {
                    send_frame(origin, &command).await;
                }
            }
            HubOutput::Frame { target, command } => {
                let sink = connections.lock().get(&target).cloned();
                match sink {
                    Some(sink) => send_frame(&sink, &command).await,
                    None => debug!("no connection for client {target:#06x}, dropping frame"),
                }
            }
            HubOutput::AskSubscription {
                token,
                subscriber,
                subscription,
            } => {
                let accepted = (acceptor.as_ref())(subscriber, subscription).await;
                let follow_ups = {
                    let mut core = core.lock().await;
                    core.complete_subscription(token, accepted)
                };
                // Completion yields only frames and host events, never
                // another question: recursion bottoms out immediately.
                Box::pin(dispatch_hub_outputs(
                    follow_ups,
                    origin,
                    connections,
                    host_tx,
                    core,
                    acceptor,
                ))
                .await;
            }
            HubOutput::Host(event) => {
                let _ = host_tx.send(event);
            }
        }
    }
}

async fn send_frame(sink: &ChannelSink, command: &Command) {
    match command.encode(ROUTING_CLIENT) {
        Ok(frame) => {
            // Best effort: failure runs the per-peer error handler, no
            // core state changes here.
            let _ = sink.send(frame).await;
        }
        Err(e) => warn!("failed to encode {:?}: {e}", command.id()),
    }
}

/// Schedule the security-update grace timer for `update_id`.
pub(crate) fn spawn_security_update_timer(
    core: Arc<async_lock::Mutex<HubCore>>,
    connections: ConnectionMap,
    host_tx: Sender<HostEvent>,
    acceptor: SubscriptionAcceptor,
    update_id: u32,
) {
    compio::runtime::spawn(async move {
        compio::time::sleep(SECURITY_UPDATE_TIMEOUT).await;
        let outputs = {
            let mut core = core.lock().await;
            core.on_security_update_timeout(update_id)
        };
        dispatch_hub_outputs(outputs, None, &connections, &host_tx, &core, &acceptor).await;
    })
    .detach();
}

/// The spoke runtime: hub connection, local server, timers.
pub struct RoutingSpoke {
    config: FabricConfig,
    core: Arc<async_lock::Mutex<SpokeCore>>,
    hub_tx: Arc<parking_lot::Mutex<Option<Sender<ConnectionCmd>>>>,
    app_tx: Sender<SpokeEvent>,
    running: Arc<AtomicBool>,
}

impl RoutingSpoke {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        config: FabricConfig,
        policy: Arc<PolicyStore>,
    ) -> (Self, Receiver<SpokeEvent>) {
        let (app_tx, app_rx) = flume::unbounded();
        let core = Arc::new(async_lock::Mutex::new(SpokeCore::new(
            name,
            chassis_proto::types::ILLEGAL_PORT,
            config.request_debounce_time,
            policy,
        )));
        (
            Self {
                config,
                core,
                hub_tx: Arc::new(parking_lot::Mutex::new(None)),
                app_tx,
                running: Arc::new(AtomicBool::new(true)),
            },
            app_rx,
        )
    }

    /// Connect to the hub and keep the registration alive until `stop`.
    pub async fn start(&self) -> Result<(), CoreError> {
        self.spawn_ticker();
        self.run_transport().await
    }

    /// Orderly deregistration and teardown.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let actions = {
            let mut core = self.core.lock().await;
            core.deregister()
        };
        self.execute(actions).await;
        if let Some(tx) = self.hub_tx.lock().take() {
            let _ = tx.send(ConnectionCmd::Close);
        }
    }

    /// Application entry points: each locks the core, collects actions,
    /// executes them after the lock is gone.
    pub async fn offer_service(&self, service: chassis_proto::types::ServiceRecord) {
        let actions = {
            let mut core = self.core.lock().await;
            core.offer_service(service)
        };
        self.execute(actions).await;
    }

    pub async fn request_service(
        &self,
        services: impl IntoIterator<Item = chassis_proto::types::ServiceRecord>,
    ) {
        let actions = {
            let mut core = self.core.lock().await;
            core.request_service(services, Instant::now())
        };
        self.execute(actions).await;
    }

    pub async fn subscribe(&self, request: chassis_proto::subscribe::SubscribeRequest) {
        let actions = {
            let mut core = self.core.lock().await;
            core.subscribe(request)
        };
        self.execute(actions).await;
    }

    pub async fn send(&self, message: chassis_proto::send::UserMessage) {
        let actions = {
            let mut core = self.core.lock().await;
            core.send(message)
        };
        self.execute(actions).await;
    }

    /// Connect to the routing host over the configured transport and
    /// spawn its connection actor.
    async fn connect_hub(&self) -> Option<(Receiver<ConnectionEvent>, Sender<ConnectionCmd>)> {
        if self.config.is_local_routing {
            let node = match Endpoint::for_client(
                &self.config.base_path,
                &self.config.network,
                ROUTING_CLIENT,
            ) {
                Endpoint::Local(path) => path,
                Endpoint::Tcp(_) => unreachable!("for_client always yields a local node"),
            };
            let stream = ipc::connect(&node).await.ok()?;
            Some(spawn_stream_actor(stream))
        } else {
            let addr = std::net::SocketAddr::new(
                self.config.routing_host_address,
                self.config.routing_host_port,
            );
            let stream = tcp::connect(addr).await.ok()?;
            Some(spawn_stream_actor(stream))
        }
    }

    async fn run_transport(&self) -> Result<(), CoreError> {
        while self.running.load(Ordering::Relaxed) {
            let Some((event_rx, cmd_tx)) = self.connect_hub().await else {
                compio::time::sleep(RECONNECT_DELAY).await;
                continue;
            };
            *self.hub_tx.lock() = Some(cmd_tx);

            let actions = {
                let mut core = self.core.lock().await;
                core.start(Instant::now())
            };
            self.execute(actions).await;

            self.pump_hub_events(event_rx).await;

            *self.hub_tx.lock() = None;
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            let actions = {
                let mut core = self.core.lock().await;
                core.on_transport_lost()
            };
            self.execute(actions).await;
            compio::time::sleep(RECONNECT_DELAY).await;
        }
        Ok(())
    }

    async fn pump_hub_events(&self, event_rx: Receiver<ConnectionEvent>) {
        let mut decoder = FrameDecoder::new(self.config.max_message_size_local);
        let mut buffer = FrameBuffer::new();

        while let Ok(event) = event_rx.recv_async().await {
            match event {
                ConnectionEvent::Connected => {}
                ConnectionEvent::Received(bytes) => {
                    buffer.push(bytes);
                    loop {
                        match decoder.decode(&mut buffer) {
                            Ok(Some(raw)) => {
                                let command = match Command::decode_payload(raw.id, &raw.payload) {
                                    Ok(command) => command,
                                    Err(e) => {
                                        warn!("dropping malformed {:?} frame: {e}", raw.id);
                                        continue;
                                    }
                                };
                                let actions = {
                                    let mut core = self.core.lock().await;
                                    core.on_command(command, Instant::now())
                                };
                                self.execute(actions).await;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("frame error from hub: {e}, reconnecting");
                                return;
                            }
                        }
                    }
                }
                ConnectionEvent::Disconnected => return,
            }
        }
    }

    fn spawn_ticker(&self) {
        let core = Arc::clone(&self.core);
        let hub_tx = Arc::clone(&self.hub_tx);
        let app_tx = self.app_tx.clone();
        let running = Arc::clone(&self.running);
        let config = self.config.clone();

        compio::runtime::spawn(async move {
            while running.load(Ordering::Relaxed) {
                compio::time::sleep(TICK_INTERVAL).await;
                let actions = {
                    let mut core = core.lock().await;
                    core.on_tick(Instant::now())
                };
                execute_spoke_actions(actions, &config, &core, &hub_tx, &app_tx).await;
            }
        })
        .detach();
    }

    async fn execute(&self, actions: Vec<SpokeAction>) {
        execute_spoke_actions(actions, &self.config, &self.core, &self.hub_tx, &self.app_tx)
            .await;
    }
}

fn spawn_stream_actor<S>(stream: S) -> (Receiver<ConnectionEvent>, Sender<ConnectionCmd>)
where
    S: compio::io::AsyncRead + compio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (event_tx, event_rx) = flume::unbounded();
    let (cmd_tx, cmd_rx) = flume::unbounded();
    let actor = ConnectionActor::new(stream, event_tx, cmd_rx, READ_CHUNK);
    compio::runtime::spawn(actor.run()).detach();
    (event_rx, cmd_tx)
}

async fn execute_spoke_actions(
    actions: Vec<SpokeAction>,
    config: &FabricConfig,
    core: &Arc<async_lock::Mutex<SpokeCore>>,
    hub_tx: &Arc<parking_lot::Mutex<Option<Sender<ConnectionCmd>>>>,
    app_tx: &Sender<SpokeEvent>,
) {
    for action in actions {
        match action {
            SpokeAction::SendToHub(command) => {
                let client = {
                    let core = core.lock().await;
                    core.client()
                };
                let tx = hub_tx.lock().clone();
                if let Some(tx) = tx {
                    match command.encode(client) {
                        Ok(frame) => {
                            let _ = tx.send(ConnectionCmd::Send(frame));
                        }
                        Err(e) => warn!("failed to encode {:?}: {e}", command.id()),
                    }
                }
            }
            SpokeAction::StartLocalServer => {
                // Direct spoke-to-spoke endpoints exist on the UDS
                // transport; TCP spokes route everything via the hub.
                if config.is_local_routing {
                    let client = {
                        let core = core.lock().await;
                        core.client()
                    };
                    spawn_local_server(config.clone(), client, app_tx.clone());
                }
            }
            SpokeAction::RestartTransport => {
                // run_transport notices the closed connection and
                // reconnects; nothing to do here.
                if let Some(tx) = hub_tx.lock().clone() {
                    let _ = tx.send(ConnectionCmd::Close);
                }
            }
            SpokeAction::ScheduleFlush(at) => {
                let core = Arc::clone(core);
                let hub_tx = Arc::clone(hub_tx);
                let app_tx = app_tx.clone();
                let config = config.clone();
                compio::runtime::spawn(async move {
                    let now = Instant::now();
                    if at > now {
                        compio::time::sleep(at - now).await;
                    }
                    let actions = {
                        let mut core = core.lock().await;
                        core.on_tick(Instant::now())
                    };
                    Box::pin(execute_spoke_actions(
                        actions, &config, &core, &hub_tx, &app_tx,
                    ))
                    .await;
                })
                .detach();
            }
            SpokeAction::Deliver(event) => {
                let _ = app_tx.send(event);
            }
        }
    }
}

/// The spoke's own server node: peers connect here for direct sends.
fn spawn_local_server(config: FabricConfig, client: ClientId, app_tx: Sender<SpokeEvent>) {
    compio::runtime::spawn(async move {
        let node =
            match Endpoint::for_client(&config.base_path, &config.network, client) {
                Endpoint::Local(path) => path,
                Endpoint::Tcp(_) => return,
            };
        let listener = match ipc::bind(&node).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("spoke server bind failed on {}: {e}", node.display());
                return;
            }
        };
        debug!("spoke {client:#06x} accepting peers on {}", node.display());

        loop {
            let Ok(stream) = ipc::accept(&listener).await else {
                break;
            };
            let app_tx = app_tx.clone();
            let max_frame = config.max_message_size_local;
            compio::runtime::spawn(async move {
                drive_peer_connection(stream, app_tx, max_frame).await;
            })
            .detach();
        }
        ipc::unlink(&node);
    })
    .detach();
}

/// Direct spoke-to-spoke connection: only user messages travel here.
async fn drive_peer_connection(
    stream: compio::net::UnixStream,
    app_tx: Sender<SpokeEvent>,
    max_frame: usize,
) {
    let (event_rx, _cmd_tx) = spawn_stream_actor(stream);

    let mut decoder = FrameDecoder::new(max_frame);
    let mut buffer = FrameBuffer::new();

    while let Ok(event) = event_rx.recv_async().await {
        match event {
            ConnectionEvent::Connected => {}
            ConnectionEvent::Received(bytes) => {
                buffer.push(bytes);
                while let Ok(Some(raw)) = decoder.decode(&mut buffer) {
                    match Command::decode_payload(raw.id, &raw.payload) {
                        Ok(Command::Send(message)) => {
                            let _ = app_tx.send(SpokeEvent::Message(message));
                        }
                        Ok(Command::Notify(message)) | Ok(Command::NotifyOne(message)) => {
                            let _ = app_tx.send(SpokeEvent::Notification(message));
                        }
                        Ok(other) => debug!("peer sent unexpected {:?}", other.id()),
                        Err(e) => warn!("dropping malformed peer frame: {e}"),
                    }
                }
            }
            ConnectionEvent::Disconnected => break,
        }
    }
}
