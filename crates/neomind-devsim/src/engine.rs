//! Per-device simulation engine.
//!
//! Each device runs as one tokio task that owns all of its state. Callers
//! talk to it through a [`DeviceHandle`]. Network work is spawned and its
//! outcome is posted back as an internal event tagged with the connection
//! session; outcomes from an older session are dropped.

use std::collections::HashMap;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use crate::config::SimulationConfig;
use crate::connection::{pick_restart_loop_ms, ConnectionManager, ConnectionState, ProvisioningPoll};
use crate::credentials::{derive_symmetric_key, expiry_from_hours, ConnectionString, HubCredentials};
use crate::edge::{module_status_patch, EdgeEnvironment, StatusOverride, EDGE_AGENT_MODULE};
use crate::error::{DevSimError, Result};
use crate::function::FunctionEndpoint;
use crate::hub::{CloudMessage, HubClient, HubConnector, HubEvent, MethodRequest, TelemetryMessage, Twin, COMPONENT_PROPERTY};
use crate::index::ResolverIndex;
use crate::model::{Comm, Device, DeviceKind, Method};
use crate::plugin::DevicePlugin;
use crate::provisioning::{parse_payload, ProvisioningClient, Registration, RegistrationRequest};
use crate::registry::{ensure_module, RegistryAccess, RegistryClient};
use crate::resolver::ValueResolver;
use crate::router::{self, ControlCommand, MethodInvocation, RouteOutcome};
use crate::scheduler::{FunctionCall, RunloopScheduler, TICK_MS};
use crate::sink::MessageSink;
use crate::stats::{Channel, StatKind, Stats};
use crate::tags::{format_line, ControlEvent, ControlPlane, Direction, Operation, Scope, SUB_COMPONENT};
use crate::transform::{PayloadTransformer, ROOT_GROUP};

/// Collaborators shared by every device of a fleet.
#[derive(Clone)]
pub struct DeviceServices {
    pub config: Arc<SimulationConfig>,
    pub sink: Arc<dyn MessageSink>,
    pub connector: Arc<dyn HubConnector>,
    pub provisioning: Arc<dyn ProvisioningClient>,
    pub registry: Option<Arc<dyn RegistryClient>>,
    pub functions: Option<Arc<dyn FunctionEndpoint>>,
    pub plugin: Option<Arc<dyn DevicePlugin>>,
    pub environment: EdgeEnvironment,
}

impl DeviceServices {
    pub fn new(
        config: Arc<SimulationConfig>,
        sink: Arc<dyn MessageSink>,
        connector: Arc<dyn HubConnector>,
        provisioning: Arc<dyn ProvisioningClient>,
    ) -> Self {
        Self {
            config,
            sink,
            connector,
            provisioning,
            registry: None,
            functions: None,
            plugin: None,
            environment: EdgeEnvironment::default(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_function_endpoint(mut self, functions: Arc<dyn FunctionEndpoint>) -> Self {
        self.functions = Some(functions);
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn DevicePlugin>) -> Self {
        self.plugin = Some(plugin);
        self
    }

    pub fn with_environment(mut self, environment: EdgeEnvironment) -> Self {
        self.environment = environment;
        self
    }
}

/// Point-in-time view of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub state: ConnectionState,
    pub running: bool,
    /// Last control-plane event.
    pub control_status: ControlEvent,
    /// Hub host of the current connection.
    pub hub_name: Option<String>,
    pub stats: Stats,
}

enum Command {
    Start {
        delay: Option<Duration>,
        edge_hub_name: Option<String>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    UpdateDevice {
        device: Box<Device>,
        value_only: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateTwin(Map<String, Value>),
    UpdateMsg(Map<String, Value>),
    UpdateEdgeModules(Map<String, Value>),
    ReadTwin(oneshot::Sender<Value>),
    ReadMethodParams(oneshot::Sender<HashMap<String, MethodInvocation>>),
    Snapshot(oneshot::Sender<DeviceSnapshot>),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running device task.
#[derive(Clone)]
pub struct DeviceHandle {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl DeviceHandle {
    /// Spawn the task for `device`.
    pub fn spawn(device: Device, services: DeviceServices) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = device.id.clone();
        let engine = DeviceEngine::new(device, services, rx);
        tokio::spawn(engine.run());
        Self { id, commands: tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| DevSimError::Stopped)
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| DevSimError::Stopped)
    }

    /// Start the device, optionally after a delay. A start while running or
    /// while a delayed start is pending is ignored.
    pub fn start(&self, delay: Option<Duration>, edge_hub_name: Option<String>) -> Result<()> {
        self.send(Command::Start { delay, edge_hub_name })
    }

    /// Stop the device and wait until teardown is done.
    pub async fn stop(&self) -> Result<()> {
        self.ask(|reply| Command::Stop { reply }).await
    }

    /// Replace the device definition. Rejected when the connection string changed.
    pub async fn update_device(&self, device: Device, value_only: bool) -> Result<()> {
        self.ask(|reply| Command::UpdateDevice {
            device: Box::new(device),
            value_only,
            reply,
        })
        .await?
    }

    /// Queue out-of-band twin values, keyed by property id.
    pub fn update_twin(&self, payload: Map<String, Value>) -> Result<()> {
        self.send(Command::UpdateTwin(payload))
    }

    /// Queue out-of-band telemetry values, keyed by property id.
    pub fn update_msg(&self, payload: Map<String, Value>) -> Result<()> {
        self.send(Command::UpdateMsg(payload))
    }

    /// Set the module running flags reported by an edge device.
    pub fn update_edge_modules(&self, modules: Map<String, Value>) -> Result<()> {
        self.send(Command::UpdateEdgeModules(modules))
    }

    /// Desired values received so far.
    pub async fn read_twin(&self) -> Result<Value> {
        self.ask(Command::ReadTwin).await
    }

    /// Last invocation of each method, keyed by method id.
    pub async fn read_method_params(&self) -> Result<HashMap<String, MethodInvocation>> {
        self.ask(Command::ReadMethodParams).await
    }

    pub async fn snapshot(&self) -> Result<DeviceSnapshot> {
        self.ask(Command::Snapshot).await
    }

    /// Stop the device and end its task.
    pub async fn shutdown(&self) -> Result<()> {
        self.ask(|reply| Command::Shutdown { reply }).await
    }
}

/// Outcomes of spawned work.
enum Internal {
    Registered {
        session: u64,
        key: String,
        result: Result<Registration>,
    },
    ClientReady {
        session: u64,
        result: Result<Arc<dyn HubClient>>,
    },
    Opened {
        session: u64,
        result: Result<()>,
    },
    TwinFetched {
        session: u64,
        result: Result<Twin>,
    },
    Sent {
        session: u64,
        channel: Channel,
        sub: Option<String>,
        data: String,
        live: Map<String, Value>,
        result: Result<()>,
    },
    MethodAnswered {
        session: u64,
        method: Box<Method>,
        payload: Value,
        result: Result<()>,
    },
    FunctionReply {
        property_id: String,
        result: Result<f64>,
    },
    ControlDue {
        session: u64,
        name: String,
    },
    Closed {
        result: Result<()>,
    },
}

/// Console logger usable from spawned tasks.
#[derive(Clone)]
struct DeviceLog {
    device_id: String,
    sink: Arc<dyn MessageSink>,
}

impl DeviceLog {
    fn line(&self, scope: Scope, op: Operation, direction: Option<Direction>, sub: Option<&str>, message: &str) {
        let line = format_line(scope, op, &self.device_id, direction, sub, message);
        debug!(device_id = %self.device_id, scope = %scope, op = %op, "{}", message);
        self.sink.send_console_update(&line);
    }

    fn ops(&self, scope: Scope, message: &str) {
        self.line(scope, Operation::Proc, None, None, message);
    }
}

#[derive(Default)]
struct Timers {
    delayed_start: Option<Pin<Box<Sleep>>>,
    dps_poll: Option<Interval>,
    restart: Option<Interval>,
    msg: Option<Interval>,
    twin: Option<Interval>,
    edge_status: Option<Interval>,
    delayed_stop: Option<Pin<Box<Sleep>>>,
    firmware: Option<Pin<Box<Sleep>>>,
}

fn repeating(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn hub_event(events: &mut Option<mpsc::UnboundedReceiver<HubEvent>>) -> Option<HubEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

fn error_text(error: &DevSimError) -> String {
    match error {
        DevSimError::Provisioning {
            registration_state: Some(state),
            ..
        } => state.clone(),
        DevSimError::Provisioning { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// Deep merge `patch` into `target`, objects recursively, everything else replaced.
fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                merge_json(target.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Keep derived runloop periods across a definition swap.
fn carry_periods(old: &Device, new: &mut Device) {
    for comm in new.comms.iter_mut() {
        let Some(property) = comm.as_property_mut() else {
            continue;
        };
        let Some(runloop) = property.runloop.as_mut().filter(|r| r.period_ms.is_none()) else {
            continue;
        };
        runloop.period_ms = old
            .comms
            .iter()
            .filter_map(Comm::as_property)
            .find(|p| p.id == property.id)
            .and_then(|p| p.runloop.as_ref())
            .and_then(|r| r.period_ms);
    }
}

struct DeviceEngine {
    device: Device,
    services: DeviceServices,
    log: DeviceLog,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    index: ResolverIndex,
    scheduler: RunloopScheduler,
    transformer: PayloadTransformer,
    resolver: ValueResolver,
    connection: ConnectionManager,
    stats: Stats,
    control_status: ControlEvent,
    client: Option<Arc<dyn HubClient>>,
    hub_events: Option<mpsc::UnboundedReceiver<HubEvent>>,
    hub_name: Option<String>,
    edge_hub_name: Option<String>,
    connection_string: Option<String>,
    edge_modules: Map<String, Value>,
    desired_cache: Value,
    method_params: HashMap<String, MethodInvocation>,
    sas_expiry: u64,
    timers: Timers,
}

impl DeviceEngine {
    fn new(device: Device, services: DeviceServices, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let config = services.config.clone();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let mut resolver = ValueResolver::new(
            config.ranges.clone(),
            config.geo_area(device.configuration.geo_index()),
        );
        let restart_loop_ms = pick_restart_loop_ms(&config, &mut resolver);
        let log = DeviceLog {
            device_id: device.id.clone(),
            sink: services.sink.clone(),
        };
        let template = device.is_template();

        let mut engine = Self {
            device: Device::default(),
            services,
            log,
            commands,
            internal_tx,
            internal_rx,
            index: ResolverIndex::default(),
            scheduler: RunloopScheduler::new(),
            transformer: PayloadTransformer::new(),
            resolver,
            connection: ConnectionManager::new(restart_loop_ms),
            stats: Stats::new(),
            control_status: ControlEvent::Off,
            client: None,
            hub_events: None,
            hub_name: None,
            edge_hub_name: None,
            connection_string: None,
            edge_modules: Map::new(),
            desired_cache: Value::Object(Map::new()),
            method_params: HashMap::new(),
            sas_expiry: expiry_from_hours(config.simulation.sas_expire_hours),
            timers: Timers::default(),
        };

        if template {
            engine.device = device;
        } else {
            engine.apply_device(device, false);
        }
        engine
    }

    async fn run(mut self) {
        info!(device_id = %self.device.id, kind = ?self.device.kind(), "Device task started");
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.timers.firmware = None;
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(event) = self.internal_rx.recv() => self.handle_internal(event),
                event = hub_event(&mut self.hub_events) => match event {
                    Some(event) => self.handle_hub_event(event),
                    None => self.hub_events = None,
                },
                _ = elapsed(&mut self.timers.delayed_start) => {
                    self.timers.delayed_start = None;
                    self.start_device();
                }
                _ = tick(&mut self.timers.dps_poll) => self.poll_provisioning(),
                _ = tick(&mut self.timers.restart) => self.force_reconnect(),
                _ = tick(&mut self.timers.msg) => self.runloop(Channel::Msg),
                _ = tick(&mut self.timers.twin) => self.runloop(Channel::Twin),
                _ = tick(&mut self.timers.edge_status) => self.report_module_status(None),
                _ = elapsed(&mut self.timers.delayed_stop) => {
                    self.timers.delayed_stop = None;
                    self.stop();
                }
                _ = elapsed(&mut self.timers.firmware) => {
                    self.timers.firmware = None;
                    self.start(None, None);
                }
            }
        }
        info!(device_id = %self.device.id, "Device task ended");
    }

    // Bookkeeping

    fn running(&self) -> bool {
        self.connection.is_running()
    }

    fn stat(&mut self, kind: StatKind) {
        self.stats.record(kind);
        self.services.sink.send_as_stats(&self.device.id, &self.stats);
    }

    fn control(&mut self, scope: Scope, event: ControlEvent) {
        self.control_status = event;
        self.services
            .sink
            .send_as_control_plane(&self.device.id, ControlPlane(scope, Operation::Proc, event));
    }

    fn is_module(&self) -> bool {
        self.device.kind().is_module()
    }

    fn kind_label(&self) -> &'static str {
        if self.is_module() {
            "MODULE"
        } else {
            "DEVICE"
        }
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.device.id.clone(),
            state: self.connection.state(),
            running: self.running(),
            control_status: self.control_status,
            hub_name: self.hub_name.clone(),
            stats: self.stats.clone(),
        }
    }

    // Commands

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { delay, edge_hub_name } => self.start(delay, edge_hub_name),
            Command::Stop { reply } => {
                self.timers.firmware = None;
                self.stop();
                let _ = reply.send(());
            }
            Command::UpdateDevice {
                device,
                value_only,
                reply,
            } => {
                let _ = reply.send(self.update_device(*device, value_only));
            }
            Command::UpdateTwin(payload) => self.scheduler.update(Channel::Twin, payload),
            Command::UpdateMsg(payload) => self.scheduler.update(Channel::Msg, payload),
            Command::UpdateEdgeModules(modules) => self.edge_modules = modules,
            Command::ReadTwin(reply) => {
                let _ = reply.send(self.desired_cache.clone());
            }
            Command::ReadMethodParams(reply) => {
                let _ = reply.send(self.method_params.clone());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn update_device(&mut self, device: Device, value_only: bool) -> Result<()> {
        if device.is_template() || self.device.is_template() {
            return Ok(());
        }
        if self.device.connection_string() != device.connection_string() {
            self.log.ops(
                Scope::Device,
                "DEVICE/MODULE UPDATE ERROR. CONNECTION STRING HAS CHANGED. DELETE DEVICE",
            );
            return Err(DevSimError::ConnectionStringChanged(self.device.id.clone()));
        }
        self.apply_device(device, value_only);
        Ok(())
    }

    fn apply_device(&mut self, mut device: Device, value_only: bool) {
        carry_periods(&self.device, &mut device);
        self.device = device;
        if let Some(plugin) = &self.services.plugin {
            plugin.configure_device(&self.device.configuration.device_id, self.running());
        }
        if value_only {
            return;
        }

        self.log.ops(Scope::Device, "DEVICE/MODULE HAS BEEN CONFIGURED");
        self.stat(StatKind::Reconfigures);

        self.index = ResolverIndex::build(&self.device.comms);
        let running = self.running();
        self.scheduler.rebuild(
            &mut self.device,
            &self.index,
            &self.services.config,
            &mut self.resolver,
            running,
        );
    }

    // Start

    fn start(&mut self, delay: Option<Duration>, edge_hub_name: Option<String>) {
        if edge_hub_name.is_some() {
            self.edge_hub_name = edge_hub_name;
        }
        if self.device.is_template() {
            return;
        }
        if self.timers.delayed_start.is_some() || self.running() {
            return;
        }

        match delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                self.log.ops(
                    Scope::Hub,
                    &format!("DEVICE/MODULE DELAYED START SECONDS: {}", delay.as_secs_f64()),
                );
                self.control(Scope::Hub, ControlEvent::Delay);
                self.timers.delayed_start = Some(Box::pin(sleep(delay)));
            }
            None => self.start_device(),
        }
    }

    fn start_device(&mut self) {
        if self.is_module() {
            self.start_module();
            return;
        }

        self.log.ops(Scope::Device, "DEVICE IS SWITCHED ON");
        self.control(Scope::Device, ControlEvent::On);
        self.stat(StatKind::On);

        if self.device.kind().requires_provisioning() {
            let retries = match self.services.config.simulation.dps_retries {
                0 => crate::config::defaults::DPS_RETRIES,
                n => n,
            };
            self.connection.begin_provisioning(retries);
            let poll = Duration::from_millis(self.services.config.simulation.connect_ms.max(1));
            self.timers.dps_poll = Some(repeating(poll));
        } else {
            self.connection.begin_connecting();
            let cs = self.device.configuration.connection_string.clone();
            self.connect_loop(cs);
        }
    }

    fn start_module(&mut self) {
        self.log.ops(Scope::Module, "MODULE IS SWITCHED ON");
        self.control(Scope::Device, ControlEvent::On);
        self.stat(StatKind::On);
        self.client = None;
        self.hub_name = None;

        self.log.ops(Scope::Module, "MODULE INIT");
        self.control(Scope::Module, ControlEvent::Trying);
        let session = self.connection.begin_connecting();

        let device_id = self.device.configuration.device_id.clone();
        let Some(module_id) = self.device.configuration.module_id.clone() else {
            self.log.ops(Scope::Module, "MODULE HAS NO MODULE ID. MODULE WILL SHUTDOWN");
            self.control(Scope::Module, ControlEvent::Off);
            self.connection.stopped();
            return;
        };

        if self.device.kind() == DeviceKind::ModuleHosted {
            let env = self.services.environment.clone();
            if let Err(e) = env.check(&device_id, &module_id) {
                let reason = if env.is_present() {
                    format!(
                        "MODULE '{}' DOES NOT MATCH THE MANIFEST CONFIGURATION FOR HOST DEVICE/MODULE (NOT A FAILURE)",
                        module_id
                    )
                } else {
                    format!("MODULE '{}' ENVIRONMENT CHECK FAILED - MISSING IOTEDGE_*", module_id)
                };
                debug!(device_id = %self.device.id, error = %e, "Module environment check");
                self.log.ops(Scope::Module, &reason);
                self.log.ops(Scope::Device, "MODULE WILL SHUTDOWN");
                self.control(Scope::Module, ControlEvent::Off);
                self.connection.stopped();
                return;
            }

            let connector = self.services.connector.clone();
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let result = connector.create_from_environment(&env).await;
                let _ = tx.send(Internal::ClientReady { session, result });
            });
            return;
        }

        let Some(hub) = self.edge_hub_name.clone() else {
            self.log.ops(
                Scope::Module,
                &format!(
                    "MODULE '{}' CANNOT BE STARTED AS NO KNOWN HUBNAME FOR HOST. EDGE DEVICE PROBABLY FAILED TO START",
                    module_id
                ),
            );
            self.stop();
            return;
        };

        let config = &self.device.configuration;
        let gateway_key = config.gateway_sas_key.clone().unwrap_or_default();
        let key = if config.is_master_key {
            let gateway_id = config.gateway_device_id.as_deref().unwrap_or(&device_id);
            match derive_symmetric_key(&gateway_key, gateway_id) {
                Ok(key) => key,
                Err(e) => {
                    self.log.ops(Scope::Module, &format!("MODULE KEY DERIVATION FAILED: {}", e));
                    self.stat(StatKind::Errors);
                    self.stop();
                    return;
                }
            }
        } else {
            gateway_key
        };

        self.hub_name = Some(hub.clone());
        let credentials = HubCredentials::ConnectionString(
            ConnectionString::new(hub.clone(), device_id.clone())
                .with_key(key.clone())
                .with_module(module_id.clone()),
        );
        let registry = self.services.registry.clone();
        let connector = self.services.connector.clone();
        let log = self.log.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Some(registry) = registry {
                let access = RegistryAccess { host_name: hub, key };
                if let Err(e) = ensure_module(registry.as_ref(), &access, &device_id, &module_id).await {
                    log.ops(Scope::Module, &format!("MODULE IDENTITY CHECK FAILED: {}", e));
                }
            }
            let result = connector.create(credentials).await;
            let _ = tx.send(Internal::ClientReady { session, result });
        });
    }

    // Provisioning

    fn poll_provisioning(&mut self) {
        match self.connection.poll_provisioning() {
            ProvisioningPoll::Connect(cs) => {
                self.timers.dps_poll = None;
                self.connect_loop(Some(cs));
            }
            ProvisioningPoll::Exhausted => {
                self.timers.dps_poll = None;
                self.log.ops(Scope::Dps, "DPS RETRIES EXHAUSTED");
                self.stop();
                self.stat(StatKind::Errors);
            }
            ProvisioningPoll::Attempt { remaining } => {
                self.log.ops(Scope::Dps, "ATTEMPTING DPS REGISTRATION");
                self.control(Scope::Dps, ControlEvent::Trying);
                self.register(remaining);
            }
            ProvisioningPoll::Wait => {}
        }
    }

    fn register(&mut self, remaining: u32) {
        let config = self.device.configuration.clone();
        let sas_key = config.sas_key.clone().unwrap_or_default();
        let key = if config.is_master_key {
            derive_symmetric_key(&sas_key, &config.device_id)
        } else {
            Ok(sas_key)
        };
        let key = match key {
            Ok(key) => key,
            Err(e) => {
                self.log.ops(Scope::Dps, &format!("REGISTRATION ERROR {}: {}", remaining, e));
                self.control(Scope::Dps, ControlEvent::Error);
                self.connection.registration_failed();
                return;
            }
        };

        let request = RegistrationRequest {
            global_endpoint: self.services.config.provisioning.global_endpoint.clone(),
            id_scope: config.scope_id.clone().unwrap_or_default(),
            registration_id: config.device_id.clone(),
            symmetric_key: key.clone(),
            payload: parse_payload(config.dps_payload.as_deref()),
        };

        self.log.ops(Scope::Dps, "WAITING FOR REGISTRATION");
        self.control(Scope::Dps, ControlEvent::Trying);

        let session = self.connection.session();
        let provisioning = self.services.provisioning.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = provisioning.register(request).await;
            let _ = tx.send(Internal::Registered { session, key, result });
        });
    }

    fn on_registered(&mut self, key: String, result: Result<Registration>) {
        match result {
            Err(e) => {
                self.log.ops(
                    Scope::Dps,
                    &format!("REGISTRATION ERROR {}: {}", self.connection.retries_left(), error_text(&e)),
                );
                self.control(Scope::Dps, ControlEvent::Error);
                self.connection.registration_failed();
            }
            Ok(registration) => {
                let mut cs = ConnectionString::new(registration.assigned_hub, registration.device_id).with_key(key);
                if self.device.kind() == DeviceKind::LeafDevice {
                    if let Some(gateway) = &self.device.configuration.gateway_device_id {
                        cs = cs.with_gateway(gateway.clone());
                    }
                }
                self.connection.registration_succeeded(cs.to_string());
                self.log.ops(Scope::Dps, "DEVICE REGISTRATION SUCCESS");
                self.control(Scope::Dps, ControlEvent::Success);
                self.stat(StatKind::Dps);
            }
        }
    }

    // Connect

    fn connect_loop(&mut self, connection_string: Option<String>) {
        self.log.ops(Scope::Hub, "IOT HUB INITIAL CONNECT START");
        self.control(Scope::Hub, ControlEvent::Init);
        self.connection_string = connection_string;
        self.connect_client();

        if let Some(plugin) = &self.services.plugin {
            plugin.post_connect(&self.device.configuration.device_id);
            self.log.ops(Scope::Device, "DEVICE/MODULE IS USING A PLUGIN");
        }
        self.report_module_status(Some(StatusOverride::Start));

        let period = Duration::from_millis(self.connection.restart_loop_ms().max(TICK_MS as u64));
        self.timers.restart = Some(repeating(period));
    }

    fn connect_client(&mut self) {
        self.client = None;
        self.hub_name = None;
        let session = self.connection.session();

        let sas_mode = self.services.config.simulation.sas_mode;
        let credentials = self
            .connection_string
            .as_deref()
            .ok_or_else(|| DevSimError::ConnectionString("device has no connection string".into()))
            .and_then(|cs| HubCredentials::from_connection_string(cs, sas_mode, self.sas_expiry));
        let credentials = match credentials {
            Ok(credentials) => credentials,
            Err(e) => {
                self.transport_failure(&format!("SDK OPEN ERROR (CHECK CONN STRING): {}", e));
                return;
            }
        };

        self.hub_name = Some(credentials.host_name().to_string());
        match &credentials {
            HubCredentials::SharedAccessSignature { token, .. } => self.log.ops(
                Scope::Hub,
                &format!("CONNECTING VIA SAS.TOKEN EXPIRES AFTER {} HOURS", token.hours_left()),
            ),
            HubCredentials::ConnectionString(_) => self.log.ops(Scope::Hub, "CONNECTING VIA CONN STRING"),
        }
        self.stat(StatKind::Connects);
        self.log.ops(
            Scope::Hub,
            &format!(
                "DEVICE/MODULE AUTO RESTARTS EVERY {} MINUTES",
                self.connection.restart_loop_ms() / 60_000
            ),
        );

        let connector = self.services.connector.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = connector.create(credentials).await;
            let _ = tx.send(Internal::ClientReady { session, result });
        });
    }

    fn on_client_ready(&mut self, result: Result<Arc<dyn HubClient>>) {
        match result {
            Ok(client) => {
                self.client = Some(client);
                if self.is_module() {
                    let module_id = self.device.configuration.module_id.clone().unwrap_or_default();
                    self.log.ops(
                        Scope::Module,
                        &format!("MODULE '{}' CHECK PASSED. ENTERING MAIN LOOP", module_id),
                    );
                    self.control(Scope::Module, ControlEvent::Connected);
                }
                self.main_loop();
            }
            Err(e) if self.device.kind() == DeviceKind::ModuleHosted => {
                let module_id = self.device.configuration.module_id.clone().unwrap_or_default();
                self.log.ops(
                    Scope::Module,
                    &format!(
                        "MODULE '{}' FAILED TO CONNECT THROUGH ENVIRONMENT TO IOT HUB: {}",
                        module_id, e
                    ),
                );
                self.log.ops(Scope::Device, &format!("MODULE '{}' WILL SHUTDOWN", module_id));
                self.control(Scope::Module, ControlEvent::Off);
                self.connection.stopped();
            }
            Err(e) => self.transport_failure(&format!("SDK OPEN ERROR (CHECK CONN STRING): {}", e)),
        }
    }

    fn main_loop(&mut self) {
        if !self.running() {
            return;
        }
        let Some(client) = self.client.clone() else {
            return;
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.hub_events = Some(events_rx);

        let session = self.connection.session();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = client.open(events_tx).await;
            let _ = tx.send(Internal::Opened { session, result });
        });
    }

    fn on_opened(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.transport_failure(&format!("SDK OPEN ERROR (CHECK CONN STRING): {}", e));
            return;
        }
        let Some(client) = self.client.clone() else {
            return;
        };

        self.connection.connected();
        self.log.ops(
            Scope::Hub,
            if self.is_module() {
                "IOT HUB MODULE CLIENT CONNECTED"
            } else {
                "IOT HUB CLIENT CONNECTED"
            },
        );

        let methods: Vec<String> = self.index.direct_key_to_index.keys().cloned().collect();
        let log = self.log.clone();
        let session = self.connection.session();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            for name in methods {
                if let Err(e) = client.register_method(&name).await {
                    log.ops(Scope::Hub, &format!("DIRECT METHOD {} REGISTRATION FAILED: {}", name, e));
                }
            }
            let result = client.get_twin().await;
            let _ = tx.send(Internal::TwinFetched { session, result });
        });

        self.log.ops(
            Scope::Hub,
            if self.device.plan_mode() {
                "PLAN MODE"
            } else {
                "INTERACTIVE MODE"
            },
        );
        self.control(Scope::Hub, ControlEvent::Connected);

        self.scheduler.arm_startup(&self.device.comms);
        self.timers.msg = Some(repeating(Duration::from_millis(TICK_MS as u64)));

        if self.device.kind() == DeviceKind::Edge {
            let period = Duration::from_millis(self.services.config.simulation.edge_status_ms.max(1));
            self.timers.edge_status = Some(repeating(period));
        }
    }

    fn on_twin(&mut self, result: Result<Twin>) {
        let twin = match result {
            Ok(twin) => twin,
            Err(e) => {
                self.log.ops(
                    Scope::Hub,
                    &format!("IOT HUB TWIN REQUEST FAILED. CLIENT IN BAD STATE: {}", e),
                );
                self.stat(StatKind::Errors);
                self.stop();
                return;
            }
        };

        if self.device.comms.is_empty() {
            self.log.ops(
                Scope::Hub,
                "DEVICE/MODULE HAS NO CAPABILITIES DEFINED. DEVICE/MODULE CAN RECEIVE EVENTS BUT WILL NOT SEND ANY DATA",
            );
        } else if let Some(ms) = self.scheduler.first_send_ms() {
            self.log.ops(
                Scope::Hub,
                &format!(
                    "LOOPS HAVE BEEN DEFINED. DATA WILL START SENDING IN {:.1} MINUTES",
                    ms as f64 / 60_000.0
                ),
            );
        } else {
            self.log.ops(Scope::Hub, "NO LOOPS HAVE BEEN DEFINED. SEND DATA MANUALLY");
        }

        if twin.desired.as_object().is_some_and(|d| !d.is_empty()) {
            self.on_desired(twin.desired);
        }

        self.timers.twin = Some(repeating(Duration::from_millis(TICK_MS as u64)));
    }

    // Inbound

    fn handle_hub_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::DesiredPatch(delta) => self.on_desired(delta),
            HubEvent::DirectMethod(request) => self.on_direct_method(request),
            HubEvent::CloudMessage(message) => {
                if self.device.kind() != DeviceKind::Module {
                    self.on_cloud_message(message);
                }
            }
            HubEvent::Disconnected(reason) => {
                self.transport_failure(&format!("IOT HUB CONNECTION LOST: {}", reason));
            }
        }
    }

    fn on_desired(&mut self, delta: Value) {
        self.stat(StatKind::Desired);
        merge_json(&mut self.desired_cache, &delta);
        self.log
            .line(Scope::Hub, Operation::Twin, Some(Direction::Recv), None, &delta.to_string());
        self.connection.clear_restarting();

        let outcome = router::route_desired(&mut self.device, &self.index, &delta);
        self.apply_outcome(outcome);
    }

    fn apply_outcome(&mut self, outcome: RouteOutcome) {
        for (channel, payload) in outcome.updates {
            self.scheduler.update(channel, payload);
        }
        for (property_id, over) in outcome.overrides {
            self.transformer.set_override(property_id, over);
        }
        if let (Some(patch), Some(client)) = (outcome.reported, self.client.clone()) {
            let log = self.log.clone();
            tokio::spawn(async move {
                let text = match client.update_reported(patch.clone()).await {
                    Ok(()) => patch.to_string(),
                    Err(e) => e.to_string(),
                };
                log.line(Scope::Hub, Operation::Twin, Some(Direction::Send), None, &text);
            });
        }
    }

    fn on_direct_method(&mut self, request: MethodRequest) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let method = self
            .index
            .direct_key_to_index
            .get(&request.method_name)
            .and_then(|i| self.device.comms.get(*i))
            .and_then(Comm::as_method)
            .cloned();
        let Some(method) = method else {
            warn!(device_id = %self.device.id, method = %request.method_name, "Unknown direct method");
            return;
        };

        let shown = if request.payload.is_null() {
            "<NO PAYLOAD>".to_string()
        } else {
            request.payload.to_string()
        };
        self.log.line(
            Scope::Hub,
            Operation::Method,
            Some(Direction::Recv),
            Some("DIRECT METHOD REQUEST AND PAYLOAD"),
            &format!("{} : {}", request.method_name, shown),
        );
        self.method_params
            .insert(method.id.clone(), MethodInvocation::now(request.payload));

        let request_id = request.request_id;
        let payload = method.response_payload();
        let status = method.status;
        let session = self.connection.session();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = client
                .respond_method(&request_id, status, payload.clone())
                .await;
            let _ = tx.send(Internal::MethodAnswered {
                session,
                method: Box::new(method),
                payload,
                result,
            });
        });
    }

    fn on_method_answered(&mut self, method: Method, payload: Value, result: Result<()>) {
        let text = match result {
            Ok(()) => format!("{} -> [{}] {}", method.name, method.status, payload),
            Err(e) => e.to_string(),
        };
        self.log.line(
            Scope::Hub,
            Operation::Method,
            Some(Direction::Send),
            Some("DIRECT METHOD RESPONSE PAYLOAD"),
            &text,
        );
        self.stat(StatKind::Commands);
        let mut live = Map::new();
        live.insert(method.id.clone(), Value::String(chrono::Utc::now().to_rfc2822()));
        self.services.sink.send_as_live_update(&self.device.id, &live);

        self.method_followup(&method);
    }

    fn method_followup(&mut self, method: &Method) {
        let outcome = router::method_response(&self.device, &self.index, method);
        self.apply_outcome(outcome);

        let session = self.connection.session();
        let name = method.name.clone();
        let drain = Duration::from_millis(self.services.config.simulation.method_drain_ms);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            sleep(drain).await;
            let _ = tx.send(Internal::ControlDue { session, name });
        });
    }

    fn on_cloud_message(&mut self, message: CloudMessage) {
        let failed = match router::parse_cloud_message(&message) {
            Ok(command) => {
                let method = self
                    .index
                    .c2d_key_to_index
                    .get(&command.method)
                    .and_then(|i| self.device.comms.get(*i))
                    .and_then(Comm::as_method)
                    .cloned();
                if let Some(method) = method {
                    self.log.line(
                        Scope::Hub,
                        Operation::Method,
                        Some(Direction::Recv),
                        Some("C2D REQUEST AND PAYLOAD"),
                        &format!("{} {}", command.method, command.payload),
                    );
                    self.stat(StatKind::C2d);
                    self.method_params
                        .insert(method.id.clone(), MethodInvocation::now(command.payload));
                    self.method_followup(&method);
                }
                false
            }
            Err(e) => {
                self.log.line(
                    Scope::Hub,
                    Operation::Method,
                    Some(Direction::Send),
                    Some("C2D ERROR PARSING MESSAGE BODY"),
                    &e.to_string(),
                );
                true
            }
        };

        let Some(client) = self.client.clone() else {
            return;
        };
        let log = self.log.clone();
        tokio::spawn(async move {
            let text = match client.complete(&message).await {
                Err(e) => e.to_string(),
                Ok(()) if failed => "FAILED".to_string(),
                Ok(()) => "SUCCESS".to_string(),
            };
            log.line(Scope::Hub, Operation::Proc, None, Some("C2D COMPLETE"), &text);
        });
    }

    fn on_control_due(&mut self, name: &str) {
        let Some(command) = ControlCommand::from_method(&self.services.config.commands, name) else {
            return;
        };
        match command {
            ControlCommand::Shutdown => {
                self.log
                    .ops(Scope::Hub, "DEVICE/MODULE METHOD SHUTDOWN ... STOPPING IMMEDIATELY");
                self.stop();
            }
            ControlCommand::Reboot => {
                self.log
                    .ops(Scope::Hub, "DEVICE/MODULE METHOD REBOOT ... RESTARTING IMMEDIATELY");
                self.stop();
                self.start(None, None);
            }
            ControlCommand::Firmware => {
                let ms = self.services.config.simulation.firmware_ms;
                self.log.ops(
                    Scope::Hub,
                    &format!("DEVICE/MODULE METHOD FIRMWARE ... RESTARTING IN {} SECONDS", ms / 1000),
                );
                self.stop();
                self.timers.firmware = Some(Box::pin(sleep(Duration::from_millis(ms))));
            }
        }
    }

    // Runloop

    fn runloop(&mut self, channel: Channel) {
        let Some(client) = self.client.clone() else {
            match channel {
                Channel::Msg => self.timers.msg = None,
                Channel::Twin => self.timers.twin = None,
            }
            return;
        };

        let out = self.scheduler.tick(channel, &self.device.comms, &mut self.resolver);
        self.call_functions(out.function_calls);
        if out.payload.is_empty() {
            return;
        }

        let transformed = self.transformer.transform(
            &self.device.id,
            &self.device.comms,
            &self.index,
            &out.payload,
            &mut self.resolver,
            self.services.plugin.as_deref(),
        );

        let session = self.connection.session();
        for (group, values) in transformed.package {
            let sub = (group != ROOT_GROUP).then(|| group.clone());
            let client = client.clone();
            let tx = self.internal_tx.clone();
            let live = transformed.live.clone();

            match channel {
                Channel::Msg => {
                    let data = Value::Object(values).to_string();
                    let mut message = TelemetryMessage::json(data.clone());
                    if let Some(sub) = &sub {
                        message = message.with_property(COMPONENT_PROPERTY, sub.clone());
                    }
                    tokio::spawn(async move {
                        let result = client.send_event(message).await;
                        let _ = tx.send(Internal::Sent {
                            session,
                            channel,
                            sub,
                            data,
                            live,
                            result,
                        });
                    });
                }
                Channel::Twin => {
                    let patch = match &sub {
                        Some(component) => {
                            let mut values = values;
                            values.insert("__t".to_string(), Value::String(SUB_COMPONENT.to_lowercase()));
                            let mut wrapped = Map::new();
                            wrapped.insert(component.clone(), Value::Object(values));
                            Value::Object(wrapped)
                        }
                        None => Value::Object(values),
                    };
                    let data = patch.to_string();
                    tokio::spawn(async move {
                        let result = client.update_reported(patch).await;
                        let _ = tx.send(Internal::Sent {
                            session,
                            channel,
                            sub,
                            data,
                            live,
                            result,
                        });
                    });
                }
            }
        }
    }

    fn call_functions(&mut self, calls: Vec<FunctionCall>) {
        if calls.is_empty() {
            return;
        }
        let Some(functions) = self.services.functions.clone() else {
            debug!(device_id = %self.device.id, "No function endpoint configured");
            return;
        };
        for call in calls {
            let functions = functions.clone();
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let result = functions.call(&call.url, call.value).await;
                let _ = tx.send(Internal::FunctionReply {
                    property_id: call.property_id,
                    result,
                });
            });
        }
    }

    fn on_sent(&mut self, channel: Channel, sub: Option<String>, data: String, live: Map<String, Value>, result: Result<()>) {
        match result {
            Ok(()) => {
                let op = match channel {
                    Channel::Msg => Operation::Msg,
                    Channel::Twin => Operation::Twin,
                };
                self.log
                    .line(Scope::Hub, op, Some(Direction::Send), sub.as_deref(), &data);
                self.stat(StatKind::Sent(channel));
                self.services.sink.send_as_live_update(&self.device.id, &live);
            }
            Err(e) => self.transport_failure(&format!("SDK CLOSE ERROR: {}", e)),
        }
    }

    // Edge

    fn report_module_status(&mut self, over: Option<StatusOverride>) {
        if self.device.kind() != DeviceKind::Edge {
            return;
        }
        let Some(hub) = self.hub_name.clone() else {
            return;
        };
        let config = &self.device.configuration;
        let sas_key = config.sas_key.clone().unwrap_or_default();
        let key = if config.is_master_key {
            derive_symmetric_key(&sas_key, &config.device_id)
        } else {
            Ok(sas_key)
        };
        let running = self.running();
        let key = match key {
            Ok(key) => key,
            Err(e) => {
                if running {
                    self.log.ops(Scope::Edge, &format!("CANNOT UPDATE MODULES STATUS: {}", e));
                }
                return;
            }
        };

        let credentials = HubCredentials::ConnectionString(
            ConnectionString::new(hub, config.device_id.clone())
                .with_key(key)
                .with_module(EDGE_AGENT_MODULE),
        );
        let patch = module_status_patch(&self.edge_modules, over, running);
        let connector = self.services.connector.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            let result: Result<()> = async {
                let agent = connector.create(credentials).await?;
                let (events, _ignored) = mpsc::unbounded_channel();
                agent.open(events).await?;
                let outcome = async {
                    agent.get_twin().await?;
                    agent.update_reported(patch).await
                }
                .await;
                let _ = agent.close().await;
                outcome
            }
            .await;
            if let Err(e) = result {
                if running {
                    log.ops(
                        Scope::Edge,
                        &format!("CANNOT UPDATE MODULES STATUS. EDGE DEVICE SHOULD BE RESTARTED: {}", e),
                    );
                }
            }
        });
    }

    // Teardown

    fn transport_failure(&mut self, message: &str) {
        self.log.ops(Scope::Hub, message);
        self.control(Scope::Hub, ControlEvent::Error);
        self.stat(StatKind::Errors);
        if self.timers.delayed_stop.is_none() {
            let delay = Duration::from_millis(self.services.config.simulation.transport_stop_ms);
            self.timers.delayed_stop = Some(Box::pin(sleep(delay)));
        }
    }

    fn force_reconnect(&mut self) {
        self.log.ops(Scope::Hub, "IOT HUB RECONNECT LOOP START");
        self.control(Scope::Hub, ControlEvent::Init);
        self.stat(StatKind::Restart);
        self.connection.begin_reconnect();
        self.clean_up();
        self.connect_client();
    }

    fn clean_up(&mut self) {
        self.timers.msg = None;
        self.timers.twin = None;
        self.timers.edge_status = None;
        self.timers.delayed_stop = None;
        self.hub_events = None;
        self.hub_name = None;

        if let Some(client) = self.client.take() {
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let result = client.close().await;
                let _ = tx.send(Internal::Closed { result });
            });
        }
        self.stat(StatKind::Off);
    }

    /// Idempotent: a stopped device is left untouched.
    fn stop(&mut self) {
        if self.timers.delayed_start.take().is_some() {
            self.log.ops(Scope::Device, "DEVICE/MODULE DELAYED START CANCELED");
            self.control(Scope::Hub, ControlEvent::Off);
        } else if self.running() {
            self.log.ops(Scope::Device, &format!("{} WILL SHUTDOWN", self.kind_label()));
        }

        if !self.running() {
            return;
        }

        self.report_module_status(Some(StatusOverride::Stop));
        self.control(Scope::Device, ControlEvent::Off);
        if let Some(plugin) = &self.services.plugin {
            plugin.stop_device(&self.device.configuration.device_id);
        }

        self.timers.restart = None;
        self.timers.dps_poll = None;
        self.clean_up();
        self.connection.stopped();
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Registered { session, key, result } => {
                if self.connection.is_current(session) {
                    self.on_registered(key, result);
                }
            }
            Internal::ClientReady { session, result } => {
                if self.connection.is_current(session) {
                    self.on_client_ready(result);
                } else if let Ok(client) = result {
                    tokio::spawn(async move {
                        let _ = client.close().await;
                    });
                }
            }
            Internal::Opened { session, result } => {
                if self.connection.is_current(session) {
                    self.on_opened(result);
                }
            }
            Internal::TwinFetched { session, result } => {
                if self.connection.is_current(session) {
                    self.on_twin(result);
                }
            }
            Internal::Sent {
                session,
                channel,
                sub,
                data,
                live,
                result,
            } => {
                if self.connection.is_current(session) {
                    self.on_sent(channel, sub, data, live, result);
                }
            }
            Internal::MethodAnswered {
                session,
                method,
                payload,
                result,
            } => {
                if self.connection.is_current(session) {
                    self.on_method_answered(*method, payload, result);
                }
            }
            Internal::FunctionReply { property_id, result } => match result {
                Ok(value) => self.scheduler.set_sensor_value(&property_id, value),
                Err(e) => warn!(device_id = %self.device.id, property_id = %property_id, "Function call failed: {}", e),
            },
            Internal::ControlDue { session, name } => {
                if self.connection.is_current(session) {
                    self.on_control_due(&name);
                }
            }
            Internal::Closed { result } => {
                if let Err(e) = result {
                    self.log
                        .ops(Scope::Device, &format!("DEVICE/MODULE CLIENT TEARDOWN ERROR: {}", e));
                    self.stat(StatKind::Errors);
                }
            }
        }
    }
}
