//! Sensor lifecycle.
//!
//! ```text
//! Created -> Initialized -> Running -> ShuttingDown -> Stopped
//! ```
//!
//! [`Honeypot::init`] loads the identity and rules, builds and freezes the
//! handler registry and installs one dispatch callback per eligible rule.
//! [`Honeypot::run`] starts the monitor and the packet engine.
//! [`Honeypot::shutdown`] cancels the global token, then waits for in-flight
//! connections to drain, bounded by the grace interval.

use std::fmt;
use std::sync::Arc;

use snare_id::{ensure_identity, Identity};
use snare_rules::RuleSet;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bootstrap::ProxyBootstrapper;
use crate::config::Config;
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::engine::{PacketEngine, TcpEngine};
use crate::error::{Result, SnareError};
use crate::handler::Handler;
use crate::handlers::builtin_handlers;
use crate::monitor::run_monitor;
use crate::registry::{HandlerRegistry, RegistryError};
use crate::telemetry::{HttpSink, TelemetrySink};

/// Lifecycle state of a [`Honeypot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Initialized,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State produced by a successful [`Honeypot::init`].
struct Runtime {
    identity: Identity,
    engine: Arc<dyn PacketEngine>,
    registry: HandlerRegistry,
    callbacks: Vec<String>,
    stats: Arc<DispatchStats>,
}

/// The honeypot sensor.
pub struct Honeypot {
    config: Config,
    state: Mutex<LifecycleState>,
    engine: Option<Arc<dyn PacketEngine>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    rules: Option<RuleSet>,
    extra_handlers: Vec<(String, Handler)>,
    runtime: Option<Runtime>,
    shutdown: CancellationToken,
    monitor_stop: CancellationToken,
    tracker: TaskTracker,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Honeypot {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: Mutex::new(LifecycleState::Created),
            engine: None,
            telemetry: None,
            rules: None,
            extra_handlers: Vec::new(),
            runtime: None,
            shutdown: CancellationToken::new(),
            monitor_stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
            monitor: Mutex::new(None),
        }
    }

    /// Use `engine` instead of the built-in [`TcpEngine`].
    pub fn with_engine(mut self, engine: Arc<dyn PacketEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Use `sink` instead of the sink described by the configuration.
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Use `rules` instead of loading the configured rule file.
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Register an extra handler alongside the built-ins.
    pub fn with_handler(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.extra_handlers.push((name.into(), handler));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    pub fn identity(&self) -> Option<Identity> {
        self.runtime.as_ref().map(|rt| rt.identity)
    }

    /// The frozen registry, available once initialized.
    pub fn registry(&self) -> Option<&HandlerRegistry> {
        self.runtime.as_ref().map(|rt| &rt.registry)
    }

    /// Handler names a dispatch callback was installed for, sorted.
    pub fn registered_handlers(&self) -> Vec<String> {
        let mut names = self
            .runtime
            .as_ref()
            .map(|rt| rt.callbacks.clone())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn stats(&self) -> Option<Arc<DispatchStats>> {
        self.runtime.as_ref().map(|rt| Arc::clone(&rt.stats))
    }

    /// Dispatches and watchdogs still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// The global shutdown token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Load identity and rules, populate the registry and install dispatch
    /// callbacks.
    ///
    /// Fails without leaving `Created` when identity, rules, configuration
    /// or the packet engine cannot be set up.
    pub async fn init(&mut self) -> Result<()> {
        let state = *self.state.lock().await;
        if state != LifecycleState::Created {
            return Err(SnareError::Lifecycle {
                operation: "init",
                state: state.as_str(),
            });
        }

        let identity = ensure_identity(&self.config.var_dir)?;
        info!(sensor_id = %identity, var_dir = %self.config.var_dir.display(), "Sensor identity loaded");

        let rules = match self.rules.take() {
            Some(rules) => rules,
            None => RuleSet::from_file(&self.config.rules_path)?,
        };
        info!(rule_count = rules.len(), "Rules loaded");

        let telemetry = match self.telemetry.take() {
            Some(sink) => Some(sink),
            None => match &self.config.telemetry_url {
                Some(url) => {
                    let sink = HttpSink::new(url.clone())
                        .map_err(|e| SnareError::Config(format!("telemetry sink: {e}")))?;
                    info!(url = %url, "Telemetry enabled");
                    Some(Arc::new(sink) as Arc<dyn TelemetrySink>)
                }
                None => None,
            },
        };

        let engine: Arc<dyn PacketEngine> = match self.engine.take() {
            Some(engine) => engine,
            None => Arc::new(TcpEngine::new(
                self.config.server_addr,
                self.config.default_handler.clone(),
            )),
        };
        engine.init().await?;

        let registry_error = |e: RegistryError| SnareError::Config(format!("handler registry: {e}"));
        let mut builder = builtin_handlers(&self.config).map_err(registry_error)?;
        for (name, handler) in self.extra_handlers.drain(..) {
            builder.register(name, handler).map_err(registry_error)?;
        }

        let bootstrapper = ProxyBootstrapper::new(self.config.max_tcp_payload);
        let mut bindings = Vec::new();
        for rule in rules.dispatchable() {
            match bootstrapper.bootstrap(&mut builder, rule) {
                Ok(name) => bindings.push((rule.index, name)),
                Err(e) => {
                    warn!(rule = rule.index, target = %rule.target, error = %e, "Skipping rule");
                }
            }
        }
        let registry = builder.freeze();

        let dispatcher = Arc::new(
            Dispatcher::new(
                identity,
                &self.config,
                self.shutdown.clone(),
                self.tracker.clone(),
            )
            .with_telemetry(telemetry),
        );

        // Rules resolving to the same name share one callback.
        let mut callbacks: Vec<String> = Vec::new();
        for (index, name) in bindings {
            if callbacks.contains(&name) {
                debug!(rule = index, handler = %name, "Dispatch callback already installed");
                continue;
            }
            let Some(handler) = registry.lookup(&name) else {
                warn!(rule = index, handler = %name, "No handler found for rule");
                continue;
            };
            engine
                .register_conn_handler(&name, dispatcher.callback(name.as_str(), handler))
                .await?;
            debug!(rule = index, handler = %name, "Dispatch callback installed");
            callbacks.push(name);
        }

        if let Some(name) = &self.config.default_handler {
            match registry.lookup(name) {
                Some(handler) if !callbacks.contains(name) => {
                    engine
                        .register_conn_handler(name, dispatcher.callback(name.as_str(), handler))
                        .await?;
                    callbacks.push(name.clone());
                }
                Some(_) => {}
                None => warn!(handler = %name, "Default handler is not registered"),
            }
        }

        info!(
            handlers = ?registry.names(),
            callbacks = callbacks.len(),
            "Sensor initialized"
        );

        self.runtime = Some(Runtime {
            identity,
            engine,
            registry,
            callbacks,
            stats: dispatcher.stats(),
        });
        *self.state.lock().await = LifecycleState::Initialized;
        Ok(())
    }

    /// Start the monitor and run the packet engine until it stops, then shut
    /// down.
    pub async fn run(&self) -> Result<()> {
        let runtime = {
            let mut state = self.state.lock().await;
            let runtime = match (*state, &self.runtime) {
                (LifecycleState::Initialized, Some(runtime)) => runtime,
                (other, _) => {
                    return Err(SnareError::Lifecycle {
                        operation: "run",
                        state: other.as_str(),
                    })
                }
            };
            *state = LifecycleState::Running;
            runtime
        };

        *self.monitor.lock().await = Some(tokio::spawn(run_monitor(
            self.config.monitor_interval,
            self.tracker.clone(),
            Arc::clone(&runtime.stats),
            self.monitor_stop.clone(),
        )));

        info!(sensor_id = %runtime.identity, "Sensor running");
        let result = runtime.engine.start(self.shutdown.clone()).await;
        if let Err(e) = &result {
            error!(error = %e, "Packet engine failed");
        }

        self.shutdown().await?;
        result
    }

    /// Stop the sensor.
    ///
    /// Only the first call does any work; later calls return immediately.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            match *state {
                LifecycleState::ShuttingDown | LifecycleState::Stopped => {
                    debug!(state = state.as_str(), "Shutdown already requested");
                    return Ok(());
                }
                LifecycleState::Created => {
                    *state = LifecycleState::Stopped;
                    return Ok(());
                }
                LifecycleState::Initialized | LifecycleState::Running => {
                    *state = LifecycleState::ShuttingDown;
                }
            }
        }

        info!(in_flight = self.tracker.len(), "Shutting down");
        self.shutdown.cancel();
        self.monitor_stop.cancel();

        if let Some(monitor) = self.monitor.lock().await.take() {
            if let Err(e) = monitor.await {
                warn!(error = %e, "Monitor task failed");
            }
        }

        self.tracker.close();
        match tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait()).await {
            Ok(()) => info!("In-flight connections drained"),
            Err(_) => warn!(
                remaining = self.tracker.len(),
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "Grace interval elapsed with connections still in flight"
            ),
        }

        if let Some(runtime) = &self.runtime {
            if let Err(e) = runtime.engine.shutdown().await {
                warn!(error = %e, "Packet engine shutdown failed");
            }
        }

        *self.state.lock().await = LifecycleState::Stopped;
        info!("Sensor stopped");
        Ok(())
    }
}
