//! Engine lifecycle: stand up, run, tear down
//!
//! [`ProxyEngine`] is the lifecycle boundary the host drives. It owns
//! the explicit state machine `Created → Running → Stopped`:
//!
//! - [`ProxyEngine::start`] acquires the capture handle and the virtual
//!   stack (unwinding whatever was acquired if a later step fails),
//!   then spawns the long-running loops under one [`TaskManager`]. It
//!   returns immediately with a done-channel receiver that fires if the
//!   proxy dies on its own (unrecoverable capture failure).
//! - [`ProxyEngine::stop`] cancels everything and blocks until full
//!   teardown, in order: task loops → stack → capture → tracker. Every
//!   boundary is idempotent; repeated and concurrent stops converge.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capture::{capture_filter, CaptureBuilder, PacketCapture};
use crate::config::Config;
use crate::divert::{run_divert_loop, Classifier, ProcessTable};
use crate::error::ProxyError;
use crate::forwarder::Forwarder;
use crate::lifecycle::TaskManager;
use crate::netstack::{StackAdapter, StackBuilder, StackConfig, TcpAccept};
use crate::outbound::build_outbound;
use crate::tracker::FlowTracker;

/// Everything the engine needs before `start`
struct CreatedState {
    config: Config,
    capture_builder: Box<dyn CaptureBuilder>,
    stack_builder: Box<dyn StackBuilder>,
    process_table: Arc<dyn ProcessTable>,
}

/// Live resources owned while running
struct RunningState {
    tasks: Arc<TaskManager>,
    adapter: Arc<StackAdapter>,
    capture: Arc<dyn PacketCapture>,
    tracker: Arc<FlowTracker>,
}

enum EngineState {
    Created(Box<CreatedState>),
    Starting,
    Running(Box<RunningState>),
    Stopped,
}

/// The transparent interception engine
pub struct ProxyEngine {
    state: Mutex<EngineState>,
    /// Serializes teardown so concurrent `stop` callers all block until
    /// the first one finishes
    teardown: tokio::sync::Mutex<()>,
}

impl ProxyEngine {
    /// Create an engine from validated configuration and its host
    /// collaborators
    ///
    /// # Errors
    ///
    /// Returns a configuration error if validation fails; resource
    /// acquisition is deferred to [`ProxyEngine::start`].
    pub fn new(
        config: Config,
        capture_builder: Box<dyn CaptureBuilder>,
        stack_builder: Box<dyn StackBuilder>,
        process_table: Arc<dyn ProcessTable>,
    ) -> Result<Self, ProxyError> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(EngineState::Created(Box::new(CreatedState {
                config,
                capture_builder,
                stack_builder,
                process_table,
            }))),
            teardown: tokio::sync::Mutex::new(()),
        })
    }

    /// Stand up all subsystems and return the done-channel receiver
    ///
    /// Returns as soon as everything is running. The receiver yields an
    /// error if the proxy later terminates on its own.
    ///
    /// # Errors
    ///
    /// Resource acquisition failures (capture open, stack creation,
    /// transport construction) are fatal: partially-acquired resources
    /// are released and the engine transitions to `Stopped`.
    pub fn start(&self) -> Result<mpsc::Receiver<ProxyError>, ProxyError> {
        let created = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, EngineState::Starting) {
                EngineState::Created(created) => created,
                other => {
                    let message = match other {
                        EngineState::Running(_) => "start() called while running",
                        EngineState::Starting => "start() called twice",
                        _ => "start() called after stop()",
                    };
                    *state = other;
                    return Err(ProxyError::InvalidState(message));
                }
            }
        };

        match self.start_inner(*created) {
            Ok(done) => Ok(done),
            Err(e) => {
                *self.state.lock() = EngineState::Stopped;
                Err(e)
            }
        }
    }

    fn start_inner(&self, created: CreatedState) -> Result<mpsc::Receiver<ProxyError>, ProxyError> {
        let config = created.config;

        // Transport construction only depends on configuration; fail
        // before touching any OS resource.
        let outbound = build_outbound(&config.proxy, config.connection.connect_timeout())?;

        let filter = capture_filter(config.capture.interface_index);
        let capture = created.capture_builder.open(&filter)?;

        let stack_config = StackConfig::for_mtu(config.capture.mtu);
        let handle = match created.stack_builder.build(&stack_config) {
            Ok(handle) => handle,
            Err(e) => {
                // Unwind the capture handle acquired above
                capture.shutdown();
                capture.close();
                return Err(e.into());
            }
        };

        let tasks = Arc::new(TaskManager::new());
        let tracker = Arc::new(FlowTracker::new(config.tracker.ttl()));
        let adapter = Arc::new(StackAdapter::new(
            handle.stack,
            Arc::clone(&capture),
            config.capture.interface_index,
            config.capture.sub_interface_index,
        ));
        let classifier = Arc::new(
            Classifier::new(
                Arc::clone(&tracker),
                created.process_table,
                config.connection.lookup_timeout(),
            ),
        );
        let forwarder = Arc::new(Forwarder::new(
            outbound,
            tasks.cancellation_token(),
            config.connection.buffer_size,
        ));

        let (fail_tx, fail_rx) = mpsc::channel(1);

        // Tracker eviction sweep
        {
            let tracker = Arc::clone(&tracker);
            let interval = config.tracker.sweep_interval();
            tasks.add_task(1, move |cancel| {
                Arc::clone(&tracker).run_sweeper(interval, cancel)
            });
        }

        // Stack read loop: stack-emitted packets back to the OS
        {
            let adapter = Arc::clone(&adapter);
            tasks.add_task(1, move |cancel| {
                Arc::clone(&adapter).run_read_loop(cancel)
            });
        }

        // Capture read loop: classify and route every outbound packet
        {
            let capture = Arc::clone(&capture);
            let adapter = Arc::clone(&adapter);
            let mtu = config.capture.mtu;
            tasks.add_task(1, move |cancel| {
                run_divert_loop(
                    Arc::clone(&capture),
                    Arc::clone(&classifier),
                    Arc::clone(&adapter),
                    mtu,
                    cancel,
                    fail_tx.clone(),
                )
            });
        }

        // Accept dispatch: one forwarding session per terminated
        // connection
        {
            let accepts = Arc::new(tokio::sync::Mutex::new(handle.accepts));
            let tasks_handle = Arc::clone(&tasks);
            tasks.add_task(1, move |cancel| {
                run_accept_loop(
                    Arc::clone(&accepts),
                    Arc::clone(&forwarder),
                    Arc::clone(&tasks_handle),
                    cancel,
                )
            });
        }

        *self.state.lock() = EngineState::Running(Box::new(RunningState {
            tasks,
            adapter,
            capture,
            tracker,
        }));

        info!(
            transport = config.proxy.kind(),
            interface = config.capture.interface_index,
            "transparent proxy started"
        );
        Ok(fail_rx)
    }

    /// Tear everything down; blocks until complete
    ///
    /// Safe to call at any time, repeatedly, and concurrently: every
    /// caller returns only after teardown has finished.
    pub async fn stop(&self) {
        let _teardown = self.teardown.lock().await;

        let running = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, EngineState::Stopped) {
                EngineState::Running(running) => running,
                _ => return,
            }
        };

        // Phase 1: cancel and drain every task. No new diverted
        // packets; read loops exited; forwarding sessions done.
        running.tasks.stop().await;
        // Phase 2: destroy the stack (link endpoint, stack instance,
        // TCP forwarder), exactly once.
        running.adapter.shutdown();
        // Phase 3: stop and release the capture handle.
        running.capture.shutdown();
        running.capture.close();
        // Phase 4: release the tracker; late callers see no-ops.
        running.tracker.shutdown();

        info!("transparent proxy stopped");
    }

    /// Whether the engine is currently running
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), EngineState::Running(_))
    }
}

/// Dispatch accepted connections to forwarding sessions
async fn run_accept_loop(
    accepts: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<dyn TcpAccept>>>>,
    forwarder: Arc<Forwarder>,
    tasks: Arc<TaskManager>,
    cancel: CancellationToken,
) {
    let mut accepts = accepts.lock().await;
    loop {
        let accept = tokio::select! {
            () = cancel.cancelled() => return,
            accept = accepts.recv() => match accept {
                Some(accept) => accept,
                None => {
                    debug!("accept channel closed");
                    return;
                }
            },
        };
        let forwarder = Arc::clone(&forwarder);
        tasks.spawn_tracked(async move { forwarder.handle(accept).await });
    }
}
