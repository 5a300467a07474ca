//! Orientation-manager supervision.
//!
//! The orientation manager is an external process. The supervisor exposes
//! idempotent start/stop/restart operations, probes the known server port to
//! decide whether the process is already running (a successful UDP bind means
//! it is not), throttles restarts, and stops the manager when no client has
//! pulsed for a while.

use parking_lot::Mutex;
use std::net::UdpSocket;
use std::process::Command;
use std::time::{Duration, Instant};

/// Minimum spacing between start attempts.
pub const RESTART_THROTTLE: Duration = Duration::from_secs(10);

/// Settle time after a kill before starting again.
pub const KILL_SETTLE: Duration = Duration::from_secs(2);

/// With no orientation client pulse for this long, a running manager is
/// stopped.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Platform command lines for controlling the manager. `None` disables the
/// action (log only), which tests rely on.
#[derive(Debug, Clone, Default)]
pub struct ServiceCommands {
    pub start: Option<Vec<String>>,
    /// Start command is a long-running executable rather than a service
    /// manager call; spawn it detached instead of waiting.
    pub start_detached: bool,
    pub stop: Option<Vec<String>>,
}

impl ServiceCommands {
    pub fn platform_defaults() -> Self {
        #[cfg(target_os = "macos")]
        {
            let uid = unsafe { libc::getuid() };
            let target = format!("gui/{uid}/com.mach1.spatial.orientationmanager");
            Self {
                start: Some(vec![
                    "/bin/launchctl".into(),
                    "kickstart".into(),
                    "-p".into(),
                    target.clone(),
                ]),
                start_detached: false,
                stop: Some(vec![
                    "/bin/launchctl".into(),
                    "kill".into(),
                    "9".into(),
                    target,
                ]),
            }
        }

        #[cfg(target_os = "windows")]
        {
            Self {
                start: Some(vec!["sc".into(), "start".into(), "M1-OrientationManager".into()]),
                start_detached: false,
                stop: Some(vec!["sc".into(), "stop".into(), "M1-OrientationManager".into()]),
            }
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            let exe = std::path::PathBuf::from("/opt/Mach1").join("m1-orientationmanager");
            Self {
                start: Some(vec![exe.to_string_lossy().into_owned()]),
                start_detached: true,
                stop: Some(vec!["pkill".into(), "m1-orientationmanager".into()]),
            }
        }
    }

    /// No-op command set for tests and embedded use.
    pub fn disabled() -> Self {
        Self::default()
    }
}

struct State {
    last_start: Option<Instant>,
    client_requested: bool,
    last_client_seen: Instant,
}

pub struct Supervisor {
    server_port: u16,
    commands: ServiceCommands,
    throttle: Duration,
    settle: Duration,
    idle_timeout: Duration,
    state: Mutex<State>,
}

impl Supervisor {
    pub fn new(server_port: u16) -> Self {
        Self::with_commands(server_port, ServiceCommands::platform_defaults())
    }

    pub fn with_commands(server_port: u16, commands: ServiceCommands) -> Self {
        Self::with_timings(
            server_port,
            commands,
            RESTART_THROTTLE,
            KILL_SETTLE,
            CLIENT_IDLE_TIMEOUT,
        )
    }

    pub fn with_timings(
        server_port: u16,
        commands: ServiceCommands,
        throttle: Duration,
        settle: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            server_port,
            commands,
            throttle,
            settle,
            idle_timeout,
            state: Mutex::new(State {
                last_start: None,
                client_requested: false,
                last_client_seen: Instant::now(),
            }),
        }
    }

    /// Port probe: if we can bind the server port ourselves, nothing is
    /// serving on it.
    pub fn is_running(&self) -> bool {
        match UdpSocket::bind(("127.0.0.1", self.server_port)) {
            Ok(socket) => {
                drop(socket);
                false
            }
            Err(_) => true,
        }
    }

    /// A client asked for the manager; acted on at the next tick.
    pub fn request_start(&self) {
        self.state.lock().client_requested = true;
    }

    /// An orientation client pulsed; push the idle-kill window out.
    pub fn note_client_seen(&self) {
        self.state.lock().last_client_seen = Instant::now();
    }

    /// Start the manager unless it is already running. Idempotent.
    pub fn start(&self) -> bool {
        if self.is_running() {
            tracing::debug!(port = self.server_port, "orientation manager already running");
            return false;
        }
        self.run_start();
        self.state.lock().last_start = Some(Instant::now());
        true
    }

    /// Stop the manager. Idempotent: stopping a stopped manager is a no-op
    /// at the service-manager level.
    pub fn stop(&self) {
        if let Some(argv) = &self.commands.stop {
            run_command(argv, "stop orientation manager", false);
        } else {
            tracing::debug!("no stop command configured");
        }
    }

    /// Kill and restart, if a client asked for it and the throttle allows.
    /// Sleeps for the settle window between kill and start.
    pub fn restart_if_needed(&self) -> bool {
        {
            let state = self.state.lock();
            if !state.client_requested {
                return false;
            }
            if let Some(last) = state.last_start {
                if last.elapsed() < self.throttle {
                    return false;
                }
            }
        }

        tracing::info!("restarting orientation manager on client request");
        self.stop();
        std::thread::sleep(self.settle);
        self.run_start();

        let mut state = self.state.lock();
        state.client_requested = false;
        state.last_start = Some(Instant::now());
        true
    }

    /// Periodic duty: serve pending start requests (throttled) and stop a
    /// manager nobody is using.
    pub fn tick(&self) {
        let (requested, throttled, idle) = {
            let state = self.state.lock();
            let throttled = state
                .last_start
                .map(|t| t.elapsed() < self.throttle)
                .unwrap_or(false);
            let idle = state.last_client_seen.elapsed() > self.idle_timeout;
            (state.client_requested, throttled, idle)
        };

        if idle && self.is_running() {
            tracing::info!("no orientation clients seen, stopping manager");
            self.stop();
            self.state.lock().last_client_seen = Instant::now();
        }

        if requested {
            if self.is_running() {
                self.state.lock().client_requested = false;
            } else if !throttled {
                self.run_start();
                let mut state = self.state.lock();
                state.client_requested = false;
                state.last_start = Some(Instant::now());
            }
        }
    }

    fn run_start(&self) {
        if let Some(argv) = &self.commands.start {
            run_command(argv, "start orientation manager", self.commands.start_detached);
        } else {
            tracing::debug!("no start command configured");
        }
    }

    #[cfg(test)]
    fn last_start(&self) -> Option<Instant> {
        self.state.lock().last_start
    }
}

fn run_command(argv: &[String], what: &str, detached: bool) {
    let Some((program, args)) = argv.split_first() else {
        return;
    };
    let mut command = Command::new(program);
    command.args(args);

    if detached {
        match command.spawn() {
            Ok(child) => tracing::info!(what, pid = child.id(), "spawned"),
            Err(err) => tracing::warn!(what, %err, "failed to spawn"),
        }
        return;
    }

    match command.status() {
        Ok(status) if status.success() => tracing::info!(what, "ok"),
        Ok(status) => tracing::warn!(what, ?status, "command failed"),
        Err(err) => tracing::warn!(what, %err, "could not run command"),
    }
}
