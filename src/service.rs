//! Composition root.
//!
//! Builds the event bus, registries, tracker, mixer, supervisor, and the OSC
//! dispatcher in dependency order, then runs the periodic work on plain
//! threads: the dispatcher loop (20 ms ping/reap inside), a 1 s discovery and
//! supervision tick, a 100 ms segment refresh, and the mixing loop. Every
//! periodic task checks the stop signal at the top of its tick.

use crate::clients::ClientRegistry;
use crate::config::HelperConfig;
use crate::discovery::{ScannerConfig, SegmentScanner, SCAN_INTERVAL, UPDATE_INTERVAL};
use crate::error::Result;
use crate::events::EventBus;
use crate::mixer::SpatialMixer;
use crate::osc::sender::OscSender;
use crate::osc::OscDispatcher;
use crate::plugins::PluginRegistry;
use crate::supervisor::{ServiceCommands, Supervisor};
use crate::tracker::PannerTracker;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Mixing cadence; the bus consumes whatever the refresh tick drained.
const MIX_INTERVAL: Duration = Duration::from_millis(10);

pub struct HelperService {
    stop_flag: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
    events: Arc<EventBus>,
    clients: Arc<ClientRegistry>,
    plugins: Arc<PluginRegistry>,
    tracker: Arc<PannerTracker>,
    mixer: Arc<SpatialMixer>,
    supervisor: Arc<Supervisor>,
    scanner: Arc<SegmentScanner>,
    helper_port: u16,
}

impl HelperService {
    /// Build and start with platform defaults.
    pub fn start(config: HelperConfig) -> Result<Self> {
        Self::start_with(
            config,
            ScannerConfig::default(),
            ServiceCommands::platform_defaults(),
        )
    }

    /// Build and start with explicit scanner and supervisor wiring.
    pub fn start_with(
        config: HelperConfig,
        scanner_config: ScannerConfig,
        commands: ServiceCommands,
    ) -> Result<Self> {
        let events = Arc::new(EventBus::new());
        let sender = Arc::new(OscSender::new()?);
        let clients = Arc::new(ClientRegistry::new(Arc::clone(&sender), Arc::clone(&events)));
        let plugins = Arc::new(PluginRegistry::new(Arc::clone(&sender), Arc::clone(&events)));
        let tracker = Arc::new(PannerTracker::new(Arc::clone(&events)));
        let mixer = Arc::new(SpatialMixer::default());
        let supervisor = Arc::new(Supervisor::with_commands(config.server_port, commands));
        let scanner = Arc::new(SegmentScanner::new(
            scanner_config,
            Arc::clone(&tracker),
            Arc::clone(&mixer),
        ));
        let dispatcher = Arc::new(OscDispatcher::bind(
            config.helper_port,
            Arc::clone(&sender),
            Arc::clone(&clients),
            Arc::clone(&plugins),
            Arc::clone(&tracker),
            Arc::clone(&mixer),
            Arc::clone(&supervisor),
        )?);
        let helper_port = dispatcher.local_port();

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let mut threads = Vec::new();

        // Dispatcher context: socket loop with the 20 ms ping/reap tick.
        {
            let dispatcher = Arc::clone(&dispatcher);
            let stop = Arc::clone(&stop_flag);
            threads.push(spawn_named("osc-dispatch", move || dispatcher.run(&stop)));
        }

        // Discovery and supervision: 1 s cadence.
        {
            let scanner = Arc::clone(&scanner);
            let supervisor = Arc::clone(&supervisor);
            let stop_rx = stop_rx.clone();
            threads.push(spawn_named("discovery", move || {
                run_periodic(&stop_rx, SCAN_INTERVAL, || {
                    scanner.scan();
                    supervisor.tick();
                    supervisor.restart_if_needed();
                });
            }));
        }

        // Segment refresh: 100 ms cadence.
        {
            let scanner = Arc::clone(&scanner);
            let stop_rx = stop_rx.clone();
            threads.push(spawn_named("segment-refresh", move || {
                run_periodic(&stop_rx, UPDATE_INTERVAL, || scanner.refresh());
            }));
        }

        // Mixing context: drain the bus.
        {
            let mixer = Arc::clone(&mixer);
            let stop_rx = stop_rx.clone();
            threads.push(spawn_named("spatial-mix", move || {
                let mut scratch = Vec::new();
                run_periodic(&stop_rx, MIX_INTERVAL, || {
                    mixer.process_block(&mut scratch);
                });
            }));
        }

        Ok(Self {
            stop_flag,
            stop_tx: Some(stop_tx),
            threads,
            events,
            clients,
            plugins,
            tracker,
            mixer,
            supervisor,
            scanner,
            helper_port,
        })
    }

    pub fn helper_port(&self) -> u16 {
        self.helper_port
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn tracker(&self) -> &Arc<PannerTracker> {
        &self.tracker
    }

    pub fn mixer(&self) -> &Arc<SpatialMixer> {
        &self.mixer
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn scanner(&self) -> &Arc<SegmentScanner> {
        &self.scanner
    }

    /// Block until the service is stopped from another thread (or forever in
    /// the daemon case).
    pub fn wait(mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Cooperative shutdown: signal every periodic task and join.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.stop_tx.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("service stopped");
    }
}

impl Drop for HelperService {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.shutdown();
        }
    }
}

fn spawn_named(name: &str, body: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("thread spawn")
}

/// Run `tick` on a fixed cadence until the stop channel closes. The stop
/// check happens at the top of every cycle, so shutdown is prompt.
fn run_periodic(stop_rx: &Receiver<()>, interval: Duration, mut tick: impl FnMut()) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => tick(),
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> HelperService {
        let config = HelperConfig {
            server_port: 0,
            helper_port: 0,
        };
        let scanner_config = ScannerConfig {
            search_dirs: vec![],
            ..Default::default()
        };
        HelperService::start_with(config, scanner_config, ServiceCommands::disabled()).unwrap()
    }

    #[test]
    fn test_start_and_stop() {
        let service = test_service();
        assert_ne!(service.helper_port(), 0);
        service.stop();
    }

    #[test]
    fn test_two_services_cannot_share_a_port() {
        let service = test_service();
        let config = HelperConfig {
            server_port: 0,
            helper_port: service.helper_port(),
        };
        let result = HelperService::start_with(
            config,
            ScannerConfig {
                search_dirs: vec![],
                ..Default::default()
            },
            ServiceCommands::disabled(),
        );
        assert!(result.is_err());
        service.stop();
    }
}
