//! Wires the whole appliance together.
//!
//! Construction order matters: the streaming engine first, then the state
//! controller on top of it, then acquisition with its overload reaction,
//! and finally the worker threads (sender fibers, FFT executor, sampler,
//! watchdog ticker). Boot ends by loading the persisted state and pushing
//! it into the converter and the registry.

use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::adc::AdcDriver;
use crate::clock::TickClock;
use crate::fft::memory::FftMemory;
use crate::fft::FftExecutor;
use crate::measure::measurement::Registry;
use crate::measure::state::StateController;
use crate::measure::watchdog::Watchdog;
use crate::measure::{spawn_sampler, Acquisition, MeasureStateCell};
use crate::net;
use crate::net::connection::ConnectionRegistry;
use crate::stream::Streamer;

pub struct Instrument {
    pub clock: Arc<TickClock>,
    pub adc: Arc<dyn AdcDriver>,
    pub registry: Arc<Mutex<Registry>>,
    pub streamer: Arc<Streamer>,
    pub state: Arc<StateController>,
    pub acquisition: Arc<Acquisition>,
    pub watchdog: Arc<Watchdog>,
    pub connections: Arc<ConnectionRegistry>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Instrument {
    pub fn new(adc: Arc<dyn AdcDriver>, data_dir: &Path) -> Arc<Instrument> {
        if let Err(e) = std::fs::create_dir_all(data_dir) {
            warn!("could not create data dir {}: {}", data_dir.display(), e);
        }

        let clock = Arc::new(TickClock::new());
        let registry = Arc::new(Mutex::new(Registry::new()));
        let streamer = Arc::new(Streamer::new());
        let measure_state = Arc::new(MeasureStateCell::new());
        let connections = Arc::new(ConnectionRegistry::new());
        let running = Arc::new(AtomicBool::new(true));

        let state = Arc::new(StateController::new(
            data_dir,
            adc.clone(),
            registry.clone(),
            measure_state.clone(),
            streamer.clone(),
        ));

        let (fft_executor, executor_handle) = FftExecutor::spawn(
            streamer.clone(),
            measure_state.clone(),
            clock.clone(),
            running.clone(),
        );

        let watchdog = Arc::new(Watchdog::new());
        let acquisition = Arc::new(Acquisition::new(
            measure_state,
            adc.clone(),
            registry.clone(),
            streamer.clone(),
            state.clone(),
            watchdog.clone(),
            Arc::new(FftMemory::default()),
            fft_executor,
            clock.clone(),
        ));

        // Descriptor exhaustion: stop taking samples, flag the cause. The
        // streaming engine flushes its queues right after this runs.
        let hook_acquisition = acquisition.clone();
        let hook_state = state.clone();
        streamer.set_overload_hook(Box::new(move || {
            if hook_acquisition.is_active() {
                hook_acquisition.stop();
            }
            hook_state.set_slow_connection_flag();
        }));

        state.load_and_apply();

        let mut threads =
            streamer.spawn_senders(connections.clone(), state.clone(), running.clone());
        threads.push(executor_handle);
        threads.push(spawn_sampler(
            acquisition.clone(),
            adc.clone(),
            running.clone(),
        ));
        threads.push(Self::spawn_watchdog_ticker(
            watchdog.clone(),
            acquisition.clone(),
            state.clone(),
            running.clone(),
        ));

        Arc::new(Instrument {
            clock,
            adc,
            registry,
            streamer,
            state,
            acquisition,
            watchdog,
            connections,
            running,
            threads: Mutex::new(threads),
        })
    }

    fn spawn_watchdog_ticker(
        watchdog: Arc<Watchdog>,
        acquisition: Arc<Acquisition>,
        state: Arc<StateController>,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    // One-second cadence, broken up so shutdown stays quick.
                    for _ in 0..10 {
                        if !running.load(Ordering::Acquire) {
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    if watchdog.tick() {
                        warn!("watchdog: converter stopped producing samples");
                        state.set_adc_reset_flag();
                        acquisition.stop();
                        state.update_adc_state(true);
                    }
                }
            })
            .expect("spawn watchdog ticker")
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Starts accepting clients on the given listener.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        info!(
            "listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into())
        );
        net::spawn_server(self.clone(), listener, self.running.clone())
    }

    /// Stops all worker threads. Connection tasks end on their own once
    /// their sockets close or time out.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Instrument {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
