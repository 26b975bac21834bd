//! Background acquisition loop
//!
//! One worker thread drives repeated capture cycles using one of three
//! strategies. Cancellation is cooperative: the stop and one-shot flags are
//! only observed at iteration boundaries, and cleanup (stop plus resets)
//! runs unconditionally when the loop exits, however it exits. A timed-out
//! wait empties the iteration but never aborts the run; only an explicit
//! stop, a consumed one-shot, or a failed capture start ends it.

use crate::actions::wait_until;
use crate::interconnect::Interconnect;
use crate::model::SensorModel;
use crate::registers::RegAddr;
use kstring::KString;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll period for capture completion flags
const CAPTURE_POLL: Duration = Duration::from_millis(250);

/// Device register holding the per-capture sample count
const SAMPLE_COUNT_REG: RegAddr = RegAddr(0x06);

/// Device register naming the event batch size in free-running mode
const EVENT_BATCH_REG: &str = "N_EVENTS";

/// The three mutually-exclusive acquisition strategies
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum CaptureMode {
    /// Start, wait for a full frame, stop, read a fixed-size image buffer
    #[default]
    Standard,
    /// Start once, then stream variable-length event batches sized from a
    /// device register
    FreeRunningRaw,
    /// Start and stop every iteration, sizing the batch from the hardware
    /// event counter
    TimestampRaw,
}

/// Per-device-type lifecycle hooks, invoked synchronously from the capture
/// thread. Failures are logged per iteration and never end the run.
pub trait CaptureHooks: Send {
    fn on_init_capture(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_before_capture(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_after_capture(&mut self, _raw: &[u32]) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_end_capture(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Chip-specific self-test, dispatched on demand between runs
    fn on_test(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The do-nothing hook set
#[derive(Debug, Default, Copy, Clone)]
pub struct NullHooks;

impl CaptureHooks for NullHooks {}

/// Builds the hook set for one device type
pub type HookFactory = fn() -> Box<dyn CaptureHooks>;

/// Explicit chip-name → hook-factory registry, populated by registration
/// calls at startup
#[derive(Default)]
pub struct HookRegistry {
    factories: HashMap<KString, HookFactory>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, chip_name: &str, factory: HookFactory) {
        self.factories.insert(KString::from_ref(chip_name), factory);
    }

    #[must_use]
    pub fn create(&self, chip_name: &str) -> Option<Box<dyn CaptureHooks>> {
        self.factories.get(chip_name).map(|factory| factory())
    }

    /// Like [`HookRegistry::create`], falling back to [`NullHooks`] with a
    /// warning when the chip is unknown
    #[must_use]
    pub fn create_or_default(&self, chip_name: &str) -> Box<dyn CaptureHooks> {
        self.create(chip_name).unwrap_or_else(|| {
            warn!(chip_name, "no hooks registered for this chip, using the defaults");
            Box::new(NullHooks)
        })
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("chips", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Drives the acquisition loop on a background thread
pub struct CaptureController<I> {
    model: Arc<SensorModel<I>>,
    hooks: Arc<Mutex<Box<dyn CaptureHooks>>>,
    mode: Mutex<CaptureMode>,
    shutdown: Arc<AtomicBool>,
    halt: Arc<AtomicBool>,
    one_shot: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<I> CaptureController<I>
where
    I: Interconnect + Send + 'static,
{
    #[must_use]
    pub fn new(model: Arc<SensorModel<I>>, hooks: Box<dyn CaptureHooks>) -> Self {
        Self {
            model,
            hooks: Arc::new(Mutex::new(hooks)),
            mode: Mutex::new(CaptureMode::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            halt: Arc::new(AtomicBool::new(true)),
            one_shot: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Build a controller with the hook set registered for the model's chip
    #[must_use]
    pub fn with_registry(model: Arc<SensorModel<I>>, registry: &HookRegistry) -> Self {
        let hooks = registry.create_or_default(model.chip_name());
        Self::new(model, hooks)
    }

    /// Select the strategy for the next run
    pub fn set_capture_mode(&self, mode: CaptureMode) {
        *lock(&self.mode) = mode;
    }

    #[must_use]
    pub fn capture_mode(&self) -> CaptureMode {
        *lock(&self.mode)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start the continuous loop; a no-op while a run is live
    pub fn start_continuous(&self) {
        self.halt.store(false, Ordering::SeqCst);
        self.spawn();
    }

    /// Run a single capture cycle; a no-op while a run is live
    pub fn capture_once(&self) {
        self.spawn_with(|| self.one_shot.store(true, Ordering::SeqCst));
    }

    /// Request a stop and block until the worker finishes its in-flight
    /// iteration and terminates. There is no deadline on this join.
    pub fn stop(&self) {
        self.halt.store(true, Ordering::SeqCst);
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Stop and mark the controller as shutting down for good
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop();
    }

    /// Run the hook set's self-test; refused while a capture run is live
    pub fn run_test(&self) {
        if self.is_running() {
            warn!("self-test refused, a capture run is live");
            return;
        }
        let mut hooks = lock(&self.hooks);
        if let Err(e) = hooks.on_test() {
            error!(error = %e, "self-test failed");
        }
    }

    fn spawn(&self) {
        self.spawn_with(|| {});
    }

    /// Spawn the worker unless one is live; `prepare` runs only when a new
    /// worker is actually started, with the slot lock held
    fn spawn_with(&self, prepare: impl FnOnce()) {
        let mut slot = lock(&self.worker);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("capture already running");
            return;
        }
        prepare();
        let worker = Worker {
            model: Arc::clone(&self.model),
            hooks: Arc::clone(&self.hooks),
            mode: *lock(&self.mode),
            shutdown: Arc::clone(&self.shutdown),
            halt: Arc::clone(&self.halt),
            one_shot: Arc::clone(&self.one_shot),
        };
        *slot = Some(std::thread::spawn(move || worker.run()));
    }
}

impl<I> std::fmt::Debug for CaptureController<I>
where
    I: Interconnect + Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureController")
            .field("mode", &self.capture_mode())
            .field("running", &self.is_running())
            .finish()
    }
}

struct Worker<I> {
    model: Arc<SensorModel<I>>,
    hooks: Arc<Mutex<Box<dyn CaptureHooks>>>,
    mode: CaptureMode,
    shutdown: Arc<AtomicBool>,
    halt: Arc<AtomicBool>,
    one_shot: Arc<AtomicBool>,
}

impl<I> Worker<I>
where
    I: Interconnect,
{
    fn run(&self) {
        self.hook("on_init_capture", |h| h.on_init_capture());
        if self.should_enter() {
            match self.mode {
                CaptureMode::Standard => self.standard_loop(),
                CaptureMode::FreeRunningRaw => self.free_running_loop(),
                CaptureMode::TimestampRaw => self.timestamp_loop(),
            }
        }
        self.cleanup();
        self.hook("on_end_capture", |h| h.on_end_capture());
        debug!("capture thread finished");
    }

    fn should_enter(&self) -> bool {
        self.one_shot.load(Ordering::SeqCst)
            || (!self.halt.load(Ordering::SeqCst) && !self.shutdown.load(Ordering::SeqCst))
    }

    /// Evaluate the termination conditions at an iteration boundary.
    /// Returns true when the loop must exit; consumes a pending one-shot.
    fn finish_iteration(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return true;
        }
        if self.one_shot.swap(false, Ordering::SeqCst) {
            return true;
        }
        self.halt.load(Ordering::SeqCst)
    }

    /// Stop the capture and reset FIFO, RAM and the readout periphery, no
    /// matter how the loop ended
    fn cleanup(&self) {
        let actions = self.model.actions();
        if let Err(e) = actions.stop_capture() {
            error!(error = %e, "capture stop failed during cleanup");
        }
        if let Err(e) = actions.reset_fifo() {
            error!(error = %e, "fifo reset failed during cleanup");
        }
        if let Err(e) = actions.reset_ram() {
            error!(error = %e, "ram reset failed during cleanup");
        }
        if let Err(e) = actions.reset_peripheral() {
            error!(error = %e, "periphery reset failed during cleanup");
        }
    }

    fn hook(&self, name: &str, f: impl FnOnce(&mut dyn CaptureHooks) -> anyhow::Result<()>) {
        let mut hooks = lock(&self.hooks);
        if let Err(e) = f(hooks.as_mut()) {
            error!(hook = name, error = %e, "capture hook failed");
        }
    }

    fn standard_loop(&self) {
        let actions = self.model.actions();
        let timeout = self.model.operation_timeout();
        let nsamples = self
            .model
            .device_register_value_by_address(SAMPLE_COUNT_REG)
            .filter(|n| *n > 0)
            .unwrap_or(1) as usize;
        loop {
            let t1 = Instant::now();
            self.hook("on_before_capture", |h| h.on_before_capture());
            if let Err(e) = actions.start_capture() {
                error!(error = %e, "capture start failed");
                break;
            }
            let captured = wait_until(
                || actions.is_captured().unwrap_or(false),
                timeout,
                CAPTURE_POLL,
            );
            if let Err(e) = actions.stop_capture() {
                error!(error = %e, "capture stop failed");
                break;
            }
            if captured {
                match self.model.read_image(nsamples) {
                    Ok(raw) => {
                        self.hook("on_after_capture", |h| h.on_after_capture(&raw));
                        self.model.notify();
                    }
                    Err(e) => error!(error = %e, "image readout failed"),
                }
            } else {
                error!("image readout timeout");
            }
            if self.finish_iteration() {
                break;
            }
            debug!(elapsed_ms = t1.elapsed().as_millis() as u64, "capture iteration");
        }
    }

    fn free_running_loop(&self) {
        let actions = self.model.actions();
        let timeout = self.model.operation_timeout();
        self.hook("on_before_capture", |h| h.on_before_capture());
        // Clear a stale events-done latch before arming
        let _ = actions.events_done();
        if let Err(e) = actions.start_capture() {
            error!(error = %e, "capture start failed");
            return;
        }
        let n_events = match self.model.read_device_register(EVENT_BATCH_REG) {
            Ok(value) => (value as usize / 4) * 32,
            Err(e) => {
                error!(error = %e, "event batch size unavailable");
                return;
            }
        };
        loop {
            let ready = wait_until(
                || actions.events_done().unwrap_or(false),
                timeout,
                CAPTURE_POLL,
            );
            if ready {
                let t1 = Instant::now();
                if let Ok(count) = actions.event_count() {
                    info!(events = count, "event batch ready");
                }
                match self.model.read_raw(n_events) {
                    Ok(raw) => {
                        self.hook("on_after_capture", |h| h.on_after_capture(&raw));
                        self.model.notify();
                        self.log_event_rate(n_events, &raw);
                        self.check_backpressure(n_events);
                        debug!(elapsed_ms = t1.elapsed().as_millis() as u64, "event readout");
                    }
                    Err(e) => error!(error = %e, "event readout failed"),
                }
            } else {
                error!("event readout timeout");
            }
            if self.finish_iteration() {
                break;
            }
        }
    }

    fn timestamp_loop(&self) {
        let actions = self.model.actions();
        let timeout = self.model.operation_timeout();
        self.hook("on_before_capture", |h| h.on_before_capture());
        let _ = actions.events_done();
        loop {
            if let Err(e) = actions.start_capture() {
                error!(error = %e, "capture start failed");
                break;
            }
            let captured = wait_until(
                || actions.is_captured().unwrap_or(false),
                timeout,
                CAPTURE_POLL,
            );
            if captured {
                let t1 = Instant::now();
                if let Err(e) = actions.stop_capture() {
                    error!(error = %e, "capture stop failed");
                    break;
                }
                // Batch length comes from the hardware counter, per cycle
                let n_events = actions
                    .event_count()
                    .map(|count| (count as usize / 4) * 32)
                    .unwrap_or(0);
                match self.model.read_raw(n_events) {
                    Ok(raw) => {
                        self.hook("on_after_capture", |h| h.on_after_capture(&raw));
                        self.model.notify();
                        self.log_event_rate(n_events, &raw);
                        self.check_backpressure(n_events);
                        debug!(elapsed_ms = t1.elapsed().as_millis() as u64, "event readout");
                    }
                    Err(e) => error!(error = %e, "event readout failed"),
                }
            } else {
                error!("image readout timeout");
            }
            if self.finish_iteration() {
                break;
            }
        }
    }

    fn log_event_rate(&self, n_events: usize, raw: &[u32]) {
        if raw.len() > 1 {
            let span = raw[raw.len() - 1].wrapping_sub(raw[1]);
            if span > 0 {
                let rate = 0.125 * n_events as f64 / f64::from(span);
                info!(rate_meps = format_args!("{rate:.2}"), "new event data appended");
            }
        }
    }

    /// The producer outrunning the consumer is worth a warning but never
    /// stops the loop
    fn check_backpressure(&self, n_events: usize) {
        if let Ok((rd, wr)) = self.model.actions().ram_addresses() {
            if wr.wrapping_sub(rd) as usize > 2 * n_events {
                warn!(
                    read_addr = rd,
                    write_addr = wr,
                    "event data arriving faster than it is being read out"
                );
            }
        }
    }
}
