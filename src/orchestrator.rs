//! Top-level test orchestration
//!
//! [TestOrchestrator] drives one test run end to end: flash the image,
//! start the connection proxy, feed device events through the two-phase
//! state machine, and compute the single final [Verdict]. It owns the
//! wall-clock budget and applies it independently of the proxy, so a stuck
//! transport read can never stall the run past its deadline.
//!
//! The event loop has two phases. Before a supervisor is selected only
//! well-known control keys are consumed; once `__host_test_name` (or the
//! configuration) has selected a supervisor, device events are also routed
//! to its callbacks. Whatever path ends the run, exactly one verdict is
//! produced and announced as a final `{{result;...}}` line.

use std::{
    collections::HashSet,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    config::DeviceConfig,
    error::Error,
    event::{key, Event},
    flasher::{DeviceFlasher, FlashOutcome, FlashRequest},
    lookup::DeviceLookup,
    proxy::{self, HostCommand, ProxyHandle, ProxySettings},
    registry::{CapabilityKind, CapabilityParams, Registry},
    supervisor::{SupervisorContext, SupervisorRegistry, TestSupervisor},
    transport::{self, TransportFactory},
    verdict::Verdict,
};

/// Queue polling interval; keeps timeout checks responsive.
const QUEUE_POLL: Duration = Duration::from_secs(1);
const STARTUP_POLL: Duration = Duration::from_millis(200);
/// How long to wait for the proxy to exit before abandoning it.
const PROXY_GRACE: Duration = Duration::from_secs(2);
/// Upper bound on the post-loop event drain.
const DRAIN_LIMIT: usize = 256;

/// Drives a test run from flash to verdict.
pub struct TestOrchestrator {
    config: DeviceConfig,
    registry: Arc<Registry>,
    supervisors: SupervisorRegistry,
    lookup: Arc<dyn DeviceLookup>,
    cancel: Arc<AtomicBool>,
}

/// Whether the event loop keeps running after an event.
enum Flow {
    Continue,
    Break,
}

/// Mutable state of one run's event loop.
struct RunState {
    deadline: Instant,
    supervisor: Option<Box<dyn TestSupervisor>>,
    dispatch: HashSet<String>,
    setup_ok: bool,
    /// Explicit outcome carried by `__notify_complete`.
    explicit: Option<bool>,
    complete_seen: bool,
    device_exited: bool,
    queue_exited: bool,
    failure: Option<Verdict>,
    timed_out: bool,
    cancelled: bool,
}

impl RunState {
    fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            supervisor: None,
            dispatch: HashSet::new(),
            setup_ok: false,
            explicit: None,
            complete_seen: false,
            device_exited: false,
            queue_exited: false,
            failure: None,
            timed_out: false,
            cancelled: false,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

fn shift_deadline(deadline: Instant, delta: f64) -> Instant {
    if delta >= 0.0 {
        deadline + secs(delta)
    } else {
        deadline
            .checked_sub(secs(-delta))
            .unwrap_or_else(Instant::now)
    }
}

/// Interpret the value carried by `__notify_complete`: an empty value asks
/// the runtime to consult the supervisor's `result()` instead.
fn parse_notify_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" => None,
        "true" | "1" | "pass" | "success" => Some(true),
        "false" | "0" | "fail" | "failure" => Some(false),
        other => {
            warn!("Unrecognized completion value '{}'", other);
            None
        }
    }
}

impl TestOrchestrator {
    pub fn new(
        config: DeviceConfig,
        registry: Registry,
        supervisors: SupervisorRegistry,
        lookup: Arc<dyn DeviceLookup>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            supervisors,
            lookup,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that aborts the run when set (e.g. from a Ctrl-C handler).
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run against the transport selected by the configuration.
    pub fn run(&mut self) -> Verdict {
        match transport::factory_for(&self.config) {
            Ok(factory) => self.run_with_factory(factory),
            Err(e) => {
                error!("{}", e);
                let verdict = Verdict::Error;
                announce(verdict);
                verdict
            }
        }
    }

    /// Run against an explicitly supplied transport factory.
    pub fn run_with_factory(&mut self, factory: TransportFactory) -> Verdict {
        let verdict = self.execute(factory);
        announce(verdict);
        verdict
    }

    fn execute(&mut self, factory: TransportFactory) -> Verdict {
        if let Some(verdict) = self.flash_image() {
            return verdict;
        }

        let mut state = RunState::new(Instant::now() + secs(self.config.test_timeout));

        // A preselected supervisor skips the `__host_test_name` exchange.
        if let Some(name) = self.config.supervisor.clone() {
            if let Err(verdict) = self.load_supervisor(&name, &mut state) {
                return verdict;
            }
        }

        let mut proxy = proxy::spawn(
            factory.clone(),
            Arc::clone(&self.registry),
            self.proxy_settings(),
        );

        if let Err(verdict) = self.await_startup(&proxy) {
            proxy.finish(PROXY_GRACE);
            teardown(&mut state);
            return verdict;
        }

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                warn!("Run cancelled");
                state.cancelled = true;
                break;
            }

            let now = Instant::now();
            if now >= state.deadline {
                info!("Test budget elapsed");
                state.timed_out = true;
                break;
            }

            let event = match proxy.recv_timeout(QUEUE_POLL.min(state.deadline - now)) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    // A dead proxy with an empty queue produced no terminal
                    // event: it crashed.
                    if !proxy.is_alive() {
                        error!("Connection proxy died without a terminal event");
                        state.failure = Some(Verdict::IoSerial);
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    error!("Connection proxy channel closed unexpectedly");
                    state.failure = Some(Verdict::IoSerial);
                    break;
                }
            };

            match self.handle_event(&mut state, &mut proxy, &factory, event) {
                Flow::Continue => {}
                Flow::Break => break,
            }
        }

        // Best-effort drain so a late completion is not lost.
        for _ in 0..DRAIN_LIMIT {
            match proxy.try_recv() {
                Ok(event) if event.key == key::NOTIFY_COMPLETE => {
                    state.complete_seen = true;
                    state.explicit = parse_notify_value(&event.value);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        proxy.finish(PROXY_GRACE);
        teardown(&mut state);
        compute_verdict(&state)
    }

    /// Pre-flight checks plus the flashing cycle. `Some` is an early
    /// verdict.
    fn flash_image(&self) -> Option<Verdict> {
        if self.config.skip_flashing {
            debug!("Flashing skipped by configuration");
            return None;
        }

        let Some(image) = &self.config.image else {
            error!("No test image configured");
            return Some(Verdict::NoImage);
        };
        if !image.exists() {
            error!("Test image '{}' does not exist", image.display());
            return Some(Verdict::NoImage);
        }
        match std::fs::metadata(image) {
            Ok(meta) if meta.len() == 0 => {
                error!(
                    "Test image '{}' is empty; the build produced nothing",
                    image.display()
                );
                return Some(Verdict::BuildFailed);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Cannot read test image '{}': {}", image.display(), e);
                return Some(Verdict::NoImage);
            }
        }

        if !self
            .registry
            .is_supported(CapabilityKind::Flash, &self.config.copy_method)
        {
            error!(
                "Flash capability '{}' is not available on this host",
                self.config.copy_method
            );
            return Some(Verdict::Error);
        }

        let request = FlashRequest {
            image: image.clone(),
            target_id: self.config.target_id.clone(),
            capability: self.config.copy_method.clone(),
            max_attempts: self.config.max_flash_attempts,
            program_cycle: secs(self.config.program_cycle),
            polling_timeout: secs(self.config.polling_timeout),
        };

        let flasher = DeviceFlasher::new(&self.registry, self.lookup.as_ref());
        match flasher.flash(&request) {
            FlashOutcome::Flashed => None,
            FlashOutcome::CopyFailed => Some(Verdict::IoerrCopy),
            FlashOutcome::DiskNotReady => Some(Verdict::IoerrDisk),
        }
    }

    fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            sync_behavior: self.config.sync_behavior,
            sync_timeout: secs(self.config.sync_timeout),
            idle_timeout: secs(self.config.idle_timeout),
            reset_capability: self.config.reset_method.clone(),
        }
    }

    /// Bounded wait for the proxy's "connection open" acknowledgment, the
    /// only unbounded-looking wait in the control loop.
    fn await_startup(&self, proxy: &ProxyHandle) -> Result<(), Verdict> {
        let deadline = Instant::now() + secs(self.config.startup_timeout);

        loop {
            match proxy.recv_timeout(STARTUP_POLL) {
                Ok(event) if event.key == key::CONN_OPEN => {
                    debug!("Transport ready: {}", event.value);
                    return Ok(());
                }
                Ok(event) if event.key == key::NOTIFY_CONN_LOST => {
                    error!("Connection failed: {}", event.value);
                    return Err(Verdict::IoSerial);
                }
                Ok(event) => debug!("Pre-start event '{}' ignored", event.key),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(Verdict::IoSerial),
            }

            if Instant::now() >= deadline {
                error!("Connection proxy failed to start in time");
                return Err(Verdict::IoSerial);
            }
        }
    }

    fn load_supervisor(&self, name: &str, state: &mut RunState) -> Result<(), Verdict> {
        let mut supervisor = match self.supervisors.create(name) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                error!("{}", e);
                return Err(Verdict::Error);
            }
        };

        match catch_unwind(AssertUnwindSafe(|| supervisor.setup())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("{}", Error::SupervisorSetup(e.to_string()));
                return Err(Verdict::Error);
            }
            Err(_) => {
                error!("{}", Error::SupervisorSetup("setup panicked".to_string()));
                return Err(Verdict::Error);
            }
        }

        state.dispatch.extend(supervisor.observed_keys());
        state.setup_ok = true;
        state.supervisor = Some(supervisor);
        info!("Supervising test '{}'", name);
        Ok(())
    }

    fn handle_event(
        &self,
        state: &mut RunState,
        proxy: &mut ProxyHandle,
        factory: &TransportFactory,
        event: Event,
    ) -> Flow {
        match event.key.as_str() {
            key::SYNC => {
                debug!("Handshake acknowledged, token {}", event.value);
                Flow::Continue
            }
            key::CONN_OPEN | key::RESET_COMPLETE | key::COVERAGE_START => {
                debug!("Control event '{}'", event.key);
                Flow::Continue
            }
            key::RXD_LINE => {
                info!("DUT> {}", event.value);
                Flow::Continue
            }
            key::TIMEOUT | key::TIMEOUT_SET => {
                match event.value.trim().parse::<f64>() {
                    Ok(budget) => {
                        info!("Test budget set to {}s", budget);
                        state.deadline = Instant::now() + secs(budget);
                    }
                    Err(_) => warn!("Ignoring invalid timeout value '{}'", event.value),
                }
                Flow::Continue
            }
            key::TIMEOUT_ADJUST | key::COVERAGE_DRAINED => {
                match event.value.trim().parse::<f64>() {
                    Ok(delta) => {
                        debug!("Test budget adjusted by {}s", delta);
                        state.deadline = shift_deadline(state.deadline, delta);
                    }
                    Err(_) => warn!("Ignoring invalid budget delta '{}'", event.value),
                }
                Flow::Continue
            }
            key::HOST_TEST_NAME => {
                if state.supervisor.is_some() {
                    warn!("Supervisor already loaded; ignoring '{}'", event.value);
                    return Flow::Continue;
                }
                match self.load_supervisor(&event.value, state) {
                    Ok(()) => Flow::Continue,
                    Err(verdict) => {
                        state.failure = Some(verdict);
                        Flow::Break
                    }
                }
            }
            key::NOTIFY_SYNC_FAILED => {
                error!("Handshake failed: {}", event.value);
                state.failure = Some(Verdict::SyncFailed);
                Flow::Break
            }
            key::NOTIFY_CONN_LOST => {
                error!("Connection lost: {}", event.value);
                state.failure = Some(Verdict::IoSerial);
                Flow::Break
            }
            key::NOTIFY_FINISHED => {
                debug!("Proxy reported a clean shutdown");
                Flow::Continue
            }
            key::NOTIFY_COMPLETE => {
                state.complete_seen = true;
                state.explicit = parse_notify_value(&event.value);
                state.queue_exited = true;
                Flow::Break
            }
            key::RESET => {
                info!("Soft reset requested");
                proxy.send(HostCommand::Reset);
                Flow::Continue
            }
            key::RESET_DUT => self.hard_reset(state, proxy, factory),
            key::EXIT => {
                debug!("Device signalled exit ({})", event.value);
                state.device_exited = true;
                Flow::Continue
            }
            key::EXIT_EVENT_QUEUE => {
                debug!("Event queue closed by supervisor");
                state.queue_exited = true;
                Flow::Break
            }
            _ if event.is_control() => {
                debug!("Ignoring control event '{}'", event.key);
                Flow::Continue
            }
            _ => self.handle_test_event(state, proxy, &event),
        }
    }

    /// Hard reset: physical reset capability plus a proxy restart.
    fn hard_reset(
        &self,
        state: &mut RunState,
        proxy: &mut ProxyHandle,
        factory: &TransportFactory,
    ) -> Flow {
        info!("Hard reset requested");
        proxy.finish(PROXY_GRACE);

        if let Some(name) = &self.config.reset_method {
            match self
                .registry
                .call_reset(name, &CapabilityParams::new(), None)
            {
                Ok(true) => {}
                Ok(false) => warn!("Hard reset capability reported failure"),
                Err(e) => warn!("Hard reset capability failed: {}", e),
            }
        }

        *proxy = proxy::spawn(
            factory.clone(),
            Arc::clone(&self.registry),
            self.proxy_settings(),
        );
        match self.await_startup(proxy) {
            Ok(()) => Flow::Continue,
            Err(verdict) => {
                state.failure = Some(verdict);
                Flow::Break
            }
        }
    }

    fn handle_test_event(
        &self,
        state: &mut RunState,
        proxy: &ProxyHandle,
        event: &Event,
    ) -> Flow {
        let registered = state.dispatch.contains(&event.key);
        let Some(supervisor) = state.supervisor.as_mut().filter(|_| registered) else {
            // Protocol violation, but not fatal: devices occasionally emit
            // keys nobody registered for.
            warn!("Orphan event: {{{{{};{}}}}}", event.key, event.value);
            return Flow::Continue;
        };

        let mut ctx = SupervisorContext::new();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            supervisor.on_event(&mut ctx, &event.key, &event.value, event.timestamp);
        }));

        if outcome.is_err() {
            error!("Supervisor callback for '{}' panicked", event.key);
            state.failure = Some(Verdict::Error);
            return Flow::Break;
        }

        for (frame_key, frame_value) in ctx.take_outgoing() {
            proxy.send(HostCommand::SendKv {
                key: frame_key,
                value: frame_value,
            });
        }

        if let Some(result) = ctx.take_complete() {
            state.complete_seen = true;
            state.explicit = result;
            state.queue_exited = true;
            return Flow::Break;
        }

        Flow::Continue
    }
}

fn teardown(state: &mut RunState) {
    if !state.setup_ok {
        return;
    }
    if let Some(supervisor) = state.supervisor.as_mut() {
        if catch_unwind(AssertUnwindSafe(|| supervisor.teardown())).is_err() {
            error!("Supervisor teardown panicked");
        }
    }
}

fn compute_verdict(state: &RunState) -> Verdict {
    // An explicit completion value wins over everything else.
    if let Some(explicit) = state.explicit {
        return if explicit {
            Verdict::Success
        } else {
            Verdict::Failure
        };
    }

    if let Some(failure) = state.failure {
        return failure;
    }

    if let Some(supervisor) = &state.supervisor {
        if let Some(result) = supervisor.result() {
            return if result {
                Verdict::Success
            } else {
                Verdict::Failure
            };
        }
    }

    if state.timed_out {
        return Verdict::Timeout;
    }
    if state.cancelled {
        return Verdict::Error;
    }

    // Graceful exit without any result is a bug in the test setup.
    error!(
        "Run ended without a verdict (device exit: {}, queue exit: {}, complete seen: {})",
        state.device_exited, state.queue_exited, state.complete_seen
    );
    Verdict::Undefined
}

/// The one predictable place downstream tooling reads the outcome from.
fn announce(verdict: Verdict) {
    println!("{{{{result;{verdict}}}}}");
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::{compute_verdict, parse_notify_value, shift_deadline, RunState};
    use crate::{
        supervisor::{SupervisorContext, TestSupervisor},
        verdict::Verdict,
    };

    struct FixedResult(Option<bool>);

    impl TestSupervisor for FixedResult {
        fn observed_keys(&self) -> Vec<String> {
            Vec::new()
        }
        fn on_event(&mut self, _: &mut SupervisorContext, _: &str, _: &str, _: f64) {}
        fn result(&self) -> Option<bool> {
            self.0
        }
    }

    fn state() -> RunState {
        RunState::new(Instant::now())
    }

    #[test]
    fn explicit_completion_wins() {
        let mut state = state();
        state.explicit = Some(false);
        state.failure = Some(Verdict::IoSerial);
        state.supervisor = Some(Box::new(FixedResult(Some(true))));

        assert_eq!(compute_verdict(&state), Verdict::Failure);
    }

    #[test]
    fn terminal_failure_beats_supervisor_result() {
        let mut state = state();
        state.failure = Some(Verdict::SyncFailed);
        state.supervisor = Some(Box::new(FixedResult(Some(true))));

        assert_eq!(compute_verdict(&state), Verdict::SyncFailed);
    }

    #[test]
    fn supervisor_result_is_polled_when_no_explicit_value() {
        let mut state = state();
        state.supervisor = Some(Box::new(FixedResult(Some(true))));
        assert_eq!(compute_verdict(&state), Verdict::Success);
    }

    #[test]
    fn timeout_when_nothing_concluded() {
        let mut state = state();
        state.timed_out = true;
        assert_eq!(compute_verdict(&state), Verdict::Timeout);
    }

    #[test]
    fn graceful_exit_without_result_is_undefined() {
        let mut state = state();
        state.queue_exited = true;
        assert_eq!(compute_verdict(&state), Verdict::Undefined);
    }

    #[test]
    fn notify_values_parse_leniently() {
        assert_eq!(parse_notify_value("true"), Some(true));
        assert_eq!(parse_notify_value("0"), Some(false));
        assert_eq!(parse_notify_value(""), None);
        assert_eq!(parse_notify_value("bogus"), None);
    }

    #[test]
    fn deadline_shifts_both_ways() {
        let now = Instant::now() + Duration::from_secs(10);
        assert!(shift_deadline(now, 5.0) > now);
        assert!(shift_deadline(now, -5.0) < now);
    }
}
