//! Pluggable per-test supervision
//!
//! A test supervisor holds the host-side logic for one on-device test:
//! which event keys it wants to see, what to do with them, and whether the
//! test passed. Supervisors are looked up by the name the device announces
//! via `__host_test_name` and constructed fresh for every run, so no state
//! leaks between tests in a long-lived farm controller.

use std::collections::HashMap;

use log::debug;

use crate::error::Error;

/// Handle a supervisor callback uses to talk back to the runtime.
#[derive(Debug, Default)]
pub struct SupervisorContext {
    complete: Option<Option<bool>>,
    outgoing: Vec<(String, String)>,
}

impl SupervisorContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Report the test outcome: `Some(passed)` is an explicit verdict,
    /// `None` asks the runtime to consult [TestSupervisor::result]
    /// instead. Either form ends the event loop.
    pub fn notify_complete(&mut self, result: Option<bool>) {
        self.complete = Some(result);
    }

    /// Queue a `{{key;value}}` frame to be written to the device.
    pub fn send_kv(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.outgoing.push((key.into(), value.into()));
    }

    pub(crate) fn take_complete(&mut self) -> Option<Option<bool>> {
        self.complete.take()
    }

    pub(crate) fn take_outgoing(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.outgoing)
    }
}

/// Host-side logic driving one on-device test.
///
/// The runtime guarantees `setup` is called at most once, `teardown`
/// exactly once if `setup` succeeded, and that `on_event` is only invoked
/// after `setup` returned, for keys listed by `observed_keys`.
pub trait TestSupervisor: Send {
    /// Prepare for the run. Failing here aborts the test with an error
    /// verdict.
    fn setup(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Event keys this supervisor wants dispatched to [Self::on_event].
    fn observed_keys(&self) -> Vec<String>;

    /// Handle one device event.
    fn on_event(&mut self, ctx: &mut SupervisorContext, key: &str, value: &str, timestamp: f64);

    /// Outcome to use when the run ended without an explicit
    /// `notify_complete` value.
    fn result(&self) -> Option<bool> {
        None
    }

    /// Release any resources. Called exactly once after the event loop.
    fn teardown(&mut self) {}
}

type Constructor = Box<dyn Fn() -> Box<dyn TestSupervisor> + Send + Sync>;

/// Supervisor constructors, keyed by test name.
#[derive(Default)]
pub struct SupervisorRegistry {
    constructors: HashMap<String, Constructor>,
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the supervisors dutrun ships.
    pub fn with_builtin_supervisors() -> Self {
        let mut registry = Self::new();
        // A fresh registry cannot already contain this name.
        let _ = registry.register("default", || Box::new(DeviceResultSupervisor::new()));
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: impl Fn() -> Box<dyn TestSupervisor> + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(Error::DuplicateSupervisor(name));
        }

        debug!("Registered supervisor '{}'", name);
        self.constructors.insert(name, Box::new(constructor));
        Ok(())
    }

    /// Construct a fresh supervisor for the named test.
    pub fn create(&self, name: &str) -> Result<Box<dyn TestSupervisor>, Error> {
        self.constructors
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| Error::UnknownSupervisor(name.to_string()))
    }

    /// Registered test names, sorted for stable diagnostic output.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Built-in supervisor for self-checking firmware.
///
/// The device reports its own outcome with a `{{result;...}}` frame; the
/// host merely relays it.
#[derive(Debug, Default)]
pub struct DeviceResultSupervisor {
    outcome: Option<bool>,
}

impl DeviceResultSupervisor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TestSupervisor for DeviceResultSupervisor {
    fn observed_keys(&self) -> Vec<String> {
        vec!["result".to_string()]
    }

    fn on_event(&mut self, ctx: &mut SupervisorContext, _key: &str, value: &str, _timestamp: f64) {
        let passed = matches!(value.to_ascii_lowercase().as_str(), "success" | "pass" | "1" | "true");
        self.outcome = Some(passed);
        ctx.notify_complete(Some(passed));
    }

    fn result(&self) -> Option<bool> {
        self.outcome
    }
}
