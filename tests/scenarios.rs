//! End-to-end scenarios over the simulated device

use std::{
    io::ErrorKind,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use dutrun::{
    config::DeviceConfig,
    lookup::StaticLookup,
    supervisor::{SupervisorContext, SupervisorRegistry, TestSupervisor},
    transport::{
        sim::{SimHandle, SimScript, SimTransport},
        Transport, TransportFactory, TransportKind,
    },
    Registry, TestOrchestrator, Verdict,
};

/// A factory that hands out one pre-scripted simulator.
fn sim_factory(script: SimScript) -> (TransportFactory, SimHandle) {
    let (transport, handle) = SimTransport::new(script);
    let slot = Mutex::new(Some(transport));
    let factory: TransportFactory = Arc::new(move || {
        let transport = slot
            .lock()
            .unwrap()
            .take()
            .expect("simulator factory invoked more than once");
        Ok(Box::new(transport) as Box<dyn Transport>)
    });
    (factory, handle)
}

fn sim_config() -> DeviceConfig {
    DeviceConfig {
        transport: TransportKind::Sim,
        target_id: "SIM".to_string(),
        skip_flashing: true,
        sync_behavior: 5,
        sync_timeout: 0.1,
        test_timeout: 10.0,
        startup_timeout: 5.0,
        idle_timeout: 0.05,
        ..DeviceConfig::default()
    }
}

fn orchestrator(config: DeviceConfig, supervisors: SupervisorRegistry) -> TestOrchestrator {
    TestOrchestrator::new(
        config,
        Registry::with_builtin_capabilities(),
        supervisors,
        Arc::new(StaticLookup::default()),
    )
}

/// Passes as soon as the device echoes the expected greeting.
#[derive(Default)]
struct HelloSupervisor;

impl TestSupervisor for HelloSupervisor {
    fn observed_keys(&self) -> Vec<String> {
        vec!["hello_world".to_string()]
    }

    fn on_event(&mut self, ctx: &mut SupervisorContext, _key: &str, value: &str, _timestamp: f64) {
        ctx.notify_complete(Some(value == "Hello World"));
    }
}

/// Registers a key but never concludes anything.
#[derive(Default)]
struct IndecisiveSupervisor;

impl TestSupervisor for IndecisiveSupervisor {
    fn observed_keys(&self) -> Vec<String> {
        vec!["ping".to_string()]
    }

    fn on_event(&mut self, _ctx: &mut SupervisorContext, _: &str, _: &str, _: f64) {}
}

// Scenario A: the device never echoes a sync token.
#[test]
fn sync_failure_after_exactly_two_attempts() {
    let (factory, sim) = sim_factory(SimScript::silent());

    let mut config = sim_config();
    config.sync_behavior = 2;

    let started = Instant::now();
    let verdict =
        orchestrator(config, SupervisorRegistry::new()).run_with_factory(factory);
    let elapsed = started.elapsed();

    assert_eq!(verdict, Verdict::SyncFailed);
    assert_eq!(sim.sync_requests().len(), 2);
    // Two attempt windows, each spaced by the sync timeout.
    assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
}

// Scenario B: a passing greeting test, supervisor named by the device.
#[test]
fn greeting_test_passes() {
    let (factory, _sim) = sim_factory(
        SimScript::echo_sync()
            .then_frame("__timeout", "10")
            .then_frame("__host_test_name", "hello")
            .then_frame("hello_world", "Hello World")
            .then_frame("__exit", "0"),
    );

    let mut supervisors = SupervisorRegistry::new();
    supervisors
        .register("hello", || Box::new(HelloSupervisor))
        .unwrap();

    let verdict = orchestrator(sim_config(), supervisors).run_with_factory(factory);
    assert_eq!(verdict, Verdict::Success);
}

#[test]
fn wrong_greeting_fails() {
    let (factory, _sim) = sim_factory(
        SimScript::echo_sync()
            .then_frame("__host_test_name", "hello")
            .then_frame("hello_world", "Goodbye World")
            .then_frame("__exit", "0"),
    );

    let mut supervisors = SupervisorRegistry::new();
    supervisors
        .register("hello", || Box::new(HelloSupervisor))
        .unwrap();

    let verdict = orchestrator(sim_config(), supervisors).run_with_factory(factory);
    assert_eq!(verdict, Verdict::Failure);
}

// Scenario C: the transport read fails once the handshake is done.
#[test]
fn read_failure_mid_stream_is_io_serial() {
    let (factory, sim) = sim_factory(SimScript::echo_sync());
    // Queued output (the sync echo) is still delivered; the first read
    // after it raises.
    sim.fail_reads(ErrorKind::BrokenPipe);

    let verdict =
        orchestrator(sim_config(), SupervisorRegistry::new()).run_with_factory(factory);
    assert_eq!(verdict, Verdict::IoSerial);
}

// Scenario D: nobody ever concludes anything.
#[test]
fn silence_after_handshake_times_out() {
    let (factory, _sim) = sim_factory(SimScript::echo_sync());

    let mut config = sim_config();
    config.test_timeout = 0.5;
    config.supervisor = Some("indecisive".to_string());

    let mut supervisors = SupervisorRegistry::new();
    supervisors
        .register("indecisive", || Box::new(IndecisiveSupervisor))
        .unwrap();

    let verdict = orchestrator(config, supervisors).run_with_factory(factory);
    assert_eq!(verdict, Verdict::Timeout);
}

// The built-in supervisor relays a device-reported outcome.
#[test]
fn device_reported_result_drives_the_verdict() {
    let (factory, _sim) = sim_factory(
        SimScript::echo_sync()
            .then_frame("__host_test_name", "default")
            .then_frame("result", "success"),
    );

    let verdict = orchestrator(sim_config(), SupervisorRegistry::with_builtin_supervisors())
        .run_with_factory(factory);
    assert_eq!(verdict, Verdict::Success);
}

// A missing image is caught before anything is spawned.
#[test]
fn missing_image_is_no_image() {
    let (factory, _sim) = sim_factory(SimScript::echo_sync());

    let mut config = sim_config();
    config.skip_flashing = false;
    config.image = None;

    let verdict =
        orchestrator(config, SupervisorRegistry::new()).run_with_factory(factory);
    assert_eq!(verdict, Verdict::NoImage);
}

// An empty image means the build produced nothing.
#[test]
fn empty_image_is_build_failed() {
    let (factory, _sim) = sim_factory(SimScript::echo_sync());

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("app.bin");
    std::fs::write(&image, b"").unwrap();

    let mut config = sim_config();
    config.skip_flashing = false;
    config.image = Some(image);

    let verdict =
        orchestrator(config, SupervisorRegistry::new()).run_with_factory(factory);
    assert_eq!(verdict, Verdict::BuildFailed);
}

// A supervisor that panics mid-callback must not take the process down.
#[test]
fn panicking_callback_is_an_error_verdict() {
    struct PanickySupervisor;

    impl TestSupervisor for PanickySupervisor {
        fn observed_keys(&self) -> Vec<String> {
            vec!["boom".to_string()]
        }
        fn on_event(&mut self, _: &mut SupervisorContext, _: &str, _: &str, _: f64) {
            panic!("callback exploded");
        }
    }

    let (factory, _sim) = sim_factory(
        SimScript::echo_sync()
            .then_frame("__host_test_name", "panicky")
            .then_frame("boom", "now"),
    );

    let mut supervisors = SupervisorRegistry::new();
    supervisors
        .register("panicky", || Box::new(PanickySupervisor))
        .unwrap();

    let verdict = orchestrator(sim_config(), supervisors).run_with_factory(factory);
    assert_eq!(verdict, Verdict::Error);
}
