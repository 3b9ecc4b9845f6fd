//! Connection proxy: the isolated unit that owns the transport
//!
//! Transport I/O can block or hang on faulty hardware, so it runs on a
//! dedicated thread and never shares mutable state with the orchestrator.
//! The two sides communicate exclusively through a pair of unbounded
//! channels: decoded device events flow out, host commands flow in. The
//! proxy walks a fixed sequence of states — connect, handshake, stream,
//! drain — and always emits exactly one terminal event before exiting, so
//! the orchestrator can tell a clean shutdown from a lost connection.

use std::{
    collections::HashSet,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc,
    },
    thread::{self, sleep, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    codec::{encode, WireCodec},
    event::{key, Event},
    registry::{CapabilityParams, Registry},
    transport::{Transport, TransportFactory},
};

const READ_CHUNK: usize = 1024;
/// Pause when neither channel had work, so an idle proxy does not spin.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Commands the orchestrator sends to the proxy.
#[derive(Debug)]
pub enum HostCommand {
    /// Write a `{{key;value}}` frame to the device.
    SendKv { key: String, value: String },
    /// Reset the device without tearing the connection down.
    Reset,
    /// Shut the proxy down cleanly.
    Finish,
}

/// Handshake and streaming policy, lifted from the device configuration.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// `0`: skip the handshake. `N > 0`: up to `N` sync attempts.
    /// `N < 0`: resend until cancelled.
    pub sync_behavior: i32,
    /// Spacing between sync attempts.
    pub sync_timeout: Duration,
    /// Idle window that ends a coverage drain.
    pub idle_timeout: Duration,
    /// Reset capability to invoke for host-commanded resets; `None` resets
    /// through the transport itself.
    pub reset_capability: Option<String>,
}

/// The orchestrator's end of a running proxy.
pub struct ProxyHandle {
    events: Receiver<Event>,
    commands: Sender<HostCommand>,
    join: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    /// Send a command; returns false if the proxy is already gone.
    pub fn send(&self, command: HostCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Wait up to `timeout` for the next device event.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }

    /// Non-blocking event read, for the post-loop drain.
    pub fn try_recv(&self) -> Result<Event, TryRecvError> {
        self.events.try_recv()
    }

    pub fn is_alive(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Ask the proxy to shut down and wait up to `grace` for it to exit.
    ///
    /// Returns false if the proxy had to be abandoned; its thread holds no
    /// locks and exits on its own once its bounded I/O calls return, so
    /// abandoning it cannot strand the port beyond that.
    pub fn finish(&mut self, grace: Duration) -> bool {
        let _ = self.commands.send(HostCommand::Finish);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match &self.join {
                Some(join) if !join.is_finished() => sleep(Duration::from_millis(10)),
                _ => break,
            }
        }

        match self.join.take() {
            Some(join) if join.is_finished() => join.join().is_ok(),
            Some(join) => {
                warn!("Connection proxy did not exit within the grace period");
                drop(join);
                false
            }
            None => true,
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(HostCommand::Finish);
    }
}

/// Start a proxy for one connection attempt.
pub fn spawn(
    factory: TransportFactory,
    registry: Arc<Registry>,
    settings: ProxySettings,
) -> ProxyHandle {
    let (event_tx, event_rx) = mpsc::channel();
    let (command_tx, command_rx) = mpsc::channel();

    let join = thread::spawn(move || {
        let proxy = Proxy {
            registry,
            settings,
            events: event_tx,
            commands: command_rx,
            codec: WireCodec::new(),
            issued_tokens: HashSet::new(),
            coverage_pending: false,
        };
        proxy.run(factory);
    });

    ProxyHandle {
        events: event_rx,
        commands: command_tx,
        join: Some(join),
    }
}

/// How a proxy phase ended.
enum Step {
    Continue,
    Finished,
    ConnLost(String),
    SyncFailed,
}

struct Proxy {
    registry: Arc<Registry>,
    settings: ProxySettings,
    events: Sender<Event>,
    commands: Receiver<HostCommand>,
    codec: WireCodec,
    issued_tokens: HashSet<String>,
    coverage_pending: bool,
}

impl Proxy {
    fn run(mut self, factory: TransportFactory) {
        // Connecting
        let mut transport = match factory() {
            Ok(transport) => transport,
            Err(e) => {
                error!("Failed to open transport: {}", e);
                self.emit(key::NOTIFY_CONN_LOST, &e.to_string());
                return;
            }
        };
        info!("Connected to {}", transport.describe());
        self.emit(key::CONN_OPEN, &transport.describe());

        // Handshaking
        match self.handshake(transport.as_mut()) {
            Step::Continue => {}
            Step::Finished => {
                self.emit(key::NOTIFY_FINISHED, "");
                return;
            }
            Step::ConnLost(reason) => {
                self.emit(key::NOTIFY_CONN_LOST, &reason);
                return;
            }
            Step::SyncFailed => {
                self.emit(key::NOTIFY_SYNC_FAILED, "no sync token acknowledged");
                return;
            }
        }

        // Streaming, then Draining; the transport closes when it drops.
        match self.stream(transport.as_mut()) {
            Step::ConnLost(reason) => self.emit(key::NOTIFY_CONN_LOST, &reason),
            _ => self.emit(key::NOTIFY_FINISHED, ""),
        }
    }

    /// Run the sync handshake per the configured policy.
    fn handshake(&mut self, transport: &mut dyn Transport) -> Step {
        if self.settings.sync_behavior == 0 {
            debug!("Handshake disabled; streaming immediately");
            return Step::Continue;
        }

        let mut attempt: i64 = 0;
        loop {
            if self.settings.sync_behavior > 0 && attempt >= i64::from(self.settings.sync_behavior)
            {
                warn!("Handshake failed after {} attempts", attempt);
                return Step::SyncFailed;
            }

            if attempt > 0 {
                // Re-issue the device reset between attempts; anything the
                // device printed before the reset is stale.
                if let Err(e) = transport.reset() {
                    return Step::ConnLost(e.to_string());
                }
                self.codec.clear();
            }

            let token = Uuid::new_v4().to_string();
            self.issued_tokens.insert(token.clone());
            debug!("Sync attempt {}, token {}", attempt + 1, token);

            // Wake the line, then send the sync frame.
            if let Err(e) = transport.write_all(b"\n") {
                return Step::ConnLost(e.to_string());
            }
            if let Err(e) = transport.write_all(encode(key::SYNC, &token).as_bytes()) {
                return Step::ConnLost(e.to_string());
            }

            let deadline = Instant::now() + self.settings.sync_timeout;
            while Instant::now() < deadline {
                match self.drain_commands(transport) {
                    Step::Continue => {}
                    step => return step,
                }

                match self.pump(transport) {
                    Ok((_, true)) => return Step::Continue,
                    Ok((0, _)) => sleep(IDLE_BACKOFF),
                    Ok(_) => {}
                    Err(reason) => return Step::ConnLost(reason),
                }
            }

            attempt += 1;
        }
    }

    /// Relay events and commands until shutdown or failure.
    fn stream(&mut self, transport: &mut dyn Transport) -> Step {
        loop {
            match self.drain_commands(transport) {
                Step::Continue => {}
                step => return step,
            }

            match self.pump(transport) {
                // Only probe liveness when the line is quiet; a transport
                // with queued output is still worth draining.
                Ok((0, _)) if !transport.is_alive() => {
                    return Step::ConnLost("transport liveness check failed".to_string());
                }
                Ok(_) => {}
                Err(reason) => return Step::ConnLost(reason),
            }

            if self.coverage_pending {
                self.coverage_pending = false;
                match self.idle_drain(transport) {
                    Step::Continue => {}
                    step => return step,
                }
            }
        }
    }

    /// Consume events until no activity is observed for the idle window.
    ///
    /// Coverage dumps can be large; the elapsed drain time is reported so
    /// the orchestrator can exclude it from the test budget.
    fn idle_drain(&mut self, transport: &mut dyn Transport) -> Step {
        info!("Coverage dump started; draining until idle");
        let started = Instant::now();
        let mut last_activity = Instant::now();

        while last_activity.elapsed() < self.settings.idle_timeout {
            match self.drain_commands(transport) {
                Step::Continue => {}
                step => return step,
            }

            let mut buf = [0u8; READ_CHUNK];
            match transport.read(&mut buf) {
                Ok(0) => sleep(IDLE_BACKOFF),
                Ok(count) => {
                    last_activity = Instant::now();
                    self.feed(&buf[..count]);
                }
                Err(e) => return Step::ConnLost(e.to_string()),
            }
        }

        let drained = started.elapsed().as_secs_f64();
        info!("Coverage drain finished after {:.3}s", drained);
        self.emit(key::COVERAGE_DRAINED, &format!("{drained:.3}"));
        Step::Continue
    }

    /// Apply any pending host commands. Never blocks.
    fn drain_commands(&mut self, transport: &mut dyn Transport) -> Step {
        loop {
            match self.commands.try_recv() {
                Ok(HostCommand::SendKv { key, value }) => {
                    if let Err(e) = transport.write_all(encode(&key, &value).as_bytes()) {
                        return Step::ConnLost(e.to_string());
                    }
                }
                Ok(HostCommand::Reset) => self.reset_device(transport),
                Ok(HostCommand::Finish) => return Step::Finished,
                Err(TryRecvError::Empty) => return Step::Continue,
                // The orchestrator is gone; nobody is listening anymore.
                Err(TryRecvError::Disconnected) => return Step::Finished,
            }
        }
    }

    fn reset_device(&mut self, transport: &mut dyn Transport) {
        let outcome = match &self.settings.reset_capability {
            Some(name) => self
                .registry
                .call_reset(name, &CapabilityParams::new(), Some(transport)),
            None => transport.reset().map(|()| true).map_err(Into::into),
        };

        match outcome {
            Ok(true) => debug!("Device reset complete"),
            Ok(false) => warn!("Device reset reported failure"),
            Err(e) => warn!("Device reset failed: {}", e),
        }

        // Bytes buffered from before the reset must not parse as fresh
        // output.
        self.codec.clear();
        self.emit(key::RESET_COMPLETE, "");
    }

    /// One bounded read, fed through the codec. Returns the byte count and
    /// whether a valid sync acknowledgment was consumed.
    fn pump(&mut self, transport: &mut dyn Transport) -> Result<(usize, bool), String> {
        let mut buf = [0u8; READ_CHUNK];
        match transport.read(&mut buf) {
            Ok(0) => Ok((0, false)),
            Ok(count) => Ok((count, self.feed(&buf[..count]))),
            Err(e) => Err(e.to_string()),
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> bool {
        for text in self.codec.append(bytes) {
            self.emit(key::RXD_LINE, &text);
        }

        let mut synced = false;
        while let Some((frame_key, value, timestamp)) = self.codec.pop() {
            if frame_key == key::SYNC {
                if self.issued_tokens.remove(&value) {
                    info!("Handshake complete, token {}", value);
                    // Acceptance invalidates every outstanding token.
                    self.issued_tokens.clear();
                    synced = true;
                    self.forward(Event {
                        key: frame_key,
                        value,
                        timestamp,
                    });
                } else {
                    warn!("Ignoring stale or foreign sync token '{}'", value);
                }
                continue;
            }

            if frame_key == key::COVERAGE_START {
                self.coverage_pending = true;
            }
            self.forward(Event {
                key: frame_key,
                value,
                timestamp,
            });
        }

        synced
    }

    fn emit(&self, event_key: &str, value: &str) {
        let _ = self.events.send(Event::new(event_key, value));
    }

    fn forward(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::HashSet,
        sync::Arc,
        time::{Duration, Instant},
    };

    use super::{spawn, HostCommand, ProxySettings};
    use crate::{
        event::key,
        registry::Registry,
        transport::{
            sim::{SimHandle, SimScript, SimTransport},
            Transport, TransportFactory,
        },
    };

    fn settings(sync_behavior: i32) -> ProxySettings {
        ProxySettings {
            sync_behavior,
            sync_timeout: Duration::from_millis(50),
            idle_timeout: Duration::from_millis(20),
            reset_capability: None,
        }
    }

    fn sim_factory(script: SimScript) -> (TransportFactory, SimHandle) {
        let (transport, handle) = SimTransport::new(script);
        let slot = std::sync::Mutex::new(Some(transport));
        let factory: TransportFactory = Arc::new(move || {
            let transport = slot
                .lock()
                .unwrap()
                .take()
                .expect("factory invoked more than once");
            Ok(Box::new(transport) as Box<dyn Transport>)
        });
        (factory, handle)
    }

    fn wait_for_event(
        handle: &super::ProxyHandle,
        wanted: &str,
        timeout: Duration,
    ) -> Option<crate::event::Event> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(event) = handle.recv_timeout(Duration::from_millis(20)) {
                if event.key == wanted {
                    return Some(event);
                }
            }
        }
        None
    }

    #[test]
    fn sync_tokens_are_unique_per_attempt() {
        let (factory, sim) = sim_factory(SimScript::silent());
        let mut proxy = spawn(factory, Arc::new(Registry::new()), settings(3));

        assert!(wait_for_event(
            &proxy,
            key::NOTIFY_SYNC_FAILED,
            Duration::from_secs(2)
        )
        .is_some());

        let tokens = sim.sync_requests();
        assert_eq!(tokens.len(), 3);
        let distinct: HashSet<_> = tokens.iter().collect();
        assert_eq!(distinct.len(), 3);

        proxy.finish(Duration::from_secs(1));
    }

    #[test]
    fn device_is_reset_between_attempts_after_the_first() {
        let (factory, sim) = sim_factory(SimScript::silent());
        let mut proxy = spawn(factory, Arc::new(Registry::new()), settings(2));

        assert!(wait_for_event(
            &proxy,
            key::NOTIFY_SYNC_FAILED,
            Duration::from_secs(2)
        )
        .is_some());

        assert_eq!(sim.sync_requests().len(), 2);
        assert_eq!(sim.reset_count(), 1);

        proxy.finish(Duration::from_secs(1));
    }

    #[test]
    fn stale_sync_is_rejected_and_real_token_accepted() {
        let (factory, sim) = sim_factory(SimScript::silent());
        // One long attempt, so no reset wipes the injected echoes mid-test.
        let mut sync_settings = settings(-1);
        sync_settings.sync_timeout = Duration::from_secs(10);
        let mut proxy = spawn(factory, Arc::new(Registry::new()), sync_settings);

        // A token nobody issued must never complete the handshake.
        sim.push_frame(key::SYNC, "deadbeef");

        let deadline = Instant::now() + Duration::from_millis(500);
        let mut issued = Vec::new();
        while Instant::now() < deadline {
            issued = sim.sync_requests();
            if !issued.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let token = issued.first().expect("proxy never sent a sync").clone();

        // Nothing may have been acknowledged yet.
        assert!(wait_for_event(&proxy, key::SYNC, Duration::from_millis(100)).is_none());

        sim.push_frame(key::SYNC, &token);
        let ack = wait_for_event(&proxy, key::SYNC, Duration::from_secs(2))
            .expect("valid token not acknowledged");
        assert_eq!(ack.value, token);

        // Streaming now: device frames are forwarded.
        sim.push_frame("hello", "world");
        let event = wait_for_event(&proxy, "hello", Duration::from_secs(2)).unwrap();
        assert_eq!(event.value, "world");

        proxy.finish(Duration::from_secs(1));
    }

    #[test]
    fn finish_produces_a_terminal_event() {
        let (factory, _sim) = sim_factory(SimScript::echo_sync());
        let mut proxy = spawn(factory, Arc::new(Registry::new()), settings(1));

        assert!(wait_for_event(&proxy, key::SYNC, Duration::from_secs(2)).is_some());

        proxy.send(HostCommand::Finish);
        assert!(wait_for_event(
            &proxy,
            key::NOTIFY_FINISHED,
            Duration::from_secs(2)
        )
        .is_some());
        assert!(proxy.finish(Duration::from_secs(1)));
    }

    #[test]
    fn raw_lines_are_forwarded_as_rxd_events() {
        let (factory, sim) = sim_factory(SimScript::echo_sync());
        let mut proxy = spawn(factory, Arc::new(Registry::new()), settings(1));

        assert!(wait_for_event(&proxy, key::SYNC, Duration::from_secs(2)).is_some());

        sim.push_line("plain boot log");
        let event = wait_for_event(&proxy, key::RXD_LINE, Duration::from_secs(2)).unwrap();
        assert_eq!(event.value, "plain boot log");

        proxy.finish(Duration::from_secs(1));
    }

    #[test]
    fn host_reset_command_is_acknowledged() {
        let (factory, sim) = sim_factory(SimScript::echo_sync());
        let mut proxy = spawn(factory, Arc::new(Registry::new()), settings(1));

        assert!(wait_for_event(&proxy, key::SYNC, Duration::from_secs(2)).is_some());

        proxy.send(HostCommand::Reset);
        assert!(wait_for_event(
            &proxy,
            key::RESET_COMPLETE,
            Duration::from_secs(2)
        )
        .is_some());
        assert_eq!(sim.reset_count(), 1);

        proxy.finish(Duration::from_secs(1));
    }
}
