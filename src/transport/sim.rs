//! In-memory device simulator
//!
//! Behaves like a scripted DUT behind the normal [Transport] interface:
//! it can echo sync tokens, play back canned output once the handshake
//! completes, and fail on demand. The runtime uses it for dry runs; the
//! test suite uses it to exercise the proxy and orchestrator without
//! hardware.

use std::{
    collections::VecDeque,
    io::{self, ErrorKind},
    sync::{Arc, Mutex, MutexGuard},
    thread::sleep,
    time::Duration,
};

use crate::transport::Transport;

/// Scripted behavior for a simulated device.
#[derive(Debug, Clone, Default)]
pub struct SimScript {
    /// Echo any `{{__sync;token}}` frame straight back.
    pub echo_sync: bool,
    /// Lines delivered immediately after the first sync echo.
    pub on_sync: Vec<String>,
    /// Lines delivered as soon as the transport is opened.
    pub immediate: Vec<String>,
}

impl SimScript {
    /// A device that completes the handshake and then stays quiet.
    pub fn echo_sync() -> Self {
        Self {
            echo_sync: true,
            ..Self::default()
        }
    }

    /// A device that never responds to anything.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Queue a raw line to be sent after the handshake completes.
    pub fn then_line(mut self, line: &str) -> Self {
        self.on_sync.push(line.to_string());
        self
    }

    /// Queue a protocol frame to be sent after the handshake completes.
    pub fn then_frame(mut self, key: &str, value: &str) -> Self {
        self.on_sync.push(format!("{{{{{key};{value}}}}}"));
        self
    }
}

#[derive(Debug)]
struct SimState {
    script: SimScript,
    rx: VecDeque<u8>,
    written: Vec<u8>,
    written_lines: Vec<String>,
    resets: usize,
    read_error: Option<ErrorKind>,
    sync_played: bool,
}

impl SimState {
    fn queue_line(&mut self, line: &str) {
        self.rx.extend(line.as_bytes());
        self.rx.extend(b"\n");
    }

    fn note_written_line(&mut self, line: String) {
        // React to host-side sync frames per the script.
        if let Some(token) = sync_token(&line) {
            if self.script.echo_sync {
                let echo = format!("{{{{__sync;{token}}}}}");
                self.queue_line(&echo);

                if !self.sync_played {
                    self.sync_played = true;
                    let lines = self.script.on_sync.clone();
                    for line in &lines {
                        self.queue_line(line);
                    }
                }
            }
        }

        self.written_lines.push(line);
    }
}

fn sync_token(line: &str) -> Option<&str> {
    line.strip_prefix("{{__sync;")
        .and_then(|rest| rest.strip_suffix("}}"))
}

/// Transport half of the simulator; hand this to the proxy.
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

/// Test-side control for a [SimTransport].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimTransport {
    pub fn new(script: SimScript) -> (Self, SimHandle) {
        let immediate = script.immediate.clone();
        let mut state = SimState {
            script,
            rx: VecDeque::new(),
            written: Vec::new(),
            written_lines: Vec::new(),
            resets: 0,
            read_error: None,
            sync_played: false,
        };
        for line in &immediate {
            state.queue_line(line);
        }

        let state = Arc::new(Mutex::new(state));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimHandle { state },
        )
    }
}

fn lock(state: &Arc<Mutex<SimState>>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Transport for SimTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = lock(&self.state);

            if !state.rx.is_empty() {
                let mut count = 0;
                while count < buf.len() {
                    match state.rx.pop_front() {
                        Some(byte) => {
                            buf[count] = byte;
                            count += 1;
                        }
                        None => break,
                    }
                }
                return Ok(count);
            }

            // Queued output is always delivered before a scripted failure.
            if let Some(kind) = state.read_error {
                return Err(io::Error::new(kind, "simulated transport failure"));
            }
        }

        sleep(Duration::from_millis(1));
        Ok(0)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);

        state.written.extend_from_slice(data);
        while let Some(pos) = state.written.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = state.written.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            state.note_written_line(line);
        }

        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.resets += 1;
        // A rebooting device abandons any output still in flight.
        state.rx.clear();
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        lock(&self.state).read_error.is_none()
    }

    fn describe(&self) -> String {
        "sim".to_string()
    }
}

impl SimHandle {
    /// Queue a raw line for the host to read.
    pub fn push_line(&self, line: &str) {
        lock(&self.state).queue_line(line);
    }

    /// Queue a protocol frame for the host to read.
    pub fn push_frame(&self, key: &str, value: &str) {
        self.push_line(&format!("{{{{{key};{value}}}}}"));
    }

    /// Make every future read fail with the given error kind, once queued
    /// output has been drained.
    pub fn fail_reads(&self, kind: ErrorKind) {
        lock(&self.state).read_error = Some(kind);
    }

    /// Tokens from every `{{__sync;...}}` frame the host has sent.
    pub fn sync_requests(&self) -> Vec<String> {
        lock(&self.state)
            .written_lines
            .iter()
            .filter_map(|line| sync_token(line).map(str::to_string))
            .collect()
    }

    /// How many times the host has reset the simulated device.
    pub fn reset_count(&self) -> usize {
        lock(&self.state).resets
    }
}

#[cfg(test)]
mod test {
    use std::io::ErrorKind;

    use super::{SimScript, SimTransport};
    use crate::transport::Transport;

    #[test]
    fn echoes_sync_and_plays_script() {
        let (mut sim, handle) =
            SimTransport::new(SimScript::echo_sync().then_frame("ready", "1"));

        sim.write_all(b"{{__sync;abc}}\n").unwrap();

        let mut buf = [0u8; 256];
        let count = sim.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..count]).to_string();

        assert_eq!(text, "{{__sync;abc}}\n{{ready;1}}\n");
        assert_eq!(handle.sync_requests(), vec!["abc"]);
    }

    #[test]
    fn queued_output_is_delivered_before_failure() {
        let (mut sim, handle) = SimTransport::new(SimScript::silent());
        handle.push_line("last words");
        handle.fail_reads(ErrorKind::BrokenPipe);

        let mut buf = [0u8; 64];
        let count = sim.read(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"last words\n");

        assert!(sim.read(&mut buf).is_err());
    }
}
