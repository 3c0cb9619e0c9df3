//! ═══════════════════════════════════════════════════════════════════════════════
//! DRIVER — Thermode Serial Connection
//! ═══════════════════════════════════════════════════════════════════════════════
//!
//! Owns the single connection to the thermode and a dedicated worker thread
//! that executes commands one at a time, in enqueue order. Callers never
//! block: `enqueue` appends to an unbounded FIFO and returns. The device is
//! stateful and command order encodes meaning (set base, set target, set
//! duration, then trigger), so no reordering or concurrent execution is ever
//! permitted.
//!
//! A write failure is counted and reported, not fatal: one bad command may
//! not kill the driver, and stimulation timing upstream does not depend on
//! confirmed delivery.
//! ═══════════════════════════════════════════════════════════════════════════════

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SerialSettings;
use crate::error::{ConnectionError, Result};
use crate::protocol;

/// How long `close` waits for the worker before giving up
const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Byte sink for the thermode link. The real implementation wraps a serial
/// port; tests and dry runs use [`MemoryTransport`].
pub trait Transport: Send {
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

/// One opaque action applied to the open connection
#[derive(Debug, Clone)]
pub struct SerialCommand {
    bytes: Vec<u8>,
}

impl SerialCommand {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Connectivity/status observer. At most one hook is expected to be active.
pub trait StatusHook: Send + Sync {
    fn opened(&self) {}
    fn closed(&self) {}
    fn write_error(&self, _err: &std::io::Error) {}
}

enum WorkerMsg {
    Command(SerialCommand),
    /// Wake the worker so it can observe the cleared running flag
    Shutdown,
}

/// Thread-safe driver for the thermode's serial protocol
pub struct ThermodeDriver {
    tx: Sender<WorkerMsg>,
    running: Arc<AtomicBool>,
    write_errors: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
    hook: Option<Arc<dyn StatusHook>>,
}

impl ThermodeDriver {
    /// Open the physical serial port described by `settings` and start the
    /// worker. Quiet mode is sent immediately so the device stops chattering.
    pub fn open(settings: &SerialSettings, hook: Option<Arc<dyn StatusHook>>) -> Result<Self> {
        let transport = SerialTransport::open(settings)?;
        info!(port = %settings.port, baud = settings.baud, "serial opened");
        Self::open_with(Box::new(transport), hook)
    }

    /// Start the driver over an already-established transport.
    pub fn open_with(
        transport: Box<dyn Transport>,
        hook: Option<Arc<dyn StatusHook>>,
    ) -> Result<Self> {
        let (tx, rx) = unbounded::<WorkerMsg>();
        let running = Arc::new(AtomicBool::new(true));
        let write_errors = Arc::new(AtomicU64::new(0));

        let worker_running = Arc::clone(&running);
        let worker_errors = Arc::clone(&write_errors);
        let worker_hook = hook.clone();
        let handle = std::thread::Builder::new()
            .name("thermode-serial".into())
            .spawn(move || {
                worker_loop(rx, transport, worker_running, worker_errors, worker_hook);
            })
            .map_err(|e| ConnectionError::OpenFailed(e.to_string()))?;

        let driver = Self {
            tx,
            running,
            write_errors,
            worker: Mutex::new(Some(handle)),
            hook,
        };

        driver.enqueue(SerialCommand::raw(protocol::QUIET_MODE))?;
        if let Some(ref hook) = driver.hook {
            hook.opened();
        }
        Ok(driver)
    }

    /// A driver with no connection. Every enqueue reports a drop; the rest
    /// of the session can still run with stimulation disabled.
    pub fn closed() -> Self {
        let (tx, _rx) = unbounded::<WorkerMsg>();
        Self {
            tx,
            running: Arc::new(AtomicBool::new(false)),
            write_errors: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
            hook: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of serial write failures since open
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::SeqCst)
    }

    /// Append a command to the FIFO. Fails (command dropped, not retried)
    /// when the connection is not open. Never blocks.
    pub fn enqueue(&self, cmd: SerialCommand) -> Result<()> {
        if !self.is_open() {
            return Err(ConnectionError::NotOpen.into());
        }
        self.tx
            .send(WorkerMsg::Command(cmd))
            .map_err(|_| ConnectionError::NotOpen.into())
    }

    /// Set base temperature (valid 20.0 – 45.0 °C)
    pub fn set_base_temperature(&self, temp_c: f32) -> Result<()> {
        let cmd = protocol::encode_base_temperature(temp_c)?;
        debug!(temp_c, cmd = %String::from_utf8_lossy(&cmd), "base temperature");
        self.enqueue(SerialCommand::raw(cmd))
    }

    /// Set target temperature (valid 0.0 – 60.0 °C); surface 0 = all
    pub fn set_target_temperature(&self, temp_c: f32, surface: u8) -> Result<()> {
        let cmd = protocol::encode_target_temperature(temp_c, surface)?;
        debug!(temp_c, surface, cmd = %String::from_utf8_lossy(&cmd), "target temperature");
        self.enqueue(SerialCommand::raw(cmd))
    }

    /// Set stimulation duration (valid 10 – 99,999 ms); surface 0 = all
    pub fn set_duration(&self, duration_ms: u32, surface: u8) -> Result<()> {
        let cmd = protocol::encode_duration(duration_ms, surface)?;
        debug!(duration_ms, surface, "duration");
        self.enqueue(SerialCommand::raw(cmd))
    }

    /// Trigger stimulation with the configured target/duration
    pub fn trigger(&self) -> Result<()> {
        self.enqueue(SerialCommand::raw(protocol::TRIGGER))
    }

    /// Send a raw command string (advanced). An empty command is a no-op.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.enqueue(SerialCommand::raw(bytes.to_vec()))
    }

    /// Stop the worker and release the connection. Idempotent. Commands
    /// still queued when close is called are not drained.
    pub fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(WorkerMsg::Shutdown);

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + CLOSE_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("{}", ConnectionError::WorkerUnresponsive);
            }
        }
        if let Some(ref hook) = self.hook {
            hook.closed();
        }
        info!("serial closed");
    }
}

impl Drop for ThermodeDriver {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(
    rx: Receiver<WorkerMsg>,
    mut transport: Box<dyn Transport>,
    running: Arc<AtomicBool>,
    write_errors: Arc<AtomicU64>,
    hook: Option<Arc<dyn StatusHook>>,
) {
    while let Ok(msg) = rx.recv() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match msg {
            WorkerMsg::Shutdown => break,
            WorkerMsg::Command(cmd) => {
                if let Err(e) = transport.send(cmd.bytes()) {
                    write_errors.fetch_add(1, Ordering::SeqCst);
                    warn!(error = %e, "serial write failed");
                    if let Some(ref hook) = hook {
                        hook.write_error(&e);
                    }
                }
            }
        }
    }
    debug!("serial worker stopped");
}

/// Real serial transport over the `serialport` crate
struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    fn open(settings: &SerialSettings) -> Result<Self> {
        let mut port = serialport::new(settings.port.clone(), settings.baud)
            .timeout(Duration::from_millis(settings.read_timeout_ms))
            .open()
            .map_err(|e| ConnectionError::OpenFailed(e.to_string()))?;
        port.write_data_terminal_ready(settings.dtr)
            .map_err(|e| ConnectionError::OpenFailed(e.to_string()))?;
        port.write_request_to_send(settings.rts)
            .map_err(|e| ConnectionError::OpenFailed(e.to_string()))?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }
}

/// Loopback transport that records every frame. Used by tests and `--dry-run`.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    log: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_next: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames sent so far, in execution order
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.log.lock().clone()
    }

    /// Frames sent so far, as ASCII strings
    pub fn sent_ascii(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    /// Make the next send fail with a broken-pipe error
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected write failure",
            ));
        }
        self.log.lock().push(bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn open_memory() -> (ThermodeDriver, MemoryTransport) {
        let transport = MemoryTransport::new();
        let driver = ThermodeDriver::open_with(Box::new(transport.clone()), None)
            .expect("memory transport open");
        (driver, transport)
    }

    fn drain(transport: &MemoryTransport, expected: usize) -> Vec<String> {
        // The worker is asynchronous; give it a bounded moment to catch up
        let deadline = Instant::now() + Duration::from_millis(500);
        while transport.sent().len() < expected && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        transport.sent_ascii()
    }

    #[test]
    fn test_quiet_mode_sent_on_open() {
        let (driver, transport) = open_memory();
        let sent = drain(&transport, 1);
        assert_eq!(sent, vec!["F".to_string()]);
        driver.close();
    }

    #[test]
    fn test_commands_execute_in_fifo_order() {
        let (driver, transport) = open_memory();
        driver.set_base_temperature(32.0).unwrap();
        driver.set_target_temperature(46.0, 2).unwrap();
        driver.set_duration(2000, 2).unwrap();
        driver.trigger().unwrap();

        let sent = drain(&transport, 5);
        assert_eq!(sent, vec!["F", "N320", "C2460", "D202000", "L"]);
        driver.close();
    }

    #[test]
    fn test_concurrent_enqueue_preserves_per_caller_order() {
        let (driver, transport) = open_memory();
        let driver = Arc::new(driver);

        let mut handles = Vec::new();
        for caller in 0..4u8 {
            let driver = Arc::clone(&driver);
            handles.push(std::thread::spawn(move || {
                for i in 0..25u8 {
                    // Payload identifies caller and sequence
                    driver
                        .enqueue(SerialCommand::raw(vec![caller, i]))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // quiet mode + 100 payload frames
        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.sent().len() < 101 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let frames = transport.sent();
        assert_eq!(frames.len(), 101);

        // Within each caller the sequence must be strictly increasing, and
        // no frame may be interleaved mid-write (each arrives whole)
        let mut next: [u8; 4] = [0; 4];
        for frame in frames.iter().skip(1) {
            assert_eq!(frame.len(), 2);
            let caller = frame[0] as usize;
            assert_eq!(frame[1], next[caller]);
            next[caller] += 1;
        }
        assert_eq!(next, [25; 4]);
        driver.close();
    }

    #[test]
    fn test_validation_rejects_before_enqueue() {
        let (driver, transport) = open_memory();
        assert!(driver.set_target_temperature(60.1, 0).is_err());
        assert!(driver.set_base_temperature(19.0).is_err());
        assert!(driver.set_duration(5, 0).is_err());

        // Only the quiet-mode frame went out
        let sent = drain(&transport, 1);
        assert_eq!(sent, vec!["F".to_string()]);
        driver.close();
    }

    #[test]
    fn test_enqueue_after_close_reports_drop() {
        let (driver, _transport) = open_memory();
        driver.close();
        assert!(!driver.is_open());
        let err = driver.trigger().unwrap_err();
        assert!(err.to_string().contains("dropped"));
    }

    #[test]
    fn test_closed_driver_drops_everything() {
        let driver = ThermodeDriver::closed();
        assert!(!driver.is_open());
        assert!(driver.set_base_temperature(32.0).is_err());
        assert_eq!(driver.write_errors(), 0);
    }

    #[test]
    fn test_write_failure_does_not_kill_worker() {
        let (driver, transport) = open_memory();
        drain(&transport, 1); // quiet mode through first

        transport.fail_next();
        driver.set_base_temperature(32.0).unwrap(); // this write fails
        driver.trigger().unwrap(); // this one must still execute

        let sent = drain(&transport, 2);
        assert_eq!(sent, vec!["F", "L"]);

        let deadline = Instant::now() + Duration::from_millis(500);
        while driver.write_errors() < 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(driver.write_errors(), 1);
        assert!(driver.is_open());
        driver.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let (driver, _transport) = open_memory();
        driver.close();
        driver.close();
        driver.close();
    }
}
