//! In-memory collaborators for unit tests.

use std::{
    collections::VecDeque,
    io,
    net::SocketAddrV4,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};

use crate::{
    device::{DisplaySink, Link, Restart, SensorSource, DISPLAY_LINES},
    flash::RamFlash,
    net::{Bind, Clock, Connector, Listener, Stream},
    types::{LedColor, SensorReadings, StatusLeds},
};

/// Simulated time; `sleep_ms` advances it.
#[derive(Debug, Default)]
pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }
}

#[derive(Debug, Default)]
struct StreamScript {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    hung_up: bool,
    closed: bool,
    fail_writes: bool,
}

/// Stream fed from a byte script. Clones share state so a test can inspect
/// what the code under test wrote after handing the stream over.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStream {
    inner: Arc<Mutex<StreamScript>>,
}

impl ScriptedStream {
    pub fn new(incoming: &[u8]) -> Self {
        let stream = Self::default();
        stream.push_incoming(incoming);
        stream
    }

    pub fn push_incoming(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().incoming.extend(bytes);
    }

    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().unwrap().written.clone()
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().written)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn hang_up(&self) {
        self.inner.lock().unwrap().hung_up = true;
    }

    pub fn fail_writes(&self) {
        self.inner.lock().unwrap().fail_writes = true;
    }
}

impl Stream for ScriptedStream {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes || inner.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted write failure"));
        }
        inner.written.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn available(&mut self) -> io::Result<usize> {
        Ok(self.inner.lock().unwrap().incoming.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let count = buf.len().min(inner.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(inner.incoming.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn is_connected(&mut self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.closed && !inner.hung_up
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().closed = true;
    }
}

/// Hands out queued streams; refuses once the queue is empty.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    streams: Arc<Mutex<VecDeque<ScriptedStream>>>,
    attempts: Arc<Mutex<Vec<SocketAddrV4>>>,
}

impl ScriptedConnector {
    pub fn new(streams: Vec<ScriptedStream>) -> Self {
        Self {
            streams: Arc::new(Mutex::new(streams.into())),
            attempts: Arc::default(),
        }
    }

    pub fn push(&self, stream: ScriptedStream) {
        self.streams.lock().unwrap().push_back(stream);
    }

    pub fn attempts(&self) -> Vec<SocketAddrV4> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Connector for ScriptedConnector {
    type Stream = ScriptedStream;

    fn connect(&mut self, addr: SocketAddrV4, _timeout: Duration) -> io::Result<ScriptedStream> {
        self.attempts.lock().unwrap().push(addr);
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedListener {
    pending: Arc<Mutex<VecDeque<ScriptedStream>>>,
}

impl ScriptedListener {
    pub fn push(&self, stream: ScriptedStream) {
        self.pending.lock().unwrap().push_back(stream);
    }
}

impl Listener for ScriptedListener {
    type Stream = ScriptedStream;

    fn accept(&mut self) -> io::Result<Option<ScriptedStream>> {
        Ok(self.pending.lock().unwrap().pop_front())
    }
}

/// Every bind returns a listener over the same client queue.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBind {
    pub listener: ScriptedListener,
    binds: Arc<AtomicUsize>,
    failed_binds: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl ScriptedBind {
    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn failed_binds(&self) -> usize {
        self.failed_binds.load(Ordering::SeqCst)
    }

    pub fn fail_binds(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Bind for ScriptedBind {
    type Listener = ScriptedListener;

    fn bind(&mut self) -> io::Result<ScriptedListener> {
        if self.fail.load(Ordering::SeqCst) {
            self.failed_binds.fetch_add(1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "scripted bind failure"));
        }
        self.binds.fetch_add(1, Ordering::SeqCst);
        Ok(self.listener.clone())
    }
}

#[derive(Debug, Default)]
struct LinkScript {
    up: bool,
    comes_back: bool,
    disconnects: usize,
    begins: Vec<String>,
}

/// Link whose state the test flips. `begin` brings it up only when `comes_back` is set.
#[derive(Debug, Clone, Default)]
pub struct FakeLink {
    inner: Arc<Mutex<LinkScript>>,
}

impl FakeLink {
    pub fn new(up: bool) -> Self {
        let link = Self::default();
        link.set_up(up);
        link
    }

    pub fn set_up(&self, up: bool) {
        self.inner.lock().unwrap().up = up;
    }

    pub fn set_comes_back(&self, comes_back: bool) {
        self.inner.lock().unwrap().comes_back = comes_back;
    }

    pub fn disconnects(&self) -> usize {
        self.inner.lock().unwrap().disconnects
    }

    pub fn begins(&self) -> Vec<String> {
        self.inner.lock().unwrap().begins.clone()
    }
}

impl Link for FakeLink {
    fn is_connected(&mut self) -> bool {
        self.inner.lock().unwrap().up
    }

    fn disconnect(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.up = false;
        inner.disconnects += 1;
    }

    fn begin(&mut self, ssid: &str, _password: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.begins.push(ssid.to_string());
        if inner.comes_back {
            inner.up = true;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingRestart {
    reasons: Arc<Mutex<Vec<String>>>,
}

impl RecordingRestart {
    pub fn count(&self) -> usize {
        self.reasons.lock().unwrap().len()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().unwrap().clone()
    }
}

impl Restart for RecordingRestart {
    fn restart(&self, reason: &str) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

#[derive(Debug, Default)]
pub struct DisplayState {
    pub lines: [String; DISPLAY_LINES],
    pub indicator: LedColor,
    pub leds: StatusLeds,
    pub clears: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingDisplay {
    pub state: Arc<Mutex<DisplayState>>,
}

impl RecordingDisplay {
    pub fn line(&self, index: usize) -> String {
        self.state.lock().unwrap().lines[index].clone()
    }

    pub fn indicator(&self) -> LedColor {
        self.state.lock().unwrap().indicator
    }

    pub fn leds(&self) -> StatusLeds {
        self.state.lock().unwrap().leds
    }
}

impl DisplaySink for RecordingDisplay {
    fn show_line(&mut self, index: usize, text: &str) {
        if let Some(line) = self.state.lock().unwrap().lines.get_mut(index) {
            *line = text.to_string();
        }
    }

    fn clear(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.lines = Default::default();
        state.clears += 1;
    }

    fn set_indicator(&mut self, color: LedColor) {
        self.state.lock().unwrap().indicator = color;
    }

    fn set_status_leds(&mut self, leds: StatusLeds) {
        self.state.lock().unwrap().leds = leds;
    }
}

#[derive(Debug, Clone, Default)]
pub struct FixedSensors {
    pub readings: Option<SensorReadings>,
}

impl SensorSource for FixedSensors {
    fn read(&mut self) -> Option<SensorReadings> {
        self.readings
    }
}

/// `RamFlash` that can refuse erases or the Nth word program.
#[derive(Debug, Clone)]
pub struct FaultyFlash {
    pub inner: RamFlash,
    pub fail_erase: bool,
    pub fail_after_writes: Option<usize>,
    writes: usize,
}

impl FaultyFlash {
    pub fn new(inner: RamFlash) -> Self {
        Self {
            inner,
            fail_erase: false,
            fail_after_writes: None,
            writes: 0,
        }
    }
}

impl ErrorType for FaultyFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for FaultyFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.inner.read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

impl NorFlash for FaultyFlash {
    const WRITE_SIZE: usize = RamFlash::WRITE_SIZE;
    const ERASE_SIZE: usize = RamFlash::ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if self.fail_erase {
            return Err(NorFlashErrorKind::Other);
        }
        self.inner.erase(from, to)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.fail_after_writes == Some(self.writes) {
            return Err(NorFlashErrorKind::Other);
        }
        self.writes += 1;
        self.inner.write(offset, bytes)
    }
}
