//! Test utilities for inq1-usbserial
//!
//! Scripted stand-ins for both ends of a bridge session, so relay and
//! discovery logic can be exercised without hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::ScriptedPipe;
//! use common::BulkPipe;
//! use std::time::Duration;
//!
//! let pipe = ScriptedPipe::new().with_max_write_chunk(3);
//! assert_eq!(pipe.write_bulk(b"hello", Duration::ZERO).unwrap(), 3);
//! assert_eq!(pipe.written(), b"hel");
//! ```

use crate::registry::DeviceIdentity;
use crate::usb::{BulkPipe, DeviceSource};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Device source whose device shows up on a given scan
///
/// Scanned devices are represented by the scan number that found them.
pub struct ScriptedSource {
    identity: Option<DeviceIdentity>,
    appear_on: u32,
    failure: Option<rusb::Error>,
    scans: AtomicU32,
}

impl ScriptedSource {
    /// A device with `identity` is present from scan `scan` onwards
    pub fn appearing_on(scan: u32, identity: DeviceIdentity) -> Self {
        Self {
            identity: Some(identity),
            appear_on: scan,
            failure: None,
            scans: AtomicU32::new(0),
        }
    }

    /// The bus stays empty
    pub fn never() -> Self {
        Self {
            identity: None,
            appear_on: u32::MAX,
            failure: None,
            scans: AtomicU32::new(0),
        }
    }

    /// Every enumeration fails with `error`
    pub fn failing(error: rusb::Error) -> Self {
        Self {
            identity: None,
            appear_on: u32::MAX,
            failure: Some(error),
            scans: AtomicU32::new(0),
        }
    }

    /// Number of scans performed so far
    pub fn scans(&self) -> u32 {
        self.scans.load(Ordering::SeqCst)
    }
}

impl DeviceSource for ScriptedSource {
    type Device = u32;

    fn scan(&self, identity: DeviceIdentity) -> rusb::Result<Option<u32>> {
        let scan = self.scans.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(error) = self.failure {
            return Err(error);
        }

        let present = scan >= self.appear_on && self.identity == Some(identity);
        Ok(present.then_some(scan))
    }
}

/// Bulk pipe with a scripted IN side and a recording OUT side
///
/// Reads replay the queued results in order, splitting chunks that do not fit
/// the caller's buffer. Once the script is drained every read returns the
/// configured exhaustion error (`NoDevice` unless changed); an exhaustion
/// error of `Timeout` models an idle device and sleeps briefly first.
pub struct ScriptedPipe {
    inbound: Mutex<VecDeque<rusb::Result<Vec<u8>>>>,
    exhausted: rusb::Error,
    written: Mutex<Vec<u8>>,
    write_calls: AtomicUsize,
    max_write_chunk: usize,
    timeout_every: usize,
    write_error: Option<rusb::Error>,
}

impl Default for ScriptedPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPipe {
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(VecDeque::new()),
            exhausted: rusb::Error::NoDevice,
            written: Mutex::new(Vec::new()),
            write_calls: AtomicUsize::new(0),
            max_write_chunk: usize::MAX,
            timeout_every: 0,
            write_error: None,
        }
    }

    /// Accept at most `chunk` bytes per write call
    pub fn with_max_write_chunk(mut self, chunk: usize) -> Self {
        self.max_write_chunk = chunk.max(1);
        self
    }

    /// Fail every `n`th write call with `Timeout`, accepting nothing
    pub fn with_write_timeouts_every(mut self, n: usize) -> Self {
        self.timeout_every = n;
        self
    }

    /// Fail every write call with `error`
    pub fn with_write_error(mut self, error: rusb::Error) -> Self {
        self.write_error = Some(error);
        self
    }

    /// Queue data chunks for the IN side
    pub fn with_inbound<I>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        {
            let mut inbound = self.inbound.lock().unwrap();
            inbound.extend(chunks.into_iter().map(Ok));
        }
        self
    }

    /// Queue one read result
    pub fn push_read(&self, result: rusb::Result<Vec<u8>>) {
        self.inbound.lock().unwrap().push_back(result);
    }

    /// Error returned by reads once the script is drained
    pub fn with_exhausted(mut self, error: rusb::Error) -> Self {
        self.exhausted = error;
        self
    }

    /// Everything accepted by the OUT side so far
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// Number of write calls made so far
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }
}

impl BulkPipe for ScriptedPipe {
    fn write_bulk(&self, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        let call = self.write_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(error) = self.write_error {
            return Err(error);
        }
        if self.timeout_every > 0 && call % self.timeout_every == 0 {
            return Err(rusb::Error::Timeout);
        }

        let n = data.len().min(self.max_write_chunk);
        self.written.lock().unwrap().extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        let next = self.inbound.lock().unwrap().pop_front();

        match next {
            Some(Ok(chunk)) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.inbound
                        .lock()
                        .unwrap()
                        .push_front(Ok(chunk[n..].to_vec()));
                }
                Ok(n)
            }
            Some(Err(error)) => Err(error),
            None => {
                if self.exhausted == rusb::Error::Timeout {
                    let idle = if timeout.is_zero() {
                        Duration::from_millis(5)
                    } else {
                        timeout.min(Duration::from_millis(20))
                    };
                    std::thread::sleep(idle);
                }
                Err(self.exhausted)
            }
        }
    }
}

/// Terminal-side reader that replays scripted results
///
/// Once drained it reports end-of-file, or, if built with [`idle`](Self::idle),
/// keeps reporting "nothing ready" the way a quiet pty does.
pub struct ChunkedReader {
    script: VecDeque<io::Result<Vec<u8>>>,
    idle_when_drained: bool,
}

impl ChunkedReader {
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Self {
            script: chunks.into_iter().map(Ok).collect(),
            idle_when_drained: false,
        }
    }

    /// Queue an error result after the chunks queued so far
    pub fn then_error(mut self, kind: io::ErrorKind) -> Self {
        self.script.push_back(Err(io::Error::from(kind)));
        self
    }

    /// Report `TimedOut` instead of end-of-file once drained
    pub fn idle(mut self) -> Self {
        self.idle_when_drained = true;
        self
    }
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.script.pop_front() {
            Some(Ok(chunk)) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.script.push_front(Ok(chunk[n..].to_vec()));
                }
                Ok(n)
            }
            Some(Err(e)) => Err(e),
            None if self.idle_when_drained => {
                std::thread::sleep(Duration::from_millis(5));
                Err(io::ErrorKind::TimedOut.into())
            }
            None => Ok(0),
        }
    }
}

/// Terminal-side writer that accepts at most `max_chunk` bytes per call
///
/// Every `interrupt_every`th call fails with `Interrupted`. The sink is shared
/// so tests can inspect it after the writer moved into a relay thread.
#[derive(Clone)]
pub struct FragmentingWriter {
    sink: Arc<Mutex<Vec<u8>>>,
    max_chunk: usize,
    interrupt_every: usize,
    calls: usize,
    failure: Option<io::ErrorKind>,
}

impl FragmentingWriter {
    pub fn new(max_chunk: usize) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Vec::new())),
            max_chunk: max_chunk.max(1),
            interrupt_every: 0,
            calls: 0,
            failure: None,
        }
    }

    pub fn with_interrupts_every(mut self, n: usize) -> Self {
        self.interrupt_every = n;
        self
    }

    /// Fail every write with `kind`
    pub fn failing(mut self, kind: io::ErrorKind) -> Self {
        self.failure = Some(kind);
        self
    }

    /// Handle to the collected bytes
    pub fn sink(&self) -> Arc<Mutex<Vec<u8>>> {
        self.sink.clone()
    }
}

impl Write for FragmentingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.calls += 1;

        if let Some(kind) = self.failure {
            return Err(kind.into());
        }
        if self.interrupt_every > 0 && self.calls % self.interrupt_every == 0 {
            return Err(io::ErrorKind::Interrupted.into());
        }

        let n = buf.len().min(self.max_chunk);
        self.sink.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Deterministic payload of `len` bytes covering every byte value
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INQ1;

    #[test]
    fn test_scripted_pipe_splits_large_chunks() {
        let pipe = ScriptedPipe::new().with_inbound(vec![vec![1, 2, 3, 4, 5]]);
        let mut buf = [0u8; 2];
        assert_eq!(pipe.read_bulk(&mut buf, Duration::ZERO).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(pipe.read_bulk(&mut buf, Duration::ZERO).unwrap(), 2);
        assert_eq!(buf, [3, 4]);
        assert_eq!(pipe.read_bulk(&mut buf, Duration::ZERO).unwrap(), 1);
        assert_eq!(
            pipe.read_bulk(&mut buf, Duration::ZERO),
            Err(rusb::Error::NoDevice)
        );
    }

    #[test]
    fn test_scripted_pipe_timeouts() {
        let pipe = ScriptedPipe::new().with_write_timeouts_every(2);
        assert_eq!(pipe.write_bulk(b"ab", Duration::ZERO), Ok(2));
        assert_eq!(
            pipe.write_bulk(b"cd", Duration::ZERO),
            Err(rusb::Error::Timeout)
        );
        assert_eq!(pipe.write_bulk(b"cd", Duration::ZERO), Ok(2));
        assert_eq!(pipe.written(), b"abcd");
        assert_eq!(pipe.write_calls(), 3);
    }

    #[test]
    fn test_scripted_source_counts_scans() {
        let source = ScriptedSource::appearing_on(2, INQ1);
        assert_eq!(source.scan(INQ1).unwrap(), None);
        assert_eq!(source.scan(INQ1).unwrap(), Some(2));
        assert_eq!(source.scans(), 2);
    }

    #[test]
    fn test_chunked_reader_eof() {
        let mut reader = ChunkedReader::new(vec![b"abc".to_vec()]);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_fragmenting_writer() {
        let mut writer = FragmentingWriter::new(2).with_interrupts_every(2);
        assert_eq!(writer.write(b"abc").unwrap(), 2);
        assert_eq!(
            writer.write(b"c").unwrap_err().kind(),
            io::ErrorKind::Interrupted
        );
        assert_eq!(writer.write(b"c").unwrap(), 1);
        assert_eq!(*writer.sink().lock().unwrap(), b"abc");
    }
}
