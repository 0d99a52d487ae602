//! Relay engine
//!
//! Two OS threads move bytes between the terminal master and the claimed
//! interface, one per direction. Each thread owns its buffer and finishes a
//! chunk completely before reading the next one, so ordering within a
//! direction is preserved. A thread stops only on a fatal error (or a stop
//! request) and reports its outcome over a channel; the supervisor returns the
//! first report and asks the other loop to stop.
//!
//! The only retried condition is a USB timeout: the remaining bytes of the
//! current chunk are resubmitted immediately, with no backoff and no limit.
//! An indefinite USB timeout is carried out as back-to-back waits of
//! `usb_tick`, so both loops observe a stop request and drop their share of
//! the claimed interface.

use crate::error::BridgeError;
use common::usb::{BulkPipe, is_transient};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Relay direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    TerminalToUsb,
    UsbToTerminal,
}

impl Direction {
    fn thread_name(self) -> &'static str {
        match self {
            Direction::TerminalToUsb => "pty-to-usb",
            Direction::UsbToTerminal => "usb-to-pty",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::TerminalToUsb => write!(f, "pty->usb"),
            Direction::UsbToTerminal => write!(f, "usb->pty"),
        }
    }
}

/// Transfer and shutdown policy shared by both loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPolicy {
    /// Size of each direction's transfer buffer
    pub buffer_size: usize,
    /// Bulk transfer timeout; zero blocks indefinitely
    pub usb_timeout: Duration,
    /// Longest single bulk wait when `usb_timeout` is zero
    pub usb_tick: Duration,
    /// How long to wait for the second loop after the first one ended
    pub shutdown_grace: Duration,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            usb_timeout: Duration::ZERO,
            usb_tick: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

impl TransferPolicy {
    /// Timeout handed to each bulk call
    pub fn transfer_timeout(&self) -> Duration {
        if self.usb_timeout.is_zero() {
            self.usb_tick
        } else {
            self.usb_timeout
        }
    }
}

/// Outcome of one relay loop
///
/// `Ok(())` means the loop honoured a stop request.
#[derive(Debug)]
pub struct LoopReport {
    pub direction: Direction,
    pub result: Result<(), BridgeError>,
}

/// Copy terminal input to the device until a fatal error or a stop request
///
/// `TimedOut`, `WouldBlock` and `Interrupted` reads mean nothing arrived this
/// cycle. A zero-length read is end-of-file.
pub fn terminal_to_usb<R, P>(
    mut terminal: R,
    pipe: &P,
    policy: &TransferPolicy,
    stop: &AtomicBool,
) -> Result<(), BridgeError>
where
    R: Read,
    P: BulkPipe + ?Sized,
{
    let mut buf = vec![0u8; policy.buffer_size];

    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }

        let nread = match terminal.read(&mut buf) {
            Ok(0) => return Err(BridgeError::TerminalEof),
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => return Err(BridgeError::TerminalRead(e)),
        };

        write_all_bulk(pipe, &buf[..nread], policy.transfer_timeout(), stop)?;
    }
}

/// Hand `data` to the OUT endpoint, resuming after partial writes and timeouts
///
/// A stop request seen after a timeout abandons the rest of the chunk.
pub fn write_all_bulk<P>(
    pipe: &P,
    data: &[u8],
    timeout: Duration,
    stop: &AtomicBool,
) -> Result<(), BridgeError>
where
    P: BulkPipe + ?Sized,
{
    let mut cursor = 0;

    while cursor < data.len() {
        match pipe.write_bulk(&data[cursor..], timeout) {
            Ok(0) => {
                return Err(BridgeError::UsbWriteStalled {
                    remaining: data.len() - cursor,
                });
            }
            Ok(n) => {
                trace!("usb_bulk_write {} of {} bytes", n, data.len() - cursor);
                cursor += n;
            }
            Err(e) if is_transient(&e) => {
                if stop.load(Ordering::Acquire) {
                    debug!("stop requested, dropping {} unsent bytes", data.len() - cursor);
                    return Ok(());
                }
                debug!(
                    "usb_bulk_write timed out, retrying {} bytes",
                    data.len() - cursor
                );
            }
            Err(e) => return Err(BridgeError::UsbWrite(e)),
        }
    }

    Ok(())
}

/// Copy device output to the terminal until a fatal error or a stop request
///
/// Timed out reads are retried. The stop flag is observed between reads, at
/// least once per `usb_tick` when the timeout is indefinite.
pub fn usb_to_terminal<W, P>(
    mut terminal: W,
    pipe: &P,
    policy: &TransferPolicy,
    stop: &AtomicBool,
) -> Result<(), BridgeError>
where
    W: Write,
    P: BulkPipe + ?Sized,
{
    let mut buf = vec![0u8; policy.buffer_size];

    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }

        let nread = match pipe.read_bulk(&mut buf, policy.transfer_timeout()) {
            Ok(0) => return Err(BridgeError::UsbReadEmpty),
            Ok(n) => n,
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(BridgeError::UsbRead(e)),
        };

        trace!("usb_bulk_read {} bytes", nread);
        terminal
            .write_all(&buf[..nread])
            .map_err(BridgeError::TerminalWrite)?;
    }
}

/// Handle to a running pair of relay loops
pub struct Bridge {
    reports: async_channel::Receiver<LoopReport>,
    stop: Arc<AtomicBool>,
    running: usize,
    grace: Duration,
}

/// Start both relay loops
///
/// `terminal_in` and `terminal_out` are two handles on the same master; the
/// pipe is shared read-only between the loops.
pub fn spawn<P, R, W>(
    pipe: Arc<P>,
    terminal_in: R,
    terminal_out: W,
    policy: TransferPolicy,
) -> Result<Bridge, BridgeError>
where
    P: BulkPipe + ?Sized + 'static,
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (tx, reports) = async_channel::bounded(2);
    let stop = Arc::new(AtomicBool::new(false));

    let outbound = {
        let pipe = pipe.clone();
        let stop = stop.clone();
        move || terminal_to_usb(terminal_in, pipe.as_ref(), &policy, &stop)
    };
    spawn_loop(Direction::TerminalToUsb, tx.clone(), outbound)?;

    let inbound = {
        let stop = stop.clone();
        move || usb_to_terminal(terminal_out, pipe.as_ref(), &policy, &stop)
    };
    if let Err(e) = spawn_loop(Direction::UsbToTerminal, tx, inbound) {
        stop.store(true, Ordering::Release);
        return Err(e);
    }

    info!(
        "Relay started (buffer {} bytes, usb timeout {:?})",
        policy.buffer_size, policy.usb_timeout
    );

    Ok(Bridge {
        reports,
        stop,
        running: 2,
        grace: policy.shutdown_grace,
    })
}

fn spawn_loop<F>(
    direction: Direction,
    tx: async_channel::Sender<LoopReport>,
    relay: F,
) -> Result<(), BridgeError>
where
    F: FnOnce() -> Result<(), BridgeError> + Send + 'static,
{
    std::thread::Builder::new()
        .name(direction.thread_name().to_string())
        .spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(relay))
                .unwrap_or_else(|_| Err(BridgeError::Panicked(direction)));

            match &result {
                Ok(()) => info!("{} relay stopped", direction),
                Err(e) => error!("{} relay failed: {}", direction, e),
            }

            let _ = tx.send_blocking(LoopReport { direction, result });
        })
        .map(drop)
        .map_err(|source| BridgeError::Spawn { direction, source })
}

impl Bridge {
    /// Wait for the first loop to end
    ///
    /// Returns `None` if both loops vanished without reporting.
    pub async fn first_exit(&mut self) -> Option<LoopReport> {
        if self.running == 0 {
            return None;
        }

        let report = self.reports.recv().await.ok()?;
        self.running -= 1;
        Some(report)
    }

    /// Ask the loops to stop
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop the loops and collect what they report within the grace period
    ///
    /// Each bulk call waits at most one tick, so a healthy loop reports well
    /// within the grace period. One that does not is left to end with the
    /// process.
    pub async fn shutdown(mut self) -> Vec<LoopReport> {
        self.stop();

        let deadline = Instant::now() + self.grace;
        let mut collected = Vec::new();

        while self.running > 0 {
            match tokio::time::timeout_at(deadline, self.reports.recv()).await {
                Ok(Ok(report)) => {
                    self.running -= 1;
                    collected.push(report);
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(
                        "{} relay loop(s) still blocked after {:?}",
                        self.running, self.grace
                    );
                    break;
                }
            }
        }

        collected
    }

    /// Number of loops that have not reported yet
    pub fn running(&self) -> usize {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{ChunkedReader, FragmentingWriter, ScriptedPipe, payload};

    fn policy(buffer_size: usize) -> TransferPolicy {
        TransferPolicy {
            buffer_size,
            ..TransferPolicy::default()
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = TransferPolicy::default();
        assert_eq!(policy.buffer_size, 8192);
        assert_eq!(policy.usb_timeout, Duration::ZERO);
    }

    #[test]
    fn test_terminal_to_usb_relays_until_eof() {
        let data = payload(200);
        let reader = ChunkedReader::new(data.chunks(37).map(<[u8]>::to_vec));
        let pipe = ScriptedPipe::new().with_max_write_chunk(16);
        let stop = AtomicBool::new(false);

        let err = terminal_to_usb(reader, &pipe, &policy(64), &stop).unwrap_err();

        assert!(matches!(err, BridgeError::TerminalEof));
        assert_eq!(pipe.written(), data);
    }

    #[test]
    fn test_write_timeouts_resume_at_cursor() {
        let data = payload(1000);
        let pipe = ScriptedPipe::new()
            .with_max_write_chunk(7)
            .with_write_timeouts_every(3);

        write_all_bulk(&pipe, &data, Duration::ZERO, &AtomicBool::new(false)).unwrap();

        assert_eq!(pipe.written(), data);
        assert!(pipe.write_calls() > data.len() / 7);
    }

    #[test]
    fn test_fatal_write_error_stops_loop() {
        let reader = ChunkedReader::new(vec![b"ATZ\r".to_vec()]);
        let pipe = ScriptedPipe::new().with_write_error(rusb::Error::NoDevice);
        let stop = AtomicBool::new(false);

        let err = terminal_to_usb(reader, &pipe, &policy(64), &stop).unwrap_err();

        assert!(matches!(err, BridgeError::UsbWrite(rusb::Error::NoDevice)));
        assert_eq!(pipe.write_calls(), 1);
    }

    struct StallingPipe;

    impl BulkPipe for StallingPipe {
        fn write_bulk(&self, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
            Ok(if data.len() > 6 { 4 } else { 0 })
        }

        fn read_bulk(&self, _buf: &mut [u8], _timeout: Duration) -> rusb::Result<usize> {
            Err(rusb::Error::NoDevice)
        }
    }

    #[test]
    fn test_stalled_write_is_fatal() {
        // Accepts 4 bytes while more than 6 remain, then nothing.
        let err = write_all_bulk(&StallingPipe, &payload(10), Duration::ZERO, &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, BridgeError::UsbWriteStalled { remaining: 6 }));
    }

    #[test]
    fn test_write_timeout_with_stop_abandons_chunk() {
        let pipe = ScriptedPipe::new().with_write_timeouts_every(1);
        let stop = AtomicBool::new(true);

        write_all_bulk(&pipe, &payload(32), Duration::from_millis(1), &stop).unwrap();
        assert_eq!(pipe.write_calls(), 1);
        assert!(pipe.written().is_empty());
    }

    #[test]
    fn test_transfer_timeout() {
        let policy = TransferPolicy::default();
        assert_eq!(policy.transfer_timeout(), Duration::from_millis(200));

        let finite = TransferPolicy {
            usb_timeout: Duration::from_secs(2),
            ..TransferPolicy::default()
        };
        assert_eq!(finite.transfer_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_empty_chunk_needs_no_transfer() {
        let pipe = ScriptedPipe::new();
        write_all_bulk(&pipe, &[], Duration::ZERO, &AtomicBool::new(false)).unwrap();
        assert_eq!(pipe.write_calls(), 0);
    }

    #[test]
    fn test_idle_reads_are_not_errors() {
        let reader = ChunkedReader::new(vec![b"AT".to_vec()])
            .then_error(io::ErrorKind::TimedOut)
            .then_error(io::ErrorKind::Interrupted)
            .then_error(io::ErrorKind::WouldBlock);
        let pipe = ScriptedPipe::new();
        let stop = AtomicBool::new(false);

        let err = terminal_to_usb(reader, &pipe, &policy(64), &stop).unwrap_err();
        assert!(matches!(err, BridgeError::TerminalEof));
        assert_eq!(pipe.written(), b"AT");
    }

    #[test]
    fn test_hard_terminal_read_error_is_fatal() {
        let reader = ChunkedReader::new(Vec::new()).then_error(io::ErrorKind::Other);
        let pipe = ScriptedPipe::new();
        let stop = AtomicBool::new(false);

        let err = terminal_to_usb(reader, &pipe, &policy(64), &stop).unwrap_err();
        assert!(matches!(err, BridgeError::TerminalRead(_)));
    }

    #[test]
    fn test_terminal_to_usb_honours_stop() {
        let reader = ChunkedReader::new(Vec::new()).idle();
        let pipe = ScriptedPipe::new();
        let stop = AtomicBool::new(true);

        assert!(terminal_to_usb(reader, &pipe, &policy(64), &stop).is_ok());
    }

    #[test]
    fn test_usb_to_terminal_relays_until_device_gone() {
        let data = payload(5000);
        let pipe = ScriptedPipe::new().with_inbound(data.chunks(300).map(<[u8]>::to_vec));
        let writer = FragmentingWriter::new(50).with_interrupts_every(4);
        let sink = writer.sink();
        let stop = AtomicBool::new(false);

        let err = usb_to_terminal(writer, &pipe, &policy(256), &stop).unwrap_err();

        assert!(matches!(err, BridgeError::UsbRead(rusb::Error::NoDevice)));
        assert_eq!(*sink.lock().unwrap(), data);
    }

    #[test]
    fn test_read_timeouts_are_retried() {
        let pipe = ScriptedPipe::new();
        pipe.push_read(Ok(b"RING\r\n".to_vec()));
        pipe.push_read(Err(rusb::Error::Timeout));
        pipe.push_read(Err(rusb::Error::Timeout));
        pipe.push_read(Ok(b"CONNECT\r\n".to_vec()));
        pipe.push_read(Err(rusb::Error::Pipe));
        let writer = FragmentingWriter::new(3);
        let sink = writer.sink();
        let stop = AtomicBool::new(false);

        let err = usb_to_terminal(writer, &pipe, &policy(64), &stop).unwrap_err();

        assert!(matches!(err, BridgeError::UsbRead(rusb::Error::Pipe)));
        assert_eq!(*sink.lock().unwrap(), b"RING\r\nCONNECT\r\n");
    }

    #[test]
    fn test_empty_usb_read_is_fatal() {
        let pipe = ScriptedPipe::new();
        pipe.push_read(Ok(b"OK".to_vec()));
        pipe.push_read(Ok(Vec::new()));
        let writer = FragmentingWriter::new(64);
        let sink = writer.sink();
        let stop = AtomicBool::new(false);

        let err = usb_to_terminal(writer, &pipe, &policy(64), &stop).unwrap_err();

        assert!(matches!(err, BridgeError::UsbReadEmpty));
        assert_eq!(*sink.lock().unwrap(), b"OK");
    }

    #[test]
    fn test_terminal_write_failure_is_fatal() {
        let pipe = ScriptedPipe::new().with_inbound(vec![b"OK".to_vec()]);
        let writer = FragmentingWriter::new(64).failing(io::ErrorKind::BrokenPipe);
        let stop = AtomicBool::new(false);

        let err = usb_to_terminal(writer, &pipe, &policy(64), &stop).unwrap_err();
        assert!(matches!(err, BridgeError::TerminalWrite(_)));
    }

    #[tokio::test]
    async fn test_first_failure_is_reported_and_peer_stops() {
        // Device side dies; the terminal side is idle and must notice the stop flag.
        let pipe = Arc::new(ScriptedPipe::new().with_inbound(vec![b"hello".to_vec()]));
        let reader = ChunkedReader::new(Vec::new()).idle();
        let writer = FragmentingWriter::new(64);
        let sink = writer.sink();

        let mut bridge = spawn(pipe, reader, writer, TransferPolicy::default()).unwrap();

        let first = bridge.first_exit().await.unwrap();
        assert_eq!(first.direction, Direction::UsbToTerminal);
        assert!(matches!(
            first.result,
            Err(BridgeError::UsbRead(rusb::Error::NoDevice))
        ));

        let rest = bridge.shutdown().await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].direction, Direction::TerminalToUsb);
        assert!(rest[0].result.is_ok());
        assert_eq!(*sink.lock().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_terminal_eof_ends_bridge() {
        let pipe = Arc::new(ScriptedPipe::new().with_exhausted(rusb::Error::Timeout));
        let reader = ChunkedReader::new(vec![b"AT+CGMI\r".to_vec()]);
        let writer = FragmentingWriter::new(64);

        let mut bridge = spawn(pipe.clone(), reader, writer, TransferPolicy::default()).unwrap();

        let first = bridge.first_exit().await.unwrap();
        assert_eq!(first.direction, Direction::TerminalToUsb);
        assert!(matches!(first.result, Err(BridgeError::TerminalEof)));
        assert_eq!(pipe.written(), b"AT+CGMI\r");

        // The idle USB reader times out periodically and sees the stop flag.
        let rest = bridge.shutdown().await;
        assert_eq!(rest.len(), 1);
        assert!(rest[0].result.is_ok());
    }

    /// Device that never sends or accepts anything
    ///
    /// A zero timeout would block the calling thread for good; a finite one
    /// elapses and reports `Timeout`.
    struct SilentDevice {
        timeouts: std::sync::Mutex<Vec<Duration>>,
    }

    impl SilentDevice {
        fn new() -> Self {
            Self {
                timeouts: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn wait(&self, timeout: Duration) -> rusb::Error {
            self.timeouts.lock().unwrap().push(timeout);
            if timeout.is_zero() {
                std::thread::sleep(Duration::from_secs(3600));
            } else {
                std::thread::sleep(timeout);
            }
            rusb::Error::Timeout
        }
    }

    impl BulkPipe for SilentDevice {
        fn write_bulk(&self, _data: &[u8], timeout: Duration) -> rusb::Result<usize> {
            Err(self.wait(timeout))
        }

        fn read_bulk(&self, _buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
            Err(self.wait(timeout))
        }
    }

    #[tokio::test]
    async fn test_indefinite_timeout_still_releases_pipe() {
        let pipe = Arc::new(SilentDevice::new());
        let reader = ChunkedReader::new(vec![b"ATD*99#\r".to_vec()]).idle();
        let writer = FragmentingWriter::new(64);

        let bridge = spawn(pipe.clone(), reader, writer, TransferPolicy::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reports = bridge.shutdown().await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.result.is_ok()));

        let pipe = Arc::try_unwrap(pipe)
            .unwrap_or_else(|_| panic!("a relay thread still holds the pipe"));
        let timeouts = pipe.timeouts.into_inner().unwrap();
        assert!(!timeouts.is_empty());
        assert!(timeouts.iter().all(|t| *t == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_stop_request_ends_both_loops() {
        let pipe = Arc::new(ScriptedPipe::new().with_exhausted(rusb::Error::Timeout));
        let reader = ChunkedReader::new(Vec::new()).idle();
        let writer = FragmentingWriter::new(64);

        let bridge = spawn(pipe, reader, writer, TransferPolicy::default()).unwrap();
        assert_eq!(bridge.running(), 2);

        let reports = bridge.shutdown().await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.result.is_ok()));
    }
}
