//! Session supervision
//!
//! Waits for the first relay loop to end or for an interrupt, stops the other
//! loop, then drops the claimed interface so its release runs before the
//! process decides on an exit status.

use crate::engine::{Bridge, LoopReport};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// How a bridged session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// An interrupt was received; the only successful ending (exit 0)
    Interrupted,
    /// A relay loop ended first
    Stopped(LoopReport),
    /// Both loops went away without reporting
    Vanished,
}

/// Run the session until a loop ends or `interrupt` resolves
///
/// `claim` must be the last handle outside the relay threads; it is dropped
/// once both loops have reported. Returns whether that drop happened.
pub async fn supervise<P, S>(
    mut relay: Bridge,
    claim: Arc<P>,
    interrupt: S,
) -> (SessionEnd, bool)
where
    S: Future<Output = ()>,
{
    let end = tokio::select! {
        report = relay.first_exit() => match report {
            Some(report) => SessionEnd::Stopped(report),
            None => SessionEnd::Vanished,
        },
        () = interrupt => {
            info!("Received interrupt, shutting down");
            SessionEnd::Interrupted
        }
    };

    for report in relay.shutdown().await {
        if let Err(e) = report.result {
            warn!("{} relay ended with: {}", report.direction, e);
        }
    }

    let released = match Arc::try_unwrap(claim) {
        Ok(claim) => {
            drop(claim);
            true
        }
        Err(_) => {
            warn!("A relay loop is still using the device; the interface is released at exit");
            false
        }
    };

    (end, released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{self, Direction, TransferPolicy};
    use crate::error::BridgeError;
    use common::BulkPipe;
    use common::test_utils::{ChunkedReader, FragmentingWriter, ScriptedPipe};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Scripted pipe that records when it is dropped
    struct TrackedPipe {
        inner: ScriptedPipe,
        dropped: Arc<AtomicBool>,
    }

    impl TrackedPipe {
        fn new(inner: ScriptedPipe) -> (Arc<Self>, Arc<AtomicBool>) {
            let dropped = Arc::new(AtomicBool::new(false));
            let pipe = Arc::new(Self {
                inner,
                dropped: dropped.clone(),
            });
            (pipe, dropped)
        }
    }

    impl BulkPipe for TrackedPipe {
        fn write_bulk(&self, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
            self.inner.write_bulk(data, timeout)
        }

        fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
            self.inner.read_bulk(buf, timeout)
        }
    }

    impl Drop for TrackedPipe {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn start(pipe: &Arc<TrackedPipe>, reader: ChunkedReader) -> Bridge {
        engine::spawn(
            pipe.clone(),
            reader,
            FragmentingWriter::new(64),
            TransferPolicy::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_device_failure_releases_and_fails() {
        let (pipe, dropped) = TrackedPipe::new(ScriptedPipe::new());
        let relay = start(&pipe, ChunkedReader::new(Vec::new()).idle());

        let (end, released) = supervise(relay, pipe, std::future::pending()).await;

        assert!(released);
        assert!(dropped.load(Ordering::SeqCst));
        match end {
            SessionEnd::Stopped(report) => {
                assert_eq!(report.direction, Direction::UsbToTerminal);
                assert!(matches!(
                    report.result,
                    Err(BridgeError::UsbRead(rusb::Error::NoDevice))
                ));
            }
            other => panic!("unexpected ending: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_eof_releases_and_fails() {
        // Idle device with the default indefinite timeout.
        let (pipe, dropped) =
            TrackedPipe::new(ScriptedPipe::new().with_exhausted(rusb::Error::Timeout));
        let relay = start(&pipe, ChunkedReader::new(Vec::new()));

        let (end, released) = supervise(relay, pipe, std::future::pending()).await;

        assert!(released);
        assert!(dropped.load(Ordering::SeqCst));
        assert!(matches!(
            end,
            SessionEnd::Stopped(LoopReport {
                direction: Direction::TerminalToUsb,
                result: Err(BridgeError::TerminalEof),
            })
        ));
    }

    #[tokio::test]
    async fn test_interrupt_releases_and_succeeds() {
        let (pipe, dropped) =
            TrackedPipe::new(ScriptedPipe::new().with_exhausted(rusb::Error::Timeout));
        let relay = start(&pipe, ChunkedReader::new(Vec::new()).idle());

        let interrupt = tokio::time::sleep(Duration::from_millis(50));
        let (end, released) = supervise(relay, pipe, interrupt).await;

        assert!(matches!(end, SessionEnd::Interrupted));
        assert!(released);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_extra_handle_prevents_release() {
        let (pipe, dropped) =
            TrackedPipe::new(ScriptedPipe::new().with_exhausted(rusb::Error::Timeout));
        let relay = start(&pipe, ChunkedReader::new(Vec::new()).idle());
        let extra = pipe.clone();

        let (_, released) = supervise(relay, pipe, async {}).await;

        assert!(!released);
        assert!(!dropped.load(Ordering::SeqCst));
        drop(extra);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
