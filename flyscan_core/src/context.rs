//! Per-part execution context: abort signalling, bounded waits and progress.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel as xch;
use flyscan_traits::Completion;

use crate::error::{Report, ScanError};

/// How a hook stopped early.
#[derive(Debug)]
pub enum ControlOutcome {
    /// The controller stopped the hook; not an error.
    Aborted,
    Fault(Report),
}

impl From<Report> for ControlOutcome {
    fn from(r: Report) -> Self {
        Self::Fault(r)
    }
}

impl From<ScanError> for ControlOutcome {
    fn from(e: ScanError) -> Self {
        Self::Fault(e.into())
    }
}

pub type HookResult<T> = std::result::Result<T, ControlOutcome>;

/// One-shot abort signal shared by every context of an operation.
///
/// Waiters select on [`signal`](Self::signal); aborting drops the only sender
/// so every receiver wakes with a disconnect.
#[derive(Debug, Clone)]
pub struct AbortToken {
    flag: Arc<AtomicBool>,
    tx: Arc<std::sync::Mutex<Option<xch::Sender<()>>>>,
    rx: xch::Receiver<()>,
}

impl Default for AbortToken {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortToken {
    pub fn new() -> Self {
        let (tx, rx) = xch::bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(std::sync::Mutex::new(Some(tx))),
            rx,
        }
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let mut tx = self.tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        tx.take();
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn signal(&self) -> &xch::Receiver<()> {
        &self.rx
    }
}

/// Progress reported by a part: absolute completed steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub part: String,
    pub steps: usize,
}

#[derive(Debug, Clone)]
pub struct PartContext {
    part: String,
    abort: AbortToken,
    timeout: Duration,
    progress: Option<xch::Sender<Progress>>,
}

impl PartContext {
    pub fn new(part: &str, abort: AbortToken, timeout: Duration, progress: Option<xch::Sender<Progress>>) -> Self {
        Self {
            part: part.to_string(),
            abort,
            timeout,
            progress,
        }
    }

    /// Context for calling hooks directly, outside a controller.
    pub fn detached(part: &str, timeout: Duration) -> Self {
        Self::new(part, AbortToken::new(), timeout, None)
    }

    pub fn part(&self) -> &str {
        &self.part
    }

    /// Bound applied to every hardware wait.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn abort_token(&self) -> &AbortToken {
        &self.abort
    }

    pub fn check_abort(&self) -> HookResult<()> {
        if self.abort.is_aborted() { Err(ControlOutcome::Aborted) } else { Ok(()) }
    }

    /// Receive one message within the default timeout.
    pub fn wait<T>(&self, rx: &xch::Receiver<T>, what: &str) -> HookResult<T> {
        self.wait_for(rx, Some(self.timeout), what)
    }

    /// Receive one message, giving up after `timeout` if one is given.
    pub fn wait_for<T>(&self, rx: &xch::Receiver<T>, timeout: Option<Duration>, what: &str) -> HookResult<T> {
        self.check_abort()?;
        let closed = || ControlOutcome::from(ScanError::Hardware(format!("{what}: channel closed")));
        match timeout {
            Some(t) => xch::select! {
                recv(rx) -> msg => msg.map_err(|_| closed()),
                recv(self.abort.signal()) -> _ => Err(ControlOutcome::Aborted),
                default(t) => Err(ScanError::Timeout(what.to_string()).into()),
            },
            None => xch::select! {
                recv(rx) -> msg => msg.map_err(|_| closed()),
                recv(self.abort.signal()) -> _ => Err(ControlOutcome::Aborted),
            },
        }
    }

    /// Wait for a hardware request to complete.
    pub fn wait_completion(&self, completion: &Completion, timeout: Option<Duration>, what: &str) -> HookResult<()> {
        self.wait_for(completion, timeout, what)?
            .map_err(|msg| ControlOutcome::from(ScanError::HardwareFault(format!("{what}: {msg}"))))
    }

    /// Sleep unless aborted first.
    pub fn sleep(&self, d: Duration) -> HookResult<()> {
        self.check_abort()?;
        xch::select! {
            recv(self.abort.signal()) -> _ => Err(ControlOutcome::Aborted),
            default(d) => Ok(()),
        }
    }

    pub fn report_progress(&self, steps: usize) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(Progress {
                part: self.part.clone(),
                steps,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::scan_error;

    fn ctx() -> PartContext {
        PartContext::detached("p", Duration::from_millis(20))
    }

    #[test]
    fn wait_times_out() {
        let (_tx, rx) = xch::unbounded::<u8>();
        match ctx().wait(&rx, "thing") {
            Err(ControlOutcome::Fault(r)) => assert!(matches!(scan_error(&r), Some(ScanError::Timeout(_)))),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn abort_wakes_waiters() {
        let c = ctx();
        let token = c.abort_token().clone();
        let (_tx, rx) = xch::unbounded::<u8>();
        let h = std::thread::spawn(move || c.wait_for(&rx, None, "forever"));
        std::thread::sleep(Duration::from_millis(10));
        token.abort();
        assert!(matches!(h.join().unwrap(), Err(ControlOutcome::Aborted)));
    }

    #[test]
    fn completion_error_is_fault() {
        let (tx, rx) = xch::bounded(1);
        tx.send(Err("stalled".to_string())).unwrap();
        match ctx().wait_completion(&rx, None, "move") {
            Err(ControlOutcome::Fault(r)) => assert!(matches!(scan_error(&r), Some(ScanError::HardwareFault(_)))),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn progress_is_tagged_with_part() {
        let (tx, rx) = xch::unbounded();
        let c = PartContext::new("pmac", AbortToken::new(), Duration::from_secs(1), Some(tx));
        c.report_progress(7);
        assert_eq!(rx.recv().unwrap(), Progress { part: "pmac".into(), steps: 7 });
    }
}
