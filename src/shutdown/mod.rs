use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::iterator::{Handle, Signals};

const STATE_RUNNING: u8 = 0;
const STATE_STOP_REQUESTED: u8 = 1;
const STATE_FORCE_STOPPING: u8 = 2;
const STATE_TERMINATED: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    StopRequested,
    ForceStopping,
    Terminated,
}

/// What a termination signal means given how many came before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Escalation {
    /// First signal: drain gracefully within the grace period.
    BeginGraceful,
    /// Second signal mid-drain: release resources and terminate now.
    ForceStop,
    /// Third or later: exit with no cleanup at all.
    HardKill,
}

/// Monotonic shutdown state machine. Signals only ever move the state
/// forward; every thread polls it instead of owning its own stop flag.
#[derive(Default)]
pub struct ShutdownCoordinator {
    state: AtomicU8,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ShutdownState {
        match self.state.load(Ordering::Acquire) {
            STATE_RUNNING => ShutdownState::Running,
            STATE_STOP_REQUESTED => ShutdownState::StopRequested,
            STATE_FORCE_STOPPING => ShutdownState::ForceStopping,
            _ => ShutdownState::Terminated,
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) >= STATE_STOP_REQUESTED
    }

    /// Advances the state machine for one received signal and reports how
    /// the process must react.
    pub fn record_signal(&self) -> Escalation {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(match current {
                    STATE_RUNNING => STATE_STOP_REQUESTED,
                    STATE_STOP_REQUESTED => STATE_FORCE_STOPPING,
                    _ => STATE_TERMINATED,
                })
            })
            .expect("shutdown state update cannot fail");

        match previous {
            STATE_RUNNING => Escalation::BeginGraceful,
            STATE_STOP_REQUESTED => Escalation::ForceStop,
            _ => Escalation::HardKill,
        }
    }

    pub fn mark_terminated(&self) {
        self.state.store(STATE_TERMINATED, Ordering::Release);
    }
}

/// Dedicated thread feeding SIGINT/SIGTERM into the coordinator. The
/// escalation handler runs on the watcher thread, so it must only flip flags
/// or terminate the process.
pub struct SignalWatcher {
    #[cfg(unix)]
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

#[cfg(unix)]
pub fn watch_signals<F>(
    coordinator: Arc<ShutdownCoordinator>,
    on_escalation: F,
) -> io::Result<SignalWatcher>
where
    F: Fn(Escalation) + Send + 'static,
{
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();

    let thread = thread::Builder::new()
        .name("signal-watcher".to_owned())
        .spawn(move || {
            for _signal in signals.forever() {
                let escalation = coordinator.record_signal();
                on_escalation(escalation);
            }
        })?;

    Ok(SignalWatcher {
        handle,
        thread: Some(thread),
    })
}

#[cfg(not(unix))]
pub fn watch_signals<F>(
    _coordinator: Arc<ShutdownCoordinator>,
    _on_escalation: F,
) -> io::Result<SignalWatcher>
where
    F: Fn(Escalation) + Send + 'static,
{
    Ok(SignalWatcher { thread: None })
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
