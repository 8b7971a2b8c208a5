//! Signal plumbing for the sampling loop
//!
//! Timer expirations, child exit and termination requests all arrive as
//! signals. They are blocked for the whole run and only let through inside
//! `sigsuspend`, which is the single place the run loop sleeps. The handler
//! does nothing but OR the signal's bit into [`PENDING`]; the woken loop
//! drains the word and does all real work itself.

use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigEvent, SigHandler, SigSet, SigevNotify,
    SigmaskHow, Signal,
};
use nix::sys::time::TimeSpec;
use nix::sys::timer::{Expiration, Timer, TimerSetTimeFlags};
use nix::time::ClockId;
use std::sync::atomic::{AtomicU32, Ordering};

/// Raised by the sampling timer on every expiration
pub const TIMER_SIGNAL: Signal = Signal::SIGUSR1;

/// Termination requests that are passed on to the child
pub const FORWARDED_SIGNALS: [Signal; 4] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
];

/// One bit per signal number that fired since the last drain
static PENDING: AtomicU32 = AtomicU32::new(0);

extern "C" fn record_signal(signo: libc::c_int) {
    if (0..32).contains(&signo) {
        PENDING.fetch_or(1 << signo, Ordering::SeqCst);
    }
}

/// Something the run loop has to react to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The sampling period elapsed
    Timer,
    /// A terminating signal arrived and must be forwarded
    Terminate(Signal),
    /// The child changed state (exited or was killed)
    ChildExited,
}

fn bit(signal: Signal) -> u32 {
    1 << (signal as i32)
}

/// Decode a drained pending word into events, in handling order: a timer
/// tick is sampled before the run is wound down.
pub fn decode(pending: u32) -> Vec<Event> {
    let mut events = Vec::new();
    if pending & bit(TIMER_SIGNAL) != 0 {
        events.push(Event::Timer);
    }
    events.extend(
        FORWARDED_SIGNALS
            .iter()
            .filter(|&&sig| pending & bit(sig) != 0)
            .map(|&sig| Event::Terminate(sig)),
    );
    if pending & bit(Signal::SIGCHLD) != 0 {
        events.push(Event::ChildExited);
    }
    events
}

fn watched_signals() -> impl Iterator<Item = Signal> {
    [TIMER_SIGNAL, Signal::SIGCHLD]
        .into_iter()
        .chain(FORWARDED_SIGNALS)
}

/// Blocks and catches the watched signals for as long as it is alive
pub struct WatchedSignals {
    old_mask: SigSet,
    /// Mask used while suspended: the caller's mask minus the watched set
    wait_mask: SigSet,
    old_actions: Vec<(Signal, SigAction)>,
}

impl WatchedSignals {
    /// Block the watched signals and route them to the recording handler.
    ///
    /// Must run before the child is started so that neither its exit nor the
    /// first timer tick can fire before the loop is ready.
    pub fn install() -> Result<Self> {
        let mut watched = SigSet::empty();
        for sig in watched_signals() {
            watched.add(sig);
        }

        let mut old_mask = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&watched), Some(&mut old_mask))
            .context("Failed to block watched signals")?;

        let mut wait_mask = old_mask;
        for sig in watched_signals() {
            wait_mask.remove(sig);
        }

        let mut guard = Self {
            old_mask,
            wait_mask,
            old_actions: Vec::new(),
        };

        PENDING.store(0, Ordering::SeqCst);
        for sig in watched_signals() {
            let flags = if sig == Signal::SIGCHLD {
                SaFlags::SA_NOCLDSTOP | SaFlags::SA_RESTART
            } else {
                SaFlags::SA_RESTART
            };
            let action = SigAction::new(SigHandler::Handler(record_signal), flags, SigSet::empty());
            // SAFETY: the handler only performs an atomic fetch_or
            let old = unsafe { sigaction(sig, &action) }
                .with_context(|| format!("Failed to install handler for {}", sig))?;
            guard.old_actions.push((sig, old));
        }

        Ok(guard)
    }

    /// The mask that was in effect before the watched signals were blocked
    pub fn original_mask(&self) -> &SigSet {
        &self.old_mask
    }

    /// Sleep until at least one watched signal fired, then drain them all.
    pub fn wait(&self) -> Vec<Event> {
        loop {
            let pending = PENDING.swap(0, Ordering::SeqCst);
            if pending != 0 {
                let events = decode(pending);
                if !events.is_empty() {
                    return events;
                }
            }
            // SAFETY: wait_mask is a valid, initialized signal set.
            // sigsuspend always returns -1/EINTR once a handler has run.
            unsafe {
                libc::sigsuspend(self.wait_mask.as_ref());
            }
        }
    }
}

impl Drop for WatchedSignals {
    fn drop(&mut self) {
        // Unblock first so anything still pending lands in our handler
        // rather than in a default disposition.
        if let Err(e) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.old_mask), None) {
            tracing::warn!("Failed to restore signal mask: {}", e);
        }
        for (sig, action) in self.old_actions.drain(..).rev() {
            // SAFETY: restoring the disposition that was in place before
            if let Err(e) = unsafe { sigaction(sig, &action) } {
                tracing::warn!("Failed to restore handler for {}: {}", sig, e);
            }
        }
        PENDING.store(0, Ordering::SeqCst);
    }
}

/// Repeating timer that raises [`TIMER_SIGNAL`]; disarmed when dropped
pub struct SampleTimer {
    _timer: Timer,
}

impl SampleTimer {
    pub fn arm(period: Duration) -> Result<Self> {
        let event = SigEvent::new(SigevNotify::SigevSignal {
            signal: TIMER_SIGNAL,
            si_value: 0,
        });
        let mut timer =
            Timer::new(ClockId::CLOCK_MONOTONIC, event).context("Failed to create sampling timer")?;
        timer
            .set(
                Expiration::Interval(TimeSpec::from_duration(period)),
                TimerSetTimeFlags::empty(),
            )
            .context("Failed to arm sampling timer")?;
        Ok(Self { _timer: timer })
    }
}
