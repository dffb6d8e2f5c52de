use std::fs;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::getpid;
use tracing::{debug, trace, warn};

use crate::engine::Instrumentation;

/// The signal used to interrupt every thread when the engine takes over.
pub const TAKEOVER_SIGNAL: Signal = Signal::SIGUSR2;

const TASK_DIR: &str = "/proc/self/task";

/// Id of the engine that currently owns the takeover signal, 0 when free.
static OWNER: AtomicUsize = AtomicUsize::new(0);
static NEXT_ENGINE_ID: AtomicUsize = AtomicUsize::new(1);
/// Takeover signals that actually ran the handler, across all engines.
static DELIVERED: AtomicU64 = AtomicU64::new(0);

extern "C" fn on_takeover(_signal: libc::c_int) {
    DELIVERED.fetch_add(1, Ordering::Relaxed);
}

/// Running totals over every attach of one engine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TakeoverStats {
    /// Tasks that were sent the takeover signal.
    pub signalled: u64,
    /// Tasks that exited between enumeration and signalling.
    pub vanished: u64,
    /// Handler invocations observed while this engine was attached.
    pub delivered: u64,
}

struct Attachment {
    /// Disposition of the takeover signal before we installed ours.
    previous: SigAction,
    delivered_at_attach: u64,
}

#[derive(Default)]
struct EngineState {
    attachment: Option<Attachment>,
    stats: TakeoverStats,
}

/// Takes over a running multi-threaded process the way a dynamic
/// instrumentation engine does: install a handler for [`TAKEOVER_SIGNAL`],
/// then interrupt every task listed in `/proc/self/task` with `tgkill`.
///
/// Only one `SignalEngine` can be attached per process at a time.
pub struct SignalEngine {
    id: usize,
    state: Mutex<EngineState>,
}

impl Default for SignalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalEngine {
    pub fn new() -> Self {
        SignalEngine {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn stats(&self) -> TakeoverStats {
        let state = self.lock();
        let mut stats = state.stats;
        if let Some(attachment) = &state.attachment {
            stats.delivered += DELIVERED
                .load(Ordering::Relaxed)
                .saturating_sub(attachment.delivered_at_attach);
        }
        stats
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owns_signal(&self) -> bool {
        OWNER.load(Ordering::Acquire) == self.id
    }
}

impl Instrumentation for SignalEngine {
    fn name(&self) -> &str {
        "signal"
    }

    fn attach_and_start(&self) -> Result<()> {
        let mut state = self.lock();
        if state.attachment.is_some() {
            bail!("signal engine is already attached");
        }
        if let Err(owner) = OWNER.compare_exchange(0, self.id, Ordering::AcqRel, Ordering::Acquire)
        {
            bail!("{TAKEOVER_SIGNAL} is already owned by signal engine #{owner}");
        }

        let action = SigAction::new(
            SigHandler::Handler(on_takeover),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only bumps an atomic counter.
        let previous = match unsafe { sigaction(TAKEOVER_SIGNAL, &action) } {
            Ok(previous) => previous,
            Err(e) => {
                OWNER.store(0, Ordering::Release);
                return Err(anyhow!(e).context("installing the takeover handler"));
            }
        };
        state.attachment = Some(Attachment {
            previous,
            delivered_at_attach: DELIVERED.load(Ordering::Relaxed),
        });

        let (signalled, vanished) = signal_every_task()?;
        state.stats.signalled += signalled;
        state.stats.vanished += vanished;
        debug!(signalled, vanished, "signal engine took over the process");
        Ok(())
    }

    fn detach_and_cleanup(&self) -> Result<()> {
        let mut state = self.lock();
        let attachment = match state.attachment.take() {
            Some(a) => a,
            None => bail!("signal engine is not attached"),
        };

        // SIG_IGN discards takeover signals still pending on any thread, so
        // restoring the previous disposition cannot act on one of ours.
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // SAFETY: ignoring a signal installs no code.
        unsafe { sigaction(TAKEOVER_SIGNAL, &ignore) }.context("discarding pending takeovers")?;
        // SAFETY: this is the disposition the process had before attach.
        unsafe { sigaction(TAKEOVER_SIGNAL, &attachment.previous) }
            .context("restoring the previous disposition")?;
        OWNER.store(0, Ordering::Release);

        let delivered = DELIVERED
            .load(Ordering::Relaxed)
            .saturating_sub(attachment.delivered_at_attach);
        state.stats.delivered += delivered;
        debug!(delivered, "signal engine released the process");
        Ok(())
    }

    fn is_attached(&self) -> bool {
        if self.lock().attachment.is_none() {
            return false;
        }
        match takeover_handler_installed() {
            Ok(installed) => installed,
            Err(e) => {
                warn!("cannot query the takeover disposition: {e:#}");
                false
            }
        }
    }

    fn check_consistent(&self) -> Result<()> {
        let state = self.lock();
        let attached = state.attachment.is_some();
        let installed = takeover_handler_installed()?;
        let owned = self.owns_signal();
        if attached != installed || attached != owned {
            bail!("attached={attached} handler_installed={installed} signal_owned={owned}");
        }
        Ok(())
    }
}

impl Drop for SignalEngine {
    fn drop(&mut self) {
        let attached = self.lock().attachment.is_some();
        if attached && let Err(e) = self.detach_and_cleanup() {
            warn!("failed to detach signal engine on drop: {e:#}");
        }
    }
}

/// Thread ids currently listed for this process.
fn list_tasks() -> Result<Vec<libc::pid_t>> {
    let mut tids = Vec::new();
    for entry in fs::read_dir(TASK_DIR).with_context(|| format!("listing {TASK_DIR}"))? {
        let entry = entry.with_context(|| format!("listing {TASK_DIR}"))?;
        if let Some(tid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<libc::pid_t>().ok())
        {
            tids.push(tid);
        }
    }
    Ok(tids)
}

/// Send the takeover signal to every task of this process. Returns the
/// number of tasks signalled and the number that exited before we got to them.
fn signal_every_task() -> Result<(u64, u64)> {
    signal_tasks(&list_tasks()?)
}

fn signal_tasks(tids: &[libc::pid_t]) -> Result<(u64, u64)> {
    let pid = getpid().as_raw();
    let signal = TAKEOVER_SIGNAL as libc::c_int;
    let mut signalled = 0;
    let mut vanished = 0;

    for &tid in tids {
        // SAFETY: tgkill scoped to our own thread group can only reach our threads.
        let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, signal) };
        match Errno::result(rc) {
            Ok(_) => signalled += 1,
            Err(Errno::ESRCH) => {
                trace!(tid, "task exited before takeover");
                vanished += 1;
            }
            Err(e) => return Err(anyhow!(e).context(format!("signalling task {tid}"))),
        }
    }

    Ok((signalled, vanished))
}

/// Ask the kernel whether our handler is the current disposition.
fn takeover_handler_installed() -> Result<bool> {
    let mut current = MaybeUninit::<libc::sigaction>::zeroed();
    // SAFETY: a null new action only reads the current disposition.
    let rc = unsafe {
        libc::sigaction(
            TAKEOVER_SIGNAL as libc::c_int,
            ptr::null(),
            current.as_mut_ptr(),
        )
    };
    Errno::result(rc).context("querying the takeover disposition")?;
    // SAFETY: sigaction succeeded and filled `current`.
    let current = unsafe { current.assume_init() };
    let ours = on_takeover as extern "C" fn(libc::c_int) as libc::sighandler_t;
    Ok(current.sa_sigaction == ours)
}
