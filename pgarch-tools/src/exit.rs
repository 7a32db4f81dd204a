//! Process exit handling.
//!
//! Resources which must be released even when the process terminates
//! early (temporary files, worker threads, database connections) register
//! a cleanup callback with the [`ExitContext`]. [`ExitContext::exit_nicely`]
//! runs the registered callbacks in LIFO order before terminating.
//!
//! The returned [`CleanupGuard`] unregisters the callback when the
//! resource is released normally.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Error;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SIGNAL_ABORT: AtomicBool = AtomicBool::new(false);

type CleanupFn = Box<dyn FnOnce() + Send>;

struct ExitInner {
    progname: String,
    callbacks: Mutex<Vec<(u64, String, CleanupFn)>>,
    next_id: AtomicU64,
    aborting: AtomicBool,
}

/// Explicit replacement for process global exit state.
///
/// Cheap to clone; all clones share the same callback chain.
#[derive(Clone)]
pub struct ExitContext {
    inner: Arc<ExitInner>,
}

/// Unregisters its cleanup callback on drop.
#[must_use = "dropping the guard unregisters the cleanup callback"]
pub struct CleanupGuard {
    context: Weak<ExitInner>,
    id: u64,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.context.upgrade() {
            let mut list = inner.callbacks.lock().unwrap();
            list.retain(|(id, _, _)| *id != self.id);
        }
    }
}

impl ExitContext {
    pub fn new(progname: &str) -> Self {
        Self {
            inner: Arc::new(ExitInner {
                progname: progname.to_string(),
                callbacks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                aborting: AtomicBool::new(false),
            }),
        }
    }

    pub fn progname(&self) -> &str {
        &self.inner.progname
    }

    /// Register `callback` to run on [`exit_nicely`](Self::exit_nicely).
    pub fn on_exit_nicely<F>(&self, name: &str, callback: F) -> CleanupGuard
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .push((id, name.to_string(), Box::new(callback)));
        CleanupGuard {
            context: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Number of registered callbacks.
    pub fn pending_cleanups(&self) -> usize {
        self.inner.callbacks.lock().unwrap().len()
    }

    /// Run and unregister all callbacks, most recently registered first.
    pub fn run_cleanup(&self) {
        loop {
            // never hold the lock while running a callback, it may
            // drop guards of its own
            let next = self.inner.callbacks.lock().unwrap().pop();
            match next {
                Some((_, name, callback)) => {
                    log::debug!("running cleanup '{}'", name);
                    callback();
                }
                None => break,
            }
        }
    }

    /// Run the cleanup chain and terminate the process.
    pub fn exit_nicely(&self, code: i32) -> ! {
        self.run_cleanup();
        std::process::exit(code);
    }

    /// Report `err` tagged with the program name and exit with code 1.
    pub fn fatal(&self, err: &Error) -> ! {
        eprintln!("{}: {}", self.inner.progname, err);
        self.exit_nicely(1);
    }

    /// Request cooperative cancellation.
    pub fn set_aborting(&self) {
        self.inner.aborting.store(true, Ordering::SeqCst);
    }

    /// True after [`set_aborting`](Self::set_aborting) or a termination signal.
    pub fn is_aborting(&self) -> bool {
        self.inner.aborting.load(Ordering::SeqCst) || SIGNAL_ABORT.load(Ordering::SeqCst)
    }
}

extern "C" fn handle_termination_signal(_signal: libc::c_int) {
    // only async-signal-safe work here
    SIGNAL_ABORT.store(true, Ordering::SeqCst);
}

/// Install handlers for SIGINT, SIGTERM and SIGQUIT which request
/// cancellation instead of killing the process.
pub fn install_termination_handlers() -> Result<(), Error> {
    let action = SigAction::new(
        SigHandler::Handler(handle_termination_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}
