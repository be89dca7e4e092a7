//! Asynchronous client initialization.
//!
//! [`InitHandle`] is a one-shot completion signal: it is completed exactly once, by the
//! background [`SyncThread`] after the first specs request finishes (successfully or not). Callers
//! can block on it, block with a timeout, or register callbacks that run when it completes.
//!
//! After initialization, the sync thread keeps polling the server periodically (unless disabled)
//! and replaces the snapshot in [`SpecsStore`].
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{
    specs::Specs,
    specs_fetcher::SpecsFetcher,
    specs_store::{SpecsSnapshot, SpecsStore},
    Error, Options, Result,
};

type Callback = Box<dyn FnOnce(&Result<()>) + Send + 'static>;

struct InitState {
    /// Holds `None` until initialization completes; `Some(Ok(()))` if the first specs request
    /// succeeded, `Some(Err(...))` if it failed.
    result: Option<Result<()>>,
    callbacks: Vec<Callback>,
}

pub(crate) struct InitSignal {
    state: Mutex<InitState>,
    completed: Condvar,
}

impl InitSignal {
    pub(crate) fn new() -> InitSignal {
        InitSignal {
            state: Mutex::new(InitState {
                result: None,
                callbacks: Vec::new(),
            }),
            completed: Condvar::new(),
        }
    }

    // Callbacks are never run while the lock is held, so poisoning cannot leave the state
    // half-updated.
    fn lock(&self) -> MutexGuard<'_, InitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete the signal. Returns `false` (and does nothing) if it was already completed.
    pub(crate) fn complete(&self, result: Result<()>) -> bool {
        let callbacks = {
            let mut state = self.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.callbacks)
        };

        self.completed.notify_all();

        for callback in callbacks {
            run_callback(callback, &result);
        }
        true
    }
}

fn run_callback(callback: Callback, result: &Result<()>) {
    // A panicking callback must not prevent the remaining callbacks from running.
    if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
        log::error!(target: "evalbridge", "initialization callback panicked");
    }
}

/// One-shot completion signal returned by [`Client::initialize`](crate::Client::initialize).
///
/// All handles returned for the same client share the same signal.
#[derive(Clone)]
pub struct InitHandle {
    signal: Arc<InitSignal>,
}

impl InitHandle {
    pub(crate) fn new(signal: Arc<InitSignal>) -> InitHandle {
        InitHandle { signal }
    }

    /// Returns `true` once initialization has completed.
    pub fn is_complete(&self) -> bool {
        self.signal.lock().result.is_some()
    }

    /// Outcome of initialization, or `None` if it is still in progress.
    pub fn result(&self) -> Option<Result<()>> {
        self.signal.lock().result.clone()
    }

    /// Block waiting for initialization to complete.
    ///
    /// # Errors
    ///
    /// Returns the error of the first specs request, if it failed. The client is usable either
    /// way.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.signal.lock();
        loop {
            match &state.result {
                Some(result) => return result.clone(),
                None => {
                    state = self
                        .signal
                        .completed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Block waiting for initialization to complete, for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] if `timeout` elapsed first, or the error of the first specs
    /// request.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let state = self.signal.lock();
        let (state, _) = self
            .signal
            .completed
            .wait_timeout_while(state, timeout, |state| state.result.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.result.clone().unwrap_or(Err(Error::NotReady))
    }

    /// Run `callback` once initialization completes.
    ///
    /// If initialization has already completed, `callback` runs immediately on the calling
    /// thread. Otherwise it runs on the background sync thread.
    pub fn on_complete(&self, callback: impl FnOnce(&Result<()>) + Send + 'static) {
        let result = {
            let mut state = self.signal.lock();
            match &state.result {
                Some(result) => result.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        run_callback(Box::new(callback), &result);
    }
}

/// Configuration for [`SyncThread`].
#[derive(Debug, Clone)]
pub(crate) struct SyncConfig {
    pub interval: Duration,
    pub jitter: Duration,
    pub init_timeout: Duration,
    pub background_sync: bool,
}

impl From<&Options> for SyncConfig {
    fn from(options: &Options) -> SyncConfig {
        SyncConfig {
            interval: options.specs_sync_interval,
            jitter: options.specs_sync_jitter,
            init_timeout: options.init_timeout,
            background_sync: options.background_sync,
        }
    }
}

/// Background thread that performs the first specs request, completes the [`InitSignal`], and
/// keeps specs up to date afterwards.
pub(crate) struct SyncThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the sync thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,
}

impl SyncThread {
    /// Start the sync thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start(
        mut fetcher: SpecsFetcher,
        store: Arc<SpecsStore>,
        config: SyncConfig,
        signal: Arc<InitSignal>,
    ) -> std::io::Result<SyncThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync`. Buffer size of 1 is enough
        // as we only ever send a stop command and ignore a full buffer.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("evalbridge-sync".to_owned())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            signal.complete(Err(Error::from(err)));
                            return;
                        }
                    };

                    let first = runtime.block_on(async {
                        tokio::time::timeout(config.init_timeout, fetcher.fetch_specs())
                            .await
                            .unwrap_or(Err(Error::InitTimeout))
                    });
                    let first = first.map(|specs| store_specs(&store, specs));
                    if let Err(err) = &first {
                        log::warn!(target: "evalbridge", "initialization failed: {err}");
                    }
                    let unrecoverable = matches!(first, Err(Error::Unauthorized));
                    signal.complete(first);

                    if unrecoverable || !config.background_sync {
                        return;
                    }

                    loop {
                        let timeout = jitter(config.interval, config.jitter);
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Timed out. Fetch new specs below.
                            }
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                                log::debug!(target: "evalbridge", "sync thread received stop command");
                                return;
                            }
                        }

                        match runtime.block_on(fetcher.fetch_specs()) {
                            Ok(specs) => store_specs(&store, specs),
                            Err(Error::Unauthorized) => return,
                            Err(err) => {
                                // Other errors are retriable.
                                log::warn!(target: "evalbridge", "background specs sync failed: {err}");
                            }
                        }
                    }
                }));

                // If catch_unwind returns Err, it means a panic occurred.
                if result.is_err() {
                    signal.complete(Err(Error::InitializerPanicked));
                }
            })?;

        Ok(SyncThread {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the sync thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or another stop command is
        // already buffered. Either way the thread is stopping.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the sync thread and block waiting for it to exit.
    ///
    /// Called from the sync thread itself (an initialization callback), this only stops it: the
    /// thread exits once the callback returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InitializerPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        if std::thread::current().id() == self.join_handle.thread().id() {
            log::debug!(target: "evalbridge", "shutdown requested from the sync thread");
            return Ok(());
        }
        self.join_handle
            .join()
            .map_err(|_| Error::InitializerPanicked)?;
        Ok(())
    }
}

fn store_specs(store: &SpecsStore, specs: Specs) {
    if !specs.has_updates && store.get_snapshot().is_some() {
        log::debug!(target: "evalbridge", "specs have no updates");
        return;
    }
    store.set_snapshot(Arc::new(SpecsSnapshot::from_network(specs)));
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
