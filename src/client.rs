use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    evaluator::{
        DynamicConfig, EvaluationDetails, Evaluator, Experiment, FeatureGate, Layer,
        SpecsEvaluator,
    },
    handle::{HandleKind, HandleTarget},
    init_response::{ClientInitResponse, ClientInitResponseOptions},
    initializer::{InitHandle, InitSignal, SyncConfig, SyncThread},
    specs_fetcher::SpecsFetcher,
    specs_store::{SpecsSnapshot, SpecsSource, SpecsStore},
    Error, Options, Result, UserContext,
};

/// Lifecycle state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    /// `initialize` has not been called.
    Uninitialized,
    /// The first specs request is in flight.
    Initializing,
    /// Initialization completed (successfully or not). Evaluations use whatever specs are held.
    Ready,
}

enum SyncState {
    Idle(SpecsFetcher),
    Running(SyncThread),
    Stopped,
}

/// A feature-evaluation client bound to one SDK key.
///
/// A client starts *uninitialized*. [`Client::initialize`] starts a background thread that
/// fetches specs; evaluations never block and return defaults until specs arrive.
///
/// # Examples
/// ```no_run
/// # use evalbridge::{Client, Options, UserContext};
/// let client = Client::new("secret-key", &Options::default()).unwrap();
/// let _ = client.initialize().wait();
/// let enabled = client.check_gate(&UserContext::with_user_id("u1"), "my_gate");
/// ```
pub struct Client {
    sdk_key: String,
    options: Options,
    store: Arc<SpecsStore>,
    evaluator: Arc<dyn Evaluator>,
    init: Arc<InitSignal>,
    sync: Mutex<SyncState>,
}

impl Client {
    /// Create a client that evaluates with the bundled [`SpecsEvaluator`].
    ///
    /// `options` are copied; later changes to them do not affect the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if `sdk_key` is empty, and [`Error::InvalidSpecsUrl`] if
    /// the specs URL for `sdk_key` is invalid.
    pub fn new(sdk_key: &str, options: &Options) -> Result<Client> {
        Client::with_evaluator(sdk_key, options, Arc::new(SpecsEvaluator))
    }

    /// Create a client that delegates evaluations to `evaluator`.
    ///
    /// # Errors
    ///
    /// Same as [`Client::new`].
    pub fn with_evaluator(
        sdk_key: &str,
        options: &Options,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<Client> {
        if sdk_key.is_empty() {
            return Err(Error::malformed("sdk_key", "must not be empty"));
        }
        let fetcher = SpecsFetcher::new(sdk_key, options)?;

        Ok(Client {
            sdk_key: sdk_key.to_owned(),
            options: options.clone(),
            store: Arc::new(SpecsStore::new()),
            evaluator,
            init: Arc::new(InitSignal::new()),
            sync: Mutex::new(SyncState::Idle(fetcher)),
        })
    }

    pub fn sdk_key(&self) -> &str {
        &self.sdk_key
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    // State transitions never panic midway, so the state behind a poisoned lock is consistent.
    fn lock_sync(&self) -> MutexGuard<'_, SyncState> {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if matches!(*self.lock_sync(), SyncState::Idle(_)) {
            Lifecycle::Uninitialized
        } else if InitHandle::new(self.init.clone()).is_complete() {
            Lifecycle::Ready
        } else {
            Lifecycle::Initializing
        }
    }

    /// Start initialization without blocking.
    ///
    /// The returned [`InitHandle`] completes exactly once, after the first specs request
    /// finishes. Calling `initialize` again does not fetch specs again; it returns a handle to
    /// the same completion.
    pub fn initialize(&self) -> InitHandle {
        let failure = {
            let mut state = self.lock_sync();
            match std::mem::replace(&mut *state, SyncState::Stopped) {
                SyncState::Idle(fetcher) => {
                    log::debug!(target: "evalbridge", "starting specs sync thread");
                    match SyncThread::start(
                        fetcher,
                        self.store.clone(),
                        SyncConfig::from(&self.options),
                        self.init.clone(),
                    ) {
                        Ok(thread) => {
                            *state = SyncState::Running(thread);
                            None
                        }
                        Err(err) => Some(Error::from(err)),
                    }
                }
                other => {
                    *state = other;
                    None
                }
            }
        };

        // Completing runs callbacks, which must not observe the state lock held.
        if let Some(err) = failure {
            log::warn!(target: "evalbridge", "failed to start specs sync thread: {err}");
            self.init.complete(Err(err));
        }

        InitHandle::new(self.init.clone())
    }

    /// Start initialization and run `callback` once it completes.
    ///
    /// On repeated calls `callback` still runs exactly once: immediately if initialization has
    /// already completed.
    pub fn initialize_with_callback(
        &self,
        callback: impl FnOnce(&Result<()>) + Send + 'static,
    ) -> InitHandle {
        let handle = self.initialize();
        handle.on_complete(callback);
        handle
    }

    /// Serialize a point-in-time summary of the specs currently held.
    pub fn current_values(&self) -> Result<String> {
        #[derive(Serialize)]
        struct CurrentValues<'a> {
            source: SpecsSource,
            lifecycle: Lifecycle,
            time: u64,
            #[serde(with = "chrono::serde::ts_milliseconds_option")]
            received_at: Option<DateTime<Utc>>,
            feature_gates: Vec<&'a str>,
            dynamic_configs: Vec<&'a str>,
            layer_configs: Vec<&'a str>,
        }

        let snapshot = self.store.get_snapshot();
        let values = match snapshot.as_deref() {
            Some(snapshot) => CurrentValues {
                source: snapshot.source,
                lifecycle: self.lifecycle(),
                time: snapshot.specs.time,
                received_at: Some(snapshot.received_at),
                feature_gates: snapshot.specs.gate_names(),
                dynamic_configs: snapshot.specs.config_names(),
                layer_configs: snapshot.specs.layer_names(),
            },
            None => CurrentValues {
                source: SpecsSource::Uninitialized,
                lifecycle: self.lifecycle(),
                time: 0,
                received_at: None,
                feature_gates: Vec::new(),
                dynamic_configs: Vec::new(),
                layer_configs: Vec::new(),
            },
        };
        Ok(serde_json::to_string(&values)?)
    }

    fn snapshot(&self, name: &str) -> Option<Arc<SpecsSnapshot>> {
        let snapshot = self.store.get_snapshot();
        if snapshot.is_none() {
            // We treat missing specs (sync has not fetched them yet) as a normal scenario.
            log::warn!(target: "evalbridge", name; "evaluating before specs have been fetched");
        }
        snapshot
    }

    /// Evaluate a gate. Unknown gates and uninitialized clients evaluate to `false`.
    pub fn check_gate(&self, user: &UserContext, name: &str) -> bool {
        self.get_feature_gate(user, name).value
    }

    pub fn get_feature_gate(&self, user: &UserContext, name: &str) -> FeatureGate {
        let snapshot = self.snapshot(name);
        let specs = snapshot.as_deref().map(|snapshot| &snapshot.specs);

        let evaluation = self.evaluator.check_gate(specs, user, name);
        let details = EvaluationDetails::new(snapshot.as_deref(), evaluation.is_some());
        let gate = FeatureGate::new(name, evaluation, details);

        log::trace!(target: "evalbridge",
                    name,
                    value = gate.value,
                    rule_id = gate.rule_id.as_str(),
                    user:serde;
                    "evaluated a gate");
        gate
    }

    /// Evaluate an experiment. Unknown experiments evaluate to an empty value.
    pub fn get_experiment(&self, user: &UserContext, name: &str) -> Experiment {
        let snapshot = self.snapshot(name);
        let specs = snapshot.as_deref().map(|snapshot| &snapshot.specs);

        let evaluation = self.evaluator.get_config(specs, user, name);
        let details = EvaluationDetails::new(snapshot.as_deref(), evaluation.is_some());
        let experiment = Experiment::new(name, evaluation, details);

        log::trace!(target: "evalbridge",
                    name,
                    experiment:serde,
                    user:serde;
                    "evaluated an experiment");
        experiment
    }

    /// Evaluate a dynamic config. Unknown configs evaluate to an empty value.
    pub fn get_dynamic_config(&self, user: &UserContext, name: &str) -> DynamicConfig {
        let snapshot = self.snapshot(name);
        let specs = snapshot.as_deref().map(|snapshot| &snapshot.specs);

        let evaluation = self.evaluator.get_config(specs, user, name);
        let details = EvaluationDetails::new(snapshot.as_deref(), evaluation.is_some());
        let config = DynamicConfig::new(name, evaluation, details);

        log::trace!(target: "evalbridge",
                    name,
                    config:serde,
                    user:serde;
                    "evaluated a dynamic config");
        config
    }

    /// Evaluate a layer. Unknown layers evaluate to an empty value.
    pub fn get_layer(&self, user: &UserContext, name: &str) -> Layer {
        let snapshot = self.snapshot(name);
        let specs = snapshot.as_deref().map(|snapshot| &snapshot.specs);

        let evaluation = self.evaluator.get_layer(specs, user, name);
        let details = EvaluationDetails::new(snapshot.as_deref(), evaluation.is_some());
        let layer = Layer::new(name, evaluation, details);

        log::trace!(target: "evalbridge",
                    name,
                    layer:serde,
                    user:serde;
                    "evaluated a layer");
        layer
    }

    /// Serialize every gate, config and layer evaluated for `user`.
    pub fn get_client_init_response(
        &self,
        user: &UserContext,
        options: ClientInitResponseOptions,
    ) -> Result<String> {
        let snapshot = self.store.get_snapshot();
        ClientInitResponse::build(
            snapshot.as_deref(),
            self.evaluator.as_ref(),
            user,
            self.options.environment.as_deref(),
            options,
        )
        .to_json()
    }

    /// Stop background specs sync and wait for the sync thread to exit.
    ///
    /// The client stays usable with the last specs it received. A client shut down before
    /// `initialize` becomes ready without specs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InitializerPanicked`] if the sync thread panicked.
    pub fn shutdown(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.lock_sync(), SyncState::Stopped);
        match previous {
            SyncState::Running(thread) => thread.shutdown(),
            SyncState::Idle(_) => {
                self.init.complete(Ok(()));
                Ok(())
            }
            SyncState::Stopped => Ok(()),
        }
    }

    /// Stop background specs sync without blocking and run `callback` once the sync thread has
    /// exited.
    ///
    /// `callback` runs on a dedicated thread when a sync thread has to be joined, and on the
    /// calling thread otherwise.
    pub fn shutdown_with_callback<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let previous = std::mem::replace(&mut *self.lock_sync(), SyncState::Stopped);
        let thread = match previous {
            SyncState::Running(thread) => thread,
            SyncState::Idle(_) => {
                self.init.complete(Ok(()));
                return callback(Ok(()));
            }
            SyncState::Stopped => return callback(Ok(())),
        };
        thread.stop();

        let (sender, receiver) = std::sync::mpsc::sync_channel::<(SyncThread, F)>(1);
        let spawned = std::thread::Builder::new()
            .name("evalbridge-shutdown".to_owned())
            .spawn(move || {
                if let Ok((thread, callback)) = receiver.recv() {
                    callback(thread.shutdown());
                }
            });
        match spawned {
            Ok(_) => {
                // The receiver only goes away if the shutdown thread died before receiving.
                let _ = sender.send((thread, callback));
            }
            Err(err) => {
                log::warn!(target: "evalbridge", "failed to spawn shutdown thread, joining inline: {err}");
                callback(thread.shutdown());
            }
        }
    }

    /// Ask the sync thread to stop without waiting for it.
    pub(crate) fn stop_sync(&self) {
        if let SyncState::Running(thread) = &*self.lock_sync() {
            thread.stop();
        }
    }

    #[cfg(test)]
    pub(crate) fn set_specs(&self, specs: crate::specs::Specs) {
        self.store
            .set_snapshot(Arc::new(SpecsSnapshot::from_network(specs)));
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop_sync();
    }
}

impl HandleTarget for Client {
    const KIND: HandleKind = HandleKind::Client;
}
