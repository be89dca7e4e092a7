//! Every boundary operation, expressed over typed handles.
//!
//! [`Bridge`] owns a [`Registry`] and resolves handles on each call. Construction failures are
//! returned as errors; evaluations fail closed. The C ABI in [`crate::ffi`] is a thin layer over
//! the process-wide instance returned by [`Bridge::global`].
use std::sync::{Arc, OnceLock};

use crate::{
    evaluator::{DynamicConfig, Evaluator, Experiment, FeatureGate, Layer},
    handle::{ClientHandle, HandleKind, OptionsHandle, UserHandle},
    init_response::{copy_into, ClientInitResponseOptions},
    initializer::InitHandle,
    registry::Registry,
    Client, Options, Result, UserContext, UserFields,
};

/// Boundary facade over a handle [`Registry`].
///
/// # Examples
/// ```
/// # use evalbridge::{Bridge, UserFields};
/// let bridge = Bridge::new();
/// let options = bridge.create_options(None).unwrap();
/// let client = bridge.create_client("secret-key", options).unwrap();
/// bridge.release_options(options).unwrap();
///
/// let user = bridge
///     .create_user(UserFields { user_id: Some("u1"), ..UserFields::default() })
///     .unwrap();
/// assert!(!bridge.check_gate(client, user, "my_gate"));
///
/// bridge.release_user(user).unwrap();
/// bridge.release_client(client).unwrap();
/// ```
#[derive(Default)]
pub struct Bridge {
    registry: Registry,
}

impl Bridge {
    /// Create a bridge with its own empty registry.
    pub fn new() -> Bridge {
        Bridge::default()
    }

    /// Create a bridge over an existing registry.
    pub fn with_registry(registry: Registry) -> Bridge {
        Bridge { registry }
    }

    /// The process-wide bridge used by the C ABI. Created on first use.
    pub fn global() -> &'static Bridge {
        static GLOBAL: OnceLock<Bridge> = OnceLock::new();
        GLOBAL.get_or_init(Bridge::new)
    }

    /// The handle tables behind this bridge.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of live handles of the given kind.
    pub fn live_handles(&self, kind: HandleKind) -> usize {
        self.registry.live_handles(kind)
    }

    /// Release every handle of every kind.
    pub fn clear(&self) {
        self.registry.clear();
    }

    /// Create options with the given specs URL. `None` or an empty URL selects the default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSpecsUrl`](crate::Error::InvalidSpecsUrl) if `specs_url` is not an
    /// absolute URL.
    pub fn create_options(&self, specs_url: Option<&str>) -> Result<OptionsHandle> {
        self.register_options(Options::from_specs_url(specs_url)?)
    }

    /// Register fully built options.
    pub fn register_options(&self, options: Options) -> Result<OptionsHandle> {
        let handle = self.registry.options().insert(options)?;
        log::debug!(target: "evalbridge", handle; "created options");
        Ok(handle)
    }

    /// Release options. Clients created from them are not affected.
    pub fn release_options(&self, options: OptionsHandle) -> Result<()> {
        self.registry.options().remove(options)?;
        log::debug!(target: "evalbridge", handle = options; "released options");
        Ok(())
    }

    /// Create a client for `sdk_key`, copying the options referenced by `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`](crate::Error::InvalidHandle) if `options` does not
    /// resolve, and the errors of [`Client::new`] otherwise.
    pub fn create_client(&self, sdk_key: &str, options: OptionsHandle) -> Result<ClientHandle> {
        let options = self.registry.options().get(options)?;
        self.insert_client(Client::new(sdk_key, &options)?)
    }

    /// Like [`Bridge::create_client`], but evaluations are delegated to `evaluator`.
    pub fn create_client_with_evaluator(
        &self,
        sdk_key: &str,
        options: OptionsHandle,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<ClientHandle> {
        let options = self.registry.options().get(options)?;
        self.insert_client(Client::with_evaluator(sdk_key, &options, evaluator)?)
    }

    fn insert_client(&self, client: Client) -> Result<ClientHandle> {
        let handle = self.registry.clients().insert(client)?;
        log::debug!(target: "evalbridge", handle; "created client");
        Ok(handle)
    }

    /// Release a client.
    ///
    /// Background sync is asked to stop immediately. Evaluations already in flight on another
    /// thread finish against the detached client, which is destroyed after the last one.
    pub fn release_client(&self, client: ClientHandle) -> Result<()> {
        let detached = self.registry.clients().remove(client)?;
        detached.stop_sync();
        log::debug!(target: "evalbridge", handle = client; "released client");
        Ok(())
    }

    /// Start client initialization without blocking. See [`Client::initialize`].
    pub fn initialize(&self, client: ClientHandle) -> Result<InitHandle> {
        Ok(self.registry.clients().get(client)?.initialize())
    }

    /// Start client initialization and run `callback` exactly once when it completes.
    pub fn initialize_with_callback(
        &self,
        client: ClientHandle,
        callback: impl FnOnce(&Result<()>) + Send + 'static,
    ) -> Result<InitHandle> {
        Ok(self
            .registry
            .clients()
            .get(client)?
            .initialize_with_callback(callback))
    }

    /// Stop background sync of a client and wait for it to exit. The handle stays valid.
    pub fn shutdown_client(&self, client: ClientHandle) -> Result<()> {
        self.registry.clients().get(client)?.shutdown()
    }

    /// Stop background sync of a client without blocking and run `callback` once the sync thread
    /// has exited. The handle stays valid.
    ///
    /// If `client` does not resolve, the error is returned and `callback` is not run.
    pub fn shutdown_client_with_callback(
        &self,
        client: ClientHandle,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        self.registry
            .clients()
            .get(client)?
            .shutdown_with_callback(callback);
        Ok(())
    }

    /// Point-in-time summary of the specs a client holds.
    pub fn get_current_values(&self, client: ClientHandle) -> Result<String> {
        self.registry.clients().get(client)?.current_values()
    }

    /// Build a user from caller-supplied fields and register it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`](crate::Error::MalformedInput) if any JSON field is
    /// malformed. No handle is minted in that case.
    pub fn create_user(&self, fields: UserFields<'_>) -> Result<UserHandle> {
        self.register_user(UserContext::from_fields(fields)?)
    }

    /// Register a fully built user.
    pub fn register_user(&self, user: UserContext) -> Result<UserHandle> {
        let handle = self.registry.users().insert(user)?;
        log::trace!(target: "evalbridge", handle; "created user");
        Ok(handle)
    }

    /// Release a user. Evaluations already holding it finish first.
    pub fn release_user(&self, user: UserHandle) -> Result<()> {
        self.registry.users().remove(user)?;
        log::trace!(target: "evalbridge", handle = user; "released user");
        Ok(())
    }

    fn resolve(
        &self,
        client: ClientHandle,
        user: UserHandle,
    ) -> Result<(Arc<Client>, Arc<UserContext>)> {
        let client = self.registry.clients().get(client)?;
        let user = self.registry.users().get(user)?;
        Ok((client, user))
    }

    /// Evaluate a gate. Returns `false` if either handle does not resolve.
    pub fn check_gate(&self, client: ClientHandle, user: UserHandle, name: &str) -> bool {
        match self.resolve(client, user) {
            Ok((client, user)) => client.check_gate(&user, name),
            Err(err) => {
                log::warn!(target: "evalbridge", name; "check_gate failed closed: {err}");
                false
            }
        }
    }

    /// Evaluate a gate with its rule and evaluation details.
    pub fn get_feature_gate(
        &self,
        client: ClientHandle,
        user: UserHandle,
        name: &str,
    ) -> Result<FeatureGate> {
        let (client, user) = self.resolve(client, user)?;
        Ok(client.get_feature_gate(&user, name))
    }

    /// Evaluate an experiment.
    pub fn get_experiment(
        &self,
        client: ClientHandle,
        user: UserHandle,
        name: &str,
    ) -> Result<Experiment> {
        let (client, user) = self.resolve(client, user)?;
        Ok(client.get_experiment(&user, name))
    }

    /// Evaluate a dynamic config.
    pub fn get_dynamic_config(
        &self,
        client: ClientHandle,
        user: UserHandle,
        name: &str,
    ) -> Result<DynamicConfig> {
        let (client, user) = self.resolve(client, user)?;
        Ok(client.get_dynamic_config(&user, name))
    }

    /// Evaluate a layer.
    pub fn get_layer(&self, client: ClientHandle, user: UserHandle, name: &str) -> Result<Layer> {
        let (client, user) = self.resolve(client, user)?;
        Ok(client.get_layer(&user, name))
    }

    /// Serialize every gate, config and layer evaluated for `user` into a new string.
    pub fn get_client_init_response(
        &self,
        client: ClientHandle,
        user: UserHandle,
        options: ClientInitResponseOptions,
    ) -> Result<String> {
        let (client, user) = self.resolve(client, user)?;
        client.get_client_init_response(&user, options)
    }

    /// Serialize the same payload as [`Bridge::get_client_init_response`] into `buffer`.
    ///
    /// Copies at most `buffer.len()` bytes, writes no terminator, and returns the size of the
    /// full payload. A return value greater than `buffer.len()` means the copy was truncated.
    pub fn get_client_init_response_into(
        &self,
        client: ClientHandle,
        user: UserHandle,
        options: ClientInitResponseOptions,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let payload = self.get_client_init_response(client, user, options)?;
        Ok(copy_into(payload.as_bytes(), buffer))
    }
}
