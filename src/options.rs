use std::time::Duration;

use url::Url;

use crate::{handle::HandleKind, handle::HandleTarget, Error, Result};

/// Immutable client configuration.
///
/// A [`Client`](crate::Client) copies the options it is created with, so an `Options` handle can
/// be released as soon as the client exists.
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use evalbridge::Options;
/// let options = Options::new()
///     .with_specs_url("https://example.com/v2/download_config_specs")
///     .unwrap()
///     .with_init_timeout(Duration::from_secs(1));
/// ```
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Base URL for specs requests. The SDK key is appended as `/{sdk_key}.json`.
    ///
    /// Defaults to [`Options::DEFAULT_SPECS_URL`].
    pub specs_url: String,
    /// Interval to wait between background specs requests after initialization.
    ///
    /// Defaults to [`Options::DEFAULT_SPECS_SYNC_INTERVAL`].
    pub specs_sync_interval: Duration,
    /// Randomized duration subtracted from each sync interval, so that many processes started
    /// at once do not hit the server in lockstep.
    ///
    /// Defaults to [`Options::DEFAULT_SPECS_SYNC_JITTER`].
    pub specs_sync_jitter: Duration,
    /// Upper bound for the first specs request issued by `initialize`.
    ///
    /// Defaults to [`Options::DEFAULT_INIT_TIMEOUT`].
    pub init_timeout: Duration,
    /// Keep polling for specs after initialization. Defaults to `true`.
    pub background_sync: bool,
    /// Environment tier (e.g., "production") stamped into client init responses.
    pub environment: Option<String>,
}

impl Options {
    /// Default value for [`Options::specs_url`].
    pub const DEFAULT_SPECS_URL: &'static str =
        "https://api.statsigcdn.com/v2/download_config_specs";
    /// Default value for [`Options::specs_sync_interval`].
    pub const DEFAULT_SPECS_SYNC_INTERVAL: Duration = Duration::from_secs(10);
    /// Default value for [`Options::specs_sync_jitter`].
    pub const DEFAULT_SPECS_SYNC_JITTER: Duration = Duration::from_secs(1);
    /// Default value for [`Options::init_timeout`].
    pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Create `Options` using default configuration.
    pub fn new() -> Options {
        Options::default()
    }

    /// Build options from the boundary's `create_options(specs_url)` call. A missing or empty
    /// URL selects [`Options::DEFAULT_SPECS_URL`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSpecsUrl`] if `specs_url` is not an absolute URL.
    pub fn from_specs_url(specs_url: Option<&str>) -> Result<Options> {
        match specs_url.filter(|url| !url.is_empty()) {
            Some(url) => Options::new().with_specs_url(url),
            None => Ok(Options::new()),
        }
    }

    /// Override the specs base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSpecsUrl`] if `specs_url` is not an absolute URL.
    pub fn with_specs_url(mut self, specs_url: impl Into<String>) -> Result<Options> {
        let specs_url = specs_url.into();
        Url::parse(&specs_url).map_err(Error::InvalidSpecsUrl)?;
        self.specs_url = specs_url;
        Ok(self)
    }

    /// Update background sync interval with `interval`.
    pub fn with_specs_sync_interval(mut self, interval: Duration) -> Options {
        self.specs_sync_interval = interval;
        self
    }

    /// Update background sync jitter with `jitter`.
    pub fn with_specs_sync_jitter(mut self, jitter: Duration) -> Options {
        self.specs_sync_jitter = jitter;
        self
    }

    /// Update the first-fetch timeout with `timeout`.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Options {
        self.init_timeout = timeout;
        self
    }

    /// Enable or disable background specs sync after initialization.
    pub fn with_background_sync(mut self, enabled: bool) -> Options {
        self.background_sync = enabled;
        self
    }

    /// Set the environment tier.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Options {
        self.environment = Some(environment.into());
        self
    }

    /// URL from which specs for `sdk_key` are fetched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSpecsUrl`] if the resulting URL is invalid.
    pub fn specs_url_for(&self, sdk_key: &str) -> Result<Url> {
        let base = self.specs_url.trim_end_matches('/');
        Url::parse(&format!("{base}/{sdk_key}.json")).map_err(Error::InvalidSpecsUrl)
    }
}

impl Default for Options {
    fn default() -> Options {
        Options {
            specs_url: Options::DEFAULT_SPECS_URL.to_owned(),
            specs_sync_interval: Options::DEFAULT_SPECS_SYNC_INTERVAL,
            specs_sync_jitter: Options::DEFAULT_SPECS_SYNC_JITTER,
            init_timeout: Options::DEFAULT_INIT_TIMEOUT,
            background_sync: true,
            environment: None,
        }
    }
}

impl HandleTarget for Options {
    const KIND: HandleKind = HandleKind::Options;
}
