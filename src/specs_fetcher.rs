//! An HTTP client that fetches specs from the server.
use reqwest::{StatusCode, Url};

use crate::{sdk_metadata::SDK_METADATA, specs::Specs, Error, Options, Result};

/// A client that fetches specs for a single SDK key.
pub struct SpecsFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    url: Url,
    /// If we receive a 401 Unauthorized error during a request, it means the SDK key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: bool,
}

impl SpecsFetcher {
    /// Create a fetcher for `sdk_key` using the URL and timeouts from `options`.
    pub fn new(sdk_key: &str, options: &Options) -> Result<SpecsFetcher> {
        let url = options.specs_url_for(sdk_key)?;
        let client = reqwest::Client::builder()
            .timeout(options.init_timeout)
            .user_agent(format!("{}/{}", SDK_METADATA.name, SDK_METADATA.version))
            .build()?;

        Ok(SpecsFetcher {
            client,
            url,
            unauthorized: false,
        })
    }

    pub async fn fetch_specs(&mut self) -> Result<Specs> {
        if self.unauthorized {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "evalbridge", "fetching specs");
        let response = self
            .client
            .get(self.url.clone())
            .header("x-sdk-type", SDK_METADATA.name)
            .header("x-sdk-version", SDK_METADATA.version)
            .send()
            .await?;

        let response = response.error_for_status().map_err(|err| {
            if matches!(
                err.status(),
                Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            ) {
                log::warn!(target: "evalbridge", "client is not authorized. Check your SDK key");
                self.unauthorized = true;
                Error::Unauthorized
            } else {
                log::warn!(target: "evalbridge", "received non-200 response while fetching specs: {:?}", err);
                Error::from(err)
            }
        })?;

        let body = response.bytes().await?;
        let specs = Specs::from_slice(&body)?;

        log::debug!(target: "evalbridge",
                    has_updates = specs.has_updates,
                    time = specs.time;
                    "successfully fetched specs");

        Ok(specs)
    }
}
