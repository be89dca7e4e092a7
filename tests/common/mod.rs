#![allow(dead_code)]

use std::time::{Duration, Instant};

use wiremock::{
    matchers::{method, path_regex},
    Mock, MockServer, ResponseTemplate,
};

/// A mock specs endpoint answering every `GET {url}/{sdk_key}.json` with the same response.
pub struct SpecsServer {
    // Declared first so the server is dropped before the runtime driving it.
    server: MockServer,
    runtime: tokio::runtime::Runtime,
}

impl SpecsServer {
    /// Serve `tests/data/specs.json` with status 200.
    pub fn with_fixture() -> SpecsServer {
        SpecsServer::start(200, fixture())
    }

    pub fn start(status: u16, body: Vec<u8>) -> SpecsServer {
        SpecsServer::with_response(
            ResponseTemplate::new(status).set_body_raw(body, "application/json"),
        )
    }

    /// Serve the fixture only after `delay`.
    pub fn with_delay(delay: Duration) -> SpecsServer {
        SpecsServer::with_response(
            ResponseTemplate::new(200)
                .set_body_raw(fixture(), "application/json")
                .set_delay(delay),
        )
    }

    fn with_response(response: ResponseTemplate) -> SpecsServer {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build test runtime");
        let server = runtime.block_on(async {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path_regex(r"^/v1/specs/[^/]+\.json$"))
                .respond_with(response)
                .mount(&server)
                .await;
            server
        });
        SpecsServer { server, runtime }
    }

    /// Base specs URL served by this server.
    pub fn url(&self) -> String {
        format!("{}/v1/specs", self.server.uri())
    }

    /// Number of requests received so far.
    pub fn requests(&self) -> usize {
        self.runtime
            .block_on(self.server.received_requests())
            .map_or(0, |requests| requests.len())
    }
}

fn fixture() -> Vec<u8> {
    std::fs::read("tests/data/specs.json").expect("failed to read specs fixture")
}

pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
