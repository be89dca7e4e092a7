use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier, Mutex,
    },
    time::Duration,
};

use evalbridge::{
    Bridge, ClientHandle, ClientInitResponseOptions, Error, EvaluationReason, HandleKind,
    HashAlgorithm, Lifecycle, Options, UserFields, UserHandle,
};
use serde_json::json;

mod common;
use common::{init_test_logger, wait_until, SpecsServer};

fn options_for(server: &SpecsServer) -> Options {
    Options::new()
        .with_specs_url(server.url())
        .unwrap()
        .with_background_sync(false)
        .with_init_timeout(Duration::from_secs(5))
}

/// Create an initialized client serving the fixture specs, plus user "u1".
fn ready_client(bridge: &Bridge, server: &SpecsServer) -> (ClientHandle, UserHandle) {
    let options = bridge.register_options(options_for(server)).unwrap();
    let client = bridge.create_client("secret-1", options).unwrap();
    bridge.release_options(options).unwrap();

    bridge.initialize(client).unwrap().wait().unwrap();

    let user = bridge
        .create_user(UserFields {
            user_id: Some("u1"),
            ..UserFields::default()
        })
        .unwrap();
    (client, user)
}

#[test]
fn create_then_release_client_invalidates_handle() {
    init_test_logger();
    let bridge = Bridge::new();

    for specs_url in [None, Some(""), Some("https://example/v1/specs")] {
        let options = bridge.create_options(specs_url).unwrap();
        for sdk_key in ["secret-1", "client-abc", "k"] {
            let client = bridge.create_client(sdk_key, options).unwrap();
            bridge.release_client(client).unwrap();

            assert!(matches!(
                bridge.get_current_values(client),
                Err(Error::InvalidHandle {
                    kind: HandleKind::Client
                })
            ));
            assert!(matches!(
                bridge.release_client(client),
                Err(Error::InvalidHandle { .. })
            ));
        }
        bridge.release_options(options).unwrap();
    }

    for kind in [HandleKind::Options, HandleKind::Client, HandleKind::User] {
        assert_eq!(bridge.live_handles(kind), 0);
    }
}

#[test]
fn empty_sdk_key_is_malformed_input() {
    let bridge = Bridge::new();
    let options = bridge.create_options(None).unwrap();
    assert!(matches!(
        bridge.create_client("", options),
        Err(Error::MalformedInput {
            field: "sdk_key",
            ..
        })
    ));
    assert_eq!(bridge.live_handles(HandleKind::Client), 0);
}

#[test]
fn invalid_specs_url_is_rejected() {
    let bridge = Bridge::new();
    assert!(matches!(
        bridge.create_options(Some("example/v1/specs")),
        Err(Error::InvalidSpecsUrl(_))
    ));
}

#[test]
fn user_round_trips_for_field_combinations() {
    let bridge = Bridge::new();
    let combinations = [
        UserFields::default(),
        UserFields {
            user_id: Some("u1"),
            ..UserFields::default()
        },
        UserFields {
            custom_ids_json: Some(r#"{"companyID": "c1", "deviceID": "d1"}"#),
            ..UserFields::default()
        },
        UserFields {
            user_id: Some("u2"),
            email: Some("u2@example.com"),
            ip: Some("127.0.0.1"),
            user_agent: Some("test"),
            country: Some("NZ"),
            locale: Some("en_NZ"),
            app_version: Some("2.0.0"),
            custom_json: Some(r#"{"tier": "gold", "nested": {"a": [1, 2]}}"#),
            private_json: Some(r#"{"token": "abc"}"#),
            ..UserFields::default()
        },
        UserFields {
            user_id: Some(""),
            custom_ids_json: Some(""),
            custom_json: Some(""),
            private_json: Some(""),
            ..UserFields::default()
        },
    ];

    for fields in combinations {
        let user = bridge.create_user(fields).unwrap();
        bridge.release_user(user).unwrap();
        assert!(bridge.release_user(user).is_err());
    }
    assert_eq!(bridge.live_handles(HandleKind::User), 0);
}

#[test]
fn malformed_user_json_is_malformed_input() {
    let bridge = Bridge::new();
    let bad = ["{", "null", "[]", "42", r#"{"a": "#];

    for json in bad {
        for fields in [
            UserFields {
                custom_ids_json: Some(json),
                ..UserFields::default()
            },
            UserFields {
                custom_json: Some(json),
                ..UserFields::default()
            },
            UserFields {
                private_json: Some(json),
                ..UserFields::default()
            },
        ] {
            assert!(
                matches!(bridge.create_user(fields), Err(Error::MalformedInput { .. })),
                "{json} must be rejected"
            );
        }
    }
    assert_eq!(bridge.live_handles(HandleKind::User), 0);
}

#[test]
fn check_gate_with_invalid_handles_is_false() {
    let server = SpecsServer::with_fixture();
    let bridge = Bridge::new();
    let (client, user) = ready_client(&bridge, &server);
    assert!(bridge.check_gate(client, user, "my_gate"));

    let other = Bridge::new();
    let (foreign_client, foreign_user) = ready_client(&other, &server);
    other.release_client(foreign_client).unwrap();
    other.release_user(foreign_user).unwrap();

    let released_user = bridge.create_user(UserFields::default()).unwrap();
    bridge.release_user(released_user).unwrap();

    assert!(!bridge.check_gate(client, released_user, "my_gate"));
    assert!(!other.check_gate(foreign_client, foreign_user, "my_gate"));

    bridge.release_client(client).unwrap();
    assert!(!bridge.check_gate(client, user, "my_gate"));
    assert!(matches!(
        bridge.get_experiment(client, user, "checkout_experiment"),
        Err(Error::InvalidHandle {
            kind: HandleKind::Client
        })
    ));
}

#[test]
fn init_response_buffer_negotiates_size() {
    let server = SpecsServer::with_fixture();
    let bridge = Bridge::new();
    let (client, user) = ready_client(&bridge, &server);

    let options = ClientInitResponseOptions::default();
    let owned = bridge
        .get_client_init_response(client, user, options)
        .unwrap();

    let mut untouched = [0xaau8; 16];
    let required = bridge
        .get_client_init_response_into(client, user, options, &mut untouched[..0])
        .unwrap();
    assert_eq!(required, owned.len());
    assert!(untouched.iter().all(|&b| b == 0xaa));

    let mut truncated = vec![0u8; required / 2];
    assert_eq!(
        bridge
            .get_client_init_response_into(client, user, options, &mut truncated)
            .unwrap(),
        required
    );
    assert_eq!(truncated, owned.as_bytes()[..required / 2]);

    let mut buffer = vec![0xaau8; required + 8];
    let written = bridge
        .get_client_init_response_into(client, user, options, &mut buffer)
        .unwrap();
    assert_eq!(written, required);
    assert_eq!(&buffer[..required], owned.as_bytes());
    assert!(buffer[required..].iter().all(|&b| b == 0xaa));

    let payload: serde_json::Value = serde_json::from_slice(&buffer[..required]).unwrap();
    assert_eq!(payload["feature_gates"]["my_gate"]["value"], json!(true));
    assert_eq!(payload["evaluated_keys"], json!({"userID": "u1"}));
}

#[test]
fn concurrent_release_and_check_gate() {
    let server = SpecsServer::with_fixture();
    let bridge = Arc::new(Bridge::new());
    let (client, user) = ready_client(&bridge, &server);

    const THREADS: usize = 8;
    let barrier = Arc::new(Barrier::new(THREADS + 1));

    let threads = (0..THREADS)
        .map(|_| {
            let bridge = bridge.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                let mut seen_false = false;
                for _ in 0..2000 {
                    let value = bridge.check_gate(client, user, "my_gate");
                    // Once the release is visible, it stays visible.
                    assert!(!(seen_false && value));
                    seen_false |= !value;
                }
            })
        })
        .collect::<Vec<_>>();

    barrier.wait();
    std::thread::sleep(Duration::from_millis(1));
    bridge.release_client(client).unwrap();

    for thread in threads {
        thread.join().unwrap();
    }
    assert!(!bridge.check_gate(client, user, "my_gate"));
    assert_eq!(bridge.live_handles(HandleKind::Client), 0);
}

#[test]
fn initialize_fires_exactly_once_and_does_not_refetch() {
    let server = SpecsServer::with_fixture();
    let bridge = Bridge::new();
    let options = bridge.register_options(options_for(&server)).unwrap();
    let client = bridge.create_client("secret-1", options).unwrap();

    assert_eq!(
        bridge.registry().clients().get(client).unwrap().lifecycle(),
        Lifecycle::Uninitialized
    );

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let handle = {
        let first = first.clone();
        bridge
            .initialize_with_callback(client, move |result| {
                assert!(result.is_ok());
                first.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };
    handle.wait().unwrap();
    assert!(wait_until(Duration::from_secs(5), || first
        .load(Ordering::SeqCst)
        == 1));

    {
        let second = second.clone();
        bridge
            .initialize_with_callback(client, move |_| {
                second.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    bridge.initialize(client).unwrap().wait().unwrap();

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(server.requests(), 1);
    assert_eq!(
        bridge.registry().clients().get(client).unwrap().lifecycle(),
        Lifecycle::Ready
    );
}

#[test]
fn unauthorized_completes_with_error_and_fails_closed() {
    let server = SpecsServer::start(401, b"{}".to_vec());
    let bridge = Bridge::new();
    let options = bridge.register_options(options_for(&server)).unwrap();
    let client = bridge.create_client("bad-key", options).unwrap();

    let result = bridge.initialize(client).unwrap().wait();
    assert!(matches!(result, Err(Error::Unauthorized)));

    let user = bridge
        .create_user(UserFields {
            user_id: Some("u1"),
            ..UserFields::default()
        })
        .unwrap();
    assert!(!bridge.check_gate(client, user, "my_gate"));
    let experiment = bridge
        .get_experiment(client, user, "checkout_experiment")
        .unwrap();
    assert_eq!(experiment.details.reason, EvaluationReason::Uninitialized);
}

#[test]
fn experiments_and_configs_are_served() {
    let server = SpecsServer::with_fixture();
    let bridge = Bridge::new();
    let (client, user) = ready_client(&bridge, &server);

    let experiment = bridge
        .get_experiment(client, user, "checkout_experiment")
        .unwrap();
    assert_eq!(experiment.value["button_color"], json!("green"));
    assert_eq!(experiment.group_name.as_deref(), Some("Test"));
    assert_eq!(experiment.details.reason, EvaluationReason::Network);

    let unknown = bridge.get_experiment(client, user, "no_such").unwrap();
    assert!(unknown.value.is_empty());
    assert_eq!(unknown.details.reason, EvaluationReason::Unrecognized);

    let config = bridge
        .get_dynamic_config(client, user, "pricing_config")
        .unwrap();
    assert_eq!(config.value["currency"], json!("NZD"));

    let gate = bridge
        .get_feature_gate(client, user, "company_gate")
        .unwrap();
    assert!(!gate.value);
    assert_eq!(gate.id_type, "companyID");

    let values: serde_json::Value =
        serde_json::from_str(&bridge.get_current_values(client).unwrap()).unwrap();
    assert_eq!(values["source"], json!("Network"));
    assert_eq!(values["time"], json!(1729300000000u64));
    assert_eq!(
        values["dynamic_configs"],
        json!(["checkout_experiment", "pricing_config"])
    );
}

#[test]
fn background_sync_polls_until_shutdown() {
    let server = SpecsServer::with_fixture();
    let bridge = Bridge::new();
    let options = bridge
        .register_options(
            options_for(&server)
                .with_background_sync(true)
                .with_specs_sync_interval(Duration::from_millis(20))
                .with_specs_sync_jitter(Duration::ZERO),
        )
        .unwrap();
    let client = bridge.create_client("secret-1", options).unwrap();
    bridge.initialize(client).unwrap().wait().unwrap();

    assert!(wait_until(Duration::from_secs(5), || server.requests() >= 3));

    bridge.shutdown_client(client).unwrap();
    let after_shutdown = server.requests();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(server.requests(), after_shutdown);

    // The client keeps serving its last snapshot.
    let user = bridge
        .create_user(UserFields {
            user_id: Some("u1"),
            ..UserFields::default()
        })
        .unwrap();
    assert!(bridge.check_gate(client, user, "my_gate"));
}

#[test]
fn slow_specs_endpoint_times_out_initialization() {
    init_test_logger();
    let server = SpecsServer::with_delay(Duration::from_secs(2));
    let bridge = Bridge::new();
    let options = bridge
        .register_options(options_for(&server).with_init_timeout(Duration::from_millis(200)))
        .unwrap();
    let client = bridge.create_client("secret-1", options).unwrap();

    let completions = Arc::new(AtomicUsize::new(0));
    let handle = {
        let completions = completions.clone();
        bridge
            .initialize_with_callback(client, move |result| {
                assert!(matches!(result, Err(Error::InitTimeout)));
                completions.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };
    assert!(matches!(handle.wait(), Err(Error::InitTimeout)));
    assert!(wait_until(Duration::from_secs(5), || completions
        .load(Ordering::SeqCst)
        == 1));
    assert_eq!(
        bridge.registry().clients().get(client).unwrap().lifecycle(),
        Lifecycle::Ready
    );

    let user = bridge
        .create_user(UserFields {
            user_id: Some("u1"),
            ..UserFields::default()
        })
        .unwrap();
    assert!(!bridge.check_gate(client, user, "my_gate"));

    bridge.release_user(user).unwrap();
    bridge.release_client(client).unwrap();
    bridge.release_options(options).unwrap();
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_from_initialization_callback_does_not_deadlock() {
    init_test_logger();
    // The delay makes the callback run on the sync thread rather than the caller's.
    let server = SpecsServer::with_delay(Duration::from_millis(100));
    let bridge = Arc::new(Bridge::new());
    let options = bridge
        .register_options(
            options_for(&server)
                .with_background_sync(true)
                .with_specs_sync_interval(Duration::from_millis(20))
                .with_specs_sync_jitter(Duration::ZERO),
        )
        .unwrap();
    let client = bridge.create_client("secret-1", options).unwrap();

    let outcome = Arc::new(Mutex::new(None));
    {
        let callback_bridge = bridge.clone();
        let outcome = outcome.clone();
        bridge
            .initialize_with_callback(client, move |_| {
                let thread = std::thread::current().name().map(str::to_owned);
                let shutdown = callback_bridge.shutdown_client(client);
                *outcome.lock().unwrap() = Some((thread, shutdown.is_ok()));
            })
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || outcome
        .lock()
        .unwrap()
        .is_some()));
    let (thread, shutdown_ok) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(thread.as_deref(), Some("evalbridge-sync"));
    assert!(shutdown_ok);

    // The sync thread stopped instead of polling again.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(server.requests(), 1);
    bridge.release_client(client).unwrap();
}

#[test]
fn shutdown_with_callback_does_not_block() {
    let server = SpecsServer::with_fixture();
    let bridge = Bridge::new();
    let options = bridge
        .register_options(
            options_for(&server)
                .with_background_sync(true)
                .with_specs_sync_interval(Duration::from_millis(20))
                .with_specs_sync_jitter(Duration::ZERO),
        )
        .unwrap();
    let client = bridge.create_client("secret-1", options).unwrap();
    bridge.initialize(client).unwrap().wait().unwrap();

    let finished = Arc::new(Mutex::new(None));
    {
        let finished = finished.clone();
        bridge
            .shutdown_client_with_callback(client, move |result| {
                let thread = std::thread::current().name().map(str::to_owned);
                *finished.lock().unwrap() = Some((thread, result.is_ok()));
            })
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || finished
        .lock()
        .unwrap()
        .is_some()));
    let (thread, ok) = finished.lock().unwrap().take().unwrap();
    assert_eq!(thread.as_deref(), Some("evalbridge-shutdown"));
    assert!(ok);

    let after_shutdown = server.requests();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(server.requests(), after_shutdown);

    // A second shutdown has nothing to join.
    let again = Arc::new(AtomicUsize::new(0));
    {
        let again = again.clone();
        bridge
            .shutdown_client_with_callback(client, move |_| {
                again.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    assert_eq!(again.load(Ordering::SeqCst), 1);
}

#[test]
fn layers_are_served() {
    let server = SpecsServer::with_fixture();
    let bridge = Bridge::new();
    let (client, user) = ready_client(&bridge, &server);

    let layer = bridge.get_layer(client, user, "checkout_layer").unwrap();
    assert_eq!(layer.value["button_color"], json!("green"));
    assert_eq!(layer.rule_id, "layer_assignment");
    assert_eq!(
        layer.allocated_experiment_name.as_deref(),
        Some("checkout_experiment")
    );
    assert_eq!(layer.details.reason, EvaluationReason::Network);

    let disabled = bridge.get_layer(client, user, "pricing_layer").unwrap();
    assert!(disabled.value.is_empty());
    assert_eq!(disabled.rule_id, "disabled");

    let anonymous = bridge.create_user(UserFields::default()).unwrap();
    let unassigned = bridge
        .get_layer(client, anonymous, "checkout_layer")
        .unwrap();
    assert!(unassigned.value.is_empty());
    assert_eq!(unassigned.rule_id, "default");
}

#[test]
fn init_response_hashes_names_on_request() {
    let server = SpecsServer::with_fixture();
    let bridge = Bridge::new();
    let (client, user) = ready_client(&bridge, &server);

    for hash_algorithm in [HashAlgorithm::None, HashAlgorithm::Djb2, HashAlgorithm::Sha256] {
        let options = ClientInitResponseOptions { hash_algorithm };
        let owned = bridge
            .get_client_init_response(client, user, options)
            .unwrap();
        let payload: serde_json::Value = serde_json::from_str(&owned).unwrap();

        let gate = hash_algorithm.hash("my_gate");
        let layer = hash_algorithm.hash("checkout_layer");
        assert_eq!(payload["hash_used"], json!(hash_algorithm.to_string()));
        assert_eq!(payload["feature_gates"][&gate]["value"], json!(true));
        assert_eq!(payload["layer_configs"][&layer]["name"], json!(layer));

        let required = bridge
            .get_client_init_response_into(client, user, options, &mut [])
            .unwrap();
        assert_eq!(required, owned.len());
    }
}
