use std::time::Duration;

use evalbridge::{Bridge, ClientInitResponseOptions, HashAlgorithm, Options, UserFields};

pub fn main() -> evalbridge::Result<()> {
    // Configure env_logger to see evalbridge logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("evalbridge")).init();

    let sdk_key =
        std::env::var("EVALBRIDGE_SDK_KEY").expect("EVALBRIDGE_SDK_KEY env variable should contain SDK key");
    let mut options = Options::new();
    if let Ok(specs_url) = std::env::var("EVALBRIDGE_SPECS_URL") {
        options = options.with_specs_url(specs_url)?;
    }

    let bridge = Bridge::new();
    let options = bridge.register_options(options)?;
    let client = bridge.create_client(&sdk_key, options)?;
    // The client copied the options; the handle is no longer needed.
    bridge.release_options(options)?;

    // Block waiting for specs. Until initialization completes, every gate evaluates to false.
    let init = bridge.initialize_with_callback(client, |result| {
        println!("initialization completed: {result:?}");
    })?;
    if let Err(err) = init.wait_timeout(Duration::from_secs(5)) {
        println!("error requesting specs: {err:?}");
    }

    let user = bridge.create_user(UserFields {
        user_id: Some("test-user"),
        custom_ids_json: Some(r#"{"companyID": "acme"}"#),
        ..UserFields::default()
    })?;

    println!(
        "Gate a_gate: {}",
        bridge.check_gate(client, user, "a_gate")
    );
    println!(
        "Experiment an_experiment: {}",
        serde_json::to_string(&bridge.get_experiment(client, user, "an_experiment")?)
            .unwrap_or_default()
    );

    // Ask for the payload size first, then copy it into a buffer of exactly that size.
    let options = ClientInitResponseOptions {
        hash_algorithm: HashAlgorithm::Djb2,
    };
    let required = bridge.get_client_init_response_into(client, user, options, &mut [])?;
    let mut buffer = vec![0; required];
    bridge.get_client_init_response_into(client, user, options, &mut buffer)?;
    println!("Client init response: {}", String::from_utf8_lossy(&buffer));

    bridge.release_user(user)?;
    bridge.release_client(client)?;

    Ok(())
}
