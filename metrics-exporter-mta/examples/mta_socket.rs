use std::{thread, time::Duration};

use metrics::{counter, histogram};
use metrics_exporter_mta::{AccountRegistry, MtaRecorder};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use serde_json::json;

fn main() {
    tracing_subscriber::fmt::init();

    let registry = AccountRegistry::new();
    let client = registry
        .get_or_create(
            "www",
            [("sender", json!("socket")), ("server", json!({"host": "localhost", "port": 8125})), ("sampleRate", json!(100))],
        )
        .expect("failed to configure account");
    client.tag("server", "web01.example.com");

    MtaRecorder::new(registry.client("www")).install().expect("failed to install MTA recorder");

    let mut rng = Xoshiro256StarStar::try_from_rng(&mut rand::rng()).unwrap();

    // Pretend to serve requests, flushing once per request.
    loop {
        client.start("req");
        thread::sleep(Duration::from_millis(rng.random_range(1..20)));
        client.stop("req");

        client.increment("hits");
        counter!("responses", "code" => "200").increment(1);
        histogram!("render").record(rng.random_range(0.0..5.0));

        println!("{:?}", client.send());
        thread::sleep(Duration::from_millis(250));
    }
}
