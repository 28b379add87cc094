use std::io;

use metrics_exporter_mta::{
    tracker::{Tracker, TrackerConfig},
    AccountRegistry, Measurement,
};

fn main() {
    tracing_subscriber::fmt::init();

    let registry = AccountRegistry::new();
    let client = registry.client("www");
    client.tag("page", "/deals/today");

    client.timing("api", Measurement::group([("deal", 25), ("dynamic", 10)]));
    client.increment("hits");
    client.gauge("inflight", 3.0);

    let payload = client.send().into_beacon().expect("browser accounts flush into a beacon payload");
    println!("{}", serde_json::to_string_pretty(&payload).expect("failed to serialize payload"));

    // Play the page's part: run the commands through a tracker that prints each beacon URL.
    let transport = |url: &str| -> io::Result<()> {
        println!("GET {url}");
        Ok(())
    };
    let mut tracker = Tracker::new(TrackerConfig::default(), transport);
    for command in payload.into_commands() {
        tracker.apply(command);
    }

    let fired = tracker.flush();
    println!("fired {fired} beacon(s)");
}
