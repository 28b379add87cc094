//! Account-scoped metrics buffering, with dispatch to a statsd server or to an in-page beacon tracker.
//!
//! # Usage
//!
//! Metrics are recorded against an account: a namespace, such as a service or product name, under which every metric
//! key is prefixed. Accounts are handed out by an [`AccountRegistry`], which the application creates once and shares
//! with the code that records metrics:
//!
//! ```no_run
//! # use metrics_exporter_mta::AccountRegistry;
//! use serde_json::Value;
//!
//! let registry = AccountRegistry::new();
//!
//! // The first lookup creates the account, applying the given configuration on top of the defaults. Later lookups
//! // return the same client and ignore the configuration.
//! let client = registry
//!     .get_or_create("www", [("sender", Value::from("socket")), ("sampleRate", Value::from(10))])
//!     .expect("invalid configuration");
//!
//! // Tags are appended to every key of the account.
//! client.tag("server", "web01.example.com");
//!
//! // Record metrics while handling a request.
//! client.start("framework.dispatch");
//! client.increment("hits");
//! client.stop("framework.dispatch");
//! client.gauge("inflight", 3.0);
//!
//! // Flush at the end of the request. This sends `www.framework.dispatch._t_server.web01-example-com:N|ms`, and so
//! // on, for one request in ten.
//! client.send();
//! ```
//!
//! # Transports
//!
//! ## Metric senders
//!
//! Accounts configured with the `socket`, `syslog` or `echo` sender flush on the server. Each flush cycle is sampled
//! as a whole: one draw against the sample rate decides whether all of the cycle's metrics are sent or discarded.
//! Metrics are packed into newline-delimited statsd payloads and sent as UDP datagrams, syslog messages, or lines on
//! standard output.
//!
//! Delivery is at-most-once. Send failures are logged and the metrics are dropped; the buffer is cleared after every
//! flush regardless.
//!
//! ## Browser
//!
//! Accounts configured with the `browser` sender, the default, flush into a [`BeaconPayload`]: a list of [`Command`]s
//! for the page to hand to the beacon tracker, along with the script to load and, on the first flush, the page
//! bootstrap. A Rust rendition of the tracker is provided as [`tracker::Tracker`], which batches events into combo
//! beacons and applies per-visitor sampling.
//!
//! # The `metrics` facade
//!
//! [`MtaRecorder`] implements [`metrics::Recorder`], so code instrumented with the `metrics` macros can record into an
//! account.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod buffer;
pub use self::buffer::{MetricBuffer, MetricKind};

mod client;
pub use self::client::Client;

mod config;
pub use self::config::{ConfigError, Configuration, SenderKind, ServerAddr};

mod dispatch;
pub use self::dispatch::{
    BeaconPayload, Command, CommandError, FlushOutcome, InitBlock, MAX_EXPANDED_COUNT, SERVER_CATEGORY, TRACKER_GLOBAL,
};

mod key;
pub use self::key::{build_key, sanitize_tag_value, KeyBuilder, TagBlock, Tags};

mod measurement;
pub use self::measurement::Measurement;

mod recorder;
pub use self::recorder::{InstallError, MtaRecorder};

mod registry;
pub use self::registry::{AccountRegistry, FlushGuard, ANONYMOUS_ACCOUNT};

mod sampler;
pub use self::sampler::should_send;

pub mod sender;
pub use self::sender::{MetricSender, SenderFactory};

mod statsd;
pub use self::statsd::{MetricType, MetricValue, StatsdMetric};

mod timer;
pub use self::timer::TimerRegistry;

pub mod tracker;
