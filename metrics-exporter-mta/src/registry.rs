use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use parking_lot::RwLock;
use quanta::Clock;
use serde_json::Value;
use tracing::debug;

use crate::{
    client::Client,
    config::{ConfigError, Configuration},
    dispatch::FlushOutcome,
    sender::{DefaultSenderFactory, SenderFactory},
};

/// Name of the implicit account every registry owns.
pub const ANONYMOUS_ACCOUNT: &str = "anonymous";

/// Registry of account clients.
///
/// The registry hands out one [`Client`] per account name, created on first lookup and kept for the lifetime of the
/// registry. Applications construct a registry at startup and pass it, by reference or in an `Arc`, to the code that
/// records metrics.
///
/// ## Anonymous account
///
/// Every registry owns an implicit account, [`ANONYMOUS_ACCOUNT`], for code that records timings without knowing
/// which account it is working for, such as shared libraries. Its timer records are merged into whichever named
/// account flushes next, and the anonymous account is then cleared.
pub struct AccountRegistry {
    accounts: RwLock<IndexMap<String, Client>>,
    anonymous: Client,
    clock: Clock,
    sender_factory: Arc<dyn SenderFactory>,
}

impl AccountRegistry {
    /// Creates an empty registry whose clients send through [`DefaultSenderFactory`].
    pub fn new() -> Self {
        AccountRegistry::with_sender_factory(DefaultSenderFactory)
    }

    /// Creates an empty registry whose clients build their metric senders with `sender_factory`.
    pub fn with_sender_factory<F>(sender_factory: F) -> Self
    where
        F: SenderFactory + 'static,
    {
        AccountRegistry::with_parts(Clock::new(), sender_factory)
    }

    /// Creates an empty registry with an explicit clock for timers and a sender factory.
    ///
    /// This is mostly useful in tests, where [`Clock::mock`] controls the elapsed time seen by timers.
    pub fn with_parts<F>(clock: Clock, sender_factory: F) -> Self
    where
        F: SenderFactory + 'static,
    {
        let sender_factory: Arc<dyn SenderFactory> = Arc::new(sender_factory);
        let anonymous = Client::new(
            ANONYMOUS_ACCOUNT.to_owned(),
            Configuration::default(),
            clock.clone(),
            None,
            Arc::clone(&sender_factory),
        );

        AccountRegistry { accounts: RwLock::new(IndexMap::new()), anonymous, clock, sender_factory }
    }

    /// Returns the anonymous account.
    pub fn anonymous(&self) -> &Client {
        &self.anonymous
    }

    /// Gets the client for `account`, creating it with the default configuration if necessary.
    pub fn client(&self, account: &str) -> Client {
        if account == ANONYMOUS_ACCOUNT {
            return self.anonymous.clone();
        }

        if let Some(client) = self.accounts.read().get(account) {
            return client.clone();
        }

        self.insert(account, Configuration::default())
    }

    /// Gets the client for `account`, creating it if necessary.
    ///
    /// When the client is created, `overrides` are applied in order on top of the default configuration, using the
    /// same keys as [`Client::config`]. When the client already exists, `overrides` are ignored and the existing
    /// client is returned.
    ///
    /// The anonymous account exists from the start, so looking up [`ANONYMOUS_ACCOUNT`] always ignores `overrides`.
    /// Configure it with [`Client::config`] on [`AccountRegistry::anonymous`] instead.
    ///
    /// # Errors
    ///
    /// If an override is invalid, an error is returned and no client is registered.
    pub fn get_or_create<I, K, V>(&self, account: &str, overrides: I) -> Result<Client, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        if account == ANONYMOUS_ACCOUNT {
            return Ok(self.anonymous.clone());
        }

        if let Some(client) = self.accounts.read().get(account) {
            return Ok(client.clone());
        }

        let mut config = Configuration::default();
        for (key, value) in overrides {
            config.set(key.as_ref(), value.into())?;
        }

        Ok(self.insert(account, config))
    }

    /// Gets the client for `account`, if it exists.
    pub fn get(&self, account: &str) -> Option<Client> {
        if account == ANONYMOUS_ACCOUNT {
            return Some(self.anonymous.clone());
        }

        self.accounts.read().get(account).cloned()
    }

    /// Returns the names of all named accounts, in creation order.
    pub fn accounts(&self) -> Vec<String> {
        self.accounts.read().keys().cloned().collect()
    }

    /// Returns the number of named accounts.
    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    /// Returns `true` if no named account has been created.
    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }

    /// Flushes every account.
    ///
    /// Named accounts are flushed in creation order, and the anonymous account last.
    pub fn flush_all(&self) -> Vec<(String, FlushOutcome)> {
        // Flushing can block on I/O, so the account list is copied rather than holding the lock throughout.
        let clients: Vec<Client> = self.accounts.read().values().cloned().collect();

        let mut outcomes = Vec::with_capacity(clients.len() + 1);
        for client in clients.iter().chain(std::iter::once(&self.anonymous)) {
            outcomes.push((client.account().to_owned(), client.send()));
        }

        debug!(accounts = outcomes.len(), "Flushed all accounts.");
        outcomes
    }

    /// Returns a guard that flushes every account when dropped.
    ///
    /// Holding the guard for the lifetime of a request, or of the process, gives a best-effort final flush even when
    /// the code that records metrics returns early.
    pub fn flush_on_drop(&self) -> FlushGuard<'_> {
        FlushGuard { registry: self }
    }

    fn insert(&self, account: &str, config: Configuration) -> Client {
        let mut accounts = self.accounts.write();

        // Another thread may have created the account since the read lock was released.
        accounts
            .entry(account.to_owned())
            .or_insert_with(|| {
                debug!(account, sender = %config.sender(), "Created account client.");
                Client::new(
                    account.to_owned(),
                    config,
                    self.clock.clone(),
                    Some(self.anonymous.clone()),
                    Arc::clone(&self.sender_factory),
                )
            })
            .clone()
    }
}

impl Default for AccountRegistry {
    fn default() -> Self {
        AccountRegistry::new()
    }
}

impl fmt::Debug for AccountRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountRegistry").field("accounts", &self.accounts()).finish_non_exhaustive()
    }
}

/// Flushes every account of a registry when dropped.
///
/// Created by [`AccountRegistry::flush_on_drop`].
#[must_use = "the registry is flushed when the guard is dropped"]
pub struct FlushGuard<'a> {
    registry: &'a AccountRegistry,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.registry.flush_all();
    }
}
