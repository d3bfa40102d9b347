//! Acknowledgment ledger.
//!
//! Records every mutating command a client sent while acknowledgment was
//! negotiated, so a retried command is answered from the stored response
//! instead of being applied twice, and a reconnecting client can ask whether
//! a request went through.
//!
//! Accounts are keyed by client id; entries inside an account are keyed by
//! `(request_id, command_id)` and ordered so acknowledged prefixes can be
//! dropped in one split.
//!
//! A client that leaves gracefully loses its account at once. One that
//! drops off abruptly keeps it for a retention window so it can reconnect
//! and ask for the status of its last requests.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Execution status of a ledgered command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// No entry for this triple.
    NotReceived,
    /// Registered, execution not finished.
    Received,
    ReceivedAndExecuted,
    ReceivedWithError,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::NotReceived => "NOT_RECEIVED",
            RequestStatus::Received => "RECEIVED",
            RequestStatus::ReceivedAndExecuted => "RECEIVED_AND_EXECUTED",
            RequestStatus::ReceivedWithError => "RECEIVED_WITH_ERROR",
        }
    }

    fn is_final(self) -> bool {
        matches!(
            self,
            RequestStatus::ReceivedAndExecuted | RequestStatus::ReceivedWithError
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    status: RequestStatus,
    /// Serialized response, kept for replay.
    response: Option<Bytes>,
    received_at: DateTime<Utc>,
}

/// Outcome of registering a mutating command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// First sighting; the command should execute.
    New,
    /// A previous copy is still executing.
    InFlight,
    /// A previous copy finished; replay its response instead of executing.
    Completed {
        status: RequestStatus,
        response: Option<Bytes>,
    },
}

type RequestKey = (i64, i64);

/// Process-wide ledger shared by every connection.
#[derive(Default)]
pub struct Ledger {
    accounts: DashMap<String, BTreeMap<RequestKey, LedgerEntry>>,
    /// Clients that dropped off without a graceful disconnect.
    orphaned: DashMap<String, Instant>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mutating command before it executes.
    ///
    /// An `ack_id >= 0` first drops every entry of this client whose request
    /// id is at or below it.
    pub fn register(
        &self,
        client_id: &str,
        request_id: i64,
        command_id: i64,
        ack_id: Option<i64>,
    ) -> Registration {
        let mut account = self.accounts.entry(client_id.to_string()).or_default();
        if let Some(ack_id) = ack_id {
            prune(client_id, &mut account, ack_id);
        }

        let key = (request_id, command_id);
        if let Some(entry) = account.get(&key) {
            return if entry.status.is_final() {
                Registration::Completed {
                    status: entry.status,
                    response: entry.response.clone(),
                }
            } else {
                Registration::InFlight
            };
        }

        account.insert(
            key,
            LedgerEntry {
                status: RequestStatus::Received,
                response: None,
                received_at: Utc::now(),
            },
        );
        Registration::New
    }

    /// Apply an acknowledgment carried by a command that is not ledgered
    /// itself. Never creates an account.
    pub fn acknowledge(&self, client_id: &str, ack_id: i64) {
        if let Some(mut account) = self.accounts.get_mut(client_id) {
            prune(client_id, &mut account, ack_id);
        }
    }

    /// Record the outcome of a registered command.
    ///
    /// Only `Received` entries move; a finished entry is never rewritten.
    pub fn complete(
        &self,
        client_id: &str,
        request_id: i64,
        command_id: i64,
        status: RequestStatus,
        response: Option<Bytes>,
    ) {
        debug_assert!(status.is_final());
        let Some(mut account) = self.accounts.get_mut(client_id) else {
            return;
        };
        if let Some(entry) = account.get_mut(&(request_id, command_id)) {
            if entry.status == RequestStatus::Received {
                entry.status = status;
                entry.response = response;
                trace!(
                    client_id,
                    request_id,
                    command_id,
                    %status,
                    elapsed_ms = (Utc::now() - entry.received_at).num_milliseconds(),
                    "Ledger entry completed"
                );
            }
        }
    }

    /// Status of `(client_id, request_id, command_id)`.
    pub fn request_status(&self, client_id: &str, request_id: i64, command_id: i64) -> RequestStatus {
        self.accounts
            .get(client_id)
            .and_then(|account| account.get(&(request_id, command_id)).map(|e| e.status))
            .unwrap_or(RequestStatus::NotReceived)
    }

    /// Drop everything recorded for a client.
    pub fn remove_client_account(&self, client_id: &str) {
        self.orphaned.remove(client_id);
        if let Some((_, account)) = self.accounts.remove(client_id) {
            debug!(client_id, entries = account.len(), "Removed ledger account");
        }
    }

    /// The client bound a connection again.
    pub fn client_connected(&self, client_id: &str) {
        self.orphaned.remove(client_id);
    }

    /// The client's connection went away without a graceful disconnect.
    pub fn client_disconnected(&self, client_id: &str) {
        if self.accounts.contains_key(client_id) {
            self.orphaned.insert(client_id.to_string(), Instant::now());
        }
    }

    /// Drop accounts with no entries and accounts of clients that stayed
    /// disconnected longer than `retention`. Returns how many were dropped.
    pub fn cleanup(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.orphaned.retain(|client_id, since| {
            let keep = now.saturating_duration_since(*since) < retention;
            if !keep {
                expired.push(client_id.clone());
            }
            keep
        });
        for client_id in &expired {
            self.accounts.remove(client_id);
        }

        let before = self.accounts.len();
        self.accounts.retain(|_, account| !account.is_empty());
        let dropped = expired.len() + before.saturating_sub(self.accounts.len());
        if dropped > 0 {
            debug!(dropped, orphaned = expired.len(), "Ledger cleanup");
        }
        dropped
    }

    /// Number of client accounts.
    pub fn client_count(&self) -> usize {
        self.accounts.len()
    }

    /// Number of entries recorded for a client.
    pub fn entry_count(&self, client_id: &str) -> usize {
        self.accounts.get(client_id).map_or(0, |a| a.len())
    }
}

/// Drop entries whose request id is at or below a non-negative `ack_id`.
fn prune(client_id: &str, account: &mut BTreeMap<RequestKey, LedgerEntry>, ack_id: i64) {
    if ack_id < 0 || account.is_empty() {
        return;
    }
    let before = account.len();
    *account = match ack_id.checked_add(1) {
        Some(first_kept) => account.split_off(&(first_kept, i64::MIN)),
        None => BTreeMap::new(),
    };
    let pruned = before - account.len();
    if pruned > 0 {
        trace!(client_id, ack_id, pruned, "Pruned acknowledged ledger entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_unknown_triple_not_received() {
        let ledger = Ledger::new();
        assert_eq!(ledger.request_status("c1", 1, 0), RequestStatus::NotReceived);
        ledger.register("c1", 1, 0, None);
        assert_eq!(ledger.request_status("c1", 1, 1), RequestStatus::NotReceived);
        assert_eq!(ledger.request_status("c2", 1, 0), RequestStatus::NotReceived);
    }

    #[test]
    fn test_register_then_complete() {
        let ledger = Ledger::new();
        assert_eq!(ledger.register("c1", 5, 0, None), Registration::New);
        assert_eq!(ledger.request_status("c1", 5, 0), RequestStatus::Received);
        assert_eq!(ledger.register("c1", 5, 0, None), Registration::InFlight);

        let stored = Bytes::from_static(b"6         0         STORED");
        ledger.complete(
            "c1",
            5,
            0,
            RequestStatus::ReceivedAndExecuted,
            Some(stored.clone()),
        );
        assert_eq!(
            ledger.request_status("c1", 5, 0),
            RequestStatus::ReceivedAndExecuted
        );
        assert_eq!(
            ledger.register("c1", 5, 0, None),
            Registration::Completed {
                status: RequestStatus::ReceivedAndExecuted,
                response: Some(stored),
            }
        );
    }

    #[test]
    fn test_status_is_monotonic() {
        let ledger = Ledger::new();
        ledger.register("c1", 1, 0, None);
        ledger.complete("c1", 1, 0, RequestStatus::ReceivedWithError, None);
        ledger.complete("c1", 1, 0, RequestStatus::ReceivedAndExecuted, None);
        assert_eq!(
            ledger.request_status("c1", 1, 0),
            RequestStatus::ReceivedWithError
        );
    }

    #[test]
    fn test_ack_prunes_delivered_entries() {
        let ledger = Ledger::new();
        for rid in 1..=5 {
            ledger.register("c1", rid, 0, None);
            ledger.register("c1", rid, 1, None);
        }
        assert_eq!(ledger.entry_count("c1"), 10);

        // Acknowledging request 3 drops requests 1-3, then registers 6.
        ledger.register("c1", 6, 0, Some(3));
        assert_eq!(ledger.entry_count("c1"), 5);
        assert_eq!(ledger.request_status("c1", 3, 1), RequestStatus::NotReceived);
        assert_eq!(ledger.request_status("c1", 4, 0), RequestStatus::Received);

        // -1 means nothing acknowledged.
        ledger.register("c1", 7, 0, Some(-1));
        assert_eq!(ledger.entry_count("c1"), 6);

        ledger.register("c1", 8, 0, Some(i64::MAX));
        assert_eq!(ledger.entry_count("c1"), 1);
    }

    #[test]
    fn test_remove_and_cleanup() {
        let ledger = Ledger::new();
        ledger.register("c1", 1, 0, None);
        ledger.register("c2", 1, 0, None);
        ledger.register("c2", 2, 0, Some(1));
        ledger.register("c3", 1, 0, Some(5));

        ledger.remove_client_account("c1");
        assert_eq!(ledger.request_status("c1", 1, 0), RequestStatus::NotReceived);
        assert_eq!(ledger.client_count(), 2);

        assert_eq!(ledger.cleanup(Duration::from_secs(60)), 0);

        // A read-only command acknowledging everything empties the account.
        ledger.acknowledge("c3", 1);
        assert_eq!(ledger.entry_count("c3"), 0);
        ledger.acknowledge("c4", 1);
        assert_eq!(ledger.client_count(), 2);

        assert_eq!(ledger.cleanup(Duration::from_secs(60)), 1);
        assert_eq!(ledger.client_count(), 1);
    }

    #[test]
    fn test_abrupt_disconnect_retains_account() {
        let ledger = Ledger::new();
        ledger.register("c1", 1, 0, None);
        ledger.complete("c1", 1, 0, RequestStatus::ReceivedAndExecuted, None);
        ledger.register("c2", 1, 0, None);

        ledger.client_disconnected("c1");
        ledger.client_disconnected("c2");
        assert_eq!(ledger.cleanup(Duration::from_secs(60)), 0);
        assert_eq!(
            ledger.request_status("c1", 1, 0),
            RequestStatus::ReceivedAndExecuted
        );

        // c1 came back; c2 did not.
        ledger.client_connected("c1");
        assert_eq!(ledger.cleanup(Duration::ZERO), 1);
        assert_eq!(
            ledger.request_status("c1", 1, 0),
            RequestStatus::ReceivedAndExecuted
        );
        assert_eq!(ledger.request_status("c2", 1, 0), RequestStatus::NotReceived);
    }

    #[test]
    fn test_concurrent_clients() {
        let ledger = Arc::new(Ledger::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    let client = format!("client-{t}");
                    for rid in 0..500 {
                        assert_eq!(ledger.register(&client, rid, 0, None), Registration::New);
                        ledger.complete(&client, rid, 0, RequestStatus::ReceivedAndExecuted, None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.client_count(), 8);
        assert_eq!(ledger.entry_count("client-3"), 500);
    }
}
