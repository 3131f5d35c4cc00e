use crate::icmp::Outcome;
use rand::Rng;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// One in-flight echo request.
#[derive(Debug)]
pub struct PendingRequest {
    pub identifier: u16,
    pub sequence: u16,
    /// Distinguishes this request from earlier ones that used the same identifier.
    pub ticket: u64,
    pub sent_at: Instant,
    notifier: oneshot::Sender<Outcome>,
    deadline: AbortHandle,
}

impl PendingRequest {
    pub fn new(
        identifier: u16,
        sequence: u16,
        ticket: u64,
        notifier: oneshot::Sender<Outcome>,
        deadline: AbortHandle,
    ) -> Self {
        Self {
            identifier,
            sequence,
            ticket,
            sent_at: Instant::now(),
            notifier,
            deadline,
        }
    }

    /// Cancels the deadline timer and hands `outcome` to the waiting caller.
    /// Consumes the request, so it can only ever happen once.
    pub fn resolve(self, outcome: Outcome) {
        self.deadline.abort();
        if self.notifier.send(outcome).is_err() {
            log::debug!("Caller for identifier {} is no longer waiting", self.identifier);
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.sent_at.elapsed().as_secs_f64() * 1000.0
    }
}

/// Live requests keyed by ICMP identifier.
///
/// Whoever removes an entry through [`Registry::claim`] owns its resolution;
/// a second claim for the same identifier finds nothing and does nothing.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<u16, PendingRequest>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws random identifiers until one is not live. `None` once all 65536
    /// are taken.
    pub fn allocate_identifier<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<u16> {
        if self.entries.len() > u16::MAX as usize {
            return None;
        }

        loop {
            let candidate: u16 = rng.r#gen();
            if !self.entries.contains_key(&candidate) {
                return Some(candidate);
            }
        }
    }

    pub fn insert(&mut self, request: PendingRequest) {
        let previous = self.entries.insert(request.identifier, request);
        debug_assert!(previous.is_none(), "identifier handed out twice");
    }

    pub fn claim(&mut self, identifier: u16) -> Option<PendingRequest> {
        self.entries.remove(&identifier)
    }

    /// Claims `identifier` only while it still belongs to the request that
    /// was issued `ticket`. An expiry queued just before its request resolved
    /// must not hit a newer request that reused the identifier.
    pub fn claim_ticket(&mut self, identifier: u16, ticket: u64) -> Option<PendingRequest> {
        match self.entries.get(&identifier) {
            Some(request) if request.ticket == ticket => self.entries.remove(&identifier),
            _ => None,
        }
    }

    pub fn get(&self, identifier: u16) -> Option<&PendingRequest> {
        self.entries.get(&identifier)
    }

    pub fn contains(&self, identifier: u16) -> bool {
        self.entries.contains_key(&identifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry, leaving resolution to the caller.
    pub fn drain(&mut self) -> impl Iterator<Item = PendingRequest> + '_ {
        self.entries.drain().map(|(_, request)| request)
    }
}
