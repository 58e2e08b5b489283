use std::collections::HashMap;

use tokio::time::Instant;

use crate::config::RequestPolicy;
use crate::errors::{Result, SessionError};
use crate::messages::OutboundMessage;
use crate::types::{AccountId, CorrelationId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Awaiting { deadline: Instant },
    Backoff { resend_at: Instant },
}

impl Phase {
    fn due_at(&self) -> Instant {
        match *self {
            Phase::Awaiting { deadline } => deadline,
            Phase::Backoff { resend_at } => resend_at,
        }
    }
}

#[derive(Debug)]
pub struct PendingRequest<S> {
    pub id: CorrelationId,
    pub account: Option<AccountId>,
    pub message: OutboundMessage,
    pub sent_at: Instant,
    pub attempts: u32,
    pub policy: RequestPolicy,
    pub phase: Phase,
    pub slot: S,
}

#[derive(Debug)]
pub enum CorrelatorAction<S> {
    /// Send `message` again under the same id.
    Resend {
        id: CorrelationId,
        message: OutboundMessage,
        attempt: u32,
    },
    /// Attempts exhausted; the slot is handed back for completion.
    Expired { id: CorrelationId, slot: S, error: SessionError },
}

/// Matches responses to outstanding requests by client message id.
///
/// `S` is whatever the owner needs to finish a request (a oneshot sender, an
/// internal continuation). Every slot leaves the correlator exactly once:
/// through `resolve`, `reject`, `poll` expiry or a cancel.
#[derive(Debug)]
pub struct RequestCorrelator<S> {
    pending: HashMap<CorrelationId, PendingRequest<S>>,
    next_id: u64,
}

impl<S> Default for RequestCorrelator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> RequestCorrelator<S> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Records a request that is about to be sent for the first time and
    /// returns its freshly allocated id.
    pub fn register(
        &mut self,
        message: OutboundMessage,
        policy: RequestPolicy,
        slot: S,
        now: Instant,
    ) -> Result<CorrelationId> {
        let id = CorrelationId::new(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        if self.pending.contains_key(&id) {
            return Err(SessionError::Protocol(format!(
                "correlation id {id} already pending"
            )));
        }
        let attempts_allowed = if message.is_trading() {
            1
        } else {
            policy.max_attempts.max(1)
        };
        let request = PendingRequest {
            id,
            account: message.account(),
            message,
            sent_at: now,
            attempts: 1,
            policy: RequestPolicy {
                max_attempts: attempts_allowed,
                ..policy
            },
            phase: Phase::Awaiting {
                deadline: now + policy.timeout,
            },
            slot,
        };
        self.pending.insert(id, request);
        Ok(id)
    }

    /// Completes a request with its response. Unknown ids (late or
    /// unsolicited) are dropped.
    pub fn resolve(&mut self, id: CorrelationId) -> Option<PendingRequest<S>> {
        let request = self.pending.remove(&id);
        if request.is_none() {
            tracing::debug!(correlation_id = %id, "dropping response for unknown request");
        }
        request
    }

    /// Completes a request with a broker rejection. Never retried.
    pub fn reject(
        &mut self,
        id: CorrelationId,
        code: &str,
        description: &str,
    ) -> Option<(PendingRequest<S>, SessionError)> {
        let request = self.resolve(id)?;
        tracing::warn!(
            correlation_id = %id,
            payload_type = request.message.payload_type(),
            code,
            description,
            "request_rejected"
        );
        let error = SessionError::rejected(code, description, Some(id));
        Some((request, error))
    }

    pub fn poll(&mut self, now: Instant) -> Vec<CorrelatorAction<S>> {
        let mut due: Vec<CorrelationId> = self
            .pending
            .values()
            .filter(|req| req.phase.due_at() <= now)
            .map(|req| req.id)
            .collect();
        due.sort();

        let mut actions = Vec::new();
        for id in due {
            let Some(request) = self.pending.get_mut(&id) else {
                continue;
            };
            if let Phase::Awaiting { .. } = request.phase {
                if request.attempts >= request.policy.max_attempts {
                    if let Some(request) = self.pending.remove(&id) {
                        tracing::warn!(
                            correlation_id = %id,
                            attempts = request.attempts,
                            payload_type = request.message.payload_type(),
                            "request_timed_out"
                        );
                        actions.push(CorrelatorAction::Expired {
                            id,
                            error: SessionError::Timeout {
                                correlation_id: id,
                                attempts: request.attempts,
                            },
                            slot: request.slot,
                        });
                    }
                    continue;
                }
                request.phase = Phase::Backoff {
                    resend_at: now + request.policy.backoff,
                };
            }
            if let Phase::Backoff { resend_at } = request.phase {
                if resend_at <= now {
                    request.attempts += 1;
                    request.sent_at = now;
                    request.phase = Phase::Awaiting {
                        deadline: now + request.policy.timeout,
                    };
                    tracing::info!(
                        correlation_id = %id,
                        attempt = request.attempts,
                        "request_resent"
                    );
                    actions.push(CorrelatorAction::Resend {
                        id,
                        message: request.message.clone(),
                        attempt: request.attempts,
                    });
                }
            }
        }
        actions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|req| req.phase.due_at()).min()
    }

    /// Removes every request acting on `account`.
    pub fn cancel_account(&mut self, account: AccountId) -> Vec<PendingRequest<S>> {
        let ids: Vec<CorrelationId> = self
            .pending
            .values()
            .filter(|req| req.account == Some(account))
            .map(|req| req.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    pub fn cancel_all(&mut self) -> Vec<PendingRequest<S>> {
        self.pending.drain().map(|(_, req)| req).collect()
    }
}
