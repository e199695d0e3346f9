use crate::clock::Clock;
use crate::error::{QuotaError, Result};
use crate::usage::UsageRateTracker;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Request waiting for budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest<P> {
    pub ticket_id: Uuid,
    pub tenant_id: String,
    pub member_id: String,
    pub estimated_tokens: u64,
    pub payload: P,
    pub enqueued_at: DateTime<Utc>,
}

/// Overflow queue limits
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub max_age: Duration,
    pub max_depth: usize,
    /// Wait per request ahead when no drain rate is known
    pub fallback_wait_per_request: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_age: Duration::hours(1),
            max_depth: 1000,
            fallback_wait_per_request: Duration::seconds(30),
        }
    }
}

type TenantQueue<P> = Arc<Mutex<VecDeque<QueuedRequest<P>>>>;

/// Per-tenant FIFO of requests denied for lack of budget
///
/// Requests older than `max_age` are dropped and their tickets report
/// `TicketExpired`.
pub struct OverflowQueue<P> {
    queues: RwLock<HashMap<String, TenantQueue<P>>>,
    /// ticket → tenant
    tickets: RwLock<HashMap<Uuid, String>>,
    rates: Arc<UsageRateTracker>,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
}

impl<P: Clone + Send> OverflowQueue<P> {
    pub fn new(rates: Arc<UsageRateTracker>, clock: Arc<dyn Clock>, settings: QueueSettings) -> Self {
        OverflowQueue {
            queues: RwLock::new(HashMap::new()),
            tickets: RwLock::new(HashMap::new()),
            rates,
            clock,
            settings,
        }
    }

    async fn tenant_queue(&self, tenant_id: &str) -> Option<TenantQueue<P>> {
        self.queues.read().await.get(tenant_id).cloned()
    }

    async fn ticket_tenant(&self, ticket_id: Uuid) -> Result<String> {
        self.tickets
            .read()
            .await
            .get(&ticket_id)
            .cloned()
            .ok_or(QuotaError::TicketNotFound(ticket_id))
    }

    fn is_stale(&self, request: &QueuedRequest<P>, now: DateTime<Utc>) -> bool {
        now - request.enqueued_at >= self.settings.max_age
    }

    /// Append a request to its tenant's queue and return its ticket
    pub async fn enqueue(
        &self,
        tenant_id: &str,
        member_id: &str,
        estimated_tokens: u64,
        payload: P,
    ) -> Result<Uuid> {
        let now = self.clock.now();
        let queue = {
            let mut queues = self.queues.write().await;
            Arc::clone(queues.entry(tenant_id.to_string()).or_default())
        };

        let ticket_id = Uuid::new_v4();
        let position = {
            let mut queue = queue.lock().await;
            let expired = self.drop_stale_front(&mut queue, now);
            self.forget_tickets(&expired).await;

            if queue.len() >= self.settings.max_depth {
                return Err(QuotaError::QueueFull(tenant_id.to_string()));
            }
            queue.push_back(QueuedRequest {
                ticket_id,
                tenant_id: tenant_id.to_string(),
                member_id: member_id.to_string(),
                estimated_tokens,
                payload,
                enqueued_at: now,
            });
            self.tickets
                .write()
                .await
                .insert(ticket_id, tenant_id.to_string());
            queue.len() - 1
        };

        info!(
            "Queued request {} for {}/{} at position {}",
            ticket_id, tenant_id, member_id, position
        );
        Ok(ticket_id)
    }

    /// Zero-based position of a ticket (0 = next to be served)
    pub async fn position(&self, ticket_id: Uuid) -> Result<usize> {
        self.locate(ticket_id).await.map(|(position, _)| position)
    }

    /// Position and tokens queued up to and including the ticket
    async fn locate(&self, ticket_id: Uuid) -> Result<(usize, u64)> {
        let tenant_id = self.ticket_tenant(ticket_id).await?;
        let queue = self
            .tenant_queue(&tenant_id)
            .await
            .ok_or(QuotaError::TicketNotFound(ticket_id))?;
        let now = self.clock.now();
        let queue = queue.lock().await;

        let mut tokens = 0u64;
        for (position, request) in queue.iter().enumerate() {
            tokens = tokens.saturating_add(request.estimated_tokens);
            if request.ticket_id == ticket_id {
                if self.is_stale(request, now) {
                    return Err(QuotaError::TicketExpired(ticket_id));
                }
                return Ok((position, tokens));
            }
        }
        Err(QuotaError::TicketNotFound(ticket_id))
    }

    /// Expected wait until the ticket can be admitted
    ///
    /// Uses the tenant's observed drain rate when there is one, otherwise
    /// a fixed wait per request ahead of the ticket. Never exceeds
    /// `max_age`, after which the ticket is dropped anyway.
    pub async fn estimate_wait(&self, ticket_id: Uuid) -> Result<std::time::Duration> {
        let (position, tokens_through) = self.locate(ticket_id).await?;
        let tenant_id = self.ticket_tenant(ticket_id).await?;
        let rate = self
            .rates
            .tokens_per_minute(&tenant_id, self.clock.now())
            .await;
        let cap = self.settings.max_age.to_std().unwrap_or_default();

        if rate > 0.0 {
            let seconds = tokens_through as f64 / rate * 60.0;
            return Ok(std::time::Duration::try_from_secs_f64(seconds)
                .map_or(cap, |wait| wait.min(cap)));
        }

        let per_request = self
            .settings
            .fallback_wait_per_request
            .to_std()
            .unwrap_or_default();
        let ahead = u32::try_from(position).unwrap_or(u32::MAX);
        Ok(per_request.checked_mul(ahead).map_or(cap, |wait| wait.min(cap)))
    }

    /// Head of a tenant's queue without removing it
    pub async fn front(&self, tenant_id: &str) -> Option<QueuedRequest<P>> {
        let queue = self.tenant_queue(tenant_id).await?;
        let now = self.clock.now();
        let mut queue = queue.lock().await;
        let expired = self.drop_stale_front(&mut queue, now);
        self.forget_tickets(&expired).await;
        queue.front().cloned()
    }

    /// Remove and return the head of a tenant's queue
    pub async fn dequeue(&self, tenant_id: &str) -> Option<QueuedRequest<P>> {
        let queue = self.tenant_queue(tenant_id).await?;
        let now = self.clock.now();
        let mut queue = queue.lock().await;
        let mut expired = self.drop_stale_front(&mut queue, now);
        let next = queue.pop_front();
        if let Some(request) = &next {
            expired.push(request.ticket_id);
        }
        self.forget_tickets(&expired).await;
        next
    }

    /// Take a specific ticket out of its queue
    pub async fn remove(&self, ticket_id: Uuid) -> Option<QueuedRequest<P>> {
        let tenant_id = self.ticket_tenant(ticket_id).await.ok()?;
        let queue = self.tenant_queue(&tenant_id).await?;
        let removed = {
            let mut queue = queue.lock().await;
            let index = queue.iter().position(|r| r.ticket_id == ticket_id)?;
            queue.remove(index)
        };
        self.tickets.write().await.remove(&ticket_id);
        removed
    }

    /// Queued requests of a tenant, stale ones included until purged
    pub async fn len(&self, tenant_id: &str) -> usize {
        match self.tenant_queue(tenant_id).await {
            Some(queue) => queue.lock().await.len(),
            None => 0,
        }
    }

    pub async fn is_empty(&self, tenant_id: &str) -> bool {
        self.len(tenant_id).await == 0
    }

    /// Drop every request older than `max_age` across all tenants
    pub async fn purge_expired(&self) -> Vec<QueuedRequest<P>> {
        let now = self.clock.now();
        let queues: Vec<_> = self.queues.read().await.values().cloned().collect();
        let mut purged = Vec::new();

        for queue in queues {
            let mut queue = queue.lock().await;
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|r| self.is_stale(r, now));
            *queue = fresh;
            purged.extend(stale);
        }

        let ids: Vec<_> = purged.iter().map(|r| r.ticket_id).collect();
        self.forget_tickets(&ids).await;
        for request in &purged {
            info!(
                "Queued request {} for {}/{} timed out; denied",
                request.ticket_id, request.tenant_id, request.member_id
            );
        }
        purged
    }

    /// Pop stale requests off the front; returns their tickets
    fn drop_stale_front(&self, queue: &mut VecDeque<QueuedRequest<P>>, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut expired = Vec::new();
        while queue.front().is_some_and(|r| self.is_stale(r, now)) {
            if let Some(request) = queue.pop_front() {
                debug!("Dropping timed-out queued request {}", request.ticket_id);
                expired.push(request.ticket_id);
            }
        }
        expired
    }

    async fn forget_tickets(&self, ticket_ids: &[Uuid]) {
        if ticket_ids.is_empty() {
            return;
        }
        let mut tickets = self.tickets.write().await;
        for id in ticket_ids {
            tickets.remove(id);
        }
    }
}
