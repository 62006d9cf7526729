//! Admission gate: bounds concurrently served connections and queues the rest.
//!
//! At most `capacity` [`Permit`]s are outstanding at any time. Requests beyond
//! that wait in strict arrival order; a released slot is handed directly to
//! the oldest waiter, so a newcomer can never overtake the queue.
//!
//! State lives behind a `std::sync::Mutex` because releasing happens in
//! `Drop`, which cannot await.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use rchat_core::{ChatError, ChatResult};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug)]
struct GateState {
    capacity: usize,
    held: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    closed: bool,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

impl GateState {
    /// Give a freed slot to the oldest live waiter, or return it to the pool.
    fn release_slot(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.grant.send(()).is_ok() {
                debug!(waiter = waiter.id, "slot handed to queued connection");
                return;
            }
        }
        self.held = self.held.saturating_sub(1);
    }
}

/// Shared handle to the gate; clones refer to the same gate.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    state: Arc<Mutex<GateState>>,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState {
                capacity,
                held: 0,
                waiters: VecDeque::new(),
                next_waiter: 0,
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        lock_state(&self.state)
    }

    /// Ask for a slot without a queue limit.
    pub fn request(&self) -> Ticket {
        self.request_with_limit(None)
    }

    /// Ask for a slot. Granted immediately when one is free and nobody is
    /// waiting; otherwise joins the back of the queue, unless the queue
    /// already holds `max_queue` waiters.
    pub fn request_with_limit(&self, max_queue: Option<usize>) -> Ticket {
        let mut state = self.lock();
        let kind = if state.closed {
            TicketKind::Refused(Refusal::Closed)
        } else if state.held < state.capacity && state.waiters.is_empty() {
            state.held += 1;
            TicketKind::Granted
        } else if max_queue.is_some_and(|max| state.waiters.len() >= max) {
            TicketKind::Refused(Refusal::QueueFull)
        } else {
            let id = state.next_waiter;
            state.next_waiter += 1;
            let (grant, granted) = oneshot::channel();
            state.waiters.push_back(Waiter { id, grant });
            TicketKind::Queued { id, granted }
        };
        drop(state);

        Ticket {
            state: self.state.clone(),
            kind,
        }
    }

    /// Block until a slot is free. Fails once the gate is closed.
    pub async fn acquire(&self) -> ChatResult<Permit> {
        self.request().granted().await
    }

    /// Refuse new requests and fail every queued waiter.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let dropped = state.waiters.len();
        state.waiters.clear();
        debug!(dropped, "admission gate closed");
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Slots currently held.
    pub fn active_count(&self) -> usize {
        self.lock().held
    }

    /// Requests waiting for a slot.
    pub fn queue_length(&self) -> usize {
        self.lock().waiters.len()
    }
}

fn lock_state(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    // a panic while holding the lock cannot leave the counters half-updated
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    Closed,
    QueueFull,
}

#[derive(Debug)]
enum TicketKind {
    Granted,
    Queued {
        id: u64,
        granted: oneshot::Receiver<()>,
    },
    Refused(Refusal),
    Redeemed,
}

/// Outcome of [`AdmissionGate::request`], redeemed with [`Ticket::granted`].
///
/// Dropping a queued ticket leaves the queue; dropping one whose slot was
/// already handed over passes that slot on.
#[derive(Debug)]
pub struct Ticket {
    state: Arc<Mutex<GateState>>,
    kind: TicketKind,
}

impl Ticket {
    /// Whether the request had to wait behind a saturated gate.
    pub fn is_queued(&self) -> bool {
        matches!(self.kind, TicketKind::Queued { .. })
    }

    pub fn refusal(&self) -> Option<Refusal> {
        match self.kind {
            TicketKind::Refused(refusal) => Some(refusal),
            _ => None,
        }
    }

    /// Wait for the slot.
    pub async fn granted(mut self) -> ChatResult<Permit> {
        let outcome = match &mut self.kind {
            TicketKind::Granted => Ok(()),
            TicketKind::Queued { granted, .. } => granted
                .await
                .map_err(|_| ChatError::ServiceUnavailable("server is shutting down".into())),
            TicketKind::Refused(Refusal::Closed) | TicketKind::Redeemed => Err(
                ChatError::ServiceUnavailable("server is shutting down".into()),
            ),
            TicketKind::Refused(Refusal::QueueFull) => {
                Err(ChatError::ServerFull("admission queue is full".into()))
            }
        };
        if outcome.is_ok() {
            self.kind = TicketKind::Redeemed;
        }
        outcome.map(|()| Permit {
            state: self.state.clone(),
        })
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        match &mut self.kind {
            TicketKind::Granted => lock_state(&self.state).release_slot(),
            TicketKind::Queued { id, granted } => {
                let mut state = lock_state(&self.state);
                if let Some(pos) = state.waiters.iter().position(|w| w.id == *id) {
                    state.waiters.remove(pos);
                } else if granted.try_recv().is_ok() {
                    state.release_slot();
                }
            }
            TicketKind::Refused(_) | TicketKind::Redeemed => {}
        }
    }
}

/// One held slot. Released exactly once, when dropped.
#[derive(Debug)]
pub struct Permit {
    state: Arc<Mutex<GateState>>,
}

impl Permit {
    /// Give the slot back now.
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        lock_state(&self.state).release_slot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn grants_up_to_capacity_then_queues() {
        let gate = AdmissionGate::new(2);
        let a = gate.request();
        let b = gate.request();
        assert!(!a.is_queued());
        assert!(!b.is_queued());
        let _a = a.granted().await.unwrap();
        let _b = b.granted().await.unwrap();

        let c = gate.request();
        assert!(c.is_queued());
        assert_eq!(gate.active_count(), 2);
        assert_eq!(gate.queue_length(), 1);
        assert!(timeout(SHORT, c.granted()).await.is_err());
    }

    #[tokio::test]
    async fn release_hands_slot_to_oldest_waiter() {
        let gate = AdmissionGate::new(1);
        let first = gate.acquire().await.unwrap();

        let second = gate.request();
        let third = gate.request();
        assert!(second.is_queued() && third.is_queued());

        let order = Arc::new(Mutex::new(Vec::new()));
        let o3 = order.clone();
        let t3 = tokio::spawn(async move {
            let permit = third.granted().await.unwrap();
            o3.lock().unwrap().push(3);
            permit
        });
        let o2 = order.clone();
        let t2 = tokio::spawn(async move {
            let permit = second.granted().await.unwrap();
            o2.lock().unwrap().push(2);
            tokio::time::sleep(SHORT).await;
            permit.release();
        });

        first.release();
        t2.await.unwrap();
        let _p3 = t3.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![2, 3]);
        assert_eq!(gate.active_count(), 1);
        assert_eq!(gate.queue_length(), 0);
    }

    #[tokio::test]
    async fn newcomer_cannot_overtake_queue() {
        let gate = AdmissionGate::new(1);
        let first = gate.acquire().await.unwrap();
        let waiting = gate.request();
        assert!(waiting.is_queued());

        first.release();
        // the freed slot already belongs to the waiter
        let newcomer = gate.request();
        assert!(newcomer.is_queued());
        assert_eq!(gate.active_count(), 1);

        let _held = waiting.granted().await.unwrap();
        drop(newcomer);
        assert_eq!(gate.queue_length(), 0);
    }

    #[tokio::test]
    async fn dropped_permits_release_exactly_once() {
        let gate = AdmissionGate::new(3);
        let permits: Vec<Permit> = vec![
            gate.acquire().await.unwrap(),
            gate.acquire().await.unwrap(),
            gate.acquire().await.unwrap(),
        ];
        assert_eq!(gate.active_count(), 3);
        drop(permits);
        assert_eq!(gate.active_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_leaves_queue() {
        let gate = AdmissionGate::new(1);
        let held = gate.acquire().await.unwrap();

        let waiting = gate.request();
        assert_eq!(gate.queue_length(), 1);
        assert!(timeout(SHORT, waiting.granted()).await.is_err());
        assert_eq!(gate.queue_length(), 0);

        held.release();
        assert_eq!(gate.active_count(), 0);
    }

    #[tokio::test]
    async fn granted_but_unredeemed_ticket_passes_slot_on() {
        let gate = AdmissionGate::new(1);
        let held = gate.acquire().await.unwrap();
        let abandoned = gate.request();
        let next = gate.request();

        held.release();
        drop(abandoned);
        let _permit = timeout(SHORT, next.granted()).await.unwrap().unwrap();
        assert_eq!(gate.active_count(), 1);
    }

    #[tokio::test]
    async fn queue_limit_refuses_extra_requests() {
        let gate = AdmissionGate::new(1);
        let _held = gate.acquire().await.unwrap();
        let _queued = gate.request_with_limit(Some(1));
        let refused = gate.request_with_limit(Some(1));
        assert_eq!(refused.refusal(), Some(Refusal::QueueFull));
        assert!(matches!(
            refused.granted().await,
            Err(ChatError::ServerFull(_))
        ));
        assert_eq!(gate.queue_length(), 1);
    }

    #[tokio::test]
    async fn close_fails_waiters_and_new_requests() {
        let gate = AdmissionGate::new(1);
        let _held = gate.acquire().await.unwrap();
        let waiting = gate.request();
        let task = tokio::spawn(waiting.granted());

        tokio::time::sleep(SHORT).await;
        gate.close();
        assert!(matches!(
            task.await.unwrap(),
            Err(ChatError::ServiceUnavailable(_))
        ));
        assert_eq!(gate.request().refusal(), Some(Refusal::Closed));
        assert!(gate.acquire().await.is_err());
    }
}
