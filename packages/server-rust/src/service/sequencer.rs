//! Per-id ticket lanes.
//!
//! Every request takes a ticket from the lane of its id in arrival order.
//! A dispatch task may only touch the registry or its node while its ticket
//! is the lane's current one, which gives strict FIFO per id while tasks for
//! different ids run freely. Waiters subscribe to their lane with
//! [`Sequencer::wait_turn`] instead of polling.

use std::collections::BTreeSet;
use std::future::Future;

use dashmap::DashMap;
use tokio::sync::watch;

/// Position of one request in its id's lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    id: String,
    seq: u64,
}

impl Ticket {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Debug)]
struct Lane {
    next: u64,
    serving: u64,
    /// Tickets finished out of turn (abandoned while waiting).
    skipped: BTreeSet<u64>,
    /// Mirrors `serving` for parked waiters.
    turn: watch::Sender<u64>,
}

impl Lane {
    fn new() -> Self {
        let (turn, _) = watch::channel(0);
        Self {
            next: 0,
            serving: 0,
            skipped: BTreeSet::new(),
            turn,
        }
    }

    fn advance(&mut self) {
        self.serving += 1;
        while self.skipped.remove(&self.serving) {
            self.serving += 1;
        }
        self.turn.send_replace(self.serving);
    }

    fn is_idle(&self) -> bool {
        self.serving == self.next
    }
}

/// Issues and retires tickets. Idle lanes are dropped.
#[derive(Debug, Default)]
pub struct Sequencer {
    lanes: DashMap<String, Lane>,
}

impl Sequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the next ticket for `id`.
    pub fn issue(&self, id: &str) -> Ticket {
        let mut lane = self.lanes.entry(id.to_string()).or_insert_with(Lane::new);
        let seq = lane.next;
        lane.next += 1;
        Ticket {
            id: id.to_string(),
            seq,
        }
    }

    /// Whether `ticket` is at the head of its lane.
    #[must_use]
    pub fn is_current(&self, ticket: &Ticket) -> bool {
        self.lanes
            .get(&ticket.id)
            .is_some_and(|lane| lane.serving == ticket.seq)
    }

    /// Resolves once `ticket` reaches the head of its lane, or at once if it
    /// already has. The future holds no lock on the sequencer.
    pub fn wait_turn(&self, ticket: &Ticket) -> impl Future<Output = ()> + Send + 'static {
        let turn = self.lanes.get(&ticket.id).map(|lane| lane.turn.subscribe());
        let seq = ticket.seq;
        async move {
            if let Some(mut turn) = turn {
                // A dropped lane has no earlier tickets left.
                let _ = turn.wait_for(|serving| *serving >= seq).await;
            }
        }
    }

    /// Retires `ticket`. Retiring the head lets the next waiting ticket run;
    /// retiring a ticket out of turn marks it to be skipped.
    pub fn complete(&self, ticket: &Ticket) {
        {
            let Some(mut lane) = self.lanes.get_mut(&ticket.id) else {
                return;
            };
            if lane.serving == ticket.seq {
                lane.advance();
            } else if ticket.seq > lane.serving {
                lane.skipped.insert(ticket.seq);
            }
        }
        self.lanes.remove_if(&ticket.id, |_, lane| lane.is_idle());
    }

    /// Tickets issued for `id` and not yet retired.
    #[must_use]
    pub fn pending(&self, id: &str) -> u64 {
        self.lanes.get(id).map_or(0, |lane| {
            lane.next - lane.serving - lane.skipped.len() as u64
        })
    }

    /// Number of ids with at least one outstanding ticket.
    #[must_use]
    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }
}
