//! # Transaction timers
//!
//! RFC 3261 Section 17 drives every transaction with a handful of timers.
//! [`TimerSettings`] holds their base values and [`TimerQueue`] orders the
//! pending firings for the controller loop.
//!
//! | timer | machine              | purpose                                       | default      |
//! |-------|----------------------|-----------------------------------------------|--------------|
//! | A     | client INVITE        | request retransmission, doubling              | T1           |
//! | B     | client INVITE        | transaction timeout in Calling                | 64*T1        |
//! | C     | client INVITE        | timeout in Proceeding, refreshed by each 1xx  | 3 min        |
//! | D     | client INVITE        | absorb final response retransmissions         | 32 s         |
//! | E1/E2 | client non-INVITE    | request retransmission in Trying / Proceeding | T1 / T2      |
//! | F     | client non-INVITE    | transaction timeout                           | 64*T1        |
//! | G     | server INVITE        | final response retransmission                 | T1           |
//! | H     | server INVITE        | wait for ACK                                  | 64*T1        |
//! | I     | server INVITE        | absorb ACK retransmissions                    | T4           |
//! | J     | server non-INVITE    | absorb request retransmissions                | 64*T1        |
//! | K     | client non-INVITE    | absorb response retransmissions               | T4           |
//!
//! `Trying` sends a 100 when the TU has not answered: after 80 ms for an
//! INVITE, after 3.5 s for other methods (RFC 4320). The stale timers keep a
//! transaction that saw a 2xx around long enough to pass on retransmitted or
//! forked 2xx responses.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSettings {
    /// RTT estimate
    pub t1: Duration,
    /// Cap on non-INVITE and response retransmission intervals
    pub t2: Duration,
    /// Time the network takes to clear messages
    pub t4: Duration,
    /// Delay before a server INVITE transaction answers 100 Trying itself
    pub t100: Duration,
    /// Delay before a server non-INVITE transaction answers 100 Trying itself
    pub trying: Duration,
    /// Multiple of T1 used for timers B, F, H and J
    pub timeout_multiplier: u32,
    pub timer_c: Duration,
    pub timer_d: Duration,
    /// Lifetime of a stateless send, long enough to try every DNS target
    pub stateless: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        TimerSettings {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            t100: Duration::from_millis(80),
            trying: Duration::from_millis(3500),
            timeout_multiplier: 64,
            timer_c: Duration::from_secs(180),
            timer_d: Duration::from_secs(32),
            stateless: Duration::from_secs(32),
        }
    }
}

impl TimerSettings {
    /// 64*T1 with the default multiplier
    pub fn transaction_timeout(&self) -> Duration {
        self.t1 * self.timeout_multiplier
    }

    pub fn timer_b(&self) -> Duration {
        self.transaction_timeout()
    }

    pub fn timer_f(&self) -> Duration {
        self.transaction_timeout()
    }

    pub fn timer_h(&self) -> Duration {
        self.transaction_timeout()
    }

    pub fn timer_j(&self) -> Duration {
        self.transaction_timeout()
    }

    /// How long a transaction that saw a 2xx lingers (RFC 6026 Timers L and M)
    pub fn stale(&self) -> Duration {
        self.transaction_timeout()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    A,
    B,
    C,
    D,
    E1,
    E2,
    F,
    G,
    H,
    I,
    J,
    K,
    Trying,
    Stateless,
    StaleClient,
    StaleServer,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::A => "A",
            TimerKind::B => "B",
            TimerKind::C => "C",
            TimerKind::D => "D",
            TimerKind::E1 => "E1",
            TimerKind::E2 => "E2",
            TimerKind::F => "F",
            TimerKind::G => "G",
            TimerKind::H => "H",
            TimerKind::I => "I",
            TimerKind::J => "J",
            TimerKind::K => "K",
            TimerKind::Trying => "Trying",
            TimerKind::Stateless => "Stateless",
            TimerKind::StaleClient => "StaleClient",
            TimerKind::StaleServer => "StaleServer",
        }
    }

    /// Whether the timer belongs to a client-side (or stateless) transaction
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TimerKind::A
                | TimerKind::B
                | TimerKind::C
                | TimerKind::D
                | TimerKind::E1
                | TimerKind::E2
                | TimerKind::F
                | TimerKind::K
                | TimerKind::Stateless
                | TimerKind::StaleClient
        )
    }

    /// Timers whose only job is to retransmit
    pub fn is_retransmission(&self) -> bool {
        matches!(self, TimerKind::A | TimerKind::E1 | TimerKind::E2 | TimerKind::G)
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timer firing addressed to one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerMessage {
    pub tid: String,
    pub kind: TimerKind,
    /// The delay it was scheduled with; retransmission timers double it
    pub duration: Duration,
    /// Unique per queue, lets a transaction ignore a superseded timer
    pub id: u64,
}

struct Entry {
    deadline: Instant,
    message: TimerMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.message.id.cmp(&self.message.id))
    }
}

/// Pending timer firings, earliest first. Timers with equal deadlines fire
/// in the order they were added.
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Entry>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a timer `duration` from now and returns its id
    pub fn add(&mut self, tid: &str, kind: TimerKind, duration: Duration) -> u64 {
        self.add_at(Instant::now(), tid, kind, duration)
    }

    pub fn add_at(&mut self, now: Instant, tid: &str, kind: TimerKind, duration: Duration) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.heap.push(Entry {
            deadline: now + duration,
            message: TimerMessage {
                tid: tid.to_string(),
                kind,
                duration,
                id,
            },
        });
        id
    }

    /// Removes and returns every timer due at `now`
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerMessage> {
        let mut fired = Vec::new();
        while self.heap.peek().is_some_and(|e| e.deadline <= now) {
            if let Some(entry) = self.heap.pop() {
                fired.push(entry.message);
            }
        }
        fired
    }

    /// Time until the next timer is due, zero if one already is
    pub fn time_till_next(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|e| e.deadline.saturating_duration_since(now))
    }

    /// Milliseconds until the next timer, for callers that poll in milliseconds
    pub fn msec_till_next(&self, now: Instant) -> Option<u64> {
        self.time_till_next(now).map(|d| d.as_millis() as u64)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
