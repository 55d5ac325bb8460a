//! A small table-driven finite state machine, and the connection lifecycle built on it.
//!
//! Each state has an ordered list of outgoing transitions. On every tick, the first transition
//!  whose predicate holds is taken - at most one per tick.

use std::fmt::Debug;
use tokio::time::Instant;

pub trait State: Copy + Eq + Debug + Send + Sync + 'static {
    /// whatever the transitions' predicates evaluate
    type Context: ?Sized;

    fn transitions(self) -> &'static [Transition<Self>];
}

pub struct Transition<S: State> {
    pub target: S,
    /// is called with the machine's context, the time the current state was entered, and the
    ///  current time
    pub evaluate: fn(&S::Context, Instant, Instant) -> bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange<S: State> {
    pub previous: S,
    pub current: S,
}

#[derive(Debug)]
pub struct StateMachine<S: State> {
    current: S,
    entered: Instant,
}

impl <S: State> StateMachine<S> {
    pub fn new(initial: S, now: Instant) -> StateMachine<S> {
        StateMachine {
            current: initial,
            entered: now,
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// the time when the current state was entered
    pub fn entered(&self) -> Instant {
        self.entered
    }

    pub fn tick(&mut self, ctx: &S::Context, now: Instant) -> Option<StateChange<S>> {
        let target = self.current.transitions()
            .iter()
            .find(|t| (t.evaluate)(ctx, self.entered, now))?
            .target;
        Some(self.change_to(target, now))
    }

    fn change_to(&mut self, target: S, now: Instant) -> StateChange<S> {
        let previous = self.current;
        self.current = target;
        self.entered = now;
        StateChange { previous, current: target }
    }
}


/// What the connection lifecycle is evaluated against
pub trait Liveness {
    fn is_open(&self) -> bool;
    fn is_alive(&self) -> bool;
    fn is_sent_recently(&self, now: Instant) -> bool;
    fn is_received_recently(&self, now: Instant) -> bool;
    fn is_not_received_long_time_ago(&self, now: Instant) -> bool;
    fn last_received_time(&self) -> Option<Instant>;
}

/// The lifecycle of a connection.
///
/// ```ascii
///  Default --> Preparing --> Ready <--> Expired <--> Maintaining
///     ^            |           |           |             |
///     |            v           v           v             |
///     +-------- (Default)    Error <-------+-------------+
///     +------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Default,
    Preparing,
    /// traffic in both directions within the expiry window
    Ready,
    /// nothing received for a while, a heartbeat is due
    Expired,
    /// a heartbeat went out, waiting for the peer to answer
    Maintaining,
    Error,
}

const DEFAULT_TRANSITIONS: &[Transition<ConnectionState>] = &[
    Transition { target: ConnectionState::Preparing, evaluate: default_to_preparing },
];
const PREPARING_TRANSITIONS: &[Transition<ConnectionState>] = &[
    Transition { target: ConnectionState::Ready, evaluate: preparing_to_ready },
    Transition { target: ConnectionState::Default, evaluate: preparing_to_default },
];
const READY_TRANSITIONS: &[Transition<ConnectionState>] = &[
    Transition { target: ConnectionState::Expired, evaluate: ready_to_expired },
    Transition { target: ConnectionState::Error, evaluate: ready_to_error },
];
const EXPIRED_TRANSITIONS: &[Transition<ConnectionState>] = &[
    Transition { target: ConnectionState::Maintaining, evaluate: expired_to_maintaining },
    Transition { target: ConnectionState::Error, evaluate: expired_to_error },
];
const MAINTAINING_TRANSITIONS: &[Transition<ConnectionState>] = &[
    Transition { target: ConnectionState::Ready, evaluate: maintaining_to_ready },
    Transition { target: ConnectionState::Expired, evaluate: maintaining_to_expired },
    Transition { target: ConnectionState::Error, evaluate: maintaining_to_error },
];
const ERROR_TRANSITIONS: &[Transition<ConnectionState>] = &[
    Transition { target: ConnectionState::Default, evaluate: error_to_default },
];

impl State for ConnectionState {
    type Context = dyn Liveness;

    fn transitions(self) -> &'static [Transition<Self>] {
        match self {
            ConnectionState::Default => DEFAULT_TRANSITIONS,
            ConnectionState::Preparing => PREPARING_TRANSITIONS,
            ConnectionState::Ready => READY_TRANSITIONS,
            ConnectionState::Expired => EXPIRED_TRANSITIONS,
            ConnectionState::Maintaining => MAINTAINING_TRANSITIONS,
            ConnectionState::Error => ERROR_TRANSITIONS,
        }
    }
}

fn default_to_preparing(conn: &dyn Liveness, _entered: Instant, _now: Instant) -> bool {
    conn.is_open()
}

fn preparing_to_ready(conn: &dyn Liveness, _entered: Instant, _now: Instant) -> bool {
    conn.is_alive()
}

fn preparing_to_default(conn: &dyn Liveness, _entered: Instant, _now: Instant) -> bool {
    !conn.is_open()
}

fn ready_to_expired(conn: &dyn Liveness, _entered: Instant, now: Instant) -> bool {
    conn.is_alive() && !conn.is_received_recently(now)
}

fn ready_to_error(conn: &dyn Liveness, _entered: Instant, _now: Instant) -> bool {
    !conn.is_alive()
}

fn expired_to_maintaining(conn: &dyn Liveness, _entered: Instant, now: Instant) -> bool {
    conn.is_alive() && conn.is_sent_recently(now)
}

fn expired_to_error(conn: &dyn Liveness, _entered: Instant, now: Instant) -> bool {
    !conn.is_alive() || conn.is_not_received_long_time_ago(now)
}

fn maintaining_to_ready(conn: &dyn Liveness, _entered: Instant, now: Instant) -> bool {
    conn.is_alive() && conn.is_received_recently(now)
}

fn maintaining_to_expired(conn: &dyn Liveness, _entered: Instant, now: Instant) -> bool {
    conn.is_alive() && !conn.is_sent_recently(now)
}

fn maintaining_to_error(conn: &dyn Liveness, _entered: Instant, now: Instant) -> bool {
    !conn.is_alive() || conn.is_not_received_long_time_ago(now)
}

/// recovery requires that something arrived after the error was detected
fn error_to_default(conn: &dyn Liveness, entered: Instant, _now: Instant) -> bool {
    conn.is_alive() && conn.last_received_time().is_some_and(|t| t > entered)
}
