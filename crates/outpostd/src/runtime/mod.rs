//! Cooperative actor runtime: serialized event loops with hierarchical
//! state dispatch.
//!
//! Each actor owns one unbounded FIFO queue and handles exactly one event
//! at a time, so state handlers never need locks. States are plain tags
//! arranged in a parent chain; a handler either consumes an event, defers
//! it to its superstate, or requests a transition. Shared entry/exit logic
//! (arming and disarming timers, cleanup) lives on a shared ancestor
//! instead of being duplicated per leaf state.

pub mod timer;

pub use timer::Timer;

use tokio::sync::mpsc;
use tracing::{debug, trace};

/// What a state handler did with an event.
pub enum Outcome<S> {
    /// Consumed; dispatch stops here.
    Handled,
    /// Not mine; offer it to the superstate.
    Parent,
    /// Consumed, and the machine moves to a new state.
    Transition(S),
}

/// A hierarchical state machine driven by [`run`].
///
/// Handlers are synchronous by design: anything that blocks (network,
/// subprocesses, hashing, filesystem copies) is pushed onto a worker task
/// that posts exactly one completion event back into the owning mailbox.
pub trait Hsm {
    type Event: Send + 'static;
    type State: Copy + PartialEq + std::fmt::Debug;

    /// State the machine starts in.
    fn initial(&self) -> Self::State;

    /// Superstate of `state`, or `None` for the top state.
    fn parent(&self, state: Self::State) -> Option<Self::State>;

    fn entry(&mut self, _state: Self::State) {}

    fn exit(&mut self, _state: Self::State) {}

    fn handle(&mut self, state: Self::State, event: &Self::Event) -> Outcome<Self::State>;
}

/// Clonable posting handle to an actor's queue. Any producer (another
/// actor, a worker, a timer) may post; delivery order is strict FIFO.
pub struct Mailbox<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for Mailbox<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> Mailbox<E> {
    pub fn post(&self, event: E) {
        // A closed queue means the actor is gone; late worker completions
        // are dropped rather than treated as errors.
        if self.tx.send(event).is_err() {
            debug!("mailbox closed; event dropped");
        }
    }
}

/// Create a mailbox and the receiver its actor loop drains.
pub fn mailbox<E>() -> (Mailbox<E>, mpsc::UnboundedReceiver<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Mailbox { tx }, rx)
}

/// Drive a machine until its queue closes. Entry actions of the initial
/// state chain run before the first event is consumed.
pub async fn run<M: Hsm>(mut machine: M, mut rx: mpsc::UnboundedReceiver<M::Event>) {
    let initial = machine.initial();
    for state in path_to_root(&machine, initial).into_iter().rev() {
        machine.entry(state);
    }

    let mut state = initial;
    while let Some(event) = rx.recv().await {
        state = dispatch(&mut machine, state, &event);
    }
    debug!("actor queue closed; loop ending in state {:?}", state);
}

/// Offer an event to `state`, walking up the parent chain until some state
/// consumes it. An event nothing handles is ignored by the implicit no-op
/// top state.
pub fn dispatch<M: Hsm>(machine: &mut M, state: M::State, event: &M::Event) -> M::State {
    let mut s = state;
    loop {
        match machine.handle(s, event) {
            Outcome::Handled => return state,
            Outcome::Transition(target) => return transition(machine, state, target),
            Outcome::Parent => match machine.parent(s) {
                Some(p) => s = p,
                None => {
                    trace!("event ignored in state {:?}", state);
                    return state;
                }
            },
        }
    }
}

/// Exit up to the least common ancestor of `from` and `to`, then enter
/// down to `to`. The LCA itself is neither exited nor re-entered, which is
/// what lets a grouping state hold exit actions shared by its children.
fn transition<M: Hsm>(machine: &mut M, from: M::State, to: M::State) -> M::State {
    let from_path = path_to_root(machine, from);
    let to_path = path_to_root(machine, to);
    let lca = from_path.iter().copied().find(|s| to_path.contains(s));

    for state in &from_path {
        if Some(*state) == lca {
            break;
        }
        machine.exit(*state);
    }

    let cut = match lca {
        Some(l) => to_path.iter().position(|s| *s == l).unwrap(),
        None => to_path.len(),
    };
    for state in to_path[..cut].iter().rev() {
        machine.entry(*state);
    }

    debug!("transition {:?} -> {:?}", from, to);
    to
}

fn path_to_root<M: Hsm>(machine: &M, state: M::State) -> Vec<M::State> {
    let mut path = vec![state];
    let mut s = state;
    while let Some(p) = machine.parent(s) {
        path.push(p);
        s = p;
    }
    path
}
