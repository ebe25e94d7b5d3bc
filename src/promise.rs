//! Single-assignment result cells.

use parking_lot::{Condvar, Mutex};

use crate::context;
use crate::error::FiberError;
use crate::event::Event;
use crate::fiber_ref::FiberRef;
use crate::path::Path;

enum State<A> {
    Pending { awaiters: Vec<Waiter> },
    Fulfilled(A),
    Failed(FiberError),
}

struct Waiter {
    fiber: FiberRef,
    completion: Path,
}

/// A single-assignment cell awaited by zero or more fibers.
///
/// Fulfillment wakes every current awaiter and satisfies all future ones.
/// Completing an already-completed promise is a fatal usage error.
pub struct Promise<A> {
    state: Mutex<State<A>>,
    done: Condvar,
}

impl<A: Clone + Send + 'static> Promise<A> {
    pub fn new() -> Self {
        Promise {
            state: Mutex::new(State::Pending {
                awaiters: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    /// A promise that is already failed; handed out for spawns refused
    /// during shutdown.
    pub(crate) fn failed(error: FiberError) -> Self {
        Promise {
            state: Mutex::new(State::Failed(error)),
            done: Condvar::new(),
        }
    }

    /// Resolves the promise with a value.
    ///
    /// Panics if the promise was already completed.
    pub fn fulfill(&self, value: A) {
        self.complete(State::Fulfilled(value));
    }

    /// Resolves the promise with a failure.
    ///
    /// Panics if the promise was already completed.
    pub fn fail(&self, error: FiberError) {
        self.complete(State::Failed(error));
    }

    fn complete(&self, next: State<A>) {
        let awaiters = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending { awaiters } => {
                    let awaiters = std::mem::take(awaiters);
                    *state = next;
                    awaiters
                }
                _ => panic!("promise completed twice"),
            }
        };
        self.done.notify_all();
        for waiter in awaiters {
            waiter
                .fiber
                .send(&Event::<()>::from_path(waiter.completion), ());
        }
    }

    /// Blocks until the promise resolves and returns the value or the
    /// stored failure.
    ///
    /// From a fiber context this suspends cooperatively: the awaiter
    /// registers a one-shot completion event on a private unique path and
    /// parks through its mailbox, so other events keep being dispatched.
    /// From a plain thread it blocks on the internal condition variable.
    pub fn wait(&self) -> Result<A, FiberError> {
        if let Some(myself) = context::try_self_ref() {
            let completion = {
                let mut state = self.state.lock();
                match &mut *state {
                    State::Fulfilled(value) => return Ok(value.clone()),
                    State::Failed(error) => return Err(*error),
                    State::Pending { awaiters } => {
                        let completion = Path::unique();
                        awaiters.push(Waiter {
                            fiber: myself,
                            completion: completion.clone(),
                        });
                        completion
                    }
                }
            };
            Event::<()>::from_path(completion).wait();
            match &*self.state.lock() {
                State::Fulfilled(value) => Ok(value.clone()),
                State::Failed(error) => Err(*error),
                State::Pending { .. } => unreachable!("completion event before resolution"),
            }
        } else {
            let mut state = self.state.lock();
            loop {
                match &*state {
                    State::Fulfilled(value) => return Ok(value.clone()),
                    State::Failed(error) => return Err(*error),
                    State::Pending { .. } => self.done.wait(&mut state),
                }
            }
        }
    }
}

impl<A: Clone + Send + 'static> Default for Promise<A> {
    fn default() -> Self {
        Promise::new()
    }
}
