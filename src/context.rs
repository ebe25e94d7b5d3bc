//! Dispatch operations for the current fiber.
//!
//! While a fiber runs, a thread-local pointer designates its control block;
//! the free functions here act on that block's event context. Workers set
//! the pointer around each resume, fiberized host threads keep it for their
//! lifetime. No process-wide mutable state is involved beyond the
//! per-system structures.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use corosensei::Yielder;
use tracing::trace;

use crate::event::PendingEvent;
use crate::fiber::{ControlBlock, SwitchCommand};
use crate::fiber_ref::FiberRef;
use crate::handler::{HandlerBlock, HandlerEntry, HandlerRef};
use crate::path::Path;
use crate::system::FiberSystem;

thread_local! {
    static CURRENT: RefCell<Option<Arc<ControlBlock>>> = const { RefCell::new(None) };
    static CURRENT_SCHEDULER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Per-fiber dispatch state: the handler table and the active dispatch
/// frame. Strictly thread-local to the owning fiber.
pub(crate) struct EventContext {
    blocks: RefCell<HashMap<Path, Rc<HandlerBlock>>>,
    frames: RefCell<Vec<Frame>>,
    interrupt: Cell<bool>,
}

/// One in-flight dispatch: the handler block for the event's path, the
/// handler currently executing in this dispatch (None before the first
/// step, i.e. past-the-end), and the erased payload.
///
/// The position is held by identity, not index: a nested dispatch on the
/// same path can erase tombstones and shift the stack under an outer frame.
struct Frame {
    block: Rc<HandlerBlock>,
    current: RefCell<Option<Rc<HandlerEntry>>>,
    data: *const dyn Any,
}

impl EventContext {
    pub(crate) fn new() -> Self {
        EventContext {
            blocks: RefCell::new(HashMap::new()),
            frames: RefCell::new(Vec::new()),
            interrupt: Cell::new(false),
        }
    }

    pub(crate) fn bind(&self, path: Path, callable: Box<dyn FnMut(&dyn Any)>) -> HandlerRef {
        let entry = Rc::new(HandlerEntry::new(callable));
        let mut blocks = self.blocks.borrow_mut();
        let block = blocks.entry(path).or_default();
        // Pushed above the position of any in-flight dispatch, so a handler
        // binding its own path only affects subsequent events.
        block.stack.borrow_mut().push(entry.clone());
        HandlerRef::new(entry)
    }

    /// Routes one pending event through its handler stack.
    pub(crate) fn dispatch(&self, event: &PendingEvent) {
        let block = self.blocks.borrow().get(&event.path).cloned();
        let Some(block) = block else {
            trace!(path = %event.path, "no handler bound; event dropped");
            return;
        };
        {
            let mut stack = block.stack.borrow_mut();
            while stack.last().is_some_and(|h| h.is_destroyed()) {
                stack.pop();
            }
            if stack.is_empty() {
                drop(stack);
                self.blocks.borrow_mut().remove(&event.path);
                trace!(path = %event.path, "no live handlers; event dropped");
                return;
            }
        }
        let data: &dyn Any = &*event.data;
        self.frames.borrow_mut().push(Frame {
            block,
            current: RefCell::new(None),
            data: data as *const dyn Any,
        });
        // The frame must come off even if the handler unwinds; a stale
        // frame would dangle into a freed event.
        struct PopFrame<'a>(&'a EventContext);
        impl Drop for PopFrame<'_> {
            fn drop(&mut self) {
                self.0.frames.borrow_mut().pop();
            }
        }
        let _guard = PopFrame(self);
        self.delegate();
    }

    /// Invokes the next older live handler of the active dispatch, erasing
    /// tombstones it walks over. No-op when no older handler exists or no
    /// dispatch is active.
    pub(crate) fn delegate(&self) {
        let top = {
            let frames = self.frames.borrow();
            frames
                .last()
                .map(|frame| (frame.block.clone(), frame.data, frame.current.borrow().clone()))
        };
        let Some((block, data, current)) = top else {
            return;
        };
        let handler = {
            let mut stack = block.stack.borrow_mut();
            // Re-resolve the walk position on every step; the stack may
            // have shifted since this frame last ran. A current handler
            // that was itself erased leaves no older neighbor to identify.
            let mut index = match &current {
                None => stack.len(),
                Some(entry) => stack
                    .iter()
                    .position(|h| Rc::ptr_eq(h, entry))
                    .unwrap_or(0),
            };
            loop {
                if index == 0 {
                    break None;
                }
                index -= 1;
                if stack[index].is_destroyed() {
                    stack.remove(index);
                    continue;
                }
                break Some(stack[index].clone());
            }
        };
        let Some(handler) = handler else {
            return;
        };
        if let Some(frame) = self.frames.borrow().last() {
            *frame.current.borrow_mut() = Some(handler.clone());
        }
        // SAFETY: `data` points into the pending event owned by the active
        // dispatch, which outlives the handler call.
        handler.invoke(unsafe { &*data });
    }

    pub(crate) fn request_interrupt(&self) {
        self.interrupt.set(true);
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.get()
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupt.replace(false)
    }
}

fn current_block() -> Arc<ControlBlock> {
    try_current().expect("not running inside a fiber context")
}

pub(crate) fn try_current() -> Option<Arc<ControlBlock>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Swaps the thread's current control block, returning the previous one.
pub(crate) fn set_current(block: Option<Arc<ControlBlock>>) -> Option<Arc<ControlBlock>> {
    CURRENT.with(|current| current.replace(block))
}

pub(crate) fn set_current_scheduler(index: Option<usize>) {
    CURRENT_SCHEDULER.with(|scheduler| scheduler.set(index));
}

pub(crate) fn current_scheduler() -> Option<usize> {
    CURRENT_SCHEDULER.with(|scheduler| scheduler.get())
}

/// Records the suspension point of a freshly entered fiber.
pub(crate) fn register_yielder(yielder: &Yielder<(), SwitchCommand>) {
    current_block().set_yielder(yielder as *const _);
}

pub(crate) fn bind_handler(path: Path, callable: Box<dyn FnMut(&dyn Any)>) -> HandlerRef {
    current_block().ctx().bind(path, callable)
}

pub(crate) fn interrupt() {
    current_block().ctx().request_interrupt();
}

/// A reference to the current fiber, if this thread is running one.
pub(crate) fn try_self_ref() -> Option<FiberRef> {
    try_current().map(FiberRef::local)
}

/// Returns a reference to the current fiber.
///
/// Panics when the calling thread has no fiber context.
pub fn self_ref() -> FiberRef {
    FiberRef::local(current_block())
}

/// Returns a handle to the system the current fiber belongs to.
///
/// Panics when the calling thread has no fiber context.
pub fn system() -> FiberSystem {
    FiberSystem::from_shared(current_block().system().clone())
}

/// Processes all pending events of the current fiber.
///
/// Each event is routed through the handler stack bound to its path; events
/// without a live handler are silently dropped.
pub fn process() {
    let block = current_block();
    process_block(&block);
}

fn process_block(block: &Arc<ControlBlock>) {
    let ctx = block.ctx();
    loop {
        if ctx.interrupted() {
            // A handler asked to return control to a cooperative wait;
            // remaining events stay queued for the next drain.
            break;
        }
        let Some(event) = block.mailbox().dequeue() else {
            break;
        };
        ctx.dispatch(&event);
        // `event` drops here, freeing its payload exactly once.
    }
}

/// Drains the mailbox, suspends the fiber until new events arrive,
/// processes them, and returns.
///
/// The suspension re-checks the mailbox under the block's status mutex, so
/// an event sent while the fiber is about to park is never lost.
pub fn yield_now() {
    let block = current_block();
    process_block(&block);
    block.ctx().take_interrupt();
    block.suspend();
    process_block(&block);
    block.ctx().take_interrupt();
}

/// Alternates draining and suspending while `waiting` holds.
///
/// The backbone of the cooperative waits: a capturing handler stops the
/// drain through the interrupt flag, the predicate is re-checked, and
/// remaining events stay queued for later processing. The flag is cleared
/// every round, so a wait deeper in the call stack never starves an outer
/// one whose value already arrived.
pub(crate) fn yield_while(waiting: impl Fn() -> bool) {
    let block = current_block();
    loop {
        process_block(&block);
        block.ctx().take_interrupt();
        if !waiting() {
            return;
        }
        block.suspend();
    }
}

/// Processes events in a loop, forever.
///
/// Used by fiberized host threads that exist only to react to events.
pub fn process_forever() -> ! {
    loop {
        yield_now();
    }
}

/// Gives up the worker without waiting for events; the fiber stays
/// runnable and is rescheduled on the local queue.
pub fn cede() {
    current_block().cede();
}

/// From within a handler, invokes the next older handler bound to the same
/// path (the `super` call of stacked interception). No-op when no older
/// live handler exists.
pub fn delegate() {
    current_block().ctx().delegate();
}
