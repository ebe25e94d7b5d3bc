//! Handler stacks bound to event paths.
//!
//! All of this state is strictly thread-local to the owning fiber; the
//! at-most-one-runner invariant on the control block means no locking is
//! needed here.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// A type-erased event handler plus its tombstone flag.
pub(crate) struct HandlerEntry {
    callable: RefCell<Box<dyn FnMut(&dyn Any)>>,
    destroyed: Cell<bool>,
}

impl HandlerEntry {
    pub(crate) fn new(callable: Box<dyn FnMut(&dyn Any)>) -> Self {
        HandlerEntry {
            callable: RefCell::new(callable),
            destroyed: Cell::new(false),
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    pub(crate) fn invoke(&self, data: &dyn Any) {
        (self.callable.borrow_mut())(data);
    }
}

/// The per-(fiber, path) stack of handlers. The newest handler sits at the
/// back and sees events first.
#[derive(Default)]
pub(crate) struct HandlerBlock {
    pub(crate) stack: RefCell<Vec<Rc<HandlerEntry>>>,
}

/// Scoped lifetime token for a bound handler.
///
/// Dropping the reference marks the handler destroyed. The entry is not
/// unlinked immediately; dispatch and `delegate` skip and erase tombstones
/// lazily. A destroyed handler never fires.
pub struct HandlerRef {
    entry: Rc<HandlerEntry>,
}

impl HandlerRef {
    pub(crate) fn new(entry: Rc<HandlerEntry>) -> Self {
        HandlerRef { entry }
    }
}

impl Drop for HandlerRef {
    fn drop(&mut self) {
        self.entry.destroyed.set(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_the_ref_tombstones_the_entry() {
        let entry = Rc::new(HandlerEntry::new(Box::new(|_| {})));
        assert!(!entry.is_destroyed());

        let handler = HandlerRef::new(entry.clone());
        assert!(!entry.is_destroyed());

        drop(handler);
        assert!(entry.is_destroyed());
    }

    #[test]
    fn invoke_passes_the_erased_payload() {
        let seen = Rc::new(Cell::new(0u32));
        let sink = seen.clone();
        let entry = HandlerEntry::new(Box::new(move |data| {
            if let Some(value) = data.downcast_ref::<u32>() {
                sink.set(*value);
            }
        }));

        entry.invoke(&41u32);
        assert_eq!(seen.get(), 41);

        // A payload of the wrong type fails the downcast and is ignored.
        entry.invoke(&"not a number");
        assert_eq!(seen.get(), 41);
    }

    #[test]
    fn newest_handler_sits_at_the_back() {
        let block = HandlerBlock::default();
        let first = Rc::new(HandlerEntry::new(Box::new(|_| {})));
        let second = Rc::new(HandlerEntry::new(Box::new(|_| {})));

        block.stack.borrow_mut().push(first.clone());
        block.stack.borrow_mut().push(second.clone());

        let stack = block.stack.borrow();
        assert_eq!(stack.len(), 2);
        assert!(Rc::ptr_eq(&stack[0], &first));
        assert!(Rc::ptr_eq(stack.last().unwrap(), &second));
    }

    #[test]
    fn tombstoning_does_not_unlink_the_entry() {
        let block = HandlerBlock::default();
        let entry = Rc::new(HandlerEntry::new(Box::new(|_| {})));
        block.stack.borrow_mut().push(entry.clone());

        drop(HandlerRef::new(entry.clone()));

        // The stack still holds the entry; dispatch erases it lazily.
        assert_eq!(block.stack.borrow().len(), 1);
        assert!(block.stack.borrow()[0].is_destroyed());
    }
}
