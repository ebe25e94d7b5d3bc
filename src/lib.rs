//! # Filament - Fiber-Based Event Runtime
//!
//! A concurrency runtime built around cooperative stackful fibers that
//! communicate exclusively through typed, named events delivered to
//! per-fiber mailboxes. Fibers are multiplexed onto a pool of worker
//! threads (one per core by default) with work stealing.
//!
//! ## Architecture
//!
//! The system follows an M:N model where M fibers run on N worker threads.
//! Key components:
//!
//! - **Fibers**: lightweight stackful contexts that suspend while waiting
//!   for events and resume when mail arrives
//! - **Mailboxes**: per-fiber MPSC queues of pending events
//! - **Events**: typed, named messages; the unit of communication
//! - **Handlers**: stacked reactions bound to event paths, with
//!   delegation to older handlers
//! - **Promises**: single-assignment result cells for future-style fibers
//!
//! ## Example
//!
//! ```no_run
//! use filament::{Event, FiberSystem};
//!
//! let system = FiberSystem::new();
//! let greet = Event::<String>::new("greet");
//!
//! let fiber = system.fiber().run({
//!     let greet = greet.clone();
//!     move || {
//!         let name = greet.wait();
//!         println!("hello, {name}");
//!     }
//! });
//!
//! fiber.send(&greet, "world".to_string());
//! system.all_fibers_finished().wait();
//! system.shutdown();
//! ```

pub mod context;
pub mod mailbox;

mod builder;
mod error;
mod event;
mod fiber;
mod fiber_ref;
mod handler;
mod path;
mod promise;
mod scheduler;
mod system;

pub use builder::Builder;
pub use error::{FiberError, SendError};
pub use event::{Event, PendingEvent};
pub use fiber_ref::{FiberRef, FutureRef, Locality};
pub use handler::HandlerRef;
pub use mailbox::{BoundedMailbox, LockfreeMailbox, LockingMailbox, Mailbox};
pub use path::Path;
pub use promise::Promise;
pub use scheduler::SchedulerId;
pub use system::FiberSystem;
