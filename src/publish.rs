//! Synchronous fan-out of completed frames to registered handlers
//! (spec.md §4.8).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use tracing::error;

/// A registered frame handler. Takes the frame's opcode and body and
/// returns nothing — spec.md gives handlers no way to signal failure back
/// to the I/O loop, so none is modeled here either.
pub type Handler = Box<dyn Fn(i16, &[u8]) + Send + Sync>;

/// Holds every handler registered via `ServerFacade::on_packet_received`
/// and calls them all, in registration order, for each completed frame.
///
/// A handler that panics is treated as the "handler failure" spec.md §4.8
/// requires be swallowed: it must not stop later handlers from running
/// and must not propagate into the I/O loop.
#[derive(Default)]
pub struct PublishHook {
    handlers: Mutex<Vec<Handler>>,
}

impl PublishHook {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, handler: Handler) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// Invoke every registered handler with `(opcode, body)`, in order.
    /// Called with the registry lock already released (spec.md §5).
    pub fn publish(&self, opcode: i16, body: &[u8]) {
        let handlers = self.handlers.lock().unwrap();
        for handler in handlers.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| handler(opcode, body)));
            if result.is_err() {
                error!(opcode, "packet handler panicked; continuing with remaining handlers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn all_handlers_run_in_registration_order() {
        let hook = PublishHook::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen1 = Arc::clone(&seen);
        hook.register(Box::new(move |op, _body| seen1.lock().unwrap().push(("a", op))));
        let seen2 = Arc::clone(&seen);
        hook.register(Box::new(move |op, _body| seen2.lock().unwrap().push(("b", op))));

        hook.publish(42, b"hi");

        assert_eq!(*seen.lock().unwrap(), vec![("a", 42), ("b", 42)]);
    }

    #[test]
    fn panicking_handler_does_not_block_later_handlers() {
        let hook = PublishHook::new();
        let ran = Arc::new(AtomicUsize::new(0));

        hook.register(Box::new(|_op, _body| panic!("boom")));
        let ran2 = Arc::clone(&ran);
        hook.register(Box::new(move |_op, _body| {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));

        hook.publish(1, b"");

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
