use core::{future::poll_fn, task::Poll};

use atomic_waker::AtomicWaker;
use macro_bits::{bit, check_bit};
use portable_atomic::{AtomicU32, Ordering};

/// Something was pushed onto the sent queue.
pub const EVT_MESSAGE: u32 = bit!(0);
/// The head software timer expired.
pub const EVT_TIMER: u32 = bit!(1);

/// A set of level-triggered event bits, settable from interrupt context.
///
/// Bits stay raised until whoever handles the event explicitly clears them, so
/// an event raised twice before the dispatch loop runs is still observed once.
pub struct EventFlags {
    field: AtomicU32,
    waker: AtomicWaker,
}
impl EventFlags {
    pub const fn new() -> Self {
        Self {
            field: AtomicU32::new(0),
            waker: AtomicWaker::new(),
        }
    }
    /// Raise the given bits and wake a pending waiter.
    pub fn set(&self, bits: u32) {
        self.field.fetch_or(bits, Ordering::Release);
        self.waker.wake();
    }
    pub fn clear(&self, bits: u32) {
        self.field.fetch_and(!bits, Ordering::Release);
    }
    /// Current bit field, without clearing anything.
    pub fn peek(&self) -> u32 {
        self.field.load(Ordering::Acquire)
    }
    pub fn is_set(&self, bits: u32) -> bool {
        check_bit!(self.peek(), bits)
    }
    /// Wait until at least one bit is raised and return the snapshot. The
    /// bits are left set; the caller clears them once handled.
    pub async fn wait(&self) -> u32 {
        poll_fn(|cx| {
            let field = self.field.load(Ordering::Acquire);
            if field != 0 {
                Poll::Ready(field)
            } else {
                self.waker.register(cx.waker());
                // Re-check after registering, a set() may have raced us.
                let field = self.field.load(Ordering::Acquire);
                if field != 0 {
                    Poll::Ready(field)
                } else {
                    Poll::Pending
                }
            }
        })
        .await
    }
}
impl Default for EventFlags {
    fn default() -> Self {
        Self::new()
    }
}
