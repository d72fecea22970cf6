use crate::{
    list::List,
    msg::{Message, TaskRef},
    DefaultRawMutex,
};
use alloc::boxed::Box;
use core::{cell::RefCell, ptr::NonNull};
use embassy_sync::blocking_mutex;

/// A FIFO queue of [Message]s, safe to push from interrupt context.
///
/// All list accesses happen inside the blocking mutex, so a push from an ISR
/// can never observe a half-linked list. With the `critical_section` feature
/// disabled the mutex is a no-op and the queue is only as safe as a plain
/// `RefCell`.
pub struct MsgQueue {
    list: blocking_mutex::Mutex<DefaultRawMutex, RefCell<List<Message>>>,
}

impl MsgQueue {
    pub const fn new() -> Self {
        Self {
            list: blocking_mutex::Mutex::new(RefCell::new(List::new())),
        }
    }
    /// Append a message at the tail. The queue takes ownership.
    pub fn push(&self, msg: Box<Message>) {
        let node = NonNull::from(Box::leak(msg));
        self.list.lock(|list| unsafe {
            list.borrow_mut().push_back(node);
        });
    }
    /// Take the message at the head, if any.
    pub fn pop(&self) -> Option<Box<Message>> {
        self.list.lock(|list| {
            list.borrow_mut()
                .pop_front()
                .map(|node| unsafe { Box::from_raw(node.as_ptr()) })
        })
    }
    /// Remove and return the first message matching `pred`.
    pub fn extract_if(&self, pred: impl FnMut(&Message) -> bool) -> Option<Box<Message>> {
        self.list.lock(|list| {
            list.borrow_mut()
                .extract_if(pred)
                .map(|node| unsafe { Box::from_raw(node.as_ptr()) })
        })
    }
    pub fn is_empty(&self) -> bool {
        self.list.lock(|list| list.borrow().is_empty())
    }
    pub fn len(&self) -> usize {
        self.list.lock(|list| list.borrow().count())
    }
    /// Drop every queued message.
    pub fn flush(&self) {
        while self.pop().is_some() {}
    }
    /// Number of queued messages addressed to `dest`.
    pub fn count_for(&self, dest: TaskRef) -> usize {
        self.list
            .lock(|list| list.borrow().iter().filter(|m| m.dest == dest).count())
    }
}

impl Drop for MsgQueue {
    fn drop(&mut self) {
        self.flush();
    }
}

impl Default for MsgQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::TaskRef;

    const DEST_A: TaskRef = TaskRef::new(1, 0);
    const DEST_B: TaskRef = TaskRef::new(2, 0);

    #[test]
    fn fifo_order() {
        let q = MsgQueue::new();
        for id in [10u16, 20, 30] {
            q.push(Message::basic(id, DEST_A, TaskRef::NONE));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop().unwrap().id, 10);
        assert_eq!(q.pop().unwrap().id, 20);
        assert_eq!(q.pop().unwrap().id, 30);
        assert!(q.pop().is_none());
    }

    #[test]
    fn extract_if_skips_non_matching() {
        let q = MsgQueue::new();
        q.push(Message::basic(1, DEST_A, TaskRef::NONE));
        q.push(Message::basic(2, DEST_B, TaskRef::NONE));
        q.push(Message::basic(3, DEST_A, TaskRef::NONE));
        let hit = q.extract_if(|m| m.dest == DEST_B).unwrap();
        assert_eq!(hit.id, 2);
        assert!(q.extract_if(|m| m.dest == DEST_B).is_none());
        assert_eq!(q.count_for(DEST_A), 2);
    }

    #[test]
    fn flush_empties_queue() {
        let q = MsgQueue::new();
        for id in 0..8 {
            q.push(Message::basic(id, DEST_A, TaskRef::NONE));
        }
        q.flush();
        assert!(q.is_empty());
    }
}
