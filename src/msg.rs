use crate::list::Linked;
use alloc::{boxed::Box, vec::Vec};
use core::ptr::null_mut;

/// Message identifier. The high byte carries the task type the identifier
/// belongs to, the low byte an index local to that task.
pub type MsgId = u16;

/// Builds a [MsgId] from a task type and a local index.
pub const fn msg_id(task_type: u8, idx: u8) -> MsgId {
    ((task_type as u16) << 8) | idx as u16
}

/// Task type extracted from a message identifier.
pub const fn msg_id_type(id: MsgId) -> u8 {
    (id >> 8) as u8
}

/// Address of a task instance: a task type plus an instance index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskRef {
    pub ty: u8,
    pub idx: u8,
}
impl TaskRef {
    /// Address used when the sender is nobody in particular, like the timer
    /// service.
    pub const NONE: Self = Self { ty: 0xff, idx: 0xff };

    pub const fn new(ty: u8, idx: u8) -> Self {
        Self { ty, idx }
    }
}

/// A heap-allocated kernel message.
///
/// Messages are owned by exactly one party at any time. While queued they are
/// held as raw pointers inside an intrusive list; everywhere else they travel
/// as `Box<Message>`.
pub struct Message {
    next: *mut Message,
    pub id: MsgId,
    pub dest: TaskRef,
    pub src: TaskRef,
    pub param: Vec<u8>,
}

// The embedded `next` pointer is only touched while the message sits inside a
// queue, under that queue's lock.
unsafe impl Send for Message {}

unsafe impl Linked for Message {
    fn next(&self) -> *mut Self {
        self.next
    }
    fn set_next(&mut self, next: *mut Self) {
        self.next = next;
    }
}

impl Message {
    pub fn new(id: MsgId, dest: TaskRef, src: TaskRef, param: Vec<u8>) -> Box<Self> {
        Box::new(Self {
            next: null_mut(),
            id,
            dest,
            src,
            param,
        })
    }
    /// A parameter-less message.
    pub fn basic(id: MsgId, dest: TaskRef, src: TaskRef) -> Box<Self> {
        Self::new(id, dest, src, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_id_carries_task_type() {
        let id = msg_id(0x12, 0x34);
        assert_eq!(id, 0x1234);
        assert_eq!(msg_id_type(id), 0x12);
    }

    #[test]
    fn basic_message_has_no_param() {
        let msg = Message::basic(1, TaskRef::new(2, 0), TaskRef::NONE);
        assert!(msg.param.is_empty());
        assert_eq!(msg.src, TaskRef::NONE);
    }
}
