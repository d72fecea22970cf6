use crate::{
    kernel::Kernel,
    msg::{Message, MsgId},
    Error, MacResult,
};
use alloc::{boxed::Box, vec::Vec};

/// Task state. Tasks index their handler tables with it.
pub type State = u8;

/// Matches any message identifier when used in a handler table.
pub const MSG_ANY: MsgId = 0xffff;

/// What a handler did with the message it was given.
pub enum MsgStatus {
    /// The message was handled (or deliberately dropped).
    Consumed,
    /// The handler moved the message somewhere else and keeps it alive.
    NoFree,
    /// Not handleable in the current state; park it until the next state
    /// change of the destination task.
    Saved(Box<Message>),
}

/// A message handler. `C` is the application context threaded through
/// dispatch; it must at least reach the kernel via [KernelAccess].
pub type HandlerFn<C> = fn(&mut C, Box<Message>) -> MsgStatus;

pub struct MsgHandler<C> {
    pub id: MsgId,
    pub func: HandlerFn<C>,
}

/// Static description of a task type: one handler table per state plus a
/// fallback table consulted when the state table has no match.
///
/// Within a table the *last* matching entry wins, so generic [MSG_ANY]
/// entries go first and specific overrides after them.
pub struct TaskDesc<C> {
    pub state_handlers: Vec<Vec<MsgHandler<C>>>,
    pub default_handlers: Vec<MsgHandler<C>>,
    pub idx_max: usize,
}

/// All registered task descriptions. Owned by the dispatch loop, outside the
/// application context, so handlers can borrow the context mutably while a
/// dispatch is in flight.
pub struct TaskTable<C> {
    descs: Vec<(u8, TaskDesc<C>)>,
}

pub trait KernelAccess {
    fn kernel(&mut self) -> &mut Kernel;
}
impl KernelAccess for Kernel {
    fn kernel(&mut self) -> &mut Kernel {
        self
    }
}

impl<C: KernelAccess> TaskTable<C> {
    pub const fn new() -> Self {
        Self { descs: Vec::new() }
    }
    pub fn register(&mut self, ty: u8, desc: TaskDesc<C>) -> MacResult<()> {
        if self.descs.iter().any(|(t, _)| *t == ty) {
            return Err(Error::InvalidParam);
        }
        self.descs.push((ty, desc));
        Ok(())
    }
    fn resolve(&self, ty: u8, state: State, id: MsgId) -> Option<HandlerFn<C>> {
        let desc = &self.descs.iter().find(|(t, _)| *t == ty)?.1;
        if let Some(handlers) = desc.state_handlers.get(state as usize) {
            if let Some(h) = handlers
                .iter()
                .rev()
                .find(|h| h.id == id || h.id == MSG_ANY)
            {
                return Some(h.func);
            }
        }
        desc.default_handlers
            .iter()
            .rev()
            .find(|h| h.id == id || h.id == MSG_ANY)
            .map(|h| h.func)
    }
    /// Pop one message off the sent queue and run its handler. Returns false
    /// once the queue is empty.
    pub fn dispatch_one(&self, ctx: &mut C) -> bool {
        let Some(msg) = ctx.kernel().queue_sent().pop() else {
            ctx.kernel().settle_message_event();
            return false;
        };
        let dest = msg.dest;
        match ctx.kernel().state_get(dest) {
            Ok(state) => match self.resolve(dest.ty, state, msg.id) {
                Some(func) => match func(ctx, msg) {
                    MsgStatus::Consumed | MsgStatus::NoFree => {}
                    MsgStatus::Saved(msg) => ctx.kernel().save(msg),
                },
                None => {
                    warn!("No handler for message {:04x} in state {}", msg.id, state);
                }
            },
            Err(_) => {
                warn!("Message {:04x} for unknown task", msg.id);
            }
        }
        ctx.kernel().settle_message_event();
        true
    }
    /// Drain the sent queue completely.
    pub fn dispatch_all(&self, ctx: &mut C) {
        while self.dispatch_one(ctx) {}
    }
}

impl<C: KernelAccess> Default for TaskTable<C> {
    fn default() -> Self {
        Self::new()
    }
}
