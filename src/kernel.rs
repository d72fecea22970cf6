use crate::{
    msg::{Message, MsgId, TaskRef},
    queue::MsgQueue,
    sync::{EventFlags, EVT_MESSAGE},
    task::State,
    time::{TimeTu, TimerHw},
    timer::TimerService,
    Error, MacResult,
};
use alloc::{boxed::Box, vec, vec::Vec};

/// Tuning knobs for the kernel.
#[derive(Clone, Copy, Debug)]
pub struct KernelConfig {
    /// Timers within this many TU of their deadline fire immediately instead
    /// of re-arming the compare timer.
    pub timer_slack: u16,
    /// Upper bound on concurrently pending software timers.
    pub max_timers: usize,
}
impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            timer_slack: 1,
            max_timers: 16,
        }
    }
}

/// The message-passing kernel: queues, task states, events and timers.
///
/// Everything except [Kernel::send] and the event flags runs in the single
/// dispatch context. `send` may be called from interrupt handlers; it only
/// touches the locked sent queue and the event flags.
pub struct Kernel {
    queue_sent: MsgQueue,
    queue_saved: MsgQueue,
    events: EventFlags,
    timers: TimerService,
    hw: Box<dyn TimerHw>,
    states: Vec<(u8, Box<[State]>)>,
}

impl Kernel {
    pub fn new(hw: Box<dyn TimerHw>, config: KernelConfig) -> Self {
        Self {
            queue_sent: MsgQueue::new(),
            queue_saved: MsgQueue::new(),
            events: EventFlags::new(),
            timers: TimerService::new(config.timer_slack, config.max_timers),
            hw,
            states: Vec::new(),
        }
    }
    /// Register a task type with `idx_max` instances, all starting in state 0.
    pub fn register_task(&mut self, ty: u8, idx_max: usize) -> MacResult<()> {
        if idx_max == 0 || self.states.iter().any(|(t, _)| *t == ty) {
            return Err(Error::InvalidParam);
        }
        self.states.push((ty, vec![0; idx_max].into_boxed_slice()));
        Ok(())
    }
    /// Queue a message for dispatch and raise the message event.
    pub fn send(&self, msg: Box<Message>) {
        trace!("Message {:04x} to task {}.{}", msg.id, msg.dest.ty, msg.dest.idx);
        self.queue_sent.push(msg);
        self.events.set(EVT_MESSAGE);
    }
    pub fn send_basic(&self, id: MsgId, dest: TaskRef, src: TaskRef) {
        self.send(Message::basic(id, dest, src));
    }
    /// Re-queue a received message to another task, stamping the previous
    /// destination as its source.
    pub fn forward(&self, mut msg: Box<Message>, dest: TaskRef) {
        msg.src = msg.dest;
        msg.dest = dest;
        self.send(msg);
    }
    /// Reconcile [EVT_MESSAGE] with the sent queue after a dispatch step.
    ///
    /// Clears the event first and only then re-checks the queue, re-raising
    /// the event if anything is pending. A [Kernel::send] from interrupt
    /// context that lands between the two either sets the bit after our
    /// clear or is picked up by the re-check, so its wakeup is never lost.
    pub fn settle_message_event(&self) {
        self.events.clear(EVT_MESSAGE);
        if !self.queue_sent.is_empty() {
            self.events.set(EVT_MESSAGE);
        }
    }
    /// Park a message until `msg.dest` changes state.
    pub fn save(&self, msg: Box<Message>) {
        self.queue_saved.push(msg);
    }
    pub fn state_get(&self, task: TaskRef) -> MacResult<State> {
        let (_, states) = self
            .states
            .iter()
            .find(|(t, _)| *t == task.ty)
            .ok_or(Error::InvalidTask)?;
        states
            .get(task.idx as usize)
            .copied()
            .ok_or(Error::InvalidTask)
    }
    /// Change a task instance's state.
    ///
    /// On an actual change, every message saved for that task is appended to
    /// the sent queue in its saved order, behind whatever is already queued.
    pub fn state_set(&mut self, task: TaskRef, state: State) -> MacResult<()> {
        let (_, states) = self
            .states
            .iter_mut()
            .find(|(t, _)| *t == task.ty)
            .ok_or(Error::InvalidTask)?;
        let slot = states
            .get_mut(task.idx as usize)
            .ok_or(Error::InvalidTask)?;
        if *slot == state {
            return Ok(());
        }
        debug!("Task {}.{} state {} -> {}", task.ty, task.idx, *slot, state);
        *slot = state;
        while let Some(msg) = self.queue_saved.extract_if(|m| m.dest == task) {
            self.queue_sent.push(msg);
            self.events.set(EVT_MESSAGE);
        }
        Ok(())
    }
    pub fn timer_set(&mut self, id: MsgId, task: TaskRef, delay: u16) -> MacResult<()> {
        self.timers.set(&*self.hw, &self.events, id, task, delay)
    }
    pub fn timer_clear(&mut self, id: MsgId, task: TaskRef) -> bool {
        self.timers.clear(&*self.hw, &self.events, id, task)
    }
    pub fn timer_active(&self, id: MsgId, task: TaskRef) -> bool {
        self.timers.active(id, task)
    }
    /// Fire expired timers. Call when [crate::sync::EVT_TIMER] is raised.
    pub fn timer_schedule(&mut self) {
        self.timers
            .schedule(&*self.hw, &self.events, &self.queue_sent);
    }
    pub fn now(&self) -> TimeTu {
        self.hw.now()
    }
    pub fn events(&self) -> &EventFlags {
        &self.events
    }
    pub fn queue_sent(&self) -> &MsgQueue {
        &self.queue_sent
    }
    pub fn saved_count_for(&self, task: TaskRef) -> usize {
        self.queue_saved.count_for(task)
    }
    /// Drop all queued messages and pending timers.
    pub fn flush(&mut self) {
        self.queue_sent.flush();
        self.queue_saved.flush();
        self.timers.flush(&*self.hw);
        self.events.clear(u32::MAX);
    }
}
