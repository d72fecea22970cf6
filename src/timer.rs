use crate::{
    list::{Linked, List},
    msg::{Message, MsgId, TaskRef},
    queue::MsgQueue,
    sync::{EventFlags, EVT_MESSAGE, EVT_TIMER},
    time::{TimeTu, TimerHw, DELAY_MAX},
    Error, MacResult,
};
use alloc::boxed::Box;
use core::ptr::{null_mut, NonNull};

struct TimerEntry {
    next: *mut TimerEntry,
    id: MsgId,
    task: TaskRef,
    time: TimeTu,
}
unsafe impl Linked for TimerEntry {
    fn next(&self) -> *mut Self {
        self.next
    }
    fn set_next(&mut self, next: *mut Self) {
        self.next = next;
    }
}

/// Software timers multiplexed over one hardware compare timer.
///
/// Timers are kept sorted by expiry; the hardware compare is always programmed
/// with the head's deadline. An expired timer turns into a parameter-less
/// message pushed onto the sent queue, so timer delivery goes through the
/// normal dispatch path.
///
/// Only accessed from the dispatch context, never from interrupts; the
/// interrupt handler merely raises [EVT_TIMER].
pub struct TimerService {
    pending: List<TimerEntry>,
    count: usize,
    slack: u16,
    max_timers: usize,
}

impl TimerService {
    pub const fn new(slack: u16, max_timers: usize) -> Self {
        Self {
            pending: List::new(),
            count: 0,
            slack,
            max_timers,
        }
    }
    /// Arm (or re-arm) the timer identified by `(id, task)`.
    ///
    /// An already pending timer with the same identity is cancelled first, so
    /// setting a timer twice moves it instead of duplicating it. `delay` is
    /// relative, in TU, and must be positive and below [DELAY_MAX].
    pub fn set(
        &mut self,
        hw: &dyn TimerHw,
        events: &EventFlags,
        id: MsgId,
        task: TaskRef,
        delay: u16,
    ) -> MacResult<()> {
        if delay == 0 || delay >= DELAY_MAX {
            return Err(Error::InvalidDelay);
        }
        let old_deadline = self.pending.front().map(|e| e.time);
        if let Some(node) = self.pending.extract_if(|e| e.id == id && e.task == task) {
            drop(unsafe { Box::from_raw(node.as_ptr()) });
            self.count -= 1;
        } else if self.count >= self.max_timers {
            return Err(Error::Full);
        }
        let time = hw.now().add(delay);
        let node = NonNull::from(Box::leak(Box::new(TimerEntry {
            next: null_mut(),
            id,
            task,
            time,
        })));
        unsafe {
            self.pending
                .insert_sorted(node, |a, b| a.time.is_before(b.time))
        };
        self.count += 1;
        trace!("Timer {:04x} set, expires at {}", id, time.0);
        if let Some(head) = self.pending.front() {
            if old_deadline != Some(head.time) {
                hw.arm(head.time);
                // The deadline may already have slipped past while we were
                // programming the compare register.
                if head.time.is_past(hw.now()) {
                    events.set(EVT_TIMER);
                }
            }
        }
        Ok(())
    }
    /// Cancel a pending timer. Idempotent; returns whether one was pending.
    pub fn clear(
        &mut self,
        hw: &dyn TimerHw,
        events: &EventFlags,
        id: MsgId,
        task: TaskRef,
    ) -> bool {
        let was_head = self
            .pending
            .front()
            .map(|e| e.id == id && e.task == task)
            .unwrap_or(false);
        let Some(node) = self.pending.extract_if(|e| e.id == id && e.task == task) else {
            return false;
        };
        drop(unsafe { Box::from_raw(node.as_ptr()) });
        self.count -= 1;
        trace!("Timer {:04x} cleared", id);
        if was_head {
            match self.pending.front() {
                Some(head) => {
                    hw.arm(head.time);
                    if head.time.is_past(hw.now()) {
                        events.set(EVT_TIMER);
                    }
                }
                None => hw.disable(),
            }
        }
        true
    }
    /// Whether a timer with this identity is currently pending.
    pub fn active(&self, id: MsgId, task: TaskRef) -> bool {
        self.pending.iter().any(|e| e.id == id && e.task == task)
    }
    /// Fire every expired timer, then re-program the compare for the next
    /// one. Called from the dispatch loop when [EVT_TIMER] is raised.
    ///
    /// A timer within `slack` TU of its deadline fires early rather than
    /// paying another compare interrupt for the remainder.
    pub fn schedule(&mut self, hw: &dyn TimerHw, events: &EventFlags, sent: &MsgQueue) {
        loop {
            events.clear(EVT_TIMER);
            let deadline = match self.pending.front() {
                Some(head) => head.time,
                None => {
                    hw.disable();
                    break;
                }
            };
            if !deadline.sub(self.slack).is_past(hw.now()) {
                hw.arm(deadline);
                // Re-check with the compare armed; if it expired in between
                // the interrupt was lost and we must fire it ourselves.
                if !deadline.is_past(hw.now()) {
                    break;
                }
            }
            if let Some(node) = self.pending.pop_front() {
                let entry = unsafe { Box::from_raw(node.as_ptr()) };
                self.count -= 1;
                trace!("Timer {:04x} expired", entry.id);
                sent.push(Message::basic(entry.id, entry.task, TaskRef::NONE));
                events.set(EVT_MESSAGE);
            }
        }
    }
    /// Cancel everything.
    pub fn flush(&mut self, hw: &dyn TimerHw) {
        while let Some(node) = self.pending.pop_front() {
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
        self.count = 0;
        hw.disable();
    }
    pub fn pending_count(&self) -> usize {
        self.count
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        while let Some(node) = self.pending.pop_front() {
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::testing::FakeClock;
    use alloc::vec::Vec;

    const TASK_A: TaskRef = TaskRef::new(1, 0);
    const TASK_B: TaskRef = TaskRef::new(2, 0);

    fn fixture() -> (TimerService, FakeClock, EventFlags, MsgQueue) {
        (
            TimerService::new(1, 16),
            FakeClock::new(),
            EventFlags::new(),
            MsgQueue::new(),
        )
    }

    fn fire_ids(sent: &MsgQueue) -> Vec<MsgId> {
        let mut out = Vec::new();
        while let Some(m) = sent.pop() {
            assert_eq!(m.src, TaskRef::NONE);
            out.push(m.id);
        }
        out
    }

    #[test]
    fn rejects_bad_delays() {
        let (mut svc, hw, evt, _sent) = fixture();
        assert_eq!(svc.set(&hw, &evt, 1, TASK_A, 0), Err(Error::InvalidDelay));
        // The horizon itself is out of range too; only delays below it are
        // unambiguous under wraparound comparison.
        assert_eq!(
            svc.set(&hw, &evt, 1, TASK_A, DELAY_MAX),
            Err(Error::InvalidDelay)
        );
        assert!(!svc.active(1, TASK_A));
        assert!(svc.set(&hw, &evt, 1, TASK_A, DELAY_MAX - 1).is_ok());
    }

    #[test]
    fn head_timer_programs_hardware() {
        let (mut svc, hw, evt, _sent) = fixture();
        svc.set(&hw, &evt, 1, TASK_A, 100).unwrap();
        assert_eq!(hw.armed_at(), Some(100));
        // A later timer must not touch the compare.
        svc.set(&hw, &evt, 2, TASK_A, 200).unwrap();
        assert_eq!(hw.armed_at(), Some(100));
        // An earlier one must.
        svc.set(&hw, &evt, 3, TASK_B, 50).unwrap();
        assert_eq!(hw.armed_at(), Some(50));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let (mut svc, hw, evt, sent) = fixture();
        svc.set(&hw, &evt, 30, TASK_A, 300).unwrap();
        svc.set(&hw, &evt, 10, TASK_A, 100).unwrap();
        svc.set(&hw, &evt, 20, TASK_B, 200).unwrap();
        hw.set_now(500);
        svc.schedule(&hw, &evt, &sent);
        assert_eq!(fire_ids(&sent), [10, 20, 30]);
        assert!(evt.is_set(EVT_MESSAGE));
        assert!(!evt.is_set(EVT_TIMER));
        assert_eq!(hw.armed_at(), None);
    }

    #[test]
    fn schedule_rearms_for_future_timer() {
        let (mut svc, hw, evt, sent) = fixture();
        svc.set(&hw, &evt, 1, TASK_A, 10).unwrap();
        svc.set(&hw, &evt, 2, TASK_A, 1000).unwrap();
        hw.set_now(10);
        svc.schedule(&hw, &evt, &sent);
        assert_eq!(fire_ids(&sent), [1]);
        assert_eq!(hw.armed_at(), Some(1000));
        assert!(svc.active(2, TASK_A));
    }

    #[test]
    fn slack_fires_nearly_due_timer_early() {
        let (mut svc, hw, evt, sent) = fixture();
        svc.set(&hw, &evt, 1, TASK_A, 100).unwrap();
        // One TU short of the deadline, within the slack of 1.
        hw.set_now(99);
        svc.schedule(&hw, &evt, &sent);
        assert_eq!(fire_ids(&sent), [1]);
    }

    #[test]
    fn setting_again_moves_the_timer() {
        let (mut svc, hw, evt, sent) = fixture();
        svc.set(&hw, &evt, 1, TASK_A, 100).unwrap();
        svc.set(&hw, &evt, 1, TASK_A, 300).unwrap();
        assert_eq!(svc.pending_count(), 1);
        assert_eq!(hw.armed_at(), Some(300));
        hw.set_now(150);
        svc.schedule(&hw, &evt, &sent);
        assert!(fire_ids(&sent).is_empty());
        assert!(svc.active(1, TASK_A));
    }

    #[test]
    fn clearing_the_head_rearms_the_next() {
        let (mut svc, hw, evt, _sent) = fixture();
        svc.set(&hw, &evt, 1, TASK_A, 100).unwrap();
        svc.set(&hw, &evt, 2, TASK_B, 200).unwrap();
        assert!(svc.clear(&hw, &evt, 1, TASK_A));
        assert_eq!(hw.armed_at(), Some(200));
        assert!(svc.clear(&hw, &evt, 2, TASK_B));
        assert_eq!(hw.armed_at(), None);
        // Clearing again is a no-op.
        assert!(!svc.clear(&hw, &evt, 2, TASK_B));
    }

    #[test]
    fn rearming_over_an_elapsed_deadline_raises_event() {
        let (mut svc, hw, evt, _sent) = fixture();
        svc.set(&hw, &evt, 1, TASK_A, 5).unwrap();
        svc.set(&hw, &evt, 2, TASK_A, 6).unwrap();
        // The compare interrupt for timer 2 is lost while timer 1, the head,
        // gets pushed out; the re-arm must notice the elapsed deadline.
        hw.set_now(7);
        svc.set(&hw, &evt, 1, TASK_A, 100).unwrap();
        assert!(evt.is_set(EVT_TIMER));
    }

    #[test]
    fn clearing_the_head_over_an_elapsed_deadline_raises_event() {
        let (mut svc, hw, evt, _sent) = fixture();
        svc.set(&hw, &evt, 1, TASK_A, 5).unwrap();
        svc.set(&hw, &evt, 2, TASK_A, 6).unwrap();
        hw.set_now(7);
        svc.clear(&hw, &evt, 1, TASK_A);
        assert!(evt.is_set(EVT_TIMER));
    }

    #[test]
    fn capacity_is_bounded() {
        let hw = FakeClock::new();
        let evt = EventFlags::new();
        let mut svc = TimerService::new(1, 2);
        svc.set(&hw, &evt, 1, TASK_A, 10).unwrap();
        svc.set(&hw, &evt, 2, TASK_A, 20).unwrap();
        assert_eq!(svc.set(&hw, &evt, 3, TASK_A, 30), Err(Error::Full));
        // Re-setting an existing timer does not count against the cap.
        svc.set(&hw, &evt, 1, TASK_A, 40).unwrap();
    }

    #[test]
    fn wraparound_deadline_fires() {
        let (mut svc, hw, evt, sent) = fixture();
        hw.set_now(0xfff0);
        svc.set(&hw, &evt, 1, TASK_A, 0x20).unwrap();
        assert_eq!(hw.armed_at(), Some(0x0010));
        hw.set_now(0x0011);
        svc.schedule(&hw, &evt, &sent);
        assert_eq!(fire_ids(&sent), [1]);
    }
}
