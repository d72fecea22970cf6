//! # `wmac-kernel`
//! The cooperative heart of a Wi-Fi MAC firmware: a message-passing task
//! kernel plus the originator side of 802.11e block-ack session management.
//!
//! ## Kernel overview
//! All MAC work runs in a single dispatch context. Interrupt handlers never
//! call into protocol code; they push a [msg::Message] onto the sent queue
//! (or raise an event bit) and return. The dispatch loop waits on
//! [sync::EventFlags], pops messages one at a time and hands them to the
//! handler registered for the destination task's current state in a
//! [task::TaskTable]. A handler that cannot deal with a message in the
//! current state returns it as saved; the kernel parks it and replays it
//! automatically on the next state change of that task.
//!
//! Software timers ([kernel::Kernel::timer_set]) are multiplexed over a
//! single hardware compare timer behind the [time::TimerHw] trait. Time is a
//! wrapping 16-bit count of 802.11 time units; see [time::TimeTu] for the
//! modular comparison rules.
//!
//! ## Block-ack management
//! The [bam] module rides on top of the kernel: every agreement slot is one
//! task instance, so the Idle/WaitRsp/Active life cycle is ordinary task
//! state and the ADDBA-response and inactivity timeouts are ordinary kernel
//! timers. The transmit path feeds it through [bam::Bam::on_data_enqueue] and
//! [bam::Bam::on_tx_complete] and gets flow-control credits back as the
//! block-ack window slides.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub(crate) mod fmt;

pub mod bam;
pub mod kernel;
pub mod list;
pub mod msg;
pub mod queue;
pub mod sync;
pub mod task;
pub mod time;
pub mod timer;

#[cfg(not(feature = "critical_section"))]
pub(crate) type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(feature = "critical_section")]
pub(crate) type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

/// Errors returned by the kernel and the BAM.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A fixed-capacity resource (timers, agreement slots) is exhausted.
    Full,
    /// The task type or instance index is not registered.
    InvalidTask,
    /// Timer delay of zero, or at or past [time::DELAY_MAX].
    InvalidDelay,
    /// Sequence number outside the block-ack window.
    OutOfWindow,
    /// Malformed or duplicate argument.
    InvalidParam,
}

pub type MacResult<T> = Result<T, Error>;

pub use bam::{Bam, BamConfig, BamContext, BamParts, TxOutcome};
pub use kernel::{Kernel, KernelConfig};
pub use msg::{Message, MsgId, TaskRef};
pub use task::{KernelAccess, MsgStatus, TaskDesc, TaskTable};
pub use time::{TimeTu, TimerHw};
