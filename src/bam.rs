//! Originator-side 802.11e Block-Acknowledgement management.
//!
//! Each of the [BAM_IDX_MAX] slots tracks one `(station, TID)` agreement and
//! runs as one instance of a kernel task, so the Idle/WaitRsp/Active life
//! cycle lives in the kernel's per-instance states and the two protocol
//! timeouts arrive as ordinary kernel messages.

use crate::{
    kernel::Kernel,
    msg::{msg_id, Message, TaskRef},
    task::{KernelAccess, MsgHandler, MsgStatus, TaskDesc},
    time::TimeTu,
    Error, MacResult,
};
use alloc::{boxed::Box, vec};
use bitfield_struct::bitfield;

/// Number of block-ack agreements that can exist at once.
pub const BAM_IDX_MAX: usize = 8;
/// Largest transmit window we ever negotiate.
pub const MAX_TX_WIN_SIZE: usize = 64;
/// 802.11 sequence numbers live in a 4096-wide space.
pub const SN_MASK: u16 = 0xfff;

const MSG_ADDBA_RSP_TIMEOUT: u8 = 0;
const MSG_INACTIVITY_TIMEOUT: u8 = 1;

/// Station index within the station management tables.
pub type StaId = u8;

/// Life cycle of one agreement slot, stored as the kernel task state of the
/// slot's task instance.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BamState {
    Idle = 0,
    WaitRsp = 1,
    Active = 2,
}
impl BamState {
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::WaitRsp,
            2 => Self::Active,
            _ => Self::Idle,
        }
    }
}

/// Per-sequence-number slot state inside the transmit window.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BawState {
    Free,
    Pending,
    Confirmed,
}

/// The block-ack transmit window.
///
/// A circular buffer over `buf_size` consecutive sequence numbers starting at
/// `fsn`. The window only moves forward over confirmed slots, so a hole left
/// by an unconfirmed frame blocks every later frame's credit until it is
/// confirmed (or given up on).
pub struct BlockAckWindow {
    fsn: u16,
    fsn_idx: usize,
    buf_size: usize,
    states: [BawState; MAX_TX_WIN_SIZE],
}

impl BlockAckWindow {
    pub const fn new() -> Self {
        Self {
            fsn: 0,
            fsn_idx: 0,
            buf_size: MAX_TX_WIN_SIZE,
            states: [BawState::Free; MAX_TX_WIN_SIZE],
        }
    }
    /// Reset the window to start at `ssn` with the given size.
    pub fn init(&mut self, ssn: u16, buf_size: usize) {
        self.fsn = ssn & SN_MASK;
        self.fsn_idx = 0;
        self.buf_size = buf_size.clamp(1, MAX_TX_WIN_SIZE);
        self.states = [BawState::Free; MAX_TX_WIN_SIZE];
    }
    /// First (oldest not yet released) sequence number of the window.
    pub fn fsn(&self) -> u16 {
        self.fsn
    }
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }
    /// Mark the slot of sequence number `sn`.
    pub fn set_state(&mut self, sn: u16, state: BawState) -> MacResult<()> {
        let offset = (sn.wrapping_sub(self.fsn) & SN_MASK) as usize;
        if offset >= self.buf_size {
            return Err(Error::OutOfWindow);
        }
        self.states[(self.fsn_idx + offset) % self.buf_size] = state;
        Ok(())
    }
    /// Slide the window over every leading confirmed slot, freeing them.
    /// Returns the number of slots released.
    pub fn advance(&mut self) -> u8 {
        let mut credits = 0;
        while self.states[self.fsn_idx] == BawState::Confirmed {
            self.states[self.fsn_idx] = BawState::Free;
            self.fsn = self.fsn.wrapping_add(1) & SN_MASK;
            self.fsn_idx = (self.fsn_idx + 1) % self.buf_size;
            credits += 1;
        }
        credits
    }
    /// Free every slot regardless of state. Returns the number of confirmed
    /// slots whose credits were still held back behind a hole; pending slots
    /// settle through their own completions and are not counted.
    pub fn flush(&mut self) -> u8 {
        let held = self
            .states
            .iter()
            .take(self.buf_size)
            .filter(|s| **s == BawState::Confirmed)
            .count() as u8;
        self.states = [BawState::Free; MAX_TX_WIN_SIZE];
        held
    }
}

impl Default for BlockAckWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Block Ack Parameter Set field of ADDBA frames.
#[bitfield(u16)]
pub struct BaParamSet {
    pub amsdu: bool,
    /// true for immediate block ack, false for delayed.
    pub policy: bool,
    #[bits(4)]
    pub tid: u8,
    #[bits(10)]
    pub buffer_size: u16,
}

/// DELBA parameter field.
#[bitfield(u16)]
pub struct DelbaParam {
    #[bits(11)]
    __: u16,
    /// Set when the sender of the DELBA is the data originator.
    pub initiator: bool,
    #[bits(4)]
    pub tid: u8,
}

/// 802.11 reason codes carried in DELBA frames.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum DelbaReason {
    EndBa = 37,
    UnknownBa = 38,
    Timeout = 39,
}

/// Contents of an ADDBA request handed to the frame transmitter.
pub struct AddbaReq {
    pub dialog_token: u8,
    pub param: BaParamSet,
    /// Negotiated inactivity timeout in TU, 0 for none.
    pub timeout: u16,
    pub ssn: u16,
}

/// Per-frame transmit descriptor fields the BAM reads and stamps.
#[derive(Clone, Copy, Debug)]
pub struct TxFrame {
    pub sta: StaId,
    pub tid: u8,
    pub sn: u16,
    /// Packet number, used by the caller to requeue retries.
    pub pn: u64,
    pub ampdu: bool,
    pub under_ba: bool,
    pub retry: bool,
    /// Window start captured at enqueue time.
    pub sn_win: u16,
    /// Give-up time for retries.
    pub deadline: TimeTu,
}
impl TxFrame {
    pub fn new(sta: StaId, tid: u8, sn: u16, pn: u64) -> Self {
        Self {
            sta,
            tid,
            sn,
            pn,
            ampdu: false,
            under_ba: false,
            retry: false,
            sn_win: 0,
            deadline: TimeTu(0),
        }
    }
}

/// What the transmit path should do after a transmission attempt resolved.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxOutcome {
    /// Release this many transmit credits to the flow control.
    Credits(u8),
    /// Requeue the frame for another attempt before `deadline`.
    Retry { pn: u64, sn: u16, deadline: TimeTu },
}

/// Lookups into the station management tables the BAM depends on.
pub trait StationTable {
    fn tx_bam_idx(&self, sta: StaId, tid: u8) -> Option<u8>;
    fn set_tx_bam_idx(&mut self, sta: StaId, tid: u8, idx: Option<u8>);
    fn rx_bam_idx(&self, sta: StaId, tid: u8) -> Option<u8>;
    fn set_rx_bam_idx(&mut self, sta: StaId, tid: u8, idx: Option<u8>);
    fn last_tx_time(&self, sta: StaId, tid: u8) -> TimeTu;
    fn set_last_tx_time(&mut self, sta: StaId, tid: u8, time: TimeTu);
    fn last_addba_time(&self, sta: StaId, tid: u8) -> TimeTu;
    fn set_last_addba_time(&mut self, sta: StaId, tid: u8, time: TimeTu);
    fn in_power_save(&self, sta: StaId) -> bool;
    fn aggregation_allowed(&self, sta: StaId) -> bool;
}

/// Outgoing management frames the BAM emits.
pub trait FrameTx {
    fn send_addba_req(&mut self, sta: StaId, req: &AddbaReq);
    fn send_delba(&mut self, sta: StaId, param: DelbaParam, reason: DelbaReason);
}

/// Tuning knobs for the BAM.
#[derive(Clone, Copy, Debug)]
pub struct BamConfig {
    /// How long to wait for an ADDBA response, in TU.
    pub response_timeout: u16,
    /// Agreement is torn down after this long without traffic, in TU.
    pub inactivity_timeout: u16,
    /// Minimum spacing between ADDBA requests to the same `(sta, TID)`.
    pub addba_req_interval: u16,
    /// A new agreement is only attempted while frames for the flow were seen
    /// within this window.
    pub agg_detect_duration: u16,
    /// Retry give-up horizon stamped on frames at enqueue, in TU.
    pub tx_lifetime: u16,
    pub token_seed: u8,
}
impl Default for BamConfig {
    fn default() -> Self {
        Self {
            response_timeout: 100,
            inactivity_timeout: 5000,
            addba_req_interval: 5000,
            agg_detect_duration: 30,
            tx_lifetime: 512,
            token_seed: 1,
        }
    }
}

struct BamSlot {
    sta: Option<StaId>,
    tid: u8,
    dialog_token: u8,
    /// Immediate (true) or delayed block ack.
    policy: bool,
    /// Inactivity horizon for this agreement, in TU.
    ba_timeout: u16,
    ssn: u16,
    /// Frames enqueued under this agreement and not yet resolved.
    pkt_cnt: u16,
    last_activity: TimeTu,
    baw: BlockAckWindow,
}
impl BamSlot {
    const EMPTY: Self = Self {
        sta: None,
        tid: 0,
        dialog_token: 0,
        policy: false,
        ba_timeout: 0,
        ssn: 0,
        pkt_cnt: 0,
        last_activity: TimeTu(0),
        baw: BlockAckWindow::new(),
    };
}

/// The Block-Acknowledgement Manager.
pub struct Bam {
    slots: [BamSlot; BAM_IDX_MAX],
    cfg: BamConfig,
    task_type: u8,
    token: u8,
}

impl Bam {
    pub fn new(task_type: u8, cfg: BamConfig) -> Self {
        Self {
            slots: [BamSlot::EMPTY; BAM_IDX_MAX],
            cfg,
            task_type,
            token: cfg.token_seed,
        }
    }
    /// Register the BAM task with the kernel. Call once before anything else.
    pub fn init(&mut self, ke: &mut Kernel) -> MacResult<()> {
        ke.register_task(self.task_type, BAM_IDX_MAX)
    }
    pub fn task_type(&self) -> u8 {
        self.task_type
    }
    fn task(&self, idx: u8) -> TaskRef {
        TaskRef::new(self.task_type, idx)
    }
    fn state(&self, ke: &Kernel, idx: u8) -> BamState {
        BamState::from_bits(ke.state_get(self.task(idx)).unwrap_or(0))
    }
    fn next_token(&mut self) -> u8 {
        self.token = self.token.wrapping_mul(197).wrapping_add(61);
        self.token
    }
    /// Start a new agreement for `(sta, tid)`: allocate a slot, send the
    /// ADDBA request and wait for the response.
    pub fn create(
        &mut self,
        ke: &mut Kernel,
        stations: &mut dyn StationTable,
        frames: &mut dyn FrameTx,
        sta: StaId,
        tid: u8,
        ssn: u16,
    ) -> MacResult<u8> {
        let idx = (0..BAM_IDX_MAX as u8)
            .find(|idx| self.state(ke, *idx) == BamState::Idle)
            .ok_or(Error::Full)?;
        let token = self.next_token();
        let now = ke.now();
        let ssn = ssn & SN_MASK;
        let slot = &mut self.slots[idx as usize];
        slot.sta = Some(sta);
        slot.tid = tid;
        slot.dialog_token = token;
        slot.policy = true;
        slot.ba_timeout = self.cfg.inactivity_timeout;
        slot.ssn = ssn;
        slot.pkt_cnt = 0;
        slot.last_activity = now;
        slot.baw.init(ssn, MAX_TX_WIN_SIZE);
        let policy = slot.policy;
        // The timer and state must be in place before anything leaves the
        // device; otherwise a failure here would strand a half-built
        // agreement behind a live station mapping.
        let armed = ke
            .timer_set(
                msg_id(self.task_type, MSG_ADDBA_RSP_TIMEOUT),
                self.task(idx),
                self.cfg.response_timeout,
            )
            .and_then(|()| ke.state_set(self.task(idx), BamState::WaitRsp.into_bits()));
        if let Err(err) = armed {
            ke.timer_clear(msg_id(self.task_type, MSG_ADDBA_RSP_TIMEOUT), self.task(idx));
            self.slots[idx as usize].sta = None;
            return Err(err);
        }
        stations.set_tx_bam_idx(sta, tid, Some(idx));
        frames.send_addba_req(
            sta,
            &AddbaReq {
                dialog_token: token,
                param: BaParamSet::new()
                    .with_policy(policy)
                    .with_tid(tid)
                    .with_buffer_size(MAX_TX_WIN_SIZE as u16),
                timeout: self.cfg.inactivity_timeout,
                ssn,
            },
        );
        stations.set_last_addba_time(sta, tid, now);
        debug!("BA agreement {} requested for sta {} tid {}", idx, sta, tid);
        Ok(idx)
    }
    fn admission_ok(
        &self,
        ke: &Kernel,
        stations: &dyn StationTable,
        sta: StaId,
        tid: u8,
    ) -> bool {
        let now = ke.now();
        stations
            .last_addba_time(sta, tid)
            .add(self.cfg.addba_req_interval)
            .is_past(now)
            && now.is_before(
                stations
                    .last_tx_time(sta, tid)
                    .add(self.cfg.agg_detect_duration),
            )
            && !stations.in_power_save(sta)
    }
    /// Hook for every data frame entering the transmit path.
    ///
    /// Under an active agreement the frame is stamped for aggregation and its
    /// sequence number reserved in the window. Without one, steady traffic on
    /// the flow triggers an agreement attempt.
    pub fn on_data_enqueue(
        &mut self,
        ke: &mut Kernel,
        stations: &mut dyn StationTable,
        frames: &mut dyn FrameTx,
        frame: &mut TxFrame,
    ) {
        if !stations.aggregation_allowed(frame.sta) {
            return;
        }
        if let Some(idx) = stations.tx_bam_idx(frame.sta, frame.tid) {
            // WaitRsp: leave the frame alone, the agreement is not up yet.
            if self.state(ke, idx) == BamState::Active {
                let now = ke.now();
                let lifetime = self.cfg.tx_lifetime;
                let slot = &mut self.slots[idx as usize];
                slot.last_activity = now;
                frame.sn_win = slot.baw.fsn();
                frame.ampdu = true;
                frame.under_ba = true;
                if !frame.retry {
                    frame.deadline = now.add(lifetime);
                }
                if slot.baw.set_state(frame.sn, BawState::Pending).is_err() {
                    warn!("SN {} outside BA window, sent unaggregated", frame.sn);
                    frame.ampdu = false;
                    frame.under_ba = false;
                } else {
                    slot.pkt_cnt += 1;
                }
            }
        } else if self.admission_ok(ke, stations, frame.sta, frame.tid) {
            // All slots busy just means no aggregation for this flow yet.
            let _ = self.create(ke, stations, frames, frame.sta, frame.tid, frame.sn);
        }
        stations.set_last_tx_time(frame.sta, frame.tid, ke.now());
    }
    /// Feed a received ADDBA response in.
    pub fn on_addba_rsp(
        &mut self,
        ke: &mut Kernel,
        stations: &mut dyn StationTable,
        sta: StaId,
        dialog_token: u8,
        status: u16,
        param: BaParamSet,
    ) {
        let tid = param.tid();
        let Some(idx) = stations.tx_bam_idx(sta, tid) else {
            return;
        };
        if self.state(ke, idx) != BamState::WaitRsp {
            return;
        }
        if self.slots[idx as usize].dialog_token != dialog_token {
            warn!("ADDBA response with stale dialog token {}", dialog_token);
            return;
        }
        ke.timer_clear(msg_id(self.task_type, MSG_ADDBA_RSP_TIMEOUT), self.task(idx));
        if status != 0 {
            debug!("ADDBA refused ({}) for sta {} tid {}", status, sta, tid);
            let _ = self.delete(ke, stations, idx);
            return;
        }
        let negotiated = match param.buffer_size() {
            0 => MAX_TX_WIN_SIZE,
            n => (n as usize).min(MAX_TX_WIN_SIZE),
        };
        let now = ke.now();
        let slot = &mut self.slots[idx as usize];
        slot.baw.init(slot.ssn, negotiated);
        slot.last_activity = now;
        // Ignoring state/timer errors here would hide kernel misuse; the
        // task was registered in init() so neither can fail.
        let _ = ke.state_set(self.task(idx), BamState::Active.into_bits());
        let _ = ke.timer_set(
            msg_id(self.task_type, MSG_INACTIVITY_TIMEOUT),
            self.task(idx),
            self.cfg.inactivity_timeout,
        );
        debug!(
            "BA agreement {} active for sta {} tid {}, window {}",
            idx, sta, tid, negotiated
        );
    }
    /// Resolve a transmission attempt and compute what the transmit path owes
    /// the flow control.
    pub fn on_tx_complete(
        &mut self,
        ke: &mut Kernel,
        stations: &mut dyn StationTable,
        frame: &TxFrame,
        success: bool,
    ) -> TxOutcome {
        if !frame.under_ba {
            return TxOutcome::Credits(1);
        }
        let Some(idx) = stations.tx_bam_idx(frame.sta, frame.tid) else {
            return TxOutcome::Credits(1);
        };
        if self.state(ke, idx) != BamState::Active {
            return TxOutcome::Credits(1);
        }
        let now = ke.now();
        let slot = &mut self.slots[idx as usize];
        slot.pkt_cnt = slot.pkt_cnt.saturating_sub(1);
        if frame.ampdu && !success && !frame.deadline.is_past(now) {
            return TxOutcome::Retry {
                pn: frame.pn,
                sn: frame.sn,
                deadline: frame.deadline,
            };
        }
        // Success, or a failure past its lifetime: either way the slot is
        // done and the window may move.
        if slot.baw.set_state(frame.sn, BawState::Confirmed).is_err() {
            return TxOutcome::Credits(1);
        }
        slot.last_activity = now;
        TxOutcome::Credits(slot.baw.advance())
    }
    /// Tear an agreement down. Idempotent; returns the number of confirmed
    /// window slots whose credits had not been released yet.
    pub fn delete(
        &mut self,
        ke: &mut Kernel,
        stations: &mut dyn StationTable,
        idx: u8,
    ) -> u8 {
        if self.state(ke, idx) == BamState::Idle {
            return 0;
        }
        ke.timer_clear(msg_id(self.task_type, MSG_ADDBA_RSP_TIMEOUT), self.task(idx));
        ke.timer_clear(msg_id(self.task_type, MSG_INACTIVITY_TIMEOUT), self.task(idx));
        let slot = &mut self.slots[idx as usize];
        let flushed = slot.baw.flush();
        if let Some(sta) = slot.sta.take() {
            stations.set_tx_bam_idx(sta, slot.tid, None);
            debug!("BA agreement {} deleted for sta {} tid {}", idx, sta, slot.tid);
        }
        slot.pkt_cnt = 0;
        let _ = ke.state_set(self.task(idx), BamState::Idle.into_bits());
        flushed
    }
    /// Tear down every agreement with `sta`, e.g. on disassociation.
    pub fn delete_all(&mut self, ke: &mut Kernel, stations: &mut dyn StationTable, sta: StaId) {
        for idx in 0..BAM_IDX_MAX as u8 {
            if self.slots[idx as usize].sta == Some(sta) {
                self.delete(ke, stations, idx);
            }
        }
    }
    /// Feed a received DELBA in.
    pub fn on_delba(
        &mut self,
        ke: &mut Kernel,
        stations: &mut dyn StationTable,
        sta: StaId,
        param: DelbaParam,
    ) {
        let tid = param.tid();
        if param.initiator() {
            // Peer originated that agreement; only the receive-side mapping
            // is ours to drop.
            stations.set_rx_bam_idx(sta, tid, None);
        } else if let Some(idx) = stations.tx_bam_idx(sta, tid) {
            self.delete(ke, stations, idx);
        }
    }
    fn rsp_timeout(&mut self, ke: &mut Kernel, stations: &mut dyn StationTable, idx: u8) {
        if self.state(ke, idx) == BamState::WaitRsp {
            warn!("No ADDBA response for agreement {}", idx);
            self.delete(ke, stations, idx);
        }
    }
    fn inactivity_timeout(
        &mut self,
        ke: &mut Kernel,
        stations: &mut dyn StationTable,
        frames: &mut dyn FrameTx,
        idx: u8,
    ) {
        if self.state(ke, idx) != BamState::Active {
            return;
        }
        let slot = &self.slots[idx as usize];
        let expired =
            slot.pkt_cnt == 0 && slot.last_activity.add(slot.ba_timeout).is_past(ke.now());
        if expired {
            if let Some(sta) = slot.sta {
                let tid = slot.tid;
                frames.send_delba(
                    sta,
                    DelbaParam::new().with_initiator(true).with_tid(tid),
                    DelbaReason::Timeout,
                );
            }
            self.delete(ke, stations, idx);
        } else {
            let _ = ke.timer_set(
                msg_id(self.task_type, MSG_INACTIVITY_TIMEOUT),
                self.task(idx),
                self.cfg.inactivity_timeout,
            );
        }
    }
}

/// Context the BAM's message handlers run against.
pub trait BamContext: KernelAccess {
    fn parts(&mut self) -> BamParts<'_>;
}

/// Split borrow of everything a BAM handler touches.
pub struct BamParts<'a> {
    pub ke: &'a mut Kernel,
    pub bam: &'a mut Bam,
    pub stations: &'a mut dyn StationTable,
    pub frames: &'a mut dyn FrameTx,
}

fn addba_rsp_timeout_handler<C: BamContext>(ctx: &mut C, msg: Box<Message>) -> MsgStatus {
    let idx = msg.dest.idx;
    let BamParts {
        ke, bam, stations, ..
    } = ctx.parts();
    bam.rsp_timeout(ke, stations, idx);
    MsgStatus::Consumed
}

fn inactivity_timeout_handler<C: BamContext>(ctx: &mut C, msg: Box<Message>) -> MsgStatus {
    let idx = msg.dest.idx;
    let BamParts {
        ke,
        bam,
        stations,
        frames,
    } = ctx.parts();
    bam.inactivity_timeout(ke, stations, frames, idx);
    MsgStatus::Consumed
}

/// Handler tables for the BAM task, one per [BamState].
pub fn task_desc<C: BamContext>(task_type: u8) -> TaskDesc<C> {
    TaskDesc {
        state_handlers: vec![
            // Idle: stale timeouts are dropped by dispatch.
            vec![],
            vec![MsgHandler {
                id: msg_id(task_type, MSG_ADDBA_RSP_TIMEOUT),
                func: addba_rsp_timeout_handler::<C>,
            }],
            vec![
                MsgHandler {
                    id: msg_id(task_type, MSG_INACTIVITY_TIMEOUT),
                    func: inactivity_timeout_handler::<C>,
                },
                // A late ADDBA response timeout can still be queued when the
                // agreement goes active; swallow it.
                MsgHandler {
                    id: msg_id(task_type, MSG_ADDBA_RSP_TIMEOUT),
                    func: |_, _| MsgStatus::Consumed,
                },
            ],
        ],
        default_handlers: vec![],
        idx_max: BAM_IDX_MAX,
    }
}
