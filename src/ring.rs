//! The DMA control-block ring: a fixed arena of descriptors in DMA-coherent
//! memory, written by the CPU and chased by the DMA engine.
//!
//! Synchronization is by position, not by lock. The writer tracks its own
//! slot and lap (`cb_head`, `cb_lap`) and infers the reader's lap from
//! monotonically decreasing samples of the channel's current-block register.
//! The only stores the reader can observe mid-flight are single-word writes
//! to a block's `next` field: 0 → address publishes a follow-on batch,
//! address → 0 terminates one.

use std::sync::atomic::{fence, Ordering};
use std::thread;
use std::time::Duration;

use crate::hw::regs::{cb_permap, CB_DEST_DREQ, PERMAP_PWM, TI_BASE};
use crate::wave::Transition;

/// One BCM283x DMA control block: eight 32-bit words, 32-byte aligned, read
/// by the engine at its bus address. The last two words are reserved.
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlBlock {
    pub ti: u32,
    pub source_ad: u32,
    pub dest_ad: u32,
    pub txfr_len: u32,
    pub stride: u32,
    pub next_cb: u32,
    _reserved: [u32; 2],
}

pub const CB_SIZE: u32 = std::mem::size_of::<ControlBlock>() as u32;
/// Control blocks per 4096-byte page.
pub const CBS_PER_PAGE: usize = 4096 / CB_SIZE as usize;

/// The TXFR_LEN field is 30 bits; longer delays are emitted as chains.
pub const XFER_LEN_MAX: u32 = 0x3FFF_FFFF;
const DELAY_BLOCK_MAX_US: u32 = XFER_LEN_MAX / 4;

/// How long the writer sleeps between reader-position samples.
const POLL: Duration = Duration::from_millis(1);

/// The live DMA channel as the ring writer sees it. `Peripherals` implements
/// this against the real registers; tests drive the ring with a scripted
/// engine instead.
pub trait DmaChannel {
    fn dma_active(&self) -> bool;
    /// Index of the block the engine is currently executing. Only ordering
    /// relative to writer positions matters; the value is garbage once the
    /// channel halts.
    fn dma_current_index(&self) -> u32;
    fn start_dma(&mut self, index: u32);
}

/// Bus addresses of the peripheral registers the emitted blocks target.
#[derive(Debug, Clone, Copy)]
pub struct BusTargets {
    pub gpio_set: u32,
    pub gpio_clr: u32,
    pub pwm_fifo: u32,
}

/// Writer state over the control-block arena and its command-word array.
pub struct CbRing {
    cbs: *mut ControlBlock,
    cbs_bus: u32,
    capacity: u32,
    cmds: *mut u32,
    cmds_bus: u32,
    cmd_capacity: u32,
    targets: BusTargets,
    cb_head: u32,
    cmd_head: u32,
    cb_lap: u32,
    dma_lap: u32,
    dma_last_seen: u32,
}

impl CbRing {
    /// Build a ring over `capacity` blocks at `cbs`/`cbs_bus` and
    /// `cmd_capacity` command words at `cmds`/`cmds_bus`.
    ///
    /// # Safety
    ///
    /// Both regions must stay valid and exclusively owned by this ring (and
    /// the DMA engine) for its lifetime, and each bus address must be the
    /// engine's view of the same memory the pointer addresses.
    pub unsafe fn new(
        cbs: *mut ControlBlock,
        cbs_bus: u32,
        capacity: u32,
        cmds: *mut u32,
        cmds_bus: u32,
        cmd_capacity: u32,
        targets: BusTargets,
    ) -> Self {
        Self {
            cbs,
            cbs_bus,
            capacity,
            cmds,
            cmds_bus,
            cmd_capacity,
            targets,
            cb_head: 0,
            cmd_head: 0,
            cb_lap: 0,
            dma_lap: 0,
            dma_last_seen: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bus address of block `i`, as programmed into `next` fields.
    fn block_bus(&self, i: u32) -> u32 {
        self.cbs_bus + i * CB_SIZE
    }

    fn cmd_bus(&self, i: u32) -> u32 {
        self.cmds_bus + i * 4
    }

    fn write_block(&mut self, i: u32, block: ControlBlock) {
        debug_assert!(i < self.capacity);
        unsafe { self.cbs.add(i as usize).write_volatile(block) };
    }

    /// The single-word store the reader is allowed to observe mid-flight.
    fn set_next(&mut self, i: u32, next: u32) {
        unsafe {
            let block = self.cbs.add(i as usize);
            std::ptr::addr_of_mut!((*block).next_cb).write_volatile(next);
        }
    }

    /// Forget all writer progress (end of a play).
    pub fn reset(&mut self) {
        self.cb_head = 0;
        self.cmd_head = 0;
        self.cb_lap = 0;
        self.dma_lap = 0;
        self.dma_last_seen = 0;
    }

    /// Sample the reader position, counting a lap when it moves backwards.
    fn observe_reader(&mut self, ch: &impl DmaChannel) {
        let now = ch.dma_current_index();
        if now < self.dma_last_seen {
            self.dma_lap += 1;
        }
        self.dma_last_seen = now;
    }

    /// Block until slot `i` is safely behind the reader. Only relevant while
    /// the writer is one lap ahead; a halted reader cannot be overtaken.
    ///
    /// Every position sample flows through `observe_reader` so a wrap is
    /// never missed between checks.
    fn wait_for_slot(&mut self, i: u32, ch: &impl DmaChannel) {
        while self.cb_lap == self.dma_lap + 1 {
            self.observe_reader(ch);
            if self.cb_lap != self.dma_lap + 1 || self.dma_last_seen > i {
                break;
            }
            if !ch.dma_active() {
                self.dma_lap = self.cb_lap;
                break;
            }
            thread::sleep(POLL);
        }
    }

    /// Wrap the writer to slot 0, waiting for the reader to wrap first if it
    /// is still a lap behind.
    fn recycle(&mut self, ch: &impl DmaChannel) {
        log::debug!(
            "ring wrap: lap {} -> {}, waiting behind reader",
            self.cb_lap,
            self.cb_lap + 1
        );
        if self.cb_head > 0 {
            self.set_next(self.cb_head - 1, self.block_bus(0));
        }
        while self.cb_lap == self.dma_lap + 1 {
            if !ch.dma_active() {
                self.dma_lap = self.cb_lap;
                break;
            }
            thread::sleep(POLL);
            self.observe_reader(ch);
        }
        self.cb_head = 0;
        self.cmd_head = 0;
        self.cb_lap += 1;
    }

    fn delay_blocks(delay_us: u32) -> u32 {
        if delay_us == 0 {
            1
        } else {
            delay_us.div_ceil(DELAY_BLOCK_MAX_US)
        }
    }

    fn blocks_for(t: &Transition) -> u32 {
        1 + Self::delay_blocks(t.delay_us)
    }

    /// Emit a combined timeline into the ring, chunking it if its block
    /// count exceeds the whole arena.
    pub fn transmit<C: DmaChannel>(&mut self, timeline: &[Transition], ch: &mut C) {
        let mut start = 0;
        while start < timeline.len() {
            let end = self.batch_end(timeline, start);
            self.transmit_batch(&timeline[start..end], ch);
            start = end;
        }
    }

    /// Largest prefix of `timeline[start..]` that fits the arena in one lap.
    fn batch_end(&self, timeline: &[Transition], start: usize) -> usize {
        let mut blocks = 0u32;
        let mut n = 0usize;
        for t in &timeline[start..] {
            let b = Self::blocks_for(t);
            if blocks + b > self.capacity || n as u32 + 1 > self.cmd_capacity {
                break;
            }
            blocks += b;
            n += 1;
        }
        debug_assert!(n > 0, "single transition larger than the whole ring");
        start + n.max(1)
    }

    /// Emit one batch: per transition, an edge block (a 4-byte copy of the
    /// command word to GPIO set/clear) followed by DREQ-paced delay blocks
    /// into the PWM FIFO. The batch tail halts; the previous tail is then
    /// linked to it in a single published store.
    fn transmit_batch<C: DmaChannel>(&mut self, batch: &[Transition], ch: &mut C) {
        let running = ch.dma_active();
        if !running {
            self.cb_head = 0;
            self.cmd_head = 0;
        }

        let blocks: u32 = batch.iter().map(Self::blocks_for).sum();
        debug_assert!(blocks <= self.capacity);
        if self.cb_head + blocks > self.capacity
            || self.cmd_head + batch.len() as u32 > self.cmd_capacity
        {
            self.recycle(ch);
        }

        let first = self.cb_head;
        let prev_tail = (self.cb_head > 0).then(|| self.cb_head - 1);

        for t in batch {
            self.wait_for_slot(self.cb_head, ch);
            unsafe {
                self.cmds
                    .add(self.cmd_head as usize)
                    .write_volatile(t.on_mask | t.off_mask)
            };
            let dest = if t.on_mask != 0 {
                self.targets.gpio_set
            } else {
                self.targets.gpio_clr
            };
            let head = self.cb_head;
            self.write_block(
                head,
                ControlBlock {
                    ti: TI_BASE,
                    source_ad: self.cmd_bus(self.cmd_head),
                    dest_ad: dest,
                    txfr_len: 4,
                    stride: 0,
                    next_cb: self.block_bus(head + 1),
                    _reserved: [0; 2],
                },
            );
            self.cb_head += 1;

            let mut remaining = t.delay_us;
            loop {
                let chunk = remaining.min(DELAY_BLOCK_MAX_US);
                self.wait_for_slot(self.cb_head, ch);
                let head = self.cb_head;
                self.write_block(
                    head,
                    ControlBlock {
                        ti: TI_BASE | CB_DEST_DREQ | cb_permap(PERMAP_PWM),
                        // Source data is irrelevant: DREQ-paced copies into
                        // the FIFO are rate limiters, not data.
                        source_ad: self.cmd_bus(0),
                        dest_ad: self.targets.pwm_fifo,
                        txfr_len: 4 * chunk,
                        stride: 0,
                        next_cb: self.block_bus(head + 1),
                        _reserved: [0; 2],
                    },
                );
                self.cb_head += 1;
                remaining -= chunk;
                if remaining == 0 {
                    break;
                }
            }
            self.cmd_head += 1;
        }

        // Halt at the new tail, then publish: the previous tail's next is
        // rewritten only after every block body is in memory.
        self.set_next(self.cb_head - 1, 0);
        fence(Ordering::Release);
        if let Some(tail) = prev_tail {
            self.set_next(tail, self.block_bus(first));
        }

        if !running {
            ch.start_dma(first);
        } else if !ch.dma_active() {
            // The reader drained the old tail while we were writing and
            // halted just before the link landed; restart it on the batch.
            ch.start_dma(first);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::regs::CB_NO_WIDE_BURSTS;
    use std::cell::{Cell, RefCell};

    const CBS_BUS: u32 = 0x4000_0000;
    const CMDS_BUS: u32 = 0x4800_0000;
    const TARGETS: BusTargets = BusTargets {
        gpio_set: 0x7E20_001C,
        gpio_clr: 0x7E20_0028,
        pwm_fifo: 0x7E20_C018,
    };

    /// A software DMA engine chasing the arena the ring writes, advancing
    /// one block per position poll and logging everything it consumes.
    struct SimDma {
        cbs: *const ControlBlock,
        cmds: *const u32,
        active: Cell<bool>,
        cur: Cell<u32>,
        consumed: RefCell<Vec<(ControlBlock, Option<u32>)>>,
        starts: RefCell<Vec<u32>>,
    }

    impl SimDma {
        fn tick(&self) {
            if !self.active.get() {
                return;
            }
            let i = self.cur.get();
            let block = unsafe { self.cbs.add(i as usize).read_volatile() };
            let cmd = (block.source_ad >= CMDS_BUS && block.dest_ad != TARGETS.pwm_fifo)
                .then(|| unsafe {
                    self.cmds
                        .add(((block.source_ad - CMDS_BUS) / 4) as usize)
                        .read_volatile()
                });
            self.consumed.borrow_mut().push((block, cmd));
            if block.next_cb == 0 {
                self.active.set(false);
            } else {
                self.cur.set((block.next_cb - CBS_BUS) / CB_SIZE);
            }
        }

        fn drain(&self) {
            let mut guard = 0;
            while self.active.get() {
                self.tick();
                guard += 1;
                assert!(guard < 10_000, "simulated DMA never halted");
            }
        }

        fn consumed_edges(&self) -> Vec<u32> {
            self.consumed
                .borrow()
                .iter()
                .filter_map(|(_, cmd)| *cmd)
                .collect()
        }
    }

    impl DmaChannel for SimDma {
        fn dma_active(&self) -> bool {
            self.active.get()
        }

        fn dma_current_index(&self) -> u32 {
            self.tick();
            self.cur.get()
        }

        fn start_dma(&mut self, index: u32) {
            self.starts.borrow_mut().push(index);
            self.cur.set(index);
            self.active.set(true);
        }
    }

    struct Rig {
        cbs: Box<[ControlBlock]>,
        _cmds: Box<[u32]>,
        ring: CbRing,
        sim: SimDma,
    }

    fn rig(capacity: u32) -> Rig {
        let mut cbs = vec![ControlBlock::default(); capacity as usize].into_boxed_slice();
        let mut cmds = vec![0u32; capacity as usize * 8].into_boxed_slice();
        let ring = unsafe {
            CbRing::new(
                cbs.as_mut_ptr(),
                CBS_BUS,
                capacity,
                cmds.as_mut_ptr(),
                CMDS_BUS,
                cmds.len() as u32,
                TARGETS,
            )
        };
        let sim = SimDma {
            cbs: cbs.as_ptr(),
            cmds: cmds.as_ptr(),
            active: Cell::new(false),
            cur: Cell::new(0),
            consumed: RefCell::new(Vec::new()),
            starts: RefCell::new(Vec::new()),
        };
        Rig {
            cbs,
            _cmds: cmds,
            ring,
            sim,
        }
    }

    fn rising(delay: u32) -> Transition {
        Transition::rising(21, delay)
    }

    fn falling(delay: u32) -> Transition {
        Transition::falling(21, delay)
    }

    #[test]
    fn test_edge_delay_pairs() {
        let mut r = rig(64);
        r.ring
            .transmit(&[rising(1136), falling(900), rising(0)], &mut r.sim);

        let b = &r.cbs;
        // Rising edge: 4-byte copy of the command word to GPIO_SET.
        assert_eq!(b[0].ti, CB_NO_WIDE_BURSTS | crate::hw::regs::CB_WAIT_RESP);
        assert_eq!(b[0].source_ad, CMDS_BUS);
        assert_eq!(b[0].dest_ad, TARGETS.gpio_set);
        assert_eq!(b[0].txfr_len, 4);
        assert_eq!(b[0].next_cb, CBS_BUS + CB_SIZE);
        // Its delay: DREQ-gated words into the PWM FIFO, one per microsecond.
        assert_eq!(b[1].ti, TI_BASE | CB_DEST_DREQ | cb_permap(5));
        assert_eq!(b[1].dest_ad, TARGETS.pwm_fifo);
        assert_eq!(b[1].txfr_len, 4 * 1136);
        // Falling edge pair.
        assert_eq!(b[2].dest_ad, TARGETS.gpio_clr);
        assert_eq!(b[2].source_ad, CMDS_BUS + 4);
        assert_eq!(b[3].txfr_len, 4 * 900);
        // Zero delay still emits its (no-op) pacing block, and the batch
        // tail halts.
        assert_eq!(b[4].dest_ad, TARGETS.gpio_set);
        assert_eq!(b[5].txfr_len, 0);
        assert_eq!(b[5].next_cb, 0);

        assert_eq!(*r.sim.starts.borrow(), vec![0]);
        assert_eq!(r._cmds[0], 1 << 21);
        assert_eq!(r._cmds[1], 1 << 21);
    }

    #[test]
    fn test_batches_link_through_published_store() {
        let mut r = rig(64);
        r.ring.transmit(&[rising(10), falling(10)], &mut r.sim);
        assert_eq!(r.cbs[3].next_cb, 0);

        r.ring.transmit(&[rising(20), falling(20)], &mut r.sim);
        // The old tail now points at the new batch's first block...
        assert_eq!(r.cbs[3].next_cb, CBS_BUS + 4 * CB_SIZE);
        // ...and the channel was only started once.
        assert_eq!(*r.sim.starts.borrow(), vec![0]);
        assert_eq!(r.cbs[7].next_cb, 0);

        r.sim.drain();
        assert_eq!(
            r.sim.consumed_edges(),
            vec![1 << 21, 1 << 21, 1 << 21, 1 << 21]
        );
    }

    #[test]
    fn test_long_delay_splits_into_chain() {
        let mut r = rig(64);
        let long = DELAY_BLOCK_MAX_US + 5;
        r.ring.transmit(&[rising(long)], &mut r.sim);

        assert_eq!(r.cbs[1].txfr_len, 4 * DELAY_BLOCK_MAX_US);
        assert_eq!(r.cbs[2].txfr_len, 4 * 5);
        assert_eq!(r.cbs[2].dest_ad, TARGETS.pwm_fifo);
        assert_eq!(r.cbs[2].next_cb, 0);
        // The chain's byte total still encodes the full delay.
        let total = (r.cbs[1].txfr_len as u64 + r.cbs[2].txfr_len as u64) / 4;
        assert_eq!(total, long as u64);
    }

    #[test]
    fn test_restart_after_reader_drained() {
        let mut r = rig(64);
        r.ring.transmit(&[rising(10)], &mut r.sim);
        r.sim.drain();
        assert!(!r.sim.dma_active());

        r.ring.transmit(&[falling(10)], &mut r.sim);
        // Writer restarted from slot 0 rather than appending to a dead chain.
        assert_eq!(*r.sim.starts.borrow(), vec![0, 0]);
        r.sim.drain();
        assert_eq!(r.sim.consumed_edges(), vec![1 << 21, 1 << 21]);
    }

    #[test]
    fn test_ring_wrap_preserves_every_transition() {
        let mut r = rig(8); // four transitions per lap
        let batch1 = [rising(100), falling(200), rising(300)];
        r.ring.transmit(&batch1, &mut r.sim);
        // Let the reader make some progress into the first batch.
        r.sim.tick();
        r.sim.tick();

        let batch2 = [falling(400), rising(500), falling(600)];
        r.ring.transmit(&batch2, &mut r.sim);
        r.sim.drain();

        // Across the wrap, every edge was consumed exactly once, in order.
        let expected: Vec<u32> = batch1
            .iter()
            .chain(batch2.iter())
            .map(|t| t.on_mask | t.off_mask)
            .collect();
        assert_eq!(r.sim.consumed_edges(), expected);
        assert_eq!(*r.sim.starts.borrow(), vec![0]);
    }

    #[test]
    fn test_oversize_timeline_is_chunked() {
        let mut r = rig(8);
        let timeline: Vec<Transition> = (0u32..6)
            .map(|i| if i % 2 == 0 { rising(50 + i) } else { falling(50 + i) })
            .collect();
        r.ring.transmit(&timeline, &mut r.sim);
        r.sim.drain();

        let expected: Vec<u32> = timeline.iter().map(|t| t.on_mask | t.off_mask).collect();
        assert_eq!(r.sim.consumed_edges(), expected);
    }

    #[test]
    fn test_delay_block_math() {
        assert_eq!(CbRing::delay_blocks(0), 1);
        assert_eq!(CbRing::delay_blocks(1), 1);
        assert_eq!(CbRing::delay_blocks(DELAY_BLOCK_MAX_US), 1);
        assert_eq!(CbRing::delay_blocks(DELAY_BLOCK_MAX_US + 1), 2);
        assert_eq!(CbRing::delay_blocks(u32::MAX), 17);
    }
}
