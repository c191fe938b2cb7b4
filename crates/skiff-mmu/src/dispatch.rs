use std::collections::VecDeque;

use skiff_paging::{
    FreePagePool, InvertedPageTable, ParkedFault, ParkedFaults, PendingEvictions, Residency,
    ShadowPageTable, TemporalPageTable,
};
use skiff_proto::Message;
use skiff_types::{page_base, Access, Asid, PageKey, ThreadId};

use crate::config::SkiffConfig;
use crate::engine::ExecutionEngine;
use crate::error::{MmuError, Result};
use crate::transplant::ThreadState;
use crate::transport::DeviceTransport;

/// Messages that can be buffered while a synchronous flush spin-waits.
///
/// Anything unrelated to the flush's eviction round-trip is parked here in
/// arrival order and replayed before new device traffic is drained.
pub(crate) const PARKED_MESSAGE_CAPACITY: usize = 256;

/// Whether an eviction finished on its notify or still owes a writeback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvictOutcome {
    /// Unmodified page: the notify was terminal.
    Completed,
    /// Modified page: an `EvictDone` will follow.
    AwaitingWriteback,
}

/// The demand-paging control loop.
///
/// Owns every piece of runtime state the layer has: the residency tables,
/// the device page pool, the in-flight trackers, the parked-message buffer,
/// and the per-thread transplant slots. The execution engine and the device
/// transport are borrowed per call so the embedder keeps ownership of both.
///
/// Single-threaded: handlers run to completion one message at a time, which
/// is what keeps the table updates race-free. The only other
/// entry points, the guest-triggered flushes, run on the same thread between
/// messages.
pub struct Dispatcher {
    config: SkiffConfig,
    running: bool,
    pub(crate) ipt: InvertedPageTable,
    pub(crate) tpt: TemporalPageTable,
    pub(crate) spt: ShadowPageTable,
    pub(crate) pool: FreePagePool,
    pub(crate) pending_evictions: PendingEvictions,
    parked_faults: ParkedFaults,
    parked_messages: VecDeque<Message>,
    pub(crate) slots: Vec<ThreadState>,
}

impl Dispatcher {
    pub fn new(config: SkiffConfig) -> Dispatcher {
        assert!(
            config.thread_slots <= 32,
            "pending mask is 32 bits wide; {} slots configured",
            config.thread_slots
        );
        let pool = FreePagePool::new(config.dram_pages, config.dram_base);
        let slots = vec![ThreadState::Idle; config.thread_slots];
        Dispatcher {
            config,
            running: false,
            ipt: InvertedPageTable::new(),
            tpt: TemporalPageTable::new(),
            spt: ShadowPageTable::new(),
            pool,
            pending_evictions: PendingEvictions::new(),
            parked_faults: ParkedFaults::new(),
            parked_messages: VecDeque::new(),
            slots,
        }
    }

    #[inline]
    pub fn config(&self) -> &SkiffConfig {
        &self.config
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.config.enabled && self.running
    }

    /// Mark the layer running. Called when the guest requests offload.
    pub fn start(&mut self) {
        if !self.config.enabled {
            log::warn!("offload start requested but the layer is disabled");
            return;
        }
        log::info!("offload start");
        self.running = true;
    }

    /// Ask the control loop to drain every thread back and exit.
    pub fn request_stop(&mut self) {
        if self.running {
            log::info!("offload stop");
        }
        self.running = false;
    }

    /// Run the full execution flow: push every thread to the device, then
    /// service transplants and messages until `stop` reports true, then
    /// drain every thread back to the software engine.
    ///
    /// `stop` is polled once per iteration; it is the embedder's seam for
    /// guest shutdown, debugger attach, or any other external exit request.
    pub fn run<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        mut stop: impl FnMut() -> bool,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.start();
        self.launch_all(engine, transport);
        while self.is_running() {
            if stop() {
                self.request_stop();
            } else {
                self.service(engine, transport)?;
            }
        }
        self.drain_all(engine, transport);
        Ok(())
    }

    /// One control-loop iteration: pending transplants first, then messages
    /// parked during a flush, then fresh device traffic.
    pub fn service<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
    ) -> Result<()> {
        self.poll_transplants(engine, transport)?;

        while let Some(msg) = self.parked_messages.pop_front() {
            self.dispatch(engine, transport, msg)?;
        }

        while let Some(frame) = transport.try_receive_frame() {
            let msg = Message::decode(&frame)?;
            self.dispatch(engine, transport, msg)?;
        }
        Ok(())
    }

    pub(crate) fn dispatch<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::PageFaultNotify {
                asid,
                gvp,
                perm,
                thread,
            } => self.handle_page_fault(engine, transport, asid, gvp, perm, thread),
            Message::EvictNotify {
                asid,
                gvp,
                perm,
                modified,
            } => self
                .handle_evict_notify(engine, transport, asid, gvp, perm, modified)
                .map(|_| ()),
            Message::EvictDone {
                asid,
                gvp,
                perm,
                ppn,
            } => self.handle_evict_done(engine, transport, asid, gvp, perm, ppn),
            // Host→device kinds never arrive from the device.
            other @ (Message::MissReply { .. } | Message::EvictRequest { .. }) => {
                Err(MmuError::UnexpectedMessage(other))
            }
        }
    }

    /// Resolve a device page fault: translate, park behind any in-flight
    /// eviction of the same host page, otherwise register the mapping and
    /// reply.
    fn handle_page_fault<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        asid: Asid,
        gvp: u64,
        perm: Access,
        thread: ThreadId,
    ) -> Result<()> {
        let (perm, translated) = match perm {
            Access::Load if self.config.upgrade_load_faults => {
                // A writable mapping answers the Load with Store permission,
                // saving the write fault that would otherwise follow.
                match engine.translate(thread, gvp, Access::Store) {
                    Ok(hva) => (Access::Store, Ok(hva)),
                    Err(_) => (Access::Load, engine.translate(thread, gvp, Access::Load)),
                }
            }
            access => (access, engine.translate(thread, gvp, access)),
        };

        let key = PageKey::pack(gvp, asid, perm);
        let Ok(hva) = translated else {
            // Not mapped on the host side: only the software engine can take
            // this fault through the guest's own MMU.
            log::debug!(
                "thread {thread} asid {asid:#x} gva {gvp:#x}: translation miss, transplanting"
            );
            transport.stop(thread);
            return self.transplant_one(engine, transport, thread);
        };
        let hvp = page_base(hva);

        log::trace!("thread {thread} fault {key:?} -> hvp {hvp:#x}");

        if self.pending_evictions.has_hvp(hvp) {
            // The device is mid-eviction on this host page; answering now
            // would hand out contents the writeback is about to replace.
            log::debug!("fault on {hvp:#x} parked behind in-flight eviction");
            self.parked_faults.park(ParkedFault { key, hvp, thread })?;
            return Ok(());
        }
        if self.parked_faults.has_hvp(hvp) {
            return Err(MmuError::OrphanedParkedFault { hvp });
        }

        self.tpt.register(key, hvp)?;
        self.send_miss_reply(engine, transport, key, hvp, thread)
    }

    /// Register the mapping, place the page on the device if this is its
    /// first resident mapping, and answer the faulting thread.
    pub(crate) fn send_miss_reply<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        key: PageKey,
        hvp: u64,
        thread: ThreadId,
    ) -> Result<()> {
        let ppn = match self.ipt.register(hvp, key)? {
            Residency::FirstResident => {
                let ppn = self.pool.allocate()?;
                self.spt.register(hvp, ppn)?;
                transport.push_page(ppn, &engine.read_host_page(hvp));
                ppn
            }
            // Synonym of a page already on the device: reuse its slot.
            Residency::Synonym => self.spt.lookup(hvp)?,
        };
        log::trace!("miss reply {key:?} -> ppn {ppn:#x} (thread {thread})");
        self.send(transport, &Message::miss_reply(key, thread, ppn));
        Ok(())
    }

    pub(crate) fn handle_evict_notify<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        asid: Asid,
        gvp: u64,
        perm: Access,
        modified: bool,
    ) -> Result<EvictOutcome> {
        let key = PageKey::pack(gvp, asid, perm);
        let hvp = self.tpt.lookup(key)?;
        log::trace!("evict notify {key:?} (hvp {hvp:#x}, modified {modified})");
        if modified {
            self.pending_evictions.add(key, hvp)?;
            Ok(EvictOutcome::AwaitingWriteback)
        } else {
            // Clean page: no writeback follows, tear the mapping down now.
            self.complete_eviction(engine, transport, key, hvp, None)?;
            Ok(EvictOutcome::Completed)
        }
    }

    pub(crate) fn handle_evict_done<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        asid: Asid,
        gvp: u64,
        perm: Access,
        ppn: u64,
    ) -> Result<()> {
        let key = PageKey::pack(gvp, asid, perm);
        let hvp = self.tpt.lookup(key)?;
        log::trace!("evict writeback {key:?} (hvp {hvp:#x}, ppn {ppn:#x})");
        self.complete_eviction(engine, transport, key, hvp, Some(ppn))
    }

    /// Tear down one mapping after its eviction round-trip finished.
    ///
    /// `writeback` is the device page named by an `EvictDone`, `None` when a
    /// clean notify completed the eviction directly. The last synonym to
    /// leave releases the shadow entry and the device page. The evicted
    /// mapping is forgotten first and parked faults for the host page are
    /// replayed after: a re-fault of the same translation, parked while its
    /// own eviction was in flight, must register cleanly.
    fn complete_eviction<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        key: PageKey,
        hvp: u64,
        writeback: Option<u64>,
    ) -> Result<()> {
        if let Some(ppn) = writeback {
            if self.config.debug.compares() {
                self.verify_page(engine, transport, hvp, ppn)?;
            }
        }

        let still_resident = self.ipt.unregister(hvp, key)?;
        if !still_resident {
            let recorded = self.spt.remove(hvp)?;
            if let Some(reported) = writeback {
                if reported != recorded {
                    return Err(MmuError::WritebackPpnMismatch {
                        hvp,
                        reported,
                        recorded,
                    });
                }
                if self.config.debug.writes_back() {
                    engine.write_host_page(hvp, &transport.pull_page(recorded));
                }
            }
            self.pool.recycle(recorded);
        }

        self.tpt.remove(key)?;
        if writeback.is_some() {
            self.pending_evictions.clear(key)?;
        }
        self.replay_parked(engine, transport, hvp)?;
        Ok(())
    }

    /// Byte-compare the device's copy of a page against the emulator's.
    ///
    /// Any difference means the two substrates diverged while the page was
    /// resident, which no amount of paging can repair.
    fn verify_page<E: ExecutionEngine, T: DeviceTransport>(
        &self,
        engine: &E,
        transport: &mut T,
        hvp: u64,
        ppn: u64,
    ) -> Result<()> {
        let device = transport.pull_page(ppn);
        let emulator = engine.read_host_page(hvp);
        if device == emulator {
            return Ok(());
        }
        let mut mismatches = 0;
        let mut first_offset = 0;
        for (offset, (dev, emu)) in device.iter().zip(emulator.iter()).enumerate() {
            if dev != emu {
                if mismatches == 0 {
                    first_offset = offset;
                }
                mismatches += 1;
                log::error!("page {hvp:#x} byte {offset:#x}: device {dev:#04x} != emulator {emu:#04x}");
            }
        }
        Err(MmuError::PageMismatch {
            hvp,
            ppn,
            mismatches,
            first_offset,
            device: device[first_offset],
            emulator: emulator[first_offset],
        })
    }

    /// Replay every fault parked on `hvp`; returns whether any ran.
    fn replay_parked<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        hvp: u64,
    ) -> Result<bool> {
        let parked = self.parked_faults.take_matching(hvp);
        let replayed = !parked.is_empty();
        for fault in parked {
            log::debug!("replaying parked fault {:?} on {hvp:#x}", fault.key);
            self.tpt.register(fault.key, fault.hvp)?;
            self.send_miss_reply(engine, transport, fault.key, fault.hvp, fault.thread)?;
        }
        Ok(replayed)
    }

    pub(crate) fn send<T: DeviceTransport>(&self, transport: &mut T, msg: &Message) {
        transport.send_frame(&msg.encode());
    }

    /// Buffer a message that arrived while a flush was spin-waiting.
    pub(crate) fn park_message(&mut self, msg: Message) -> Result<()> {
        if self.parked_messages.len() >= PARKED_MESSAGE_CAPACITY {
            return Err(MmuError::ParkedMessageOverflow {
                capacity: PARKED_MESSAGE_CAPACITY,
            });
        }
        self.parked_messages.push_back(msg);
        Ok(())
    }
}
