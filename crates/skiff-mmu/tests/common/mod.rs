//! Shared mocks for the dispatcher integration tests.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};

use skiff_mmu::{ArchState, DeviceTransport, ExecutionEngine, TranslationMiss};
use skiff_proto::{Message, FRAME_BYTES};
use skiff_types::{page_base, Access, Asid, ThreadId, PAGE_SIZE};

/// Scripted software engine: a fixed translation table, sparse page-granular
/// memory, and per-thread register files.
pub struct MockEngine {
    pub mappings: HashMap<(u64, Access), u64>,
    pub memory: HashMap<u64, [u8; PAGE_SIZE]>,
    pub states: Vec<ArchState>,
    /// PC delta applied by each single step; zero models a stuck guest.
    pub step_advance: u64,
    /// When set, a step switches the thread to this address space.
    pub asid_after_step: Option<Asid>,
    pub steps_taken: usize,
}

impl MockEngine {
    pub fn new(threads: usize) -> MockEngine {
        MockEngine {
            mappings: HashMap::new(),
            memory: HashMap::new(),
            states: (0..threads)
                .map(|thread| ArchState {
                    pc: 0x8000 + thread as u64 * 0x100,
                    asid: thread as Asid + 1,
                    ..ArchState::default()
                })
                .collect(),
            step_advance: 4,
            asid_after_step: None,
            steps_taken: 0,
        }
    }

    /// Map `gva`'s page to `hva`'s page for the given accesses.
    pub fn map(&mut self, gva: u64, hva: u64, accesses: &[Access]) {
        for access in accesses {
            self.mappings.insert((page_base(gva), *access), page_base(hva));
        }
    }

    pub fn fill_page(&mut self, hvp: u64, byte: u8) {
        self.memory.insert(page_base(hvp), [byte; PAGE_SIZE]);
    }
}

impl ExecutionEngine for MockEngine {
    fn translate(
        &mut self,
        _thread: ThreadId,
        gva: u64,
        access: Access,
    ) -> Result<u64, TranslationMiss> {
        self.mappings
            .get(&(page_base(gva), access))
            .copied()
            .ok_or(TranslationMiss)
    }

    fn arch_state(&self, thread: ThreadId) -> ArchState {
        self.states[thread as usize].clone()
    }

    fn set_arch_state(&mut self, thread: ThreadId, state: &ArchState) {
        self.states[thread as usize] = state.clone();
    }

    fn single_step(&mut self, thread: ThreadId) {
        self.steps_taken += 1;
        let state = &mut self.states[thread as usize];
        state.pc = state.pc.wrapping_add(self.step_advance);
        if let Some(asid) = self.asid_after_step {
            state.asid = asid;
        }
    }

    fn current_asid(&self, thread: ThreadId) -> Asid {
        self.states[thread as usize].asid
    }

    fn read_host_page(&self, hvp: u64) -> [u8; PAGE_SIZE] {
        self.memory
            .get(&page_base(hvp))
            .copied()
            .unwrap_or([0; PAGE_SIZE])
    }

    fn write_host_page(&mut self, hvp: u64, data: &[u8; PAGE_SIZE]) {
        self.memory.insert(page_base(hvp), *data);
    }
}

/// Scripted accelerator: tests pre-queue device→host frames and inspect the
/// decoded host→device traffic afterwards.
pub struct MockDevice {
    inbound: VecDeque<[u8; FRAME_BYTES]>,
    pub sent: Vec<Message>,
    pub dram: HashMap<u64, [u8; PAGE_SIZE]>,
    pub page_pushes: Vec<u64>,
    pub thread_states: HashMap<ThreadId, ArchState>,
    pub started: Vec<ThreadId>,
    pub stopped: Vec<ThreadId>,
    pub pending: u32,
}

impl MockDevice {
    pub fn new() -> MockDevice {
        MockDevice {
            inbound: VecDeque::new(),
            sent: Vec::new(),
            dram: HashMap::new(),
            page_pushes: Vec::new(),
            thread_states: HashMap::new(),
            started: Vec::new(),
            stopped: Vec::new(),
            pending: 0,
        }
    }

    /// Queue a device→host message as it would arrive off the wire.
    pub fn inject(&mut self, msg: Message) {
        self.inbound.push_back(msg.encode());
    }

    pub fn replies(&self) -> Vec<&Message> {
        self.sent
            .iter()
            .filter(|msg| matches!(msg, Message::MissReply { .. }))
            .collect()
    }

    pub fn evict_requests(&self) -> Vec<&Message> {
        self.sent
            .iter()
            .filter(|msg| matches!(msg, Message::EvictRequest { .. }))
            .collect()
    }
}

impl DeviceTransport for MockDevice {
    fn send_frame(&mut self, frame: &[u8; FRAME_BYTES]) {
        self.sent.push(Message::decode(frame).expect("host sent a malformed frame"));
    }

    fn try_receive_frame(&mut self) -> Option<[u8; FRAME_BYTES]> {
        self.inbound.pop_front()
    }

    fn push_page(&mut self, ppn: u64, data: &[u8; PAGE_SIZE]) {
        self.page_pushes.push(ppn);
        self.dram.insert(ppn, *data);
    }

    fn pull_page(&mut self, ppn: u64) -> [u8; PAGE_SIZE] {
        self.dram.get(&ppn).copied().unwrap_or([0; PAGE_SIZE])
    }

    fn push_state(&mut self, thread: ThreadId, state: &ArchState) {
        self.thread_states.insert(thread, state.clone());
    }

    fn pull_state(&mut self, thread: ThreadId) -> ArchState {
        self.thread_states
            .get(&thread)
            .cloned()
            .expect("pulled state for a thread that was never pushed")
    }

    fn start(&mut self, thread: ThreadId) {
        self.started.push(thread);
    }

    fn stop(&mut self, thread: ThreadId) {
        self.stopped.push(thread);
    }

    fn pending_mask(&mut self) -> u32 {
        std::mem::take(&mut self.pending)
    }
}
