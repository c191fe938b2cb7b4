use skiff_proto::{EvictFlags, Message};
use skiff_types::{page_base, Access, Asid, PageKey};

use crate::dispatch::{Dispatcher, EvictOutcome};
use crate::engine::ExecutionEngine;
use crate::error::{MmuError, Result};
use crate::transport::DeviceTransport;

/// Guest-triggered invalidation entry points.
///
/// The guest changing its own page tables makes the device's cached
/// translations stale; these flushes force the affected pages off the device
/// before the guest-visible operation completes. Each one is synchronous:
/// it sends an `EvictRequest` per mapping and spin-waits for the matching
/// eviction round-trip, buffering unrelated device traffic for the main loop
/// to replay. A flush that matches nothing returns immediately and sends no
/// messages.
impl Dispatcher {
    /// Flush the translation for one guest virtual address in one address
    /// space, whichever permission it is resident under.
    pub fn flush_page<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        gva: u64,
        asid: Asid,
    ) -> Result<()> {
        if !self.config().enabled {
            return Ok(());
        }
        log::debug!("flush gva {gva:#x} asid {asid:#x}");
        for perm in Access::ALL {
            let key = PageKey::pack(gva, asid, perm);
            if self.tpt.contains(key) {
                // One request covers the page: the device tears down the
                // translation whichever permission it holds it under.
                return self.evict_one_sync(engine, transport, key);
            }
        }
        Ok(())
    }

    /// Flush every translation belonging to one address space.
    pub fn flush_asid<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        asid: Asid,
    ) -> Result<()> {
        if !self.config().enabled {
            return Ok(());
        }
        log::debug!("flush asid {asid:#x}");
        let matched: Vec<PageKey> = self
            .tpt
            .keys()
            .into_iter()
            .filter(|key| key.asid() == asid)
            .collect();
        self.evict_all_sync(engine, transport, &matched)
    }

    /// Flush a guest virtual address for every address space it is resident
    /// under.
    pub fn flush_gva<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        gva: u64,
    ) -> Result<()> {
        if !self.config().enabled {
            return Ok(());
        }
        let gvp = page_base(gva);
        log::debug!("flush gva {gvp:#x} (all asids)");
        let matched: Vec<PageKey> = self
            .tpt
            .keys()
            .into_iter()
            .filter(|key| key.guest_page() == gvp)
            .collect();
        self.evict_all_sync(engine, transport, &matched)
    }

    /// Flush every mapping of one host page (all synonyms).
    pub fn flush_host_page<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        hvp: u64,
    ) -> Result<()> {
        if !self.config().enabled {
            return Ok(());
        }
        log::debug!("flush hvp {hvp:#x}");
        let matched = self.ipt.synonyms(page_base(hvp)).to_vec();
        self.evict_all_sync(engine, transport, &matched)
    }

    /// Flush the synonyms of one host page that belong to one address space.
    pub fn flush_host_page_asid<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        hvp: u64,
        asid: Asid,
    ) -> Result<()> {
        if !self.config().enabled {
            return Ok(());
        }
        log::debug!("flush hvp {hvp:#x} asid {asid:#x}");
        let matched: Vec<PageKey> = self
            .ipt
            .synonyms(page_base(hvp))
            .iter()
            .copied()
            .filter(|key| key.asid() == asid)
            .collect();
        self.evict_all_sync(engine, transport, &matched)
    }

    /// Flush every translation resident on the device.
    pub fn flush_all<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
    ) -> Result<()> {
        if !self.config().enabled {
            return Ok(());
        }
        log::debug!("flush all ({} mappings)", self.tpt.len());
        let matched = self.tpt.keys();
        self.evict_all_sync(engine, transport, &matched)
    }

    /// Evict a batch of mappings one at a time, waiting for each round-trip.
    ///
    /// The keys were collected up front: eviction mutates the tables, so the
    /// caller must not iterate them live.
    fn evict_all_sync<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        keys: &[PageKey],
    ) -> Result<()> {
        for key in keys {
            self.evict_one_sync(engine, transport, *key)?;
        }
        Ok(())
    }

    fn evict_one_sync<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        key: PageKey,
    ) -> Result<()> {
        // A flush always shoots down both device TLBs.
        self.send(
            transport,
            &Message::evict_request(key, EvictFlags::ITLB | EvictFlags::DTLB),
        );
        self.wait_eviction(engine, transport, key)
    }

    /// Spin until the eviction round-trip for `key` completes.
    ///
    /// A clean `EvictNotify` is terminal; a modified one keeps us waiting
    /// for its `EvictDone`. Messages about other pages are parked in arrival
    /// order for the main loop.
    fn wait_eviction<E: ExecutionEngine, T: DeviceTransport>(
        &mut self,
        engine: &mut E,
        transport: &mut T,
        key: PageKey,
    ) -> Result<()> {
        loop {
            let Some(frame) = transport.try_receive_frame() else {
                // Bounded round-trip by the transport contract; keep polling.
                std::hint::spin_loop();
                continue;
            };
            let msg = Message::decode(&frame)?;
            let (asid, gvp) = msg.guest_page();
            if asid != key.asid() || gvp != key.guest_page() {
                self.park_message(msg)?;
                continue;
            }
            match msg {
                Message::EvictNotify {
                    asid,
                    gvp,
                    perm,
                    modified,
                } => {
                    let outcome =
                        self.handle_evict_notify(engine, transport, asid, gvp, perm, modified)?;
                    if outcome == EvictOutcome::Completed {
                        return Ok(());
                    }
                }
                Message::EvictDone {
                    asid,
                    gvp,
                    perm,
                    ppn,
                } => {
                    return self.handle_evict_done(engine, transport, asid, gvp, perm, ppn);
                }
                other => return Err(MmuError::UnexpectedMessage(other)),
            }
        }
    }
}
