//! Ports: one participant's endpoint of a circuit
//!
//! A [`Port`] owns (or, for a remote peer, maps) a block of buffers laid out
//! by [`PortLayout`]. Local ports allocate their block from their endpoint's
//! region; remote ports are reconstructed from a peer's descriptor and map
//! the same bytes through an attached [`SharedMemoryService`].
//!
//! An ActiveFlowControl port additionally owns shadow [`FlagBlock`]s: on a
//! consumer they sit in each producer's region and receive drain counts, on
//! a producer they sit in each consumer's region and receive fill counts.

pub mod role;
pub mod set;

use std::collections::BTreeMap;
use std::sync::Arc;

use zerocopy::FromZeros;

use crate::buffer::{BufferMetaData, BufferSlot, BufferState, FlagBlock, FlagMode, PortLayout};
use crate::constants::FLAG_WORD_SIZE;
use crate::descriptor::{PortDescriptor, FLAG_ADDR_NONE};
use crate::endpoint::EndPoint;
use crate::error::{Result, TransportError};
use crate::memory::{MappedRegion, RegionLease, SharedMemoryService};

pub use role::{negotiate, Negotiated, PortRole, RoleOptions, RoleRequest};
pub use set::{Distribution, DistributionKind, PortSet, PullSet, SubPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locality {
    /// Owned by this process
    Local,
    /// Mirror of a peer's port
    Remote,
}

/// Which port set of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetRef {
    Producer,
    Consumer(usize),
}

/// Address of one port inside a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub set: SetRef,
    pub ordinal: usize,
}

impl PortRef {
    pub fn producer(ordinal: usize) -> Self {
        Self {
            set: SetRef::Producer,
            ordinal,
        }
    }

    pub fn consumer(set: usize, ordinal: usize) -> Self {
        Self {
            set: SetRef::Consumer(set),
            ordinal,
        }
    }
}

pub struct Port {
    ordinal: usize,
    lane: usize,
    side: Side,
    locality: Locality,
    role: PortRole,
    options: RoleOptions,
    mode: FlagMode,
    endpoint: Arc<EndPoint>,
    service: Arc<dyn SharedMemoryService>,
    layout: PortLayout,
    region: Arc<MappedRegion>,
    slots: Vec<BufferSlot>,
    ring: usize,
    shadows: BTreeMap<usize, FlagBlock>,
    /// Shared with every handle checked out of this port
    lease: Option<Arc<RegionLease>>,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("ordinal", &self.ordinal)
            .field("lane", &self.lane)
            .field("side", &self.side)
            .field("locality", &self.locality)
            .field("role", &self.role)
            .field("endpoint", &self.endpoint.as_str())
            .field("buffers", &self.layout.buffer_count)
            .finish()
    }
}

/// Geometry and identity of a port being created
#[derive(Debug, Clone, Copy)]
pub struct PortParams {
    pub ordinal: usize,
    pub lane: usize,
    pub side: Side,
    pub role: PortRole,
    pub options: RoleOptions,
    pub mode: FlagMode,
}

impl Port {
    /// Allocate a fresh, zeroed buffer block in a local endpoint
    pub fn local(
        params: PortParams,
        service: Arc<dyn SharedMemoryService>,
        layout: PortLayout,
    ) -> Result<Self> {
        let lease = service.allocate(layout.total_size)?;
        let region = service.map(lease.offset(), layout.total_size)?;
        region.write_bytes(0, &vec![0u8; layout.total_size]);

        tracing::debug!(
            "Allocated {:?} port {} ({} x {} bytes, {} lanes) at {}+{}",
            params.side,
            params.ordinal,
            layout.buffer_count,
            layout.buffer_size,
            layout.lanes,
            service.endpoint(),
            lease.offset()
        );

        Ok(Self::build(
            params,
            Locality::Local,
            service,
            layout,
            Arc::new(region),
            Some(lease),
        ))
    }

    /// Mirror a peer's port from its descriptor
    pub fn remote(
        params: PortParams,
        service: Arc<dyn SharedMemoryService>,
        descriptor: &PortDescriptor,
    ) -> Result<Self> {
        let layout = descriptor.layout()?;
        let base = descriptor.block_base(&layout)?;
        let region = service.map(base, layout.total_size)?;
        Ok(Self::build(
            params,
            Locality::Remote,
            service,
            layout,
            Arc::new(region),
            None,
        ))
    }

    fn build(
        params: PortParams,
        locality: Locality,
        service: Arc<dyn SharedMemoryService>,
        layout: PortLayout,
        region: Arc<MappedRegion>,
        lease: Option<RegionLease>,
    ) -> Self {
        Self {
            ordinal: params.ordinal,
            lane: params.lane,
            side: params.side,
            locality,
            role: params.role,
            options: params.options,
            mode: params.mode,
            endpoint: Arc::clone(service.endpoint()),
            service,
            slots: vec![BufferSlot::default(); layout.buffer_count],
            layout,
            region,
            ring: 0,
            shadows: BTreeMap::new(),
            lease: lease.map(Arc::new),
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Consumer lane of this port; producers report 0
    pub fn lane(&self) -> usize {
        self.lane
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn locality(&self) -> Locality {
        self.locality
    }

    pub fn is_local(&self) -> bool {
        self.locality == Locality::Local
    }

    pub fn role(&self) -> PortRole {
        self.role
    }

    pub(crate) fn set_role(&mut self, role: PortRole) {
        self.role = role;
    }

    pub fn options(&self) -> RoleOptions {
        self.options
    }

    pub fn mode(&self) -> FlagMode {
        self.mode
    }

    pub fn endpoint(&self) -> &Arc<EndPoint> {
        &self.endpoint
    }

    pub fn service(&self) -> &Arc<dyn SharedMemoryService> {
        &self.service
    }

    /// Reservation of a local port's block in its endpoint region
    pub(crate) fn lease(&self) -> Option<Arc<RegionLease>> {
        self.lease.clone()
    }

    pub fn layout(&self) -> &PortLayout {
        &self.layout
    }

    pub fn region(&self) -> &Arc<MappedRegion> {
        &self.region
    }

    /// Offset of the buffer block inside the endpoint region
    pub fn block_base(&self) -> usize {
        self.region.offset()
    }

    pub fn buffer_count(&self) -> usize {
        self.layout.buffer_count
    }

    pub fn slot(&self, index: usize) -> &BufferSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut BufferSlot {
        &mut self.slots[index]
    }

    pub fn fill_word(&self, index: usize) -> u64 {
        self.region.load_flag(self.layout.full(index))
    }

    pub fn drain_word(&self, index: usize, lane: usize) -> u64 {
        self.region.load_flag(self.layout.empty(index, lane))
    }

    pub(crate) fn store_fill(&self, index: usize, count: u64) {
        tracing::trace!("Port {} buffer {} fill = {}", self.ordinal, index, count);
        self.region
            .store_flag(self.layout.full(index), self.mode.encode(count));
    }

    pub(crate) fn store_drain(&self, index: usize, lane: usize, value: u64) {
        tracing::trace!(
            "Port {} buffer {} lane {} drain = {}",
            self.ordinal,
            index,
            lane,
            value
        );
        self.region
            .store_flag(self.layout.empty(index, lane), self.mode.encode(value));
    }

    pub fn meta(&self, index: usize) -> BufferMetaData {
        self.region.read_value(self.layout.meta(index))
    }

    pub(crate) fn write_meta(&self, index: usize, meta: &BufferMetaData) {
        self.region.write_value(self.layout.meta(index), meta);
    }

    /// State as seen by the owner of this port
    ///
    /// Consumer buffers use their single drain lane; producer buffers stay
    /// Full until every lane they were sent to has drained.
    pub fn own_state(&self, index: usize) -> BufferState {
        let fill = self.fill_word(index);
        match self.side {
            Side::Consumer => self.mode.state(fill, self.drain_word(index, 0)),
            Side::Producer => {
                let expected = self.slots[index].expected;
                let busy = (0..self.layout.lanes)
                    .filter(|lane| expected & (1u32 << lane) != 0)
                    .any(|lane| self.mode.state(fill, self.drain_word(index, lane)) == BufferState::Full);
                if busy {
                    BufferState::Full
                } else {
                    BufferState::Empty
                }
            }
        }
    }

    /// Fill count of a producer buffer as a puller on `lane` should see it
    pub fn observed_fill(&self, index: usize, lane: usize) -> u64 {
        match self.shadows.get(&lane) {
            Some(shadow) => shadow.load(index),
            None => self.fill_word(index),
        }
    }

    /// Drain count of a consumer buffer as producer `producer` should see it
    pub fn observed_drain(&self, index: usize, producer: usize) -> u64 {
        match self.shadows.get(&producer) {
            Some(shadow) => shadow.load(index),
            None => self.drain_word(index, 0),
        }
    }

    /// Whether a mover may write into consumer buffer `index`
    pub fn is_push_target(&self, index: usize, producer: usize) -> bool {
        self.slots[index].selectable()
            && self
                .mode
                .state(self.mode.encode(self.slots[index].fills), self.observed_drain(index, producer))
                == BufferState::Empty
    }

    /// Consumer buffers a mover could fill right now
    pub fn push_capacity(&self, producer: usize) -> usize {
        (0..self.buffer_count())
            .filter(|k| self.is_push_target(*k, producer))
            .count()
    }

    /// First buffer, starting at the ring cursor, accepted by `pred`
    pub fn next_from_ring(&self, pred: impl Fn(&Port, usize) -> bool) -> Option<usize> {
        let n = self.buffer_count();
        (0..n).map(|i| (self.ring + i) % n).find(|k| pred(self, *k))
    }

    /// Move the ring cursor past `index`
    pub(crate) fn advance_ring(&mut self, index: usize) {
        self.ring = (index + 1) % self.buffer_count();
    }

    pub fn shadow(&self, peer: usize) -> Option<&FlagBlock> {
        self.shadows.get(&peer)
    }

    pub fn shadows(&self) -> impl Iterator<Item = (usize, &FlagBlock)> {
        self.shadows.iter().map(|(peer, block)| (*peer, block))
    }

    pub(crate) fn attach_shadow(&mut self, peer: usize, block: FlagBlock) {
        self.shadows.insert(peer, block);
    }

    /// Allocate a shadow block for `peer` inside this port's own region
    pub(crate) fn allocate_shadow(&self, words: usize) -> Result<FlagBlock> {
        let size = FlagBlock::size_for(words);
        let lease = self.service.allocate(size)?;
        let region = self.service.map(lease.offset(), size)?;
        region.write_bytes(0, &vec![0u8; size]);
        Ok(FlagBlock::new(Arc::new(region), words, Some(lease)))
    }

    /// Map a shadow block a peer allocated in this port's region
    pub(crate) fn map_shadow(&self, base: u64, words: usize) -> Result<FlagBlock> {
        let base = usize::try_from(base).map_err(|_| {
            TransportError::InvalidDescriptor(format!("shadow base {} out of range", base))
        })?;
        let region = self.service.map(base, FlagBlock::size_for(words))?;
        Ok(FlagBlock::new(Arc::new(region), words, None))
    }

    /// Any buffer the owner could claim for writing
    pub fn has_empty_buffer(&self) -> bool {
        (0..self.buffer_count())
            .any(|k| !self.slots[k].claimed && !self.slots[k].in_use && self.own_state(k) == BufferState::Empty)
    }

    /// Any received buffer the owner has not claimed yet
    pub fn has_full_buffer(&self) -> bool {
        (0..self.buffer_count())
            .any(|k| !self.slots[k].claimed && !self.slots[k].in_use && self.own_state(k) == BufferState::Full)
    }

    /// Describe this port for a peer
    ///
    /// Flag addresses the peer never touches under the given roles are
    /// published as [`FLAG_ADDR_NONE`]. Before negotiation (`peer == None`)
    /// every address is published.
    pub fn descriptor(&self, peer: Option<PortRole>) -> PortDescriptor {
        let base = self.block_base() as u64;
        let layout = &self.layout;

        let (full_visible, empty_visible) = match (self.side, peer) {
            (_, None) => (true, true),
            // the mover lands data and fill counts in consumer buffers;
            // an ActiveOnly mover polls a Passive consumer's drain words
            (Side::Consumer, Some(peer)) => (peer.moves_data(), peer == PortRole::ActiveOnly),
            // pullers write drain lanes; an ActiveOnly puller polls fill words
            (Side::Producer, Some(peer)) => (peer == PortRole::ActiveOnly, peer.moves_data()),
        };

        let mut d = PortDescriptor::new_zeroed();
        d.buffer_count = layout.buffer_count as u32;
        d.role = self.role as u32;
        d.option_bits = self.options.bits();
        d.data_buffer_base_addr = base + layout.data_offset as u64;
        d.data_buffer_pitch = layout.data_pitch as u64;
        d.data_buffer_size = layout.buffer_size as u64;
        d.metadata_base_addr = base + layout.meta_offset as u64;
        d.metadata_pitch = layout.meta_pitch as u64;
        d.full_flag_base_addr = if full_visible {
            base + layout.full_offset as u64
        } else {
            FLAG_ADDR_NONE
        };
        d.full_flag_size = FLAG_WORD_SIZE as u64;
        d.full_flag_pitch = FLAG_WORD_SIZE as u64;
        d.full_flag_value = self.mode.mask();
        d.empty_flag_base_addr = if empty_visible {
            base + layout.empty_offset as u64
        } else {
            FLAG_ADDR_NONE
        };
        d.empty_flag_size = FLAG_WORD_SIZE as u64;
        d.empty_flag_pitch = layout.empty_pitch() as u64;
        d.empty_flag_value = self.mode.mask();
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointCache;
    use crate::memory::heap::HeapBacking;
    use crate::memory::{init_header, RegionBacking, RegionService};

    fn service() -> Arc<dyn SharedMemoryService> {
        let mut cache = EndpointCache::new();
        let (endpoint, _) = cache.resolve("local:porttest:65536.1.0").unwrap();
        endpoint.mark_local();
        let backing: Arc<dyn RegionBacking> = Arc::new(HeapBacking::new(65536).unwrap());
        init_header(backing.as_ref(), 0);
        Arc::new(RegionService::local(endpoint, backing))
    }

    fn params(side: Side, role: PortRole) -> PortParams {
        PortParams {
            ordinal: 0,
            lane: 0,
            side,
            role,
            options: RoleOptions::default(),
            mode: FlagMode::Count,
        }
    }

    #[test]
    fn test_local_port_starts_empty() {
        let svc = service();
        let layout = PortLayout::new(4, 64, 1).unwrap();
        let port = Port::local(params(Side::Consumer, PortRole::ActiveFlowControl), svc, layout).unwrap();
        assert!(port.is_local());
        for k in 0..4 {
            assert_eq!(port.own_state(k), BufferState::Empty);
        }
        assert!(port.has_empty_buffer());
        assert!(!port.has_full_buffer());
    }

    #[test]
    fn test_consumer_state_follows_words() {
        let svc = service();
        let layout = PortLayout::new(2, 64, 1).unwrap();
        let port = Port::local(params(Side::Consumer, PortRole::Passive), svc, layout).unwrap();
        port.store_fill(1, 1);
        assert_eq!(port.own_state(1), BufferState::Full);
        assert!(port.has_full_buffer());
        port.store_drain(1, 0, 1);
        assert_eq!(port.own_state(1), BufferState::Empty);
    }

    #[test]
    fn test_producer_waits_for_expected_lanes() {
        let svc = service();
        let layout = PortLayout::new(2, 64, 3).unwrap();
        let mut port = Port::local(params(Side::Producer, PortRole::ActiveFlowControl), svc, layout).unwrap();
        port.slot_mut(0).expected = 0b101;
        port.store_fill(0, 1);
        assert_eq!(port.own_state(0), BufferState::Full);
        port.store_drain(0, 0, 1);
        assert_eq!(port.own_state(0), BufferState::Full);
        port.store_drain(0, 2, 1);
        assert_eq!(port.own_state(0), BufferState::Empty);
    }

    #[test]
    fn test_ring_scan_wraps() {
        let svc = service();
        let layout = PortLayout::new(3, 64, 1).unwrap();
        let mut port = Port::local(params(Side::Consumer, PortRole::Passive), svc, layout).unwrap();
        port.advance_ring(1);
        assert_eq!(port.next_from_ring(|_, _| true), Some(2));
        assert_eq!(port.next_from_ring(|_, k| k == 0), Some(0));
        assert_eq!(port.next_from_ring(|_, _| false), None);
    }

    #[test]
    fn test_shadow_overrides_drain() {
        let svc = service();
        let layout = PortLayout::new(2, 64, 1).unwrap();
        let mut port = Port::local(params(Side::Consumer, PortRole::ActiveFlowControl), svc, layout).unwrap();
        let shadow = port.allocate_shadow(2).unwrap();
        port.attach_shadow(0, shadow);
        port.slot_mut(0).fills = 1;
        assert!(!port.is_push_target(0, 0));
        port.shadow(0).unwrap().store(0, 1, FlagMode::Count);
        assert!(port.is_push_target(0, 0));
        assert_eq!(port.push_capacity(0), 2);
    }

    #[test]
    fn test_descriptor_hides_untouched_flags() {
        let svc = service();
        let layout = PortLayout::new(2, 64, 1).unwrap();
        let port = Port::local(params(Side::Consumer, PortRole::ActiveFlowControl), svc, layout).unwrap();

        let initial = port.descriptor(None);
        assert_ne!(initial.full_flag_base_addr, FLAG_ADDR_NONE);
        assert_ne!(initial.empty_flag_base_addr, FLAG_ADDR_NONE);

        let pushed = port.descriptor(Some(PortRole::ActiveMessage));
        assert_eq!(pushed.full_flag_base_addr, pushed.data_buffer_base_addr + 192);
        assert_eq!(pushed.empty_flag_base_addr, FLAG_ADDR_NONE);
    }

    #[test]
    fn test_remote_port_maps_same_block() {
        let svc = service();
        let layout = PortLayout::new(2, 64, 1).unwrap();
        let local = Port::local(params(Side::Consumer, PortRole::Passive), Arc::clone(&svc), layout).unwrap();
        let remote = Port::remote(
            params(Side::Consumer, PortRole::Passive),
            svc,
            &local.descriptor(None),
        )
        .unwrap();
        assert_eq!(remote.locality(), Locality::Remote);
        local.store_fill(1, 3);
        assert_eq!(remote.fill_word(1), 3);
    }
}
