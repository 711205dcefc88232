//! Circuits: a producer port set connected to one or more consumer sets
//!
//! A circuit owns every port, shadow block and copy service of one
//! connection and runs the buffer protocol over them:
//!
//! * producers claim Empty buffers, fill them and `produce`
//! * in push patterns filled buffers wait in a fill-ordered queue until the
//!   controllers find destinations, then the producer copies them out
//! * in pull patterns every local consumer port copies buffers addressed to
//!   its lane as soon as it has room
//! * consumers claim Full buffers in sequence order and `release` them
//!
//! Setup (local and two-sided) lives in [`setup`].

pub mod setup;

use std::collections::VecDeque;

use crate::buffer::{BufferHandle, BufferMetaData, BufferState, FlagMode, META_BROADCAST};
use crate::controller::{TemplateKind, TransferController, TransferTemplate};
use crate::driver::XferTable;
use crate::error::{CircuitId, Result, TransportError};
use crate::port::{DistributionKind, Negotiated, Port, PortRef, PortSet, PullSet, SetRef};

pub use setup::{CircuitSpec, PortSetSpec, Resources};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Waiting for the peer's half of the handshake
    AwaitingPeer,
    Ready,
    /// Closed; only in-flight transfers still progress
    Closing,
}

/// Outcome of a produce call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceStatus {
    /// The buffer reached every destination before `produce` returned
    Transferred,
    /// The buffer stays Full until a later dispatch moves it
    Pending,
}

#[derive(Debug, Clone, Copy)]
struct Queued {
    producer: usize,
    buffer: usize,
    broadcast: bool,
}

#[derive(Debug)]
pub struct Circuit {
    id: CircuitId,
    state: CircuitState,
    roles: Option<Negotiated>,
    mode: FlagMode,
    producers: PortSet,
    consumers: Vec<PortSet>,
    controllers: Vec<TransferController>,
    xfers: XferTable,
    queue: VecDeque<Queued>,
    in_flight: Vec<TransferTemplate>,
    pulling: PullSet,
    sequence: u64,
    turn: usize,
    peer_cookie: Option<u64>,
}

impl Circuit {
    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == CircuitState::Ready
    }

    /// Negotiated roles, once known
    pub fn roles(&self) -> Option<Negotiated> {
        self.roles
    }

    pub fn mode(&self) -> FlagMode {
        self.mode
    }

    pub fn producers(&self) -> &PortSet {
        &self.producers
    }

    pub fn consumers(&self) -> &[PortSet] {
        &self.consumers
    }

    pub fn controllers(&self) -> &[TransferController] {
        &self.controllers
    }

    /// Filled producer buffers waiting for a push
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Posted transfers that have not completed
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// No transfer still references this circuit's memory
    pub fn is_drained(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn is_push(&self) -> bool {
        self.roles.map(|r| r.is_push()).unwrap_or(false)
    }

    fn local_producer(&self, ordinal: usize) -> Result<&Port> {
        self.producers
            .port(ordinal)
            .filter(|p| p.is_local())
            .ok_or_else(|| TransportError::InvalidPort(format!("no local producer port {}", ordinal)))
    }

    fn local_consumer(&self, set: usize, ordinal: usize) -> Result<&Port> {
        self.consumers
            .get(set)
            .and_then(|s| s.port(ordinal))
            .filter(|p| p.is_local())
            .ok_or_else(|| {
                TransportError::InvalidPort(format!("no local consumer port {} in set {}", ordinal, set))
            })
    }

    fn may_fill(&self, ordinal: usize) -> bool {
        self.producers.distribution().kind != DistributionKind::Sequential || self.turn == ordinal
    }

    /// Claim an Empty buffer of producer port `ordinal`
    pub fn get_empty_buffer(&mut self, ordinal: usize) -> Result<Option<BufferHandle>> {
        let port = self.local_producer(ordinal)?;
        if !self.is_ready() || !self.may_fill(ordinal) {
            return Ok(None);
        }
        let Some(index) = port.next_from_ring(|p, k| {
            let slot = p.slot(k);
            !slot.claimed && !slot.in_use && p.own_state(k) == BufferState::Empty
        }) else {
            return Ok(None);
        };

        let handle = BufferHandle::new(
            self.id,
            PortRef::producer(ordinal),
            index,
            port.region().clone(),
            port.lease(),
            port.layout(),
        );
        if let Some(port) = self.producers.port_mut(ordinal) {
            port.slot_mut(index).claimed = true;
        }
        Ok(Some(handle))
    }

    pub fn has_empty_buffer(&self, ordinal: usize) -> Result<bool> {
        let port = self.local_producer(ordinal)?;
        Ok(self.is_ready() && self.may_fill(ordinal) && port.has_empty_buffer())
    }

    /// Mark a claimed producer buffer Full and try to move it
    ///
    /// # Panics
    /// If the handle is not a claimed, Empty producer buffer of this circuit
    /// or `length` exceeds the buffer capacity.
    #[tracing::instrument(level = "trace", skip(self, handle), fields(circuit = self.id, buffer = handle.index()))]
    pub fn produce(
        &mut self,
        handle: BufferHandle,
        opcode: u32,
        length: usize,
        flags: u32,
    ) -> Result<ProduceStatus> {
        assert_eq!(handle.circuit(), self.id, "buffer belongs to circuit {}", handle.circuit());
        let PortRef {
            set: SetRef::Producer,
            ordinal,
        } = handle.port()
        else {
            panic!("produce called with a consumer buffer");
        };
        let index = handle.index();
        assert!(
            length <= handle.capacity(),
            "message of {} bytes exceeds buffer capacity {}",
            length,
            handle.capacity()
        );
        let length = u32::try_from(length).map_err(|_| {
            TransportError::InvalidPort(format!("message length {} does not fit metadata", length))
        })?;
        drop(handle);

        {
            let port = self.local_producer(ordinal)?;
            assert!(
                port.slot(index).claimed,
                "producer {} buffer {} produced without being claimed",
                ordinal,
                index
            );
            assert_eq!(
                port.own_state(index),
                BufferState::Empty,
                "producing into a non-Empty buffer"
            );
        }

        let broadcast = flags & META_BROADCAST != 0;
        let push = self.is_push();
        let targets = self
            .controllers
            .iter_mut()
            .zip(&self.consumers)
            .fold(0u32, |mask, (ctl, set)| {
                mask | ctl.produce(set, &self.producers, broadcast)
            });

        let sequence = self.sequence;
        self.sequence += 1;
        let meta = BufferMetaData {
            length,
            opcode,
            sequence,
            targets,
            flags,
            producer: ordinal as u32,
            _reserved: 0,
        };

        let mode = self.mode;
        let port = self
            .producers
            .port_mut(ordinal)
            .ok_or_else(|| TransportError::InvalidPort(format!("no producer port {}", ordinal)))?;
        port.write_meta(index, &meta);
        let slot = port.slot_mut(index);
        slot.claimed = false;
        slot.fills += 1;
        slot.expected = if push { 1 } else { targets };
        let fills = slot.fills;
        port.store_fill(index, fills);
        for (_, shadow) in port.shadows() {
            shadow.store(index, fills, mode);
        }
        port.advance_ring(index);

        if self.producers.distribution().kind == DistributionKind::Sequential {
            self.turn = (self.turn + 1) % self.producers.width().max(1);
        }
        if push {
            self.queue.push_back(Queued {
                producer: ordinal,
                buffer: index,
                broadcast,
            });
        }

        self.advance();

        let done = self
            .producers
            .port(ordinal)
            .map(|p| p.own_state(index) == BufferState::Empty)
            .unwrap_or(false);
        Ok(if done {
            ProduceStatus::Transferred
        } else {
            ProduceStatus::Pending
        })
    }

    /// Claim the lowest-sequence Full buffer of a local consumer port
    pub fn get_full_buffer(&mut self, set: usize, ordinal: usize) -> Result<Option<BufferHandle>> {
        let Some(index) = self.next_full(set, ordinal)? else {
            return Ok(None);
        };
        let handle = self.consumer_handle(set, ordinal, index)?;
        if let Some(port) = self.consumers[set].port_mut(ordinal) {
            port.slot_mut(index).claimed = true;
        }
        Ok(Some(handle))
    }

    pub fn has_full_buffer(&self, set: usize, ordinal: usize) -> Result<bool> {
        let port = self.local_consumer(set, ordinal)?;
        Ok(self.is_ready() && port.has_full_buffer())
    }

    fn next_full(&self, set: usize, ordinal: usize) -> Result<Option<usize>> {
        let port = self.local_consumer(set, ordinal)?;
        if !self.is_ready() {
            return Ok(None);
        }
        Ok((0..port.buffer_count())
            .filter(|k| {
                let slot = port.slot(*k);
                !slot.claimed && !slot.in_use && port.own_state(*k) == BufferState::Full
            })
            .min_by_key(|k| port.meta(*k).sequence))
    }

    fn consumer_handle(&self, set: usize, ordinal: usize, index: usize) -> Result<BufferHandle> {
        let port = self.local_consumer(set, ordinal)?;
        Ok(BufferHandle::new(
            self.id,
            PortRef::consumer(set, ordinal),
            index,
            port.region().clone(),
            port.lease(),
            port.layout(),
        ))
    }

    /// Give a buffer back
    ///
    /// A consumer buffer becomes Empty and its producers are told so. A
    /// claimed producer buffer is returned unfilled.
    ///
    /// # Panics
    /// On double release, or when releasing a consumer buffer that is not
    /// Full.
    pub fn release(&mut self, handle: BufferHandle) -> Result<()> {
        assert_eq!(handle.circuit(), self.id, "buffer belongs to circuit {}", handle.circuit());
        let PortRef { set, ordinal } = handle.port();
        let index = handle.index();
        drop(handle);

        match set {
            SetRef::Producer => {
                self.local_producer(ordinal)?;
                if let Some(port) = self.producers.port_mut(ordinal) {
                    let slot = port.slot_mut(index);
                    assert!(
                        slot.claimed,
                        "double release of producer {} buffer {}",
                        ordinal, index
                    );
                    slot.claimed = false;
                }
            }
            SetRef::Consumer(set) => {
                let port = self.local_consumer(set, ordinal)?;
                let slot = port.slot(index);
                assert!(
                    slot.claimed || slot.in_use,
                    "double release of consumer {} buffer {}",
                    ordinal,
                    index
                );
                assert_eq!(
                    port.own_state(index),
                    BufferState::Full,
                    "consuming a buffer that is not Full"
                );
                self.controllers[set].consume(port, index);
                if let Some(port) = self.consumers[set].port_mut(ordinal) {
                    let slot = port.slot_mut(index);
                    slot.claimed = false;
                    slot.in_use = false;
                }
                self.advance();
            }
        }
        Ok(())
    }

    /// Retain the next Full buffer across run cycles
    ///
    /// When a new buffer is available it is returned marked in use and
    /// `old` is released. Otherwise `old` is handed back unchanged.
    pub fn take(
        &mut self,
        set: usize,
        ordinal: usize,
        old: Option<BufferHandle>,
    ) -> Result<Option<BufferHandle>> {
        let Some(index) = self.next_full(set, ordinal)? else {
            return Ok(old);
        };
        let handle = self.consumer_handle(set, ordinal, index)?;
        if let Some(port) = self.consumers[set].port_mut(ordinal) {
            port.slot_mut(index).in_use = true;
        }
        if let Some(old) = old {
            self.release(old)?;
        }
        Ok(Some(handle))
    }

    /// Release every unclaimed Full buffer of every local consumer port
    pub fn consume_all_local(&mut self) -> usize {
        if !self.is_ready() {
            return 0;
        }
        let mut released = 0;
        for (set, ctl) in self.consumers.iter().zip(&self.controllers) {
            for port in set.ports().filter(|p| p.is_local()) {
                for k in 0..port.buffer_count() {
                    let slot = port.slot(k);
                    if !slot.claimed && !slot.in_use && port.own_state(k) == BufferState::Full {
                        ctl.consume(port, k);
                        released += 1;
                    }
                }
            }
        }
        if released > 0 {
            self.advance();
        }
        released
    }

    /// One progress pass: settle finished transfers, then start new ones
    pub fn advance(&mut self) -> usize {
        let mut progressed = self.complete_templates();
        if self.is_ready() {
            progressed += if self.is_push() {
                self.run_queue()
            } else {
                self.pull_local()
            };
        }
        progressed
    }

    /// Stop starting transfers; queued buffers are dropped
    pub fn close(&mut self) -> bool {
        if !self.queue.is_empty() {
            tracing::warn!(
                "Closing circuit {} with {} buffers never transferred",
                self.id,
                self.queue.len()
            );
        }
        self.queue.clear();
        self.state = CircuitState::Closing;
        self.is_drained()
    }

    /// Settle completed templates; returns how many
    pub fn complete_templates(&mut self) -> usize {
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(TransferTemplate::is_complete);
        self.in_flight = pending;
        let count = done.len();
        for template in &done {
            self.finish(template);
        }
        count
    }

    fn settle(&mut self, template: TransferTemplate) {
        if template.is_complete() {
            self.finish(&template);
        } else {
            self.in_flight.push(template);
        }
    }

    fn finish(&mut self, template: &TransferTemplate) {
        for target in template.targets() {
            if let Some(port) = self
                .consumers
                .get_mut(target.set)
                .and_then(|s| s.port_mut(target.ordinal))
            {
                port.slot_mut(target.buffer).reserved = false;
            }
        }
        match template.kind() {
            TemplateKind::Push => {
                if let Some(port) = self.producers.port(template.producer()) {
                    let fill = port.fill_word(template.buffer());
                    port.store_drain(template.buffer(), 0, fill);
                }
            }
            TemplateKind::Pull { lane } => {
                self.pulling
                    .remove(&(template.producer(), template.buffer(), lane));
            }
        }
        tracing::trace!(
            "Circuit {} completed {:?} of sequence {}",
            self.id,
            template.kind(),
            template.sequence()
        );
    }

    /// Push queued producer buffers in fill order while destinations exist
    fn run_queue(&mut self) -> usize {
        let mut moved = 0;
        while let Some(&queued) = self.queue.front() {
            let mut plans = Vec::with_capacity(self.controllers.len());
            for (ctl, set) in self.controllers.iter_mut().zip(&self.consumers) {
                match ctl.can_transfer(set, queued.producer, queued.broadcast) {
                    Some(plan) => plans.push(plan),
                    None => return moved,
                }
            }
            self.queue.pop_front();

            let Some(producer) = self.producers.port(queued.producer) else {
                continue;
            };
            let mut template = TransferTemplate::push(producer, queued.buffer);
            for (set, plan) in plans.into_iter().enumerate() {
                self.controllers[set].commit(queued.broadcast);
                for (ordinal, target) in plan {
                    let Some(consumer) = self.consumers[set].port_mut(ordinal) else {
                        continue;
                    };
                    let Some(xfer) = self.xfers.get(producer.endpoint(), consumer.endpoint()) else {
                        panic!(
                            "circuit {} has no copy service from {} to {}",
                            self.id,
                            producer.endpoint(),
                            consumer.endpoint()
                        );
                    };
                    template.add_push_target(xfer.as_ref(), producer, set, consumer, target, self.mode);
                }
            }
            tracing::trace!(
                "Circuit {} pushing sequence {} to {} buffers",
                self.id,
                template.sequence(),
                template.targets().len()
            );
            self.settle(template);
            moved += 1;
        }
        moved
    }

    /// Let every local consumer port pull what it has room for
    fn pull_local(&mut self) -> usize {
        let mut posted = Vec::new();
        for (index, set) in self.consumers.iter_mut().enumerate() {
            posted.extend(
                set.pull_data(&self.producers, &self.xfers, &mut self.pulling, self.mode)
                    .into_iter()
                    .map(|t| t.in_set(index)),
            );
        }
        let count = posted.len();
        for template in posted {
            self.settle(template);
        }
        count
    }
}
