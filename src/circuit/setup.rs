//! Circuit construction
//!
//! A local circuit negotiates and builds every port in one call. A circuit
//! spanning two transports is built in two halves through a four-step
//! descriptor exchange:
//!
//! 1. `create_input`: the consumer allocates its port and describes it with
//!    its requested role
//! 2. `connect_output`: the producer negotiates, maps the consumer and
//!    answers with its final role (and a shadow block when the consumer is
//!    ActiveFlowControl)
//! 3. `finalize_input`: the consumer adopts the complementary role, maps the
//!    producer and answers (with a shadow block when the producer is
//!    ActiveFlowControl)
//! 4. `finalize_output`: the producer maps that shadow block
//!
//! Each half carries exactly one local and one remote port. A failed step
//! leaves the half unusable; the transport discards it.

use std::collections::VecDeque;
use std::sync::Arc;

use super::{Circuit, CircuitState};
use crate::buffer::{FlagMode, PortLayout};
use crate::config::PortConfig;
use crate::constants::MAX_LANES;
use crate::controller::{PatternKey, TransferController};
use crate::descriptor::{DescriptorMessage, MessageKind, PortDescriptor};
use crate::driver::{XferService, XferTable};
use crate::error::{CircuitId, Result, TransportError};
use crate::memory::SharedMemoryService;
use crate::port::{
    negotiate, Distribution, Negotiated, Port, PortParams, PortRole, PortSet, PullSet, RoleRequest,
    Side,
};

/// What construction needs from the owning transport
pub trait Resources {
    /// Service of this participant's endpoint for `protocol` (or the default)
    fn local_service(&mut self, protocol: Option<&str>) -> Result<Arc<dyn SharedMemoryService>>;

    /// Service attached to a peer's endpoint
    fn remote_service(&mut self, address: &str) -> Result<Arc<dyn SharedMemoryService>>;

    /// Copy engine landing data in `target`
    fn xfer_service(
        &mut self,
        source: &Arc<dyn SharedMemoryService>,
        target: &Arc<dyn SharedMemoryService>,
    ) -> Result<Arc<dyn XferService>>;
}

/// One side of a circuit as requested by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSetSpec {
    pub ports: usize,
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub distribution: Distribution,
    pub role: RoleRequest,
    /// Endpoint protocol; `None` uses the transport default
    pub protocol: Option<String>,
}

impl PortSetSpec {
    pub fn new(ports: usize, buffer_count: usize, buffer_size: usize, role: PortRole) -> Self {
        Self {
            ports,
            buffer_count,
            buffer_size,
            distribution: Distribution::default(),
            role: RoleRequest::new(role),
            protocol: None,
        }
    }

    /// Producer set with the configured defaults
    pub fn producer(config: &PortConfig, ports: usize) -> Self {
        Self::new(ports, config.buffer_count, config.buffer_size, config.producer_role)
    }

    /// Consumer set with the configured defaults
    pub fn consumer(config: &PortConfig, ports: usize) -> Self {
        Self::new(ports, config.buffer_count, config.buffer_size, config.consumer_role)
    }

    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn with_role(mut self, role: RoleRequest) -> Self {
        self.role = role;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    fn layout(&self, lanes: usize) -> Result<PortLayout> {
        if self.ports == 0 {
            return Err(TransportError::InvalidPort("port set has no ports".to_string()));
        }
        PortLayout::new(self.buffer_count, self.buffer_size, lanes)
    }

    fn empty_set(&self, side: Side) -> PortSet {
        PortSet::new(
            side,
            self.distribution,
            self.role,
            self.ports,
            self.buffer_count,
            self.buffer_size,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSpec {
    pub producer: PortSetSpec,
    pub consumers: Vec<PortSetSpec>,
}

impl CircuitSpec {
    pub fn new(producer: PortSetSpec, consumers: Vec<PortSetSpec>) -> Self {
        Self {
            producer,
            consumers,
        }
    }
}

fn check_capacity(producer: &PortLayout, consumer: &PortLayout) -> Result<()> {
    if consumer.buffer_size < producer.buffer_size {
        return Err(TransportError::InvalidPort(format!(
            "consumer buffers of {} bytes cannot hold producer buffers of {} bytes",
            consumer.buffer_size, producer.buffer_size
        )));
    }
    Ok(())
}

fn single_port(spec: &PortSetSpec) -> Result<()> {
    if spec.ports != 1 {
        return Err(TransportError::InvalidPort(format!(
            "a connected circuit half carries one port, got {}",
            spec.ports
        )));
    }
    Ok(())
}

fn select_controllers(
    producers: &PortSet,
    consumers: &[PortSet],
    roles: &Negotiated,
) -> Result<Vec<TransferController>> {
    consumers
        .iter()
        .enumerate()
        .map(|(index, set)| {
            let key = PatternKey::new(producers, set, roles);
            TransferController::select(&key, set.distribution().policy, index, roles.mode)
        })
        .collect()
}

impl Circuit {
    fn assemble(
        id: CircuitId,
        state: CircuitState,
        roles: Option<Negotiated>,
        mode: FlagMode,
        producers: PortSet,
        consumers: Vec<PortSet>,
    ) -> Self {
        Self {
            id,
            state,
            roles,
            mode,
            producers,
            consumers,
            controllers: Vec::new(),
            xfers: XferTable::new(),
            queue: VecDeque::new(),
            in_flight: Vec::new(),
            pulling: PullSet::new(),
            sequence: 0,
            turn: 0,
            peer_cookie: None,
        }
    }

    /// Build a circuit whose ports all live in this participant
    pub fn local(id: CircuitId, spec: &CircuitSpec, res: &mut dyn Resources) -> Result<Self> {
        if spec.consumers.is_empty() {
            return Err(TransportError::InvalidPort("circuit has no consumer set".to_string()));
        }
        let lanes: usize = spec.consumers.iter().map(|c| c.ports).sum();
        if lanes > MAX_LANES {
            return Err(TransportError::InvalidPort(format!(
                "{} consumer ports exceed the limit of {}",
                lanes, MAX_LANES
            )));
        }

        let mut roles: Option<Negotiated> = None;
        for consumer in &spec.consumers {
            let pair = negotiate(spec.producer.role, consumer.role)?;
            match roles {
                Some(agreed) if agreed.producer != pair.producer => {
                    return Err(TransportError::IncompatibleRoles(format!(
                        "consumer sets need producer roles {:?} and {:?}",
                        agreed.producer, pair.producer
                    )));
                }
                _ => roles = Some(pair),
            }
        }
        let roles = roles.ok_or_else(|| TransportError::InvalidPort("no consumer set".to_string()))?;
        let mode = roles.mode;

        let producer_layout = spec.producer.layout(lanes.max(1))?;
        let producer_service = res.local_service(spec.producer.protocol.as_deref())?;
        let mut producers = spec.producer.empty_set(Side::Producer);
        producers.set_role(roles.producer);
        for ordinal in 0..spec.producer.ports {
            let params = PortParams {
                ordinal,
                lane: 0,
                side: Side::Producer,
                role: roles.producer,
                options: spec.producer.role.options,
                mode,
            };
            producers.insert(Port::local(params, Arc::clone(&producer_service), producer_layout)?)?;
        }

        let mut consumers = Vec::with_capacity(spec.consumers.len());
        let mut lane = 0;
        for consumer in &spec.consumers {
            let layout = consumer.layout(1)?;
            check_capacity(&producer_layout, &layout)?;
            let service = res.local_service(consumer.protocol.as_deref())?;
            let mut set = consumer.empty_set(Side::Consumer);
            set.set_role(roles.consumer);
            for ordinal in 0..consumer.ports {
                let params = PortParams {
                    ordinal,
                    lane,
                    side: Side::Consumer,
                    role: roles.consumer,
                    options: consumer.role.options,
                    mode,
                };
                set.insert(Port::local(params, Arc::clone(&service), layout)?)?;
                lane += 1;
            }
            consumers.push(set);
        }

        let mut xfers = XferTable::new();
        for set in consumers.iter_mut() {
            for consumer in set.ports_mut() {
                for producer in producers.ports() {
                    if roles.consumer.sends_feedback() {
                        let shadow = producer.allocate_shadow(consumer.buffer_count())?;
                        consumer.attach_shadow(producer.ordinal(), shadow);
                    }
                    if !xfers.contains(producer.endpoint(), consumer.endpoint()) {
                        let xfer = res.xfer_service(producer.service(), consumer.service())?;
                        xfers.insert(producer.endpoint(), consumer.endpoint(), xfer);
                    }
                }
            }
        }
        if roles.producer.sends_feedback() {
            for producer in producers.ports_mut() {
                for set in &consumers {
                    for consumer in set.ports() {
                        let shadow = consumer.allocate_shadow(producer.buffer_count())?;
                        producer.attach_shadow(consumer.lane(), shadow);
                    }
                }
            }
        }

        let controllers = select_controllers(&producers, &consumers, &roles)?;

        tracing::info!(
            "Circuit {} ready: {} producer ports ({:?}) -> {} consumer sets ({:?}), {} lanes",
            id,
            producers.width(),
            roles.producer,
            consumers.len(),
            roles.consumer,
            lanes
        );

        let mut circuit = Self::assemble(id, CircuitState::Ready, Some(roles), mode, producers, consumers);
        circuit.controllers = controllers;
        circuit.xfers = xfers;
        Ok(circuit)
    }

    /// Step 1: create the consumer half and its initial descriptor
    pub fn create_input(
        id: CircuitId,
        spec: &PortSetSpec,
        res: &mut dyn Resources,
    ) -> Result<(Self, Vec<u8>)> {
        single_port(spec)?;
        let mode = spec.role.options.flag_mode();
        let service = res.local_service(spec.protocol.as_deref())?;
        let params = PortParams {
            ordinal: 0,
            lane: 0,
            side: Side::Consumer,
            role: spec.role.role,
            options: spec.role.options,
            mode,
        };
        let port = Port::local(params, Arc::clone(&service), spec.layout(1)?)?;
        let descriptor = describe(&port, None, id)?;

        let mut set = spec.empty_set(Side::Consumer);
        set.insert(port)?;
        let producers = PortSet::new(
            Side::Producer,
            Distribution::default(),
            RoleRequest::new(spec.role.role.complement()),
            1,
            0,
            0,
        );

        tracing::info!("Circuit {} awaiting producer for input on {}", id, service.endpoint());
        let circuit = Self::assemble(id, CircuitState::AwaitingPeer, None, mode, producers, vec![set]);
        Ok((
            circuit,
            DescriptorMessage::new(MessageKind::ConsumerInitial, descriptor).encode(),
        ))
    }

    /// Step 2: create the producer half against a consumer's descriptor
    pub fn connect_output(
        id: CircuitId,
        spec: &PortSetSpec,
        input: &[u8],
        res: &mut dyn Resources,
    ) -> Result<(Self, Vec<u8>)> {
        single_port(spec)?;
        let theirs = DescriptorMessage::expect(input, MessageKind::ConsumerInitial)?;
        let request = RoleRequest::new(theirs.role()?).with_options(theirs.options());
        let roles = negotiate(spec.role, request)?;
        let mode = roles.mode;

        let remote = res.remote_service(theirs.origin()?)?;
        let local = res.local_service(spec.protocol.as_deref())?;

        let mut consumer = Port::remote(
            PortParams {
                ordinal: 0,
                lane: 0,
                side: Side::Consumer,
                role: roles.consumer,
                options: request.options,
                mode,
            },
            Arc::clone(&remote),
            &theirs,
        )?;
        let layout = spec.layout(1)?;
        check_capacity(&layout, consumer.layout())?;
        let producer = Port::local(
            PortParams {
                ordinal: 0,
                lane: 0,
                side: Side::Producer,
                role: roles.producer,
                options: spec.role.options,
                mode,
            },
            Arc::clone(&local),
            layout,
        )?;

        let mut descriptor = describe(&producer, Some(roles.consumer), theirs.oob.cookie)?;
        if roles.consumer.sends_feedback() {
            let shadow = producer.allocate_shadow(consumer.buffer_count())?;
            descriptor.set_shadow(shadow.base(), shadow.count());
            consumer.attach_shadow(0, shadow);
        }

        let mut producers = spec.empty_set(Side::Producer);
        producers.set_role(roles.producer);
        producers.insert(producer)?;
        let mut consumers = PortSet::new(
            Side::Consumer,
            Distribution::default(),
            request,
            1,
            consumer.buffer_count(),
            consumer.layout().buffer_size,
        );
        consumers.set_role(roles.consumer);
        consumers.insert(consumer)?;

        let consumers = vec![consumers];
        let controllers = select_controllers(&producers, &consumers, &roles)?;
        let mut xfers = XferTable::new();
        xfers.insert(local.endpoint(), remote.endpoint(), res.xfer_service(&local, &remote)?);

        // an ActiveFlowControl producer needs the consumer's shadow block first
        let state = if roles.producer.sends_feedback() {
            CircuitState::AwaitingPeer
        } else {
            CircuitState::Ready
        };
        tracing::info!(
            "Circuit {} output connected to {} as {:?} ({:?})",
            id,
            remote.endpoint(),
            roles.producer,
            state
        );

        let mut circuit = Self::assemble(id, state, Some(roles), mode, producers, consumers);
        circuit.controllers = controllers;
        circuit.xfers = xfers;
        circuit.peer_cookie = Some(theirs.oob.cookie);
        Ok((
            circuit,
            DescriptorMessage::new(MessageKind::ProducerFinal, descriptor).encode(),
        ))
    }

    /// Step 3: complete the consumer half from the producer's answer
    pub fn finalize_input(&mut self, output: &[u8], res: &mut dyn Resources) -> Result<Vec<u8>> {
        if self.state != CircuitState::AwaitingPeer || self.roles.is_some() {
            return Err(TransportError::InvalidDescriptor(format!(
                "circuit {} is not an input awaiting its producer",
                self.id
            )));
        }
        let theirs = DescriptorMessage::expect(output, MessageKind::ProducerFinal)?;
        if theirs.oob.cookie != self.id {
            return Err(TransportError::InvalidDescriptor(format!(
                "answer for circuit {} delivered to circuit {}",
                theirs.oob.cookie, self.id
            )));
        }

        let producer_role = theirs.role()?;
        let consumer_role = producer_role.complement();
        let request = self.consumers[0].request();
        if theirs.options().feedback_is_count() != request.options.feedback_is_count() {
            return Err(TransportError::IncompatibleRoles(
                "producer disagrees on FeedbackIsCount".to_string(),
            ));
        }
        if !request.options.supports(consumer_role)
            || (request.options.mandated() && request.role != consumer_role)
        {
            return Err(TransportError::IncompatibleRoles(format!(
                "producer chose {:?}, leaving unacceptable consumer role {:?}",
                producer_role, consumer_role
            )));
        }
        let roles = Negotiated {
            producer: producer_role,
            consumer: consumer_role,
            mode: self.mode,
        };

        let remote = res.remote_service(theirs.origin()?)?;
        let mut producer = Port::remote(
            PortParams {
                ordinal: 0,
                lane: 0,
                side: Side::Producer,
                role: producer_role,
                options: theirs.options(),
                mode: self.mode,
            },
            Arc::clone(&remote),
            &theirs,
        )?;

        let id = self.id;
        let consumer = self
            .consumers
            .first_mut()
            .and_then(|s| s.port_mut(0))
            .ok_or_else(|| TransportError::InvalidPort("input port missing".to_string()))?;
        check_capacity(producer.layout(), consumer.layout())?;

        match (theirs.shadow(), consumer_role.sends_feedback()) {
            (Some((base, words)), true) => {
                let shadow = producer.map_shadow(base, words)?;
                consumer.attach_shadow(0, shadow);
            }
            (None, false) => {}
            (Some(_), false) => {
                return Err(TransportError::InvalidDescriptor(format!(
                    "unexpected shadow block for a {:?} consumer",
                    consumer_role
                )))
            }
            (None, true) => {
                return Err(TransportError::InvalidDescriptor(
                    "producer did not provide a shadow block".to_string(),
                ))
            }
        }

        let mut descriptor = describe(consumer, Some(producer_role), id)?;
        if producer_role.sends_feedback() {
            let shadow = consumer.allocate_shadow(producer.buffer_count())?;
            descriptor.set_shadow(shadow.base(), shadow.count());
            producer.attach_shadow(consumer.lane(), shadow);
        }
        let local = Arc::clone(consumer.service());
        self.consumers[0].set_role(consumer_role);

        let mut producers = PortSet::new(
            Side::Producer,
            Distribution::default(),
            RoleRequest::new(producer_role).with_options(theirs.options()),
            1,
            producer.buffer_count(),
            producer.layout().buffer_size,
        );
        producers.insert(producer)?;
        let controllers = select_controllers(&producers, &self.consumers, &roles)?;
        let xfer = res.xfer_service(&remote, &local)?;

        self.xfers.insert(remote.endpoint(), local.endpoint(), xfer);
        self.producers = producers;
        self.controllers = controllers;
        self.roles = Some(roles);
        self.state = CircuitState::Ready;
        tracing::info!(
            "Circuit {} input connected to {} as {:?}",
            self.id,
            remote.endpoint(),
            consumer_role
        );

        Ok(DescriptorMessage::new(MessageKind::ConsumerFinal, descriptor).encode())
    }

    /// Step 4: complete the producer half from the consumer's final answer
    pub fn finalize_output(&mut self, input: &[u8]) -> Result<()> {
        let (Some(roles), Some(cookie)) = (self.roles, self.peer_cookie) else {
            return Err(TransportError::InvalidDescriptor(format!(
                "circuit {} is not a connected output",
                self.id
            )));
        };
        let theirs = DescriptorMessage::expect(input, MessageKind::ConsumerFinal)?;
        if theirs.oob.cookie != cookie {
            return Err(TransportError::InvalidDescriptor(format!(
                "final descriptor of input {} delivered to output {}",
                theirs.oob.cookie, self.id
            )));
        }
        if theirs.role()? != roles.consumer {
            return Err(TransportError::IncompatibleRoles(format!(
                "consumer settled on {:?}, expected {:?}",
                theirs.role()?,
                roles.consumer
            )));
        }

        if roles.producer.sends_feedback() && self.state == CircuitState::AwaitingPeer {
            let (base, words) = theirs.shadow().ok_or_else(|| {
                TransportError::InvalidDescriptor("consumer did not provide a shadow block".to_string())
            })?;
            let shadow = self
                .consumers
                .first()
                .and_then(|s| s.port(0))
                .ok_or_else(|| TransportError::InvalidPort("output peer port missing".to_string()))?
                .map_shadow(base, words)?;
            let producer = self
                .producers
                .port_mut(0)
                .ok_or_else(|| TransportError::InvalidPort("output port missing".to_string()))?;
            producer.attach_shadow(0, shadow);
        }

        self.state = CircuitState::Ready;
        tracing::info!("Circuit {} output finalized", self.id);
        Ok(())
    }
}

/// Descriptor of a local port stamped with its origin and a cookie
fn describe(port: &Port, peer: Option<PortRole>, cookie: u64) -> Result<PortDescriptor> {
    let mut descriptor = port.descriptor(peer);
    descriptor.set_origin(port.endpoint().as_str())?;
    descriptor.oob.port_id = port.ordinal() as u32;
    descriptor.oob.cookie = cookie;
    Ok(descriptor)
}
