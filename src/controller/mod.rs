//! Transfer controllers
//!
//! One controller governs the traffic from the producer set to one consumer
//! set. It is chosen once, at circuit setup, from the pattern tuple
//! (producer distribution, consumer distribution, producer role, consumer
//! role, shadow) and then answers three questions:
//!
//! * `can_transfer`: where a producer buffer may be pushed right now
//! * `produce`: which consumer lanes a pulled buffer is addressed to
//! * `consume`: how a consumer hands a buffer back to its producers

pub mod template;

use rand::Rng;

use crate::buffer::FlagMode;
use crate::error::{Result, TransportError};
use crate::port::{DistributionKind, Negotiated, Port, PortRole, PortSet, SubPolicy};

pub use template::{TemplateKind, TemplateTarget, TransferTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    /// Producer pushes every buffer to every consumer port
    Broadcast,
    /// Producer pushes each buffer to one consumer port
    FanOut,
    /// Every consumer port pulls every buffer
    PullBroadcast,
    /// Each buffer is pulled by the one consumer port it is addressed to
    PullFanOut,
}

impl ControllerKind {
    pub fn is_push(self) -> bool {
        matches!(self, ControllerKind::Broadcast | ControllerKind::FanOut)
    }
}

/// The tuple a controller is selected by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatternKey {
    pub producer_distribution: DistributionKind,
    pub consumer_distribution: DistributionKind,
    pub producer_role: PortRole,
    pub consumer_role: PortRole,
    pub shadow: bool,
}

impl PatternKey {
    pub fn new(producers: &PortSet, consumers: &PortSet, roles: &Negotiated) -> Self {
        Self {
            producer_distribution: producers.distribution().kind,
            consumer_distribution: consumers.distribution().kind,
            producer_role: roles.producer,
            consumer_role: roles.consumer,
            shadow: roles.shadow(),
        }
    }
}

/// A destination chosen by `can_transfer`: (consumer ordinal, buffer)
pub type Destination = (usize, usize);

#[derive(Debug)]
pub struct TransferController {
    kind: ControllerKind,
    shadow: bool,
    policy: SubPolicy,
    set: usize,
    rotation: usize,
    choice: Option<usize>,
}

impl TransferController {
    /// Select the controller for consumer set `set`
    pub fn select(key: &PatternKey, policy: SubPolicy, set: usize, mode: FlagMode) -> Result<Self> {
        use DistributionKind::{Parallel, Sequential};
        use PortRole::{ActiveFlowControl as Afc, ActiveMessage as Am, ActiveOnly as Ao, Passive};

        let kind = match (
            key.producer_distribution,
            key.consumer_distribution,
            key.producer_role,
            key.consumer_role,
            key.shadow,
        ) {
            (_, Parallel, Am, Afc, true) | (_, Parallel, Ao, Passive, false) => ControllerKind::Broadcast,
            (_, Sequential, Am, Afc, true) | (_, Sequential, Ao, Passive, false) => ControllerKind::FanOut,
            (_, Parallel, Afc, Am, true) | (_, Parallel, Passive, Ao, false) => {
                ControllerKind::PullBroadcast
            }
            (_, Sequential, Afc, Am, true) | (_, Sequential, Passive, Ao, false) => {
                ControllerKind::PullFanOut
            }
            _ => {
                return Err(TransportError::UnsupportedPattern(format!("{:?}", key)));
            }
        };

        if kind == ControllerKind::PullFanOut && mode == FlagMode::Toggle {
            return Err(TransportError::UnsupportedPattern(
                "pulled fan-out needs count feedback".to_string(),
            ));
        }

        tracing::debug!(
            "Consumer set {} uses {:?} controller (policy {:?}, shadow {})",
            set,
            kind,
            policy,
            key.shadow
        );

        Ok(Self {
            kind,
            shadow: key.shadow,
            policy,
            set,
            rotation: 0,
            choice: None,
        })
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn shadow(&self) -> bool {
        self.shadow
    }

    pub fn policy(&self) -> SubPolicy {
        self.policy
    }

    /// Consumer set this controller serves
    pub fn set(&self) -> usize {
        self.set
    }

    pub fn is_push(&self) -> bool {
        self.kind.is_push()
    }

    /// Destinations a push of `producer`'s buffer may use now
    ///
    /// Broadcast needs an Empty buffer at every consumer port; fan-out only
    /// at the port its policy selects. Returns `None` when blocked and for
    /// pull patterns, where consumers move the data.
    pub fn can_transfer(
        &mut self,
        consumers: &PortSet,
        producer: usize,
        broadcast: bool,
    ) -> Option<Vec<Destination>> {
        match self.kind {
            ControllerKind::PullBroadcast | ControllerKind::PullFanOut => None,
            ControllerKind::Broadcast => every_port(consumers, producer),
            ControllerKind::FanOut if broadcast => every_port(consumers, producer),
            ControllerKind::FanOut => {
                let ordinal = match self.policy {
                    SubPolicy::RoundRobin => self.rotation % consumers.width().max(1),
                    SubPolicy::Random => *self
                        .choice
                        .get_or_insert_with(|| rand::thread_rng().gen_range(0..consumers.width().max(1))),
                    SubPolicy::LeastBusy => consumers
                        .ports()
                        .map(|p| (p.push_capacity(producer), p.ordinal()))
                        .filter(|(free, _)| *free > 0)
                        .max_by_key(|(free, ordinal)| (*free, std::cmp::Reverse(*ordinal)))?
                        .1,
                };
                let port = consumers.port(ordinal)?;
                let buffer = port.next_from_ring(|p, k| p.is_push_target(k, producer))?;
                Some(vec![(ordinal, buffer)])
            }
        }
    }

    /// Record that the destinations from `can_transfer` were used
    pub fn commit(&mut self, broadcast: bool) {
        if self.kind == ControllerKind::FanOut && !broadcast {
            self.rotation = self.rotation.wrapping_add(1);
            self.choice = None;
        }
    }

    /// Consumer lanes a newly produced buffer is addressed to
    pub fn produce(&mut self, consumers: &PortSet, producers: &PortSet, broadcast: bool) -> u32 {
        if self.kind != ControllerKind::PullFanOut || broadcast {
            return consumers.lane_mask();
        }

        let width = consumers.width().max(1);
        let ordinal = match self.policy {
            SubPolicy::RoundRobin => {
                let ordinal = self.rotation % width;
                self.rotation = self.rotation.wrapping_add(1);
                ordinal
            }
            SubPolicy::Random => rand::thread_rng().gen_range(0..width),
            SubPolicy::LeastBusy => consumers
                .ports()
                .map(|p| (outstanding(producers, p.lane()), p.ordinal()))
                .min()
                .map(|(_, ordinal)| ordinal)
                .unwrap_or(0),
        };

        consumers
            .port(ordinal)
            .map(|p| 1u32 << p.lane())
            .unwrap_or_else(|| consumers.lane_mask())
    }

    /// Hand consumer buffer `index` back to the producers
    ///
    /// Writes the local drain word and, when this port keeps shadows at its
    /// producers, the same count into each shadow.
    pub fn consume(&self, consumer: &Port, index: usize) {
        let value = consumer.fill_word(index);
        consumer.store_drain(index, 0, value);
        for (producer, shadow) in consumer.shadows() {
            tracing::trace!(
                "Feedback to producer {} for buffer {}: {}",
                producer,
                index,
                value
            );
            shadow.store(index, value, consumer.mode());
        }
    }
}

fn every_port(consumers: &PortSet, producer: usize) -> Option<Vec<Destination>> {
    consumers
        .ports()
        .map(|port| {
            port.next_from_ring(|p, k| p.is_push_target(k, producer))
                .map(|buffer| (port.ordinal(), buffer))
        })
        .collect()
}

/// Producer buffers addressed to `lane` that it has not drained yet
fn outstanding(producers: &PortSet, lane: usize) -> usize {
    producers
        .ports()
        .map(|port| {
            (0..port.buffer_count())
                .filter(|k| {
                    port.slot(*k).expected & (1u32 << lane) != 0
                        && port
                            .mode()
                            .state(port.fill_word(*k), port.drain_word(*k, lane))
                            == crate::buffer::BufferState::Full
                })
                .count()
        })
        .sum()
}
