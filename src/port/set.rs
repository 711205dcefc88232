//! Port sets and distribution metadata
//!
//! A port set groups the ports of one side of a circuit (the producers, or
//! one set of consumers). Its [`Distribution`] decides how buffers spread
//! over the set: `Parallel` consumers each receive every buffer, `Sequential`
//! consumers receive disjoint buffers chosen by a [`SubPolicy`]. On the
//! producer side `Sequential` makes producer ports take turns.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::role::{PortRole, RoleRequest};
use super::{Locality, Port, Side};
use crate::buffer::{BufferState, FlagMode};
use crate::controller::TransferTemplate;
use crate::driver::XferTable;
use crate::error::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    /// Whole: every port sees every buffer
    Parallel,
    /// Buffers are split across ports
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubPolicy {
    RoundRobin,
    Random,
    LeastBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Distribution {
    pub kind: DistributionKind,
    pub policy: SubPolicy,
}

impl Distribution {
    pub fn parallel() -> Self {
        Self {
            kind: DistributionKind::Parallel,
            policy: SubPolicy::RoundRobin,
        }
    }

    pub fn sequential(policy: SubPolicy) -> Self {
        Self {
            kind: DistributionKind::Sequential,
            policy,
        }
    }
}

impl Default for Distribution {
    fn default() -> Self {
        Self::parallel()
    }
}

/// Producer buffers a puller has in flight: (producer ordinal, buffer, lane)
pub type PullSet = HashSet<(usize, usize, usize)>;

/// Ordered collection of the ports on one side of a circuit
#[derive(Debug)]
pub struct PortSet {
    side: Side,
    distribution: Distribution,
    request: RoleRequest,
    role: PortRole,
    buffer_count: usize,
    buffer_size: usize,
    ports: Vec<Option<Port>>,
}

impl PortSet {
    pub fn new(
        side: Side,
        distribution: Distribution,
        request: RoleRequest,
        width: usize,
        buffer_count: usize,
        buffer_size: usize,
    ) -> Self {
        Self {
            side,
            distribution,
            request,
            role: request.role,
            buffer_count,
            buffer_size,
            ports: (0..width).map(|_| None).collect(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    /// Role requested before negotiation
    pub fn request(&self) -> RoleRequest {
        self.request
    }

    /// Role after negotiation
    pub fn role(&self) -> PortRole {
        self.role
    }

    pub(crate) fn set_role(&mut self, role: PortRole) {
        self.role = role;
        for port in self.ports_mut() {
            port.set_role(role);
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of port slots, filled or not
    pub fn width(&self) -> usize {
        self.ports.len()
    }

    /// Place a port at its ordinal
    pub fn insert(&mut self, port: Port) -> Result<()> {
        let ordinal = port.ordinal();
        let len = self.ports.len();
        let slot = self.ports.get_mut(ordinal).ok_or_else(|| {
            TransportError::InvalidPort(format!("ordinal {} outside set of {}", ordinal, len))
        })?;
        if slot.is_some() {
            return Err(TransportError::InvalidPort(format!(
                "ordinal {} already populated",
                ordinal
            )));
        }
        *slot = Some(port);
        Ok(())
    }

    /// Every ordinal has a port
    pub fn is_complete(&self) -> bool {
        self.ports.iter().all(Option::is_some)
    }

    pub fn port(&self, ordinal: usize) -> Option<&Port> {
        self.ports.get(ordinal).and_then(Option::as_ref)
    }

    pub fn port_mut(&mut self, ordinal: usize) -> Option<&mut Port> {
        self.ports.get_mut(ordinal).and_then(Option::as_mut)
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().flatten()
    }

    pub fn ports_mut(&mut self) -> impl Iterator<Item = &mut Port> {
        self.ports.iter_mut().flatten()
    }

    /// Lanes of every port in the set as a bitmask
    pub fn lane_mask(&self) -> u32 {
        self.ports().fold(0, |mask, p| mask | (1u32 << p.lane()))
    }

    /// Pull every buffer that local consumers in this set can accept
    ///
    /// For each local port, repeatedly pairs the lowest-sequence producer
    /// buffer addressed to its lane with one of its own Empty buffers and
    /// posts the copy. Returns the templates posted.
    pub fn pull_data(
        &mut self,
        producers: &PortSet,
        xfers: &XferTable,
        pulling: &mut PullSet,
        mode: FlagMode,
    ) -> Vec<TransferTemplate> {
        let mut posted = Vec::new();

        for consumer in self.ports_mut() {
            if consumer.locality() != Locality::Local {
                continue;
            }
            let lane = consumer.lane();

            loop {
                let Some((producer, buffer, fill)) = next_pull_source(producers, lane, pulling, mode)
                else {
                    break;
                };
                let Some(target) = consumer.next_from_ring(|port, k| {
                    port.slot(k).selectable() && port.own_state(k) == BufferState::Empty
                }) else {
                    break;
                };
                let Some(port) = producers.port(producer) else {
                    break;
                };
                let Some(xfer) = xfers.get(port.endpoint(), consumer.endpoint()) else {
                    tracing::warn!(
                        "No copy service from {} to {}",
                        port.endpoint(),
                        consumer.endpoint()
                    );
                    break;
                };

                pulling.insert((producer, buffer, lane));
                let template = TransferTemplate::pull(
                    xfer.as_ref(),
                    port,
                    buffer,
                    fill,
                    consumer,
                    target,
                    mode,
                );
                tracing::trace!(
                    "Lane {} pulling producer {} buffer {} into buffer {}",
                    lane,
                    producer,
                    buffer,
                    target
                );
                posted.push(template);
            }
        }

        posted
    }
}

/// Lowest-sequence producer buffer that is Full for `lane` and not yet pulled
fn next_pull_source(
    producers: &PortSet,
    lane: usize,
    pulling: &PullSet,
    mode: FlagMode,
) -> Option<(usize, usize, u64)> {
    producers
        .ports()
        .flat_map(|port| {
            (0..port.buffer_count()).filter_map(move |k| {
                if pulling.contains(&(port.ordinal(), k, lane)) {
                    return None;
                }
                let fill = port.observed_fill(k, lane);
                if mode.state(fill, port.drain_word(k, lane)) != BufferState::Full {
                    return None;
                }
                let meta = port.meta(k);
                meta.targets_lane(lane)
                    .then_some((meta.sequence, port.ordinal(), k, fill))
            })
        })
        .min_by_key(|(sequence, ..)| *sequence)
        .map(|(_, producer, k, fill)| (producer, k, fill))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(width: usize) -> PortSet {
        PortSet::new(
            Side::Consumer,
            Distribution::sequential(SubPolicy::LeastBusy),
            RoleRequest::new(PortRole::ActiveFlowControl),
            width,
            2,
            64,
        )
    }

    #[test]
    fn test_distribution_defaults() {
        let d = Distribution::default();
        assert_eq!(d.kind, DistributionKind::Parallel);
        assert_eq!(
            Distribution::sequential(SubPolicy::Random).kind,
            DistributionKind::Sequential
        );
    }

    #[test]
    fn test_empty_set_is_incomplete() {
        let set = set(3);
        assert_eq!(set.width(), 3);
        assert!(!set.is_complete());
        assert!(set.port(0).is_none());
        assert!(set.port(5).is_none());
        assert_eq!(set.ports().count(), 0);
        assert_eq!(set.lane_mask(), 0);
    }

    #[test]
    fn test_zero_width_set_is_complete() {
        assert!(set(0).is_complete());
    }

    #[test]
    fn test_policy_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: SubPolicy,
            kind: DistributionKind,
        }
        let w: Wrapper = toml::from_str("policy = \"least_busy\"\nkind = \"sequential\"").unwrap();
        assert_eq!(w.policy, SubPolicy::LeastBusy);
        assert_eq!(w.kind, DistributionKind::Sequential);
    }
}
