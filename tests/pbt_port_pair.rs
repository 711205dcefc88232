//! Property-based testing of one producer/consumer port pair
//!
//! A reference model tracks which messages sit in consumer buffers and
//! which wait in Full producer buffers. Random sequences of produce,
//! consume and dispatch steps are run against a real circuit in both the
//! push (ActiveMessage -> ActiveFlowControl) and pull (ActiveFlowControl ->
//! ActiveMessage) patterns, with count and toggle feedback.

use std::collections::VecDeque;

use proptest::prelude::*;
use proptest_state_machine::{prop_state_machine, ReferenceStateMachine, StateMachineTest};

use dataplane::circuit::{CircuitSpec, PortSetSpec, ProduceStatus};
use dataplane::config::TransportConfig;
use dataplane::port::{PortRole, RoleOptions, RoleRequest};
use dataplane::transport::Transport;
use dataplane::CircuitId;

#[derive(Clone, Debug)]
pub enum Transition {
    /// Claim, fill and produce one message
    Produce { payload: u8 },
    /// Claim a producer buffer and hand it back unfilled
    Abandon,
    /// Read and release the oldest received message
    Consume,
    /// Run one dispatch pass
    Dispatch,
}

/// Expected circuit contents
#[derive(Clone, Debug)]
pub struct PortPairModel {
    pull: bool,
    toggle: bool,
    producer_buffers: usize,
    consumer_buffers: usize,
    next_opcode: u32,
    /// Produced messages still held in producer buffers, oldest first
    pending: VecDeque<u32>,
    /// Messages sitting in consumer buffers, oldest first
    delivered: VecDeque<u32>,
    /// Outcome of the last produce
    last_transferred: Option<bool>,
    /// Outcome of the last consume
    last_consumed: Option<u32>,
}

impl PortPairModel {
    fn producer_has_room(&self) -> bool {
        self.pending.len() < self.producer_buffers
    }

    fn settle(&mut self) {
        while self.delivered.len() < self.consumer_buffers {
            match self.pending.pop_front() {
                Some(opcode) => self.delivered.push_back(opcode),
                None => break,
            }
        }
    }
}

impl ReferenceStateMachine for PortPairModel {
    type State = Self;
    type Transition = Transition;

    fn init_state() -> BoxedStrategy<Self::State> {
        (any::<bool>(), any::<bool>(), 1usize..=3, 1usize..=3)
            .prop_map(|(pull, toggle, producer_buffers, consumer_buffers)| Self {
                pull,
                toggle,
                producer_buffers,
                consumer_buffers,
                next_opcode: 1,
                pending: VecDeque::new(),
                delivered: VecDeque::new(),
                last_transferred: None,
                last_consumed: None,
            })
            .boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let mut strategies: Vec<BoxedStrategy<Transition>> = vec![
            Just(Transition::Consume).boxed(),
            Just(Transition::Dispatch).boxed(),
        ];
        if state.producer_has_room() {
            strategies.push(any::<u8>().prop_map(|payload| Transition::Produce { payload }).boxed());
            strategies.push(Just(Transition::Abandon).boxed());
        }
        prop::strategy::Union::new(strategies).boxed()
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            Transition::Produce { .. } | Transition::Abandon => state.producer_has_room(),
            Transition::Consume | Transition::Dispatch => true,
        }
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            Transition::Produce { .. } => {
                let opcode = state.next_opcode;
                state.next_opcode += 1;
                let immediate = state.pending.is_empty() && state.delivered.len() < state.consumer_buffers;
                if immediate {
                    state.delivered.push_back(opcode);
                } else {
                    state.pending.push_back(opcode);
                }
                state.last_transferred = Some(immediate);
            }
            Transition::Consume => {
                state.last_consumed = state.delivered.pop_front();
                state.settle();
            }
            Transition::Abandon | Transition::Dispatch => {}
        }
        state
    }
}

pub struct PortPairTest {
    transport: Transport,
    id: CircuitId,
    next_opcode: u32,
}

impl PortPairTest {
    fn request(role: PortRole, toggle: bool) -> RoleRequest {
        RoleRequest::new(role).with_options(RoleOptions::default().with_feedback_is_count(!toggle))
    }
}

impl StateMachineTest for PortPairTest {
    type SystemUnderTest = Self;
    type Reference = PortPairModel;

    fn init_test(ref_state: &<Self::Reference as ReferenceStateMachine>::State) -> Self::SystemUnderTest {
        let (producer_role, consumer_role) = if ref_state.pull {
            (PortRole::ActiveFlowControl, PortRole::ActiveMessage)
        } else {
            (PortRole::ActiveMessage, PortRole::ActiveFlowControl)
        };
        let mut config = TransportConfig::default();
        config.endpoints.region_size = 256 * 1024;
        let transport = Transport::with_defaults(config);
        let spec = CircuitSpec::new(
            PortSetSpec::new(1, ref_state.producer_buffers, 32, producer_role)
                .with_role(Self::request(producer_role, ref_state.toggle)),
            vec![PortSetSpec::new(1, ref_state.consumer_buffers, 32, consumer_role)
                .with_role(Self::request(consumer_role, ref_state.toggle))],
        );
        let id = transport.create_circuit(&spec).expect("circuit should build");
        Self {
            transport,
            id,
            next_opcode: 1,
        }
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        let t = &state.transport;
        match transition {
            Transition::Produce { payload } => {
                let mut buffer = t
                    .get_empty_buffer(state.id, 0)
                    .unwrap()
                    .expect("model says a producer buffer is free");
                let n = buffer.fill(&[payload; 4]);
                let status = t.produce(buffer, state.next_opcode, n).unwrap();
                state.next_opcode += 1;
                assert_eq!(
                    status == ProduceStatus::Transferred,
                    ref_state.last_transferred.unwrap(),
                    "produce status mismatch"
                );
            }
            Transition::Abandon => {
                let buffer = t
                    .get_empty_buffer(state.id, 0)
                    .unwrap()
                    .expect("model says a producer buffer is free");
                t.release(buffer).unwrap();
            }
            Transition::Consume => {
                let got = t.get_full_buffer(state.id, 0, 0).unwrap().map(|buffer| {
                    let opcode = buffer.opcode();
                    assert_eq!(buffer.length(), 4);
                    t.release(buffer).unwrap();
                    opcode
                });
                assert_eq!(got, ref_state.last_consumed, "consumed message mismatch");
            }
            Transition::Dispatch => {
                t.dispatch();
            }
        }
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        let t = &state.transport;
        assert_eq!(
            t.has_empty_buffer(state.id, 0).unwrap(),
            ref_state.producer_has_room(),
            "producer room mismatch"
        );
        assert_eq!(
            t.has_full_buffer(state.id, 0, 0).unwrap(),
            !ref_state.delivered.is_empty(),
            "consumer contents mismatch"
        );
        assert_eq!(t.in_flight(state.id).unwrap(), 0);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn pbt_port_pair_operations(
        sequential 1..40 => PortPairTest
    );
}
