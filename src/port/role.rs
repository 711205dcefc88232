//! Port roles and role negotiation
//!
//! Roles come in complementary pairs. In each pair exactly one side moves
//! data:
//!
//! | mover            | peer                |
//! |------------------|---------------------|
//! | `ActiveMessage`  | `ActiveFlowControl` |
//! | `ActiveOnly`     | `Passive`           |
//!
//! `ActiveFlowControl` does not move data but actively writes its buffer
//! state into a shadow block held by the mover. `Passive` only exposes its
//! flag and data addresses and is polled.

use serde::{Deserialize, Serialize};

use crate::buffer::FlagMode;
use crate::error::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum PortRole {
    ActiveMessage = 0,
    ActiveFlowControl = 1,
    ActiveOnly = 2,
    Passive = 3,
}

impl PortRole {
    pub const ALL: [PortRole; 4] = [
        PortRole::ActiveMessage,
        PortRole::ActiveFlowControl,
        PortRole::ActiveOnly,
        PortRole::Passive,
    ];

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(PortRole::ActiveMessage),
            1 => Some(PortRole::ActiveFlowControl),
            2 => Some(PortRole::ActiveOnly),
            3 => Some(PortRole::Passive),
            _ => None,
        }
    }

    /// The only role the other side of a port pair may take
    pub fn complement(self) -> Self {
        match self {
            PortRole::ActiveMessage => PortRole::ActiveFlowControl,
            PortRole::ActiveFlowControl => PortRole::ActiveMessage,
            PortRole::ActiveOnly => PortRole::Passive,
            PortRole::Passive => PortRole::ActiveOnly,
        }
    }

    /// Preference order used to break ties
    pub fn rank(self) -> u8 {
        match self {
            PortRole::ActiveMessage => 3,
            PortRole::ActiveFlowControl => 2,
            PortRole::ActiveOnly => 1,
            PortRole::Passive => 0,
        }
    }

    /// Whether this side performs the data copy
    pub fn moves_data(self) -> bool {
        matches!(self, PortRole::ActiveMessage | PortRole::ActiveOnly)
    }

    /// Whether this side writes its state into a shadow block at the mover
    pub fn sends_feedback(self) -> bool {
        self == PortRole::ActiveFlowControl
    }
}

/// Negotiation option bits carried in a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoleOptions(u32);

impl RoleOptions {
    pub const MANDATED_ROLE: u32 = 1 << 0;
    pub const FEEDBACK_IS_COUNT: u32 = 1 << 1;
    const SUPPORT_SHIFT: u32 = 8;
    const SUPPORT_ALL: u32 = 0b1111 << Self::SUPPORT_SHIFT;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn mandated(self) -> bool {
        self.0 & Self::MANDATED_ROLE != 0
    }

    pub fn with_mandated(self, mandated: bool) -> Self {
        self.set(Self::MANDATED_ROLE, mandated)
    }

    pub fn feedback_is_count(self) -> bool {
        self.0 & Self::FEEDBACK_IS_COUNT != 0
    }

    pub fn with_feedback_is_count(self, enabled: bool) -> Self {
        self.set(Self::FEEDBACK_IS_COUNT, enabled)
    }

    pub fn flag_mode(self) -> FlagMode {
        if self.feedback_is_count() {
            FlagMode::Count
        } else {
            FlagMode::Toggle
        }
    }

    pub fn supports(self, role: PortRole) -> bool {
        self.0 & (1 << (Self::SUPPORT_SHIFT + role as u32)) != 0
    }

    /// Restrict the roles this side can implement
    pub fn with_supported(self, roles: &[PortRole]) -> Self {
        let mut bits = self.0 & !Self::SUPPORT_ALL;
        for role in roles {
            bits |= 1 << (Self::SUPPORT_SHIFT + *role as u32);
        }
        Self(bits)
    }

    fn set(self, bit: u32, on: bool) -> Self {
        if on {
            Self(self.0 | bit)
        } else {
            Self(self.0 & !bit)
        }
    }
}

impl Default for RoleOptions {
    fn default() -> Self {
        Self(Self::FEEDBACK_IS_COUNT | Self::SUPPORT_ALL)
    }
}

/// One side's requested role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleRequest {
    pub role: PortRole,
    pub options: RoleOptions,
}

impl RoleRequest {
    pub fn new(role: PortRole) -> Self {
        Self {
            role,
            options: RoleOptions::default(),
        }
    }

    pub fn mandated(role: PortRole) -> Self {
        Self {
            role,
            options: RoleOptions::default().with_mandated(true),
        }
    }

    pub fn with_options(mut self, options: RoleOptions) -> Self {
        self.options = options;
        self
    }
}

/// Final roles of one producer/consumer port pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub producer: PortRole,
    pub consumer: PortRole,
    pub mode: FlagMode,
}

impl Negotiated {
    /// Producer copies into consumer buffers
    pub fn is_push(&self) -> bool {
        self.producer.moves_data()
    }

    /// An ActiveFlowControl side keeps a shadow at the mover
    pub fn shadow(&self) -> bool {
        self.producer.sends_feedback() || self.consumer.sends_feedback()
    }
}

/// Resolve the roles of a port pair
///
/// A complementary request is kept as is. Otherwise a mandated side keeps
/// its role, and without a mandate the higher-preference request wins (the
/// producer on a tie). The losing side takes the complement of the winner.
pub fn negotiate(producer: RoleRequest, consumer: RoleRequest) -> Result<Negotiated> {
    let (p, c) = (producer.options, consumer.options);

    if p.feedback_is_count() != c.feedback_is_count() {
        return Err(TransportError::IncompatibleRoles(
            "sides disagree on FeedbackIsCount".to_string(),
        ));
    }
    let mode = p.flag_mode();

    let fits = |prod: PortRole, cons: PortRole| {
        prod.complement() == cons && p.supports(prod) && c.supports(cons)
    };
    let done = |prod: PortRole, cons: PortRole| {
        tracing::debug!(
            "Negotiated roles: producer {:?} (requested {:?}), consumer {:?} (requested {:?})",
            prod,
            producer.role,
            cons,
            consumer.role
        );
        Ok(Negotiated {
            producer: prod,
            consumer: cons,
            mode,
        })
    };

    if fits(producer.role, consumer.role) {
        return done(producer.role, consumer.role);
    }

    match (p.mandated(), c.mandated()) {
        (true, true) => Err(TransportError::IncompatibleRoles(format!(
            "both sides mandate roles: producer {:?}, consumer {:?}",
            producer.role, consumer.role
        ))),
        (true, false) => {
            let cons = producer.role.complement();
            if fits(producer.role, cons) {
                done(producer.role, cons)
            } else {
                Err(TransportError::IncompatibleRoles(format!(
                    "consumer cannot take {:?} required by mandated producer {:?}",
                    cons, producer.role
                )))
            }
        }
        (false, true) => {
            let prod = consumer.role.complement();
            if fits(prod, consumer.role) {
                done(prod, consumer.role)
            } else {
                Err(TransportError::IncompatibleRoles(format!(
                    "producer cannot take {:?} required by mandated consumer {:?}",
                    prod, consumer.role
                )))
            }
        }
        (false, false) => {
            let producer_wins = producer.role.rank() >= consumer.role.rank();
            let preferred = if producer_wins {
                (producer.role, producer.role.complement())
            } else {
                (consumer.role.complement(), consumer.role)
            };
            let fallback = if producer_wins {
                (consumer.role.complement(), consumer.role)
            } else {
                (producer.role, producer.role.complement())
            };

            let defaults = [
                (PortRole::ActiveMessage, PortRole::ActiveFlowControl),
                (PortRole::ActiveOnly, PortRole::Passive),
                (PortRole::ActiveFlowControl, PortRole::ActiveMessage),
                (PortRole::Passive, PortRole::ActiveOnly),
            ];

            std::iter::once(preferred)
                .chain(std::iter::once(fallback))
                .chain(defaults)
                .find(|(prod, cons)| fits(*prod, *cons))
                .map(|(prod, cons)| done(prod, cons))
                .unwrap_or_else(|| {
                    Err(TransportError::IncompatibleRoles(
                        "no role pair supported by both sides".to_string(),
                    ))
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roles() -> impl Strategy<Value = PortRole> {
        prop::sample::select(PortRole::ALL.to_vec())
    }

    #[test]
    fn test_complements_are_involutions() {
        for role in PortRole::ALL {
            assert_eq!(role.complement().complement(), role);
            assert_ne!(role.moves_data(), role.complement().moves_data());
        }
    }

    #[test]
    fn test_default_pair_kept() {
        let n = negotiate(
            RoleRequest::new(PortRole::ActiveMessage),
            RoleRequest::new(PortRole::ActiveFlowControl),
        )
        .unwrap();
        assert_eq!(n.producer, PortRole::ActiveMessage);
        assert_eq!(n.consumer, PortRole::ActiveFlowControl);
        assert!(n.is_push());
        assert!(n.shadow());
        assert_eq!(n.mode, FlagMode::Count);
    }

    #[test]
    fn test_higher_preference_wins() {
        let n = negotiate(
            RoleRequest::new(PortRole::Passive),
            RoleRequest::new(PortRole::ActiveMessage),
        )
        .unwrap();
        assert_eq!(n.consumer, PortRole::ActiveMessage);
        assert_eq!(n.producer, PortRole::ActiveFlowControl);
        assert!(!n.is_push());
    }

    #[test]
    fn test_both_active_message_tie_goes_to_producer() {
        let n = negotiate(
            RoleRequest::new(PortRole::ActiveMessage),
            RoleRequest::new(PortRole::ActiveMessage),
        )
        .unwrap();
        assert_eq!(n.producer, PortRole::ActiveMessage);
        assert_eq!(n.consumer, PortRole::ActiveFlowControl);
    }

    #[test]
    fn test_mandated_side_wins() {
        let n = negotiate(
            RoleRequest::new(PortRole::ActiveMessage),
            RoleRequest::mandated(PortRole::ActiveMessage),
        )
        .unwrap();
        assert_eq!(n.consumer, PortRole::ActiveMessage);
        assert_eq!(n.producer, PortRole::ActiveFlowControl);
    }

    #[test]
    fn test_both_mandated_conflict_fails() {
        let err = negotiate(
            RoleRequest::mandated(PortRole::ActiveMessage),
            RoleRequest::mandated(PortRole::ActiveMessage),
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::IncompatibleRoles(_)));
    }

    #[test]
    fn test_both_mandated_compatible_is_fine() {
        let n = negotiate(
            RoleRequest::mandated(PortRole::ActiveOnly),
            RoleRequest::mandated(PortRole::Passive),
        )
        .unwrap();
        assert_eq!(n.producer, PortRole::ActiveOnly);
        assert!(!n.shadow());
    }

    #[test]
    fn test_feedback_mismatch_fails() {
        let producer = RoleRequest::new(PortRole::ActiveMessage);
        let consumer = RoleRequest::new(PortRole::ActiveFlowControl)
            .with_options(RoleOptions::default().with_feedback_is_count(false));
        assert!(matches!(
            negotiate(producer, consumer),
            Err(TransportError::IncompatibleRoles(_))
        ));
    }

    #[test]
    fn test_unsupported_roles_avoided() {
        let producer = RoleRequest::new(PortRole::ActiveMessage).with_options(
            RoleOptions::default().with_supported(&[PortRole::Passive, PortRole::ActiveFlowControl]),
        );
        let consumer = RoleRequest::new(PortRole::Passive);
        let n = negotiate(producer, consumer).unwrap();
        assert!(producer.options.supports(n.producer));
        assert_eq!(n.producer, PortRole::ActiveFlowControl);
        assert_eq!(n.consumer, PortRole::ActiveMessage);
    }

    #[test]
    fn test_nothing_supported_fails() {
        let producer = RoleRequest::new(PortRole::ActiveMessage)
            .with_options(RoleOptions::default().with_supported(&[PortRole::ActiveMessage]));
        let consumer = RoleRequest::new(PortRole::ActiveMessage)
            .with_options(RoleOptions::default().with_supported(&[PortRole::Passive]));
        assert!(negotiate(producer, consumer).is_err());
    }

    #[test]
    fn test_option_bits_roundtrip() {
        let opts = RoleOptions::default()
            .with_mandated(true)
            .with_supported(&[PortRole::ActiveOnly]);
        let back = RoleOptions::from_bits(opts.bits());
        assert!(back.mandated());
        assert!(back.feedback_is_count());
        assert!(back.supports(PortRole::ActiveOnly));
        assert!(!back.supports(PortRole::Passive));
    }

    proptest! {
        #[test]
        fn prop_negotiation_commutes(a in roles(), b in roles()) {
            prop_assume!(a != b);
            let forward = negotiate(RoleRequest::new(a), RoleRequest::new(b)).unwrap();
            let swapped = negotiate(RoleRequest::new(b), RoleRequest::new(a)).unwrap();
            prop_assert_eq!(forward.producer, swapped.consumer);
            prop_assert_eq!(forward.consumer, swapped.producer);
        }

        #[test]
        fn prop_exactly_one_mover(a in roles(), b in roles()) {
            let n = negotiate(RoleRequest::new(a), RoleRequest::new(b)).unwrap();
            prop_assert!(n.producer.moves_data() != n.consumer.moves_data());
            prop_assert_eq!(n.producer.complement(), n.consumer);
        }

        #[test]
        fn prop_preferred_request_kept(a in roles(), b in roles()) {
            prop_assume!(a != b);
            let n = negotiate(RoleRequest::new(a), RoleRequest::new(b)).unwrap();
            if a.rank() > b.rank() {
                prop_assert_eq!(n.producer, a);
            } else {
                prop_assert_eq!(n.consumer, b);
            }
        }
    }
}
