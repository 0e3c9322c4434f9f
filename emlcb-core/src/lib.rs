//! OpenLCB protocol core data types
//!
//! This crate provides basic data type definitions used by other emlcb crates.
//! emlcb users should not depend on this crate directly. Use `emlcb::core` reexport instead.
#![no_std]

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidValue;

/// Message type indicator
///
/// Classifies the purpose of a message. Individual bits carry protocol meaning, e.g.
/// [`Mti::EVENT_MASK`] marks messages with an event identifier payload and
/// [`Mti::ADDRESS_MASK`] marks addressed messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mti(u16);

impl Mti {
    pub const EVENT_REPORT: Mti = Mti(0x05B4);

    pub const CONSUMER_IDENTIFY: Mti = Mti(0x08F4);
    pub const CONSUMER_IDENTIFIED_RANGE: Mti = Mti(0x04A4);
    pub const CONSUMER_IDENTIFIED_VALID: Mti = Mti(0x04C4);
    pub const CONSUMER_IDENTIFIED_INVALID: Mti = Mti(0x04C5);
    pub const CONSUMER_IDENTIFIED_RESERVED: Mti = Mti(0x04C6);
    pub const CONSUMER_IDENTIFIED_UNKNOWN: Mti = Mti(0x04C7);

    pub const PRODUCER_IDENTIFY: Mti = Mti(0x0914);
    pub const PRODUCER_IDENTIFIED_RANGE: Mti = Mti(0x0524);
    pub const PRODUCER_IDENTIFIED_VALID: Mti = Mti(0x0544);
    pub const PRODUCER_IDENTIFIED_INVALID: Mti = Mti(0x0545);
    pub const PRODUCER_IDENTIFIED_RESERVED: Mti = Mti(0x0546);
    pub const PRODUCER_IDENTIFIED_UNKNOWN: Mti = Mti(0x0547);

    pub const EVENTS_IDENTIFY_ADDRESSED: Mti = Mti(0x0968);
    pub const EVENTS_IDENTIFY_GLOBAL: Mti = Mti(0x0970);

    /// Set in every MTI whose payload starts with an event identifier
    pub const EVENT_MASK: Mti = Mti(0x0004);
    /// Set in every MTI that carries a destination address
    pub const ADDRESS_MASK: Mti = Mti(0x0008);
    /// All bits significant
    pub const EXACT_MASK: Mti = Mti(0xFFFF);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }

    pub const fn carries_event(self) -> bool {
        self.0 & Self::EVENT_MASK.0 == Self::EVENT_MASK.0
    }

    pub const fn is_addressed(self) -> bool {
        self.0 & Self::ADDRESS_MASK.0 == Self::ADDRESS_MASK.0
    }
}

impl From<u16> for Mti {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Mti> for u16 {
    fn from(value: Mti) -> Self {
        value.into_u16()
    }
}

impl core::ops::BitAnd<Mti> for Mti {
    type Output = Self;
    fn bitand(self, rhs: Mti) -> Self::Output {
        Mti(self.0 & rhs.0)
    }
}

/// 48-bit unique node identifier
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeId(u64);

impl NodeId {
    const MAX_VALUE: u64 = 0xFFFF_FFFF_FFFF;
    pub const MAX: NodeId = NodeId(Self::MAX_VALUE);

    pub const fn new(value: u64) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self::from_u64_truncating(value))
        } else {
            None
        }
    }

    pub const fn from_u64_truncating(value: u64) -> Self {
        Self(value & Self::MAX_VALUE)
    }

    pub const fn into_u64(self) -> u64 {
        self.0
    }
}

impl From<NodeId> for u64 {
    fn from(value: NodeId) -> Self {
        value.into_u64()
    }
}

impl TryFrom<u64> for NodeId {
    type Error = InvalidValue;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

/// 12-bit transport alias of a node
///
/// Zero is reserved and denotes an unknown alias.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeAlias(u16);

impl NodeAlias {
    const MAX_VALUE: u16 = 0xFFF;
    pub const UNKNOWN: NodeAlias = NodeAlias(0);
    pub const MAX: NodeAlias = NodeAlias(Self::MAX_VALUE);

    pub const fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self::from_u16_truncating(value))
        } else {
            None
        }
    }

    pub const fn from_u16_truncating(value: u16) -> Self {
        Self(value & Self::MAX_VALUE)
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }
}

impl From<NodeAlias> for u16 {
    fn from(value: NodeAlias) -> Self {
        value.into_u16()
    }
}

impl TryFrom<u16> for NodeAlias {
    type Error = InvalidValue;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

/// Remote or local node reference
///
/// Either field may be unknown: a zero `id` or [`NodeAlias::UNKNOWN`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeHandle {
    pub id: NodeId,
    pub alias: NodeAlias,
}

impl NodeHandle {
    pub const UNKNOWN: NodeHandle = NodeHandle::new(NodeId(0), NodeAlias::UNKNOWN);

    pub const fn new(id: NodeId, alias: NodeAlias) -> Self {
        Self { id, alias }
    }
}

impl Default for NodeHandle {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// Network-wide event identifier
pub type EventId = u64;

/// Size of an event identifier on the wire
pub const EVENT_ID_LENGTH: usize = 8;

/// Decodes a big-endian event identifier. The slice must be exactly 8 bytes long.
pub fn event_id_from_bytes(bytes: &[u8]) -> Option<EventId> {
    let bytes: [u8; EVENT_ID_LENGTH] = bytes.try_into().ok()?;
    Some(EventId::from_be_bytes(bytes))
}

pub const fn event_id_to_bytes(event: EventId) -> [u8; EVENT_ID_LENGTH] {
    event.to_be_bytes()
}

/// State tag of identified-producer/consumer messages
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventState {
    Valid,
    Invalid,
    Unknown,
    Reserved,
}

/// Executor task priority
///
/// Higher priority has a lower numerical value and is ordered first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub const MIN: Priority = Priority::Critical;
    pub const MAX: Priority = Priority::Low;

    pub const fn try_from_u8(code: u8) -> Option<Priority> {
        if code <= Self::MAX.into_u8() {
            Some(Priority::from_u8_truncating(code))
        } else {
            None
        }
    }

    pub const fn from_u8_truncating(code: u8) -> Priority {
        match code & 0x3 {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            3 => Priority::Low,
            _ => unreachable!(),
        }
    }

    pub const fn into_u8(self) -> u8 {
        self as u8
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.into_u8()
    }
}

impl From<Priority> for usize {
    fn from(value: Priority) -> Self {
        u8::from(value).into()
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidValue;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::try_from_u8(value).ok_or(InvalidValue)
    }
}

/// A set of priority values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PrioritySet(u8);

impl PrioritySet {
    const BITS: u8 = (1u8 << (Priority::MAX.into_u8() + 1)) - 1;
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(Self::BITS);

    pub const fn new_eq(priority: Priority) -> Self {
        Self(1u8 << priority.into_u8())
    }

    pub const fn contains(&self, priority: Priority) -> bool {
        (self.0 >> priority.into_u8()) & 0x1 != 0
    }

    pub const fn insert(&mut self, priority: Priority) {
        self.0 |= Self::new_eq(priority).0
    }

    pub const fn remove(&mut self, priority: Priority) {
        self.0 &= !Self::new_eq(priority).0
    }

    /// Returns the highest priority in the set
    pub const fn first(&self) -> Option<Priority> {
        Priority::try_from_u8(self.0.trailing_zeros() as u8)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == Self::NONE.0
    }
}

impl Default for PrioritySet {
    fn default() -> Self {
        PrioritySet::NONE
    }
}

impl core::ops::BitOr<PrioritySet> for PrioritySet {
    type Output = Self;
    fn bitor(self, rhs: PrioritySet) -> Self::Output {
        PrioritySet(self.0 | rhs.0)
    }
}

impl core::iter::IntoIterator for PrioritySet {
    type Item = Priority;
    type IntoIter = PrioritySetIterator;
    fn into_iter(self) -> Self::IntoIter {
        PrioritySetIterator { residual: self }
    }
}

pub struct PrioritySetIterator {
    residual: PrioritySet,
}

impl core::iter::Iterator for PrioritySetIterator {
    type Item = Priority;
    fn next(&mut self) -> Option<Self::Item> {
        let first = self.residual.first();
        if let Some(priority) = first {
            self.residual.remove(priority);
        }
        first
    }
}
