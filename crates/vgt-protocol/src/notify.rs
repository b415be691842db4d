//! Notification mailbox values.
//!
//! Each direction has one 32-bit mailbox in the guest half of the PVINFO page. A mailbox holds a
//! single event at a time and the last write wins: nothing queues, nothing acknowledges.
//!
//! The published event values start at zero, so zero cannot double as "empty". The mediator
//! seeds both mailboxes with [`VGT_NOTIFY_EMPTY`] before the page becomes visible to the guest,
//! and every consumer writes it back after taking an event.

/// Mailbox contents meaning "no event pending".
pub const VGT_NOTIFY_EMPTY: u32 = 0xFFFF_FFFF;

/// Number of defined guest → mediator events (`VGT_G2V_MAX`).
pub const VGT_G2V_MAX: u32 = 2;
/// Number of defined mediator → guest events (`VGT_V2G_MAX`).
pub const VGT_V2G_MAX: u32 = 2;

/// Guest → mediator notification (`g2v_notify`).
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum G2vNotification {
    /// The guest changed display state and wants the mediator to rescan it.
    DisplayRefresh = 0,
    /// The guest uploaded a new cursor image.
    SetPointerShape = 1,
}

/// Mediator → guest notification (`v2g_notify`).
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum V2gNotification {
    /// Guest should drive the hardware cursor plane.
    SetHwCursor = 0,
    /// Guest should fall back to a software cursor.
    SetSwCursor = 1,
}

/// An event type that can travel through a mailbox.
pub trait MailboxEvent: Copy + Eq + core::fmt::Debug {
    /// One past the highest defined raw value.
    const MAX: u32;

    fn from_raw(raw: u32) -> Option<Self>;
    fn to_raw(self) -> u32;
}

impl MailboxEvent for G2vNotification {
    const MAX: u32 = VGT_G2V_MAX;

    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::DisplayRefresh),
            1 => Some(Self::SetPointerShape),
            _ => None,
        }
    }

    fn to_raw(self) -> u32 {
        self as u32
    }
}

impl MailboxEvent for V2gNotification {
    const MAX: u32 = VGT_V2G_MAX;

    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::SetHwCursor),
            1 => Some(Self::SetSwCursor),
            _ => None,
        }
    }

    fn to_raw(self) -> u32 {
        self as u32
    }
}

/// Decoded contents of a mailbox word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mailbox<E> {
    Empty,
    Event(E),
    /// A value outside the published event set. Consumers still clear the slot.
    Unknown(u32),
}

impl<E: MailboxEvent> Mailbox<E> {
    pub fn decode(raw: u32) -> Self {
        if raw == VGT_NOTIFY_EMPTY {
            return Self::Empty;
        }
        match E::from_raw(raw) {
            Some(event) => Self::Event(event),
            None => Self::Unknown(raw),
        }
    }

    pub fn encode(self) -> u32 {
        match self {
            Self::Empty => VGT_NOTIFY_EMPTY,
            Self::Event(event) => event.to_raw(),
            Self::Unknown(raw) => raw,
        }
    }

    pub fn event(self) -> Option<E> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn is_empty(self) -> bool {
        matches!(self, Self::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_match_published_enums() {
        assert_eq!(G2vNotification::DisplayRefresh.to_raw(), 0);
        assert_eq!(G2vNotification::SetPointerShape.to_raw(), 1);
        assert_eq!(V2gNotification::SetHwCursor.to_raw(), 0);
        assert_eq!(V2gNotification::SetSwCursor.to_raw(), 1);
        assert_eq!(G2vNotification::MAX, 2);
        assert_eq!(V2gNotification::MAX, 2);
    }

    #[test]
    fn decode_distinguishes_empty_event_and_garbage() {
        assert_eq!(
            Mailbox::<G2vNotification>::decode(VGT_NOTIFY_EMPTY),
            Mailbox::Empty
        );
        assert_eq!(
            Mailbox::<G2vNotification>::decode(0),
            Mailbox::Event(G2vNotification::DisplayRefresh)
        );
        assert_eq!(
            Mailbox::<V2gNotification>::decode(VGT_V2G_MAX),
            Mailbox::Unknown(VGT_V2G_MAX)
        );
        for raw in [0, 1, 7, VGT_NOTIFY_EMPTY] {
            assert_eq!(Mailbox::<G2vNotification>::decode(raw).encode(), raw);
        }
    }
}
