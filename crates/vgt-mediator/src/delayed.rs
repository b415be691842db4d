//! Host-side work the mediator takes over and replays later.
//!
//! When the host driver would act on an interrupt or timer while the mediator owns the hardware,
//! it parks the payload here instead. The mediator takes it when it is ready to forward.

use std::sync::Mutex;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DelayedEvent {
    Irq = 0,
    VblankDisableTimer = 1,
    HangcheckTimer = 2,
    HotplugReenableTimer = 3,
}

pub const DELAYED_EVENT_MAX: usize = 4;

impl DelayedEvent {
    pub const ALL: [DelayedEvent; DELAYED_EVENT_MAX] = [
        Self::Irq,
        Self::VblankDisableTimer,
        Self::HangcheckTimer,
        Self::HotplugReenableTimer,
    ];

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|e| *e as u32 == raw)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// One slot per [`DelayedEvent`]; a slot holding a payload is busy.
pub struct DelayedEventRegistry<T> {
    slots: [Mutex<Option<T>>; DELAYED_EVENT_MAX],
}

impl<T> DelayedEventRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(None)),
        }
    }

    fn slot(&self, event: DelayedEvent) -> std::sync::MutexGuard<'_, Option<T>> {
        self.slots[event.index()]
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Whether a payload for `event` is parked and not yet taken.
    pub fn is_busy(&self, event: DelayedEvent) -> bool {
        self.slot(event).is_some()
    }

    /// Parks `data` for `event`, returning a payload it displaced.
    pub fn set_delayed_payload(&self, event: DelayedEvent, data: T) -> Option<T> {
        let prev = self.slot(event).replace(data);
        if prev.is_some() {
            tracing::debug!(?event, "delayed event payload replaced before it was taken");
        }
        prev
    }

    pub fn take_payload(&self, event: DelayedEvent) -> Option<T> {
        self.slot(event).take()
    }
}

impl<T> Default for DelayedEventRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for DelayedEventRegistry<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut list = f.debug_list();
        for event in DelayedEvent::ALL {
            if self.is_busy(event) {
                list.entry(&event);
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values_match_host_interface() {
        assert_eq!(DelayedEvent::Irq as u32, 0);
        assert_eq!(DelayedEvent::HotplugReenableTimer as u32, 3);
        assert_eq!(DelayedEvent::from_raw(2), Some(DelayedEvent::HangcheckTimer));
        assert_eq!(DelayedEvent::from_raw(DELAYED_EVENT_MAX as u32), None);
    }

    #[test]
    fn slots_are_independent() {
        let reg = DelayedEventRegistry::new();
        assert!(!reg.is_busy(DelayedEvent::Irq));

        assert_eq!(reg.set_delayed_payload(DelayedEvent::Irq, 7u32), None);
        assert!(reg.is_busy(DelayedEvent::Irq));
        assert!(!reg.is_busy(DelayedEvent::HangcheckTimer));

        assert_eq!(reg.set_delayed_payload(DelayedEvent::Irq, 8), Some(7));
        assert_eq!(reg.take_payload(DelayedEvent::Irq), Some(8));
        assert!(!reg.is_busy(DelayedEvent::Irq));
        assert_eq!(reg.take_payload(DelayedEvent::Irq), None);
    }
}
