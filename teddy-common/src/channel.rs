//! Bounded, lossy, single-consumer event channel.
//!
//! Producers reserve a slot, fill it and submit it. A full channel refuses
//! the reservation immediately; there is no blocking and no backpressure.
//! This is the in-process counterpart of the kernel ring buffer.

pub struct EventChannel<T, const N: usize> {
    slots: [T; N],
    head: usize,
    len: usize,
    dropped: u64,
}

/// A reserved slot. Dropping it without [`Reservation::submit`] discards it.
pub struct Reservation<'a, T, const N: usize> {
    chan: &'a mut EventChannel<T, N>,
    idx: usize,
}

impl<T: Copy + Default, const N: usize> Default for EventChannel<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default, const N: usize> EventChannel<T, N> {
    pub fn new() -> Self {
        Self {
            slots: [T::default(); N],
            head: 0,
            len: 0,
            dropped: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of reservations refused because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn reserve(&mut self) -> Option<Reservation<'_, T, N>> {
        if self.len == N {
            self.dropped += 1;
            return None;
        }
        let idx = (self.head + self.len) % N;
        Some(Reservation { chan: self, idx })
    }

    /// Reserve-and-submit in one step. `false` when the value was dropped.
    pub fn try_send(&mut self, value: T) -> bool {
        match self.reserve() {
            Some(slot) => {
                slot.submit(value);
                true
            }
            None => false,
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head];
        self.head = (self.head + 1) % N;
        self.len -= 1;
        Some(value)
    }

    /// Hands every queued value to `f` in submission order.
    pub fn drain<F: FnMut(T)>(&mut self, mut f: F) -> usize {
        let mut count = 0;
        while let Some(value) = self.try_recv() {
            f(value);
            count += 1;
        }
        count
    }
}

impl<T: Copy, const N: usize> Reservation<'_, T, N> {
    pub fn submit(self, value: T) {
        self.chan.slots[self.idx] = value;
        self.chan.len += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_order() {
        let mut chan: EventChannel<u32, 4> = EventChannel::new();
        assert!(chan.try_send(1));
        assert!(chan.try_send(2));
        assert_eq!(chan.try_recv(), Some(1));
        assert!(chan.try_send(3));
        let mut seen = Vec::new();
        assert_eq!(chan.drain(|v| seen.push(v)), 2);
        assert_eq!(seen, vec![2, 3]);
        assert!(chan.is_empty());
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let mut chan: EventChannel<u32, 2> = EventChannel::new();
        assert!(chan.try_send(1));
        assert!(chan.try_send(2));
        assert!(chan.reserve().is_none());
        assert!(!chan.try_send(3));
        assert_eq!(chan.dropped(), 2);
        assert_eq!(chan.try_recv(), Some(1));
        assert_eq!(chan.try_recv(), Some(2));
        assert_eq!(chan.try_recv(), None);
    }

    #[test]
    fn abandoned_reservation_is_not_delivered() {
        let mut chan: EventChannel<u32, 2> = EventChannel::new();
        drop(chan.reserve());
        assert!(chan.is_empty());
        assert!(chan.try_send(9));
        assert_eq!(chan.try_recv(), Some(9));
    }
}
