//! Transmit-id bookkeeping for outstanding radio transmissions.

use thiserror::Error;

/// Every transmit id is in use. Carries back the item that could not be stored.
#[derive(Debug, Error)]
#[error("too many outstanding transmits")]
pub struct SlotsFull<T>(pub T);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("not a valid transmission ID: {0}")]
pub struct InvalidTxId(pub u8);

/// A fixed table mapping transmit ids `1..=max_id` to pending items.
///
/// Id 0 is never handed out: the radio uses it for "no status wanted". New
/// items go into the first free slot at or after a base that advances with
/// every allocation, wrapping back to 1, so recently released ids are not
/// reused straight away.
#[derive(Debug)]
pub struct TxStatusSlots<T> {
    slots: Vec<Option<T>>,
    base: usize,
    max_id: u8,
}

impl<T> Default for TxStatusSlots<T> {
    fn default() -> Self {
        Self::new(255)
    }
}

impl<T> TxStatusSlots<T> {
    pub fn new(max_id: u8) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None)
                .take(usize::from(max_id) + 1)
                .collect(),
            base: 1,
            max_id,
        }
    }

    pub fn max_id(&self) -> u8 {
        self.max_id
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn next_free(&self) -> Option<usize> {
        let max = usize::from(self.max_id);
        let start = self.base % (max + 1);
        (start..=max)
            .chain(1..start)
            .find(|&index| index != 0 && self.slots[index].is_none())
    }

    /// Stores `item` and returns the transmit id to send it with.
    pub fn allocate(&mut self, item: T) -> Result<u8, SlotsFull<T>> {
        let Some(index) = self.next_free() else {
            return Err(SlotsFull(item));
        };
        self.slots[index] = Some(item);
        self.base += 1;
        if self.base > usize::from(self.max_id) {
            self.base = 1;
        }
        // index <= max_id, which is a u8.
        Ok(index as u8)
    }

    fn check(&self, tx_id: u8) -> Result<usize, InvalidTxId> {
        if tx_id == 0 || tx_id > self.max_id {
            Err(InvalidTxId(tx_id))
        } else {
            Ok(usize::from(tx_id))
        }
    }

    pub fn get(&self, tx_id: u8) -> Result<Option<&T>, InvalidTxId> {
        let index = self.check(tx_id)?;
        Ok(self.slots[index].as_ref())
    }

    /// Removes and returns the item for `tx_id`, freeing the slot.
    pub fn take(&mut self, tx_id: u8) -> Result<Option<T>, InvalidTxId> {
        let index = self.check(tx_id)?;
        Ok(self.slots[index].take())
    }

    /// Empties every slot, yielding the pending items in id order.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.slots.iter_mut().filter_map(Option::take)
    }
}
