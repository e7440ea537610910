/// Which pieces one side of a connection has, which of them are wanted and how much of the
/// wanted part is already there.
///
/// Bits on the wire are MSB-first, piece `i` lives in byte `i / 8` under the mask `0x80 >> (i % 8)`.
/// Indices past `piece_count` are ignored everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PiecesProgress {
    received: Vec<bool>,
    selected: Vec<bool>,
    received_count: u32,
    selected_count: u32,
    selected_received_count: u32,
}

impl PiecesProgress {
    /// Nothing received, everything selected.
    pub fn new(piece_count: u32) -> Self {
        let mut progress = Self::default();
        progress.resize(piece_count);
        progress
    }

    fn resize(&mut self, piece_count: u32) {
        let len = piece_count as usize;
        if len <= self.received.len() {
            return;
        }
        let added = (len - self.received.len()) as u32;
        self.received.resize(len, false);
        self.selected.resize(len, true);
        self.selected_count += added;
    }

    /// Replaces the received flags with the ones in `bits`.
    /// A tracker that was never sized takes its size from the bitfield.
    pub fn from_bitfield(&mut self, bits: &[u8]) {
        if self.received.is_empty() {
            self.resize((bits.len() * 8) as u32);
        }
        self.clear_received();
        for index in 0..self.received.len() {
            let Some(byte) = bits.get(index / 8) else {
                break;
            };
            if byte & (0x80 >> (index % 8)) != 0 {
                self.mark(index);
            }
        }
    }

    /// Packs the received flags into `ceil(piece_count / 8)` bytes, padding bits are zero.
    pub fn to_bitfield(&self) -> Vec<u8> {
        let mut bits = vec![0_u8; self.received.len().div_ceil(8)];
        for (index, _) in self.received.iter().enumerate().filter(|(_, has)| **has) {
            bits[index / 8] |= 0x80 >> (index % 8);
        }
        bits
    }

    /// Replaces the received flags with the listed pieces.
    pub fn from_list(&mut self, pieces: &[u32]) {
        self.clear_received();
        for &index in pieces {
            self.add_piece(index);
        }
    }

    /// Marks the pieces whose entry in `mask` is `true` as wanted, all others as not wanted.
    /// Pieces past the end of `mask` stay unselected.
    pub fn select(&mut self, mask: &[bool]) {
        for (index, selected) in self.selected.iter_mut().enumerate() {
            *selected = mask.get(index).copied().unwrap_or(false);
        }
        self.recount_selection();
    }

    pub fn select_all(&mut self) {
        self.selected.fill(true);
        self.recount_selection();
    }

    fn recount_selection(&mut self) {
        self.selected_count = self.selected.iter().filter(|s| **s).count() as u32;
        self.selected_received_count = self
            .selected
            .iter()
            .zip(&self.received)
            .filter(|(selected, received)| **selected && **received)
            .count() as u32;
    }

    pub fn add_piece(&mut self, index: u32) {
        let index = index as usize;
        if index < self.received.len() && !self.received[index] {
            self.mark(index);
        }
    }

    fn mark(&mut self, index: usize) {
        self.received[index] = true;
        self.received_count += 1;
        if self.selected[index] {
            self.selected_received_count += 1;
        }
    }

    pub fn remove_piece(&mut self, index: u32) {
        let index = index as usize;
        if index < self.received.len() && self.received[index] {
            self.received[index] = false;
            self.received_count -= 1;
            if self.selected[index] {
                self.selected_received_count -= 1;
            }
        }
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.received.get(index as usize).copied().unwrap_or(false)
    }

    /// Forgets every received piece but keeps the selection. Used when the data on disk has to
    /// be rechecked.
    pub fn remove_received(&mut self) {
        self.clear_received();
    }

    fn clear_received(&mut self) {
        self.received.fill(false);
        self.received_count = 0;
        self.selected_received_count = 0;
    }

    /// received / piece count, 0 for an empty tracker
    pub fn percentage(&self) -> f32 {
        if self.received.is_empty() {
            return 0.0;
        }
        self.received_count as f32 / self.received.len() as f32
    }

    /// selected and received / selected, 1 when nothing is selected
    pub fn selected_percentage(&self) -> f32 {
        if self.selected_count == 0 {
            return 1.0;
        }
        self.selected_received_count as f32 / self.selected_count as f32
    }

    pub fn first_empty_piece(&self) -> Option<u32> {
        self.received
            .iter()
            .position(|has| !has)
            .map(|index| index as u32)
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn selected_count(&self) -> u32 {
        self.selected_count
    }

    pub fn selected_received_count(&self) -> u32 {
        self.selected_received_count
    }

    pub fn piece_count(&self) -> u32 {
        self.received.len() as u32
    }

    /// No piece received.
    pub fn is_empty(&self) -> bool {
        self.received_count == 0
    }
}
