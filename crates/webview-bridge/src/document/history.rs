/// One applied edit together with the content it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditEntry {
    pub id: u64,
    pub label: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SavedPoint {
    /// Saved content equals the baseline.
    Baseline,
    Edit(u64),
    /// Content never matched the store (e.g. restored from a backup).
    Unsaved,
}

/// Linear undo/redo history for a local document.
///
/// `cursor` counts applied entries; entries past it form the redo tail.
#[derive(Debug, Clone)]
pub struct EditHistory {
    baseline: Vec<u8>,
    entries: Vec<EditEntry>,
    cursor: usize,
    next_id: u64,
    saved: SavedPoint,
}

impl EditHistory {
    pub fn new(baseline: Vec<u8>) -> Self {
        Self {
            baseline,
            entries: Vec::new(),
            cursor: 0,
            next_id: 1,
            saved: SavedPoint::Baseline,
        }
    }

    /// History whose baseline does not match what is on disk.
    pub fn unsaved(baseline: Vec<u8>) -> Self {
        Self {
            saved: SavedPoint::Unsaved,
            ..Self::new(baseline)
        }
    }

    pub fn push(&mut self, label: impl Into<String>, content: Vec<u8>) -> u64 {
        self.entries.truncate(self.cursor);
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(EditEntry {
            id,
            label: label.into(),
            content,
        });
        self.cursor = self.entries.len();
        id
    }

    /// Step back one entry; returns the content now current.
    pub fn undo(&mut self) -> Option<&[u8]> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        Some(self.current_content())
    }

    pub fn redo(&mut self) -> Option<&[u8]> {
        if self.cursor >= self.entries.len() {
            return None;
        }
        self.cursor += 1;
        Some(self.current_content())
    }

    pub fn current_content(&self) -> &[u8] {
        match self.cursor.checked_sub(1).and_then(|index| self.entries.get(index)) {
            Some(entry) => entry.content.as_slice(),
            None => self.baseline.as_slice(),
        }
    }

    fn current_point(&self) -> SavedPoint {
        match self.cursor.checked_sub(1).and_then(|index| self.entries.get(index)) {
            Some(entry) => SavedPoint::Edit(entry.id),
            None => SavedPoint::Baseline,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.saved != self.current_point()
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overwrite the content at the current position, e.g. with what the
    /// surface actually serialized on save.
    pub fn replace_current(&mut self, content: Vec<u8>) {
        match self.cursor.checked_sub(1).and_then(|index| self.entries.get_mut(index)) {
            Some(entry) => entry.content = content,
            None => self.baseline = content,
        }
    }

    /// Record the current position as what the store holds.
    pub fn mark_saved(&mut self) {
        self.saved = self.current_point();
    }

    /// Return to the last saved position. When that position is gone the
    /// history restarts from `stored`.
    pub fn revert(&mut self, stored: Vec<u8>) {
        let position = match self.saved {
            SavedPoint::Baseline => Some(0),
            SavedPoint::Edit(id) => self
                .entries
                .iter()
                .position(|entry| entry.id == id)
                .map(|index| index + 1),
            SavedPoint::Unsaved => None,
        };

        match position {
            Some(position) if self.position_matches(position, &stored) => {
                self.entries.truncate(position);
                self.cursor = position;
            }
            _ => {
                self.baseline = stored;
                self.entries.clear();
                self.cursor = 0;
                self.saved = SavedPoint::Baseline;
            }
        }
    }

    fn position_matches(&self, position: usize, stored: &[u8]) -> bool {
        let content = match position.checked_sub(1).and_then(|index| self.entries.get(index)) {
            Some(entry) => entry.content.as_slice(),
            None => self.baseline.as_slice(),
        };
        content == stored
    }
}
