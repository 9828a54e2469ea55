use crate::instruction::{Space, MAX_BUFFERS};
use serde::{Deserialize, Serialize};

/// Physical descriptor of a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(default = "valid")]
    pub valid: bool,
    /// Base word address.
    pub base: u64,
    pub x: usize,
    pub y: usize,
}

fn valid() -> bool {
    true
}

impl Descriptor {
    pub const INVALID: Self = Self {
        valid: false,
        base: 0,
        x: 0,
        y: 0,
    };

    #[must_use]
    pub fn new(base: u64, x: usize, y: usize) -> Self {
        Self {
            valid: true,
            base,
            x,
            y,
        }
    }

    /// Size in words.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x * self.y.max(1)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.valid {
            write!(f, "{:#x}[{}x{}]", self.base, self.x, self.y)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Buffer handle to physical descriptor translation of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferToPhysXlat {
    bulk: [Descriptor; MAX_BUFFERS],
    scratchpad: [Descriptor; MAX_BUFFERS],
    written: bool,
}

impl Default for BufferToPhysXlat {
    fn default() -> Self {
        Self {
            bulk: [Descriptor::INVALID; MAX_BUFFERS],
            scratchpad: [Descriptor::INVALID; MAX_BUFFERS],
            written: false,
        }
    }
}

impl BufferToPhysXlat {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate all entries.
    pub fn reset(&mut self) {
        self.bulk = [Descriptor::INVALID; MAX_BUFFERS];
        self.scratchpad = [Descriptor::INVALID; MAX_BUFFERS];
    }

    fn table(&self, space: Space) -> &[Descriptor; MAX_BUFFERS] {
        match space {
            Space::BulkMemory => &self.bulk,
            Space::Scratchpad => &self.scratchpad,
        }
    }

    /// Write one entry.
    ///
    /// # Panics
    /// If more than one entry is written per cycle or the handle is out of range.
    pub fn write(&mut self, space: Space, handle: u8, descriptor: Descriptor) {
        assert!(
            !self.written,
            "buffer translation written twice in one cycle"
        );
        let handle = usize::from(handle);
        assert!(
            handle < MAX_BUFFERS,
            "buffer handle {handle} out of range"
        );
        self.written = true;
        let table = match space {
            Space::BulkMemory => &mut self.bulk,
            Space::Scratchpad => &mut self.scratchpad,
        };
        table[handle] = descriptor;
        log::trace!("xlat: {:?} buffer {} => {}", space, handle, descriptor);
    }

    /// Translate a buffer handle.
    ///
    /// Unmapped and out of range handles translate to [`Descriptor::INVALID`].
    #[must_use]
    pub fn read(&self, space: Space, handle: u8) -> Descriptor {
        self.table(space)
            .get(usize::from(handle))
            .copied()
            .unwrap_or(Descriptor::INVALID)
    }

    /// Advance to the next cycle.
    pub fn cycle(&mut self) {
        self.written = false;
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferToPhysXlat, Descriptor};
    use crate::instruction::Space;

    #[test]
    fn test_write_then_read_returns_descriptor() {
        let mut xlat = BufferToPhysXlat::new();
        let descriptor = Descriptor::new(0x1000, 64, 2);
        xlat.write(Space::BulkMemory, 7, descriptor);
        xlat.cycle();
        assert_eq!(xlat.read(Space::BulkMemory, 7), descriptor);
        assert_eq!(xlat.read(Space::Scratchpad, 7), Descriptor::INVALID);
        assert_eq!(xlat.read(Space::BulkMemory, 200), Descriptor::INVALID);

        xlat.reset();
        for handle in 0..32 {
            assert!(!xlat.read(Space::BulkMemory, handle).valid);
            assert!(!xlat.read(Space::Scratchpad, handle).valid);
        }
    }

    #[test]
    #[should_panic(expected = "written twice in one cycle")]
    fn test_one_write_per_cycle() {
        let mut xlat = BufferToPhysXlat::new();
        xlat.write(Space::BulkMemory, 0, Descriptor::new(0, 1, 1));
        xlat.write(Space::BulkMemory, 1, Descriptor::new(0, 1, 1));
    }
}
