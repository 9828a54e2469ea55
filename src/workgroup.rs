use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Thread count of the narrowest workgroup tile.
pub const MIN_WORKGROUP_WIDTH: usize = 32;

/// Largest supported workgroup width exponent.
pub const MAX_WORKGROUP_WIDTH_LOG2: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dim {
    pub x: usize,
    pub y: usize,
}

impl Dim {
    #[must_use]
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.x * self.y
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

impl From<(usize, usize)> for Dim {
    fn from((x, y): (usize, usize)) -> Self {
        Self { x, y }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to parse dimension {value:?}: expected \"X,Y\"")]
pub struct ParseDimError {
    pub value: String,
    pub source: Option<std::num::ParseIntError>,
}

static DIM_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\(?\s*(\d+)\s*[,x]\s*(\d+)\s*\)?\s*$").unwrap());

impl std::str::FromStr for Dim {
    type Err = ParseDimError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let err = |source| ParseDimError {
            value: value.to_string(),
            source,
        };
        let captures = DIM_REGEX.captures(value).ok_or_else(|| err(None))?;
        let get_dim = |i: usize| -> Result<usize, ParseDimError> {
            let dim = captures.get(i).ok_or_else(|| err(None))?;
            dim.as_str().parse().map_err(|source| err(Some(source)))
        };
        Ok(Self::new(get_dim(1)?, get_dim(2)?))
    }
}

/// Malformed workgroup geometry.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("empty thread space {0}")]
    EmptyThreadSpace(Dim),
    #[error("workgroup width 2^{0} exceeds the supported maximum 2^{MAX_WORKGROUP_WIDTH_LOG2}")]
    WidthOutOfRange(u32),
    #[error("workgroup width {width} exceeds the {capacity} threads of a slot")]
    WidthExceedsCapacity { width: usize, capacity: usize },
}

/// A batch of co-launched threads.
///
/// Threads are numbered row by row inside the tile; consecutive threads
/// share a warp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Workgroup {
    pub id: usize,
    /// Global position of thread 0.
    pub offset: Dim,
    /// Tile width in threads.
    pub width: usize,
    /// Tile height in threads.
    pub height: usize,
    pub thread_space: Dim,
    /// Index of the last warp holding a thread inside the thread space.
    pub last_warp: usize,
}

impl Workgroup {
    /// Global id of a thread of the workgroup.
    #[must_use]
    pub fn thread_id(&self, local: usize) -> Dim {
        Dim {
            x: self.offset.x + local % self.width,
            y: self.offset.y + local / self.width,
        }
    }

    /// Whether a thread of the tile lies inside the thread space.
    #[must_use]
    pub fn contains(&self, local: usize) -> bool {
        if local >= self.width * self.height {
            return false;
        }
        let tid = self.thread_id(local);
        tid.x < self.thread_space.x && tid.y < self.thread_space.y
    }

    /// Threads of the tile inside the thread space.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        let x = self.thread_space.x.saturating_sub(self.offset.x).min(self.width);
        let y = self.thread_space.y.saturating_sub(self.offset.y).min(self.height);
        x * y
    }
}

impl std::fmt::Display for Workgroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Workgroup({} @ {} {}x{} last warp {})",
            self.id, self.offset, self.width, self.height, self.last_warp
        )
    }
}

/// Raster enumeration of a thread space into workgroup tiles.
///
/// Tiles are `32 * 2^width_log2` threads wide and fill the thread capacity
/// of one slot. Enumeration is row by row, X fastest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    thread_space: Dim,
    width: usize,
    height: usize,
    lanes: usize,
    next: Option<Dim>,
    id: usize,
}

impl Raster {
    pub fn new(
        thread_space: Dim,
        width_log2: u32,
        capacity: usize,
        lanes: usize,
    ) -> Result<Self, GeometryError> {
        if thread_space.size() == 0 {
            return Err(GeometryError::EmptyThreadSpace(thread_space));
        }
        if width_log2 > MAX_WORKGROUP_WIDTH_LOG2 {
            return Err(GeometryError::WidthOutOfRange(width_log2));
        }
        let width = MIN_WORKGROUP_WIDTH << width_log2;
        if width > capacity {
            return Err(GeometryError::WidthExceedsCapacity { width, capacity });
        }
        Ok(Self {
            thread_space,
            width,
            height: capacity / width,
            lanes,
            next: Some(Dim::new(0, 0)),
            id: 0,
        })
    }

    #[must_use]
    pub fn tile(&self) -> Dim {
        Dim::new(self.width, self.height)
    }

    /// Number of workgroups covering the thread space.
    #[must_use]
    pub fn num_workgroups(&self) -> usize {
        self.thread_space.x.div_ceil(self.width) * self.thread_space.y.div_ceil(self.height)
    }
}

impl Iterator for Raster {
    type Item = Workgroup;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next?;
        let mut next = Dim::new(offset.x + self.width, offset.y);
        if next.x >= self.thread_space.x {
            next = Dim::new(0, offset.y + self.height);
        }
        self.next = (next.y < self.thread_space.y).then_some(next);

        let rows = self
            .thread_space
            .y
            .saturating_sub(offset.y)
            .min(self.height);
        let last_warp = (rows * self.width).div_ceil(self.lanes) - 1;
        let workgroup = Workgroup {
            id: self.id,
            offset,
            width: self.width,
            height: self.height,
            thread_space: self.thread_space,
            last_warp,
        };
        self.id += 1;
        Some(workgroup)
    }
}

#[cfg(test)]
mod tests {
    use super::{Dim, GeometryError, Raster, Workgroup};
    use pretty_assertions_sorted as diff;
    use std::collections::HashSet;

    #[test]
    fn test_two_workgroups_for_64_threads() -> Result<(), GeometryError> {
        let workgroups: Vec<Workgroup> = Raster::new(Dim::new(64, 1), 0, 1024, 8)?.collect();
        diff::assert_eq!(
            workgroups.iter().map(|wg| wg.offset).collect::<Vec<_>>(),
            vec![Dim::new(0, 0), Dim::new(32, 0)]
        );
        // one row of 32 threads => 4 warps of 8 lanes
        assert_eq!(workgroups[0].last_warp, 3);
        assert_eq!(workgroups[1].id, 1);
        Ok(())
    }

    #[test]
    fn test_raster_order_is_x_fastest() -> Result<(), GeometryError> {
        let raster = Raster::new(Dim::new(128, 64), 1, 1024, 8)?;
        assert_eq!(raster.tile(), Dim::new(64, 16));
        let offsets: Vec<Dim> = raster.map(|wg| wg.offset).collect();
        diff::assert_eq!(
            offsets,
            vec![
                Dim::new(0, 0),
                Dim::new(64, 0),
                Dim::new(0, 16),
                Dim::new(64, 16),
                Dim::new(0, 32),
                Dim::new(64, 32),
                Dim::new(0, 48),
                Dim::new(64, 48),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_workgroups_tile_thread_space_exactly() -> Result<(), GeometryError> {
        for (dims, width_log2, capacity) in [
            (Dim::new(64, 1), 0, 1024),
            (Dim::new(100, 7), 0, 64),
            (Dim::new(33, 33), 1, 256),
            (Dim::new(1, 1), 0, 32),
            (Dim::new(1000, 3), 2, 512),
        ] {
            let raster = Raster::new(dims, width_log2, capacity, 8)?;
            let expected = raster.num_workgroups();
            let mut seen = HashSet::new();
            let mut count = 0;
            for wg in raster {
                count += 1;
                for local in 0..wg.width * wg.height {
                    if wg.contains(local) {
                        let tid = wg.thread_id(local);
                        assert!(seen.insert(tid), "{tid} covered twice");
                    }
                }
                assert!(wg.last_warp < wg.width * wg.height / 8, "{wg}");
            }
            assert_eq!(count, expected);
            assert_eq!(seen.len(), dims.size(), "{dims} not covered");
        }
        Ok(())
    }

    #[test]
    fn test_malformed_geometry_is_rejected() {
        assert_eq!(
            Raster::new(Dim::new(64, 1), 3, 128, 8).err(),
            Some(GeometryError::WidthExceedsCapacity {
                width: 256,
                capacity: 128
            })
        );
        assert_eq!(
            Raster::new(Dim::new(0, 4), 0, 128, 8).err(),
            Some(GeometryError::EmptyThreadSpace(Dim::new(0, 4)))
        );
    }

    #[test]
    fn test_parse_dim() {
        assert_eq!("40,3".parse(), Ok(Dim::new(40, 3)));
        assert_eq!(" (64, 1) ".parse(), Ok(Dim::new(64, 1)));
        assert_eq!("128x2".parse(), Ok(Dim::new(128, 2)));
        assert!("40".parse::<Dim>().is_err());
        assert!("-1,3".parse::<Dim>().is_err());
    }
}
