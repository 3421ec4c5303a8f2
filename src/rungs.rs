use serde::{Deserialize, Serialize};

use crate::codec::ResourceRange;
use crate::errors::{Result, TuneError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RungLevels {
    range: ResourceRange,
    levels: Vec<u32>,
}

impl RungLevels {
    pub fn geometric(range: ResourceRange, reduction_factor: f64) -> Result<Self> {
        if !(reduction_factor > 1.) {
            return Err(TuneError::InvalidConfiguration(format!(
                "reduction factor must be larger than 1, received {}",
                reduction_factor
            )));
        }
        let mut levels = Vec::new();
        let mut level = range.min as f64;
        while level.round() < range.max as f64 {
            let rounded = level.round() as u32;
            if levels.last() != Some(&rounded) {
                levels.push(rounded);
            }
            level *= reduction_factor;
        }
        levels.push(range.max);
        Ok(Self { range, levels })
    }

    pub fn from_levels(range: ResourceRange, mut levels: Vec<u32>) -> Result<Self> {
        if levels.last() != Some(&range.max) {
            levels.push(range.max);
        }
        let increasing = levels.windows(2).all(|w| w[0] < w[1]);
        if !increasing || !levels.iter().all(|r| range.contains(*r)) {
            return Err(TuneError::InvalidConfiguration(format!(
                "rung levels {:?} must be strictly increasing inside [{}, {}]",
                levels, range.min, range.max
            )));
        }
        Ok(Self { range, levels })
    }

    pub fn range(&self) -> ResourceRange {
        self.range
    }

    pub fn levels(&self) -> &[u32] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn first(&self) -> u32 {
        self.levels[0]
    }

    pub fn max(&self) -> u32 {
        self.range.max
    }

    pub fn contains(&self, resource: u32) -> bool {
        self.levels.binary_search(&resource).is_ok()
    }

    pub fn next_after(&self, resource: u32) -> Option<u32> {
        self.levels.iter().copied().find(|r| *r > resource)
    }

    /// Levels of bracket `index`, which skips the `index` lowest rungs. The
    /// last bracket only evaluates at r_max.
    pub fn bracket(&self, index: usize) -> &[u32] {
        &self.levels[index.min(self.levels.len() - 1)..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometric_levels_end_at_max() {
        let rungs = RungLevels::geometric(ResourceRange::new(1, 81).unwrap(), 3.).unwrap();
        assert_eq!(rungs.levels(), &[1, 3, 9, 27, 81]);
        let rungs = RungLevels::geometric(ResourceRange::new(1, 100).unwrap(), 3.).unwrap();
        assert_eq!(rungs.levels(), &[1, 3, 9, 27, 81, 100]);
        let rungs = RungLevels::geometric(ResourceRange::new(5, 5).unwrap(), 2.).unwrap();
        assert_eq!(rungs.levels(), &[5]);
    }

    #[test]
    fn navigation() {
        let rungs = RungLevels::geometric(ResourceRange::new(1, 27).unwrap(), 3.).unwrap();
        assert_eq!(rungs.next_after(3), Some(9));
        assert_eq!(rungs.next_after(5), Some(9));
        assert_eq!(rungs.next_after(27), None);
        assert!(rungs.contains(9));
        assert!(!rungs.contains(10));
        assert_eq!(rungs.bracket(1), &[3, 9, 27]);
        assert_eq!(rungs.bracket(10), &[27]);
    }

    #[test]
    fn invalid_levels_are_rejected() {
        let range = ResourceRange::new(1, 27).unwrap();
        assert!(RungLevels::geometric(range, 1.).is_err());
        assert!(RungLevels::from_levels(range, vec![3, 2]).is_err());
        assert!(RungLevels::from_levels(range, vec![0, 3]).is_err());
        assert_eq!(
            RungLevels::from_levels(range, vec![2, 6]).unwrap().levels(),
            &[2, 6, 27]
        );
    }
}
