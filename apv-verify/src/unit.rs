//! Units of work and the output directory layout
//!
//! A unit is one (visit, detector) pair. Units are processed visit-major,
//! detector-minor, and that order decides both the merge grouping order and
//! which unit's job is the final one.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use apv_common::{Error, Result};

/// File name of the merged job
pub const MERGED_JOB_FILE: &str = "apv.verify.json";

/// Most ids a single `start-end` range may expand to
pub const MAX_RANGE_LEN: u64 = 100_000;

/// One (visit, detector) unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId {
    pub visit: u64,
    pub detector: u32,
}

impl UnitId {
    pub fn new(visit: u64, detector: u32) -> Self {
        Self { visit, detector }
    }

    /// Data id in the form stages expect, `visit=V detector=D`
    pub fn data_id(&self) -> String {
        format!("visit={} detector={}", self.visit, self.detector)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}_d{:02}", self.visit, self.detector)
    }
}

/// Every (visit, detector) combination, sorted into processing order
pub fn unit_grid(visits: &[u64], detectors: &[u32]) -> Vec<UnitId> {
    let mut units: Vec<UnitId> = visits
        .iter()
        .flat_map(|&visit| detectors.iter().map(move |&detector| UnitId::new(visit, detector)))
        .collect();
    units.sort();
    units.dedup();
    units
}

/// Parse a list such as `3-60,62` into sorted, de-duplicated values
///
/// Ranges are inclusive and hold at most [`MAX_RANGE_LEN`] ids. Whitespace
/// around items is ignored.
pub fn parse_id_list<T>(list: &str) -> Result<Vec<T>>
where
    T: FromStr + Ord + Copy + Into<u64> + TryFrom<u64>,
{
    let mut values = Vec::new();
    for item in list.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        match item.split_once('-') {
            Some((start, end)) => {
                let start: T = parse_id(start.trim(), list)?;
                let end: T = parse_id(end.trim(), list)?;
                if start > end {
                    return Err(Error::InvalidInput(format!(
                        "Descending range {} in {:?}",
                        item, list
                    )));
                }
                let (start, end): (u64, u64) = (start.into(), end.into());
                if end - start >= MAX_RANGE_LEN {
                    return Err(Error::InvalidInput(format!(
                        "Range {} in {:?} exceeds {} ids",
                        item, list, MAX_RANGE_LEN
                    )));
                }
                for value in start..=end {
                    let value = T::try_from(value).map_err(|_| {
                        Error::InvalidInput(format!("Value {} out of range in {:?}", value, list))
                    })?;
                    values.push(value);
                }
            }
            None => values.push(parse_id(item, list)?),
        }
    }

    if values.is_empty() {
        return Err(Error::InvalidInput(format!("No ids in {:?}", list)));
    }
    values.sort();
    values.dedup();
    Ok(values)
}

fn parse_id<T: FromStr>(text: &str, list: &str) -> Result<T> {
    text.parse()
        .map_err(|_| Error::InvalidInput(format!("Invalid id {:?} in {:?}", text, list)))
}

/// Layout of the output directory
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Workspace rooted at `root`, made absolute against the current directory
    ///
    /// Stages run inside their unit directory, so every path handed to them
    /// has to be absolute.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-unit job file, `apv_v{visit}_d{detector:02}.verify.json`
    pub fn unit_job_path(&self, unit: UnitId) -> PathBuf {
        self.root
            .join(format!("apv_v{}_d{:02}.verify.json", unit.visit, unit.detector))
    }

    pub fn merged_job_path(&self) -> PathBuf {
        self.root.join(MERGED_JOB_FILE)
    }

    /// Scratch directory for one unit's stage outputs
    pub fn unit_dir(&self, unit: UnitId) -> PathBuf {
        self.root.join("units").join(unit.to_string())
    }

    /// Create the output directory and the unit's scratch directory
    pub fn ensure_unit_dir(&self, unit: UnitId) -> Result<PathBuf> {
        let dir = self.unit_dir(unit);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_order_is_visit_major() {
        let units = unit_grid(&[411033, 410915], &[10, 5]);
        assert_eq!(
            units,
            vec![
                UnitId::new(410915, 5),
                UnitId::new(410915, 10),
                UnitId::new(411033, 5),
                UnitId::new(411033, 10),
            ]
        );
    }

    #[test]
    fn test_unit_grid_empty_axis() {
        assert!(unit_grid(&[1, 2], &[]).is_empty());
    }

    #[test]
    fn test_data_id_and_display() {
        let unit = UnitId::new(410915, 5);
        assert_eq!(unit.data_id(), "visit=410915 detector=5");
        assert_eq!(unit.to_string(), "v410915_d05");
    }

    #[test]
    fn test_parse_id_list() {
        let detectors: Vec<u32> = parse_id_list("3-6, 62,5").unwrap();
        assert_eq!(detectors, vec![3, 4, 5, 6, 62]);

        let visits: Vec<u64> = parse_id_list("410915").unwrap();
        assert_eq!(visits, vec![410915]);
    }

    #[test]
    fn test_parse_id_list_errors() {
        assert!(parse_id_list::<u32>("").is_err());
        assert!(parse_id_list::<u32>("7-3").is_err());
        assert!(parse_id_list::<u32>("a,b").is_err());
        assert!(parse_id_list::<u32>("1-x").is_err());
    }

    #[test]
    fn test_parse_id_list_rejects_huge_range() {
        assert!(matches!(
            parse_id_list::<u32>("1-4000000000"),
            Err(Error::InvalidInput(_))
        ));
        assert!(parse_id_list::<u64>("0-18446744073709551615").is_err());

        let largest: Vec<u64> = parse_id_list(&format!("1-{}", MAX_RANGE_LEN)).unwrap();
        assert_eq!(largest.len() as u64, MAX_RANGE_LEN);
    }

    #[test]
    fn test_workspace_paths() {
        let workspace = Workspace::new("/data/out");
        let unit = UnitId::new(410915, 5);
        assert_eq!(
            workspace.unit_job_path(unit),
            PathBuf::from("/data/out/apv_v410915_d05.verify.json")
        );
        assert_eq!(workspace.merged_job_path(), PathBuf::from("/data/out/apv.verify.json"));
        assert_eq!(workspace.unit_dir(unit), PathBuf::from("/data/out/units/v410915_d05"));
    }

    #[test]
    fn test_relative_root_is_made_absolute() {
        let workspace = Workspace::new("apv-output");
        let expected = std::env::current_dir().unwrap().join("apv-output");
        assert!(workspace.root().is_absolute());
        assert_eq!(workspace.root(), expected);
        assert!(workspace.unit_dir(UnitId::new(1, 1)).is_absolute());
    }
}
