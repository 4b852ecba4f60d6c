use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::info;

use crate::errors::{FundusSegError, Result};
use crate::pairing::Pairing;

pub const IMAGES_DIR: &str = "images";
pub const MASKS_DIR: &str = "masks";

/// One of the disjoint dataset partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Train, Split::Test];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }

    /// `{output_dir}/{split}.npz`
    pub fn archive_path(self, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("{}.npz", self.as_str()))
    }

    /// `{root}/{split}`
    pub fn dir(self, root: &Path) -> PathBuf {
        root.join(self.as_str())
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitAssignment {
    pub train: Vec<Pairing>,
    pub test: Vec<Pairing>,
}

impl SplitAssignment {
    pub fn get(&self, split: Split) -> &[Pairing] {
        match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        }
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Seeded train/test partitioning.
#[derive(Debug, Clone, Copy)]
pub struct SplitAssigner {
    ratio: f64,
    seed: u64,
}

impl SplitAssigner {
    pub fn new(ratio: f64, seed: u64) -> Result<Self> {
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(FundusSegError::Validation {
                field: "split_ratio".to_string(),
                reason: format!("must lie strictly between 0 and 1, got {ratio}"),
            });
        }
        Ok(Self { ratio, seed })
    }

    /// Sorts by image identifier, shuffles with the seed, and takes the first
    /// `floor(ratio * n)` pairings as train. An empty input yields two empty sets.
    ///
    /// The shuffle uses ChaCha8, whose output stream is fixed for a given
    /// seed, so an assignment is stable across toolchain and dependency updates.
    pub fn assign(&self, mut pairings: Vec<Pairing>) -> SplitAssignment {
        pairings.sort_by(|a, b| a.image_id.cmp(&b.image_id));

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        pairings.shuffle(&mut rng);

        let train_len = self.train_len(pairings.len());
        let test = pairings.split_off(train_len);
        SplitAssignment {
            train: pairings,
            test,
        }
    }

    pub fn train_len(&self, n: usize) -> usize {
        // 浮動小数点の表現誤差を吸収（例: 0.7 * 10 = 6.999...）
        let exact = self.ratio * n as f64;
        ((exact + 1e-9).floor() as usize).min(n)
    }
}

/// Copies every pairing into `{root}/{split}/images` and `{root}/{split}/masks`.
///
/// Both directories are recreated first so files from an earlier assignment
/// cannot leak into the other split.
pub fn materialize(assignment: &SplitAssignment, root: &Path) -> Result<()> {
    for split in Split::ALL {
        let split_dir = split.dir(root);
        let images_dir = split_dir.join(IMAGES_DIR);
        let masks_dir = split_dir.join(MASKS_DIR);

        for dir in [&images_dir, &masks_dir] {
            if dir.exists() {
                fs::remove_dir_all(dir).map_err(|e| FundusSegError::FileSystem {
                    path: dir.clone(),
                    operation: "stale split directory removal".to_string(),
                    source: e,
                })?;
            }
            fs::create_dir_all(dir).map_err(|e| FundusSegError::FileSystem {
                path: dir.clone(),
                operation: "split directory creation".to_string(),
                source: e,
            })?;
        }

        for pairing in assignment.get(split) {
            copy_into(&pairing.image_path, &images_dir)?;
            copy_into(&pairing.mask_path, &masks_dir)?;
        }

        info!(
            split = %split,
            pairs = assignment.get(split).len(),
            dir = %split_dir.display(),
            "split materialized"
        );
    }
    Ok(())
}

fn copy_into(source: &Path, dir: &Path) -> Result<()> {
    let file_name = source
        .file_name()
        .ok_or_else(|| FundusSegError::FileSystem {
            path: source.to_path_buf(),
            operation: "file name extraction".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
        })?;
    let destination = dir.join(file_name);
    fs::copy(source, &destination).map_err(|e| FundusSegError::FileSystem {
        path: destination,
        operation: "file copy".to_string(),
        source: e,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn pairings(n: usize) -> Vec<Pairing> {
        (0..n)
            .map(|i| Pairing {
                image_id: format!("image{i:03}"),
                image_path: PathBuf::from(format!("fundus/image{i:03}.png")),
                mask_path: PathBuf::from(format!("masks/image{i:03}_valid.png")),
            })
            .collect()
    }

    #[test]
    fn test_assign_is_a_partition() -> Result<()> {
        for n in [1, 2, 5, 10, 37, 100] {
            for seed in [0, 1, 42, 9999] {
                for ratio in [0.1, 0.5, 0.7, 0.8, 0.95] {
                    let input = pairings(n);
                    let assignment = SplitAssigner::new(ratio, seed)?.assign(input.clone());

                    let train: HashSet<_> = assignment.train.iter().collect();
                    let test: HashSet<_> = assignment.test.iter().collect();
                    assert!(train.is_disjoint(&test));
                    assert_eq!(train.len() + test.len(), n);
                    assert_eq!(assignment.len(), n);
                    let all: HashSet<_> = input.iter().collect();
                    let union: HashSet<_> = train.union(&test).copied().collect();
                    assert_eq!(union, all);

                    let expected = ratio * n as f64;
                    assert!((assignment.train.len() as f64 - expected).abs() <= 1.0);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_assign_is_deterministic_and_order_independent() -> Result<()> {
        let assigner = SplitAssigner::new(0.8, 42)?;
        let first = assigner.assign(pairings(20));

        let mut reversed = pairings(20);
        reversed.reverse();
        let second = assigner.assign(reversed);

        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_assign_follows_chacha8_stream() -> Result<()> {
        let mut expected = pairings(12);
        expected.shuffle(&mut ChaCha8Rng::seed_from_u64(42));

        let mut input = pairings(12);
        input.rotate_left(5);
        let assignment = SplitAssigner::new(0.75, 42)?.assign(input);

        assert_eq!(assignment.train, expected[..9]);
        assert_eq!(assignment.test, expected[9..]);
        Ok(())
    }

    #[test]
    fn test_seed_changes_assignment() -> Result<()> {
        let a = SplitAssigner::new(0.5, 1)?.assign(pairings(20));
        let b = SplitAssigner::new(0.5, 2)?.assign(pairings(20));
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn test_assign_empty_input() -> Result<()> {
        let assignment = SplitAssigner::new(0.8, 42)?.assign(Vec::new());
        assert!(assignment.is_empty());
        assert!(assignment.train.is_empty());
        assert!(assignment.test.is_empty());
        Ok(())
    }

    #[test]
    fn test_train_len_floors() -> Result<()> {
        let assigner = SplitAssigner::new(0.8, 0)?;
        assert_eq!(assigner.train_len(5), 4);
        assert_eq!(assigner.train_len(1), 0);
        assert_eq!(SplitAssigner::new(0.7, 0)?.train_len(10), 7);
        assert_eq!(SplitAssigner::new(0.99, 0)?.train_len(10), 9);
        Ok(())
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        assert!(SplitAssigner::new(0.0, 1).is_err());
        assert!(SplitAssigner::new(1.0, 1).is_err());
    }

    #[test]
    fn test_materialize_recreates_split_directories() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;
        let mut input = Vec::new();
        for id in ["a", "b", "c"] {
            let image_path = source.join(format!("{id}.png"));
            let mask_path = source.join(format!("{id}_valid.png"));
            fs::write(&image_path, id)?;
            fs::write(&mask_path, id)?;
            input.push(Pairing {
                image_id: id.to_string(),
                image_path,
                mask_path,
            });
        }

        let root = temp_dir.path().join("processed");
        let stale = Split::Test.dir(&root).join(IMAGES_DIR);
        fs::create_dir_all(&stale)?;
        fs::write(stale.join("stale.png"), b"old")?;

        let assignment = SplitAssigner::new(0.67, 7)?.assign(input);
        materialize(&assignment, &root)?;

        for split in Split::ALL {
            let images: Vec<_> = fs::read_dir(split.dir(&root).join(IMAGES_DIR))?.collect();
            let masks: Vec<_> = fs::read_dir(split.dir(&root).join(MASKS_DIR))?.collect();
            assert_eq!(images.len(), assignment.get(split).len());
            assert_eq!(masks.len(), assignment.get(split).len());
        }
        assert!(!stale.join("stale.png").exists());
        Ok(())
    }

    #[test]
    fn test_archive_path() {
        assert_eq!(
            Split::Train.archive_path(Path::new("out")),
            Path::new("out/train.npz")
        );
        assert_eq!(Split::Test.to_string(), "test");
    }
}
