use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::MaskNaming;
use crate::errors::{FundusSegError, Result};

/// An image file matched to its label mask by naming convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Pairing {
    pub image_id: String,
    pub image_path: PathBuf,
    pub mask_path: PathBuf,
}

/// Outcome of pair discovery. Images without a mask are listed in
/// `unresolved`, never dropped silently.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PairingReport {
    /// Sorted by image identifier.
    pub pairings: Vec<Pairing>,
    pub unresolved: Vec<String>,
    /// Extra files sharing an identifier with an already paired image.
    pub duplicates: Vec<PathBuf>,
    /// Image files whose name is not valid UTF-8 and so has no identifier.
    pub skipped: Vec<PathBuf>,
}

impl PairingReport {
    pub fn unresolved_errors<'a>(
        &'a self,
        mask_dir: &'a Path,
        naming: &'a MaskNaming,
    ) -> impl Iterator<Item = FundusSegError> + 'a {
        self.unresolved
            .iter()
            .map(move |image_id| FundusSegError::Pairing {
                image_id: image_id.clone(),
                expected_mask: naming.mask_path(mask_dir, image_id),
            })
    }
}

/// Discovers image/mask pairs in a fundus-image directory and a mask directory.
#[derive(Debug, Clone)]
pub struct PairLocator {
    fundus_dir: PathBuf,
    mask_dir: PathBuf,
    naming: MaskNaming,
}

impl PairLocator {
    pub fn new(
        fundus_dir: impl Into<PathBuf>,
        mask_dir: impl Into<PathBuf>,
        naming: MaskNaming,
    ) -> Self {
        Self {
            fundus_dir: fundus_dir.into(),
            mask_dir: mask_dir.into(),
            naming,
        }
    }

    pub fn fundus_dir(&self) -> &Path {
        &self.fundus_dir
    }

    pub fn mask_dir(&self) -> &Path {
        &self.mask_dir
    }

    pub fn naming(&self) -> &MaskNaming {
        &self.naming
    }

    /// Fails only when the fundus directory is unreadable or holds no images.
    /// A missing mask is reported and skipped.
    pub fn locate(&self) -> Result<PairingReport> {
        self.locate_with(false)
    }

    /// Like [`PairLocator::locate`], but an existing directory without images
    /// yields an empty report. Used for split directories, where an empty test
    /// split is legitimate.
    pub fn locate_or_empty(&self) -> Result<PairingReport> {
        self.locate_with(true)
    }

    fn locate_with(&self, allow_empty: bool) -> Result<PairingReport> {
        let (images, skipped) = self.collect_image_files()?;

        if images.is_empty() && !allow_empty {
            return Err(FundusSegError::FileSystem {
                path: self.fundus_dir.clone(),
                operation: "fundus image discovery".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no supported image files in directory",
                ),
            });
        }

        let mut report = PairingReport {
            skipped,
            ..PairingReport::default()
        };
        for (image_id, mut paths) in images {
            paths.sort();
            let mut paths = paths.into_iter();
            let Some(image_path) = paths.next() else {
                continue;
            };
            for duplicate in paths {
                warn!(
                    image_id = %image_id,
                    path = %duplicate.display(),
                    "duplicate image identifier, ignoring file"
                );
                report.duplicates.push(duplicate);
            }

            let mask_path = self.naming.mask_path(&self.mask_dir, &image_id);
            if mask_path.is_file() {
                debug!(image_id = %image_id, "paired");
                report.pairings.push(Pairing {
                    image_id,
                    image_path,
                    mask_path,
                });
            } else {
                warn!(
                    image_id = %image_id,
                    expected = %mask_path.display(),
                    "no mask for image, skipping"
                );
                report.unresolved.push(image_id);
            }
        }

        Ok(report)
    }

    /// Image files directly inside the fundus directory, grouped by identifier,
    /// plus the files whose stem is not valid UTF-8.
    fn collect_image_files(&self) -> Result<(BTreeMap<String, Vec<PathBuf>>, Vec<PathBuf>)> {
        let mut images: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        let mut skipped = Vec::new();

        for entry in WalkDir::new(&self.fundus_dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.fundus_dir).to_path_buf();
                FundusSegError::FileSystem {
                    path,
                    operation: "fundus directory listing".to_string(),
                    source: e.into(),
                }
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() || !is_supported_image_format(path) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(image_id) => images
                    .entry(image_id.to_string())
                    .or_default()
                    .push(path.to_path_buf()),
                None => {
                    warn!(
                        path = %path.display(),
                        "image file name is not valid UTF-8, skipping"
                    );
                    skipped.push(path.to_path_buf());
                }
            }
        }
        skipped.sort();

        Ok((images, skipped))
    }
}

pub fn is_supported_image_format(path: &Path) -> bool {
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        matches!(
            extension.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp" | "gif" | "tiff" | "tif"
        )
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::write(path, b"").unwrap();
    }

    fn layout(ids: &[&str], masks: &[&str]) -> (TempDir, PathBuf, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let fundus = temp_dir.path().join("fundus");
        let masks_dir = temp_dir.path().join("masks");
        fs::create_dir_all(&fundus).unwrap();
        fs::create_dir_all(&masks_dir).unwrap();
        for id in ids {
            touch(&fundus.join(format!("{id}.png")));
        }
        for id in masks {
            touch(&masks_dir.join(format!("{id}_valid.png")));
        }
        (temp_dir, fundus, masks_dir)
    }

    #[test]
    fn test_locate_pairs_sorted_and_reports_missing() -> Result<()> {
        let (_guard, fundus, masks) = layout(&["c", "a", "b", "d"], &["a", "c", "d"]);

        let report = PairLocator::new(&fundus, &masks, MaskNaming::default()).locate()?;

        let ids: Vec<_> = report.pairings.iter().map(|p| p.image_id.as_str()).collect();
        assert_eq!(ids, ["a", "c", "d"]);
        assert_eq!(report.unresolved, ["b"]);
        assert_eq!(report.pairings[0].mask_path, masks.join("a_valid.png"));
        Ok(())
    }

    #[test]
    fn test_locate_ignores_non_images_and_subdirectories() -> Result<()> {
        let (_guard, fundus, masks) = layout(&["a"], &["a", "z"]);
        touch(&fundus.join("notes.txt"));
        fs::create_dir_all(fundus.join("nested")).unwrap();
        touch(&fundus.join("nested").join("z.png"));

        let report = PairLocator::new(&fundus, &masks, MaskNaming::default()).locate()?;

        assert_eq!(report.pairings.len(), 1);
        assert!(report.unresolved.is_empty());
        Ok(())
    }

    #[test]
    fn test_locate_reports_duplicate_identifiers() -> Result<()> {
        let (_guard, fundus, masks) = layout(&["a"], &["a"]);
        touch(&fundus.join("a.jpg"));

        let report = PairLocator::new(&fundus, &masks, MaskNaming::default()).locate()?;

        assert_eq!(report.pairings.len(), 1);
        assert_eq!(report.pairings[0].image_path, fundus.join("a.jpg"));
        assert_eq!(report.duplicates, [fundus.join("a.png")]);
        Ok(())
    }

    #[test]
    fn test_locate_fails_on_empty_or_missing_directory() {
        let (_guard, fundus, masks) = layout(&[], &[]);
        let locator = PairLocator::new(&fundus, &masks, MaskNaming::default());
        assert!(matches!(
            locator.locate(),
            Err(FundusSegError::FileSystem { .. })
        ));

        let locator = PairLocator::new(fundus.join("missing"), &masks, MaskNaming::default());
        assert!(matches!(
            locator.locate(),
            Err(FundusSegError::FileSystem { .. })
        ));
    }

    #[test]
    fn test_locate_or_empty_accepts_empty_directory() -> Result<()> {
        let (_guard, fundus, masks) = layout(&[], &[]);
        let report = PairLocator::new(&fundus, &masks, MaskNaming::default()).locate_or_empty()?;
        assert!(report.pairings.is_empty());
        Ok(())
    }

    #[test]
    fn test_unresolved_errors_name_expected_mask() -> Result<()> {
        let (_guard, fundus, masks) = layout(&["a"], &[]);
        let naming = MaskNaming::default();
        let report = PairLocator::new(&fundus, &masks, naming.clone()).locate()?;

        let errors: Vec<_> = report.unresolved_errors(&masks, &naming).collect();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            FundusSegError::Pairing {
                image_id,
                expected_mask,
            } => {
                assert_eq!(image_id, "a");
                assert_eq!(expected_mask, &masks.join("a_valid.png"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_reports_non_utf8_file_names() -> Result<()> {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (_guard, fundus, masks) = layout(&["a"], &["a"]);
        let odd = fundus.join(OsStr::from_bytes(b"bad\xff.png"));
        touch(&odd);

        let report = PairLocator::new(&fundus, &masks, MaskNaming::default()).locate()?;

        assert_eq!(report.pairings.len(), 1);
        assert_eq!(report.skipped, [odd]);
        assert!(report.unresolved.is_empty());
        Ok(())
    }

    #[test]
    fn test_supported_formats() {
        let test_cases = vec![
            ("test.jpg", true),
            ("test.JPEG", true),
            ("test.png", true),
            ("test.tif", true),
            ("test.txt", false),
            ("test", false),
        ];

        for (filename, expected) in test_cases {
            assert_eq!(is_supported_image_format(Path::new(filename)), expected);
        }
    }
}
