use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use ndarray::prelude::*;
use ndarray::OwnedRepr;
use ndarray_npy::{NpzReader, NpzWriter};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, warn};

use crate::errors::{FundusSegError, Result};

pub const IMAGES_KEY: &str = "images";
pub const MASKS_KEY: &str = "masks";

/// Aligned images `[N, H, W, 3]` and masks `[N, H, W, C]` of one split.
///
/// Built once and never mutated; re-deriving a split rebuilds the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    images: Array4<f32>,
    masks: Array4<f32>,
}

impl Dataset {
    pub fn new(images: Array4<f32>, masks: Array4<f32>) -> Result<Self> {
        let (n, h, w, c) = images.dim();
        let (mn, mh, mw, _) = masks.dim();
        if c != 3 {
            return Err(shape_error(format!("images have {c} channels, expected 3")));
        }
        if (n, h, w) != (mn, mh, mw) {
            return Err(shape_error(format!(
                "images {:?} and masks {:?} disagree on sample count or resolution",
                images.shape(),
                masks.shape()
            )));
        }
        Ok(Self { images, masks })
    }

    /// Empty dataset with the given spatial contract.
    pub fn empty(resolution: u32, class_count: usize) -> Self {
        let size = resolution as usize;
        Self {
            images: Array4::zeros((0, size, size, 3)),
            masks: Array4::zeros((0, size, size, class_count)),
        }
    }

    pub fn images(&self) -> ArrayView4<'_, f32> {
        self.images.view()
    }

    pub fn masks(&self) -> ArrayView4<'_, f32> {
        self.masks.view()
    }

    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(height, width)`
    pub fn resolution(&self) -> (usize, usize) {
        let (_, h, w, _) = self.images.dim();
        (h, w)
    }

    pub fn class_count(&self) -> usize {
        self.masks.len_of(Axis(3))
    }

    pub fn into_arrays(self) -> (Array4<f32>, Array4<f32>) {
        (self.images, self.masks)
    }

    /// Writes a compressed `.npz` holding `images` and `masks`.
    ///
    /// The archive appears at `path` only once completely written: data goes to
    /// a temporary file in the same directory which is then renamed. Concurrent
    /// writers to the same path are serialized by an exclusive lock.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writes = StagedWrites::new();
        self.stage(&mut writes, path)?;
        writes.commit()
    }

    /// Stages the archive for `path` without touching `path` itself; it is
    /// renamed into place when `writes` is committed.
    pub fn stage(&self, writes: &mut StagedWrites, path: &Path) -> Result<()> {
        writes.stage(path, |file| self.write_npz(file))
    }

    fn write_npz(&self, file: &mut NamedTempFile) -> std::io::Result<()> {
        let mut npz = NpzWriter::new_compressed(file);
        npz.add_array(IMAGES_KEY, &self.images)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        npz.add_array(MASKS_KEY, &self.masks)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        npz.finish()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(())
    }

    /// Loads and checks an archive written by [`Dataset::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let file =
            File::open(path).map_err(|e| format_error(path, format!("cannot be opened: {e}")))?;
        let mut npz = NpzReader::new(file)
            .map_err(|e| format_error(path, format!("is not an npz archive: {e}")))?;
        let names = npz
            .names()
            .map_err(|e| format_error(path, format!("has an unreadable index: {e}")))?;

        let images = read_array(&mut npz, &names, IMAGES_KEY, path)?;
        let masks = read_array(&mut npz, &names, MASKS_KEY, path)?;

        let dataset = Self::new(images, masks).map_err(|e| match e {
            FundusSegError::Shape { reason, .. } => format_error(path, reason),
            other => other,
        })?;
        dataset.check_values(path)?;
        debug!(path = %path.display(), samples = dataset.len(), "archive loaded");
        Ok(dataset)
    }

    /// Loads an archive and checks it against an expected resolution and class count.
    pub fn load_expecting(path: &Path, resolution: u32, class_count: usize) -> Result<Self> {
        let dataset = Self::load(path)?;
        let size = resolution as usize;
        if dataset.resolution() != (size, size) {
            return Err(format_error(
                path,
                format!(
                    "has resolution {:?}, expected {size}x{size}",
                    dataset.resolution()
                ),
            ));
        }
        if dataset.class_count() != class_count {
            return Err(format_error(
                path,
                format!(
                    "has {} mask channels, expected {class_count}",
                    dataset.class_count()
                ),
            ));
        }
        Ok(dataset)
    }

    fn check_values(&self, path: &Path) -> Result<()> {
        if self.images.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(format_error(path, "holds image values outside [0, 1]".to_string()));
        }
        if self.masks.iter().any(|&v| v != 0.0 && v != 1.0) {
            return Err(format_error(path, "holds non-binary mask values".to_string()));
        }
        Ok(())
    }
}

fn read_array(
    npz: &mut NpzReader<File>,
    names: &[String],
    key: &str,
    path: &Path,
) -> Result<Array4<f32>> {
    let with_extension = format!("{key}.npy");
    let name = names
        .iter()
        .find(|n| n.as_str() == key || *n == &with_extension)
        .ok_or_else(|| format_error(path, format!("has no `{key}` array")))?;
    npz.by_name::<OwnedRepr<f32>, Ix4>(name)
        .map_err(|e| format_error(path, format!("has an unreadable `{key}` array: {e}")))
}

/// Exclusive lock on `{path}.lock`, released on drop.
///
/// The lock file stays on disk after release and later writes reuse it.
/// Unlinking it would let two writers hold locks on different inodes.
pub struct ArchiveLock {
    file: File,
    path: PathBuf,
}

impl ArchiveLock {
    pub fn acquire(archive: &Path) -> Result<Self> {
        let path = lock_path(archive);
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| persistence_error(&path, "lock file creation", e))?;
        file.lock()
            .map_err(|e| persistence_error(&path, "lock acquisition", e))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub fn lock_path(archive: &Path) -> PathBuf {
    let mut name = archive.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    archive.with_file_name(name)
}

/// Runs `write` against a temporary file next to `destination` and renames it
/// into place on success. On failure the temporary file is removed and any
/// previous file at `destination` is left untouched.
pub fn write_atomically<F>(destination: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut NamedTempFile) -> std::io::Result<()>,
{
    let mut writes = StagedWrites::new();
    writes.stage(destination, write)?;
    writes.commit()
}

/// A batch of files that reach their destinations together or not at all.
///
/// [`StagedWrites::stage`] locks a destination and writes its content to a
/// synced temporary file beside it. [`StagedWrites::commit`] then renames every
/// temporary into place. If one rename fails, destinations already replaced
/// get their previous file back (or are removed if they had none). Dropping an
/// uncommitted batch deletes the temporaries and leaves every destination as
/// it was. Locks are held until the batch is committed or dropped.
#[derive(Default)]
pub struct StagedWrites {
    staged: Vec<StagedFile>,
}

struct StagedFile {
    destination: PathBuf,
    parent: PathBuf,
    temp: NamedTempFile,
    lock: ArchiveLock,
}

/// A destination already replaced during commit.
struct Replaced {
    destination: PathBuf,
    previous: Option<TempPath>,
    _lock: ArchiveLock,
}

impl StagedWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn stage<F>(&mut self, destination: &Path, write: F) -> Result<()>
    where
        F: FnOnce(&mut NamedTempFile) -> std::io::Result<()>,
    {
        if self.staged.iter().any(|f| f.destination == destination) {
            return Err(persistence_error(
                destination,
                "staging",
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "destination staged twice in one batch",
                ),
            ));
        }

        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .map_err(|e| persistence_error(&parent, "output directory creation", e))?;

        let lock = ArchiveLock::acquire(destination)?;

        let mut temp = NamedTempFile::new_in(&parent)
            .map_err(|e| persistence_error(destination, "temporary file creation", e))?;
        write(&mut temp).map_err(|e| persistence_error(destination, "archive write", e))?;
        temp.flush()
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| persistence_error(destination, "archive flush", e))?;

        debug!(path = %destination.display(), "archive staged");
        self.staged.push(StagedFile {
            destination: destination.to_path_buf(),
            parent,
            temp,
            lock,
        });
        Ok(())
    }

    /// Renames every staged file into place, in staging order.
    pub fn commit(self) -> Result<()> {
        let mut replaced = Vec::with_capacity(self.staged.len());
        for file in self.staged {
            match file.replace() {
                Ok(done) => replaced.push(done),
                Err(e) => {
                    roll_back(replaced);
                    return Err(e);
                }
            }
        }
        for done in &replaced {
            debug!(path = %done.destination.display(), "archive persisted");
        }
        Ok(())
    }
}

impl StagedFile {
    /// Moves any previous file at the destination aside, then renames the
    /// temporary into place. On failure the previous file is put back.
    fn replace(self) -> Result<Replaced> {
        let StagedFile {
            destination,
            parent,
            temp,
            lock,
        } = self;

        let previous = if destination.is_file() {
            Some(move_aside(&destination, &parent)?)
        } else {
            None
        };

        if let Err(e) = temp.persist(&destination) {
            if let Some(previous) = previous {
                restore(previous, &destination);
            }
            return Err(persistence_error(&destination, "atomic rename", e.error));
        }

        Ok(Replaced {
            destination,
            previous,
            _lock: lock,
        })
    }
}

fn move_aside(destination: &Path, parent: &Path) -> Result<TempPath> {
    let mut prefix = std::ffi::OsString::from(".");
    prefix.push(destination.file_name().unwrap_or_default());
    let previous = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".prev")
        .tempfile_in(parent)
        .map_err(|e| persistence_error(destination, "backup file creation", e))?
        .into_temp_path();
    fs::rename(destination, &previous)
        .map_err(|e| persistence_error(destination, "backup rename", e))?;
    Ok(previous)
}

fn restore(previous: TempPath, destination: &Path) {
    if let Err(e) = previous.persist(destination) {
        warn!(
            path = %destination.display(),
            backup = %e.path.display(),
            error = %e.error,
            "could not restore previous file"
        );
        let _ = e.path.keep();
    }
}

/// Undoes replacements in reverse order.
fn roll_back(replaced: Vec<Replaced>) {
    for done in replaced.into_iter().rev() {
        match done.previous {
            Some(previous) => restore(previous, &done.destination),
            None => {
                if let Err(e) = fs::remove_file(&done.destination) {
                    warn!(
                        path = %done.destination.display(),
                        error = %e,
                        "could not remove partially committed file"
                    );
                }
            }
        }
    }
}

fn shape_error(reason: String) -> FundusSegError {
    FundusSegError::Shape {
        subject: "dataset".to_string(),
        reason,
    }
}

fn format_error(path: &Path, reason: String) -> FundusSegError {
    FundusSegError::Format {
        path: path.to_path_buf(),
        reason,
    }
}

fn persistence_error(path: &Path, operation: &str, source: std::io::Error) -> FundusSegError {
    FundusSegError::Persistence {
        path: path.to_path_buf(),
        operation: operation.to_string(),
        source,
    }
}
