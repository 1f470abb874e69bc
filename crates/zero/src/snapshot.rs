//! Versioned snapshot files for fitted algorithms
//!
//! Layout: a bincode-encoded [`SnapshotHeader`] (starting with the `ZSNP`
//! magic) followed by a bincode-encoded [`ModelState`]. Matrices are stored as
//! shape plus flat row-major data and rebuilt into ndarray on load.
//!
//! [`SnapshotStore`] addresses snapshots by algorithm shortname, dataset
//! signature and hyperparameter signature:
//! `root/<shortname>/<dataset_signature>-<hyperparameter_signature>.snapshot`.

use crate::algorithm::RecommendationAlgorithm;
use crate::algorithms::als::AlsState;
use crate::algorithms::gbr::GbrState;
use crate::algorithms::knn::KnnState;
use crate::algorithms::lasso::LassoState;
use crate::algorithms::nmf::NmfState;
use crate::algorithms::sgd::SgdState;
use crate::algorithms::svd::SvdState;
use crate::algorithms::svdknn::SvdKnnState;
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::Hyperparameters;
use bincode::Options;
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use zero_core::observability::snapshot_span;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"ZSNP";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;
pub const SNAPSHOT_EXTENSION: &str = "snapshot";

/// Self-describing part of a snapshot, validated before any state is restored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: [u8; 4],
    pub format_version: u32,
    pub algorithm: String,
    pub shortname: String,
    pub nb_users: usize,
    pub nb_works: usize,
    pub nb_components: Option<usize>,
    pub dataset_signature: Option<String>,
    /// Canonical JSON of the hyperparameters
    pub hyperparameters: String,
    pub created_at: DateTime<Utc>,
}

impl SnapshotHeader {
    fn describe<A: RecommendationAlgorithm + ?Sized>(
        algorithm: &A,
        dataset_signature: Option<String>,
    ) -> Result<Self> {
        let (nb_users, nb_works) = algorithm
            .dimensions()
            .ok_or_else(|| Error::NotFitted(algorithm.shortname()))?;
        let hyperparameters = serde_json::to_string(&algorithm.hyperparameters())
            .map_err(|e| Error::InvalidInput(format!("unencodable hyperparameters: {}", e)))?;

        Ok(Self {
            magic: SNAPSHOT_MAGIC,
            format_version: SNAPSHOT_FORMAT_VERSION,
            algorithm: algorithm.name().to_string(),
            shortname: algorithm.shortname(),
            nb_users,
            nb_works,
            nb_components: algorithm.nb_components(),
            dataset_signature,
            hyperparameters,
            created_at: Utc::now(),
        })
    }

    /// Fail with `IncompatibleSnapshot` when the stored state does not have
    /// the shape the header announces
    pub fn check_state(&self, state: &ModelState) -> Result<()> {
        let (nb_users, nb_works) = state.dimensions();
        if (nb_users, nb_works) != (self.nb_users, self.nb_works) {
            return Err(Error::IncompatibleSnapshot(format!(
                "header of {} announces {}x{}, stored state is {}x{}",
                self.shortname, self.nb_users, self.nb_works, nb_users, nb_works
            )));
        }
        Ok(())
    }

    pub fn hyperparameters(&self) -> Result<Hyperparameters> {
        serde_json::from_str(&self.hyperparameters)
            .map_err(|e| Error::IncompatibleSnapshot(format!("unreadable hyperparameters: {}", e)))
    }

    /// Whether the stored state can be restored into `algorithm`
    ///
    /// The kind and component count must match; an instance that already
    /// holds state must have the same dimensions.
    pub fn check_compatible<A: RecommendationAlgorithm + ?Sized>(&self, algorithm: &A) -> Result<()> {
        if self.algorithm != algorithm.name() {
            return Err(Error::IncompatibleSnapshot(format!(
                "snapshot holds a {} model, not {}",
                self.algorithm,
                algorithm.name()
            )));
        }
        if self.nb_components != algorithm.nb_components() {
            return Err(Error::IncompatibleSnapshot(format!(
                "snapshot {} has {:?} components, instance has {:?}",
                self.shortname,
                self.nb_components,
                algorithm.nb_components()
            )));
        }
        if let Some((nb_users, nb_works)) = algorithm.dimensions() {
            if (nb_users, nb_works) != (self.nb_users, self.nb_works) {
                return Err(Error::IncompatibleSnapshot(format!(
                    "snapshot is {}x{}, fitted instance is {}x{}",
                    self.nb_users, self.nb_works, nb_users, nb_works
                )));
            }
        }
        Ok(())
    }
}

/// Dense matrix in a serialization-friendly form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMatrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl StoredMatrix {
    pub fn from_array(array: &Array2<f64>) -> Self {
        let (rows, cols) = array.dim();
        Self {
            rows,
            cols,
            data: array.iter().copied().collect(),
        }
    }

    pub fn into_array(self) -> Result<Array2<f64>> {
        let (rows, cols) = (self.rows, self.cols);
        Array2::from_shape_vec((rows, cols), self.data).map_err(|e| {
            Error::IncompatibleSnapshot(format!("stored {}x{} matrix: {}", rows, cols, e))
        })
    }

    /// Rebuild and require a specific shape
    pub fn into_array_shaped(self, rows: usize, cols: usize) -> Result<Array2<f64>> {
        if (self.rows, self.cols) != (rows, cols) {
            return Err(Error::IncompatibleSnapshot(format!(
                "expected a {}x{} matrix, found {}x{}",
                rows, cols, self.rows, self.cols
            )));
        }
        self.into_array()
    }
}

/// Rebuild a vector and require its length
pub(crate) fn stored_vector(values: Vec<f64>, len: usize) -> Result<Array1<f64>> {
    if values.len() != len {
        return Err(Error::IncompatibleSnapshot(format!(
            "expected a vector of length {}, found {}",
            len,
            values.len()
        )));
    }
    Ok(Array1::from(values))
}

/// Persisted state of one concrete algorithm kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModelState {
    Als(AlsState),
    Svd(SvdState),
    Sgd(SgdState),
    Knn(KnnState),
    Nmf(NmfState),
    Lasso(LassoState),
    Gbr(GbrState),
    SvdKnn(SvdKnnState),
}

impl ModelState {
    /// `(nb_users, nb_works)` implied by the stored matrices and vectors
    pub fn dimensions(&self) -> (usize, usize) {
        match self {
            ModelState::Als(s) => (s.user_factors.rows, s.item_factors.rows),
            ModelState::Svd(s) => (s.nb_users, s.nb_works),
            ModelState::Sgd(s) => (s.user_bias.len(), s.item_bias.len()),
            ModelState::Knn(s) => (s.ratings.len(), s.nb_works),
            ModelState::Nmf(s) => (s.user_factors.rows, s.item_factors.rows),
            ModelState::Lasso(s) => (s.intercepts.len(), s.item_features.rows),
            ModelState::Gbr(s) => (s.user_means.len(), s.work_means.len()),
            ModelState::SvdKnn(s) => (s.user_embeddings.rows, s.vt.cols),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModelState::Als(_) => "als",
            ModelState::Svd(_) => "svd",
            ModelState::Sgd(_) => "sgd",
            ModelState::Knn(_) => "knn",
            ModelState::Nmf(_) => "nmf",
            ModelState::Lasso(_) => "lasso",
            ModelState::Gbr(_) => "gbr",
            ModelState::SvdKnn(_) => "svdknn",
        }
    }
}

pub(crate) fn wrong_state(expected: &str, found: &ModelState) -> Error {
    Error::IncompatibleSnapshot(format!(
        "expected {} state, found {} state",
        expected,
        found.kind()
    ))
}

fn encode_error(e: bincode::Error) -> Error {
    match *e {
        bincode::ErrorKind::Io(io) => Error::Io(io),
        other => Error::InvalidInput(format!("snapshot encoding failed: {}", other)),
    }
}

/// Write a snapshot of the fitted `algorithm` to `path`
///
/// The file is written next to its destination and renamed into place, so a
/// failed write never leaves a truncated snapshot behind.
pub fn write_snapshot<A: RecommendationAlgorithm + ?Sized>(
    path: &Path,
    algorithm: &A,
    dataset_signature: Option<String>,
) -> Result<()> {
    let span = snapshot_span("write", &path.display().to_string());
    let _guard = span.enter();
    let start = Instant::now();

    let header = SnapshotHeader::describe(algorithm, dataset_signature)?;
    let state = algorithm.export_state()?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("not a file path: {}", path.display())))?;
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let written = write_parts(&temp_path, &header, &state).and_then(|bytes| {
        fs::rename(&temp_path, path)?;
        Ok(bytes)
    });
    let bytes = match written {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
    };

    debug!(
        algorithm = %header.shortname,
        bytes = bytes,
        elapsed_us = start.elapsed().as_micros() as u64,
        "Snapshot written"
    );
    Ok(())
}

fn write_parts(path: &Path, header: &SnapshotHeader, state: &ModelState) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut writer, header).map_err(encode_error)?;
    bincode::serialize_into(&mut writer, state).map_err(encode_error)?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Same encoding as `bincode::serialize_into`, refusing to read more than
/// `limit` bytes so a corrupt length prefix cannot trigger a huge allocation
fn decoder(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(limit)
}

/// Read and validate a snapshot file
///
/// # Errors
///
/// `SnapshotNotFound` if the file is missing, `CorruptSnapshot` for a wrong
/// magic, an unsupported format version or an undecodable body.
pub fn read_snapshot(path: &Path) -> Result<(SnapshotHeader, ModelState)> {
    let span = snapshot_span("read", &path.display().to_string());
    let _guard = span.enter();
    let start = Instant::now();

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::SnapshotNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(Error::Io(e)),
    };
    if !bytes.starts_with(&SNAPSHOT_MAGIC) {
        return Err(Error::corrupt(path, "bad magic"));
    }

    let limit = bytes.len() as u64;
    let mut cursor = Cursor::new(bytes.as_slice());
    let header: SnapshotHeader = decoder(limit)
        .deserialize_from(&mut cursor)
        .map_err(|e| Error::corrupt(path, format!("undecodable header: {}", e)))?;
    if header.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(Error::corrupt(
            path,
            format!("unsupported format version {}", header.format_version),
        ));
    }
    let state: ModelState = decoder(limit)
        .deserialize_from(&mut cursor)
        .map_err(|e| Error::corrupt(path, format!("undecodable state: {}", e)))?;

    debug!(
        algorithm = %header.shortname,
        bytes = bytes.len() as u64,
        elapsed_us = start.elapsed().as_micros() as u64,
        "Snapshot read"
    );
    Ok((header, state))
}

/// Directory of snapshots keyed by algorithm, dataset and hyperparameters
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &zero_core::ZeroConfig) -> Self {
        Self::new(config.snapshot_dir.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_path<A: RecommendationAlgorithm + ?Sized>(
        &self,
        algorithm: &A,
        dataset_signature: &str,
    ) -> PathBuf {
        self.root.join(algorithm.shortname()).join(format!(
            "{}-{}.{}",
            dataset_signature,
            algorithm.hyperparameters().signature(),
            SNAPSHOT_EXTENSION
        ))
    }

    /// Snapshot `algorithm`, fitted on `data`; returns the file written
    pub fn save_snapshot<A: RecommendationAlgorithm + ?Sized>(
        &self,
        algorithm: &A,
        data: &AnonymizedData,
    ) -> Result<PathBuf> {
        if !algorithm.is_serializable() {
            return Err(Error::NotSerializable(algorithm.shortname()));
        }
        let signature = data.signature();
        let path = self.backup_path(algorithm, &signature);
        write_snapshot(&path, algorithm, Some(signature))?;
        info!(algorithm = %algorithm.shortname(), path = %path.display(), "Snapshot saved");
        Ok(path)
    }

    /// Restore the snapshot of `algorithm` for `data`
    ///
    /// # Errors
    ///
    /// `IncompatibleSnapshot` when the stored dataset signature is not the one
    /// of `data`, plus everything [`read_snapshot`] can return.
    pub fn load_snapshot<A: RecommendationAlgorithm + ?Sized>(
        &self,
        algorithm: &mut A,
        data: &AnonymizedData,
    ) -> Result<PathBuf> {
        if !algorithm.is_serializable() {
            return Err(Error::NotSerializable(algorithm.shortname()));
        }
        let signature = data.signature();
        let path = self.backup_path(&*algorithm, &signature);
        let (header, state) = read_snapshot(&path)?;
        if header.dataset_signature.as_deref() != Some(signature.as_str()) {
            return Err(Error::IncompatibleSnapshot(format!(
                "snapshot was taken on dataset {:?}, not {}",
                header.dataset_signature, signature
            )));
        }
        header.check_compatible(&*algorithm)?;
        header.check_state(&state)?;
        algorithm.restore_state(state)?;
        info!(algorithm = %header.shortname, path = %path.display(), "Snapshot loaded");
        Ok(path)
    }

    pub fn has_snapshot<A: RecommendationAlgorithm + ?Sized>(
        &self,
        algorithm: &A,
        data: &AnonymizedData,
    ) -> bool {
        self.backup_path(algorithm, &data.signature()).is_file()
    }

    pub fn delete_snapshot<A: RecommendationAlgorithm + ?Sized>(
        &self,
        algorithm: &A,
        data: &AnonymizedData,
    ) -> Result<()> {
        let path = self.backup_path(algorithm, &data.signature());
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Snapshot deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::SnapshotNotFound(path)),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::als::Als;
    use crate::algorithms::zero::Zero;
    use tempfile::TempDir;

    fn ratings() -> AnonymizedData {
        AnonymizedData::from_triplets(
            &[
                (0, 0, 5.0),
                (0, 1, 3.0),
                (1, 1, 4.0),
                (1, 2, 1.0),
                (2, 0, 4.0),
                (2, 2, 2.0),
                (3, 1, 5.0),
                (3, 3, 3.0),
            ],
            4,
            4,
        )
        .unwrap()
    }

    fn fitted_als() -> Als {
        let params = Hyperparameters::new()
            .with("nb_components", 2usize)
            .with("nb_iterations", 5usize);
        let mut als = Als::from_hyperparameters(&params).unwrap();
        als.fit(&ratings()).unwrap();
        als
    }

    #[test]
    fn test_stored_matrix_shape_checked() {
        let matrix = StoredMatrix {
            rows: 2,
            cols: 2,
            data: vec![1.0, 2.0, 3.0],
        };
        assert!(matches!(
            matrix.into_array(),
            Err(Error::IncompatibleSnapshot(_))
        ));

        let array = ndarray::array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let stored = StoredMatrix::from_array(&array);
        assert_eq!(stored.clone().into_array().unwrap(), array);
        assert!(stored.into_array_shaped(3, 2).is_err());
    }

    #[test]
    fn test_file_starts_with_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("als.snapshot");
        fitted_als().save(&path).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"ZSNP");
        assert!(!dir.path().join(".als.snapshot.tmp").exists());
    }

    #[test]
    fn test_oversized_length_prefix_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.snapshot");
        let mut bytes = SNAPSHOT_MAGIC.to_vec();
        bytes.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
        // Algorithm name claiming 2^46 bytes
        bytes.extend_from_slice(&(1u64 << 46).to_le_bytes());
        bytes.extend_from_slice(b"als");
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            read_snapshot(&path),
            Err(Error::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn test_oversized_state_vector_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("als.snapshot");
        let als = fitted_als();
        let header = SnapshotHeader::describe(&als, None).unwrap();
        let mut bytes = bincode::serialize(&header).unwrap();
        // ModelState::Als, then a user factor matrix of 1x1 with 2^40 values
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&(1u64 << 40).to_le_bytes());
        bytes.extend_from_slice(&1.0f64.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            read_snapshot(&path),
            Err(Error::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn test_header_disagreeing_with_state_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("als.snapshot");
        fitted_als().save(&path).unwrap();

        let (mut header, state) = read_snapshot(&path).unwrap();
        assert_eq!(state.dimensions(), (4, 4));
        header.nb_users = 5;
        write_parts(&path, &header, &state).unwrap();

        let mut restored = Als::from_hyperparameters(
            &Hyperparameters::new()
                .with("nb_components", 2usize)
                .with("nb_iterations", 5usize),
        )
        .unwrap();
        assert!(matches!(
            restored.load(&path),
            Err(Error::IncompatibleSnapshot(_))
        ));
        assert!(restored.dimensions().is_none());
    }

    #[test]
    fn test_header_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("als.snapshot");
        let als = fitted_als();
        write_snapshot(&path, &als, Some("abc".to_string())).unwrap();

        let (header, state) = read_snapshot(&path).unwrap();
        assert_eq!(header.algorithm, "als");
        assert_eq!(header.shortname, "als-2");
        assert_eq!((header.nb_users, header.nb_works), (4, 4));
        assert_eq!(header.nb_components, Some(2));
        assert_eq!(header.dataset_signature.as_deref(), Some("abc"));
        assert_eq!(header.hyperparameters().unwrap(), als.hyperparameters());
        assert_eq!(state.kind(), "als");
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.snapshot");
        assert!(matches!(
            read_snapshot(&path),
            Err(Error::SnapshotNotFound(p)) if p == path
        ));
    }

    #[test]
    fn test_bad_magic_and_garbage_body() {
        let dir = TempDir::new().unwrap();

        let wrong_magic = dir.path().join("wrong.snapshot");
        fs::write(&wrong_magic, b"NOPE-not-a-snapshot").unwrap();
        assert!(matches!(
            read_snapshot(&wrong_magic),
            Err(Error::CorruptSnapshot { .. })
        ));

        let truncated = dir.path().join("truncated.snapshot");
        fs::write(&truncated, b"ZSNP\x01").unwrap();
        assert!(matches!(
            read_snapshot(&truncated),
            Err(Error::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v2.snapshot");
        let als = fitted_als();
        let mut header = SnapshotHeader::describe(&als, None).unwrap();
        header.format_version = 2;
        write_parts(&path, &header, &als.export_state().unwrap()).unwrap();

        match read_snapshot(&path) {
            Err(Error::CorruptSnapshot { reason, .. }) => assert!(reason.contains("version")),
            other => panic!("expected a corrupt snapshot, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let data = ratings();
        let als = fitted_als();

        assert!(!store.has_snapshot(&als, &data));
        let path = store.save_snapshot(&als, &data).unwrap();
        assert!(store.has_snapshot(&als, &data));
        assert!(path.starts_with(dir.path().join("als-2")));
        assert_eq!(path.extension().unwrap(), "snapshot");

        let params = als.hyperparameters();
        let mut restored = Als::from_hyperparameters(&params).unwrap();
        store.load_snapshot(&mut restored, &data).unwrap();

        let pairs = data.pairs();
        assert_eq!(als.predict(&pairs).unwrap(), restored.predict(&pairs).unwrap());

        store.delete_snapshot(&als, &data).unwrap();
        assert!(!store.has_snapshot(&als, &data));
        assert!(matches!(
            store.delete_snapshot(&als, &data),
            Err(Error::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_store_rejects_other_dataset() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let data = ratings();
        let als = fitted_als();
        let path = store.save_snapshot(&als, &data).unwrap();

        // Same file name, different dataset recorded inside.
        write_snapshot(&path, &als, Some("another-dataset".to_string())).unwrap();
        let mut restored = Als::from_hyperparameters(&als.hyperparameters()).unwrap();
        assert!(matches!(
            store.load_snapshot(&mut restored, &data),
            Err(Error::IncompatibleSnapshot(_))
        ));
        assert!(restored.dimensions().is_none());
    }

    #[test]
    fn test_store_refuses_non_serializable() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let data = ratings();
        let mut zero = Zero::new();
        zero.fit(&data).unwrap();

        assert!(matches!(
            store.save_snapshot(&zero, &data),
            Err(Error::NotSerializable(_))
        ));
    }
}
