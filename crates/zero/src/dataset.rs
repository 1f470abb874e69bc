//! Rating datasets and their anonymized representation
//!
//! `AnonymizedData` is the only input algorithms see: rating events as
//! `(user_index, item_index)` rows, the rating vector, and optional labels and
//! item side information. `Dataset` owns the mapping between raw identifiers
//! and anonymized indices and handles CSV import/export.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

/// Works rated by fewer users are not considered "interesting"
pub const RATED_BY_AT_LEAST: usize = 2;

const SIGNATURE_LEN: usize = 16;

/// Immutable anonymized rating data
#[derive(Debug, Clone)]
pub struct AnonymizedData {
    x: Array2<usize>,
    y: Array1<f64>,
    y_text: Option<Vec<String>>,
    item_features: Option<Array2<f64>>,
    nb_users: usize,
    nb_works: usize,
}

/// Train/test row indices of one cross-validation pass
#[derive(Debug, Clone)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

impl AnonymizedData {
    /// Build from an `n x 2` index matrix and `n` ratings
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if the shapes disagree, `IndexOutOfRange` if an index
    /// falls outside `nb_users x nb_works`, `InvalidInput` for non-finite ratings.
    pub fn new(x: Array2<usize>, y: Array1<f64>, nb_users: usize, nb_works: usize) -> Result<Self> {
        if x.ncols() != 2 {
            return Err(Error::DimensionMismatch {
                expected: "2 columns (user_index, item_index)".to_string(),
                actual: format!("{} columns", x.ncols()),
            });
        }
        if x.nrows() != y.len() {
            return Err(Error::DimensionMismatch {
                expected: format!("{} ratings", x.nrows()),
                actual: format!("{} ratings", y.len()),
            });
        }
        for row in x.rows() {
            let (user, item) = (row[0], row[1]);
            if user >= nb_users || item >= nb_works {
                return Err(Error::IndexOutOfRange {
                    user,
                    item,
                    nb_users,
                    nb_works,
                });
            }
        }
        if let Some(bad) = y.iter().find(|r| !r.is_finite()) {
            return Err(Error::InvalidInput(format!("non-finite rating {}", bad)));
        }

        Ok(Self {
            x,
            y,
            y_text: None,
            item_features: None,
            nb_users,
            nb_works,
        })
    }

    /// Build from `(user_index, item_index, rating)` triplets
    pub fn from_triplets(
        triplets: &[(usize, usize, f64)],
        nb_users: usize,
        nb_works: usize,
    ) -> Result<Self> {
        let mut x = Array2::<usize>::zeros((triplets.len(), 2));
        let mut y = Array1::<f64>::zeros(triplets.len());
        for (k, &(user, item, rating)) in triplets.iter().enumerate() {
            x[[k, 0]] = user;
            x[[k, 1]] = item;
            y[k] = rating;
        }
        Self::new(x, y, nb_users, nb_works)
    }

    /// Attach the raw rating labels, one per event
    pub fn with_labels(mut self, labels: Vec<String>) -> Result<Self> {
        if labels.len() != self.len() {
            return Err(Error::DimensionMismatch {
                expected: format!("{} labels", self.len()),
                actual: format!("{} labels", labels.len()),
            });
        }
        self.y_text = Some(labels);
        Ok(self)
    }

    /// Attach item side information, one row per work
    pub fn with_item_features(mut self, features: Array2<f64>) -> Result<Self> {
        if features.nrows() != self.nb_works {
            return Err(Error::DimensionMismatch {
                expected: format!("{} feature rows", self.nb_works),
                actual: format!("{} feature rows", features.nrows()),
            });
        }
        self.item_features = Some(features);
        Ok(self)
    }

    pub fn x(&self) -> &Array2<usize> {
        &self.x
    }

    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    pub fn labels(&self) -> Option<&[String]> {
        self.y_text.as_deref()
    }

    pub fn item_features(&self) -> Option<&Array2<f64>> {
        self.item_features.as_ref()
    }

    pub fn nb_users(&self) -> usize {
        self.nb_users
    }

    pub fn nb_works(&self) -> usize {
        self.nb_works
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// `(user_index, item_index)` pairs in event order
    pub fn pairs(&self) -> Vec<(usize, usize)> {
        self.x.rows().into_iter().map(|r| (r[0], r[1])).collect()
    }

    /// `(user_index, item_index, rating)` in event order
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.x
            .rows()
            .into_iter()
            .zip(self.y.iter())
            .map(|(r, &rating)| (r[0], r[1], rating))
    }

    pub fn global_mean(&self) -> Option<f64> {
        zero_core::math::mean(self.y.as_slice()?)
    }

    /// Ratings grouped by user: `result[user] = [(item, rating), ...]`
    ///
    /// A later event for the same pair replaces the earlier one.
    pub fn by_user(&self) -> Vec<Vec<(usize, f64)>> {
        let mut grouped: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); self.nb_users];
        for (user, item, rating) in self.iter() {
            grouped[user].insert(item, rating);
        }
        grouped.into_iter().map(|m| m.into_iter().collect()).collect()
    }

    /// Ratings grouped by work: `result[item] = [(user, rating), ...]`
    pub fn by_work(&self) -> Vec<Vec<(usize, f64)>> {
        let mut grouped: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); self.nb_works];
        for (user, item, rating) in self.iter() {
            grouped[item].insert(user, rating);
        }
        grouped.into_iter().map(|m| m.into_iter().collect()).collect()
    }

    /// Dataset identity used to address snapshots
    ///
    /// Digest over the dimensions, the index pairs and the rating bits.
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.nb_users as u64).to_le_bytes());
        hasher.update((self.nb_works as u64).to_le_bytes());
        for (user, item, rating) in self.iter() {
            hasher.update((user as u64).to_le_bytes());
            hasher.update((item as u64).to_le_bytes());
            hasher.update(rating.to_bits().to_le_bytes());
        }
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(SIGNATURE_LEN);
        digest
    }

    /// Rows at `indices`, keeping the dimensions and side information
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        let mut x = Array2::<usize>::zeros((indices.len(), 2));
        let mut y = Array1::<f64>::zeros(indices.len());
        let mut labels = self.y_text.as_ref().map(|_| Vec::with_capacity(indices.len()));

        for (k, &idx) in indices.iter().enumerate() {
            if idx >= self.len() {
                return Err(Error::InvalidInput(format!(
                    "row {} out of range for {} events",
                    idx,
                    self.len()
                )));
            }
            x[[k, 0]] = self.x[[idx, 0]];
            x[[k, 1]] = self.x[[idx, 1]];
            y[k] = self.y[idx];
            if let (Some(out), Some(src)) = (labels.as_mut(), self.y_text.as_ref()) {
                out.push(src[idx].clone());
            }
        }

        Ok(Self {
            x,
            y,
            y_text: labels,
            item_features: self.item_features.clone(),
            nb_users: self.nb_users,
            nb_works: self.nb_works,
        })
    }

    /// Independent random train/test partitions
    ///
    /// Each split draws a fresh permutation; the first `ceil(test_fraction * n)`
    /// rows become the test part.
    pub fn shuffle_split(&self, nb_splits: usize, test_fraction: f64, seed: u64) -> Result<Vec<Split>> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(Error::InvalidInput(format!(
                "test_fraction must be in (0, 1), got {}",
                test_fraction
            )));
        }
        let n = self.len();
        let nb_test = (test_fraction * n as f64).ceil() as usize;
        if nb_test == 0 || nb_test >= n {
            return Err(Error::InvalidInput(format!(
                "cannot split {} events with test_fraction {}",
                n, test_fraction
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut splits = Vec::with_capacity(nb_splits);
        for _ in 0..nb_splits {
            let mut permutation: Vec<usize> = (0..n).collect();
            permutation.shuffle(&mut rng);
            let train = permutation.split_off(nb_test);
            splits.push(Split {
                train,
                test: permutation,
            });
        }
        Ok(splits)
    }
}

/// Title and optional category of a work
#[derive(Debug, Clone, PartialEq)]
pub struct WorkInfo {
    pub title: String,
    pub category: Option<String>,
}

/// A rating dataset with its anonymization maps
#[derive(Debug, Clone)]
pub struct Dataset {
    anonymized: Option<AnonymizedData>,
    encode_user: HashMap<String, usize>,
    decode_user: HashMap<usize, String>,
    encode_work: HashMap<String, usize>,
    decode_work: HashMap<usize, String>,
    interesting_works: HashSet<String>,
    works: BTreeMap<String, WorkInfo>,
    created_at: DateTime<Utc>,
}

impl Default for Dataset {
    fn default() -> Self {
        Self::new()
    }
}

impl Dataset {
    pub fn new() -> Self {
        Self {
            anonymized: None,
            encode_user: HashMap::new(),
            decode_user: HashMap::new(),
            encode_work: HashMap::new(),
            decode_work: HashMap::new(),
            interesting_works: HashSet::new(),
            works: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn anonymized(&self) -> Option<&AnonymizedData> {
        self.anonymized.as_ref()
    }

    pub fn into_anonymized(self) -> Option<AnonymizedData> {
        self.anonymized
    }

    pub fn interesting_works(&self) -> &HashSet<String> {
        &self.interesting_works
    }

    pub fn works(&self) -> &BTreeMap<String, WorkInfo> {
        &self.works
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Load an already anonymized CSV with `user`, `item` and `rating` columns
    ///
    /// `nb_users` and `nb_works` are one past the largest index seen.
    pub fn load_csv(&mut self, path: impl AsRef<Path>) -> Result<&AnonymizedData> {
        self.load_csv_with(path, |raw| raw.trim().parse::<f64>().ok())
    }

    /// Same as [`Dataset::load_csv`] with a custom rating conversion
    ///
    /// # Errors
    ///
    /// `MalformedDataset` for a missing column, a non-integer index, a rating
    /// `convert` rejects, or an empty file.
    pub fn load_csv_with<F>(&mut self, path: impl AsRef<Path>, convert: F) -> Result<&AnonymizedData>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
        let headers = reader.headers().map_err(csv_error)?.clone();

        let column = |name: &str| -> Result<usize> {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| {
                    Error::malformed(
                        1,
                        format!(
                            "missing required column '{}' (found: {})",
                            name,
                            headers.iter().collect::<Vec<_>>().join(", ")
                        ),
                    )
                })
        };
        let user_col = column("user")?;
        let item_col = column("item")?;
        let rating_col = column("rating")?;

        let mut triplets = Vec::new();
        let mut labels = Vec::new();
        for (k, record) in reader.records().enumerate() {
            let record = record.map_err(csv_error)?;
            let line = record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or(k + 2);

            let user = parse_index(field(&record, user_col, "user", line)?, "user", line)?;
            let item = parse_index(field(&record, item_col, "item", line)?, "item", line)?;
            let raw_rating = field(&record, rating_col, "rating", line)?;
            let rating = convert(raw_rating)
                .filter(|r| r.is_finite())
                .ok_or_else(|| {
                    Error::malformed(line, format!("invalid rating '{}'", raw_rating))
                })?;

            triplets.push((user, item, rating));
            labels.push(raw_rating.trim().to_string());
        }

        if triplets.is_empty() {
            return Err(Error::malformed(1, "dataset contains no ratings"));
        }

        let nb_users = triplets.iter().map(|t| t.0).max().unwrap_or(0) + 1;
        let nb_works = triplets.iter().map(|t| t.1).max().unwrap_or(0) + 1;
        let data = AnonymizedData::from_triplets(&triplets, nb_users, nb_works)?.with_labels(labels)?;

        tracing::info!(
            path = %path.display(),
            nb_ratings = data.len(),
            nb_users,
            nb_works,
            "Loaded rating dataset"
        );

        Ok(self.anonymized.insert(data))
    }

    /// Load `work_id,title[,category]` rows (no header)
    pub fn load_titles(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path.as_ref())
            .map_err(csv_error)?;

        for (k, record) in reader.records().enumerate() {
            let record = record.map_err(csv_error)?;
            let (Some(work_id), Some(title)) = (record.get(0), record.get(1)) else {
                return Err(Error::malformed(k + 1, "expected work_id,title[,category]"));
            };
            self.works.insert(
                work_id.to_string(),
                WorkInfo {
                    title: title.to_string(),
                    category: record.get(2).map(str::to_string),
                },
            );
        }
        Ok(self.works.len())
    }

    /// Load item side information from a CSV with an `item` column followed by
    /// numeric feature columns, and attach it to the anonymized data
    ///
    /// Works without a row get an all-zero feature vector.
    pub fn load_item_features(&mut self, path: impl AsRef<Path>) -> Result<&AnonymizedData> {
        let data = self
            .anonymized
            .take()
            .ok_or_else(|| Error::InvalidInput("load ratings before item features".to_string()))?;

        match read_item_features(path.as_ref(), data.nb_works()) {
            Ok(features) => {
                let data = data.with_item_features(features)?;
                Ok(self.anonymized.insert(data))
            }
            Err(e) => {
                self.anonymized = Some(data);
                Err(e)
            }
        }
    }

    /// Anonymize raw `(user_id, work_id, rating_label)` triplets
    ///
    /// Events are shuffled and users receive random indices. Works receive
    /// random indices as well, unless `ordered` is set, in which case the most
    /// rated work gets index 0. All randomness comes from `seed`.
    pub fn make_anonymous_data<F>(
        &mut self,
        triplets: Vec<(String, String, String)>,
        convert: F,
        ordered: bool,
        seed: u64,
    ) -> Result<&AnonymizedData>
    where
        F: Fn(&str) -> Option<f64>,
    {
        if triplets.is_empty() {
            return Err(Error::EmptyInput("no ratings to anonymize".to_string()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut users = BTreeSet::new();
        let mut works = BTreeSet::new();
        let mut nb_ratings: HashMap<String, usize> = HashMap::new();
        for (user_id, work_id, _) in &triplets {
            users.insert(user_id.clone());
            works.insert(work_id.clone());
            *nb_ratings.entry(work_id.clone()).or_default() += 1;
        }

        let mut triplets = triplets;
        triplets.shuffle(&mut rng);

        let mut anonymous_u: Vec<usize> = (0..users.len()).collect();
        anonymous_u.shuffle(&mut rng);
        let mut anonymous_w: Vec<usize> = (0..works.len()).collect();
        let mut works: Vec<String> = works.into_iter().collect();
        if ordered {
            works.sort_by(|a, b| nb_ratings[b].cmp(&nb_ratings[a]).then_with(|| a.cmp(b)));
        } else {
            anonymous_w.shuffle(&mut rng);
        }

        self.encode_user = users.iter().cloned().zip(anonymous_u.iter().copied()).collect();
        self.decode_user = anonymous_u.iter().copied().zip(users.iter().cloned()).collect();
        self.encode_work = works.iter().cloned().zip(anonymous_w.iter().copied()).collect();
        self.decode_work = anonymous_w.iter().copied().zip(works.iter().cloned()).collect();
        self.interesting_works = nb_ratings
            .iter()
            .filter(|(_, &count)| count >= RATED_BY_AT_LEAST)
            .map(|(work_id, _)| work_id.clone())
            .collect();

        let mut encoded = Vec::with_capacity(triplets.len());
        let mut labels = Vec::with_capacity(triplets.len());
        for (k, (user_id, work_id, label)) in triplets.iter().enumerate() {
            let rating = convert(label)
                .filter(|r| r.is_finite())
                .ok_or_else(|| Error::malformed(k + 1, format!("invalid rating '{}'", label)))?;
            encoded.push((self.encode_user[user_id], self.encode_work[work_id], rating));
            labels.push(label.clone());
        }

        let data = AnonymizedData::from_triplets(&encoded, users.len(), works.len())?
            .with_labels(labels)?;

        tracing::info!(
            nb_ratings = data.len(),
            nb_users = data.nb_users(),
            nb_works = data.nb_works(),
            nb_interesting = self.interesting_works.len(),
            "Anonymized rating dataset"
        );

        Ok(self.anonymized.insert(data))
    }

    /// Write `ratings{suffix}.csv` and, when titles are known,
    /// `works{suffix}.csv` into `folder`
    ///
    /// Refuses to replace existing files unless `overwrite` is set.
    pub fn save_csv(&self, folder: impl AsRef<Path>, suffix: &str, overwrite: bool) -> Result<()> {
        let data = self
            .anonymized
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("no anonymized data to save".to_string()))?;
        let folder = folder.as_ref();
        let ratings_path = folder.join(format!("ratings{}.csv", suffix));
        let works_path = folder.join(format!("works{}.csv", suffix));

        if !overwrite && (ratings_path.exists() || works_path.exists()) {
            return Err(Error::InvalidInput(format!(
                "{} or {} already exists",
                ratings_path.display(),
                works_path.display()
            )));
        }

        let mut writer = csv::Writer::from_path(&ratings_path).map_err(csv_error)?;
        writer
            .write_record(["user", "item", "rating"])
            .map_err(csv_error)?;
        for (k, (user, item, rating)) in data.iter().enumerate() {
            let label = match data.labels() {
                Some(labels) => labels[k].clone(),
                None => rating.to_string(),
            };
            writer
                .write_record([user.to_string(), item.to_string(), label])
                .map_err(csv_error)?;
        }
        writer.flush()?;

        if !self.works.is_empty() {
            let mut lines: Vec<(usize, &WorkInfo)> = self
                .works
                .iter()
                .filter_map(|(work_id, info)| self.encode_work.get(work_id).map(|&w| (w, info)))
                .collect();
            lines.sort_by_key(|(w, _)| *w);

            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_path(&works_path)
                .map_err(csv_error)?;
            for (encoded, info) in lines {
                let mut row = vec![encoded.to_string(), info.title.clone()];
                if let Some(category) = &info.category {
                    row.push(category.clone());
                }
                writer.write_record(&row).map_err(csv_error)?;
            }
            writer.flush()?;
        }

        Ok(())
    }

    /// Raw user identifiers of anonymized user indices
    pub fn decode_users(&self, encoded_user_ids: &[usize]) -> Result<Vec<String>> {
        encoded_user_ids
            .iter()
            .map(|id| {
                self.decode_user
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::InvalidInput(format!("unknown user index {}", id)))
            })
            .collect()
    }

    /// Anonymized indices of raw work identifiers; unknown works are skipped
    pub fn encode_works(&self, work_ids: &[String]) -> Vec<usize> {
        work_ids
            .iter()
            .filter_map(|id| self.encode_work.get(id).copied())
            .collect()
    }

    pub fn decode_work(&self, encoded_work_id: usize) -> Option<&str> {
        self.decode_work.get(&encoded_work_id).map(String::as_str)
    }
}

fn field<'a>(record: &'a csv::StringRecord, col: usize, name: &str, line: usize) -> Result<&'a str> {
    record
        .get(col)
        .ok_or_else(|| Error::malformed(line, format!("missing '{}' field", name)))
}

fn parse_index(raw: &str, name: &str, line: usize) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|_| Error::malformed(line, format!("{} '{}' is not a non-negative integer", name, raw)))
}

fn read_item_features(path: &Path, nb_works: usize) -> Result<Array2<f64>> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
    let headers = reader.headers().map_err(csv_error)?.clone();
    if headers.get(0).map(str::trim) != Some("item") {
        return Err(Error::malformed(1, "first column must be 'item'"));
    }
    let nb_tags = headers.len() - 1;
    let mut features = Array2::<f64>::zeros((nb_works, nb_tags));

    for (k, record) in reader.records().enumerate() {
        let record = record.map_err(csv_error)?;
        let line = record.position().map(|p| p.line() as usize).unwrap_or(k + 2);
        let item = parse_index(record.get(0).unwrap_or_default(), "item", line)?;
        if item >= nb_works {
            return Err(Error::malformed(
                line,
                format!("item {} outside {} works", item, nb_works),
            ));
        }
        for tag in 0..nb_tags {
            let raw = record.get(tag + 1).unwrap_or_default();
            features[[item, tag]] = raw
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::malformed(line, format!("invalid feature value '{}'", raw)))?;
        }
    }
    Ok(features)
}

fn csv_error(e: csv::Error) -> Error {
    let line = e
        .position()
        .map(|p| p.line() as usize)
        .unwrap_or(0);
    match e.into_kind() {
        csv::ErrorKind::Io(io) => Error::Io(io),
        other => Error::malformed(line, format!("{:?}", other)),
    }
}
