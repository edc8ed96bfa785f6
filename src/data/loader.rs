use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpyError, ReadNpzError};
use serde_json::Value as JsonValue;
use serde_pickle::{DeOptions, HashableValue, Value as PickleValue};

use super::model::{ArrayMap, RawDataset, IMAGE_KEYS, INTEGER_KEYS};

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Decode every array in a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.npz`            – NumPy archive, one array per key (recommended)
/// * `.json`           – `{ "key": [[...], ...], ... }`, `null` for NaN
/// * `.pickle` / `.pkl` – a pickled dict of NumPy arrays or nested lists,
///                        `None` for NaN
pub fn load_file(path: &Path) -> Result<ArrayMap> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "npz" => load_npz(path),
        "json" => load_json(path),
        "pickle" | "pkl" => load_pickle(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
}

/// Load a full recording. When `image_path` is given the stimulus images
/// are taken from that file instead of the main one.
pub fn load_dataset(path: &Path, image_path: Option<&Path>) -> Result<RawDataset> {
    let mut arrays =
        load_file(path).with_context(|| format!("loading dataset {}", path.display()))?;

    if let Some(image_path) = image_path {
        let mut images = load_file(image_path)
            .with_context(|| format!("loading images {}", image_path.display()))?;
        for key in IMAGE_KEYS {
            let array = images
                .remove(key)
                .with_context(|| format!("{} has no '{key}'", image_path.display()))?;
            arrays.insert(key.to_string(), array);
        }
    }

    let raw = RawDataset::from_arrays(arrays)
        .with_context(|| format!("invalid dataset layout in {}", path.display()))?;
    log::info!(
        "Loaded {} train / {} test images, {} neurons x {} time bins from {}",
        raw.num_train_images(),
        raw.num_test_images(),
        raw.num_neurons(),
        raw.num_time_bins(),
        path.display()
    );
    Ok(raw)
}

/// Write a recording in the `.npz` layout read by [`load_file`].
pub fn save_npz(raw: &RawDataset, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut npz = NpzWriter::new_compressed(file);

    npz.add_array(super::model::SUBJECT_IDS, &raw.subject_ids)?;
    npz.add_array(super::model::SESSION_IDS, &raw.session_ids)?;
    npz.add_array(
        super::model::SESSION_UNIT_RESPONSE_LINK,
        &raw.session_unit_response_link,
    )?;
    npz.add_array(super::model::REPETITIONS_TEST, &raw.repetitions_test)?;
    npz.add_array(super::model::RESPONSES_TRAIN, &raw.responses_train)?;
    npz.add_array(super::model::RESPONSES_TEST, &raw.responses_test)?;
    npz.add_array(super::model::IMAGES_TRAIN, &raw.images_train)?;
    npz.add_array(super::model::IMAGES_TEST, &raw.images_test)?;
    npz.finish().context("finalizing npz archive")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// NPZ loader
// ---------------------------------------------------------------------------

/// Arrays written by `np.savez(path, **record)`. Element types are widened
/// to `f64`; float32/float64 keep NaN markers.
fn load_npz(path: &Path) -> Result<ArrayMap> {
    let file = File::open(path).context("opening npz file")?;
    let mut npz = NpzReader::new(file).context("reading npz archive")?;

    let names = npz.names().context("listing npz entries")?;
    let mut arrays = ArrayMap::new();
    for name in names {
        let array = read_npz_widened(&mut npz, &name)
            .with_context(|| format!("reading npz entry '{name}'"))?;
        let key = name.strip_suffix(".npy").unwrap_or(&name).to_string();
        arrays.insert(key, array);
    }
    Ok(arrays)
}

/// Try the dtypes a recording is stored with, widest first.  Only a
/// descriptor mismatch moves on to the next dtype; any other failure is a
/// broken entry and is reported as such.
fn read_npz_widened(npz: &mut NpzReader<File>, name: &str) -> Result<ArrayD<f64>> {
    macro_rules! try_dtype {
        ($t:ty, $widen:expr) => {
            match npz.by_name::<ndarray::OwnedRepr<$t>, IxDyn>(name) {
                Ok(a) => return Ok(a.mapv($widen)),
                Err(ReadNpzError::Npy(ReadNpyError::WrongDescriptor(_))) => {}
                Err(e) => return Err(e.into()),
            }
        };
        ($t:ty) => {
            try_dtype!($t, |v| v as f64)
        };
    }

    try_dtype!(f64, |v| v);
    try_dtype!(f32);
    try_dtype!(i64);
    try_dtype!(u64);
    try_dtype!(i32);
    try_dtype!(u32);
    try_dtype!(i16);
    try_dtype!(u16);
    try_dtype!(u8);
    try_dtype!(i8);
    try_dtype!(bool, |v| if v { 1.0 } else { 0.0 });
    bail!("unsupported element type (expected float, integer or bool)")
}

// ---------------------------------------------------------------------------
// Nested-list decoding shared by JSON and pickle
// ---------------------------------------------------------------------------

/// A nested list / scalar tree, independent of the source format.
enum Nested {
    Scalar(f64),
    List(Vec<Nested>),
}

/// Flatten a rectangular nested list into an `ArrayD` (row-major).
fn nested_to_array(key: &str, root: &Nested) -> Result<ArrayD<f64>> {
    let mut shape = Vec::new();
    let mut node = root;
    while let Nested::List(items) = node {
        shape.push(items.len());
        match items.first() {
            Some(first) => node = first,
            None => break,
        }
    }

    let mut data = Vec::with_capacity(shape.iter().product());
    flatten(key, root, &shape, 0, &mut data)?;
    ArrayD::from_shape_vec(IxDyn(&shape), data)
        .with_context(|| format!("'{key}': cannot build array of shape {shape:?}"))
}

fn flatten(key: &str, node: &Nested, shape: &[usize], depth: usize, out: &mut Vec<f64>) -> Result<()> {
    match node {
        Nested::Scalar(v) => {
            if depth != shape.len() {
                bail!("'{key}': ragged nesting (scalar at depth {depth}, expected {})", shape.len());
            }
            out.push(*v);
        }
        Nested::List(items) => {
            if depth >= shape.len() || items.len() != shape[depth] {
                bail!("'{key}': ragged nesting at depth {depth}");
            }
            for item in items {
                flatten(key, item, shape, depth + 1, out)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON layout:
///
/// ```json
/// {
///   "subject_ids": [1, 1, 2],
///   "responses_train": [[[0.0, 1.0, null, ...], ...], ...],
///   "images_train": [[[128, 130, ...], ...], ...],
///   ...
/// }
/// ```
fn load_json(path: &Path) -> Result<ArrayMap> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;
    let obj = root.as_object().context("Expected top-level JSON object")?;

    obj.iter()
        .map(|(key, value)| -> Result<(String, ArrayD<f64>)> {
            let nested = json_to_nested(key, value)?;
            Ok((key.clone(), nested_to_array(key, &nested)?))
        })
        .collect()
}

fn json_to_nested(key: &str, val: &JsonValue) -> Result<Nested> {
    Ok(match val {
        JsonValue::Null => Nested::Scalar(f64::NAN),
        JsonValue::Bool(b) => Nested::Scalar(if *b { 1.0 } else { 0.0 }),
        JsonValue::Number(n) => Nested::Scalar(
            n.as_f64()
                .with_context(|| format!("'{key}': {n} is not representable as f64"))?,
        ),
        JsonValue::Array(items) => Nested::List(
            items
                .iter()
                .map(|v| json_to_nested(key, v))
                .collect::<Result<_>>()?,
        ),
        other => bail!("'{key}': unexpected JSON value {other}"),
    })
}

// ---------------------------------------------------------------------------
// Pickle loader
// ---------------------------------------------------------------------------

const PICKLE_HINT: &str = "store arrays as lists or convert the file to .npz";

/// A pickled `dict` of arrays, as written by `pickle.dump(record, f)`.
///
/// Values may be NumPy arrays (see [`NdarrayState`]) or nested lists and
/// tuples of numbers, e.g. `{k: v.tolist() for k, v in record.items()}`.
fn load_pickle(path: &Path) -> Result<ArrayMap> {
    let reader = BufReader::new(File::open(path).context("opening pickle file")?);
    let root = serde_pickle::value_from_reader(reader, DeOptions::new().decode_strings())
        .with_context(|| format!("parsing pickle ({PICKLE_HINT})"))?;

    let PickleValue::Dict(entries) = root else {
        bail!("Expected a pickled dict at the top level");
    };

    entries
        .iter()
        .map(|(key, value)| -> Result<(String, ArrayD<f64>)> {
            let key = match key {
                HashableValue::String(s) => s.clone(),
                HashableValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                other => bail!("unexpected pickle dict key {other:?}"),
            };
            let array = match NdarrayState::parse(value) {
                Some(state) => state.decode(&key)?,
                None => nested_to_array(&key, &pickle_to_nested(&key, value)?)?,
            };
            Ok((key, array))
        })
        .collect()
}

fn pickle_to_nested(key: &str, val: &PickleValue) -> Result<Nested> {
    Ok(match val {
        PickleValue::None => Nested::Scalar(f64::NAN),
        PickleValue::Bool(b) => Nested::Scalar(if *b { 1.0 } else { 0.0 }),
        PickleValue::I64(i) => Nested::Scalar(*i as f64),
        PickleValue::F64(f) => Nested::Scalar(*f),
        PickleValue::List(items) | PickleValue::Tuple(items) => Nested::List(
            items
                .iter()
                .map(|v| pickle_to_nested(key, v))
                .collect::<Result<_>>()?,
        ),
        other => bail!("'{key}': unsupported pickle value {other:?}; {PICKLE_HINT}"),
    })
}

/// What is left of a pickled `numpy.ndarray` once its reconstructor is
/// dropped: the `__setstate__` tuple
/// `(version, shape, dtype_state, fortran_order, raw_bytes)`.
///
/// The dtype survives only as its own state `(3, byte_order, ...)`, so the
/// element kind is lost.  It is recovered from the item size and the key:
/// identifier arrays hold integers, everything else holds floats.  One-byte
/// items are `uint8` (or `bool`).
struct NdarrayState<'a> {
    shape: Vec<usize>,
    big_endian: bool,
    fortran_order: bool,
    raw: &'a [u8],
}

impl<'a> NdarrayState<'a> {
    fn parse(val: &'a PickleValue) -> Option<Self> {
        let PickleValue::Tuple(items) = val else {
            return None;
        };
        let [
            PickleValue::I64(_),
            PickleValue::Tuple(shape),
            PickleValue::Tuple(dtype),
            PickleValue::Bool(fortran_order),
            PickleValue::Bytes(raw),
        ] = items.as_slice()
        else {
            return None;
        };
        let shape = shape
            .iter()
            .map(|dim| match dim {
                PickleValue::I64(n) => usize::try_from(*n).ok(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        let big_endian = match dtype.get(1) {
            Some(PickleValue::String(order)) => {
                order == ">" || (order == "=" && cfg!(target_endian = "big"))
            }
            _ => false,
        };
        Some(Self {
            shape,
            big_endian,
            fortran_order: *fortran_order,
            raw,
        })
    }

    fn decode(&self, key: &str) -> Result<ArrayD<f64>> {
        let count: usize = self.shape.iter().product();
        let values: Vec<f64> = if count == 0 {
            Vec::new()
        } else {
            if self.raw.len() % count != 0 {
                bail!(
                    "'{key}': {} bytes do not fill an array of shape {:?}",
                    self.raw.len(),
                    self.shape
                );
            }
            let integer = INTEGER_KEYS.contains(&key);
            match (self.raw.len() / count, integer) {
                (1, _) => self.raw.iter().map(|&b| f64::from(b)).collect(),
                (4, false) => self.words::<4>().map(|w| f64::from(f32::from_le_bytes(w))).collect(),
                (4, true) => self.words::<4>().map(|w| f64::from(i32::from_le_bytes(w))).collect(),
                (8, false) => self.words::<8>().map(f64::from_le_bytes).collect(),
                (8, true) => self.words::<8>().map(|w| i64::from_le_bytes(w) as f64).collect(),
                (size, _) => bail!(
                    "'{key}': cannot decode {size}-byte NumPy elements; {PICKLE_HINT}"
                ),
            }
        };

        let dim = IxDyn(&self.shape);
        let array = if self.fortran_order {
            ArrayD::from_shape_vec(dim.f(), values)
        } else {
            ArrayD::from_shape_vec(dim, values)
        };
        array.with_context(|| format!("'{key}': shape {:?}", self.shape))
    }

    /// Fixed-size items in little-endian byte order.
    fn words<const N: usize>(&self) -> impl Iterator<Item = [u8; N]> + '_ {
        self.raw.chunks_exact(N).map(move |chunk| {
            let mut word = [0u8; N];
            word.copy_from_slice(chunk);
            if self.big_endian {
                word.reverse();
            }
            word
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::data::model::{IMAGES_TEST, IMAGES_TRAIN, RESPONSES_TRAIN, SUBJECT_IDS};
    use crate::data::synthetic::{generate, SyntheticParams};
    use serde_json::json;
    use serde_pickle::SerOptions;

    fn same_with_nan(a: &ArrayD<f64>, b: &ArrayD<f64>) -> bool {
        a.shape() == b.shape()
            && a.iter()
                .zip(b.iter())
                .all(|(x, y)| (x.is_nan() && y.is_nan()) || x == y)
    }

    #[test]
    fn npz_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.npz");
        let raw = generate(&SyntheticParams::default(), 1);
        save_npz(&raw, &path).unwrap();

        let loaded = load_dataset(&path, None).unwrap();
        assert_eq!(loaded.images_train, raw.images_train);
        assert_eq!(loaded.subject_ids, raw.subject_ids);
        assert!(same_with_nan(
            &loaded.responses_train.mapv(f64::from).into_dyn(),
            &raw.responses_train.mapv(f64::from).into_dyn(),
        ));
    }

    #[test]
    fn npz_integer_images_are_widened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uint8.npz");
        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        let pixels = ndarray::Array3::<u8>::from_elem((2, 3, 3), 200);
        npz.add_array("images_train", &pixels).unwrap();
        npz.finish().unwrap();

        let arrays = load_file(&path).unwrap();
        assert_eq!(arrays[IMAGES_TRAIN].shape(), &[2, 3, 3]);
        assert!(arrays[IMAGES_TRAIN].iter().all(|&v| v == 200.0));
    }

    #[test]
    fn npz_unsigned_ids_are_widened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uint32.npz");
        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        npz.add_array("subject_ids", &ndarray::arr1(&[7u32, 4_000_000_000]))
            .unwrap();
        npz.finish().unwrap();

        let arrays = load_file(&path).unwrap();
        assert_eq!(arrays[SUBJECT_IDS].as_slice().unwrap(), &[7.0, 4e9]);
    }

    #[test]
    fn corrupt_npz_entry_is_not_a_dtype_problem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.npz");
        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        npz.add_array("images_train", &ndarray::Array3::<f32>::zeros((2, 3, 3)))
            .unwrap();
        npz.finish().unwrap();

        // Break the `.npy` magic inside the stored (uncompressed) entry.
        let mut bytes = std::fs::read(&path).unwrap();
        let magic = bytes.windows(6).position(|w| w == b"\x93NUMPY").unwrap();
        bytes[magic + 1] = b'X';
        std::fs::write(&path, bytes).unwrap();

        let err = format!("{:#}", load_file(&path).unwrap_err());
        assert!(err.contains("images_train"), "{err}");
        assert!(!err.contains("unsupported element type"), "{err}");
    }

    #[test]
    fn json_nulls_become_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        let doc = json!({
            "subject_ids": [3, 4],
            "responses_train": [[[1.0, null], [2.0, 3.0]]],
        });
        std::fs::write(&path, doc.to_string()).unwrap();

        let arrays = load_file(&path).unwrap();
        assert_eq!(arrays[SUBJECT_IDS].as_slice().unwrap(), &[3.0, 4.0]);
        let responses = &arrays[RESPONSES_TRAIN];
        assert_eq!(responses.shape(), &[1, 2, 2]);
        assert!(responses[[0, 0, 1]].is_nan());
        assert_eq!(responses[[0, 1, 1]], 3.0);
    }

    #[test]
    fn ragged_lists_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.json");
        std::fs::write(&path, r#"{ "images_train": [[1, 2], [3]] }"#).unwrap();
        let err = load_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("ragged"), "{err:#}");
    }

    #[test]
    fn pickle_dict_of_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.pickle");
        let raw = generate(&SyntheticParams::default(), 2);

        // Python's `None` for missing responses
        let mut dict = BTreeMap::new();
        for (key, array) in raw.to_arrays() {
            dict.insert(HashableValue::String(key), array_to_pickle(&array));
        }
        write_pickle(&path, dict);

        let loaded = load_dataset(&path, None).unwrap();
        assert_eq!(loaded.images_test, raw.images_test);
        assert_eq!(
            loaded.responses_train.mapv(f32::is_nan),
            raw.responses_train.mapv(f32::is_nan)
        );
    }

    fn write_pickle(path: &Path, dict: BTreeMap<HashableValue, PickleValue>) {
        let mut bytes = Vec::new();
        serde_pickle::value_to_writer(&mut bytes, &PickleValue::Dict(dict), SerOptions::new())
            .unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    /// `ndarray.__reduce__` state as serde-pickle hands it back.
    fn numpy_state(shape: &[usize], byte_order: &str, fortran: bool, raw: Vec<u8>) -> PickleValue {
        PickleValue::Tuple(vec![
            PickleValue::I64(1),
            PickleValue::Tuple(shape.iter().map(|&d| PickleValue::I64(d as i64)).collect()),
            PickleValue::Tuple(vec![
                PickleValue::I64(3),
                PickleValue::String(byte_order.into()),
                PickleValue::None,
                PickleValue::None,
                PickleValue::None,
                PickleValue::I64(-1),
                PickleValue::I64(-1),
                PickleValue::I64(0),
            ]),
            PickleValue::Bool(fortran),
            PickleValue::Bytes(raw),
        ])
    }

    #[test]
    fn pickle_of_numpy_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.pickle");
        let raw = generate(&SyntheticParams::default(), 6);

        // int64 ids, float32 responses and images
        let mut dict = BTreeMap::new();
        for (key, array) in raw.to_arrays() {
            let bytes: Vec<u8> = if INTEGER_KEYS.contains(&key.as_str()) {
                array.iter().flat_map(|&v| (v as i64).to_le_bytes()).collect()
            } else {
                array.iter().flat_map(|&v| (v as f32).to_le_bytes()).collect()
            };
            let state = numpy_state(array.shape(), "<", false, bytes);
            dict.insert(HashableValue::String(key), state);
        }
        write_pickle(&path, dict);

        let loaded = load_dataset(&path, None).unwrap();
        assert_eq!(loaded.subject_ids, raw.subject_ids);
        assert_eq!(loaded.session_unit_response_link, raw.session_unit_response_link);
        assert_eq!(loaded.images_train, raw.images_train);
        assert_eq!(
            loaded.responses_test.mapv(f32::is_nan),
            raw.responses_test.mapv(f32::is_nan)
        );
    }

    #[test]
    fn pickled_big_endian_fortran_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fortran.pkl");
        // [[0, 1, 2], [3, 4, 5]] stored column by column
        let bytes: Vec<u8> = [0.0f64, 3.0, 1.0, 4.0, 2.0, 5.0]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        let mut dict = BTreeMap::new();
        dict.insert(
            HashableValue::String(RESPONSES_TRAIN.into()),
            numpy_state(&[2, 3], ">", true, bytes),
        );
        write_pickle(&path, dict);

        let arrays = load_file(&path).unwrap();
        let responses = &arrays[RESPONSES_TRAIN];
        assert_eq!(responses.shape(), &[2, 3]);
        assert_eq!(responses[[0, 1]], 1.0);
        assert_eq!(responses[[1, 0]], 3.0);
        assert_eq!(responses[[1, 2]], 5.0);
    }

    #[test]
    fn pickled_half_floats_point_to_npz() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.pkl");
        let mut dict = BTreeMap::new();
        dict.insert(
            HashableValue::String(IMAGES_TRAIN.into()),
            numpy_state(&[2, 2], "<", false, vec![0; 8]),
        );
        write_pickle(&path, dict);

        let err = load_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains(".npz"), "{err:#}");
    }

    fn array_to_pickle(array: &ArrayD<f64>) -> PickleValue {
        if array.ndim() == 0 {
            let v = array[IxDyn(&[])];
            return if v.is_nan() { PickleValue::None } else { PickleValue::F64(v) };
        }
        PickleValue::List(
            array
                .outer_iter()
                .map(|sub| array_to_pickle(&sub.to_owned()))
                .collect(),
        )
    }

    #[test]
    fn images_from_separate_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = generate(&SyntheticParams::default(), 4);

        let main = dir.path().join("responses.npz");
        let mut without_images = raw.to_arrays();
        for key in IMAGE_KEYS {
            without_images.remove(key);
        }
        let mut npz = NpzWriter::new(File::create(&main).unwrap());
        for (key, array) in &without_images {
            npz.add_array(key.as_str(), array).unwrap();
        }
        npz.finish().unwrap();

        let images = dir.path().join("images.json");
        let nested = json!({
            IMAGES_TRAIN: to_json(&raw.images_train.mapv(f64::from).into_dyn()),
            IMAGES_TEST: to_json(&raw.images_test.mapv(f64::from).into_dyn()),
        });
        std::fs::write(&images, nested.to_string()).unwrap();

        assert!(load_dataset(&main, None).is_err());
        let loaded = load_dataset(&main, Some(images.as_path())).unwrap();
        assert_eq!(loaded.images_train, raw.images_train);
    }

    fn to_json(array: &ArrayD<f64>) -> JsonValue {
        if array.ndim() == 0 {
            return json!(array[IxDyn(&[])]);
        }
        JsonValue::Array(array.outer_iter().map(|sub| to_json(&sub.to_owned())).collect())
    }

    #[test]
    fn unknown_extension() {
        assert!(load_file(Path::new("record.mat")).is_err());
    }
}
