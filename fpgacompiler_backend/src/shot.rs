//! Persistent shot store.
//!
//! A shot file is a small hierarchical container, a tree of groups with
//! named datasets and attributes, serialized with `bincode`. The compiler
//! writes each board's compiled output under `/devices/<board>/`; worker
//! processes re-open the file, verify the stored checksum and stream the
//! matrix to hardware. Insertion order is preserved so repeated saves of
//! the same experiment are byte-identical.
//!
//! Layout written by [`ShotFile::write_board`]:
//!
//! ```text
//! /devices/<board>/<board>_matrix          u32 matrix, col 0 = tick
//! /devices/<board>/<board>_init            device-init block, same layout
//! /devices/<board>/<board>_CRC             [whole-matrix CRC, channel CRCs...]
//! /devices/<board>/<board>_final           JSON map of final channel values
//! /devices/<board>/<board>_worker_args_ex  JSON overrides for the worker
//! ```
//!
//! [`ShotFile::write_traces`] additionally stores, per intermediate device,
//! a group holding that device's `time` vector and word stream for run
//! viewers; the device decoders take these streams as-is.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use indexmap::IndexMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::encoder::DeviceModel;
use crate::errors::StoreError;
use crate::graph::Experiment;
use crate::matrix::{matrix_crc, BuildResult};
use crate::words::{address_of, is_nop};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Dataset {
    U32 { shape: Vec<usize>, data: Vec<u32> },
    F64(Vec<f64>),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attr {
    Str(String),
    U64(u64),
    F64(f64),
}

/// One node of the shot tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub attrs: IndexMap<String, Attr>,
    pub groups: IndexMap<String, Group>,
    pub datasets: IndexMap<String, Dataset>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShotFile {
    pub root: Group,
}

impl ShotFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StoreError> {
        let file = File::create(path)?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }

    fn split(path: &str) -> impl Iterator<Item = &str> {
        path.split('/').filter(|s| !s.is_empty())
    }

    /// Walks to a group, creating intermediate groups along the way.
    pub fn group_mut(&mut self, path: &str) -> &mut Group {
        let mut node = &mut self.root;
        for part in Self::split(path) {
            node = node.groups.entry(part.to_string()).or_default();
        }
        node
    }

    pub fn group(&self, path: &str) -> Result<&Group, StoreError> {
        let mut node = &self.root;
        for part in Self::split(path) {
            node = node
                .groups
                .get(part)
                .ok_or_else(|| StoreError::MissingKey(path.to_string()))?;
        }
        Ok(node)
    }

    /// Looks up a dataset by slash-separated path, the last component being
    /// the dataset name.
    pub fn dataset(&self, path: &str) -> Result<&Dataset, StoreError> {
        let parts: Vec<&str> = Self::split(path).collect();
        let (name, group_parts) = parts
            .split_last()
            .ok_or_else(|| StoreError::MissingKey(path.to_string()))?;
        let mut node = &self.root;
        for part in group_parts {
            node = node
                .groups
                .get(*part)
                .ok_or_else(|| StoreError::MissingKey(path.to_string()))?;
        }
        node.datasets
            .get(*name)
            .ok_or_else(|| StoreError::MissingKey(path.to_string()))
    }

    pub fn write_dataset(&mut self, group: &str, name: &str, dataset: Dataset) {
        self.group_mut(group).datasets.insert(name.to_string(), dataset);
    }

    pub fn write_matrix(&mut self, group: &str, name: &str, matrix: &Array2<u32>) {
        let dataset = Dataset::U32 {
            shape: matrix.shape().to_vec(),
            data: matrix.iter().copied().collect(),
        };
        self.write_dataset(group, name, dataset);
    }

    pub fn matrix_u32(&self, path: &str) -> Result<Array2<u32>, StoreError> {
        match self.dataset(path)? {
            Dataset::U32 { shape, data } if shape.len() == 2 => {
                Array2::from_shape_vec((shape[0], shape[1]), data.clone())
                    .map_err(|_| StoreError::WrongKind { key: path.to_string(), wanted: "u32 matrix" })
            }
            _ => Err(StoreError::WrongKind { key: path.to_string(), wanted: "u32 matrix" }),
        }
    }

    pub fn str_dataset(&self, path: &str) -> Result<&str, StoreError> {
        match self.dataset(path)? {
            Dataset::Str(s) => Ok(s),
            _ => Err(StoreError::WrongKind { key: path.to_string(), wanted: "string" }),
        }
    }

    // ---- sequence bookkeeping --------------------------------------------

    /// Records which run of which sequence this shot is.
    pub fn set_sequence(&mut self, sequence_id: &str, sequence_index: u64, run_number: u64) {
        let attrs = &mut self.root.attrs;
        attrs.insert("sequence_id".to_string(), Attr::Str(sequence_id.to_string()));
        attrs.insert("sequence_index".to_string(), Attr::U64(sequence_index));
        attrs.insert("run number".to_string(), Attr::U64(run_number));
    }

    /// Identity string the worker keys its smart cache on. Two shots with the
    /// same identity and matrix CRC skip re-programming the boards.
    pub fn run_identity(&self) -> String {
        let attr = |name: &str| match self.root.attrs.get(name) {
            Some(Attr::Str(s)) => s.clone(),
            Some(Attr::U64(n)) => n.to_string(),
            Some(Attr::F64(x)) => x.to_string(),
            None => "?".to_string(),
        };
        format!("{}:{}:{}", attr("sequence_id"), attr("sequence_index"), attr("run number"))
    }

    // ---- per-board payload -----------------------------------------------

    fn board_group(board: &str) -> String {
        format!("devices/{}", board)
    }

    /// Writes one board's compiled output.
    pub fn write_board(
        &mut self,
        board: &str,
        result: &BuildResult,
        worker_args: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let group = Self::board_group(board);
        self.write_matrix(&group, &format!("{}_matrix", board), &result.matrix);
        if result.init.nrows() > 0 {
            self.write_matrix(&group, &format!("{}_init", board), &result.init);
        }
        let mut crcs = vec![matrix_crc(&result.matrix)];
        crcs.extend(result.crcs.values().copied());
        self.write_dataset(
            &group,
            &format!("{}_CRC", board),
            Dataset::U32 { shape: vec![crcs.len()], data: crcs },
        );
        let final_json = serde_json::to_string(&result.final_values)
            .map_err(|e| StoreError::WrongKind { key: format!("{}_final: {}", board, e), wanted: "json" })?;
        self.write_dataset(&group, &format!("{}_final", board), Dataset::Str(final_json));
        self.write_dataset(
            &group,
            &format!("{}_worker_args_ex", board),
            Dataset::Str(worker_args.to_string()),
        );
        Ok(())
    }

    /// Writes the per-device word streams next to the compiled matrix.
    ///
    /// Each intermediate device gets its own group named
    /// `<kind>_rack<N>_0x<addr>` holding a `time` vector (seconds, one entry
    /// per sample the device received) and a `data_<kind>_<board>_0x<addr>`
    /// word stream of the same length.
    pub fn write_traces(
        &mut self,
        exp: &Experiment,
        board: &str,
        result: &BuildResult,
    ) -> Result<(), StoreError> {
        let board_id = exp
            .board_id(board)
            .map_err(|_| StoreError::MissingKey(format!("devices/{}", board)))?;
        let bus_rate = exp.board(board_id).bus_rate;
        for im_id in exp.board_im_ids(board_id) {
            let im = exp.im(im_id);
            if matches!(im.model, DeviceModel::Control) {
                continue;
            }
            let kind = im.model.kind_str();
            let group = format!(
                "{}/{}_rack{}_0x{:x}",
                Self::board_group(board),
                kind,
                im.rack,
                im.address
            );
            let col = 1 + im.rack as usize;
            let mut times = Vec::new();
            let mut words = Vec::new();
            for row in 0..result.matrix.nrows() {
                let word = result.matrix[[row, col]];
                if is_nop(word) || address_of(word) != im.address {
                    continue;
                }
                times.push(result.matrix[[row, 0]] as f64 / bus_rate);
                words.push(word);
            }
            self.write_dataset(&group, "time", Dataset::F64(times));
            self.write_dataset(
                &group,
                &format!("data_{}_{}_0x{:x}", kind, board, im.address),
                Dataset::U32 { shape: vec![words.len()], data: words },
            );
        }
        Ok(())
    }

    pub fn board_matrix(&self, board: &str) -> Result<Array2<u32>, StoreError> {
        self.matrix_u32(&format!("devices/{}/{}_matrix", board, board))
    }

    /// The stored device-init block, if the board needs one.
    pub fn board_init(&self, board: &str) -> Result<Option<Array2<u32>>, StoreError> {
        match self.matrix_u32(&format!("devices/{}/{}_init", board, board)) {
            Ok(init) => Ok(Some(init)),
            Err(StoreError::MissingKey(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The stored checksums: whole-matrix CRC first, then one per channel.
    pub fn board_crcs(&self, board: &str) -> Result<Vec<u32>, StoreError> {
        let path = format!("devices/{}/{}_CRC", board, board);
        match self.dataset(&path)? {
            Dataset::U32 { data, .. } => Ok(data.clone()),
            _ => Err(StoreError::WrongKind { key: path, wanted: "u32 vector" }),
        }
    }

    pub fn board_final_values(&self, board: &str) -> Result<IndexMap<String, f64>, StoreError> {
        let path = format!("devices/{}/{}_final", board, board);
        let json = self.str_dataset(&path)?;
        serde_json::from_str(json)
            .map_err(|_| StoreError::WrongKind { key: path, wanted: "json map" })
    }

    /// Per-shot worker overrides, merged over the static worker config.
    pub fn worker_args(&self, board: &str) -> Result<serde_json::Value, StoreError> {
        let path = format!("devices/{}/{}_worker_args_ex", board, board);
        let json = self.str_dataset(&path)?;
        serde_json::from_str(json)
            .map_err(|_| StoreError::WrongKind { key: path, wanted: "json object" })
    }

    /// Boards with a compiled payload in this shot.
    pub fn board_names(&self) -> Vec<String> {
        match self.group("devices") {
            Ok(devices) => devices.groups.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::Experiment;
    use crate::matrix::build;

    fn compiled() -> BuildResult {
        let mut exp = Experiment::new();
        exp.add_primary_board("primary", "192.168.1.130:49701", 1, 1e6).unwrap();
        exp.add_digital_out("primary", "d0", "0x0/0x0", 0).unwrap();
        exp.go_high("d0", 0.0).unwrap();
        exp.go_low("d0", 1e-6).unwrap();
        build(&exp, "primary").unwrap()
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.h5b");
        let mut shot = ShotFile::new();
        shot.set_sequence("20260828T094210_mot_load", 3, 17);
        shot.write_board("primary", &compiled(), &serde_json::json!({})).unwrap();
        shot.save(&path).unwrap();

        let loaded = ShotFile::load(&path).unwrap();
        assert_eq!(loaded, shot);
        assert_eq!(loaded.run_identity(), "20260828T094210_mot_load:3:17");
        let matrix = loaded.board_matrix("primary").unwrap();
        assert_eq!(matrix.ncols(), 2);
        assert_eq!(loaded.board_names(), vec!["primary".to_string()]);
    }

    #[test]
    fn stored_crc_matches_recomputed() {
        let result = compiled();
        let mut shot = ShotFile::new();
        shot.write_board("primary", &result, &serde_json::json!({})).unwrap();
        let crcs = shot.board_crcs("primary").unwrap();
        let matrix = shot.board_matrix("primary").unwrap();
        assert_eq!(crcs[0], matrix_crc(&matrix));
        assert_eq!(crcs.len(), 2); // whole matrix + one channel
    }

    #[test]
    fn final_values_survive_json() {
        let result = compiled();
        let mut shot = ShotFile::new();
        shot.write_board("primary", &result, &serde_json::json!({})).unwrap();
        let finals = shot.board_final_values("primary").unwrap();
        assert_eq!(finals["d0"], 0.0);
    }

    #[test]
    fn missing_keys_are_reported() {
        let shot = ShotFile::new();
        assert!(matches!(
            shot.board_matrix("nope"),
            Err(StoreError::MissingKey(_))
        ));
    }

    #[test]
    fn traces_are_grouped_per_device() {
        let mut exp = Experiment::new();
        exp.add_primary_board("primary", "192.168.1.130:49701", 1, 1e6).unwrap();
        exp.add_digital_out("primary", "d0", "0x0/0x0", 0).unwrap();
        exp.go_high("d0", 0.0).unwrap();
        exp.go_low("d0", 1e-6).unwrap();
        let result = build(&exp, "primary").unwrap();

        let mut shot = ShotFile::new();
        shot.write_board("primary", &result, &serde_json::json!({})).unwrap();
        shot.write_traces(&exp, "primary", &result).unwrap();

        match shot.dataset("devices/primary/do_rack0_0x0/time").unwrap() {
            Dataset::F64(times) => assert_eq!(times, &vec![0.0, 1e-6]),
            other => panic!("unexpected dataset {:?}", other),
        }
        match shot.dataset("devices/primary/do_rack0_0x0/data_do_primary_0x0").unwrap() {
            Dataset::U32 { data, .. } => {
                assert_eq!(data, &result.matrix.column(1).to_vec())
            }
            other => panic!("unexpected dataset {:?}", other),
        }
        // Unknown board is a store error, not a panic
        assert!(shot.write_traces(&exp, "nope", &result).is_err());
    }

    #[test]
    fn same_address_on_both_racks_gets_separate_trace_groups() {
        let mut exp = Experiment::new();
        exp.add_primary_board("primary", "192.168.1.130:49701", 2, 1e6).unwrap();
        exp.add_digital_out("primary", "d0", "0x0/0x0", 0).unwrap();
        exp.add_digital_out("primary", "d1", "0x0/0x0", 1).unwrap();
        exp.go_high("d0", 0.0).unwrap();
        exp.go_high("d1", 1e-6).unwrap();
        let result = build(&exp, "primary").unwrap();

        let mut shot = ShotFile::new();
        shot.write_traces(&exp, "primary", &result).unwrap();

        let t0 = match shot.dataset("devices/primary/do_rack0_0x0/time").unwrap() {
            Dataset::F64(times) => times.clone(),
            other => panic!("unexpected dataset {:?}", other),
        };
        let t1 = match shot.dataset("devices/primary/do_rack1_0x0/time").unwrap() {
            Dataset::F64(times) => times.clone(),
            other => panic!("unexpected dataset {:?}", other),
        };
        assert_eq!(t0, vec![0.0]);
        assert_eq!(t1, vec![1e-6]);
    }

    #[test]
    fn init_block_persists_when_present() {
        let mut exp = Experiment::new();
        exp.add_primary_board("primary", "192.168.1.130:49701", 1, 1e6).unwrap();
        exp.add_dds("primary", "dds0", "0x10", 0, crate::encoder::DdsVariant::Ad9854).unwrap();
        exp.set_freq("dds0", 0.0, 10e6, true).unwrap();
        let result = build(&exp, "primary").unwrap();

        let mut shot = ShotFile::new();
        shot.write_board("primary", &result, &serde_json::json!({})).unwrap();
        let init = shot.board_init("primary").unwrap().expect("init block stored");
        assert_eq!(init, result.init);

        // A board without one reads back as None
        let mut other = ShotFile::new();
        other.write_board("primary", &compiled(), &serde_json::json!({})).unwrap();
        assert!(other.board_init("primary").unwrap().is_none());
    }

    #[test]
    fn worker_args_overlay() {
        let mut shot = ShotFile::new();
        shot.write_board(
            "primary",
            &compiled(),
            &serde_json::json!({"cycles": 5, "ignore_clock_loss": true}),
        )
        .unwrap();
        let args = shot.worker_args("primary").unwrap();
        assert_eq!(args["cycles"], 5);
        assert_eq!(args["ignore_clock_loss"], true);
    }
}
