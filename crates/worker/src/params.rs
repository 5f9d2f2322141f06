//! Shared base parameters with memory-mapped files
//!
//! The supervisor exports the model's base embedding table once; every worker
//! maps the same file read-only, so N workers cost one copy of the table in
//! the page cache.
//!
//! File layout:
//! - 8 bytes: little-endian u64 header length
//! - header: JSON `ParameterHeader`
//! - `rows * cols` little-endian f32 values, row-major

use axonfleet_common::{FleetError, Result};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Shape and provenance of the exported table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterHeader {
    /// Vocabulary size (rows)
    pub rows: usize,

    /// Embedding dimension (columns)
    pub cols: usize,

    /// Seed the table was generated from
    pub seed: u64,
}

impl ParameterHeader {
    /// Payload size in bytes
    pub fn size_bytes(&self) -> usize {
        self.rows * self.cols * std::mem::size_of::<f32>()
    }
}

/// Read-only memory-mapped embedding table
pub struct SharedParameters {
    /// Memory-mapped file
    mmap: Mmap,

    /// Parsed header
    header: ParameterHeader,

    /// Byte offset of the first value
    data_offset: usize,
}

impl std::fmt::Debug for SharedParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedParameters")
            .field("header", &self.header)
            .field("data_offset", &self.data_offset)
            .finish()
    }
}

/// Thread-safe handle to a mapped table
pub type SharedParametersRef = Arc<SharedParameters>;

impl SharedParameters {
    /// Generate a seeded table and write it to `path`.
    ///
    /// Written to a temporary sibling and renamed into place, so a worker
    /// opening the path never maps a half-written file.
    pub fn export<P: AsRef<Path>>(path: P, rows: usize, cols: usize, seed: u64) -> Result<ParameterHeader> {
        let path = path.as_ref();
        if rows == 0 || cols == 0 {
            return Err(FleetError::model("shared parameter table must be non-empty"));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let header = ParameterHeader { rows, cols, seed };
        let header_json = serde_json::to_vec(&header)?;

        let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        {
            let file = File::create(&temp_path).map_err(|e| {
                FleetError::model(format!("Failed to create {}: {}", temp_path.display(), e))
            })?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&(header_json.len() as u64).to_le_bytes())?;
            writer.write_all(&header_json)?;

            // Small symmetric init, scaled like an embedding layer.
            let scale = 1.0 / (cols as f32).sqrt();
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..rows * cols {
                let value: f32 = rng.random_range(-scale..scale);
                writer.write_all(&value.to_le_bytes())?;
            }
            writer.flush()?;
        }
        std::fs::rename(&temp_path, path)?;

        info!(
            "Exported shared parameters {}x{} ({} KB) to {}",
            rows,
            cols,
            header.size_bytes() / 1024,
            path.display()
        );
        Ok(header)
    }

    /// Map an exported table read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = File::open(path)
            .map_err(|e| FleetError::model(format!("Failed to open file {}: {}", path.display(), e)))?;

        // The file is only ever replaced by rename, never written in place.
        let mmap = unsafe {
            Mmap::map(&file)
                .map_err(|e| FleetError::model(format!("Failed to mmap file {}: {}", path.display(), e)))?
        };

        if mmap.len() < 8 {
            return Err(FleetError::model("File too small to contain header"));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&mmap[..8]);
        let header_len = u64::from_le_bytes(len_bytes) as usize;

        if mmap.len() < 8 + header_len {
            return Err(FleetError::model("File truncated: header length exceeds file size"));
        }

        let header: ParameterHeader = serde_json::from_slice(&mmap[8..8 + header_len])
            .map_err(|e| FleetError::model(format!("Failed to parse parameter header: {}", e)))?;

        let data_offset = 8 + header_len;
        if mmap.len() < data_offset + header.size_bytes() {
            return Err(FleetError::model(format!(
                "File truncated: expected {} bytes of parameters, found {}",
                header.size_bytes(),
                mmap.len() - data_offset
            )));
        }

        debug!(rows = header.rows, cols = header.cols, "mapped shared parameters");

        Ok(Self {
            mmap,
            header,
            data_offset,
        })
    }

    pub fn header(&self) -> &ParameterHeader {
        &self.header
    }

    pub fn rows(&self) -> usize {
        self.header.rows
    }

    pub fn cols(&self) -> usize {
        self.header.cols
    }

    /// Add row `row` into `out` (`out.len()` must equal `cols`)
    pub fn accumulate_row(&self, row: usize, out: &mut [f32]) -> Result<()> {
        if row >= self.header.rows {
            return Err(FleetError::model(format!(
                "token {} outside vocabulary of {}",
                row, self.header.rows
            )));
        }
        if out.len() != self.header.cols {
            return Err(FleetError::model(format!(
                "output has {} columns, table has {}",
                out.len(),
                self.header.cols
            )));
        }

        // Decoded value by value; the mapped payload is not f32-aligned.
        let start = self.data_offset + row * self.header.cols * 4;
        let bytes = &self.mmap[start..start + self.header.cols * 4];
        for (o, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
            *o += f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    /// Copy of row `row`
    pub fn row(&self, row: usize) -> Result<Vec<f32>> {
        let mut out = vec![0.0; self.header.cols];
        self.accumulate_row(row, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.bin");

        let header = SharedParameters::export(&path, 16, 4, 42).unwrap();
        let params = SharedParameters::open(&path).unwrap();

        assert_eq!(params.header(), &header);
        assert_eq!(params.rows(), 16);
        assert_eq!(params.cols(), 4);

        let row = params.row(3).unwrap();
        assert_eq!(row.len(), 4);
        let bound = 1.0 / 2.0;
        assert!(row.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn test_export_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        SharedParameters::export(dir.path().join("a.bin"), 8, 3, 7).unwrap();
        SharedParameters::export(dir.path().join("b.bin"), 8, 3, 7).unwrap();

        let a = SharedParameters::open(dir.path().join("a.bin")).unwrap();
        let b = SharedParameters::open(dir.path().join("b.bin")).unwrap();
        for r in 0..8 {
            assert_eq!(a.row(r).unwrap(), b.row(r).unwrap());
        }
    }

    #[test]
    fn test_two_mappings_share_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.bin");
        SharedParameters::export(&path, 4, 2, 1).unwrap();

        let first = Arc::new(SharedParameters::open(&path).unwrap());
        let second = SharedParameters::open(&path).unwrap();
        assert_eq!(first.row(2).unwrap(), second.row(2).unwrap());
    }

    #[test]
    fn test_out_of_range_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.bin");
        SharedParameters::export(&path, 4, 2, 1).unwrap();
        let params = SharedParameters::open(&path).unwrap();

        assert!(matches!(params.row(4), Err(FleetError::Model(_))));
        let mut wrong = vec![0.0; 3];
        assert!(params.accumulate_row(0, &mut wrong).is_err());
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.bin");
        SharedParameters::export(&path, 4, 2, 1).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(SharedParameters::open(&path).is_err());

        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        assert!(SharedParameters::open(&path).is_err());
    }
}
