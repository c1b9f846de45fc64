//! Side file for pre-computed low-rank projection factors.
//!
//! Binary layout: a packed header of magic `"XQSV1\0"`, then three
//! little-endian u32 fields (version, layer count, embedding width),
//! followed by one `(rank_k, rank_v)` u32 pair per layer. The reader fails
//! closed: any mismatch leaves the caller's state untouched.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

/// File magic, including the trailing NUL.
pub const MAGIC: [u8; 6] = *b"XQSV1\0";

/// Supported format version.
pub const VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SvdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic, not a factor file")]
    BadMagic,

    #[error("unsupported version {0}")]
    BadVersion(u32),
}

/// Low-rank factor ranks for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvdRanks {
    pub rank_k: u32,
    pub rank_v: u32,
}

/// Parsed contents of a factor file.
#[derive(Debug, Clone)]
pub struct SvdFactors {
    /// Embedding width recorded when the factors were computed.
    pub d_model: u32,

    /// Per-layer ranks, in layer order.
    pub layers: Vec<SvdRanks>,
}

fn read_u32(r: &mut impl Read) -> Result<u32, SvdError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read and validate a factor file.
pub fn read_factors(path: &Path) -> Result<SvdFactors, SvdError> {
    let mut r = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 6];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(SvdError::BadMagic);
    }

    let version = read_u32(&mut r)?;
    if version != VERSION {
        return Err(SvdError::BadVersion(version));
    }

    let n_layers = read_u32(&mut r)?;
    let d_model = read_u32(&mut r)?;

    let mut layers = Vec::with_capacity(n_layers as usize);
    for _ in 0..n_layers {
        let rank_k = read_u32(&mut r)?;
        let rank_v = read_u32(&mut r)?;
        layers.push(SvdRanks { rank_k, rank_v });
    }

    debug!(path = %path.display(), n_layers, d_model, "Parsed factor file");
    Ok(SvdFactors { d_model, layers })
}

/// Write a factor file in the current version.
pub fn write_factors(path: &Path, d_model: u32, layers: &[SvdRanks]) -> Result<(), SvdError> {
    let mut w = BufWriter::new(File::create(path)?);

    w.write_all(&MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&(layers.len() as u32).to_le_bytes())?;
    w.write_all(&d_model.to_le_bytes())?;
    for ranks in layers {
        w.write_all(&ranks.rank_k.to_le_bytes())?;
        w.write_all(&ranks.rank_v.to_le_bytes())?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model.xqsv");

        let layers = vec![
            SvdRanks { rank_k: 8, rank_v: 16 },
            SvdRanks { rank_k: 4, rank_v: 4 },
        ];
        write_factors(&path, 4096, &layers).unwrap();

        let factors = read_factors(&path).unwrap();
        assert_eq!(factors.d_model, 4096);
        assert_eq!(factors.layers, layers);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bogus.xqsv");
        std::fs::write(&path, b"NOTSV1\0\0\0\0\0\0\0\0\0\0\0\0").unwrap();

        assert!(matches!(read_factors(&path), Err(SvdError::BadMagic)));
    }

    #[test]
    fn test_bad_version_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("v2.xqsv");

        let mut data = Vec::new();
        data.extend_from_slice(&MAGIC);
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(&path, data).unwrap();

        assert!(matches!(read_factors(&path), Err(SvdError::BadVersion(2))));
    }

    #[test]
    fn test_truncated_table_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("short.xqsv");

        // Header claims 3 layers but carries only one rank pair.
        let mut data = Vec::new();
        data.extend_from_slice(&MAGIC);
        data.extend_from_slice(&VERSION.to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(&128u32.to_le_bytes());
        data.extend_from_slice(&8u32.to_le_bytes());
        data.extend_from_slice(&8u32.to_le_bytes());
        std::fs::write(&path, data).unwrap();

        assert!(matches!(read_factors(&path), Err(SvdError::Io(_))));
    }
}
