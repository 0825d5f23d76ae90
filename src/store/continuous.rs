use crate::core::SampleBlock;
use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"EVOKEDLB";
const VERSION: u64 = 1;
const HEADER_SIZE: usize = 64;
const START_OFFSET: u64 = 32;

// Header layout (little endian):
//   0..8   magic
//   8..16  version
//  16..24  sample rate (f64 bits)
//  24..32  channels
//  32..40  sample index of the first stored frame
// Frames follow, channel-interleaved f64.

/// Append-only writer for one input's continuous samples.
///
/// Blocks must arrive in order. A gap is filled with NaN; samples already
/// written are skipped.
pub struct ContinuousWriter {
    path: PathBuf,
    file: BufWriter<File>,
    fs: f64,
    channels: usize,
    start: Option<u64>,
    written: u64,
}

impl ContinuousWriter {
    pub fn create(path: impl AsRef<Path>, fs: f64, channels: usize) -> Result<Self> {
        if channels == 0 {
            bail!("Continuous store needs at least one channel");
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let mut header = [0u8; HEADER_SIZE];
        header[0..8].copy_from_slice(MAGIC);
        header[8..16].copy_from_slice(&VERSION.to_le_bytes());
        header[16..24].copy_from_slice(&fs.to_bits().to_le_bytes());
        header[24..32].copy_from_slice(&(channels as u64).to_le_bytes());

        let mut file = BufWriter::new(file);
        file.write_all(&header)?;

        Ok(Self {
            path,
            file,
            fs,
            channels,
            start: None,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute index one past the last stored sample
    pub fn end(&self) -> u64 {
        self.start.unwrap_or(0) + self.written
    }

    pub fn append(&mut self, block: &SampleBlock) -> Result<()> {
        if block.n_channels() != self.channels {
            bail!(
                "Block has {} channels, store has {}",
                block.n_channels(),
                self.channels
            );
        }
        if block.is_empty() {
            return Ok(());
        }

        if self.start.is_none() {
            self.file.flush()?;
            let file = self.file.get_mut();
            file.seek(SeekFrom::Start(START_OFFSET))?;
            file.write_all(&block.s0.to_le_bytes())?;
            file.seek(SeekFrom::End(0))?;
            self.start = Some(block.s0);
        }

        let end = self.end();
        let mut skip = 0usize;
        if block.s0 > end {
            let gap = block.s0 - end;
            tracing::warn!(gap, "gap in continuous data, filling with NaN");
            let nan = f64::NAN.to_le_bytes();
            for _ in 0..gap * self.channels as u64 {
                self.file.write_all(&nan)?;
            }
            self.written += gap;
        } else if block.s0 < end {
            skip = (end - block.s0) as usize;
        }

        for i in skip..block.n_samples() {
            for c in 0..self.channels {
                self.file.write_all(&block.data[c][i].to_le_bytes())?;
            }
        }
        self.written += block.n_samples().saturating_sub(skip) as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for ContinuousWriter {
    fn drop(&mut self) {
        if let Err(e) = self.file.flush() {
            tracing::error!(path = %self.path.display(), error = %e, "failed to flush continuous store");
        }
    }
}

/// Memory-mapped view of a continuous store
pub struct ContinuousReader {
    path: PathBuf,
    mmap: Mmap,
    fs: f64,
    channels: usize,
    start: u64,
}

impl ContinuousReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file =
            File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        // The writer only appends, so mapped bytes never change underneath us
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE || &mmap[0..8] != MAGIC {
            bail!("{} is not a continuous store", path.display());
        }
        let word = |i: usize| -> u64 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&mmap[i..i + 8]);
            u64::from_le_bytes(bytes)
        };
        let version = word(8);
        if version != VERSION {
            bail!("Unsupported continuous store version {}", version);
        }
        let fs = f64::from_bits(word(16));
        let channels = word(24) as usize;
        let start = word(32);
        if channels == 0 {
            bail!("Continuous store header has no channels");
        }

        Ok(Self {
            path,
            mmap,
            fs,
            channels,
            start,
        })
    }

    /// Re-map to pick up samples appended since opening
    pub fn refresh(&mut self) -> Result<()> {
        *self = Self::open(&self.path)?;
        Ok(())
    }

    pub fn fs(&self) -> f64 {
        self.fs
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Absolute sample index of the first stored frame
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Seconds at the first stored frame
    pub fn t0(&self) -> f64 {
        self.start as f64 / self.fs
    }

    /// Number of complete frames on disk
    pub fn len(&self) -> usize {
        (self.mmap.len() - HEADER_SIZE) / (8 * self.channels)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sample(&self, frame: usize, channel: usize) -> f64 {
        let offset = HEADER_SIZE + (frame * self.channels + channel) * 8;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.mmap[offset..offset + 8]);
        f64::from_le_bytes(bytes)
    }

    /// Samples `[start, end)` in absolute sample indices, one Vec per channel
    pub fn get_range(&self, start: u64, end: u64) -> Result<Vec<Vec<f64>>> {
        let stored_end = self.start + self.len() as u64;
        if start < self.start || end > stored_end || end < start {
            bail!(
                "Range {}..{} outside stored samples {}..{}",
                start,
                end,
                self.start,
                stored_end
            );
        }
        let first = (start - self.start) as usize;
        let last = (end - self.start) as usize;
        Ok((0..self.channels)
            .map(|c| (first..last).map(|i| self.sample(i, c)).collect())
            .collect())
    }

    /// Windows of `duration` seconds starting `offset` seconds after each onset
    pub fn get_epochs(
        &self,
        onsets: &[f64],
        offset: f64,
        duration: f64,
    ) -> Result<Vec<Vec<Vec<f64>>>> {
        let n = (duration * self.fs).round() as u64;
        onsets
            .iter()
            .map(|onset| {
                let t = onset + offset;
                if t < 0.0 {
                    bail!("Epoch at {} s starts before the recording", t);
                }
                let start = (t * self.fs).round() as u64;
                self.get_range(start, start + n)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mic.bin");

        let mut writer = ContinuousWriter::create(&path, 1000.0, 2).unwrap();
        let ramp: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let neg: Vec<f64> = ramp.iter().map(|v| -v).collect();
        writer
            .append(&SampleBlock::new(50, 1000.0, vec![ramp.clone(), neg]))
            .unwrap();
        writer.flush().unwrap();

        let reader = ContinuousReader::open(&path).unwrap();
        assert_eq!(reader.start(), 50);
        assert_eq!(reader.len(), 100);
        assert!((reader.t0() - 0.05).abs() < 1e-12);

        let range = reader.get_range(60, 65).unwrap();
        assert_eq!(range[0], vec![10.0, 11.0, 12.0, 13.0, 14.0]);
        assert_eq!(range[1][0], -10.0);
        assert!(reader.get_range(0, 10).is_err());
    }

    #[test]
    fn test_gap_filled_and_overlap_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gap.bin");
        let mut writer = ContinuousWriter::create(&path, 100.0, 1).unwrap();
        writer
            .append(&SampleBlock::mono(0, 100.0, vec![1.0; 10]))
            .unwrap();
        writer
            .append(&SampleBlock::mono(15, 100.0, vec![2.0; 5]))
            .unwrap();
        writer
            .append(&SampleBlock::mono(18, 100.0, vec![3.0; 4]))
            .unwrap();
        drop(writer);

        let reader = ContinuousReader::open(&path).unwrap();
        assert_eq!(reader.len(), 22);
        let data = reader.get_range(0, 22).unwrap().remove(0);
        assert!(data[10..15].iter().all(|v| v.is_nan()));
        assert_eq!(&data[15..20], &[2.0; 5]);
        assert_eq!(&data[20..22], &[3.0; 2]);
    }

    #[test]
    fn test_epochs_by_onset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("epochs.bin");
        let mut writer = ContinuousWriter::create(&path, 1000.0, 1).unwrap();
        let ramp: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        writer.append(&SampleBlock::mono(0, 1000.0, ramp)).unwrap();
        drop(writer);

        let reader = ContinuousReader::open(&path).unwrap();
        let epochs = reader.get_epochs(&[0.1, 0.5], -0.01, 0.005).unwrap();
        assert_eq!(epochs.len(), 2);
        assert_eq!(epochs[0][0], vec![90.0, 91.0, 92.0, 93.0, 94.0]);
        assert_eq!(epochs[1][0][0], 490.0);
    }
}
