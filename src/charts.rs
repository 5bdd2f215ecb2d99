//! Charts sample feed.
//!
//! The rendering side of the stats subsystem is an external collaborator;
//! this module only maintains the data it consumes: 24 time series sampled
//! once per minute into four ranges (per-minute, 6-minute, 30-minute and
//! daily averages), 950 points each, persisted to `csstats.mfs`.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, format_err, Error};

pub const SERIES: usize = 24;
pub const RANGES: usize = 4;
pub const POINTS: usize = 950;

/// Minutes folded into one point, per range.
const RANGE_FACTOR: [u32; RANGES] = [1, 6, 30, 1440];

const STATS_MAGIC: &[u8; 8] = b"MFSSTATS";
const STATS_VERSION: u32 = 1;

// series indices
pub const CH_MASTER_IN: usize = 0;
pub const CH_MASTER_OUT: usize = 1;
pub const CH_CLIENT_IN: usize = 2;
pub const CH_CLIENT_OUT: usize = 3;
pub const CH_PEER_IN: usize = 4;
pub const CH_PEER_OUT: usize = 5;
pub const CH_HDD_OPS_READ: usize = 6;
pub const CH_HDD_OPS_WRITE: usize = 7;
pub const CH_HDD_BYTES_READ: usize = 8;
pub const CH_HDD_BYTES_WRITE: usize = 9;
pub const CH_DATA_OPS_READ: usize = 10;
pub const CH_DATA_OPS_WRITE: usize = 11;
pub const CH_DATA_BYTES_READ: usize = 12;
pub const CH_DATA_BYTES_WRITE: usize = 13;
pub const CH_HL_OPS_READ: usize = 14;
pub const CH_HL_OPS_WRITE: usize = 15;
pub const CH_REPLICATIONS: usize = 16;
pub const CH_READ_TIME_US: usize = 17;
pub const CH_WRITE_TIME_US: usize = 18;
pub const CH_CHUNK_COUNT: usize = 19;
pub const CH_USED_SPACE: usize = 20;
pub const CH_TOTAL_SPACE: usize = 21;
pub const CH_JOBS_QUEUED: usize = 22;
pub const CH_CONNECTIONS: usize = 23;

pub type Sample = [u64; SERIES];

pub struct Charts {
    /// `SERIES * RANGES * POINTS`, ring per `(series, range)`.
    data: Vec<u64>,
    /// Next write position of each range's ring.
    pos: [u32; RANGES],
    /// Samples folded into the pending point of ranges 1..
    ticks: [u32; RANGES],
    /// Pending sums for ranges 1.., `SERIES` values each.
    accum: Vec<u64>,
}

impl Default for Charts {
    fn default() -> Self {
        Charts {
            data: vec![0; SERIES * RANGES * POINTS],
            pos: [0; RANGES],
            ticks: [0; RANGES],
            accum: vec![0; SERIES * RANGES],
        }
    }
}

impl Charts {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(series: usize, range: usize, point: usize) -> usize {
        (series * RANGES + range) * POINTS + point
    }

    /// Fold one per-minute sample into every range.
    pub fn add_sample(&mut self, sample: &Sample) {
        for range in 0..RANGES {
            for (series, &value) in sample.iter().enumerate() {
                self.accum[series * RANGES + range] += value;
            }
            self.ticks[range] += 1;
            if self.ticks[range] == RANGE_FACTOR[range] {
                let point = self.pos[range] as usize;
                for series in 0..SERIES {
                    let sum = std::mem::take(&mut self.accum[series * RANGES + range]);
                    self.data[Self::slot(series, range, point)] =
                        sum / RANGE_FACTOR[range] as u64;
                }
                self.pos[range] = (self.pos[range] + 1) % POINTS as u32;
                self.ticks[range] = 0;
            }
        }
    }

    /// The most recently completed point of a series in a range.
    pub fn latest(&self, series: usize, range: usize) -> u64 {
        let point = (self.pos[range] as usize + POINTS - 1) % POINTS;
        self.data[Self::slot(series, range, point)]
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let mut out = Vec::with_capacity(8 + 4 * 4 + self.data.len() * 8);
        out.extend_from_slice(STATS_MAGIC);
        out.extend_from_slice(&STATS_VERSION.to_le_bytes());
        out.extend_from_slice(&(SERIES as u32).to_le_bytes());
        out.extend_from_slice(&(RANGES as u32).to_le_bytes());
        out.extend_from_slice(&(POINTS as u32).to_le_bytes());
        for range in 0..RANGES {
            out.extend_from_slice(&self.pos[range].to_le_bytes());
            out.extend_from_slice(&self.ticks[range].to_le_bytes());
        }
        for value in &self.accum {
            out.extend_from_slice(&value.to_le_bytes());
        }
        for value in &self.data {
            out.extend_from_slice(&value.to_le_bytes());
        }
        let tmp = path.with_extension("mfs.tmp");
        std::fs::File::create(&tmp)
            .and_then(|mut file| file.write_all(&out))
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|err| format_err!("unable to write stats file {:?} - {}", path, err))
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut file = std::fs::File::open(path)
            .map_err(|err| format_err!("unable to open stats file {:?} - {}", path, err))?;
        let mut head = [0u8; 8 + 4 * 4];
        file.read_exact(&mut head)
            .map_err(|err| format_err!("short stats header in {:?} - {}", path, err))?;
        if &head[..8] != STATS_MAGIC {
            bail!("bad magic in stats file {:?}", path);
        }
        let word =
            |at: usize| u32::from_le_bytes(head[at..at + 4].try_into().unwrap());
        if word(8) != STATS_VERSION {
            bail!("unsupported stats file version {}", word(8));
        }
        if (word(12), word(16), word(20)) != (SERIES as u32, RANGES as u32, POINTS as u32) {
            bail!("stats file {:?} has a different geometry", path);
        }

        let mut charts = Charts::new();
        let mut word8 = [0u8; 8];
        let mut word4 = [0u8; 4];
        for range in 0..RANGES {
            file.read_exact(&mut word4)?;
            charts.pos[range] = u32::from_le_bytes(word4) % POINTS as u32;
            file.read_exact(&mut word4)?;
            charts.ticks[range] = u32::from_le_bytes(word4);
        }
        for value in charts.accum.iter_mut() {
            file.read_exact(&mut word8)?;
            *value = u64::from_le_bytes(word8);
        }
        for value in charts.data.iter_mut() {
            file.read_exact(&mut word8)?;
            *value = u64::from_le_bytes(word8);
        }
        Ok(charts)
    }

    /// Load the stats file or start fresh when it is missing or damaged.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::new();
        }
        match Self::load(path) {
            Ok(charts) => charts,
            Err(err) => {
                log::warn!("{}", err);
                Self::new()
            }
        }
    }
}
