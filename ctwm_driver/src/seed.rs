//! Bounded seed queue and materialization of solver solutions as inputs.

use ctwm_core::{InputByte, Solution};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// A candidate input with its provenance.
#[derive(Debug, Clone)]
pub struct Seed {
    pub bytes: Vec<u8>,
    /// Output index of the parent this seed was derived from.
    pub derived_from: Option<u32>,
}

impl Seed {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            derived_from: None,
        }
    }

    /// Copy of this seed with the solution's bytes overwritten. Only offsets
    /// inside the buffer apply; the on-disk file may extend further.
    pub fn derive(&self, solution: &Solution, parent_index: Option<u32>) -> Seed {
        let mut bytes = self.bytes.clone();
        for InputByte { offset, val } in solution {
            if (*offset as usize) < bytes.len() {
                bytes[*offset as usize] = *val;
            }
        }
        Seed {
            bytes,
            derived_from: parent_index,
        }
    }
}

/// FIFO of pending seeds under the budget
/// `seeds_processed + pending <= max_seeds`.
pub struct SeedQueue {
    queue: VecDeque<Seed>,
    processed: usize,
    max_seeds: usize,
}

impl SeedQueue {
    pub fn new(max_seeds: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            processed: 0,
            max_seeds,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Enqueue unless the budget is exhausted; over-budget pushes are no-ops.
    pub fn push(&mut self, seed: Seed) -> bool {
        if self.processed + self.queue.len() >= self.max_seeds {
            log::debug!(
                "seed budget exhausted ({} processed, {} pending), dropping",
                self.processed,
                self.queue.len()
            );
            return false;
        }
        self.queue.push_back(seed);
        true
    }

    /// Pop the next seed and account it as processed.
    pub fn pop(&mut self) -> Option<Seed> {
        let seed = self.queue.pop_front()?;
        self.processed += 1;
        Some(seed)
    }
}

/// Writes generated inputs as `id-{instance}-{session}-{index}`; the index
/// counter is shared with intra-driver temp seed files.
pub struct InputWriter {
    dir: PathBuf,
    instance_id: u32,
    session_id: u32,
    next_index: u32,
}

impl InputWriter {
    pub fn new(dir: impl Into<PathBuf>, instance_id: u32, session_id: u32) -> Self {
        Self {
            dir: dir.into(),
            instance_id,
            session_id,
            next_index: 0,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.dir
    }

    fn bump(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Write the original input with the solution applied on top: the full
    /// original bytes first, then per-offset in-place overwrites (offsets
    /// past the end extend the file).
    pub fn write_solution(
        &mut self,
        original: &[u8],
        solution: &Solution,
    ) -> Result<(PathBuf, u32), std::io::Error> {
        let index = self.bump();
        let path = self.dir.join(format!(
            "id-{}-{}-{}",
            self.instance_id, self.session_id, index
        ));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(original)?;
        for InputByte { offset, val } in solution {
            file.seek(SeekFrom::Start(*offset as u64))?;
            file.write_all(&[*val])?;
        }
        log::debug!("generated input #{} at {}", index, path.display());
        Ok((path, index))
    }

    /// Write a seed to a temp path for the next run.
    pub fn write_temp_seed(&mut self, bytes: &[u8]) -> Result<PathBuf, std::io::Error> {
        let index = self.bump();
        let path = self.dir.join(format!(
            "seed-{}-{}-{}",
            self.instance_id, self.session_id, index
        ));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(bytes)?;
        Ok(path)
    }
}
