//! The driver main loop: per seed, launch the child, drain its event
//! stream, solve flippable branches and recycle derived seeds.

use crate::{
    config::Config,
    event::{describe, Event, EventReader, GepMsg, PipeMsg, F_ADD_CONS, F_TARGET_HIT},
    launch::{InputSpec, Launcher},
    seed::{InputWriter, Seed, SeedQueue},
};
use anyhow::Context as _;
use ctwm_core::{HashMap, Label, ParserSolver};
use memmap2::Mmap;
use std::fs::{self, File};
use std::path::PathBuf;

pub const SOLVE_TIMEOUT_MS: u32 = 5000;

/// One branch observation of a run.
#[derive(Debug, Clone, Copy)]
pub struct ObservedCond {
    pub sym_id: u32,
    pub label: Label,
    pub taken: bool,
}

#[derive(Debug, Default)]
pub struct RunObservation {
    pub conds: Vec<ObservedCond>,
    pub target_hit: bool,
}

/// Observations accumulated over every run of the driver session.
#[derive(Debug, Default)]
pub struct SessionState {
    /// symSanId -> last observed label.
    pub label_of_sym: HashMap<u32, Label>,
    /// line -> (seen_true, seen_false) across target-reaching runs.
    pub line_dirs: HashMap<u32, (u32, u32)>,
    pub target_reached: bool,
}

impl SessionState {
    /// Fold one finished run in. Directions only count toward ground truth
    /// when the run reached the target; within a run the last observation
    /// of a line wins.
    pub fn absorb(&mut self, run: &RunObservation, line_of_sym: &HashMap<u32, u32>) {
        for c in &run.conds {
            if c.label != 0 {
                self.label_of_sym.insert(c.sym_id, c.label);
            }
        }
        if !run.target_hit {
            return;
        }
        self.target_reached = true;
        let mut run_dirs: HashMap<u32, bool> = HashMap::default();
        for c in &run.conds {
            if let Some(&line) = line_of_sym.get(&c.sym_id) {
                run_dirs.insert(line, c.taken);
            }
        }
        for (line, taken) in run_dirs {
            let entry = self.line_dirs.entry(line).or_insert((0, 0));
            if taken {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
    }
}

pub struct Driver<'ctx> {
    target: PathBuf,
    config: Config,
    parser: ParserSolver<'ctx>,
    pub queue: SeedQueue,
    pub writer: InputWriter,
    pub session: SessionState,
    /// symSanId -> source line, from branch metadata; empty in fuzz mode.
    line_of_sym: HashMap<u32, u32>,
}

impl<'ctx> Driver<'ctx> {
    pub fn new(
        target: PathBuf,
        config: Config,
        parser: ParserSolver<'ctx>,
        line_of_sym: HashMap<u32, u32>,
    ) -> Self {
        let queue = SeedQueue::new(config.max_seeds);
        let writer = InputWriter::new(
            config.output_dir.clone(),
            config.instance_id,
            config.session_id,
        );
        Self {
            target,
            config,
            parser,
            queue,
            writer,
            session: SessionState::default(),
            line_of_sym,
        }
    }

    pub fn parser_mut(&mut self) -> &mut ParserSolver<'ctx> {
        &mut self.parser
    }

    /// Score model traces against this session's observations. Strict value
    /// filtering is disabled first so trace solutions keep don't-care bytes.
    pub fn score_traces(
        &mut self,
        oracle: &crate::reward::RewardOracle,
        traces: &crate::reward::TracesFile,
    ) -> Vec<crate::reward::RewardRow> {
        self.parser.set_strict_value_filtering(false);
        oracle.evaluate(&mut self.parser, &self.session, traces)
    }

    /// Fuzz mode: a single run from the given seed.
    pub fn run_one(&mut self, launcher: &mut Launcher, seed: Seed) -> anyhow::Result<()> {
        self.queue.push(seed);
        if let Some(seed) = self.queue.pop() {
            self.run_seed(launcher, &seed)?;
        }
        Ok(())
    }

    /// Reward mode: explore the bounded queue until it drains or the seed
    /// budget is spent. Per-seed failures are logged and skipped.
    pub fn explore(&mut self, launcher: &mut Launcher, initial: Seed) {
        self.queue.push(initial);
        while let Some(seed) = self.queue.pop() {
            if let Err(e) = self.run_seed(launcher, &seed) {
                log::warn!("skipping seed: {:#}", e);
            }
        }
        log::info!(
            "exploration finished: {} seeds processed, target_reached={}",
            self.queue.processed(),
            self.session.target_reached
        );
    }

    fn run_seed(&mut self, launcher: &mut Launcher, seed: &Seed) -> anyhow::Result<()> {
        let temp = self
            .writer
            .write_temp_seed(&seed.bytes)
            .context("failed to write temp seed")?;
        let result = self.run_seed_inner(launcher, seed, &temp);
        launcher.destroy();
        if let Err(e) = fs::remove_file(&temp) {
            log::warn!("failed to remove temp seed {}: {}", temp.display(), e);
        }
        let run = result?;
        self.session.absorb(&run, &self.line_of_sym);
        Ok(())
    }

    fn run_seed_inner(
        &mut self,
        launcher: &mut Launcher,
        seed: &Seed,
        temp: &std::path::Path,
    ) -> anyhow::Result<RunObservation> {
        let file = File::open(temp).context("failed to open temp seed")?;
        let mmap = unsafe { Mmap::map(&file) }.context("failed to map temp seed")?;

        let temp_str = temp.display().to_string();
        if self.config.is_stdin {
            launcher.set_input(InputSpec::Stdin);
        } else {
            launcher.set_input(InputSpec::File(temp.to_path_buf()));
        }
        launcher.set_args(vec![
            self.target.display().to_string(),
            temp_str,
        ]);

        let stdin_file = if self.config.is_stdin {
            Some(File::open(temp).context("failed to reopen temp seed")?)
        } else {
            None
        };
        let reader = launcher.run(stdin_file).context("failed to launch target")?;

        self.parser
            .restart(&[&mmap[..]])
            .context("failed to restart parser")?;

        let mut events = EventReader::new(reader);
        let mut run = RunObservation::default();
        while let Some(event) = events.next_event().context("event pipe error")? {
            match event {
                Event::Cond(msg) => {
                    log::debug!("{}", describe(&msg));
                    run.conds.push(ObservedCond {
                        sym_id: msg.id,
                        label: msg.label,
                        taken: msg.result != 0,
                    });
                    if msg.label != 0 {
                        self.solve_cond(&msg, seed);
                    }
                }
                Event::Gep(msg, gep) => {
                    log::debug!("{}", describe(&msg));
                    self.solve_gep(&gep, seed);
                }
                Event::Memcmp(msg, content) => {
                    log::debug!("{}", describe(&msg));
                    self.parser.record_memcmp(msg.label, &content);
                }
                Event::Fsize(msg) => {
                    log::debug!("{}", describe(&msg));
                }
                Event::MemErr(msg) => {
                    log::info!("memory error reported: {}", describe(&msg));
                    if msg.flags & F_TARGET_HIT != 0 {
                        run.target_hit = true;
                    }
                }
            }
        }

        if let Some(code) = launcher.reap() {
            log::debug!("child exited with code {}", code);
        }
        Ok(run)
    }

    fn solve_cond(&mut self, msg: &PipeMsg, seed: &Seed) {
        let add_nested = msg.flags & F_ADD_CONS != 0;
        let tasks = match self
            .parser
            .parse_cond(msg.label, msg.result as u8, add_nested)
        {
            Ok(tasks) => tasks,
            Err(e) => {
                log::warn!("failed to parse condition {}: {}", msg.label, e);
                return;
            }
        };
        self.solve_tasks(&tasks, seed);
    }

    fn solve_gep(&mut self, gep: &GepMsg, seed: &Seed) {
        let tasks = match self.parser.parse_gep(
            gep.ptr_label,
            gep.ptr,
            gep.index_label,
            gep.index,
            gep.num_elems,
            gep.elem_size,
            gep.current_offset,
            true,
        ) {
            Ok(tasks) => tasks,
            Err(e) => {
                log::warn!("failed to parse gep {}: {}", gep.index_label, e);
                return;
            }
        };
        self.solve_tasks(&tasks, seed);
    }

    fn solve_tasks(&mut self, tasks: &[ctwm_core::TaskId], seed: &Seed) {
        for &task in tasks {
            let (status, solution) = match self.parser.solve_task(task, SOLVE_TIMEOUT_MS) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("solve failed: {}", e);
                    continue;
                }
            };
            if solution.is_empty() {
                log::debug!("task {} not solvable ({:?})", task, status);
                continue;
            }

            let parent = match self.writer.write_solution(&seed.bytes, &solution) {
                Ok((_, index)) => Some(index),
                Err(e) => {
                    log::warn!("failed to write generated input: {}", e);
                    None
                }
            };
            self.queue.push(seed.derive(&solution, parent));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_tracks_labels_and_directions() {
        let mut line_of_sym = HashMap::default();
        line_of_sym.insert(3, 10);
        line_of_sym.insert(4, 20);

        let mut session = SessionState::default();
        let run = RunObservation {
            conds: vec![
                ObservedCond {
                    sym_id: 3,
                    label: 7,
                    taken: true,
                },
                ObservedCond {
                    sym_id: 4,
                    label: 8,
                    taken: false,
                },
                // same line again, last write wins within the run
                ObservedCond {
                    sym_id: 4,
                    label: 9,
                    taken: true,
                },
            ],
            target_hit: true,
        };
        session.absorb(&run, &line_of_sym);

        assert!(session.target_reached);
        assert_eq!(session.label_of_sym.get(&4), Some(&9));
        assert_eq!(session.line_dirs.get(&10), Some(&(1, 0)));
        assert_eq!(session.line_dirs.get(&20), Some(&(1, 0)));
    }

    #[test]
    fn non_target_runs_do_not_enter_ground_truth() {
        let mut line_of_sym = HashMap::default();
        line_of_sym.insert(3, 10);

        let mut session = SessionState::default();
        let run = RunObservation {
            conds: vec![ObservedCond {
                sym_id: 3,
                label: 7,
                taken: true,
            }],
            target_hit: false,
        };
        session.absorb(&run, &line_of_sym);

        assert!(!session.target_reached);
        assert!(session.line_dirs.is_empty());
        // labels are still recorded for reward-mode trace mapping
        assert_eq!(session.label_of_sym.get(&3), Some(&7));
    }

    #[test]
    fn conflicting_runs_make_directions_non_uniform() {
        let mut line_of_sym = HashMap::default();
        line_of_sym.insert(3, 10);

        let mut session = SessionState::default();
        for taken in [true, false] {
            let run = RunObservation {
                conds: vec![ObservedCond {
                    sym_id: 3,
                    label: 7,
                    taken,
                }],
                target_hit: true,
            };
            session.absorb(&run, &line_of_sym);
        }
        assert_eq!(session.line_dirs.get(&10), Some(&(1, 1)));
    }
}
