//! Random Walk Demo: a row of walkers drawn live in the terminal.
//!
//! Keys: space/p pause, r reset, R reseed, f frame-sync, +/- speed, q quit.
//!
//! Logs go to stderr; redirect them (`2>walk.log`) to keep the screen clean.

use clap::Parser;
use crossterm::{
    cursor, execute, queue,
    style::Print,
    terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
};
use lockstep::{
    Accessors, Command, Engine, EngineConfig, Experiment, Frame, Mode, SchedulerError, SimRng,
    View,
};
use rand::Rng;
use std::io::{self, Stdout, Write};
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line options.
#[derive(Parser, Debug)]
#[command(name = "random_walk", about = "Random walkers under the lockstep scheduler")]
struct Args {
    /// Initial seed (random if omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Iterations per second when frame-sync is off
    #[arg(long, default_value_t = 30.0)]
    speed: f64,

    /// Renderer frames per second
    #[arg(long, default_value_t = 30.0)]
    fps: f64,

    /// visual, safe, optimal or unsafe
    #[arg(long, default_value = "visual")]
    mode: Mode,

    /// Start with frame-sync off
    #[arg(long)]
    no_frame_sync: bool,

    /// Number of walkers
    #[arg(long, default_value_t = 8)]
    walkers: usize,

    /// Quit after this many seconds
    #[arg(long)]
    duration: Option<f64>,

    /// Iteration bound for optimal mode
    #[arg(long, default_value_t = 10_000)]
    max_iterations: u64,
}

/// Walkers on a bounded line.
struct RandomWalk {
    positions: Vec<i64>,
    bound: i64,
    step: i64,
}

impl RandomWalk {
    fn new(walkers: usize, bound: i64) -> Self {
        Self {
            positions: vec![0; walkers],
            bound,
            step: 1,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn mean(&self) -> f64 {
        if self.positions.is_empty() {
            return 0.0;
        }
        self.positions.iter().sum::<i64>() as f64 / self.positions.len() as f64
    }

    fn spread(&self) -> i64 {
        let max = self.positions.iter().max().copied().unwrap_or(0);
        let min = self.positions.iter().min().copied().unwrap_or(0);
        max - min
    }
}

impl Experiment for RandomWalk {
    fn initialize(&mut self, _rng: &mut SimRng) {
        self.positions.iter_mut().for_each(|p| *p = 0);
    }

    fn iterate(&mut self, rng: &mut SimRng) {
        for p in &mut self.positions {
            let delta = if rng.gen::<bool>() { self.step } else { -self.step };
            *p = (*p + delta).clamp(-self.bound, self.bound);
        }
    }
}

fn accessors() -> Accessors<RandomWalk> {
    let mut accessors = Accessors::new();
    accessors
        .register("walk", "step", |w: &RandomWalk| w.step, |w, v: i64| w.step = v.max(1))
        .register_read_only("walk", "mean", RandomWalk::mean)
        .register_read_only("walk", "spread", RandomWalk::spread);
    accessors
}

/// Raw mode plus alternate screen, restored on drop.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen, cursor::Hide)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = execute!(io::stdout(), cursor::Show, LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}

/// Draws one row per walker.
struct TerminalView {
    title: String,
    stdout: Stdout,
    bound: i64,
}

impl TerminalView {
    fn column(&self, position: i64, width: u16) -> u16 {
        let span = (2 * self.bound).max(1);
        let usable = i64::from(width.saturating_sub(2));
        let col = (position + self.bound) * usable / span;
        u16::try_from(col.clamp(0, usable)).unwrap_or(0) + 1
    }
}

impl View<RandomWalk> for TerminalView {
    fn render(&mut self, frame: &Frame<'_, RandomWalk>) -> io::Result<()> {
        let (width, height) = terminal::size()?;
        let walk = frame.experiment();
        let mean_samples = frame
            .tracker()
            .history("walk", "mean")
            .map_or(0, std::collections::VecDeque::len);

        queue!(self.stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
        queue!(
            self.stdout,
            Print(format!(
                "{}  cycle {}  iteration {}  {}",
                self.title,
                frame.cycle(),
                frame.iteration(),
                if frame.is_synced() { "synced" } else { "free" },
            ))
        )?;

        for (row, position) in walk.positions.iter().enumerate() {
            let Ok(y) = u16::try_from(row + 2) else { break };
            if y + 2 >= height {
                break;
            }
            let x = self.column(*position, width);
            queue!(self.stdout, cursor::MoveTo(x, y), Print('o'))?;
        }

        queue!(
            self.stdout,
            cursor::MoveTo(0, height.saturating_sub(1)),
            Print(format!(
                "mean {:+.2}  spread {}  samples {}  | space pause  r reset  R reseed  f sync  +/- speed  q quit",
                walk.mean(),
                walk.spread(),
                mean_samples,
            ))
        )?;
        self.stdout.flush()
    }

    fn reset(&mut self, _frame: &Frame<'_, RandomWalk>) -> io::Result<()> {
        queue!(self.stdout, Clear(ClearType::All))?;
        self.stdout.flush()
    }
}

fn main() -> lockstep::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let bound = 40;
    let mut config = EngineConfig::default()
        .with_title("random walk")
        .with_mode(args.mode)
        .with_speed(args.speed)
        .with_fps(args.fps)
        .with_frame_sync(!args.no_frame_sync)
        .with_max_iterations(args.max_iterations);
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }

    let experiment = RandomWalk::new(args.walkers, bound);

    if args.mode == Mode::Optimal {
        let mut engine = Engine::with_accessors(experiment, accessors(), config)?;
        if let Some(report) = engine.run()? {
            let mean = engine.handle().safe_get("walk", "mean")?;
            println!(
                "{} iterations in {:?} (seed {}), final mean {mean}",
                report.iterations, report.elapsed, report.seed
            );
        }
        return Ok(());
    }

    let draws = args.mode.components().contains(lockstep::Components::RENDERER);
    let config = config.with_keyboard(draws);
    let mut engine = Engine::with_accessors(experiment, accessors(), config)?;
    engine.handle().track("walk", "mean")?;

    let guard = if draws {
        let view = TerminalView {
            title: engine.config().title.clone(),
            stdout: io::stdout(),
            bound,
        };
        engine = engine.with_view(view);
        Some(TerminalGuard::enter().map_err(SchedulerError::Terminal)?)
    } else {
        None
    };

    // Without a keyboard the run ends on its own
    let duration = args.duration.or(if draws { None } else { Some(5.0) });
    if let Some(secs) = duration {
        let commands = engine.commands();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs_f64(secs.max(0.0)));
            let _ = commands.send(Command::Kill);
        });
    }

    engine.start()?;
    let handle = engine.handle();
    engine.wait()?;

    drop(guard);
    let state = handle.state();
    info!(
        cycle = state.cycle,
        iteration = state.iteration,
        total = state.total_iterations,
        seed = state.seed,
        "run finished"
    );
    Ok(())
}
