//! Headless Demo: drive a run from a script instead of a keyboard.
//!
//! Runs an epidemic model in safe mode, steering it through console
//! commands while printing lifecycle events, then replays the same seed
//! as an optimal-mode batch.

use clap::Parser;
use lockstep::{
    Accessors, Command, Engine, EngineConfig, Experiment, Mode, SchedulerEvent, SimRng, Value,
};
use rand::Rng;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "headless", about = "Scripted lockstep run without a renderer")]
struct Args {
    /// Seed for both runs
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Iterations per second for the scripted run
    #[arg(long, default_value_t = 200.0)]
    speed: f64,

    /// Population size
    #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u32).range(1..))]
    population: u32,
}

/// Susceptible/infected/recovered counts with per-contact chances.
struct Epidemic {
    population: u32,
    infected: u32,
    recovered: u32,
    infection: f64,
    recovery: f64,
}

impl Epidemic {
    const fn susceptible(&self) -> u32 {
        self.population
            .saturating_sub(self.infected)
            .saturating_sub(self.recovered)
    }
}

impl Experiment for Epidemic {
    fn initialize(&mut self, _rng: &mut SimRng) {
        self.infected = 1;
        self.recovered = 0;
    }

    fn iterate(&mut self, rng: &mut SimRng) {
        let pressure = f64::from(self.infected) / f64::from(self.population);
        let newly_infected = (0..self.susceptible())
            .filter(|_| rng.gen::<f64>() < self.infection * pressure)
            .count();
        let newly_recovered = (0..self.infected)
            .filter(|_| rng.gen::<f64>() < self.recovery)
            .count();
        let newly_infected = u32::try_from(newly_infected).unwrap_or(u32::MAX);
        let newly_recovered = u32::try_from(newly_recovered).unwrap_or(u32::MAX);
        self.infected = self.infected + newly_infected - newly_recovered;
        self.recovered += newly_recovered;
    }

    fn is_finished(&self) -> bool {
        self.infected == 0
    }
}

fn accessors() -> Accessors<Epidemic> {
    let mut accessors = Accessors::new();
    accessors
        .register("sir", "infection", |e: &Epidemic| e.infection, |e, v| e.infection = v)
        .register("sir", "recovery", |e: &Epidemic| e.recovery, |e, v| e.recovery = v)
        .register_read_only("sir", "infected", |e: &Epidemic| e.infected)
        .register_read_only("sir", "recovered", |e: &Epidemic| e.recovered);
    accessors
}

fn epidemic(population: u32) -> Epidemic {
    Epidemic {
        population,
        infected: 1,
        recovered: 0,
        infection: 0.3,
        recovery: 0.1,
    }
}

fn main() -> lockstep::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::default()
        .with_title("sir")
        .with_mode(Mode::Safe)
        .with_seed(args.seed)
        .with_speed(args.speed)
        .with_watchdog(Duration::from_secs(1));
    let mut engine = Engine::with_accessors(epidemic(args.population), accessors(), config)?;
    let handle = engine.handle();
    let events = handle.events();
    handle.track("sir", "infected")?;

    let printer = thread::spawn(move || {
        for event in events.iter() {
            println!("event: {event:?}");
            if matches!(event, SchedulerEvent::Stopped { .. } | SchedulerEvent::Faulted { .. }) {
                break;
            }
        }
    });

    engine.start()?;
    let send = |command| {
        if let Err(e) = engine.send(command) {
            warn!(error = %e, "command not delivered");
        }
        thread::sleep(Duration::from_millis(250));
    };

    send(Command::Pause);
    info!(infected = %handle.safe_get("sir", "infected")?, "paused");
    send(Command::Set {
        target: "sir".into(),
        attribute: "infection".into(),
        value: Value::Float(0.6),
    });
    send(Command::Resume);
    send(Command::Reset { reseed: true });
    send(Command::ScaleSpeed(2.0));
    send(Command::Kill);
    engine.wait()?;
    let _ = printer.join();

    let state = handle.state();
    println!(
        "scripted run: {} cycles, {} iterations, final seed {}",
        state.cycle, state.total_iterations, state.seed
    );

    let batch = EngineConfig::default()
        .with_mode(Mode::Optimal)
        .with_seed(args.seed)
        .with_max_iterations(10_000);
    let mut engine = Engine::with_accessors(epidemic(args.population), accessors(), batch)?;
    if let Some(report) = engine.run()? {
        let recovered = engine.handle().safe_get("sir", "recovered")?;
        println!(
            "batch run: outbreak over after {} iterations ({:?}), {recovered} recovered",
            report.iterations, report.elapsed
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_population_rejected() {
        assert!(Args::try_parse_from(["headless", "--population", "0"]).is_err());
        let args = Args::try_parse_from(["headless", "--population", "1"]).unwrap();
        assert_eq!(args.population, 1);
    }

    #[test]
    fn test_susceptible_never_underflows() {
        let mut rng = <SimRng as rand::SeedableRng>::seed_from_u64(1);
        let mut epidemic = epidemic(1);
        epidemic.initialize(&mut rng);
        epidemic.recovered = 1;
        assert_eq!(epidemic.susceptible(), 0);
    }
}
