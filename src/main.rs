use std::path::PathBuf;
use std::process::ExitCode;

use spikegen::experiments::{lif_network, LifParams};
use spikegen::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug)]
struct Args {
    config: SimulationConfig,
    out: PathBuf,
    json: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spikegen=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    if raw.iter().any(|a| a == "--help" || a == "-h" || a == "help") {
        print_help();
        return ExitCode::SUCCESS;
    }
    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            print_help();
            return ExitCode::from(2);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), SimError> {
    let mut sim = lif_network(args.config, &LifParams::default())?;
    let mut last_decile = 0;
    sim.on_progress(move |p| {
        let decile = (p.fraction() * 10.0) as u32;
        if decile > last_decile {
            last_decile = decile;
            println!("{:>3}%  {}", decile * 10, p.status_text);
        }
    });

    sim.setup()?;
    sim.run()?;

    for log in sim.monitors().spike_logs() {
        println!("{:<12} spikes={}", log.name, log.num_spikes());
    }
    println!(
        "tier={:?} steps={} runtime={:.3}s",
        sim.effective_tier(),
        sim.steps_executed(),
        sim.runtime().as_secs_f64()
    );

    sim.export_monitors(&mut TextExporter::new(&args.out))?;
    println!("monitors written to {}", args.out.display());

    if let Some(path) = args.json {
        export_json(&sim, &path)?;
        println!("snapshot written to {}", path.display());
    }
    Ok(())
}

#[cfg(feature = "serde")]
fn export_json(sim: &Simulation, path: &std::path::Path) -> Result<(), SimError> {
    let file = std::fs::File::create(path).map_err(ExportError::from)?;
    let mut exporter = JsonExporter::new(std::io::BufWriter::new(file)).pretty();
    sim.export_monitors(&mut exporter)?;
    Ok(())
}

#[cfg(not(feature = "serde"))]
fn export_json(_sim: &Simulation, _path: &std::path::Path) -> Result<(), SimError> {
    tracing::warn!("JSON export needs the `serde` feature; skipping");
    Ok(())
}

fn parse_args(raw: &[String]) -> Result<Args, String> {
    let mut config = SimulationConfig::new(1e-4, 0.1)
        .with_description("LIF demo: 1000 + 10 neurons, random synapses")
        .with_env_overrides();
    let mut out = PathBuf::from("results");
    let mut json = None;

    let mut it = raw.iter();
    while let Some(flag) = it.next() {
        let mut value = || {
            it.next()
                .ok_or_else(|| format!("missing value for {flag}"))
        };
        match flag.as_str() {
            "--duration" => config.duration = parse_num(flag, value()?)?,
            "--dt" => config.dt = parse_num(flag, value()?)?,
            "--seed" => config.seed = parse_num(flag, value()?)?,
            "--tier" => {
                let v = value()?;
                config.tier =
                    ExecutionTier::parse(v).ok_or_else(|| format!("unknown tier: {v}"))?;
            }
            "--out" => out = PathBuf::from(value()?),
            "--json" => json = Some(PathBuf::from(value()?)),
            other => return Err(format!("Unknown argument: {other}")),
        }
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(Args { config, out, json })
}

fn parse_num<T: std::str::FromStr>(flag: &str, v: &str) -> Result<T, String> {
    v.parse()
        .map_err(|_| format!("invalid value for {flag}: {v}"))
}

fn print_help() {
    println!("spikegen (LIF demo network)");
    println!("usage:");
    println!("  cargo run -- [options]");
    println!("options:");
    println!("  --duration <s>   run horizon in seconds (default 0.1)");
    println!("  --dt <s>         step size in seconds (default 1e-4)");
    println!("  --seed <n>       random seed");
    println!("  --tier <name>    scalar | parallel | gpu");
    println!("  --out <dir>      text monitor output directory (default results)");
    println!("  --json <file>    also write a JSON snapshot");
    println!("  --help           show this message");
    println!("environment:");
    println!("  SPIKEGEN_EXEC_TIER, SPIKEGEN_SEED, RUST_LOG");
}
