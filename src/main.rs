use std::env;
use std::process;

use serde::Serialize;

use tokensnap::protocol::{ServerId, SnapshotId, SnapshotState};
use tokensnap::sim::{CheckResult, Checker, Script, SimConfig, SimError, Simulator, Topology};

const DEMO_TOPOLOGY: &str = "\
3
A 10
B 0
C 0
A B
B C
C A
";

const DEMO_EVENTS: &str = "\
send A B 3
snapshot A
tick 2
";

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(2);
    }

    let result = match args[1].as_str() {
        "run" => parse_run_args(&args[2..]).and_then(|opts| {
            let topology = Topology::load(&opts.topology).map_err(|e| e.to_string())?;
            let script = Script::load(&opts.events).map_err(|e| e.to_string())?;
            Ok(run(&topology, &script, &opts))
        }),
        "demo" => {
            let opts = RunOptions::default();
            let topology = Topology::parse(DEMO_TOPOLOGY).map_err(|e| e.to_string());
            let script = Script::parse(DEMO_EVENTS).map_err(|e| e.to_string());
            topology.and_then(|t| script.map(|s| run(&t, &s, &opts)))
        }
        _ => {
            print_usage();
            process::exit(2);
        }
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(message) => {
            eprintln!("error: {}", message);
            print_usage();
            process::exit(2);
        }
    }
}

fn print_usage() {
    eprintln!("Usage: tokensnap <command>");
    eprintln!("Commands:");
    eprintln!("  run <topology> <events> [options]  - Play an event script and check every snapshot");
    eprintln!("  demo                               - Run the built-in three-server ring");
    eprintln!("Options:");
    eprintln!("  --seed N       Seed for delivery jitter");
    eprintln!("  --max-delay N  Upper bound on extra transit ticks");
    eprintln!("  --max-ticks N  Tick budget per snapshot");
    eprintln!("  --json         Print the report as JSON");
    eprintln!("  --log          Print the event log");
}

#[derive(Debug, Default)]
struct RunOptions {
    topology: String,
    events: String,
    config: SimConfig,
    json: bool,
    log: bool,
}

fn parse_run_args(args: &[String]) -> Result<RunOptions, String> {
    let mut opts = RunOptions::default();
    let mut positional = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--seed" => opts.config.seed = flag_value(arg, iter.next())?,
            "--max-delay" => opts.config.max_delay = flag_value(arg, iter.next())?,
            "--max-ticks" => opts.config.max_ticks = flag_value(arg, iter.next())?,
            "--json" => opts.json = true,
            "--log" => opts.log = true,
            flag if flag.starts_with("--") => return Err(format!("unknown option {}", flag)),
            _ => positional.push(arg.clone()),
        }
    }

    match <[String; 2]>::try_from(positional) {
        Ok([topology, events]) => {
            opts.topology = topology;
            opts.events = events;
            Ok(opts)
        }
        Err(found) => Err(format!(
            "run expects a topology file and an events file, got {} arguments",
            found.len()
        )),
    }
}

fn flag_value(flag: &str, value: Option<&String>) -> Result<u64, String> {
    let value = value.ok_or_else(|| format!("{} needs a value", flag))?;
    value
        .parse()
        .map_err(|_| format!("{} expects a number, got `{}`", flag, value))
}

#[derive(Debug, Serialize)]
struct RunReport {
    seed: u64,
    ticks: u64,
    total_tokens: u64,
    expected_tokens: u64,
    error: Option<String>,
    snapshots: Vec<SnapshotReport>,
    violations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SnapshotReport {
    snapshot_id: SnapshotId,
    complete: bool,
    servers: Vec<SnapshotState>,
}

/// Play `script` over `topology` and print the report. Returns whether the
/// run finished cleanly with every check passing.
fn run(topology: &Topology, script: &Script, opts: &RunOptions) -> bool {
    let mut sim = match Simulator::from_topology(topology, opts.config.clone()) {
        Ok(sim) => sim,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            return false;
        }
    };
    let checker = Checker::for_topology(topology);

    let error = sim.run_script(script).err();
    let servers = sim.servers();

    let mut checks: Vec<CheckResult> = vec![
        checker.verify_live(&servers),
        checker.verify_completions(&sim.duplicate_completions()),
    ];
    let mut snapshots = Vec::new();
    for &snapshot_id in sim.started_snapshots() {
        checks.push(checker.verify_snapshot(snapshot_id, &servers));
        snapshots.push(SnapshotReport {
            snapshot_id,
            complete: sim.is_snapshot_complete(snapshot_id),
            servers: servers
                .iter()
                .filter_map(|s| s.snapshot(snapshot_id))
                .collect(),
        });
    }

    let report = RunReport {
        seed: opts.config.seed,
        ticks: sim.time(),
        total_tokens: sim.total_tokens(),
        expected_tokens: checker.expected_total(),
        error: error.as_ref().map(SimError::to_string),
        snapshots,
        violations: checks
            .iter()
            .flat_map(|c| c.violations.iter().map(|v| v.description.clone()))
            .collect(),
    };

    if opts.log {
        print!("{}", sim.log().render());
    }
    if opts.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("FATAL: failed to encode report: {}", e);
                return false;
            }
        }
    } else {
        print_report(&report, &servers_in(&sim));
    }

    report.error.is_none() && report.violations.is_empty()
}

fn servers_in(sim: &Simulator) -> Vec<(ServerId, u64)> {
    sim.servers()
        .iter()
        .map(|s| (s.id().clone(), s.tokens()))
        .collect()
}

fn print_report(report: &RunReport, balances: &[(ServerId, u64)]) {
    println!("Seed: {}", report.seed);
    println!("Ticks: {}", report.ticks);
    println!("Tokens: {} (expected {})", report.total_tokens, report.expected_tokens);
    for (id, tokens) in balances {
        println!("  {}: {}", id, tokens);
    }

    for snapshot in &report.snapshots {
        let status = if snapshot.complete { "complete" } else { "INCOMPLETE" };
        println!("Snapshot {} ({})", snapshot.snapshot_id, status);
        for state in &snapshot.servers {
            for (server, tokens) in &state.tokens {
                println!("  {} holds {}", server, tokens);
            }
            for message in &state.messages {
                println!("  in flight {}", message);
            }
        }
        let total: u64 = snapshot.servers.iter().map(|s| s.total_tokens()).sum();
        println!("  total {}", total);
    }

    if let Some(error) = &report.error {
        println!("Run stopped: {}", error);
    }
    if report.violations.is_empty() {
        println!("All checks passed.");
    } else {
        println!("VIOLATIONS:");
        for violation in &report.violations {
            println!("  {}", violation);
        }
    }
}
