//! Teleoperation console
//!
//! Usage: bambot-teleop [OPTIONS]
//!
//! Options:
//!   --robot <name>        Robot preset (default: so-arm100)
//!   --layout <name>       Keyboard layout: default or wasd
//!   --follower <port>     Follower arm port, or "sim" for a virtual bus
//!   --leader <port>       Leader arm port, or "sim" for a virtual bus
//!   --config <file>       Settings file (created on first save)
//!   --replay <file>       Replay a recorded dataset JSON file
//!   --record <dir>        Record the session into a dataset directory
//!   --keys <sequence>     Key sequence to play at start, e.g. "q:1000,w:500+200"
//!   --list-ports          List serial ports and exit
//!
//! Lines typed on stdin are played as key sequences.
//!
//! Examples:
//!   bambot-teleop --follower /dev/ttyACM0 --leader /dev/ttyACM1
//!   bambot-teleop --robot bambot-b0 --follower sim --keys "q:1000,w:500"

use anyhow::Result;
use bambot::bus::sim::VirtualServoBus;
use bambot::dataset::{Dataset, DatasetStore, JsonDirStore};
use bambot::input::key_sequence::{parse_sequence, KeyStep, StepResult};
use bambot::{
    robots, ConfigStore, JsonFileConfigStore, LinkRole, MemoryConfigStore, PortRequest,
    RobotLink, SerialProvider, ServoId, SimProvider, Teleop, TeleopConfig, TransportProvider,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Args {
    robot: String,
    layout: String,
    follower: Option<String>,
    leader: Option<String>,
    config: Option<PathBuf>,
    replay: Option<PathBuf>,
    record: Option<PathBuf>,
    keys: Option<Vec<KeyStep>>,
    list_ports: bool,
}

fn parse_args() -> Option<Args> {
    let args: Vec<String> = env::args().collect();

    let mut parsed = Args {
        robot: "so-arm100".to_string(),
        layout: "default".to_string(),
        follower: None,
        leader: None,
        config: None,
        replay: None,
        record: None,
        keys: None,
        list_ports: false,
    };
    let mut i = 1;

    while i < args.len() {
        let arg = args[i].as_str();

        match arg {
            "--help" | "-h" => return None,
            "--list-ports" => {
                parsed.list_ports = true;
                i += 1;
                continue;
            }
            "--robot" | "--layout" | "--follower" | "--leader" | "--config" | "--replay"
            | "--record" | "--keys" => {}
            other => {
                eprintln!("Error: unknown argument {}", other);
                return None;
            }
        }

        let Some(value) = args.get(i + 1).cloned() else {
            eprintln!("Error: {} requires an argument", arg);
            return None;
        };
        match arg {
            "--robot" => parsed.robot = value,
            "--layout" => parsed.layout = value,
            "--follower" => parsed.follower = Some(value),
            "--leader" => parsed.leader = Some(value),
            "--config" => parsed.config = Some(PathBuf::from(value)),
            "--replay" => parsed.replay = Some(PathBuf::from(value)),
            "--record" => parsed.record = Some(PathBuf::from(value)),
            _ => match parse_sequence(&value) {
                Ok(steps) => parsed.keys = Some(steps),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return None;
                }
            },
        }
        i += 2;
    }

    Some(parsed)
}

fn print_ports() {
    match bambot::list_ports() {
        Ok(ports) => {
            if ports.is_empty() {
                println!("  (none found)");
            } else {
                for port in ports {
                    println!("  {} - {:?}", port.name, port.port_type);
                }
            }
        }
        Err(e) => println!("  Error listing ports: {}", e),
    }
}

fn print_usage() {
    println!("Usage: bambot-teleop [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --robot <name>        Robot preset (default: so-arm100)");
    println!("  --layout <name>       Keyboard layout: default or wasd");
    println!("  --follower <port>     Follower arm port, or \"sim\" for a virtual bus");
    println!("  --leader <port>       Leader arm port, or \"sim\" for a virtual bus");
    println!("  --config <file>       Settings file (created on first save)");
    println!("  --replay <file>       Replay a recorded dataset JSON file");
    println!("  --record <dir>        Record the session into a dataset directory");
    println!("  --keys <sequence>     Key sequence to play at start, e.g. \"q:1000,w:500+200\"");
    println!("  --list-ports          List serial ports and exit");
    println!();
    println!("Robots: {}", robots::PRESETS.join(", "));
    println!("Layouts: {}", robots::LAYOUTS.join(", "));
    println!();
    println!("Available ports:");
    print_ports();
}

async fn open_link(
    role: LinkRole,
    port: &str,
    config: &TeleopConfig,
    ids: &[ServoId],
) -> Result<Arc<RobotLink>> {
    let provider: Arc<dyn TransportProvider> = if port == "sim" {
        Arc::new(SimProvider::new(VirtualServoBus::new(
            config.bus.family,
            ids.iter().copied(),
        )))
    } else {
        Arc::new(SerialProvider::new())
    };
    let link = Arc::new(RobotLink::new(role, provider, config.bus.clone(), ids.to_vec()));
    link.connect(&PortRequest::path(port, config.bus.baud_rate)).await?;
    tracing::info!("{} on {} ({} servos)", role, port, ids.len());
    Ok(link)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bambot=info".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let args = match parse_args() {
        Some(a) => a,
        None => {
            print_usage();
            return Ok(());
        }
    };
    if args.list_ports {
        print_ports();
        return Ok(());
    }

    let store: Box<dyn ConfigStore> = match &args.config {
        Some(path) => Box::new(JsonFileConfigStore::open(path)?),
        None => Box::new(MemoryConfigStore::new()),
    };
    let config = TeleopConfig::load(store.as_ref())?;
    if args.config.is_some() && store.get(bambot::config::TELEOP_KEY).is_none() {
        config.save(store.as_ref())?;
    }

    let robot = robots::preset(&args.robot)?.with_layout(&args.layout)?;
    let mut teleop = Teleop::new(&robot, config.clone())?;
    let ids: Vec<ServoId> = teleop.registry().all().iter().map(|j| j.servo_id).collect();
    let cancel = CancellationToken::new();

    let follower = match &args.follower {
        Some(port) => Some(open_link(LinkRole::Follower, port, &config, &ids).await?),
        None => None,
    };
    let leader = match &args.leader {
        Some(port) => Some(open_link(LinkRole::Leader, port, &config, &ids).await?),
        None => None,
    };

    let mut tasks = Vec::new();

    let replay = match &args.replay {
        Some(path) => Some(serde_json::from_slice::<Dataset>(&std::fs::read(path)?)?),
        None => None,
    };
    match (&leader, &replay) {
        (Some(link), Some(_)) => {
            tracing::warn!("Replay requested, disconnecting the leader arm");
            link.disconnect().await;
        }
        (Some(link), None) => {
            let mirror = teleop.leader_mirror(link.clone());
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let polls = mirror.run(cancel).await;
                tracing::info!("Leader mirroring ended after {} polls", polls);
            }));
        }
        _ => {}
    }
    if let Some(dataset) = replay {
        let player = teleop.replay_player();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let outcome = player.play(&dataset, &cancel).await;
            tracing::info!(
                "Replay finished: {} frames{}",
                outcome.frames_played,
                if outcome.cancelled { " (cancelled)" } else { "" }
            );
        }));
    }

    let mut player = teleop.key_sequence_player("keys");
    let initial_keys = args.keys;
    {
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Some(steps) = initial_keys {
                log_results(&player.run(&steps, &cancel).await);
            }
            let mut lines = stdin_lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.recv() => line,
                };
                let Some(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_sequence(&line) {
                    Ok(steps) => log_results(&player.run(&steps, &cancel).await),
                    Err(e) => tracing::warn!("{}", e),
                }
            }
        }));
    }

    let recorder = args.record.as_ref().map(|_| teleop.recorder());
    let handle = teleop.spawn(follower.clone(), recorder, cancel.clone());
    tracing::info!("Teleop running for {}, press Ctrl-C to stop", robot.name);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    cancel.cancel();

    for task in tasks {
        task.await?;
    }
    let recorder = handle.join().await?;

    if let (Some(dir), Some(recorder)) = (&args.record, recorder) {
        let store = JsonDirStore::open(dir)?;
        let id = store.save(&recorder.finish(&robot.name))?;
        tracing::info!("Recording saved as {}", id);
    }

    if let Some(link) = follower {
        link.disconnect().await;
    }
    if let Some(link) = leader {
        link.disconnect().await;
    }
    Ok(())
}

/// Stdin is read on a plain thread so a pending read never holds up shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn log_results(results: &[StepResult]) {
    for result in results {
        match result {
            StepResult::Completed { key, held_ms } => tracing::info!("Held {} for {} ms", key, held_ms),
            StepResult::UnknownKey(key) => tracing::warn!("No binding for key {:?}", key),
            StepResult::Cancelled { key } => tracing::info!("Cancelled while holding {}", key),
        }
    }
}
