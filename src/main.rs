//! Opera daemon - scenario-driven collision prediction drivers.
//!
//! Two drivers share one executable:
//! - **replay**: streams a recorded scenario through a runtime at a
//!   configurable speedup and saves the published collision notifications
//!   (the production-shaped path).
//! - **compare**: runs a discard runtime and a reuse runtime side by side on
//!   the same stream, one message at a time, checking that both emit the
//!   same number of collisions after every quiescence point.
//!
//! ```bash
//! # Replay a scenario with the reuse factory
//! opera --driver replay --scenario-type static --scenario-key long_r --reuse
//!
//! # Compare both factories on four workers
//! opera --driver compare --scenario-type static --scenario-key long_l --concurrency 4
//! ```

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Deserialize;

use opera::io::scenario::BodyStateEvent;
use opera::{
    topics, BarrierUpdatePolicy, BrokerAccess, CollisionNotificationMessage, KafkaAccessConfig,
    LookAheadJobFactory, MqttAccessConfig, OperaError, ReuseEquivalence, Runtime, RuntimeConfig,
    ScenarioResources,
};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    runtime: RuntimeSection,
    #[serde(default)]
    prediction: PredictionSection,
    #[serde(default)]
    scenario: ScenarioSection,
    #[serde(default)]
    broker: BrokerSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RuntimeSection {
    /// Worker count; 0 selects the hardware concurrency.
    concurrency: usize,
    /// Bound of each per-topic ingress queue.
    ingress_bound: usize,
    /// Bound of the pre-presentation state buffer.
    presentation_backlog: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            concurrency: 0,
            ingress_bound: 1024,
            presentation_backlog: 4096,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PredictionSection {
    /// Factory: true for reuse, false for discard.
    reuse: bool,
    /// Barrier update policy: "keep_one" or "add_when_different".
    policy: String,
    /// Reuse equivalence: "strong" or "weak".
    equivalence: String,
    /// WEAK quantisation grid step (meters).
    weak_tolerance: f64,
}

impl Default for PredictionSection {
    fn default() -> Self {
        Self {
            reuse: true,
            policy: "add_when_different".to_string(),
            equivalence: "strong".to_string(),
            weak_tolerance: 1e-3,
        }
    }
}

impl PredictionSection {
    fn policy(&self) -> Result<BarrierUpdatePolicy, OperaError> {
        match self.policy.to_lowercase().as_str() {
            "keep_one" => Ok(BarrierUpdatePolicy::KeepOneMinimumDistance),
            "add_when_different" => Ok(BarrierUpdatePolicy::AddWhenDifferentMinimumDistance),
            other => Err(OperaError::Config(format!("unknown policy '{}'", other))),
        }
    }

    fn equivalence(&self) -> Result<ReuseEquivalence, OperaError> {
        match self.equivalence.to_lowercase().as_str() {
            "strong" => Ok(ReuseEquivalence::Strong),
            "weak" => Ok(ReuseEquivalence::Weak),
            other => Err(OperaError::Config(format!(
                "unknown equivalence '{}'",
                other
            ))),
        }
    }

    fn factory(&self) -> Result<LookAheadJobFactory, OperaError> {
        if self.reuse {
            Ok(LookAheadJobFactory::reuse_with_tolerance(
                self.policy()?,
                self.equivalence()?,
                self.weak_tolerance,
            ))
        } else {
            Ok(LookAheadJobFactory::discard())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ScenarioSection {
    scenario_type: String,
    scenario_key: String,
    /// Playback speedup factor for the replay driver.
    speedup: u64,
    /// Root of the scenario fixture tree.
    resources: String,
    /// Root for saved collision notifications.
    output: String,
}

impl Default for ScenarioSection {
    fn default() -> Self {
        Self {
            scenario_type: "static".to_string(),
            scenario_key: "long_r".to_string(),
            speedup: 10,
            resources: "resources".to_string(),
            output: "collisions".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BrokerSection {
    /// Transport: "memory", "mqtt" or "kafka".
    transport: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            transport: "memory".to_string(),
        }
    }
}

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Debug, Default)]
struct Args {
    config_path: Option<String>,
    verbosity: Option<u32>,
    concurrency: Option<usize>,
    reuse: Option<bool>,
    policy: Option<String>,
    equivalence: Option<String>,
    scenario_type: Option<String>,
    scenario_key: Option<String>,
    speedup: Option<u64>,
    resources: Option<String>,
    driver: Option<String>,
    broker: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args::default();

    let mut i = 1;
    while i < argv.len() {
        let take_value = |i: &mut usize| -> Result<String, String> {
            *i += 1;
            argv.get(*i)
                .cloned()
                .ok_or_else(|| format!("{} requires a value", argv[*i - 1]))
        };
        match argv[i].as_str() {
            "--config" | "-c" => args.config_path = Some(take_value(&mut i)?),
            "--verbosity" | "-v" => {
                args.verbosity = Some(
                    take_value(&mut i)?
                        .parse()
                        .map_err(|e| format!("invalid verbosity: {}", e))?,
                )
            }
            "--concurrency" | "-n" => {
                args.concurrency = Some(
                    take_value(&mut i)?
                        .parse()
                        .map_err(|e| format!("invalid concurrency: {}", e))?,
                )
            }
            "--reuse" => args.reuse = Some(true),
            "--discard" => args.reuse = Some(false),
            "--policy" => args.policy = Some(take_value(&mut i)?),
            "--equivalence" => args.equivalence = Some(take_value(&mut i)?),
            "--scenario-type" => args.scenario_type = Some(take_value(&mut i)?),
            "--scenario-key" => args.scenario_key = Some(take_value(&mut i)?),
            "--speedup" => {
                args.speedup = Some(
                    take_value(&mut i)?
                        .parse()
                        .map_err(|e| format!("invalid speedup: {}", e))?,
                )
            }
            "--resources" => args.resources = Some(take_value(&mut i)?),
            "--driver" => args.driver = Some(take_value(&mut i)?),
            "--broker" => args.broker = Some(take_value(&mut i)?),
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
        i += 1;
    }

    Ok(args)
}

fn print_help() {
    println!("opera - collision prediction runtime for human-robot workcells");
    println!();
    println!("USAGE:");
    println!("    opera [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>         Configuration file (default: opera.toml)");
    println!("    -v, --verbosity <N>         0=warn 1=info 2=debug 3+=trace");
    println!("    -n, --concurrency <N>       Worker count (0 = hardware concurrency)");
    println!("        --reuse | --discard     Look-ahead job factory");
    println!("        --policy <P>            keep_one | add_when_different");
    println!("        --equivalence <E>       strong | weak");
    println!("        --scenario-type <T>     e.g. static, dynamic");
    println!("        --scenario-key <K>      e.g. long_r, bad1");
    println!("        --speedup <N>           Replay speedup factor");
    println!("        --resources <DIR>       Scenario fixture root");
    println!("        --driver <D>            replay | compare");
    println!("        --broker <B>            memory | mqtt | kafka");
    println!("    -h, --help                  Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    MQTT_BROKER_URI, MQTT_BROKER_PORT");
    println!("    KAFKA_BROKER_URI, KAFKA_SASL_MECHANISM, KAFKA_SECURITY_PROTOCOL,");
    println!("    KAFKA_USERNAME, KAFKA_PASSWORD, KAFKA_TOPIC_PREFIX");
}

fn load_config(args: &Args) -> Config {
    match &args.config_path {
        Some(path) => match fs::read_to_string(path) {
            Ok(contents) => match basic_toml::from_str(&contents) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path);
                    config
                }
                Err(e) => {
                    log::warn!("Failed to parse config {}: {}", path, e);
                    Config::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read config {}: {}", path, e);
                Config::default()
            }
        },
        None => {
            for path in &["opera.toml", "/etc/opera.toml"] {
                if let Ok(contents) = fs::read_to_string(path) {
                    if let Ok(config) = basic_toml::from_str(&contents) {
                        log::info!("Loaded config from {}", path);
                        return config;
                    }
                }
            }
            Config::default()
        }
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(v) = args.concurrency {
        config.runtime.concurrency = v;
    }
    if let Some(v) = args.reuse {
        config.prediction.reuse = v;
    }
    if let Some(v) = &args.policy {
        config.prediction.policy = v.clone();
    }
    if let Some(v) = &args.equivalence {
        config.prediction.equivalence = v.clone();
    }
    if let Some(v) = &args.scenario_type {
        config.scenario.scenario_type = v.clone();
    }
    if let Some(v) = &args.scenario_key {
        config.scenario.scenario_key = v.clone();
    }
    if let Some(v) = args.speedup {
        config.scenario.speedup = v.max(1);
    }
    if let Some(v) = &args.resources {
        config.scenario.resources = v.clone();
    }
    if let Some(v) = &args.broker {
        config.broker.transport = v.clone();
    }
}

fn open_broker(config: &BrokerSection) -> Result<BrokerAccess, OperaError> {
    match config.transport.to_lowercase().as_str() {
        "memory" => Ok(BrokerAccess::memory()),
        "mqtt" => {
            let mqtt = MqttAccessConfig::from_env()?;
            Err(OperaError::Config(format!(
                "MQTT transport ({}:{}) requires an external connector; this build ships the memory loopback only",
                mqtt.uri, mqtt.port
            )))
        }
        "kafka" => {
            let kafka = KafkaAccessConfig::from_env()?;
            Err(OperaError::Config(format!(
                "Kafka transport ({}) requires an external connector; this build ships the memory loopback only",
                kafka.broker_uri
            )))
        }
        other => Err(OperaError::Config(format!(
            "unknown broker transport '{}'",
            other
        ))),
    }
}

fn runtime_config(config: &Config) -> RuntimeConfig {
    RuntimeConfig {
        concurrency: config.runtime.concurrency,
        ingress_bound: config.runtime.ingress_bound,
        presentation_backlog: config.runtime.presentation_backlog,
        ..RuntimeConfig::default()
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            print_help();
            std::process::exit(2);
        }
    };

    let filter = match args.verbosity.unwrap_or(1) {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} - {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let mut config = load_config(&args);
    apply_overrides(&mut config, &args);

    log::info!("opera starting");
    log::info!(
        "  Scenario: {}/{}",
        config.scenario.scenario_type,
        config.scenario.scenario_key
    );
    log::info!(
        "  Factory: {} (policy {}, equivalence {})",
        if config.prediction.reuse {
            "reuse"
        } else {
            "discard"
        },
        config.prediction.policy,
        config.prediction.equivalence
    );
    log::info!("  Broker: {}", config.broker.transport);

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .expect("Error setting Ctrl-C handler");

    let driver = args.driver.clone().unwrap_or_else(|| "replay".to_string());
    let result = match driver.as_str() {
        "replay" => run_replay(&config, running),
        "compare" => run_compare(&config, running),
        other => Err(OperaError::Config(format!("unknown driver '{}'", other))),
    };

    match result {
        Ok(()) => log::info!("opera shutdown complete"),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(match e {
                OperaError::Config(_) => 2,
                _ => 1,
            });
        }
    }
}

// ============================================================================
// Drivers
// ============================================================================

const QUIESCENCE_TIMEOUT: Duration = Duration::from_secs(30);

fn put_json<T: serde::Serialize>(
    publisher: &dyn opera::io::Publisher,
    message: &T,
) -> Result<(), OperaError> {
    publisher
        .put(&serde_json::to_string(message)?)
        .map_err(|e| OperaError::Broker(e.to_string()))
}

/// One publisher per state topic, shared by the drivers.
struct StatePublishers {
    human: Box<dyn opera::io::Publisher>,
    robot: Box<dyn opera::io::Publisher>,
}

impl StatePublishers {
    fn new(access: &BrokerAccess) -> Self {
        Self {
            human: access.make_publisher(topics::HUMAN_STATE),
            robot: access.make_publisher(topics::ROBOT_STATE),
        }
    }

    fn publish(&self, event: &BodyStateEvent) -> Result<(), OperaError> {
        match event {
            BodyStateEvent::Human(message) => put_json(self.human.as_ref(), message),
            BodyStateEvent::Robot(message) => put_json(self.robot.as_ref(), message),
        }
    }
}

/// Stream a scenario through one runtime at a configurable speedup and save
/// the published notifications.
fn run_replay(config: &Config, running: Arc<AtomicBool>) -> Result<(), OperaError> {
    let access = open_broker(&config.broker)?;
    let factory = config.prediction.factory()?;
    let resources = ScenarioResources::new(
        &config.scenario.resources,
        &config.scenario.scenario_type,
        &config.scenario.scenario_key,
    );

    let robot_presentation = resources.load_presentation("robot")?;
    let human_presentation = resources.load_presentation("human")?;

    let mut runtime = Runtime::with_access(
        access.clone(),
        factory,
        runtime_config(config),
        Arc::clone(&running),
    )?;

    // Collect published notifications for export.
    let collisions: Arc<Mutex<Vec<CollisionNotificationMessage>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collisions);
    let _collision_subscription = access.subscribe(
        topics::COLLISION_NOTIFICATION,
        Box::new(move |payload| {
            if let Ok(message) = serde_json::from_str(payload) {
                sink.lock().unwrap().push(message);
            }
        }),
    );

    let presentation_publisher = access.make_publisher(topics::BODY_PRESENTATION);
    put_json(presentation_publisher.as_ref(), &robot_presentation)?;
    put_json(presentation_publisher.as_ref(), &human_presentation)?;
    if !runtime.wait_for(
        || runtime.counters().num_pending_human_robot_pairs() == 1,
        QUIESCENCE_TIMEOUT,
    ) {
        return Err(OperaError::Config(
            "bodies were not installed from the presentations".to_string(),
        ));
    }
    log::info!("  {} segment pairs to monitor", runtime.num_segment_pairs());

    let human_messages = resources.load_human_states()?;
    let robot_messages = resources.load_robot_states()?;
    if human_messages.is_empty() || robot_messages.is_empty() {
        return Err(OperaError::Config(
            "scenario has no state messages".to_string(),
        ));
    }

    // Seed the robot history up to the first human sample, as the recorded
    // scenarios assume.
    let publishers = StatePublishers::new(&access);
    let sync_timestamp = human_messages[0].timestamp;
    let mut robot_messages: std::collections::VecDeque<_> = robot_messages.into();
    let mut seeded = 0usize;
    while let Some(message) = robot_messages.front() {
        if message.timestamp > sync_timestamp {
            break;
        }
        publishers.publish(&BodyStateEvent::Robot(robot_messages.pop_front().unwrap()))?;
        seeded += 1;
    }
    log::info!(
        "Robot messages seeded up to sync timestamp {} ({} messages)",
        sync_timestamp,
        seeded
    );

    // Paced production threads, one per stream.
    let speedup = config.scenario.speedup.max(1);
    let human_period = Duration::from_micros(66_667 / speedup);
    let robot_period = Duration::from_micros(50_000 / speedup);
    let total_sent = seeded + human_messages.len() + robot_messages.len();

    let human_publisher = access.make_publisher(topics::HUMAN_STATE);
    let human_running = Arc::clone(&running);
    let human_thread = thread::Builder::new()
        .name("hu_p".to_string())
        .spawn(move || {
            for message in human_messages {
                if !human_running.load(Ordering::Relaxed) {
                    break;
                }
                if put_json(human_publisher.as_ref(), &message).is_err() {
                    break;
                }
                thread::sleep(human_period);
            }
        })
        .map_err(|e| OperaError::Config(format!("spawn hu_p: {}", e)))?;

    let robot_publisher = access.make_publisher(topics::ROBOT_STATE);
    let robot_running = Arc::clone(&running);
    let robot_thread = thread::Builder::new()
        .name("rb_p".to_string())
        .spawn(move || {
            for message in robot_messages {
                if !robot_running.load(Ordering::Relaxed) {
                    break;
                }
                if put_json(robot_publisher.as_ref(), &message).is_err() {
                    break;
                }
                thread::sleep(robot_period);
            }
        })
        .map_err(|e| OperaError::Config(format!("spawn rb_p: {}", e)))?;

    human_thread.join().ok();
    robot_thread.join().ok();

    runtime.wait_for(
        || {
            runtime.counters().num_state_messages_received() >= total_sent as u64
                || !running.load(Ordering::Relaxed)
        },
        QUIESCENCE_TIMEOUT,
    );
    runtime.wait_all_done(QUIESCENCE_TIMEOUT);

    log::info!(
        "Analysis completed: processed {} jobs, completed {} look-aheads (of which {} were potential collisions)",
        runtime.num_processed(),
        runtime.num_completed(),
        runtime.num_collisions()
    );

    let fatal = runtime.is_fatal();
    runtime.shutdown();

    let collected = collisions.lock().unwrap().clone();
    resources.save_collisions(Path::new(&config.scenario.output), &collected)?;
    log::info!(
        "Saved {} collision notifications to {}",
        collected.len(),
        config.scenario.output
    );

    if fatal {
        return Err(OperaError::InternalInvariant(
            "runtime terminated on a fatal error".to_string(),
        ));
    }
    Ok(())
}

/// Run discard and reuse runtimes side by side on the same stream and check
/// they agree after every message.
fn run_compare(config: &Config, running: Arc<AtomicBool>) -> Result<(), OperaError> {
    let access = open_broker(&config.broker)?;
    let resources = ScenarioResources::new(
        &config.scenario.resources,
        &config.scenario.scenario_type,
        &config.scenario.scenario_key,
    );

    let discard_factory = LookAheadJobFactory::discard();
    let reuse_factory = LookAheadJobFactory::reuse_with_tolerance(
        config.prediction.policy()?,
        config.prediction.equivalence()?,
        config.prediction.weak_tolerance,
    );

    let discard_runtime = Runtime::with_access(
        access.clone(),
        discard_factory,
        runtime_config(config),
        Arc::clone(&running),
    )?;
    let reuse_runtime = Runtime::with_access(
        access.clone(),
        reuse_factory,
        runtime_config(config),
        Arc::clone(&running),
    )?;

    let presentation_publisher = access.make_publisher(topics::BODY_PRESENTATION);
    for role in ["robot", "human"] {
        let presentation = resources.load_presentation(role)?;
        put_json(presentation_publisher.as_ref(), &presentation)?;
    }
    for runtime in [&discard_runtime, &reuse_runtime] {
        if !runtime.wait_for(
            || runtime.counters().num_pending_human_robot_pairs() == 1,
            QUIESCENCE_TIMEOUT,
        ) {
            return Err(OperaError::Config(
                "bodies were not installed from the presentations".to_string(),
            ));
        }
    }
    if discard_runtime.num_segment_pairs() != reuse_runtime.num_segment_pairs() {
        return Err(OperaError::InternalInvariant(
            "runtimes disagree on segment pairs".to_string(),
        ));
    }
    log::info!(
        "  {} segment pairs to monitor",
        discard_runtime.num_segment_pairs()
    );

    let events = resources.load_state_events()?;
    log::info!("  {} state messages to stream", events.len());

    let publishers = StatePublishers::new(&access);
    let mut sent = 0u64;
    for event in &events {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        publishers.publish(event)?;
        sent += 1;
        for runtime in [&discard_runtime, &reuse_runtime] {
            if !runtime.wait_for(
                || runtime.counters().num_state_messages_received() >= sent,
                QUIESCENCE_TIMEOUT,
            ) {
                return Err(OperaError::InternalInvariant(format!(
                    "runtime failed to ingest message {}",
                    sent
                )));
            }
            if !runtime.wait_all_done(QUIESCENCE_TIMEOUT) {
                return Err(OperaError::InternalInvariant(format!(
                    "runtime failed to quiesce after message {}",
                    sent
                )));
            }
        }
        if discard_runtime.num_collisions() != reuse_runtime.num_collisions() {
            return Err(OperaError::InternalInvariant(format!(
                "collision counts diverged after message {}: discard {} vs reuse {}",
                sent,
                discard_runtime.num_collisions(),
                reuse_runtime.num_collisions()
            )));
        }
    }

    log::info!(
        "Compared processing agreed on {} messages: {} collisions, {} vs {} geometry calls",
        sent,
        discard_runtime.num_collisions(),
        discard_runtime.num_geometry_calls(),
        reuse_runtime.num_geometry_calls()
    );
    Ok(())
}
