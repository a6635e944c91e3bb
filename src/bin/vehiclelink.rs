use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use vehiclelink::estop::{RegisterBank, StepOutcome, DEFAULT_RESET_CODE};
use vehiclelink::protocol::{CMD_COMPONENT_ARM_DISARM, FORCE_DISARM_MAGIC};
use vehiclelink::telemetry::timestamp_ms;
use vehiclelink::{
    Command, LinkConfig, LinkError, LoopbackTransport, Message, MessageKind, ResultCode,
    StopReport, VehicleLink,
};

const DEFAULT_BENCH_ITERATIONS: &str = "100";
const SIMULATED_SYSTEM_ID: u8 = 1;
const SIMULATED_COMPONENT_ID: u8 = 1;
// ArduPilot 4.5.2
const SIMULATED_FIRMWARE: u32 = 0x0405_0200;
const SIMULATED_CAPABILITIES: u64 = (1 << 2) | (1 << 3) | (1 << 5) | (1 << 13);

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Loopback autopilot plus the register bank its stop frames act on.
struct Bench {
    link: VehicleLink,
    transport: LoopbackTransport,
    registers: Arc<RegisterBank>,
}

#[tokio::main]
async fn main() -> CliResult {
    let matches = App::new("vehiclelink")
        .version("0.1.0")
        .author("Flight Systems Engineering Team")
        .about("🛩️  Vehicle Link - command dispatch and emergency stop bench")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON link configuration")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("timeout-ms")
                .long("timeout-ms")
                .value_name("MS")
                .help("Ack timeout per attempt")
                .takes_value(true)
                .global(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Timeout must be a positive number of milliseconds".into()),
                }),
        )
        .arg(
            Arg::with_name("retries")
                .long("retries")
                .value_name("N")
                .help("Re-sends after the first attempt")
                .takes_value(true)
                .global(true)
                .validator(|v| match v.parse::<u32>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Retries must be a number".into()),
                }),
        )
        .arg(
            Arg::with_name("channels")
                .long("channels")
                .value_name("N")
                .help("Actuator channel count")
                .takes_value(true)
                .global(true)
                .validator(|v| match v.parse::<usize>() {
                    Ok(n) if n > 0 => Ok(()),
                    _ => Err("Channel count must be at least 1".into()),
                }),
        )
        .arg(
            Arg::with_name("ack")
                .long("ack")
                .value_name("RESULT")
                .help("Result the simulated autopilot answers with")
                .takes_value(true)
                .possible_values(&[
                    "accepted",
                    "temporarily-rejected",
                    "denied",
                    "unsupported",
                    "failed",
                    "in-progress",
                    "cancelled",
                    "none",
                ])
                .default_value("accepted")
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(SubCommand::with_name("arm").about("🔓 Arm the vehicle"))
        .subcommand(SubCommand::with_name("disarm").about("🔒 Disarm the vehicle"))
        .subcommand(
            SubCommand::with_name("motor-test")
                .about("⚙️  Spin a single motor")
                .arg(Arg::with_name("motor").help("Motor number (1-8)").required(true))
                .arg(Arg::with_name("throttle").help("Throttle percent (0-100)").required(true))
                .arg(
                    Arg::with_name("duration")
                        .help("Duration in milliseconds (max 5000)")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("estop")
                .about("🛑 Trigger the emergency stop")
                .arg(
                    Arg::with_name("reason")
                        .long("reason")
                        .takes_value(true)
                        .default_value("operator request"),
                )
                .arg(
                    Arg::with_name("no-bypass")
                        .long("no-bypass")
                        .help("Disable the bypass channel to exercise the register fallback"),
                )
                .arg(
                    Arg::with_name("reset")
                        .long("reset")
                        .value_name("CODE")
                        .help("Attempt a reset afterwards with this confirmation code")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("bench-estop")
                .about("⏱️  Measure emergency stop response times")
                .arg(
                    Arg::with_name("iterations")
                        .short("n")
                        .long("iterations")
                        .takes_value(true)
                        .default_value(DEFAULT_BENCH_ITERATIONS),
                ),
        )
        .subcommand(SubCommand::with_name("status").about("📊 Link and vehicle status"))
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = load_config(&matches)?;
    let format = matches.value_of("format").unwrap_or("table").to_string();
    let ack = parse_ack(matches.value_of("ack").unwrap_or("accepted"));

    match matches.subcommand() {
        ("arm", Some(_)) => {
            let bench = connect_bench(config, ack)?;
            print_command_result("arm", bench.link.arm().await, &format);
        }
        ("disarm", Some(_)) => {
            let bench = connect_bench(config, ack)?;
            print_command_result("disarm", bench.link.disarm().await, &format);
        }
        ("motor-test", Some(sub)) => handle_motor_test(sub, config, ack, &format).await?,
        ("estop", Some(sub)) => handle_estop(sub, config, ack, &format).await?,
        ("bench-estop", Some(sub)) => handle_bench(sub, config, ack, &format).await?,
        ("status", Some(_)) => handle_status(config, ack, &format).await?,
        _ => {
            println!("{}", "🛩️  Vehicle Link".bright_blue().bold());
            println!("Run with --help to see available commands");
        }
    }

    Ok(())
}

fn load_config(matches: &ArgMatches<'_>) -> Result<LinkConfig, Box<dyn std::error::Error>> {
    let mut config = match matches.value_of("config") {
        Some(path) => LinkConfig::from_json_file(path)?,
        None => LinkConfig::default(),
    };

    if let Some(ms) = matches.value_of("timeout-ms") {
        config.dispatcher.timeout_ms = ms.parse()?;
    }
    if let Some(retries) = matches.value_of("retries") {
        config.dispatcher.max_retries = retries.parse()?;
    }
    if let Some(channels) = matches.value_of("channels") {
        config.emergency_stop.channel_count = channels.parse()?;
    }
    config.validate()?;
    Ok(config)
}

fn parse_ack(value: &str) -> Option<ResultCode> {
    match value {
        "accepted" => Some(ResultCode::Accepted),
        "temporarily-rejected" => Some(ResultCode::TemporarilyRejected),
        "denied" => Some(ResultCode::Denied),
        "unsupported" => Some(ResultCode::Unsupported),
        "failed" => Some(ResultCode::Failed),
        "in-progress" => Some(ResultCode::InProgress),
        "cancelled" => Some(ResultCode::Cancelled),
        _ => None,
    }
}

fn build_bench(config: LinkConfig, ack: Option<ResultCode>) -> Bench {
    let transport = LoopbackTransport::with_prefix(&config.connection.event_prefix);
    transport.set_auto_ack(ack);
    transport.enable_immediate(true);

    let registers = Arc::new(RegisterBank::new(config.emergency_stop.channel_count));

    // The simulated autopilot cuts its outputs when it sees a forced disarm
    let autopilot_outputs = Arc::clone(&registers);
    transport.set_frame_hook(Arc::new(move |frame: &[u8]| {
        if let Ok(cmd) = Command::decode_payload(frame) {
            if cmd.command_id == CMD_COMPONENT_ARM_DISARM && cmd.param(2) == Some(FORCE_DISARM_MAGIC) {
                for channel in 0..autopilot_outputs.values().len() {
                    autopilot_outputs.force(channel, 0.0);
                }
            }
        }
    }));

    let link = VehicleLink::with_registers(config, Arc::new(transport.clone()), registers.clone());
    Bench {
        link,
        transport,
        registers,
    }
}

fn connect_bench(config: LinkConfig, ack: Option<ResultCode>) -> Result<Bench, LinkError> {
    let mut bench = build_bench(config, ack);
    bench.link.connect()?;
    Ok(bench)
}

async fn handle_motor_test(
    matches: &ArgMatches<'_>,
    config: LinkConfig,
    ack: Option<ResultCode>,
    format: &str,
) -> CliResult {
    let motor: u8 = matches.value_of("motor").unwrap_or("1").parse()?;
    let throttle: f32 = matches.value_of("throttle").unwrap_or("0").parse()?;
    let duration_ms: u64 = matches.value_of("duration").unwrap_or("0").parse()?;

    let bench = connect_bench(config, ack)?;
    let result = bench.link.test_motor(motor, throttle, duration_ms).await;
    let started = result.is_ok();
    print_command_result("motor-test", result, format);

    if started && format != "json" {
        println!(
            "   {} channel {} at {:.2}",
            "⚙️".bright_white(),
            motor,
            bench.registers.values()[usize::from(motor - 1)]
        );
        tokio::time::sleep(Duration::from_millis(duration_ms + 10)).await;
        println!("   {} motor test finished", "✅".green());
    }
    Ok(())
}

async fn handle_estop(
    matches: &ArgMatches<'_>,
    config: LinkConfig,
    ack: Option<ResultCode>,
    format: &str,
) -> CliResult {
    let bench = build_bench(config, ack);
    if matches.is_present("no-bypass") {
        bench.transport.enable_immediate(false);
    }

    // Something to stop
    for channel in 0..bench.registers.values().len() {
        bench.link.emergency_stop_service().actuators().write(channel, 0.5)?;
    }

    let reason = matches.value_of("reason").unwrap_or("operator request");
    let report = bench.link.emergency_stop(reason);
    // Let the deferred notification run
    tokio::task::yield_now().await;

    print_stop_report(&report, format);

    if let Some(code) = matches.value_of("reset") {
        let reset = bench.link.reset_emergency_stop(code).await;
        match format {
            "json" => println!("{}", serde_json::json!({ "reset": reset })),
            _ if reset => println!("{} {}", "✅".green(), "Emergency stop reset".bright_green()),
            _ => println!("{} {}", "❌".red(), "Reset refused, still stopped".bright_red()),
        }
    }
    Ok(())
}

async fn handle_bench(
    matches: &ArgMatches<'_>,
    config: LinkConfig,
    ack: Option<ResultCode>,
    format: &str,
) -> CliResult {
    let iterations: usize = matches
        .value_of("iterations")
        .unwrap_or(DEFAULT_BENCH_ITERATIONS)
        .parse()?;
    let bench = build_bench(config, ack);

    for i in 0..iterations {
        bench.link.emergency_stop(&format!("bench {i}"));
        tokio::task::yield_now().await;
        if !bench.link.reset_emergency_stop(DEFAULT_RESET_CODE).await {
            eprintln!("{} reset refused on iteration {}", "❌".red(), i);
            break;
        }
    }

    let metrics = bench.link.performance_metrics();
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&metrics)?),
        _ => {
            println!("{}", "⏱️  Emergency Stop Response".bright_blue().bold());
            println!("   Activations:  {}", metrics.activation_count);
            println!("   Samples:      {}", metrics.samples);
            println!("   Average:      {:.4} ms", metrics.average_response_ms);
            println!("   Max:          {:.4} ms", metrics.max_response_ms);
            let violations = if metrics.target_violations == 0 {
                "0".green()
            } else {
                metrics.target_violations.to_string().red()
            };
            println!("   Over target:  {}", violations);
        }
    }
    Ok(())
}

async fn handle_status(config: LinkConfig, ack: Option<ResultCode>, format: &str) -> CliResult {
    let bench = connect_bench(config, ack)?;

    bench.transport.emit_message(&simulated_heartbeat());
    bench.transport.emit_message(&simulated_version());
    bench.transport.emit_message(&simulated_status_text("Link check OK"));
    // Let the inbound pump drain
    tokio::time::sleep(Duration::from_millis(20)).await;

    let info = bench.link.vehicle_info();
    let status = bench.link.link_status();
    let stats = bench.link.get_stats();

    match format {
        "json" => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "vehicle": info,
                "link": status,
                "stats": stats,
            }))?
        ),
        _ => {
            println!("{}", "📊 Link Status".bright_blue().bold());
            let connected = if status.connected { "CONNECTED".green() } else { "DOWN".red() };
            println!("   State:        {}", connected);
            println!("   Quality:      {:.0}%", status.link_quality * 100.0);
            println!("   Received:     {} msgs / {} bytes", stats.messages_received, stats.bytes_received);
            println!("   Sent:         {} msgs / {} bytes", stats.messages_sent, stats.bytes_sent);
            println!("   Errors:       {}", stats.errors);
            println!("{}", "🛩️  Vehicle".bright_blue().bold());
            println!("   Autopilot:    {}", info.autopilot.as_deref().unwrap_or("-"));
            println!("   Type:         {}", info.vehicle_type.as_deref().unwrap_or("-"));
            println!("   Firmware:     {}", info.firmware_version.as_deref().unwrap_or("-"));
            println!("   Armed:        {}", if info.armed { "YES".red() } else { "NO".green() });
            println!("   Capabilities: {}", info.capabilities.join(", "));
        }
    }
    Ok(())
}

fn print_command_result(action: &str, result: Result<ResultCode, LinkError>, format: &str) {
    match format {
        "json" => {
            let value = match &result {
                Ok(code) => serde_json::json!({ "command": action, "result": code }),
                Err(e) => serde_json::json!({ "command": action, "error": e.to_string() }),
            };
            println!("{}", value);
        }
        _ => match result {
            Ok(code) => println!("{} {} {}", "✅".green(), action.bright_white(), code.to_string().bright_cyan()),
            Err(e) => println!("{} {} failed: {}", "❌".red(), action.bright_white(), e.to_string().bright_red()),
        },
    }
}

fn print_stop_report(report: &StopReport, format: &str) {
    if format == "json" {
        let steps: Vec<_> = report
            .steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "step": s.step,
                    "outcome": s.outcome,
                    "elapsed_us": s.elapsed_us,
                    "budget_us": s.budget_us,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({
                "reason": report.reason.as_str(),
                "total_us": report.total_us,
                "forced_repeat": report.forced_repeat,
                "failures": report.failures.len(),
                "steps": steps,
            })
        );
        return;
    }

    println!("{} {}", "🛑".red(), "EMERGENCY STOP".bright_red().bold());
    println!("   Reason:  {}", report.reason.as_str().bright_white());
    println!("   Total:   {} µs", report.total_us);
    for step in &report.steps {
        let outcome = match step.outcome {
            StepOutcome::Done => "done".green(),
            StepOutcome::Skipped => "skipped".yellow(),
            StepOutcome::Failed => "FAILED".red(),
        };
        let budget = step
            .budget_us
            .map(|b| format!(" (budget {b} µs)"))
            .unwrap_or_default();
        let elapsed = if step.over_budget() {
            format!("{} µs", step.elapsed_us).red()
        } else {
            format!("{} µs", step.elapsed_us).normal()
        };
        println!("   {:<14} {:<8} {}{}", format!("{:?}", step.step), outcome, elapsed, budget);
    }
    if report.forced_repeat {
        println!("   {} forced repeat after {} failure(s)", "⚠️".yellow(), report.failures.len());
    }
}

fn simulated_message(kind: MessageKind, payload: Vec<u8>) -> Message {
    Message {
        system_id: SIMULATED_SYSTEM_ID,
        component_id: SIMULATED_COMPONENT_ID,
        kind,
        sequence: 0,
        payload,
        checksum: 0,
        timestamp: timestamp_ms(),
    }
}

fn simulated_heartbeat() -> Message {
    // custom_mode, quadcopter, ArduPilot, disarmed, active, protocol v3
    let mut payload = 0u32.to_le_bytes().to_vec();
    payload.extend_from_slice(&[2, 3, 0, 4, 3]);
    simulated_message(MessageKind::HEARTBEAT, payload)
}

fn simulated_version() -> Message {
    let mut payload = SIMULATED_CAPABILITIES.to_le_bytes().to_vec();
    payload.extend_from_slice(&[0u8; 8]);
    payload.extend_from_slice(&SIMULATED_FIRMWARE.to_le_bytes());
    simulated_message(MessageKind::AUTOPILOT_VERSION, payload)
}

fn simulated_status_text(text: &str) -> Message {
    let mut payload = vec![6u8];
    payload.extend_from_slice(text.as_bytes());
    simulated_message(MessageKind::STATUSTEXT, payload)
}
