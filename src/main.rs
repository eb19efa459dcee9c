use clap::{Parser, ValueEnum};
use colored::*;
use reqwest::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use gateway_stress_tester::auth::GatewayAuthClient;
use gateway_stress_tester::client::GatewayClient;
use gateway_stress_tester::metrics::{Metrics, Verdict};
use gateway_stress_tester::scenarios::{self, Scenario, ScenarioKind};
use gateway_stress_tester::scheduler::{RunState, RunStatus, Scheduler};
use gateway_stress_tester::types::{gateway_url_from_env, AuthSettings};

#[derive(Parser)]
#[command(name = "stress-tester")]
#[command(about = "Load-generation CLI for the gateway-fronted microservice ecosystem")]
#[command(version = "0.1.0")]
struct Args {
    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "mixed")]
    scenario: ScenarioArg,

    /// Gateway base URL (overrides GATEWAY_URL)
    #[arg(short, long)]
    gateway: Option<String>,

    /// Multiplier applied to every stage duration (0.01 rehearses a full schedule in seconds)
    #[arg(long, default_value_t = 1.0)]
    time_scale: f64,

    /// Seed for reproducible action selection and think times
    #[arg(long)]
    seed: Option<u64>,

    /// Show individual request results
    #[arg(short, long)]
    verbose: bool,

    /// Print the plan without generating traffic
    #[arg(long)]
    dry_run: bool,

    /// Check gateway and provider authentication, then exit
    #[arg(long)]
    verify_auth: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ScenarioArg {
    BusinessFlow,
    ServiceStress,
    HealthCheck,
    Mixed,
}

impl From<ScenarioArg> for ScenarioKind {
    fn from(arg: ScenarioArg) -> Self {
        match arg {
            ScenarioArg::BusinessFlow => ScenarioKind::BusinessFlow,
            ScenarioArg::ServiceStress => ScenarioKind::ServiceStress,
            ScenarioArg::HealthCheck => ScenarioKind::HealthCheck,
            ScenarioArg::Mixed => ScenarioKind::Mixed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let run_id = Uuid::new_v4();

    println!("{}", "🚀 Gateway Stress Tester".blue().bold());

    let gateway = args.gateway.clone().unwrap_or_else(gateway_url_from_env);
    let scenario = Scenario::new(args.scenario.into())?;
    let profile = scenario.profile(args.time_scale);
    profile.validate()?;

    let metrics = Arc::new(scenarios::registry());
    let thresholds = scenarios::default_thresholds();
    metrics.validate_thresholds(&thresholds)?;

    println!(
        "{}",
        format!(
            "Run {}, Scenario: {}, Gateway: {}",
            run_id, scenario.name, gateway
        )
        .bright_black()
    );

    if args.dry_run {
        println!("{}", "\n🔎 Dry run, no traffic will be generated".yellow());
        println!("{}", profile.describe());
        println!("Thresholds:");
        for threshold in &thresholds {
            println!("  {}: {}", threshold.metric, threshold.check);
        }
        return Ok(());
    }

    let settings = AuthSettings::from_env(&gateway);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .user_agent(format!("gateway-stress-tester/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to create HTTP client");
    let auth = Arc::new(GatewayAuthClient::new(http.clone(), settings));
    let client = Arc::new(GatewayClient::new(http, auth, gateway, args.verbose));

    if args.verify_auth {
        return verify_auth(&client).await;
    }

    let seed = args.seed.unwrap_or_else(rand::random);
    println!("{}", format!("Seed: {}", seed).bright_black());

    let run = Arc::new(RunState::new());
    let scheduler = Scheduler::new(client, Arc::clone(&metrics), Arc::clone(&run), seed);

    let start_time = Instant::now();
    let status = scheduler.execute(Arc::new(scenario), &profile).await?;

    display_results(&metrics, start_time.elapsed());

    match status {
        RunStatus::Aborted(reason) => {
            println!("{}", format!("\n🛑 Run aborted: {}", reason).red().bold());
            std::process::exit(2);
        }
        RunStatus::Completed => match metrics.evaluate(&thresholds) {
            Verdict::Pass => {
                println!("{}", "\n✅ All thresholds passed".green().bold());
                Ok(())
            }
            Verdict::Fail(violations) => {
                println!("{}", "\n❌ Threshold violations:".red().bold());
                for violation in &violations {
                    println!(
                        "{}",
                        format!(
                            "  ✗ {}: {} failed, observed {:.3} (bound {})",
                            violation.metric, violation.check, violation.observed, violation.bound
                        )
                        .red()
                    );
                }
                std::process::exit(1);
            }
        },
    }
}

/// Smoke check: gateway token, direct provider token, then one authenticated
/// probe per service. No load is generated.
async fn verify_auth(client: &GatewayClient) -> anyhow::Result<()> {
    println!("{}", "\n🔧 Verifying gateway authentication...".blue());

    let credential = client.auth().acquire().await?;
    println!(
        "{}",
        format!(
            "✅ Gateway token obtained: {}... ({}s of validity)",
            &credential.token[..credential.token.len().min(20)],
            credential.remaining().as_secs()
        )
        .green()
    );

    let direct = client.auth().acquire_from_provider().await?;
    println!(
        "{}",
        format!(
            "✅ Provider token obtained: {}...",
            &direct.token[..direct.token.len().min(20)]
        )
        .green()
    );

    for (service, path) in [
        ("gateway", "health"),
        ("orders", "orders/health"),
        ("payments", "payments/health"),
        ("products", "products/health"),
    ] {
        match client.send(Method::GET, path, None).await {
            Ok(response) => {
                println!("{}", format!("🩺 {}: {}", service, response.status).cyan());
            }
            Err(err) => {
                println!("{}", format!("🩺 {}: {}", service, err).yellow());
            }
        }
    }

    println!(
        "{}",
        "🔒 Authentication verified, ready for stress runs"
            .green()
            .bold()
    );
    Ok(())
}

fn display_results(metrics: &Metrics, total_time: Duration) {
    println!("{}", "\n📊 Stress Test Results".green().bold());
    println!("{}", "═".repeat(50).bright_black());

    for (name, value) in metrics.counters() {
        if value > 0 || name == scenarios::names::TOTAL_OPERATIONS {
            println!("{}", format!("{}: {}", name, value).blue());
        }
    }

    for (name, hits, total) in metrics.rates() {
        if total == 0 {
            continue;
        }
        let pct = hits as f64 / total as f64 * 100.0;
        println!(
            "{}",
            format!("{}: {:.1}% ({}/{})", name, pct, hits, total).cyan()
        );
    }

    for (name, summary) in metrics.trends() {
        if summary.count == 0 {
            continue;
        }
        println!(
            "{}",
            format!(
                "{}: avg {:.0}ms p50 {:.0}ms p90 {:.0}ms p95 {:.0}ms max {}ms ({} samples)",
                name,
                summary.avg_ms,
                summary.p50_ms,
                summary.p90_ms,
                summary.p95_ms,
                summary.max_ms,
                summary.count
            )
            .magenta()
        );
    }

    let total_ops = metrics.counter_value(scenarios::names::TOTAL_OPERATIONS);
    let ops_per_second = if total_time.as_secs_f64() > 0.0 {
        total_ops as f64 / total_time.as_secs_f64()
    } else {
        0.0
    };
    println!(
        "{}",
        format!("Operations/Second: {:.1}", ops_per_second).yellow()
    );
    println!(
        "{}",
        format!("Total Run Time: {}ms", total_time.as_millis()).bright_black()
    );
    println!("{}", "═".repeat(50).bright_black());
}
