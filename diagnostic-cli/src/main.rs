use anyhow::{Context, bail};
use clap::Parser;
use diagnostic_flow::{
    AnswerValue, Answers, ApiConfig, ClarifyingQuestion, CoordinatorConfig, DiagnosticError,
    DiagnosticSessionCoordinator, HttpPredictionApi, PredictionReport, QuestionKind,
    ReconnectPolicy, ResolverConfig, SseTransport, StepLog, StepStatus, SubmitOutcome,
};
use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::watch;
use tracing::{Instrument, info, info_span, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Run one interactive diagnostic session against the prediction backend
#[derive(Debug, Parser)]
#[command(name = "diagnose", version)]
struct Args {
    /// Symptom to report; repeat for several
    #[arg(short, long = "symptom", required = true)]
    symptoms: Vec<String>,

    /// Base URL of the diagnostics API
    #[arg(
        long,
        env = "DIAGNOSTICS_API_URL",
        default_value = "http://localhost:8000/api/diagnostics"
    )]
    api_url: String,

    #[arg(long, env = "DIAGNOSTICS_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Authorization scheme placed before the token
    #[arg(long, env = "DIAGNOSTICS_AUTH_SCHEME", default_value = "Bearer")]
    auth_scheme: String,

    #[arg(long, env = "DIAGNOSTICS_REQUEST_TIMEOUT_SECS", default_value_t = 120)]
    request_timeout_secs: u64,

    #[arg(long, env = "DIAGNOSTICS_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    connect_timeout_secs: u64,

    /// First reconnect delay of the reasoning stream, doubled per failure
    #[arg(long, env = "DIAGNOSTICS_RECONNECT_BASE_MS", default_value_t = 1000)]
    reconnect_base_ms: u64,

    #[arg(long, env = "DIAGNOSTICS_RECONNECT_MAX_MS", default_value_t = 10_000)]
    reconnect_max_ms: u64,

    /// Consecutive failed stream connections before giving up
    #[arg(long, env = "DIAGNOSTICS_MAX_CONNECTION_ATTEMPTS", default_value_t = 10)]
    max_connection_attempts: u32,

    /// How often to look for the session id before streaming
    #[arg(long, env = "DIAGNOSTICS_RESOLVER_POLL_MS", default_value_t = 500)]
    resolver_poll_ms: u64,

    #[arg(long, env = "DIAGNOSTICS_RESOLVER_MAX_ATTEMPTS", default_value_t = 10)]
    resolver_max_attempts: u32,

    /// How long to wait for the reasoning stream once predictions are final
    #[arg(long, env = "DIAGNOSTICS_COMPLETION_GRACE_MS", default_value_t = 2000)]
    completion_grace_ms: u64,

    /// Print the backend's session status document at the end
    #[arg(long)]
    show_status: bool,
}

impl Args {
    fn api_config(&self) -> ApiConfig {
        let mut config =
            ApiConfig::new(self.api_url.clone()).with_auth_scheme(self.auth_scheme.clone());
        if let Some(token) = &self.token {
            config = config.with_token(token.clone());
        }
        config.request_timeout = Duration::from_secs(self.request_timeout_secs);
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        config
    }

    fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect_base_ms),
                max_delay: Duration::from_millis(self.reconnect_max_ms),
                max_attempts: self.max_connection_attempts,
            },
            resolver: ResolverConfig {
                poll_interval: Duration::from_millis(self.resolver_poll_ms),
                max_attempts: self.resolver_max_attempts,
            },
            completion_grace: Duration::from_millis(self.completion_grace_ms),
        }
    }
}

/// Initialize tracing on stderr so prompts on stdout stay readable
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "diagnostic_flow=info,diagnostic_cli=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let run_id = Uuid::new_v4();
    let span = info_span!("diagnostic_run", run_id = %run_id);
    run(args).instrument(span).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    let api_config = args.api_config();
    info!(base_url = %api_config.base_url, "Starting diagnostic session");

    let api = HttpPredictionApi::new(api_config.clone()).context("building HTTP client")?;
    let transport = SseTransport::new(api_config).context("building stream client")?;
    let mut coordinator = DiagnosticSessionCoordinator::new(
        Arc::new(api),
        Arc::new(transport),
        args.coordinator_config(),
    );

    let printer = tokio::spawn(print_steps(coordinator.subscribe_steps()));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let mut outcome = coordinator.submit(args.symptoms.clone()).await?;
    loop {
        match outcome {
            SubmitOutcome::NeedsAnswers { questions, notice } => {
                print_notice(notice.as_deref());
                let answers = ask(&questions, &mut stdin).await?;
                outcome = match coordinator.submit_answers(&answers).await {
                    Ok(next) => next,
                    Err(e @ DiagnosticError::Validation(_)) => {
                        eprintln!("{}", e);
                        SubmitOutcome::NeedsAnswers {
                            questions,
                            notice: None,
                        }
                    }
                    Err(e) => return Err(e.into()),
                };
            }
            SubmitOutcome::Complete { report, notice } => {
                print_notice(notice.as_deref());
                print_report(&report);
                break;
            }
        }
    }

    if args.show_status {
        match coordinator.session_status().await {
            Ok(status) => println!("\nSession status:\n{}", serde_json::to_string_pretty(&status)?),
            Err(e) => warn!("Could not fetch session status: {}", e),
        }
    }

    printer.abort();
    Ok(())
}

async fn ask<R>(questions: &[ClarifyingQuestion], lines: &mut Lines<R>) -> anyhow::Result<Answers>
where
    R: AsyncBufRead + Unpin,
{
    let mut answers = Answers::new();
    println!("\nThe assessment needs a few more details (leave blank to skip):");

    for question in questions {
        loop {
            print_question(question);
            let Some(line) = lines.next_line().await? else {
                bail!("input closed before all questions were answered");
            };
            let input = line.trim();
            if input.is_empty() {
                break;
            }
            match answers.record(question, parse_answer(&question.kind, input)) {
                Ok(()) => break,
                Err(e) => eprintln!("{}", e),
            }
        }
    }
    Ok(answers)
}

fn print_question(question: &ClarifyingQuestion) {
    let marker = if question.required { "*" } else { "" };
    println!("\n{}{}", question.text, marker);
    if let Some(description) = &question.description {
        println!("  {}", description);
    }
    match &question.kind {
        QuestionKind::YesNo => print!("[yes/no] > "),
        QuestionKind::MultipleChoice { options } | QuestionKind::Checkbox { options } => {
            for (index, option) in options.iter().enumerate() {
                println!("  {}. {}", index + 1, option.label);
            }
            if matches!(question.kind, QuestionKind::Checkbox { .. }) {
                print!("[numbers, comma separated] > ");
            } else {
                print!("[number] > ");
            }
        }
        QuestionKind::Text { placeholder } => {
            print!("[{}] > ", placeholder.as_deref().unwrap_or("text"));
        }
    }
    let _ = std::io::stdout().flush();
}

/// Turn terminal input into a value for `kind`; [`Answers::record`] checks it
fn parse_answer(kind: &QuestionKind, input: &str) -> AnswerValue {
    let choice = |raw: &str| {
        raw.parse::<usize>()
            .ok()
            .and_then(|number| number.checked_sub(1))
            .and_then(|index| kind.options().get(index))
            .map_or_else(|| raw.to_string(), |option| option.value.clone())
    };

    match kind {
        QuestionKind::YesNo => match input.to_lowercase().as_str() {
            "y" | "yes" => AnswerValue::Text("yes".to_string()),
            "n" | "no" => AnswerValue::Text("no".to_string()),
            _ => AnswerValue::Text(input.to_string()),
        },
        QuestionKind::MultipleChoice { .. } => AnswerValue::Text(choice(input)),
        QuestionKind::Checkbox { .. } => AnswerValue::Choices(
            input
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(choice)
                .collect::<BTreeSet<String>>(),
        ),
        QuestionKind::Text { .. } => AnswerValue::Text(input.to_string()),
    }
}

/// Print each settled step once, and announce the step in progress
async fn print_steps(mut steps: watch::Receiver<StepLog>) {
    let mut printed = HashSet::new();
    let mut announced: Option<String> = None;

    loop {
        let log = steps.borrow_and_update().clone();
        for step in log.steps() {
            if step.status != StepStatus::InProgress && printed.insert(step.id.clone()) {
                println!("[{}] {}: {}", step.agent, step.title(), step.content.render());
            }
        }
        match log.current_in_progress() {
            Some(step) if announced.as_deref() != Some(step.id.as_str()) => {
                println!("[{}] {} ...", step.agent, step.title());
                announced = Some(step.id.clone());
            }
            Some(_) => {}
            None => announced = None,
        }

        if steps.changed().await.is_err() {
            break;
        }
    }
}

fn print_notice(notice: Option<&str>) {
    if let Some(notice) = notice {
        println!("\nNote: {}", notice);
    }
}

fn print_report(report: &PredictionReport) {
    if report.is_empty() {
        println!("\nNo predictions were returned.");
        return;
    }

    println!("\nPredictions:");
    for (disease, prediction) in report.ranked() {
        let confidence = prediction
            .confidence_level
            .as_deref()
            .map(|level| format!(", {} confidence", level))
            .unwrap_or_default();
        println!("  {:<30} {:>5.1}%{}", disease, prediction.probability * 100.0, confidence);

        if let Some(severity) = &prediction.severity {
            println!("      severity: {}", severity);
        }
        if let Some(explanation) = &prediction.explanation {
            println!("      {}", explanation);
        }
        if !prediction.precautions.is_empty() {
            println!("      precautions: {}", prediction.precautions.join(", "));
        }
        if let Some(recommendation) = &prediction.recommendation {
            println!("      recommendation: {}", recommendation);
        }
    }
}
