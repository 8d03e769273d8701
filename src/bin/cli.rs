//! Mobile Agent CLI
//!
//! Runs one task given on the command line, or reads tasks interactively.
//! Configuration comes from the saved settings, `.env` and the environment.

use futures::StreamExt;
use mobile_agent::adb::AdbDevice;
use mobile_agent::agent::{Event, EventKind, RunResult, RunStatus, TaskRunner};
use mobile_agent::artifacts::DirArtifactSink;
use mobile_agent::model::ModelClient;
use mobile_agent::settings::AppSettings;
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let mut settings = AppSettings::load();
    settings.apply_env()?;

    let device = Arc::new(AdbDevice::new(settings.device_id()));
    let model = Arc::new(ModelClient::new(settings.model_config()));
    let mut runner = TaskRunner::new(model, device, settings.run_options());
    let output_dir = settings.output_dir().or_else(AppSettings::default_output_dir);
    if let Some(dir) = &output_dir {
        runner = runner.with_artifacts(Arc::new(DirArtifactSink::new(dir)));
    }

    eprintln!("🤖 Mobile Agent");
    eprintln!("================================================");
    eprintln!("Model: {} @ {}", settings.model_name, settings.base_url);
    eprintln!("Engine: {:?}", settings.engine);
    eprintln!(
        "Budget: {} steps, {} retries",
        settings.max_steps, settings.max_retries
    );
    if let Some(id) = settings.device_id() {
        eprintln!("Device: {}", id);
    }
    if let Some(dir) = &output_dir {
        eprintln!("Artifacts: {}", dir.display());
    }
    eprintln!("================================================\n");

    let args: Vec<String> = env::args().skip(1).collect();
    if !args.is_empty() {
        let task = args.join(" ");
        let ok = run_task(&runner, &task, settings.streaming).await?;
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    eprintln!("Interactive mode. Type your task and press Enter.");
    eprintln!("Type 'quit' or 'exit' to exit.\n");
    let stdin = io::stdin();
    loop {
        eprint!("📝 Task: ");
        io::stderr().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let task = line.trim();
        if task.is_empty() {
            continue;
        }
        if task == "quit" || task == "exit" {
            eprintln!("Goodbye! 👋");
            break;
        }
        run_task(&runner, task, settings.streaming).await?;
    }
    Ok(())
}

/// Run one task; Ctrl-C cancels it. Returns whether it succeeded.
async fn run_task(runner: &TaskRunner, task: &str, streaming: bool) -> anyhow::Result<bool> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let success = if streaming {
        let mut events = runner.run_stream(task, cancel);
        let mut success = false;
        while let Some(event) = events.next().await {
            println!("{}", serde_json::to_string(&event)?);
            if event.is_terminal() {
                success = is_successful(&event);
            }
        }
        success
    } else {
        let result = runner.run(task, cancel).await;
        print_result(&result)?;
        result.is_success()
    };

    watcher.abort();
    Ok(success)
}

fn is_successful(event: &Event) -> bool {
    matches!(
        &event.kind,
        EventKind::TaskCompleted {
            status: RunStatus::Success,
            ..
        }
    )
}

fn print_result(result: &RunResult) -> anyhow::Result<()> {
    let icon = if result.is_success() { "✅" } else { "❌" };
    eprintln!(
        "\n{} {:?} ({:?}) after {} steps",
        icon, result.status, result.reason, result.total_steps
    );
    if !result.final_note.is_empty() {
        eprintln!("   {}", result.final_note);
    }
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}
