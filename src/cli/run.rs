//! Interactive chat command

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use super::load_config;
use crate::backend::EchoEngine;
use crate::engine::{Event, RequestResult, RequestStatus, Scheduler};
use crate::session::{Session, TurnStatus};

/// A line typed at the prompt
#[derive(Debug, PartialEq, Eq)]
enum ReplCommand<'a> {
    Exit,
    Empty,
    /// Unload, then load the given identity
    Reload(&'a str),
    Unload,
    History,
    Help,
    Prompt(&'a str),
}

fn parse_line(line: &str) -> ReplCommand<'_> {
    let line = line.trim();
    match line {
        "" => ReplCommand::Empty,
        "exit" | "quit" => ReplCommand::Exit,
        "/unload" => ReplCommand::Unload,
        "/history" => ReplCommand::History,
        "/help" => ReplCommand::Help,
        _ => match line.strip_prefix("/reload") {
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
                ReplCommand::Reload(rest.trim())
            }
            _ => ReplCommand::Prompt(line),
        },
    }
}

/// Run interactive chat
pub async fn run(
    model: String,
    prompt: Option<String>,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    system: Option<String>,
    config: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(config.as_deref())?;
    if let Some(max_tokens) = max_tokens {
        config.generation.max_tokens = max_tokens;
    }
    if let Some(temperature) = temperature {
        config.generation.temperature = temperature;
    }
    if system.is_some() {
        config.session.system_prompt = system;
    }

    let engine = Arc::new(EchoEngine::new(config.echo.clone()));
    let scheduler = Arc::new(Scheduler::new(engine, config));
    let session = Arc::new(Session::new("cli"));

    load(&scheduler, &model).await?;

    // If prompt provided, generate once
    if let Some(prompt) = prompt {
        let result = submit(&scheduler, &session, &prompt).await;
        print_result(&result);
        return Ok(());
    }

    // Interactive loop
    tracing::info!("Starting interactive session.");
    println!("Resource: {}", model);
    println!("Type your prompt and press Enter. Type /help for commands, 'exit' or Ctrl+D to quit.\n");
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }

        match parse_line(&input) {
            ReplCommand::Empty => continue,
            ReplCommand::Exit => break,
            ReplCommand::Help => print_help(),
            ReplCommand::History => print_history(&session),
            ReplCommand::Unload => match scheduler.unload_resource().await {
                Ok(binding) => println!("Unloaded '{}' ({})", binding.identity, binding.version),
                Err(e) => eprintln!("{}", e),
            },
            ReplCommand::Reload(identity) => {
                let identity = if identity.is_empty() {
                    model.as_str()
                } else {
                    identity
                };
                if scheduler.status().is_loaded() {
                    if let Err(e) = scheduler.unload_resource().await {
                        eprintln!("{}", e);
                        continue;
                    }
                }
                if let Err(e) = load(&scheduler, identity).await {
                    eprintln!("{:#}", e);
                }
            }
            ReplCommand::Prompt(prompt) => {
                let result = submit(&scheduler, &session, prompt).await;
                print_result(&result);
                println!();
            }
        }
    }

    Ok(())
}

/// Load `identity`, printing progress as it arrives
async fn load(scheduler: &Scheduler, identity: &str) -> Result<()> {
    tracing::info!("Loading resource: {}", identity);

    let mut events = scheduler.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::ResourceLoadProgress { fraction, .. } => {
                    eprint!("\rLoading... {:>3.0}%", fraction * 100.0);
                }
                Event::ResourceLoadCompleted { .. } | Event::ResourceLoadFailed { .. } => {
                    eprintln!();
                    break;
                }
                _ => {}
            }
        }
    });

    let result = scheduler.load_resource(identity).await;
    progress.abort();

    let status = result?;
    if let Some(version) = status.version {
        println!("Loaded '{}' ({})", identity, version);
    }
    Ok(())
}

/// Submit a prompt; Ctrl+C cancels it and waits for it to resolve
async fn submit(scheduler: &Arc<Scheduler>, session: &Arc<Session>, prompt: &str) -> RequestResult {
    let start = Instant::now();

    let pending = scheduler.submit(session, prompt);
    tokio::pin!(pending);
    let result = tokio::select! {
        result = &mut pending => result,
        _ = tokio::signal::ctrl_c() => {
            scheduler.cancel(session.id(), true).await;
            pending.await
        }
    };

    tracing::debug!(
        "Request resolved {} in {:.2}s",
        result.status,
        start.elapsed().as_secs_f64()
    );
    result
}

fn print_result(result: &RequestResult) {
    match result.status {
        RequestStatus::Completed => println!("{}", result.completion.as_deref().unwrap_or_default()),
        RequestStatus::Cancelled => println!("[cancelled]"),
        RequestStatus::Failed => eprintln!(
            "Error during generation: {}",
            result.error.as_deref().unwrap_or("unknown error")
        ),
        RequestStatus::ResourceUnavailable => {
            eprintln!("No resource is loaded. Use /reload <identity> to load one.")
        }
    }
}

fn print_history(session: &Session) {
    let history = session.history();
    if let Some(title) = session.title() {
        println!("# {}", title);
    }
    if let Some(system) = &history.system_prompt {
        println!("[system] {}", system);
    }
    for turn in &history.turns {
        println!("> {}", turn.prompt);
        match (turn.status, &turn.response) {
            (TurnStatus::Completed, Some(response)) => println!("{}", response),
            (status, _) => println!("[{:?}]", status),
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  /reload [identity]  Unload and load a resource (default: the current one)");
    println!("  /unload             Unload the resource, cancelling outstanding requests");
    println!("  /history            Show this session's history");
    println!("  exit                Quit");
}
