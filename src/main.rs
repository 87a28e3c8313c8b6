mod cli;

use anyhow::{bail, Context, Result};
use capability_router::app::RouterConfig;
use capability_router::models::{
    Capability, CapabilityPayload, CapabilityRequest, CapabilityResult, EditPrompt, ExecuteOptions, MediaParams,
    MediaPrompt, Message, Output, PersonaRequest, ProviderManager, SpeechPrompt,
};
use capability_router::platform::{AppPaths, CredentialStore, KeyringCredentialStore};
use capability_router::storage::LocalObjectStorage;
use clap::Parser;
use futures_util::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands, RouteArgs};

fn init_logging(cli: &Cli, paths: &AppPaths) -> WorkerGuard {
    let default_filter = if cli.debug {
        "capability_router=debug,caprouter=debug"
    } else {
        "capability_router=info,caprouter=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let file_appender = tracing_appender::rolling::daily(paths.logs_dir(), "caprouter.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(!cli.no_color))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    guard
}

fn options(route: &RouteArgs, cancel: &CancellationToken) -> ExecuteOptions {
    ExecuteOptions {
        provider: route.provider.clone(),
        cancel: Some(cancel.clone()),
    }
}

fn text_request(prompt: String, system: Option<String>) -> CapabilityRequest {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(prompt));
    CapabilityRequest::text(messages)
}

fn print_result(result: &CapabilityResult) {
    match &result.output {
        Output::Text(text) => println!("{}", text),
        Output::Media(media) => println!("{} ({}, {} bytes)", media.url, media.content_type, media.size_bytes),
        Output::Stream(_) => {}
    }
    if let Some(usage) = &result.usage {
        info!(
            "Tokens: {} in / {} out",
            usage.input_tokens, usage.output_tokens
        );
    }
    eprintln!("served by {} ({})", result.provider_used, result.model_used);
}

fn build_manager(config: &RouterConfig, paths: &AppPaths) -> Result<Arc<ProviderManager>> {
    let root = config
        .storage
        .root
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.assets_dir());
    let storage = Arc::new(LocalObjectStorage::new(root, config.storage.public_base_url.clone()));
    let store: Arc<dyn CredentialStore> = Arc::new(KeyringCredentialStore::new());

    let manager = ProviderManager::from_config(config, Some(store), storage)
        .context("Failed to initialize provider manager")?;
    Ok(Arc::new(manager))
}

async fn run_request(
    manager: &ProviderManager,
    capability: Capability,
    request: CapabilityRequest,
    options: ExecuteOptions,
) -> Result<()> {
    match manager.execute(capability, request, options).await {
        Ok(result) => {
            print_result(&result);
            Ok(())
        }
        Err(e) => {
            warn!("Request failed: {}", e);
            bail!("{}", e.user_message())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = AppPaths::new().context("Failed to resolve application directories")?;
    paths.ensure_dirs_exist()?;
    let _guard = init_logging(&cli, &paths);

    let config_path = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.config_file());

    // Ctrl-C cancels whatever is in flight
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::InitConfig { force } => {
            if config_path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", config_path.display());
            }
            RouterConfig::default().save(&config_path).await?;
            println!("Wrote {}", config_path.display());
        }

        Commands::ApiKey { provider, set, remove } => {
            let store = KeyringCredentialStore::new();
            if let Some(key) = set {
                store.set(&provider, &key).await?;
                println!("Stored API key for {}", provider);
            } else if remove {
                store.remove(&provider).await?;
                println!("Removed API key for {}", provider);
            } else {
                let state = match store.get(&provider).await? {
                    Some(_) => "set in keyring",
                    None => "not set in keyring",
                };
                println!("{}: {}", provider, state);
            }
        }

        command => {
            let config = RouterConfig::load(&config_path)?;
            let manager = build_manager(&config, &paths)?;
            run_command(command, &manager, &cancel).await?;
        }
    }

    Ok(())
}

async fn run_command(command: Commands, manager: &Arc<ProviderManager>, cancel: &CancellationToken) -> Result<()> {
    match command {
        Commands::Status { json } => {
            let status = manager.provider_status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                for provider in status {
                    let state = if provider.circuit_open {
                        "open"
                    } else if provider.half_open {
                        "half-open"
                    } else {
                        "closed"
                    };
                    let last = provider
                        .last_error_kind
                        .map(|kind| kind.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<12} {:<10} failures={:<3} last_error={}",
                        provider.name, state, provider.failure_count, last
                    );
                }
            }
        }

        Commands::Resolve { capability, route } => {
            let capability: Capability = capability.parse()?;
            let candidates = manager.resolve(capability, &options(&route, cancel)).await?;
            for (i, candidate) in candidates.iter().enumerate() {
                println!(
                    "{}. {} ({}, priority {})",
                    i + 1,
                    candidate.name,
                    candidate.model,
                    candidate.priority
                );
            }
        }

        Commands::Text {
            prompt,
            system,
            temperature,
            max_tokens,
            route,
        } => {
            let mut request = text_request(prompt, system);
            if let Some(temperature) = temperature {
                request = request.with_temperature(temperature);
            }
            if let Some(max_tokens) = max_tokens {
                request = request.with_max_tokens(max_tokens);
            }
            run_request(manager, Capability::Text, request, options(&route, cancel)).await?;
        }

        Commands::Stream { prompt, system, route } => {
            let result = manager
                .execute(
                    Capability::TextStream,
                    text_request(prompt, system),
                    options(&route, cancel),
                )
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;

            eprintln!("streaming from {} ({})", result.provider_used, result.model_used);
            let mut stream = result
                .into_stream()
                .context("Provider returned a non-streaming result")?;
            let mut stdout = std::io::stdout();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                write!(stdout, "{}", chunk.delta)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }

        Commands::Image {
            prompt,
            size,
            aspect_ratio,
            route,
        } => {
            let request = CapabilityRequest::new(CapabilityPayload::Image(MediaPrompt {
                prompt,
                image_url: None,
                params: MediaParams {
                    size,
                    aspect_ratio,
                    ..Default::default()
                },
            }));
            run_request(manager, Capability::Image, request, options(&route, cancel)).await?;
        }

        Commands::Edit {
            image,
            instruction,
            route,
        } => {
            let bytes = tokio::fs::read(&image)
                .await
                .with_context(|| format!("Failed to read {}", image))?;
            let request = CapabilityRequest::new(CapabilityPayload::ImageEdit(EditPrompt {
                image: bytes,
                instruction,
                params: MediaParams::default(),
            }));
            run_request(manager, Capability::ImageEdit, request, options(&route, cancel)).await?;
        }

        Commands::Video {
            prompt,
            image_url,
            duration,
            route,
        } => {
            let request = CapabilityRequest::new(CapabilityPayload::Video(MediaPrompt {
                prompt,
                image_url,
                params: MediaParams {
                    duration_secs: duration,
                    ..Default::default()
                },
            }));
            run_request(manager, Capability::Video, request, options(&route, cancel)).await?;
        }

        Commands::Speech { text, voice, route } => {
            let request = CapabilityRequest::new(CapabilityPayload::Speech(SpeechPrompt { text, voice }));
            run_request(manager, Capability::Speech, request, options(&route, cancel)).await?;
        }

        Commands::Persona {
            prompt,
            video_prompt,
            wait,
        } => {
            let persona = manager
                .generate_persona(
                    PersonaRequest {
                        image_prompt: prompt,
                        video_prompt,
                    },
                    ExecuteOptions::default().with_cancel(cancel.clone()),
                )
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;

            print_result(&persona.image);
            println!("video job: {}", persona.video_job);

            if wait {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            manager.cancel_background_job(persona.video_job);
                            bail!("Cancelled");
                        }
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    }
                    let job = manager
                        .background_job(persona.video_job)
                        .context("Background job disappeared")?;
                    if job.status.is_terminal() {
                        println!("{}", serde_json::to_string_pretty(&job.status)?);
                        break;
                    }
                }
            }
        }

        Commands::InitConfig { .. } | Commands::ApiKey { .. } => bail!("command does not use the router"),
    }

    Ok(())
}
