mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use cli::{Cli, Commands};
use nx_av::{normalize_container, MediaProbe, ToolRegistry};
use nx_core::config::Config;
use nx_core::events::EventPayload;
use nx_core::{MediaRequest, Origin, PipelineState, ProbeResult, TrackKind};
use nx_pipeline::{decide, Orchestrator, StaticCapabilities, StreamTarget};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "netsix=trace,nx_pipeline=trace,nx_av=debug,nx_core=debug".to_string()
        } else {
            "netsix=info,nx_pipeline=info,nx_av=warn,nx_core=warn".to_string()
        }
    });

    // Logs go to stderr so `--json` output stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Probe { file, json } => {
            let config = load_config(cli.config.as_deref())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&config, &file, json))
        }
        Commands::Plan { file, json } => {
            let config = load_config(cli.config.as_deref())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(plan_file(&config, &file, json))
        }
        Commands::Send { file, output } => {
            let config = load_config(cli.config.as_deref())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(send_file(config, &file, &output))
        }
        Commands::CheckTools => {
            let config = load_config(cli.config.as_deref())?;
            check_tools(&config)
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("netsix {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = Config::from_json(&contents)?;
    for warning in config.validate() {
        tracing::warn!("config: {warning}");
    }
    Ok(config)
}

async fn probe_file(config: &Config, file: &Path, json: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let tools = ToolRegistry::discover(&config.tools);
    let info = MediaProbe::from_registry(&tools)?.probe(file).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        print_probe(file, &info);
    }
    Ok(())
}

fn print_probe(file: &Path, info: &ProbeResult) {
    let secs = info.duration_ms / 1000;
    println!("File: {}", file.display());
    println!(
        "Duration: {:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        info.duration_ms % 1000
    );
    println!("MIME: {}", info.mime_type("video/mp4"));
    println!("\nTracks: {}", info.tracks.len());
    for (i, track) in info.tracks.iter().enumerate() {
        let codec = if track.codec.is_empty() {
            "-"
        } else {
            track.codec.as_str()
        };
        println!("  [{i}] {} {codec}", track.kind);
    }
}

async fn plan_file(config: &Config, file: &Path, json: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let tools = ToolRegistry::discover(&config.tools);
    let prober = MediaProbe::from_registry(&tools)?;
    let request = MediaRequest::from_path(file, Origin::Local)?;
    let normalize = request.extension().is_some_and(|ext| {
        config
            .pipeline
            .normalize_extensions
            .iter()
            .any(|n| n.eq_ignore_ascii_case(&ext))
    });

    let info = if normalize {
        let paths = request.paths(&config.cache);
        tokio::fs::create_dir_all(&paths.intermediate_dir).await?;
        let probed: nx_core::Result<ProbeResult> = async {
            normalize_container(&tools, file, &paths.normalized).await?;
            prober.probe(&paths.normalized).await
        }
        .await;
        paths.remove_intermediates();
        probed?
    } else {
        prober.probe(file).await?
    };

    let oracle = StaticCapabilities::from_config(&config.playback);
    let decision = decide(&info, &oracle, &config.transcode)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
        return Ok(());
    }

    let yes_no = |b: bool| if b { "yes" } else { "no" };
    println!("File: {}", file.display());
    println!(
        "Video: {} (supported: {})",
        info.first_codec(TrackKind::Video).unwrap_or("-"),
        yes_no(decision.video_supported)
    );
    println!(
        "Audio: {} (supported: {})",
        info.first_codec(TrackKind::Audio).unwrap_or("-"),
        yes_no(decision.audio_supported)
    );
    println!("Plan: {}", decision.plan);
    Ok(())
}

async fn send_file(config: Config, file: &Path, output: &Path) -> Result<()> {
    let request = MediaRequest::from_path(file, Origin::Local)?;
    let tools = ToolRegistry::discover(&config.tools);
    let oracle = Arc::new(StaticCapabilities::from_config(&config.playback));
    let orchestrator = Orchestrator::new(config, tools, oracle);
    let mut events = orchestrator.subscribe();

    let (tx, mut rx) = mpsc::channel::<Bytes>(16);
    let out_path = output.to_path_buf();
    let writer = tokio::spawn(async move {
        let mut out = tokio::fs::File::create(&out_path)
            .await
            .with_context(|| format!("failed to create {}", out_path.display()))?;
        while let Some(chunk) = rx.recv().await {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        anyhow::Ok(())
    });

    orchestrator
        .submit(request, StreamTarget::Local(tx))
        .await?;

    let mut acknowledged = false;
    let outcome: Result<()> = loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                orchestrator.cancel().await;
                break Err(anyhow::anyhow!("interrupted"));
            }
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // The skipped events may include the one we are waiting for.
                tracing::debug!("skipped {n} events; resyncing from pipeline state");
                match resync(orchestrator.state(), acknowledged) {
                    Resync::Acknowledge => {
                        acknowledged = true;
                        if let Err(e) = orchestrator.acknowledge_ready().await {
                            break Err(e.into());
                        }
                    }
                    Resync::Finished => {
                        let (chunks, bytes) = orchestrator
                            .descriptor()
                            .map_or((0, 0), |d| (d.total_chunks, d.size));
                        println!("Sent {chunks} chunks ({bytes} bytes) to {}", output.display());
                        break Ok(());
                    }
                    Resync::Aborted => break Err(anyhow::anyhow!("request aborted")),
                    Resync::StreamFailed => break Err(anyhow::anyhow!("stream failed")),
                    Resync::Wait => {}
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                break Err(anyhow::anyhow!("event bus closed"));
            }
        };

        match event.payload {
            EventPayload::StateChanged { state } => tracing::info!("state: {state}"),
            EventPayload::NeedsTranscoding { video_ok, audio_ok } => {
                println!("Transcoding needed (video ok: {video_ok}, audio ok: {audio_ok})");
            }
            EventPayload::Notice { message, .. } => println!("{message}"),
            EventPayload::ProgressUpdated { percent } => println!("Progress: {percent}%"),
            EventPayload::FileReady { descriptor } => {
                println!(
                    "Ready: {} ({} bytes, {} chunks)",
                    descriptor.full_path().display(),
                    descriptor.size,
                    descriptor.total_chunks
                );
                if !acknowledged {
                    acknowledged = true;
                    if let Err(e) = orchestrator.acknowledge_ready().await {
                        break Err(e.into());
                    }
                }
            }
            EventPayload::StreamCompleted { chunks, bytes } => {
                println!("Sent {chunks} chunks ({bytes} bytes) to {}", output.display());
                break Ok(());
            }
            EventPayload::Failed { category, reason } => {
                break Err(anyhow::anyhow!("{category}: {reason}"));
            }
            EventPayload::Cancelled => break Err(anyhow::anyhow!("cancelled")),
            EventPayload::RequestSubmitted { .. } | EventPayload::ChunkSent { .. } => {}
        }
    };

    // The orchestrator holds the last chunk sender.
    drop(orchestrator);
    let written = writer.await.context("writer task panicked")?;
    if outcome.is_err() {
        let _ = tokio::fs::remove_file(output).await;
    }
    outcome?;
    written
}

/// Next step of the `send` loop after the event stream lagged.
#[derive(Debug, PartialEq, Eq)]
enum Resync {
    Acknowledge,
    Finished,
    Aborted,
    StreamFailed,
    Wait,
}

fn resync(state: PipelineState, acknowledged: bool) -> Resync {
    match state {
        PipelineState::Ready if !acknowledged => Resync::Acknowledge,
        PipelineState::Done => Resync::Finished,
        PipelineState::Aborted => Resync::Aborted,
        // A failed stream drops the request back to idle.
        PipelineState::Idle if acknowledged => Resync::StreamFailed,
        _ => Resync::Wait,
    }
}

fn check_tools(config: &Config) -> Result<()> {
    println!("Checking external tools...\n");

    let tools = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install them to enable all features.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = load_config(Some(p))?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Cache dir: {}", config.cache.dir_name);
    println!("  Chunk size: {} bytes", config.streaming.effective_chunk_size());
    println!("  High-water mark: {} bytes", config.streaming.high_water_mark);
    println!("  Poll interval: {} ms", config.streaming.poll_interval_ms);
    println!("  Supported codecs: {}", config.playback.supported_codecs.join(", "));

    let warnings = config.validate();
    if !warnings.is_empty() {
        println!("\nWarnings:");
        for w in &warnings {
            println!("  - {w}");
        }
    }

    Ok(())
}
