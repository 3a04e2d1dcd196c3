use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use jitsi_meet_launcher::config::{load_config, LauncherConfig};
use jitsi_meet_launcher::coordinator::{Coordinator, PrimaryHandle, Resolution};
use jitsi_meet_launcher::dispatch::{Dispatcher, MeetingSink};
use jitsi_meet_launcher::endpoint::Endpoint;
use jitsi_meet_launcher::meeting_url::{looks_like_protocol_url, MeetingTarget, RejectionReason, UrlParser};
use jitsi_meet_launcher::{paths, registration};

/// Stand-in for the window layer: reports what it would open.
struct ConsoleSink;

impl MeetingSink for ConsoleSink {
    fn open_meeting(&self, target: MeetingTarget) {
        println!(
            "open meeting -> {} (server={} room={})",
            target.url, target.server_url, target.room_name
        );
    }

    fn activate(&self) {
        println!("activate window");
    }

    fn invalid_url(&self, raw: &str, reason: &RejectionReason) {
        eprintln!("ignoring meeting link {raw:?}: {reason}");
    }
}

#[derive(Parser)]
#[command(name = "jitsi-meet-launcher", version, about = "Open jitsi-meet:// links in a single running instance")]
struct Cli {
    /// Meeting link, e.g. jitsi-meet://room or jitsi-meet://example.com/room
    #[arg(value_name = "URL")]
    link: Option<String>,

    /// Meeting link (same as the positional form).
    #[arg(short = 'u', long = "url", value_name = "URL", conflicts_with = "link")]
    url_opt: Option<String>,

    /// Config file (defaults to ~/.config/jitsi-meet-launcher/launcher.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the server used for bare room names.
    #[arg(long)]
    server: Option<String>,

    /// Install the jitsi-meet:// handler for the current user and exit.
    #[arg(long, conflicts_with_all = ["unregister_scheme", "to_protocol_url"])]
    register_scheme: bool,

    /// Remove the jitsi-meet:// handler for the current user and exit.
    #[arg(long, conflicts_with = "to_protocol_url")]
    unregister_scheme: bool,

    /// Print the jitsi-meet:// form of an https meeting link and exit.
    #[arg(long, value_name = "HTTPS_URL")]
    to_protocol_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Quiet by default; RUST_LOG=jitsi_meet_launcher=debug shows the role race.
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .try_init();

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(paths::config_path);
    let mut cfg = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::warn!("config: {:#}, using defaults", e);
            LauncherConfig::default()
        }
    };
    if let Some(server) = cli.server.clone() {
        cfg.default_server_url = server;
    }
    let parser = UrlParser::new(&cfg.default_server_url);

    if let Some(link) = cli.to_protocol_url.as_deref() {
        let converted = parser
            .protocol_url_from_http(link)
            .with_context(|| format!("not a meeting link: {link}"))?;
        println!("{converted}");
        return Ok(());
    }
    if cli.register_scheme {
        let exe = std::env::current_exe().context("locate executable")?;
        let apps = paths::applications_dir();
        if registration::is_registered(&apps) {
            log::info!("registration: replacing existing entry");
        }
        let path = registration::register(&exe, &apps)?;
        registration::set_default_handler();
        println!("registered jitsi-meet:// handler -> {}", path.display());
        return Ok(());
    }
    if cli.unregister_scheme {
        if registration::unregister(&paths::applications_dir())? {
            println!("removed jitsi-meet:// handler");
        } else {
            println!("no jitsi-meet:// handler was registered");
        }
        return Ok(());
    }

    if let Some(link) = cli.link.as_deref() {
        if !looks_like_protocol_url(link) {
            log::warn!("ignoring positional argument {:?}: not a jitsi-meet:// link", link);
        }
    }
    if let Some(link) = cli.url_opt.as_deref() {
        log::debug!("url option: {}", link);
    }

    // Forwarded verbatim to the primary, which re-runs the same extraction.
    let raw_args: Vec<String> = std::env::args_os()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();

    let endpoint = Endpoint::for_session(&cfg.endpoint_name);
    let mut coordinator = Coordinator::new(endpoint, cfg.coordinator_settings());
    let resolution = coordinator.resolve(&raw_args).await?;

    let dispatcher = Dispatcher::new(parser, Arc::new(ConsoleSink));
    match resolution {
        Resolution::Secondary(report) => {
            log::info!(
                "secondary: handed off id={} acknowledged={}",
                report.message_id,
                report.acknowledged
            );
            Ok(())
        }
        Resolution::Primary(primary) => run_primary(&dispatcher, primary, &raw_args).await,
        Resolution::Standalone(reason) => {
            log::warn!("running without single-instance coordination: {}", reason);
            dispatcher.handle_arguments(&raw_args);
            dispatcher.mark_ready();
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            Ok(())
        }
    }
}

async fn run_primary(
    dispatcher: &Dispatcher,
    mut primary: PrimaryHandle,
    raw_args: &[String],
) -> anyhow::Result<()> {
    log::info!(
        "primary: listening on {} default_server={}",
        primary.endpoint(),
        dispatcher.parser().default_server()
    );
    dispatcher.handle_arguments(raw_args);
    // The console sink is usable right away; a window layer would call this
    // once its main window exists.
    dispatcher.mark_ready();

    loop {
        tokio::select! {
            msg = primary.recv() => match msg {
                Some(msg) => {
                    dispatcher.handle_handoff(msg);
                }
                None => break,
            },
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    log::warn!("primary: ctrl-c handler failed: {}", e);
                }
                break;
            }
        }
    }

    primary.shutdown().await;
    Ok(())
}
