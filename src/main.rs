mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use colored::Colorize;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use lanbeam::config::Config;
use lanbeam::item::Bundle;
use lanbeam::server::SessionAcceptor;
use lanbeam::transfer::{
    self, event_channel, EventReceiver, IdAllocator, TransferEvent, TransferEventKind,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(name) = cli.name {
        config.device_name = name;
    }

    match cli.command {
        Command::Send { addr, paths } => {
            config.validate()?;
            send(config, &addr, paths).await
        }
        Command::Receive { port, dest, once } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(dest) = dest {
                config.destination = dest;
            }
            config.validate()?;
            receive(config, once).await
        }
    }
}

/// Append the configured port unless `addr` already names one.
fn with_default_port(addr: &str, port: u16) -> String {
    if addr.parse::<SocketAddr>().is_ok() {
        return addr.to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, p)) if !host.contains(':') && p.parse::<u16>().is_ok() => addr.to_string(),
        _ if addr.contains(':') => format!("[{}]:{}", addr.trim_matches(['[', ']']), port),
        _ => format!("{}:{}", addr, port),
    }
}

async fn send(config: Config, addr: &str, paths: Vec<PathBuf>) -> Result<()> {
    let bundle = Bundle::from_paths(&paths).context("Failed to collect files to send")?;
    let addr = with_default_port(addr, config.port);
    let total = bundle.total_size();

    println!(
        "Sending {} item(s), {} to {}",
        bundle.len(),
        HumanBytes(total),
        addr.bold()
    );

    let (events_tx, events_rx) = event_channel();
    let ctx = config.session_context(events_tx);
    let ids = IdAllocator::default();
    let (session, stop) = transfer::connect(addr.as_str(), ids.allocate(), bundle, ctx)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;

    let progress = tokio::spawn(render_send_progress(events_rx));
    let mut task = tokio::spawn(session.run());

    let result = tokio::select! {
        res = &mut task => res,
        _ = tokio::signal::ctrl_c() => {
            stop.stop();
            task.await
        }
    }
    .context("Transfer task panicked")?;
    let _ = progress.await;

    let stats = result.context("Transfer failed")?;
    println!(
        "{} Sent {} item(s), {}",
        "✓".green(),
        stats.items,
        HumanBytes(stats.bytes_transferred)
    );
    Ok(())
}

async fn render_send_progress(mut events: EventReceiver) {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    while let Some(event) = events.recv().await {
        match event.kind {
            TransferEventKind::Progress(pct) => bar.set_position(pct as u64),
            TransferEventKind::ItemSent { name, .. } => bar.set_message(name),
            TransferEventKind::Succeeded => bar.set_position(100),
            TransferEventKind::Finished => break,
            _ => {}
        }
    }
    bar.finish_and_clear();
}

async fn receive(config: Config, once: bool) -> Result<()> {
    tokio::fs::create_dir_all(&config.destination)
        .await
        .with_context(|| format!("Failed to create {}", config.destination.display()))?;

    let (events_tx, mut events) = event_channel();
    let ctx = config.session_context(events_tx);
    let acceptor = SessionAcceptor::bind(("0.0.0.0", config.port), ctx)
        .await
        .with_context(|| format!("Failed to listen on port {}", config.port))?;
    let handle = acceptor.handle();

    println!(
        "Receiving as {} on {}, saving to {}",
        config.device_name.bold(),
        acceptor.local_addr()?,
        config.destination.display()
    );

    let server = tokio::spawn(acceptor.run());

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                if once && event.kind == TransferEventKind::Finished {
                    handle.shutdown();
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                handle.shutdown();
                for id in handle.active_transfers() {
                    handle.stop_transfer(id);
                }
                break;
            }
        }
    }

    server.await.context("Acceptor task panicked")??;
    Ok(())
}

fn print_event(event: &TransferEvent) {
    let id = event.id;
    match &event.kind {
        TransferEventKind::Connected => println!("{} incoming connection", id),
        TransferEventKind::HeaderReceived {
            device_name,
            count,
            size,
        } => println!(
            "{} {} is sending {} item(s), {}",
            id,
            device_name.bold(),
            count,
            HumanBytes(*size)
        ),
        TransferEventKind::ItemReceived { name, size } => {
            println!("{}   {} ({})", id, name, HumanBytes(*size))
        }
        TransferEventKind::Succeeded => println!("{} {} transfer complete", id, "✓".green()),
        TransferEventKind::Failed(msg) => println!("{} {} {}", id, "✗".red(), msg),
        TransferEventKind::ItemSent { .. }
        | TransferEventKind::Progress(_)
        | TransferEventKind::Finished => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("10.0.0.2", 40818), "10.0.0.2:40818");
        assert_eq!(with_default_port("10.0.0.2:9000", 40818), "10.0.0.2:9000");
        assert_eq!(with_default_port("laptop.local", 1), "laptop.local:1");
        assert_eq!(with_default_port("laptop.local:22", 1), "laptop.local:22");
        assert_eq!(with_default_port("fe80::1", 5), "[fe80::1]:5");
        assert_eq!(with_default_port("[::1]:7", 5), "[::1]:7");
    }
}
