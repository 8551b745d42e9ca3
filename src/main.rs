//! Kommandozeilen-Client
//!
//! `dialtone <nummer>` meldet sich am Store-Relay an und liest Befehle
//! von stdin: dial <nummer>, accept, reject, end, mute, speaker, quit.

use anyhow::{Context, Result};
use dialtone::call::{CallEvent, CallPhase};
use dialtone::config::Config;
use dialtone::endpoint::EndpointId;
use dialtone::media::WebRtcEngine;
use dialtone::store::RemoteStore;
use dialtone::Endpoint;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const HELP: &str = "commands: dial <number> | accept | reject | end | mute | speaker | quit";

#[tokio::main]
async fn main() -> Result<()> {
    dialtone::init_tracing();

    let raw_id = std::env::args()
        .nth(1)
        .context("usage: dialtone <endpoint-id>")?;
    let config = Config::load().context("Failed to load config")?;
    let local = EndpointId::from_dialed(&raw_id, &config.country_prefix, config.number_length)?;

    let store = RemoteStore::connect(&config.store_url)
        .await
        .context("Failed to connect to store relay")?;
    store.start_heartbeat(config.heartbeat());

    let endpoint = Endpoint::login(local, store, Arc::new(WebRtcEngine::new()), config).await?;
    println!("Logged in as {}", endpoint.local_id());
    println!("{}", HELP);

    let mut events = endpoint.calls().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::StateChanged(snapshot)) => match &snapshot.phase {
                    CallPhase::Connected => {
                        println!("[{}] connected", snapshot.elapsed_display())
                    }
                    phase => println!("{:?}", phase),
                },
                Ok(CallEvent::IncomingCall { from, .. }) => {
                    println!("Incoming call from {} (accept/reject)", from)
                }
                Ok(CallEvent::Failed(e)) => println!("Call failed: {}", e),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let calls = endpoint.calls().clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let result = match (parts.next(), parts.next()) {
            (None, _) => continue,
            (Some("dial"), Some(number)) => calls
                .dial(number)
                .await
                .map(|call_id| println!("Calling {} ({})", number, call_id)),
            (Some("accept"), _) => calls.accept_incoming().await,
            (Some("reject"), _) => calls.reject_incoming().await,
            (Some("end"), _) => calls.end_call().await,
            (Some("mute"), _) => calls.set_muted(!calls.state().muted).await,
            (Some("speaker"), _) => calls.set_speaker(!calls.state().speaker).await,
            (Some("quit"), _) => break,
            _ => {
                println!("{}", HELP);
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("Error: {}", e);
        }
    }

    endpoint.logout().await?;
    printer.abort();
    Ok(())
}
