use alloy::primitives::Address;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use std::{fmt::Write, path::PathBuf, time::Duration};

use crate::board::{BoardSnapshot, ClearMessage, Outcome};
use crate::bootstrap::{Bootstrap, BootstrapConfig};

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Chain the wallet starts on
    #[arg(short = 'c', long)]
    pub chain_id: Option<u64>,

    /// Persist decryption signatures to this JSON file
    #[arg(short = 's', long)]
    pub signature_file: Option<PathBuf>,

    /// Validity window of new decryption signatures, in days
    #[arg(long)]
    pub validity_days: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Args {
    /// Command-line values override the environment.
    pub fn apply(&self, cfg: &mut BootstrapConfig) {
        if let Some(chain_id) = self.chain_id {
            cfg.chain_id = chain_id;
        }
        if let Some(path) = &self.signature_file {
            cfg.signature_file = Some(path.clone());
        }
        if let Some(days) = self.validity_days {
            cfg.decryption_validity_days = days;
        }
    }
}

#[derive(Debug, Subcommand, Clone)]
pub enum Commands {
    /// Connect and print the board status
    Status,
    /// Send a message from the first account to the second and decrypt it as
    /// the recipient
    Demo {
        #[arg(default_value = "hi")]
        text: String,
    },
}

/// Text rendering of the board status panels.
pub fn render_report(snapshot: &BoardSnapshot) -> String {
    let mut out = String::new();
    let board = &snapshot.board;
    let opt = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());

    let _ = writeln!(out, "Chain infos");
    let _ = writeln!(out, "  Lifecycle: {}", snapshot.lifecycle());
    let _ = writeln!(
        out,
        "  ChainId: {}",
        opt(snapshot.session.as_ref().map(|s| s.chain_id.to_string()))
    );
    let _ = writeln!(
        out,
        "  Account: {}",
        opt(snapshot.session.as_ref().map(|s| s.address.to_string()))
    );
    let _ = writeln!(
        out,
        "  Provider: {}",
        opt(snapshot.session.as_ref().and_then(|s| s.readonly_provider.clone()))
    );

    let _ = writeln!(out, "Contract");
    let _ = writeln!(
        out,
        "  Address: {}",
        opt(board.contract_address.map(|a| a.to_string()))
    );
    let _ = writeln!(
        out,
        "  isDeployed: {}",
        opt(board.is_deployed.map(|d| d.to_string()))
    );

    let _ = writeln!(out, "FHEVM instance");
    let _ = writeln!(out, "  Status: {}", snapshot.instance_status());
    let _ = writeln!(out, "  Error: {}", opt(snapshot.fhe.error.clone()));

    let _ = writeln!(out, "Flags");
    let _ = writeln!(out, "  canSendMessage: {}", snapshot.can_send_message());
    let _ = writeln!(out, "  canGetMessages: {}", snapshot.can_get_messages());
    let _ = writeln!(out, "  canDecrypt: {}", snapshot.can_decrypt());
    let _ = writeln!(
        out,
        "  isSending: {} isRefreshing: {} isDecrypting: {}",
        board.is_sending,
        board.is_refreshing,
        snapshot.is_decrypting()
    );

    let _ = writeln!(out, "Messages");
    for (label, ids) in [
        ("Sent", &board.sent_messages),
        ("Received", &board.received_messages),
    ] {
        let _ = writeln!(out, "  {label}: {}", ids.len());
        for id in ids {
            let clear = snapshot.clear_text(*id).unwrap_or("<encrypted>");
            let _ = writeln!(out, "    #{id}: {clear}");
        }
    }

    let _ = writeln!(out, "Status");
    let _ = writeln!(out, "  Message: {}", board.message);
    let _ = writeln!(
        out,
        "  Error: {}",
        opt(board.last_error.as_ref().map(|e| e.to_string()))
    );
    out
}

/// Connect the selected account and wait until the board can send.
pub async fn connect(app: &Bootstrap) -> anyhow::Result<BoardSnapshot> {
    app.sessions
        .connect()
        .await
        .context("Failed to connect wallet")?;
    let snapshot = tokio::time::timeout(
        WAIT_TIMEOUT,
        app.coordinator.wait_for(|s| {
            s.can_send_message() || s.board.is_deployed == Some(false) || s.fhe.error.is_some()
        }),
    )
    .await
    .context("Timed out waiting for the message board")?;
    Ok(snapshot)
}

/// Send `text` from the first account to the second, then switch to the
/// second account and decrypt the message.
pub async fn run_demo(app: &Bootstrap, text: &str) -> anyhow::Result<ClearMessage> {
    let snapshot = connect(app).await?;
    if !snapshot.can_send_message() {
        bail!("Message board is not usable:\n{}", render_report(&snapshot));
    }

    let accounts = app.wallet.addresses();
    let recipient: Address = *accounts
        .get(1)
        .context("The demo needs at least two wallet accounts")?;

    app.coordinator
        .send_message(&recipient.to_string(), text)
        .await
        .context("Failed to send message")?;
    info!("Sender view:\n{}", render_report(&app.coordinator.snapshot()));

    app.wallet
        .switch_account(1)
        .context("Failed to switch wallet account")?;
    let snapshot = tokio::time::timeout(
        WAIT_TIMEOUT,
        app.coordinator.wait_for(|s| {
            s.session.as_ref().is_some_and(|session| session.address == recipient)
                && s.board.account == Some(recipient)
                && s.can_decrypt()
                && !s.board.received_messages.is_empty()
        }),
    )
    .await
    .context("Timed out waiting for the recipient's messages")?;

    let id = *snapshot
        .board
        .received_messages
        .last()
        .context("Recipient has no messages")?;
    match app
        .coordinator
        .decrypt_message(id)
        .await
        .context("Failed to decrypt message")?
    {
        Outcome::Committed(clear) => Ok(clear),
        Outcome::Discarded => bail!("Wallet session changed while decrypting"),
    }
}
