// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::Parser;
use std::path::PathBuf;

/// ZapAI — an AI reply bot on a relay-based pub/sub network, paid per
/// request in sats.
///
/// Configuration comes from the environment (BOT_PRIVATE_KEY,
/// GEMINI_API_KEY, NOSTR_RELAYS, …); the flags below override individual
/// values for local runs.
#[derive(Parser, Debug)]
#[command(name = "zapai", version, about)]
pub struct Cli {
    /// Comma-separated relay URLs (overrides NOSTR_RELAYS).
    #[arg(long)]
    pub relays: Option<String>,

    /// Status/health HTTP port (overrides WEB_PORT).
    #[arg(long)]
    pub web_port: Option<u16>,

    /// Directory for the embedded store (overrides BOT_DATA_DIR).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).  RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
