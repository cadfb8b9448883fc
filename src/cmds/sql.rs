// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to run the `sqlite3` CLI on the database.

use super::OpenMode;
use base::{err, Error};
use bpaf::Bpaf;
use std::path::PathBuf;
use std::process::Command;

/// Opens the `sqlite3` shell on the database.
///
/// The database directory lock is held (shared for `--read-only`,
/// exclusive otherwise) for the lifetime of the shell, so a running
/// `sightline run` blocks a writable shell and vice versa.
#[derive(Bpaf, Debug)]
#[bpaf(command("sql"))]
pub struct Args {
    /// Path to the configuration file.
    #[bpaf(argument("PATH"), fallback("/etc/sightline.toml".into()))]
    config: PathBuf,

    /// Open the database in read-only mode.
    #[bpaf(switch)]
    read_only: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    base::tracing_setup::install();
    let config = super::run::read_config(&args.config)?;
    let mode = if args.read_only {
        OpenMode::ReadOnly
    } else {
        OpenMode::ReadWrite
    };
    // Hold the lock; the shell itself opens its own connection.
    let (_lock, conn) = super::open_conn(&config.database.path, mode)?;
    drop(conn);
    let mut cmd = Command::new("sqlite3");
    if args.read_only {
        cmd.arg("-readonly");
    }
    cmd.arg(&config.database.path);
    let status = cmd
        .status()
        .map_err(|e| err!(Unavailable, "couldn't run sqlite3: {e}"))?;
    Ok(status.code().unwrap_or(1))
}
