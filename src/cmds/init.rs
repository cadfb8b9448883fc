// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to initialize the database and on-disk layout.

use super::OpenMode;
use crate::cmds::run::config::ConfigFile;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

/// Initializes the database directory and schema.
///
/// Idempotent: an existing database only gets missing tables and columns
/// added, never anything dropped.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    /// Path to the configuration file.
    #[bpaf(argument("PATH"), fallback("/etc/sightline.toml".into()))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    base::tracing_setup::install();
    let config = super::run::read_config(&args.config)?;
    init_layout(&config)?;
    Ok(0)
}

pub(crate) fn init_layout(config: &ConfigFile) -> Result<(), Error> {
    let (_lock, mut conn) = super::open_conn(&config.database.path, OpenMode::Create)?;
    db::db::init(&mut conn)?;
    db::SnapshotDir::open(&config.snapshots.root)?;
    info!(
        db = %config.database.path.display(),
        snapshots = %config.snapshots.root.display(),
        "initialized"
    );
    Ok(())
}
