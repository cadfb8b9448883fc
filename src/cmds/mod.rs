// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{err, Error, ErrorKind, ResultExt as _};
use nix::fcntl::FlockArg;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd};
use std::path::Path;
use tracing::info;

pub mod init;
pub mod run;
pub mod sql;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    Create,
}

/// A held lock on the database directory; keep it open as long as the
/// `Connection` is.
#[derive(Debug)]
pub struct DirLock(#[allow(dead_code)] OwnedFd);

/// Locks the directory holding the database without opening the database.
fn open_dir(db_dir: &Path, mode: OpenMode) -> Result<DirLock, Error> {
    if mode == OpenMode::Create {
        std::fs::create_dir_all(db_dir).map_err(|e| {
            err!(
                Unavailable,
                "unable to create db dir {}: {e}",
                db_dir.display()
            )
        })?;
    }
    let fd = nix::fcntl::open(
        db_dir,
        nix::fcntl::OFlag::O_DIRECTORY | nix::fcntl::OFlag::O_RDONLY,
        nix::sys::stat::Mode::empty(),
    )
    .map_err(|e| {
        if e == nix::Error::ENOENT {
            err!(
                NotFound,
                "db dir {} not found; try running sightline init",
                db_dir.display()
            )
        } else {
            err!(Unavailable, "unable to open db dir {}: {e}", db_dir.display())
        }
    })?;
    // Safety: `fd` was just returned by `open` and is owned by no one else.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let ro = mode == OpenMode::ReadOnly;
    nix::fcntl::flock(
        fd.as_raw_fd(),
        if ro {
            FlockArg::LockSharedNonblock
        } else {
            FlockArg::LockExclusiveNonblock
        },
    )
    .map_err(|e| {
        err!(
            Unavailable,
            "unable to get {} lock on db dir {}: {e} (is another sightline process running?)",
            if ro { "shared" } else { "exclusive" },
            db_dir.display()
        )
    })?;
    Ok(DirLock(fd))
}

/// Locks the database directory and opens the database file.
pub fn open_conn(
    db_path: &Path,
    mode: OpenMode,
) -> Result<(DirLock, rusqlite::Connection), Error> {
    let db_dir = db_path
        .parent()
        .ok_or_else(|| err!(InvalidArgument, "db path {} has no parent", db_path.display()))?;
    let dir = open_dir(db_dir, mode)?;
    info!(
        "opening {} in {:?} mode with SQLite version {}",
        db_path.display(),
        mode,
        rusqlite::version()
    );
    let conn = rusqlite::Connection::open_with_flags(
        db_path,
        match mode {
            OpenMode::ReadOnly => rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
            OpenMode::ReadWrite => rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::Create => {
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            }
        } |
        // rusqlite::Connection is not Sync, so there's no reason to tell
        // SQLite3 to use the serialized threading mode.
        rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .err_kind(ErrorKind::Unavailable)?;
    Ok((dir, conn))
}
