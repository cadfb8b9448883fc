// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The per-camera entry direction descriptor.
//!
//! An [`EntryDirection`] designates which way through the region of interest
//! counts as an entry; its negation is an exit. It is persisted as a string
//! in `camera_config.entry_direction` and validated at write time: either a
//! symbolic code from a closed set, or a free `"x,y"` vector with magnitude
//! ≥ 1e-6.

use base::{bail, err, Error};
use std::fmt;
use std::str::FromStr;

const MIN_VECTOR_MAGNITUDE: f64 = 1e-6;

const FRAC_1_SQRT_2: f64 = std::f64::consts::FRAC_1_SQRT_2;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EntryDirection {
    /// Left-to-right is entry.
    Ltr,
    /// Right-to-left is entry.
    Rtl,
    /// Bottom-to-top is entry.
    Btt,
    /// Top-to-bottom is entry.
    Ttb,
    /// Bottom-left to top-right is entry.
    Bltr,
    /// Bottom-right to top-left is entry.
    Brtl,
    /// Top-left to bottom-right is entry.
    Tlbr,
    /// Top-right to bottom-left is entry.
    Trbl,
    /// Moving inward is entry. Reserved; classifies as `Ltr` pending a
    /// radial implementation.
    In,
    /// Moving outward is entry. Reserved likewise.
    Out,
    /// Free direction vector, as parsed (not yet normalized).
    Vector(f64, f64),
}

impl EntryDirection {
    /// Returns the unit entry-direction vector in image coordinates
    /// (x grows rightward, y grows downward).
    pub fn unit(&self) -> (f64, f64) {
        match *self {
            EntryDirection::Ltr => (1.0, 0.0),
            EntryDirection::Rtl => (-1.0, 0.0),
            EntryDirection::Btt => (0.0, -1.0),
            EntryDirection::Ttb => (0.0, 1.0),
            EntryDirection::Bltr => (FRAC_1_SQRT_2, -FRAC_1_SQRT_2),
            EntryDirection::Brtl => (-FRAC_1_SQRT_2, -FRAC_1_SQRT_2),
            EntryDirection::Tlbr => (FRAC_1_SQRT_2, FRAC_1_SQRT_2),
            EntryDirection::Trbl => (-FRAC_1_SQRT_2, FRAC_1_SQRT_2),
            EntryDirection::In | EntryDirection::Out => (1.0, 0.0),
            EntryDirection::Vector(x, y) => {
                let m = (x * x + y * y).sqrt();
                (x / m, y / m)
            }
        }
    }
}

impl FromStr for EntryDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "LTR" => return Ok(EntryDirection::Ltr),
            "RTL" => return Ok(EntryDirection::Rtl),
            "BTT" => return Ok(EntryDirection::Btt),
            "TTB" => return Ok(EntryDirection::Ttb),
            "BLTR" => return Ok(EntryDirection::Bltr),
            "BRTL" => return Ok(EntryDirection::Brtl),
            "TLBR" => return Ok(EntryDirection::Tlbr),
            "TRBL" => return Ok(EntryDirection::Trbl),
            "IN" => return Ok(EntryDirection::In),
            "OUT" => return Ok(EntryDirection::Out),
            _ => {}
        }
        let Some((x, y)) = s.split_once(',') else {
            bail!(
                InvalidArgument,
                "entry direction {s:?} is neither a known code nor an \"x,y\" vector"
            );
        };
        let parse = |v: &str| {
            v.trim()
                .parse::<f64>()
                .map_err(|_| err!(InvalidArgument, "bad direction component {v:?}"))
        };
        let (x, y) = (parse(x)?, parse(y)?);
        if !x.is_finite() || !y.is_finite() {
            bail!(InvalidArgument, "direction vector {s:?} is not finite");
        }
        if (x * x + y * y).sqrt() < MIN_VECTOR_MAGNITUDE {
            bail!(InvalidArgument, "direction vector {s:?} is too small");
        }
        Ok(EntryDirection::Vector(x, y))
    }
}

impl fmt::Display for EntryDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EntryDirection::Ltr => f.write_str("LTR"),
            EntryDirection::Rtl => f.write_str("RTL"),
            EntryDirection::Btt => f.write_str("BTT"),
            EntryDirection::Ttb => f.write_str("TTB"),
            EntryDirection::Bltr => f.write_str("BLTR"),
            EntryDirection::Brtl => f.write_str("BRTL"),
            EntryDirection::Tlbr => f.write_str("TLBR"),
            EntryDirection::Trbl => f.write_str("TRBL"),
            EntryDirection::In => f.write_str("IN"),
            EntryDirection::Out => f.write_str("OUT"),
            EntryDirection::Vector(x, y) => write!(f, "{x},{y}"),
        }
    }
}
