// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! GStreamer capture backend.
//!
//! Each open source runs a small pipeline ending in an `appsink` that
//! delivers RGB24 frames:
//!
//!   v4l2src / filesrc / rtspsrc-souphttpsrc → decodebin → videoconvert
//!     [→ videoscale → capsfilter] → appsink
//!
//! `sync=false` on the appsink: live sources run at device rate, and file
//! pacing is the capture loop's job (it honors the file's declared FPS in
//! interruptible slices).

use super::{Frame, Geometry, Opener, Source, Stream};
use base::{err, Error, ErrorKind, ResultExt as _};
use gstreamer::prelude::*;
use gstreamer_video::VideoInfo;
use std::sync::OnceLock;

const PULL_TIMEOUT: gstreamer::ClockTime = gstreamer::ClockTime::from_seconds(5);

pub struct GstOpener {}

impl GstOpener {
    pub fn new() -> Result<Self, Error> {
        static INIT: OnceLock<Result<(), String>> = OnceLock::new();
        INIT.get_or_init(|| gstreamer::init().map_err(|e| e.to_string()))
            .clone()
            .map_err(|e| err!(Internal, "gstreamer init failed: {e}"))?;
        Ok(GstOpener {})
    }
}

fn pipeline_description(source: &Source, geometry: Geometry) -> String {
    let scale = format!(
        "videoconvert ! videoscale ! video/x-raw,format=RGB,width={},height={}",
        geometry.width, geometry.height
    );
    let sink = "appsink name=sink max-buffers=4 drop=true sync=false";
    match source {
        Source::Device(i) => {
            format!("v4l2src device=/dev/video{i} ! {scale} ! {sink}")
        }
        // Files keep their native geometry; their declared FPS drives pacing.
        Source::File(p) => format!(
            "filesrc location=\"{}\" ! decodebin ! videoconvert ! video/x-raw,format=RGB ! {sink}",
            p.display()
        ),
        Source::Url(u) if u.scheme() == "rtsp" => format!(
            "rtspsrc location=\"{u}\" latency=200 protocols=tcp ! decodebin ! {scale} ! {sink}"
        ),
        Source::Url(u) => {
            format!("souphttpsrc location=\"{u}\" ! decodebin ! {scale} ! {sink}")
        }
    }
}

impl Opener for GstOpener {
    fn open(&self, source: &Source, geometry: Geometry) -> Result<Box<dyn Stream>, Error> {
        let desc = pipeline_description(source, geometry);
        let pipeline = gstreamer::parse::launch(&desc)
            .map_err(|e| err!(Unavailable, "unable to build pipeline for {source}: {e}"))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| err!(Internal, "parsed launch string is not a pipeline"))?;
        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| err!(Internal, "pipeline has no appsink"))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| err!(Internal, "sink element is not an appsink"))?;
        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| err!(Unavailable, "unable to start {source}: {e}"))?;
        Ok(Box::new(GstStream {
            pipeline,
            appsink,
            is_file: source.is_file(),
            declared_fps: None,
        }))
    }
}

struct GstStream {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    is_file: bool,
    declared_fps: Option<f64>,
}

impl GstStream {
    fn frame_from_sample(&mut self, sample: &gstreamer::Sample) -> Result<Frame, Error> {
        let caps = sample
            .caps()
            .ok_or_else(|| err!(Unavailable, "sample has no caps"))?;
        let info = VideoInfo::from_caps(caps).err_kind(ErrorKind::Unavailable)?;
        if self.is_file && self.declared_fps.is_none() {
            let fps = info.fps();
            if fps.numer() > 0 && fps.denom() > 0 {
                self.declared_fps = Some(fps.numer() as f64 / fps.denom() as f64);
            }
        }
        let buffer = sample
            .buffer()
            .ok_or_else(|| err!(Unavailable, "sample has no buffer"))?;
        let map = buffer.map_readable().err_kind(ErrorKind::Unavailable)?;

        // RGB rows may be padded to 4-byte alignment; repack tightly.
        let (width, height) = (info.width(), info.height());
        let src_stride = info.stride()[0] as usize;
        let row = width as usize * 3;
        let data = map.as_slice();
        let mut packed = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            let start = y * src_stride;
            packed.extend_from_slice(&data[start..start + row]);
        }
        Frame::new(width, height, packed)
    }
}

impl Stream for GstStream {
    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        match self.appsink.try_pull_sample(PULL_TIMEOUT) {
            Some(sample) => Ok(Some(self.frame_from_sample(&sample)?)),
            None if self.appsink.is_eos() => Ok(None),
            None => Err(err!(Unavailable, "timed out waiting for a frame")),
        }
    }

    fn declared_fps(&self) -> Option<f64> {
        self.declared_fps
    }
}

impl Drop for GstStream {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}
