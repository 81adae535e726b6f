// src/resource/trace.rs

//! Named output artefacts a resource can produce.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Declaration of a trace a resource type can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSpec {
    pub name: String,
    pub help: String,
}

impl TraceSpec {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
        }
    }
}

/// What to retrieve from a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceQuery {
    /// The complete content.
    All,
    /// `block` bytes starting at `offset * block`.
    Stream { block: usize, offset: usize },
    /// Where the trace is stored.
    Path,
    /// Size of the trace in bytes.
    Size,
}

impl Default for TraceQuery {
    fn default() -> Self {
        TraceQuery::All
    }
}

/// Answer to a [`TraceQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceOutput {
    Content(Vec<u8>),
    Path(PathBuf),
    Size(u64),
}

impl TraceOutput {
    /// Content as (lossy) UTF-8, if this is a content answer.
    pub fn as_text(&self) -> Option<String> {
        match self {
            TraceOutput::Content(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }
}

/// Answer `query` for a trace stored in a local file.
pub fn read_trace_file(path: &Path, query: TraceQuery) -> Result<TraceOutput> {
    match query {
        TraceQuery::Path => Ok(TraceOutput::Path(path.to_path_buf())),
        TraceQuery::Size => {
            let meta = std::fs::metadata(path)
                .with_context(|| format!("reading metadata of trace file {:?}", path))?;
            Ok(TraceOutput::Size(meta.len()))
        }
        TraceQuery::All => {
            let bytes =
                std::fs::read(path).with_context(|| format!("reading trace file {:?}", path))?;
            Ok(TraceOutput::Content(bytes))
        }
        TraceQuery::Stream { block, offset } => {
            let mut file =
                File::open(path).with_context(|| format!("opening trace file {:?}", path))?;
            let start = (block as u64).saturating_mul(offset as u64);
            file.seek(SeekFrom::Start(start))
                .with_context(|| format!("seeking trace file {:?}", path))?;

            let mut buf = Vec::with_capacity(block);
            file.take(block as u64)
                .read_to_end(&mut buf)
                .with_context(|| format!("reading trace file {:?}", path))?;
            Ok(TraceOutput::Content(buf))
        }
    }
}
