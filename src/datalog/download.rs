//! Chunked log download.
//!
//! The board answers a `DownloadLog` command with a series of `LogChunk`
//! messages.  Every chunk repeats the number of entries that were
//! buffered when the download started, so progress is simply
//! `received / total`.
//!
//! ```text
//! LogChunk { total: 5, entries: [e0, e1] }      progress 0.4
//! LogChunk { total: 5, entries: [e2, e3] }      progress 0.8
//! LogChunk { total: 5, entries: [e4] }          complete
//! ```
//!
//! A download whose first chunk reports zero entries completes at once.

use log::{debug, warn};

use crate::codec::EntryDecoder;
use crate::error::{Error, Result};
use crate::graph::EventId;
use crate::link::RawLogEntry;
use crate::register::{DataKind, RegisterAddr};

use super::{LogEntry, LogHandler, ProgressHandler};

/// Reassembly buffer for incoming log chunks.
#[derive(Debug, Default)]
pub struct LogReassembler {
    total: Option<u32>,
    entries: Vec<RawLogEntry>,
}

impl LogReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk.  Returns the download progress after it.
    pub fn feed(&mut self, total_entries: u32, chunk: Vec<RawLogEntry>) -> f32 {
        let total = *self.total.get_or_insert(total_entries);
        if total != total_entries {
            warn!(
                "log chunk reports {} entries, download started with {}",
                total_entries, total
            );
        }
        self.entries.extend(chunk);
        self.progress()
    }

    /// Fraction of the download received so far.
    pub fn progress(&self) -> f32 {
        match self.total {
            None => 0.0,
            Some(0) => 1.0,
            Some(total) => (self.entries.len() as f32 / total as f32).min(1.0),
        }
    }

    /// Whether every announced entry has arrived.
    pub fn is_complete(&self) -> bool {
        self.total
            .is_some_and(|total| self.entries.len() >= total as usize)
    }

    pub fn received(&self) -> usize {
        self.entries.len()
    }

    /// Hand out the collected entries, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<RawLogEntry> {
        self.total = None;
        core::mem::take(&mut self.entries)
    }
}

/// One in-flight download.
pub struct LogDownload {
    event: EventId,
    source: RegisterAddr,
    kind: DataKind,
    stop_after: bool,
    reassembler: LogReassembler,
    on_complete: LogHandler,
    on_progress: Option<ProgressHandler>,
    last_progress: f32,
}

impl LogDownload {
    pub fn new(
        event: EventId,
        source: RegisterAddr,
        kind: DataKind,
        stop_after: bool,
        on_complete: LogHandler,
        on_progress: Option<ProgressHandler>,
    ) -> Self {
        Self {
            event,
            source,
            kind,
            stop_after,
            reassembler: LogReassembler::new(),
            on_complete,
            on_progress,
            last_progress: 0.0,
        }
    }

    pub fn event(&self) -> EventId {
        self.event
    }

    pub fn source(&self) -> RegisterAddr {
        self.source
    }

    pub fn stop_after(&self) -> bool {
        self.stop_after
    }

    /// Feed one chunk.  Reports intermediate progress and returns whether
    /// the download is complete.  The final 1.0 is left to
    /// [`finish`](Self::finish).
    pub fn feed(&mut self, total_entries: u32, chunk: Vec<RawLogEntry>) -> bool {
        let progress = self.reassembler.feed(total_entries, chunk);
        debug!(
            "log download from {}: {}/{} entries",
            self.source,
            self.reassembler.received(),
            total_entries
        );
        if self.reassembler.is_complete() {
            return true;
        }
        if progress > self.last_progress {
            self.last_progress = progress;
            if let Some(on_progress) = self.on_progress.as_mut() {
                on_progress(progress);
            }
        }
        false
    }

    /// Decode every received entry with the event's data kind.
    pub fn decode<D: EntryDecoder>(&mut self, decoder: &D) -> Result<Vec<LogEntry>> {
        self.reassembler
            .take()
            .into_iter()
            .map(|raw| {
                let value = decoder
                    .decode(self.kind, &raw.payload)
                    .map_err(Error::Decode)?;
                Ok(LogEntry {
                    timestamp_ms: raw.timestamp_ms,
                    value,
                })
            })
            .collect()
    }

    /// Report progress 1.0.  Only the first call has an effect.
    fn report_complete(&mut self) {
        if self.last_progress >= 1.0 {
            return;
        }
        self.last_progress = 1.0;
        if let Some(on_progress) = self.on_progress.as_mut() {
            on_progress(1.0);
        }
    }

    /// Report 1.0, then deliver the final result.  Failures end the
    /// progress sequence too.
    pub fn finish(mut self, result: Result<Vec<LogEntry>>) {
        self.report_complete();
        (self.on_complete)(result);
    }
}
