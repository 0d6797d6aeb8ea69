// src/recorder.rs
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use crate::classifier::ChannelClassifier;

/// Streams per-tick readings to CSV: elapsed seconds, then one numeric
/// reading and one activation flag per channel.
pub struct ReadingRecorder<W: Write = BufWriter<File>> {
    writer: Option<W>,
    started: Instant,
    columns: Option<usize>,
    rows: usize,
}

impl ReadingRecorder<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>, now: Instant) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        log::debug!("recording readings to {}", path.as_ref().display());
        Ok(Self::new(BufWriter::new(file), now))
    }
}

impl<W: Write> ReadingRecorder<W> {
    pub fn new(writer: W, now: Instant) -> Self {
        Self {
            writer: Some(writer),
            started: now,
            columns: None,
            rows: 0,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Appends one row. The header is written on the first row, sized to the
    /// channel count at that moment; later rows are padded or cut to match.
    pub fn record(&mut self, now: Instant, classifier: &ChannelClassifier) -> io::Result<()> {
        let Some(w) = self.writer.as_mut() else {
            return Ok(());
        };
        let columns = match self.columns {
            Some(columns) => columns,
            None => {
                let columns = classifier.num_channels();
                write!(w, "Timestamp")?;
                for c in 0..columns {
                    write!(w, ",Ch{c}")?;
                }
                for c in 0..columns {
                    write!(w, ",Active{c}")?;
                }
                writeln!(w)?;
                self.columns = Some(columns);
                columns
            }
        };
        let t = now.saturating_duration_since(self.started).as_secs_f64();
        write!(w, "{t:.4}")?;
        for c in 0..columns {
            write!(w, ",{:.2}", classifier.read_numeric(c))?;
        }
        for c in 0..columns {
            write!(w, ",{}", u8::from(classifier.read_bool(c)))?;
        }
        writeln!(w)?;
        self.rows += 1;
        Ok(())
    }

    /// Flushes and hands back the writer. Further records are ignored.
    pub fn stop(&mut self) -> io::Result<Option<W>> {
        match self.writer.take() {
            Some(mut w) => {
                w.flush()?;
                log::debug!("recording saved ({} rows)", self.rows);
                Ok(Some(w))
            }
            None => Ok(None),
        }
    }
}
