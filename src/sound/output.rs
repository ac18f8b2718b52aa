use std::{io::Cursor, sync::Arc};

use anyhow::{Context, Result};
use rodio::{Decoder, OutputStream, Sink};

/// Encoded bytes of one clip, shared between loop iterations.
pub type ClipData = Arc<[u8]>;

/// Opens sinks on the playback thread. Implementations hold no
/// device state themselves since output streams are not `Send`.
pub trait AudioOutput: Send + Sync {
    /// Rejects clips that cannot be decoded before a playback thread is spawned.
    fn probe(&self, _clip: &ClipData) -> Result<()> {
        Ok(())
    }

    fn open(&self) -> Result<Box<dyn ClipSink>>;
}

/// One open output. Lives and dies on the playback thread.
pub trait ClipSink {
    /// Queues one full pass of `clip`.
    fn start(&mut self, clip: &ClipData) -> Result<()>;

    fn is_finished(&self) -> bool;

    fn stop(&mut self);
}

/// The default output device through rodio.
#[derive(Default)]
pub struct RodioOutput;

impl AudioOutput for RodioOutput {
    fn probe(&self, clip: &ClipData) -> Result<()> {
        Decoder::new(Cursor::new(clip.clone())).context("unsupported audio format")?;
        Ok(())
    }

    fn open(&self) -> Result<Box<dyn ClipSink>> {
        let (stream, handle) =
            OutputStream::try_default().context("Failed to create audio output stream")?;
        let sink = Sink::try_new(&handle).context("Failed to create audio sink")?;
        Ok(Box::new(RodioSink {
            _stream: stream,
            sink,
        }))
    }
}

struct RodioSink {
    // Dropping the stream silences the sink.
    _stream: OutputStream,
    sink: Sink,
}

impl ClipSink for RodioSink {
    fn start(&mut self, clip: &ClipData) -> Result<()> {
        let source = Decoder::new(Cursor::new(clip.clone())).context("Failed to decode clip")?;
        self.sink.append(source);
        self.sink.play();
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.sink.empty()
    }

    fn stop(&mut self) {
        self.sink.stop();
    }
}

#[cfg(test)]
pub(crate) use fake::FakeOutput;
