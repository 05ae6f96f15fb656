/*
sfmap, to encode and flash sparse images: replay module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::mpsc::{sync_channel, Receiver, SyncSender},
    thread,
};

use indicatif::ProgressBar;

use crate::{
    chunk::{Chunk, CHUNK_SIZE, CHUNK_SIZE_U64},
    pretty::{human_bytes, mebibytes},
    sfmap::SFMapReader,
    Error, Result,
};

/// Records between two progress lines
const PROGRESS_INTERVAL: u64 = 256;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReplayError {
    #[error("short write at 0x{offset:x}, only {written} bytes of the chunk \
        were written")]
    ShortWrite {
        offset: u64,
        written: usize,
    },
}

/// Something chunks can be replayed onto
pub(crate) trait Device: Write + Seek {
    /// Block until every write so far is durable
    fn sync(&mut self) -> std::io::Result<()>;
}

impl Device for File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

/// Where the device cursor sits after the last write, `None` before the first
#[derive(Default, Debug, Clone, Copy)]
pub(crate) struct Position {
    expected: Option<u64>,
}

impl Position {
    pub(crate) fn needs_seek(&self, offset: u64) -> bool {
        self.expected != Some(offset)
    }

    pub(crate) fn is_backwards(&self, offset: u64) -> bool {
        matches!(self.expected, Some(expected) if offset < expected)
    }

    pub(crate) fn advance(&mut self, chunk: &Chunk) {
        self.expected = Some(chunk.end())
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplayReport {
    pub(crate) records: u64,
    pub(crate) bytes: u64,
    pub(crate) seeks: u64,
    /// Whether the final sync succeeded, writes are not known durable if not
    pub(crate) synced: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct FlashOptions {
    /// Records the decoder may run ahead of the writer
    pub(crate) queue_depth: usize,
    /// Open the target with O_SYNC
    pub(crate) sync_writes: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            queue_depth: 1000,
            sync_writes: true,
        }
    }
}

fn write_chunk<D: Device>(
    device: &mut D, position: &mut Position, chunk: &Chunk,
    report: &mut ReplayReport
)
    -> Result<()>
{
    if position.needs_seek(chunk.offset) {
        if position.is_backwards(chunk.offset) {
            log::warn!("Record at 0x{:x} goes backwards, out of order input",
                chunk.offset);
        }
        log::debug!("Seeking to 0x{:x}", chunk.offset);
        device.seek(SeekFrom::Start(chunk.offset))?;
        report.seeks += 1;
    }
    let written = device.write(&chunk.data)?;
    if written != CHUNK_SIZE {
        log::error!("Short write at 0x{:x}: {} bytes", chunk.offset, written);
        return Err(ReplayError::ShortWrite {
            offset: chunk.offset, written }.into())
    }
    position.advance(chunk);
    report.records += 1;
    report.bytes += CHUNK_SIZE_U64;
    Ok(())
}

/// Write every queued chunk in arrival order until the sender hangs up, then
/// sync the device. A failed sync is logged and reported, not returned.
pub(crate) fn drain<D: Device>(receiver: Receiver<Chunk>, device: &mut D)
    -> Result<ReplayReport>
{
    let mut report = ReplayReport::default();
    let mut position = Position::default();
    for chunk in receiver.iter() {
        write_chunk(device, &mut position, &chunk, &mut report)?
    }
    match device.sync() {
        Ok(()) => report.synced = true,
        Err(e) => log::error!("Could not sync target: {}", e),
    }
    Ok(report)
}

fn progress_due(count: u64) -> bool {
    count % PROGRESS_INTERVAL == 0
}

/// Decode records into the queue, returns how many were queued. Stops early
/// without error if the writer hung up, the writer's result carries why.
fn produce<R: Read>(
    reader: SFMapReader<R>, sender: SyncSender<Chunk>, bar: &ProgressBar
)
    -> Result<u64>
{
    let mut count = 0;
    for chunk in reader {
        let chunk = chunk?;
        if progress_due(count) {
            bar.suspend(|| log::info!("Processed {:.2} MiB",
                mebibytes(chunk.offset)));
        }
        count += 1;
        bar.set_position(chunk.end());
        if sender.send(chunk).is_err() {
            break
        }
    }
    Ok(count)
}

/// Replay every record of `reader` onto `device` through a bounded queue and
/// a dedicated writer thread. Writes happen strictly in decode order.
pub(crate) fn replay<R, D>(
    reader: SFMapReader<R>, device: D, queue_depth: usize, bar: &ProgressBar
)
    -> Result<ReplayReport>
where
    R: Read,
    D: Device + Send + 'static,
{
    let (sender, receiver) = sync_channel(queue_depth);
    let writer = thread::Builder::new()
        .name("sfmap-writer".into())
        .spawn(move || {
            let mut device = device;
            drain(receiver, &mut device)
        })?;
    // Dropping the sender inside closes the queue, so the writer finishes
    // even when decoding fails.
    let produced = produce(reader, sender, bar);
    let report = writer.join().map_err(|_| Error::WriterPanicked)??;
    let queued = produced?;
    if queued != report.records {
        log::warn!("Queued {} records but {} were written",
            queued, report.records);
    }
    Ok(report)
}

fn open_target(path: &Path, sync_writes: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if sync_writes {
            options.custom_flags(libc::O_SYNC);
        }
    }
    #[cfg(not(unix))]
    let _ = sync_writes;
    match options.open(path) {
        Ok(file) => Ok(file),
        Err(e) => {
            log::error!("Could not open target '{}': {}", path.display(), e);
            Err(e.into())
        }
    }
}

/// Flash the SFMap at `sfmap` onto the existing file or block device at
/// `target`
pub(crate) fn flash_file<P1, P2>(sfmap: P1, target: P2, options: FlashOptions)
    -> Result<ReplayReport>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
{
    let sfmap = sfmap.as_ref();
    let target = target.as_ref();
    let mut device = open_target(target, options.sync_writes)?;
    let length = device.seek(SeekFrom::End(0))?;
    device.rewind()?;
    let reader = SFMapReader::open(sfmap)?;
    log::info!("Flashing '{}' onto '{}' ({})",
        sfmap.display(), target.display(), human_bytes(length));
    let bar = crate::progress::progress_bar_bytes(length, "Flashing")?;
    let result = replay(reader, device, options.queue_depth, &bar);
    bar.finish_and_clear();
    let report = result?;
    log::info!("Finished reading SFMap, wrote {} records ({}) with {} seeks",
        report.records, human_bytes(report.bytes), report.seeks);
    Ok(report)
}
