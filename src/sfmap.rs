/*
sfmap, to encode and flash sparse images: SFMap codec module
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

// # SFMap format
// A single gzip stream, no header, footer or index. Inside it records are
// packed back to back, each one the fixint little-endian bincode of a Chunk:
// 0		le u64	offset		\b, multiple of CHUNK_SIZE
// 8		le u64	length		\b, always CHUNK_SIZE
// 16		u8[length]	data
// The stream ends cleanly only on a record boundary.

use std::{fs::File, io::{BufRead, BufReader, BufWriter, Read, Write}, path::Path};

use bincode::Options;
use cli_table::{format::Justify, Cell, Style, Table};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use indicatif::ProgressBar;

use crate::{
    chunk::{read_chunk, Chunk, Classifier, Tally, CHUNK_SIZE, CHUNK_SIZE_U64},
    pretty::human_bytes,
    replay::Position,
    Result,
};

/// Encoded size of a full record, anything longer is corrupt
const SIZE_RECORD: u64 = 2 * std::mem::size_of::<u64>() as u64 + CHUNK_SIZE_U64;

/// Highest offset a chunk may start at, so that its end still fits in the
/// signed offset a seek takes
pub(crate) const LIMIT_OFFSET: u64 = i64::MAX as u64 - CHUNK_SIZE_U64;

#[derive(Debug, thiserror::Error)]
pub(crate) enum SFMapError {
    #[error("record at 0x{offset:x} carries {length} bytes instead of a full chunk")]
    MalformedRecord {
        offset: u64,
        length: usize,
    },
    #[error("record offset 0x{offset:x} is not aligned to a chunk boundary")]
    MisalignedOffset {
        offset: u64,
    },
    #[error("record offset 0x{offset:x} is beyond any seekable target")]
    OffsetOutOfRange {
        offset: u64,
    },
}

fn record_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(SIZE_RECORD)
}

pub(crate) struct SFMapWriter<W: Write> {
    encoder: BufWriter<GzEncoder<W>>,
    records: u64,
}

impl SFMapWriter<BufWriter<File>> {
    pub(crate) fn create<P: AsRef<Path>>(path: P, level: u32) -> Result<Self> {
        let path = path.as_ref();
        match File::create(path) {
            Ok(file) => Ok(Self::new(BufWriter::new(file), level)),
            Err(e) => {
                log::error!("Could not create SFMap '{}': {}", path.display(), e);
                Err(e.into())
            }
        }
    }
}

impl<W: Write> SFMapWriter<W> {
    pub(crate) fn new(inner: W, level: u32) -> Self {
        Self {
            encoder: BufWriter::new(
                GzEncoder::new(inner, Compression::new(level))),
            records: 0,
        }
    }

    pub(crate) fn write(&mut self, chunk: &Chunk) -> Result<()> {
        record_options().serialize_into(&mut self.encoder, chunk)?;
        self.records += 1;
        Ok(())
    }

    pub(crate) fn records(&self) -> u64 {
        self.records
    }

    /// Finalize the gzip trailer and hand back the flushed inner writer. The
    /// stream is corrupt at its tail unless this is called.
    pub(crate) fn finish(self) -> Result<W> {
        let encoder = self.encoder.into_inner()
            .map_err(|e| e.into_error())?;
        let mut inner = encoder.finish()?;
        inner.flush()?;
        Ok(inner)
    }
}

pub(crate) struct SFMapReader<R: Read> {
    /// `None` for a zero-byte input, which holds no gzip member at all
    decoder: Option<BufReader<GzDecoder<BufReader<R>>>>,
}

impl SFMapReader<File> {
    pub(crate) fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match File::open(path) {
            Ok(file) => Self::new(file),
            Err(e) => {
                log::error!("Could not open SFMap '{}': {}", path.display(), e);
                Err(e.into())
            }
        }
    }
}

impl<R: Read> SFMapReader<R> {
    pub(crate) fn new(inner: R) -> Result<Self> {
        let mut inner = BufReader::new(inner);
        let decoder = if inner.fill_buf()?.is_empty() {
            None
        } else {
            Some(BufReader::new(GzDecoder::new(inner)))
        };
        Ok(Self { decoder })
    }

    /// The next record, or `None` once the stream ended cleanly on a record
    /// boundary
    pub(crate) fn read(&mut self) -> Result<Option<Chunk>> {
        let decoder = match self.decoder.as_mut() {
            Some(decoder) => decoder,
            None => return Ok(None),
        };
        if decoder.fill_buf()?.is_empty() {
            return Ok(None)
        }
        let chunk: Chunk = record_options().deserialize_from(decoder)?;
        if chunk.data.len() != CHUNK_SIZE {
            return Err(SFMapError::MalformedRecord {
                offset: chunk.offset, length: chunk.data.len() }.into())
        }
        if chunk.offset % CHUNK_SIZE_U64 != 0 {
            return Err(SFMapError::MisalignedOffset {
                offset: chunk.offset }.into())
        }
        if chunk.offset > LIMIT_OFFSET {
            return Err(SFMapError::OffsetOutOfRange {
                offset: chunk.offset }.into())
        }
        Ok(Some(chunk))
    }
}

impl<R: Read> Iterator for SFMapReader<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read().transpose()
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct EncodeOptions {
    /// gzip level, 0 to 9
    pub(crate) level: u32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self { level: 1 }
    }
}

/// Classify every whole chunk of `image` and write the meaningful ones. A
/// trailing partial chunk is dropped.
pub(crate) fn encode<R, W>(
    image: &mut R, writer: &mut SFMapWriter<W>, bar: &ProgressBar
)
    -> Result<Tally>
where
    R: Read,
    W: Write,
{
    let mut classifier = Classifier::new();
    let mut buffer = Box::new([0; CHUNK_SIZE]);
    let mut offset = 0;
    loop {
        let size = read_chunk(image, &mut buffer)?;
        if size < CHUNK_SIZE {
            if size > 0 {
                log::warn!("Discarding trailing {} bytes at 0x{:x}, not a \
                    whole chunk", size, offset);
            }
            break
        }
        if let Some(chunk) = classifier.classify(offset, &buffer) {
            writer.write(&chunk)?
        }
        offset += CHUNK_SIZE_U64;
        bar.set_position(offset);
    }
    Ok(classifier.tally())
}

pub(crate) struct EncodeSummary {
    pub(crate) tally: Tally,
    pub(crate) records: u64,
    pub(crate) output_size: u64,
}

impl EncodeSummary {
    pub(crate) fn print_table_stdout(&self) -> Result<()> {
        let rows = [
            ["Bytes scanned".cell(), human_bytes(self.tally.total).cell()],
            ["Bytes trimmed".cell(), human_bytes(self.tally.empty).cell()],
            ["Bytes kept".cell(), human_bytes(self.tally.kept()).cell()],
            ["Records".cell(), self.records.cell()],
            ["SFMap size".cell(), human_bytes(self.output_size).cell()],
        ].map(|[key, value]| [key, value.justify(Justify::Right)]);
        let table = rows.table().title([
            "Item".cell().bold(true).justify(Justify::Center),
            "Value".cell().bold(true).justify(Justify::Center),
        ]).bold(true);
        cli_table::print_stdout(table)?;
        Ok(())
    }
}

pub(crate) fn encode_file<P1, P2>(image: P1, output: P2, options: EncodeOptions)
    -> Result<EncodeSummary>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
{
    let image = image.as_ref();
    let output = output.as_ref();
    let mut image_file = match File::open(image) {
        Ok(file) => BufReader::new(file),
        Err(e) => {
            log::error!("Could not open image '{}': {}", image.display(), e);
            return Err(e.into())
        }
    };
    let length = image_file.get_ref().metadata()?.len();
    let mut writer = SFMapWriter::create(output, options.level)?;
    log::info!("Encoding '{}' ({}) into '{}'",
        image.display(), human_bytes(length), output.display());
    let bar = crate::progress::progress_bar_bytes(length, "Encoding")?;
    let tally = encode(&mut image_file, &mut writer, &bar)?;
    bar.finish_and_clear();
    let records = writer.records();
    let output_file = writer.finish()?
        .into_inner()
        .map_err(|e| e.into_error())?;
    let output_size = output_file.metadata()?.len();
    log::info!("Done. {}", tally);
    Ok(EncodeSummary { tally, records, output_size })
}

/// What a flash of an SFMap would do, without doing it
#[derive(Default, Debug)]
pub(crate) struct Inspection {
    pub(crate) records: u64,
    pub(crate) first: Option<u64>,
    pub(crate) last: Option<u64>,
    pub(crate) seeks: u64,
    pub(crate) ascending: bool,
}

impl Inspection {
    pub(crate) fn payload(&self) -> u64 {
        self.records * CHUNK_SIZE_U64
    }

    /// Bytes of the target the records span, from the first record's offset
    /// to the end of the furthest one
    pub(crate) fn span(&self) -> u64 {
        match (self.first, self.last) {
            (Some(first), Some(last)) => last + CHUNK_SIZE_U64 - first,
            _ => 0,
        }
    }

    pub(crate) fn print_table_stdout(&self) -> Result<()> {
        let range = match (self.first, self.last) {
            (Some(first), Some(last)) =>
                format!("0x{:x} - 0x{:x}", first, last + CHUNK_SIZE_U64),
            _ => "-".into(),
        };
        let rows = [
            ["Records".cell(), self.records.cell()],
            ["Payload".cell(), human_bytes(self.payload()).cell()],
            ["Range".cell(), range.cell()],
            ["Span".cell(), human_bytes(self.span()).cell()],
            ["Seeks".cell(), self.seeks.cell()],
            ["Ascending".cell(),
                if self.ascending { "yes" } else { "no" }.cell()],
        ].map(|[key, value]| [key, value.justify(Justify::Right)]);
        let table = rows.table().title([
            "Item".cell().bold(true).justify(Justify::Center),
            "Value".cell().bold(true).justify(Justify::Center),
        ]).bold(true);
        cli_table::print_stdout(table)?;
        Ok(())
    }
}

pub(crate) fn inspect<R: Read>(reader: SFMapReader<R>) -> Result<Inspection> {
    let mut inspection = Inspection { ascending: true, ..Default::default() };
    let mut position = Position::default();
    for chunk in reader {
        let chunk = chunk?;
        if position.needs_seek(chunk.offset) {
            inspection.seeks += 1
        }
        position.advance(&chunk);
        match inspection.last {
            Some(last) if chunk.offset <= last => inspection.ascending = false,
            _ => (),
        }
        inspection.first = Some(match inspection.first {
            Some(first) => first.min(chunk.offset),
            None => chunk.offset,
        });
        inspection.last = Some(match inspection.last {
            Some(last) => last.max(chunk.offset),
            None => chunk.offset,
        });
        inspection.records += 1;
    }
    Ok(inspection)
}

pub(crate) fn inspect_file<P: AsRef<Path>>(path: P) -> Result<Inspection> {
    inspect(SFMapReader::open(path)?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::chunk::fill_sentinel;

    use super::*;

    fn sentinel_chunks(count: usize) -> Vec<u8> {
        let mut image = vec![0; count * CHUNK_SIZE];
        fill_sentinel(&mut image);
        image
    }

    fn encode_to_vec(image: &[u8]) -> (Tally, Vec<u8>) {
        let mut writer = SFMapWriter::new(Vec::new(), 6);
        let tally = encode(&mut Cursor::new(image), &mut writer,
            &ProgressBar::hidden()).unwrap();
        (tally, writer.finish().unwrap())
    }

    fn decode_all(sfmap: &[u8]) -> Vec<Chunk> {
        SFMapReader::new(sfmap).unwrap().collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn zero_chunk_after_blank_chunk() {
        let mut image = sentinel_chunks(2);
        image[CHUNK_SIZE..].fill(0);
        let (tally, sfmap) = encode_to_vec(&image);
        let chunks = decode_all(&sfmap);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 32768);
        assert!(chunks[0].data.iter().all(|byte| *byte == 0));
        assert_eq!(tally, Tally { total: 65536, empty: 32768 });
    }

    #[test]
    fn only_meaningful_chunks_are_emitted() {
        let mut image = sentinel_chunks(8);
        let meaningful = [1, 2, 5, 7];
        for id in meaningful {
            image[id * CHUNK_SIZE + id] = id as u8;
        }
        let (tally, sfmap) = encode_to_vec(&image);
        let chunks = decode_all(&sfmap);
        assert_eq!(chunks.len(), meaningful.len());
        for (chunk, id) in chunks.iter().zip(meaningful) {
            assert_eq!(chunk.offset, (id * CHUNK_SIZE) as u64);
            assert_eq!(chunk.data.as_slice(),
                &image[id * CHUNK_SIZE..(id + 1) * CHUNK_SIZE]);
        }
        assert_eq!(tally.total, 8 * CHUNK_SIZE_U64);
        assert_eq!(tally.empty, 4 * CHUNK_SIZE_U64);
        assert_eq!(tally.kept(),
            chunks.iter().map(|chunk| chunk.data.len() as u64).sum::<u64>());
    }

    #[test]
    fn trailing_partial_chunk_is_dropped() {
        let mut image = vec![0x42; 2 * CHUNK_SIZE + 1000];
        image[..CHUNK_SIZE].copy_from_slice(&sentinel_chunks(1));
        let (tally, sfmap) = encode_to_vec(&image);
        let chunks = decode_all(&sfmap);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, CHUNK_SIZE_U64);
        assert_eq!(tally.total, 2 * CHUNK_SIZE_U64);
    }

    #[test]
    fn empty_image_gives_empty_stream() {
        let (tally, sfmap) = encode_to_vec(&[]);
        assert_eq!(tally, Tally::default());
        assert!(!sfmap.is_empty());
        assert!(decode_all(&sfmap).is_empty());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let image = vec![0x11; 4 * CHUNK_SIZE];
        let (_, sfmap) = encode_to_vec(&image);
        let truncated = &sfmap[..sfmap.len() - 4];
        let results: Vec<Result<Chunk>> = SFMapReader::new(truncated).unwrap().collect();
        assert!(results.iter().any(|result| result.is_err()));
    }

    #[test]
    fn corrupt_stream_is_an_error() {
        let image: Vec<u8> = (0..4 * CHUNK_SIZE).map(|id| (id * 7 % 251) as u8).collect();
        let (_, mut sfmap) = encode_to_vec(&image);
        let middle = sfmap.len() / 2;
        for byte in sfmap[middle..middle + 16].iter_mut() {
            *byte ^= 0xa5
        }
        let results: Vec<Result<Chunk>> = SFMapReader::new(sfmap.as_slice()).unwrap().collect();
        assert!(results.iter().any(|result| result.is_err()));
    }

    #[test]
    fn short_payload_is_malformed() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        let chunk = Chunk { offset: 0, data: vec![0; 16] };
        record_options().serialize_into(&mut encoder, &chunk).unwrap();
        let sfmap = encoder.finish().unwrap();
        match SFMapReader::new(sfmap.as_slice()).unwrap().read() {
            Err(crate::Error::SFMapError(SFMapError::MalformedRecord {
                offset: 0, length: 16 })) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        let chunk = Chunk { offset: 512, data: vec![0; CHUNK_SIZE] };
        record_options().serialize_into(&mut encoder, &chunk).unwrap();
        let sfmap = encoder.finish().unwrap();
        assert!(matches!(SFMapReader::new(sfmap.as_slice()).unwrap().read(),
            Err(crate::Error::SFMapError(
                SFMapError::MisalignedOffset { offset: 512 }))));
    }

    fn single_record_stream(chunk: &Chunk) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        record_options().serialize_into(&mut encoder, chunk).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn offset_past_seekable_range_is_rejected() {
        for offset in [u64::MAX - 0x7fff, LIMIT_OFFSET + 1, i64::MAX as u64 + 1] {
            let offset = offset / CHUNK_SIZE_U64 * CHUNK_SIZE_U64;
            let chunk = Chunk { offset, data: vec![0; CHUNK_SIZE] };
            let sfmap = single_record_stream(&chunk);
            match SFMapReader::new(sfmap.as_slice()).unwrap().read() {
                Err(crate::Error::SFMapError(SFMapError::OffsetOutOfRange {
                    offset: rejected })) => assert_eq!(rejected, offset),
                other => panic!("unexpected result for 0x{:x}: {:?}",
                    offset, other),
            }
        }
    }

    #[test]
    fn last_seekable_chunk_is_accepted() {
        let offset = LIMIT_OFFSET / CHUNK_SIZE_U64 * CHUNK_SIZE_U64;
        let chunk = Chunk { offset, data: vec![0; CHUNK_SIZE] };
        let sfmap = single_record_stream(&chunk);
        let mut reader = SFMapReader::new(sfmap.as_slice()).unwrap();
        let decoded = reader.read().unwrap().expect("record should decode");
        assert_eq!(decoded.end(), offset + CHUNK_SIZE_U64);
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn zero_byte_stream_is_empty() {
        let mut reader = SFMapReader::new(std::io::empty()).unwrap();
        assert!(reader.read().unwrap().is_none());
        let inspection = inspect(SFMapReader::new(std::io::empty()).unwrap()).unwrap();
        assert_eq!(inspection.records, 0);
        assert_eq!(inspection.span(), 0);
    }

    #[test]
    fn inspection_counts_discontinuities() {
        let mut image = sentinel_chunks(6);
        for id in [0, 1, 3, 4, 5] {
            image[id * CHUNK_SIZE] = 0;
        }
        let (_, sfmap) = encode_to_vec(&image);
        let inspection = inspect(SFMapReader::new(sfmap.as_slice()).unwrap()).unwrap();
        assert_eq!(inspection.records, 5);
        // first record, then the gap over chunk 2
        assert_eq!(inspection.seeks, 2);
        assert!(inspection.ascending);
        assert_eq!(inspection.span(), 6 * CHUNK_SIZE_U64);
        assert_eq!(inspection.payload(), 5 * CHUNK_SIZE_U64);
    }

    #[test]
    fn encode_file_reports_summary() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("disk.img");
        let output_path = dir.path().join("disk.img.sfmap");
        let mut image = sentinel_chunks(3);
        image[2 * CHUNK_SIZE..].fill(0x33);
        std::fs::write(&image_path, &image).unwrap();
        let summary = encode_file(&image_path, &output_path,
            EncodeOptions::default()).unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.tally.empty, 2 * CHUNK_SIZE_U64);
        assert_eq!(summary.output_size,
            std::fs::metadata(&output_path).unwrap().len());
        let inspection = inspect_file(&output_path).unwrap();
        assert_eq!(inspection.first, Some(2 * CHUNK_SIZE_U64));
    }

    #[test]
    fn missing_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(encode_file(dir.path().join("missing.img"),
            dir.path().join("out.sfmap"), EncodeOptions::default()).is_err());
        assert!(SFMapReader::open(dir.path().join("missing.sfmap")).is_err());
    }
}
