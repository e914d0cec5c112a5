use std::{
    env,
    fs::File,
    io::{self, BufWriter, Write},
    ops::Range,
    thread,
};

use anyhow::{Context, Result};
use memchr::memchr;
use memmap2::MmapOptions;

use table::{StationKey, StationTable};

/// Replicated low bits, one per byte lane.
const LANE_LSB: u64 = 0x0101_0101_0101_0101;
/// Replicated high bits, one per byte lane.
const LANE_MSB: u64 = 0x8080_8080_8080_8080;

const SEMICOLONS: u64 = broadcast(b';');
const NEWLINES: u64 = broadcast(b'\n');
const ASCII_ZEROS: u64 = broadcast(b'0');

/// Slots per worker table. Power of two, sized so the expected station
/// cardinality keeps the load factor low; the table never grows.
const TABLE_CAPACITY: usize = 1 << 14;

/// Inputs at or below this size are scanned by a single worker; the thread
/// setup cost only pays off on genuinely large files.
const PARALLEL_THRESHOLD: usize = i32::MAX as usize;

/// Computes per-station minimum, mean and maximum over a `name;value`
/// measurements file, in the spirit of the One Billion Row Challenge.
fn main() -> Result<()> {
    // todo: worker count override via a second CLI argument
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("./measurements.txt"));
    let file = File::open(&path).with_context(|| format!("couldn't open input file {path:?}"))?;
    // SAFETY: the mapping is read-only; the input is not expected to be
    // truncated or rewritten while the scan runs.
    let mmap = unsafe { MmapOptions::new().map(&file) }
        .with_context(|| format!("couldn't memory-map {path:?}"))?;
    let region = ByteRegion::new(&mmap);

    let mut buffered_stdout = BufWriter::with_capacity(2 * 1024 * 1024, io::stdout());
    process(worker_count(region.len()), region, &mut buffered_stdout)?;
    writeln!(buffered_stdout)?;
    buffered_stdout.flush()?;
    Ok(())
}

fn worker_count(input_len: usize) -> usize {
    if input_len <= PARALLEL_THRESHOLD {
        return 1;
    }
    match thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(_) => {
            eprintln!("couldn't query the available parallelism, going single-threaded");
            1
        }
    }
}

/// Collects min, mean and max for each station named in `region`, scanning
/// with `workers` parallel chunk scans, and writes the sorted result as
/// `{first=min/mean/max, second=min/mean/max}`.
fn process(workers: usize, region: ByteRegion<'_>, out: &mut impl Write) -> io::Result<()> {
    let chunks = plan_chunks(region, workers);
    let mut tables: Vec<StationTable> = (0..chunks.len())
        .map(|_| StationTable::with_capacity(TABLE_CAPACITY))
        .collect();

    thread::scope(|scope| {
        for (table, chunk) in tables.iter_mut().zip(chunks) {
            scope.spawn(move || scan_chunk(region, chunk, table));
        }
    }); // scope ends, all workers were joined

    // Fold every worker's table into the first one. Byte-exact key equality
    // holds across chunks since all keys index the same region.
    let mut tables = tables.into_iter();
    let mut merged = tables
        .next()
        .unwrap_or_else(|| StationTable::with_capacity(TABLE_CAPACITY));
    for table in tables {
        merged.merge_from(region, &table);
    }

    let mut entries = merged.snapshot(region);
    write!(out, "{{")?;
    if let Some((first_name, first)) = entries.pop_first() {
        write!(out, "{first_name}={first}")?;
        for (name, stats) in entries {
            write!(out, ", {name}={stats}")?;
        }
    }
    write!(out, "}}")?;
    Ok(())
}

/// Splits `region` into `workers` contiguous half-open ranges. Every interior
/// boundary sits one past a line terminator, so no record is ever split; the
/// ranges are disjoint and together cover the whole region.
fn plan_chunks(region: ByteRegion<'_>, workers: usize) -> Vec<Range<usize>> {
    let len = region.len();
    let workers = workers.max(1);
    let nominal = len / workers;
    let mut chunks = Vec::with_capacity(workers);
    let mut start = 0;
    for i in 1..workers {
        let boundary = match next_line_end(region, i * nominal) {
            Some(pos) => pos + 1,
            // no terminator left; the remaining chunks cover nothing
            None => len,
        };
        chunks.push(start..boundary);
        start = boundary;
    }
    chunks.push(start..len);
    chunks
}

/// Position of the first line terminator at or after `offset`, scanning a
/// word at a time with a byte-wise tail.
fn next_line_end(region: ByteRegion<'_>, mut offset: usize) -> Option<usize> {
    let len = region.len();
    while offset + 8 <= len {
        let word = region.word_at(offset);
        if let Some(index) = find_byte(word, NEWLINES) {
            return Some(offset + index);
        }
        offset += 8;
    }
    memchr(b'\n', region.slice(offset..len)).map(|index| offset + index)
}

/// Scans every `name;value` record in `chunk` and folds the measurements
/// into `table`. Assumes the chunk starts at the start of a record and ends
/// one past a line terminator (or at the end of the region).
fn scan_chunk(region: ByteRegion<'_>, chunk: Range<usize>, table: &mut StationTable) {
    let mut offset = chunk.start;
    while offset < chunk.end {
        let name_start = offset;

        let mut delimiter = None;
        while chunk.end - offset >= 8 {
            let word = region.word_at(offset);
            if let Some(index) = find_byte(word, SEMICOLONS) {
                delimiter = Some(offset + index);
                break;
            }
            offset += 8;
        }
        let Some(delimiter) = delimiter
            .or_else(|| memchr(b';', region.slice(offset..chunk.end)).map(|index| offset + index))
        else {
            // no complete record remains in this chunk
            break;
        };

        let mut key = StationKey::new(name_start, delimiter - name_start);
        let (value, next) = decode_value(region, delimiter + 1);
        table.record(region, &mut key).update(value);
        offset = next;
    }
}

/// Decodes a measurement of the form `["-"] digit{1,2} "." digit` followed
/// by a line terminator, starting right after the field delimiter. Returns
/// the value in tenths together with the offset one past the terminator.
fn decode_value(region: ByteRegion<'_>, mut offset: usize) -> (i16, usize) {
    let negative = region.byte_at(offset) == b'-';
    offset += negative as usize;

    if region.len() - offset >= 8 {
        let word = region.word_at(offset);
        if let Some(end) = find_byte(word, NEWLINES) {
            // Digits live at bytes 0..end except the decimal point at
            // end-2. Squeeze the point out: keep the whole-part bytes and
            // pull the tenths byte down one lane.
            let digits = word ^ ASCII_ZEROS;
            let whole_bits = 8 * (end - 2);
            let packed =
                (digits & ((1u64 << whole_bits) - 1)) | ((digits >> 8) & (0xFFu64 << whole_bits));
            // Most significant digit first, whatever the digit count.
            let ordered = (packed as u32).swap_bytes() >> (8 * (5 - end));
            let magnitude =
                (ordered & 0xFF) + 10 * ((ordered >> 8) & 0xFF) + 100 * ((ordered >> 16) & 0xFF);
            let value = magnitude as i16;
            return (if negative { -value } else { value }, offset + end + 1);
        }
    }

    // Byte-at-a-time tail, reached only near the end of the region where a
    // whole word is no longer readable.
    let mut value = region.byte_at(offset).wrapping_sub(b'0') as i16;
    offset += 1;
    loop {
        let byte = region.byte_at(offset);
        offset += 1;
        if byte == b'.' {
            break;
        }
        value = value * 10 + byte.wrapping_sub(b'0') as i16;
    }
    value = value * 10 + region.byte_at(offset).wrapping_sub(b'0') as i16;
    offset += 2; // fraction digit and line terminator
    (if negative { -value } else { value }, offset)
}

const fn broadcast(byte: u8) -> u64 {
    LANE_LSB * byte as u64
}

/// Nonzero iff `word` contains a zero byte; the borrow out of each lane sets
/// that lane's high bit. Exact for ASCII-range input.
#[inline]
fn has_zero_byte(word: u64) -> u64 {
    word.wrapping_sub(LANE_LSB) & !word & LANE_MSB
}

/// Index of the first zero byte (0 = lowest-addressed), given a nonzero
/// `has_zero_byte` result.
#[inline]
fn first_zero_byte_index(mask: u64) -> usize {
    (((mask.wrapping_sub(1) & LANE_LSB).wrapping_mul(LANE_LSB) >> 56) - 1) as usize
}

/// First byte of `word` equal to the byte replicated in `spread`, if any.
#[inline]
fn find_byte(word: u64, spread: u64) -> Option<usize> {
    let mask = has_zero_byte(word ^ spread);
    (mask != 0).then(|| first_zero_byte_index(mask))
}

/// Read-only view of the mapped input. All scanning works on plain offsets
/// into this region; raw pointers never leave it.
#[derive(Clone, Copy)]
struct ByteRegion<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteRegion<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn len(self) -> usize {
        self.bytes.len()
    }

    #[inline]
    fn byte_at(self, offset: usize) -> u8 {
        debug_assert!(offset < self.bytes.len());
        // SAFETY: chunk planning and the word-loop guards keep offsets in
        // bounds on well-formed input.
        unsafe { *self.bytes.get_unchecked(offset) }
    }

    /// Eight bytes at `offset`, unaligned, lowest-addressed byte least
    /// significant. Callers must leave at least eight readable bytes.
    #[inline]
    fn word_at(self, offset: usize) -> u64 {
        debug_assert!(offset + 8 <= self.bytes.len());
        // SAFETY: guarded by the eight-byte checks at every call site.
        let word = unsafe { self.bytes.as_ptr().add(offset).cast::<u64>().read_unaligned() };
        u64::from_le(word)
    }

    fn slice(self, range: Range<usize>) -> &'a [u8] {
        &self.bytes[range]
    }
}

/// Fixed-capacity open-addressing table keyed by byte ranges of the input
/// region. One private instance per worker; no locking anywhere.
mod table {
    use std::{collections::BTreeMap, fmt};

    use crate::ByteRegion;

    /// Probe step policy for collision resolution.
    pub trait ProbeSequence {
        fn next_slot(&self, slot: usize, attempt: usize, capacity: usize) -> usize;
    }

    /// Quadratic stepping: the i-th retry advances the current slot by i².
    pub struct QuadraticProbe;

    impl ProbeSequence for QuadraticProbe {
        fn next_slot(&self, slot: usize, attempt: usize, capacity: usize) -> usize {
            (slot + attempt * attempt) % capacity
        }
    }

    /// A station name as a byte range of the input region. Identity is the
    /// referenced byte content, never the offset: two keys pointing at
    /// different copies of the same name are the same key.
    #[derive(Clone, Copy)]
    pub struct StationKey {
        offset: usize,
        len: usize,
        hash: u32,
    }

    impl StationKey {
        pub fn new(offset: usize, len: usize) -> Self {
            Self {
                offset,
                len,
                hash: 0,
            }
        }

        pub fn bytes<'a>(&self, region: ByteRegion<'a>) -> &'a [u8] {
            region.slice(self.offset..self.offset + self.len)
        }

        /// Hash of the first eight key bytes, folded to 32 bits. Zero
        /// doubles as the "not computed yet" marker; a genuine zero hash is
        /// recomputed on every lookup, which costs time but stays correct.
        pub fn prefix_hash(&mut self, region: ByteRegion<'_>) -> u32 {
            if self.hash == 0 {
                self.hash = fold_prefix(region, self.offset, self.len);
            }
            self.hash
        }

        fn matches(&self, other: &StationKey, region: ByteRegion<'_>) -> bool {
            self.len == other.len && self.bytes(region) == other.bytes(region)
        }
    }

    fn fold_prefix(region: ByteRegion<'_>, offset: usize, len: usize) -> u32 {
        let word = if offset + 8 <= region.len() {
            region.word_at(offset)
        } else {
            // key close to the end of the region; assemble the word without
            // reading past it, the zero padding is shifted out below
            let tail = region.slice(offset..region.len());
            let mut bytes = [0u8; 8];
            bytes[..tail.len()].copy_from_slice(tail);
            u64::from_le_bytes(bytes)
        };
        // first key byte most significant, bytes past the key shifted out
        let prefix = word.swap_bytes() >> (8 * 8usize.saturating_sub(len));
        (prefix ^ (prefix >> 32)) as u32
    }

    /// Aggregate of all measurements seen for one station, in tenths.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StationStats {
        pub min: i16,
        pub max: i16,
        pub sum: i64,
        pub count: u32,
    }

    impl Default for StationStats {
        fn default() -> Self {
            Self {
                min: i16::MAX,
                max: i16::MIN,
                sum: 0,
                count: 0,
            }
        }
    }

    impl StationStats {
        pub fn update(&mut self, value: i16) {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
            self.sum += value as i64;
            self.count += 1;
        }

        pub fn merge(&mut self, other: &Self) {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
            self.sum += other.sum;
            self.count += other.count;
        }
    }

    impl fmt::Display for StationStats {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{:.1}/{:.1}/{:.1}",
                self.min as f32 / 10.,
                self.sum as f64 / 10. / self.count as f64,
                self.max as f32 / 10.
            )
        }
    }

    pub struct StationTable<P: ProbeSequence = QuadraticProbe> {
        keys: Box<[Option<StationKey>]>,
        records: Box<[StationStats]>,
        mask: usize,
        probe: P,
    }

    impl StationTable<QuadraticProbe> {
        pub fn with_capacity(capacity: usize) -> Self {
            Self::with_probe(capacity, QuadraticProbe)
        }
    }

    impl<P: ProbeSequence> StationTable<P> {
        /// Capacity must be a power of two and generous for the expected
        /// number of distinct keys: the table never resizes, and filling it
        /// up degrades to unbounded probing.
        pub fn with_probe(capacity: usize, probe: P) -> Self {
            assert!(capacity.is_power_of_two());
            Self {
                keys: vec![None; capacity].into_boxed_slice(),
                records: vec![StationStats::default(); capacity].into_boxed_slice(),
                mask: capacity - 1,
                probe,
            }
        }

        /// The mutable record for `key`, inserting a fresh one on first
        /// sight. Only the key's offset, length and cached hash are stored;
        /// the name bytes stay in the region, which outlives the table.
        pub fn record(
            &mut self,
            region: ByteRegion<'_>,
            key: &mut StationKey,
        ) -> &mut StationStats {
            let mut slot = key.prefix_hash(region) as usize & self.mask;
            let mut attempt = 0;
            while let Some(existing) = self.keys[slot] {
                if existing.matches(key, region) {
                    return &mut self.records[slot];
                }
                attempt += 1;
                slot = self.probe.next_slot(slot, attempt, self.mask + 1);
            }
            self.keys[slot] = Some(*key);
            &mut self.records[slot]
        }

        /// Folds every occupied entry of `other` into this table. Both
        /// tables must key into the same region.
        pub fn merge_from(&mut self, region: ByteRegion<'_>, other: &StationTable<P>) {
            for (key, stats) in other.entries() {
                let mut key = *key;
                self.record(region, &mut key).merge(stats);
            }
        }

        pub fn entries(&self) -> impl Iterator<Item = (&StationKey, &StationStats)> {
            self.keys
                .iter()
                .zip(self.records.iter())
                .filter_map(|(key, stats)| key.as_ref().map(|key| (key, stats)))
        }

        /// Decodes every stored key into text, which nothing on the scan
        /// path ever does, and hands the aggregates out in lexicographic
        /// name order.
        pub fn snapshot(&self, region: ByteRegion<'_>) -> BTreeMap<String, StationStats> {
            self.entries()
                .map(|(key, stats)| {
                    (
                        String::from_utf8_lossy(key.bytes(region)).into_owned(),
                        *stats,
                    )
                })
                .collect()
        }
    }
}
