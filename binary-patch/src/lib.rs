// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Sparse binary patches.

A [PatchSet] describes a list of byte range replacements against a file.
Signers emit them to describe where signature material lands in an
artifact without shipping the whole artifact back.

# Wire Format

Patches are exchanged with the `application/x-binary-patch` media type. All
integers are big-endian.

* An 8 byte header: `version: u32` (always `1`) followed by `count: u32`.
* `count` records of 16 bytes: `offset: i64`, `old_size: u32`, `new_size: u32`.
* The blobs of every record, concatenated in record order. Each blob is
  exactly `new_size` bytes.

Records are written sorted by offset.

# Application

Applying a patch either writes blobs directly at their offsets or rewrites
the destination from the source. Direct writes are only used when no byte
following a length changing edit would need to move. See [PatchSet::apply].
*/

mod storage;
pub use storage::{copy_storage, ArtifactStorage};

use {
    byteorder::{BigEndian, ReadBytesExt, WriteBytesExt},
    log::{debug, info},
    std::io::{Read, Seek, SeekFrom, Write},
    thiserror::Error,
};

/// Media type of serialized patches.
pub const MIME_TYPE: &str = "application/x-binary-patch";

/// The only patch format version we know about.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 8;
const RECORD_SIZE: usize = 16;
const MAX_FIELD: u64 = u32::MAX as u64;

#[derive(Debug, Error)]
pub enum BinaryPatchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported patch version: expected {}, found {0}", FORMAT_VERSION)]
    UnsupportedVersion(u32),

    #[error("patch header truncated: expected {expected} bytes, found {found}")]
    TruncatedHeader { expected: usize, found: usize },

    #[error("patch record {index} truncated")]
    TruncatedRecord { index: u32 },

    #[error("patch record {index} has negative offset {offset}")]
    NegativeOffset { index: u32, offset: i64 },

    #[error("patch blob {index} truncated: expected {expected} bytes, found {found}")]
    TruncatedBlob {
        index: u32,
        expected: u32,
        found: usize,
    },

    #[error("patch blob at offset {offset} is too large ({size} bytes)")]
    BlobTooLarge { offset: u64, size: usize },

    #[error("patch offset {0} does not fit the wire format")]
    OffsetTooLarge(u64),

    #[error("too many patch records: {0}")]
    TooManyRecords(usize),

    #[error("patch offset {offset} is behind the write cursor at {cursor}")]
    OutOfOrder { offset: u64, cursor: u64 },

    #[error("patch range {offset}+{length} extends beyond source of {size} bytes")]
    RangeBeyondSource { offset: u64, length: u64, size: u64 },
}

/// Result type for this crate.
pub type PatchResult<T> = Result<T, BinaryPatchError>;

/// A single replacement of a byte range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PatchOp {
    offset: u64,
    old_size: u32,
    blob: Vec<u8>,
}

impl PatchOp {
    /// Offset in the source the replacement starts at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of source bytes being replaced.
    pub fn old_size(&self) -> u32 {
        self.old_size
    }

    /// Number of bytes written in their place.
    pub fn new_size(&self) -> usize {
        self.blob.len()
    }

    /// Bytes written in place of the replaced range.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Offset one past the last replaced source byte.
    pub fn end(&self) -> u64 {
        self.offset + self.old_size as u64
    }

    /// Whether this op changes the length of the file.
    pub fn changes_length(&self) -> bool {
        self.old_size as usize != self.blob.len()
    }

    /// How much the file grows (or shrinks) when this op is applied.
    pub fn size_delta(&self) -> i64 {
        self.blob.len() as i64 - self.old_size as i64
    }
}

/// How a patch was applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyMode {
    /// Blobs were written at their offsets in the existing destination.
    InPlace,
    /// The destination was rewritten from the source.
    Rewrite,
}

/// An ordered collection of [PatchOp].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PatchSet {
    ops: Vec<PatchOp>,
}

struct ApplyPlan<'a> {
    ops: Vec<&'a PatchOp>,
    in_place: bool,
    projected_size: u64,
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `old_size` bytes at `offset` with `blob`.
    ///
    /// Ops must be added in ascending, non-overlapping order. An op starting
    /// where the previous one ended is merged into it as long as the merged
    /// sizes still fit the 32 bit wire fields. Ranges longer than that are
    /// split into empty replacements of maximal size followed by one carrying
    /// the remainder and `blob`.
    pub fn add(&mut self, offset: u64, old_size: u64, blob: impl Into<Vec<u8>>) {
        let mut offset = offset;
        let mut old_size = old_size;

        while old_size > MAX_FIELD {
            self.push(offset, u32::MAX, vec![]);
            offset += MAX_FIELD;
            old_size -= MAX_FIELD;
        }

        self.push(offset, old_size as u32, blob.into());
    }

    fn push(&mut self, offset: u64, old_size: u32, blob: Vec<u8>) {
        if let Some(prev) = self.ops.last_mut() {
            if prev.end() == offset {
                let merged_old = prev.old_size as u64 + old_size as u64;
                let merged_new = (prev.blob.len() + blob.len()) as u64;

                if merged_old <= MAX_FIELD && merged_new <= MAX_FIELD {
                    prev.old_size = merged_old as u32;
                    prev.blob.extend(blob);
                    return;
                }
            }
        }

        self.ops.push(PatchOp {
            offset,
            old_size,
            blob,
        });
    }

    /// Ops in the order they were added.
    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn sorted_ops(&self) -> Vec<&PatchOp> {
        let mut ops = self.ops.iter().collect::<Vec<_>>();
        ops.sort_by_key(|op| op.offset);

        ops
    }

    /// Serialize to a writer.
    pub fn write_to(&self, writer: &mut impl Write) -> PatchResult<()> {
        let ops = self.sorted_ops();
        let count =
            u32::try_from(ops.len()).map_err(|_| BinaryPatchError::TooManyRecords(ops.len()))?;

        writer.write_u32::<BigEndian>(FORMAT_VERSION)?;
        writer.write_u32::<BigEndian>(count)?;

        for op in &ops {
            let offset =
                i64::try_from(op.offset).map_err(|_| BinaryPatchError::OffsetTooLarge(op.offset))?;
            let new_size =
                u32::try_from(op.blob.len()).map_err(|_| BinaryPatchError::BlobTooLarge {
                    offset: op.offset,
                    size: op.blob.len(),
                })?;

            writer.write_i64::<BigEndian>(offset)?;
            writer.write_u32::<BigEndian>(op.old_size)?;
            writer.write_u32::<BigEndian>(new_size)?;
        }

        for op in &ops {
            writer.write_all(&op.blob)?;
        }

        Ok(())
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> PatchResult<Vec<u8>> {
        let mut data = Vec::with_capacity(
            HEADER_SIZE
                + self.ops.len() * RECORD_SIZE
                + self.ops.iter().map(|op| op.blob.len()).sum::<usize>(),
        );
        self.write_to(&mut data)?;

        Ok(data)
    }

    /// Parse a serialized patch from a reader.
    pub fn read_from(reader: &mut impl Read) -> PatchResult<Self> {
        let mut header = [0u8; HEADER_SIZE];
        let found = read_fully(reader, &mut header)?;
        if found != HEADER_SIZE {
            return Err(BinaryPatchError::TruncatedHeader {
                expected: HEADER_SIZE,
                found,
            });
        }

        let mut header = &header[..];
        let version = header.read_u32::<BigEndian>()?;
        if version != FORMAT_VERSION {
            return Err(BinaryPatchError::UnsupportedVersion(version));
        }
        let count = header.read_u32::<BigEndian>()?;

        // The count is untrusted. Let the vector grow as records are actually read.
        let mut records = Vec::with_capacity(count.min(1024) as usize);

        for index in 0..count {
            let mut record = [0u8; RECORD_SIZE];
            if read_fully(reader, &mut record)? != RECORD_SIZE {
                return Err(BinaryPatchError::TruncatedRecord { index });
            }

            let mut record = &record[..];
            let offset = record.read_i64::<BigEndian>()?;
            let old_size = record.read_u32::<BigEndian>()?;
            let new_size = record.read_u32::<BigEndian>()?;

            let offset = u64::try_from(offset)
                .map_err(|_| BinaryPatchError::NegativeOffset { index, offset })?;

            records.push((offset, old_size, new_size));
        }

        let mut ops = Vec::with_capacity(records.len());

        for (index, (offset, old_size, new_size)) in records.into_iter().enumerate() {
            let mut blob = vec![];
            (&mut *reader).take(new_size as u64).read_to_end(&mut blob)?;

            if blob.len() != new_size as usize {
                return Err(BinaryPatchError::TruncatedBlob {
                    index: index as u32,
                    expected: new_size,
                    found: blob.len(),
                });
            }

            ops.push(PatchOp {
                offset,
                old_size,
                blob,
            });
        }

        debug!("loaded binary patch with {} ops", ops.len());

        Ok(Self { ops })
    }

    /// Parse a serialized patch from bytes.
    pub fn from_bytes(data: &[u8]) -> PatchResult<Self> {
        Self::read_from(&mut std::io::Cursor::new(data))
    }

    fn plan(&self, source_size: u64) -> PatchResult<ApplyPlan<'_>> {
        let ops = self.sorted_ops();

        let mut cursor = 0;
        let mut projected_size = source_size;
        let mut in_place = true;

        for (i, op) in ops.iter().enumerate() {
            if op.offset < cursor {
                return Err(BinaryPatchError::OutOfOrder {
                    offset: op.offset,
                    cursor,
                });
            }
            if op.end() > source_size {
                return Err(BinaryPatchError::RangeBeyondSource {
                    offset: op.offset,
                    length: op.old_size as u64,
                    size: source_size,
                });
            }

            if op.changes_length() && (i != ops.len() - 1 || op.end() != source_size) {
                in_place = false;
            }

            projected_size = (projected_size as i64 + op.size_delta()) as u64;
            cursor = op.end();
        }

        Ok(ApplyPlan {
            ops,
            in_place,
            projected_size,
        })
    }

    /// Apply the patch to `source`, producing the result in `dest`.
    ///
    /// When only the last op changes the file length and that op ends at the
    /// end of the source, `dest` is brought to the source's size (by copying
    /// the source if the sizes differ) and the blobs are written at their
    /// offsets. Any other length change rewrites `dest` sequentially from
    /// `source`.
    ///
    /// Ops are validated before anything is written: ops must not overlap
    /// and must not reach past the end of the source.
    pub fn apply<S, D>(&self, source: &mut S, dest: &mut D) -> PatchResult<ApplyMode>
    where
        S: ArtifactStorage + ?Sized,
        D: ArtifactStorage + ?Sized,
    {
        let source_size = source.size()?;
        let plan = self.plan(source_size)?;

        if plan.in_place {
            if dest.size()? != source_size {
                debug!(
                    "destination size differs from source; copying {} bytes",
                    source_size
                );
                copy_storage(source, dest)?;
            }

            write_in_place(&plan, dest)?;
            Ok(ApplyMode::InPlace)
        } else {
            rewrite(&plan, source, dest)?;
            Ok(ApplyMode::Rewrite)
        }
    }

    /// Apply the patch to a storage that is both source and destination.
    ///
    /// Patches requiring a rewrite first spool the original content to an
    /// anonymous temporary file.
    pub fn apply_in_place<S: ArtifactStorage + ?Sized>(
        &self,
        storage: &mut S,
    ) -> PatchResult<ApplyMode> {
        let plan = self.plan(storage.size()?)?;

        if plan.in_place {
            write_in_place(&plan, storage)?;
            Ok(ApplyMode::InPlace)
        } else {
            let mut spool = tempfile::tempfile()?;
            copy_storage(storage, &mut spool)?;
            rewrite(&plan, &mut spool, storage)?;
            Ok(ApplyMode::Rewrite)
        }
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut offset = 0;

    while offset < buf.len() {
        match reader.read(&mut buf[offset..]) {
            Ok(0) => break,
            Ok(count) => offset += count,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(offset)
}

fn write_in_place<D: ArtifactStorage + ?Sized>(
    plan: &ApplyPlan,
    dest: &mut D,
) -> PatchResult<()> {
    info!("applying {} patch ops in place", plan.ops.len());

    for op in &plan.ops {
        debug!(
            "writing {} bytes at offset {} (replacing {})",
            op.blob.len(),
            op.offset,
            op.old_size
        );
        dest.write_at(op.offset, &op.blob)?;
    }

    dest.truncate(plan.projected_size)?;
    dest.flush()?;

    Ok(())
}

fn rewrite<S, D>(plan: &ApplyPlan, source: &mut S, dest: &mut D) -> PatchResult<()>
where
    S: ArtifactStorage + ?Sized,
    D: ArtifactStorage + ?Sized,
{
    info!("rewriting destination with {} patch ops", plan.ops.len());

    source.rewind()?;
    dest.rewind()?;

    let mut cursor = 0u64;
    let mut written = 0u64;

    for op in &plan.ops {
        if op.offset < cursor {
            return Err(BinaryPatchError::OutOfOrder {
                offset: op.offset,
                cursor,
            });
        }

        let gap = op.offset - cursor;
        written += std::io::copy(&mut (&mut *source).take(gap), dest)?;

        source.seek(SeekFrom::Current(op.old_size as i64))?;
        dest.write_all(&op.blob)?;
        written += op.blob.len() as u64;

        cursor = op.end();
    }

    written += std::io::copy(source, dest)?;

    dest.truncate(written)?;
    dest.flush()?;

    debug!("rewrote {} bytes", written);

    Ok(())
}
