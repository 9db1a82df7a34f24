// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Synthetic archives.

A synthetic archive is a tar stream carrying zero or more auxiliary members
followed by a single payload member. Member names are fixed per container
format and are described by an [ArchiveLayout]. Members are always written
and read in layout order. Auxiliary members may be absent.
*/

use {
    crate::{TransformError, TransformResult},
    std::{
        collections::BTreeMap,
        io::{Read, Write},
    },
};

/// Reserved member names of a synthetic archive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArchiveLayout {
    /// Auxiliary members, in archive order.
    pub auxiliary: &'static [&'static str],
    /// The final member, holding the payload.
    pub payload: &'static str,
}

/// Disk images: the UDIF trailer and code requirements ahead of the image.
pub const DISK_IMAGE: ArchiveLayout = ArchiveLayout {
    auxiliary: &["udifheader.bin", "requirements"],
    payload: "contents.dmg",
};

/// Code objects: signing metadata ahead of the executable.
///
/// The executable travels under the disk image payload name, which is what
/// external signers look for in either layout.
pub const CODE_OBJECT: ArchiveLayout = ArchiveLayout {
    auxiliary: &["requirements", "entitlements", "resources", "info-plist"],
    payload: "contents.dmg",
};

/// Zip archives: the central directory ahead of the complete archive.
pub const ZIP: ArchiveLayout = ArchiveLayout {
    auxiliary: &["zipdir.bin"],
    payload: "contents.zip",
};

impl ArchiveLayout {
    /// Position of a member name in archive order.
    pub fn position(&self, name: &str) -> Option<usize> {
        if name == self.payload {
            Some(self.auxiliary.len())
        } else {
            self.auxiliary.iter().position(|n| *n == name)
        }
    }

    fn name_at(&self, position: usize) -> &'static str {
        self.auxiliary.get(position).copied().unwrap_or(self.payload)
    }

    fn payload_position(&self) -> usize {
        self.auxiliary.len()
    }
}

/// Header for a regular file member.
pub(crate) fn member_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_size(size);

    header
}

/// Append a member whose content comes from a reader of known length.
pub(crate) fn append_exact<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    reader: &mut dyn Read,
    size: u64,
) -> TransformResult<()> {
    let mut header = member_header(size);
    let mut reader = ExactReader {
        inner: reader.take(size),
        remaining: size,
    };

    builder
        .append_data(&mut header, name, &mut reader)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransformError::ShortMember {
                    name: name.to_string(),
                    expected: size,
                    found: size - reader.remaining,
                }
            } else {
                TransformError::Io(e)
            }
        })
}

/// Reader failing when its source ends before the advertised size.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let count = self.inner.read(buf)?;
        if count == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        self.remaining -= count as u64;

        Ok(count)
    }
}

/// Writes a synthetic archive in layout order.
pub struct SyntheticArchiveWriter<W: Write> {
    builder: tar::Builder<W>,
    layout: ArchiveLayout,
    position: Option<usize>,
}

impl<W: Write> SyntheticArchiveWriter<W> {
    pub fn new(writer: W, layout: ArchiveLayout) -> Self {
        Self {
            builder: tar::Builder::new(writer),
            layout,
            position: None,
        }
    }

    fn advance(&mut self, name: &str) -> TransformResult<()> {
        let position = self
            .layout
            .position(name)
            .ok_or_else(|| TransformError::UnexpectedMember(name.to_string()))?;

        if position == self.layout.payload_position() {
            return Err(TransformError::NotAuxiliary(name.to_string()));
        }

        if let Some(current) = self.position {
            if position <= current {
                return Err(TransformError::MemberOutOfOrder {
                    requested: name.to_string(),
                    next: self.layout.name_at(current).to_string(),
                });
            }
        }

        self.position = Some(position);

        Ok(())
    }

    /// Append an auxiliary member held in memory.
    pub fn append_member(&mut self, name: &str, data: &[u8]) -> TransformResult<()> {
        self.append_member_from(name, &mut &data[..], data.len() as u64)
    }

    /// Append an auxiliary member streamed from a reader.
    pub fn append_member_from(
        &mut self,
        name: &str,
        reader: &mut dyn Read,
        size: u64,
    ) -> TransformResult<()> {
        self.advance(name)?;
        append_exact(&mut self.builder, name, reader, size)
    }

    /// Append the payload member and finish the archive.
    pub fn finish_with_payload(mut self, reader: &mut dyn Read, size: u64) -> TransformResult<W> {
        let payload = self.layout.payload;
        append_exact(&mut self.builder, payload, reader, size)?;

        Ok(self.builder.into_inner()?)
    }
}

/// Reads a synthetic archive back in layout order.
pub struct SyntheticArchiveReader<'a, R: 'a + Read> {
    layout: ArchiveLayout,
    entries: tar::Entries<'a, R>,
    pending: Option<tar::Entry<'a, R>>,
    position: Option<usize>,
    payload_started: bool,
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> String {
    String::from_utf8_lossy(&entry.path_bytes()).to_string()
}

impl<'a, R: 'a + Read> SyntheticArchiveReader<'a, R> {
    pub fn new(archive: &'a mut tar::Archive<R>, layout: ArchiveLayout) -> TransformResult<Self> {
        Ok(Self {
            layout,
            entries: archive.entries()?,
            pending: None,
            position: None,
            payload_started: false,
        })
    }

    /// Layout position of the next member, if any.
    fn peek(&mut self) -> TransformResult<Option<usize>> {
        if self.pending.is_none() {
            if let Some(entry) = self.entries.next() {
                self.pending = Some(entry?);
            }
        }

        match &self.pending {
            Some(entry) => {
                let name = entry_name(entry);
                let position = self
                    .layout
                    .position(&name)
                    .ok_or(TransformError::UnexpectedMember(name))?;

                if let Some(current) = self.position {
                    if position <= current {
                        return Err(TransformError::MemberOutOfOrder {
                            requested: self.layout.name_at(position).to_string(),
                            next: self.layout.name_at(current).to_string(),
                        });
                    }
                }

                Ok(Some(position))
            }
            None => Ok(None),
        }
    }

    fn take_pending(&mut self, position: usize) -> TransformResult<Vec<u8>> {
        let mut data = vec![];
        if let Some(mut entry) = self.pending.take() {
            entry.read_to_end(&mut data)?;
        }
        self.position = Some(position);

        Ok(data)
    }

    fn ensure_not_streaming(&self, name: &str) -> TransformResult<()> {
        if self.payload_started {
            Err(TransformError::MemberOutOfOrder {
                requested: name.to_string(),
                next: self.layout.payload.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Read the named auxiliary member.
    ///
    /// Returns `None` if the archive skips the member. Requesting a member
    /// positioned before one already read, or before one the archive has not
    /// delivered yet, is an ordering error.
    pub fn read_member(&mut self, name: &str) -> TransformResult<Option<Vec<u8>>> {
        let wanted = self
            .layout
            .position(name)
            .ok_or_else(|| TransformError::UnexpectedMember(name.to_string()))?;

        if wanted == self.layout.payload_position() {
            return Err(TransformError::NotAuxiliary(name.to_string()));
        }

        self.ensure_not_streaming(name)?;

        if let Some(current) = self.position {
            if wanted <= current {
                return Err(TransformError::MemberOutOfOrder {
                    requested: name.to_string(),
                    next: self.layout.name_at(current).to_string(),
                });
            }
        }

        match self.peek()? {
            Some(next) if next == wanted => Ok(Some(self.take_pending(next)?)),
            Some(next) if next > wanted => Ok(None),
            Some(next) => Err(TransformError::MemberOutOfOrder {
                requested: name.to_string(),
                next: self.layout.name_at(next).to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Read every remaining auxiliary member.
    pub fn read_auxiliary(&mut self) -> TransformResult<BTreeMap<String, Vec<u8>>> {
        self.ensure_not_streaming("auxiliary members")?;

        let mut members = BTreeMap::new();

        while let Some(next) = self.peek()? {
            if next == self.layout.payload_position() {
                break;
            }

            let data = self.take_pending(next)?;
            members.insert(self.layout.name_at(next).to_string(), data);
        }

        Ok(members)
    }

    /// Obtain a reader over the payload member.
    ///
    /// All auxiliary members must have been consumed.
    pub fn payload(&mut self) -> TransformResult<PayloadReader<'_, 'a, R>> {
        let payload = self.layout.payload;
        self.ensure_not_streaming(payload)?;

        match self.peek()? {
            Some(next) if next == self.layout.payload_position() => {
                self.payload_started = true;
                self.position = Some(next);

                Ok(PayloadReader {
                    payload,
                    entry: self.pending.take(),
                    entries: &mut self.entries,
                })
            }
            Some(next) => Err(TransformError::MemberOutOfOrder {
                requested: payload.to_string(),
                next: self.layout.name_at(next).to_string(),
            }),
            None => Err(TransformError::MissingMember(payload.to_string())),
        }
    }
}

/// Reader over the payload member of a synthetic archive.
///
/// Reaching the end of the payload while the archive has another member is
/// an error.
pub struct PayloadReader<'r, 'a, R: 'a + Read> {
    payload: &'static str,
    entry: Option<tar::Entry<'a, R>>,
    entries: &'r mut tar::Entries<'a, R>,
}

impl<'r, 'a, R: 'a + Read> Read for PayloadReader<'r, 'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let entry = match self.entry.as_mut() {
            Some(entry) => entry,
            None => return Ok(0),
        };

        let count = entry.read(buf)?;
        if count > 0 || buf.is_empty() {
            return Ok(count);
        }

        self.entry = None;

        match self.entries.next() {
            None => Ok(0),
            Some(Ok(next)) => Err(TransformError::TrailingMember {
                payload: self.payload.to_string(),
                next: entry_name(&next),
            }
            .into()),
            Some(Err(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, std::io::Cursor};

    fn disk_image_archive(
        members: &[(&str, &[u8])],
        payload: &[u8],
    ) -> TransformResult<Vec<u8>> {
        let mut writer = SyntheticArchiveWriter::new(vec![], DISK_IMAGE);
        for (name, data) in members {
            writer.append_member(name, data)?;
        }

        writer.finish_with_payload(&mut &payload[..], payload.len() as u64)
    }

    #[test]
    fn round_trip() -> TransformResult<()> {
        let payload = (0..5000u32).map(|v| v as u8).collect::<Vec<_>>();
        let data = disk_image_archive(
            &[("udifheader.bin", &b"koly"[..]), ("requirements", &b"reqs"[..])],
            &payload,
        )?;

        let mut archive = tar::Archive::new(Cursor::new(data));
        let mut reader = SyntheticArchiveReader::new(&mut archive, DISK_IMAGE)?;

        let members = reader.read_auxiliary()?;
        assert_eq!(members.len(), 2);
        assert_eq!(members["udifheader.bin"], b"koly");
        assert_eq!(members["requirements"], b"reqs");

        let mut read_payload = vec![];
        reader.payload()?.read_to_end(&mut read_payload)?;
        assert_eq!(read_payload, payload);

        assert!(matches!(
            reader.read_member("requirements"),
            Err(TransformError::MemberOutOfOrder { .. })
        ));

        Ok(())
    }

    #[test]
    fn named_reads_enforce_order() -> TransformResult<()> {
        let data = disk_image_archive(
            &[("udifheader.bin", &b"koly"[..]), ("requirements", &b"reqs"[..])],
            b"image",
        )?;

        let mut archive = tar::Archive::new(Cursor::new(data.clone()));
        let mut reader = SyntheticArchiveReader::new(&mut archive, DISK_IMAGE)?;
        assert!(matches!(
            reader.read_member("requirements"),
            Err(TransformError::MemberOutOfOrder { .. })
        ));

        let mut archive = tar::Archive::new(Cursor::new(data.clone()));
        let mut reader = SyntheticArchiveReader::new(&mut archive, DISK_IMAGE)?;
        assert!(matches!(
            reader.payload(),
            Err(TransformError::MemberOutOfOrder { .. })
        ));

        let mut archive = tar::Archive::new(Cursor::new(data));
        let mut reader = SyntheticArchiveReader::new(&mut archive, DISK_IMAGE)?;
        assert_eq!(reader.read_member("udifheader.bin")?, Some(b"koly".to_vec()));
        assert!(matches!(
            reader.read_member("udifheader.bin"),
            Err(TransformError::MemberOutOfOrder { .. })
        ));
        assert_eq!(reader.read_member("requirements")?, Some(b"reqs".to_vec()));

        Ok(())
    }

    #[test]
    fn absent_auxiliary_member() -> TransformResult<()> {
        let mut writer = SyntheticArchiveWriter::new(vec![], CODE_OBJECT);
        writer.append_member("entitlements", b"<plist/>")?;
        let data = writer.finish_with_payload(&mut &b"macho"[..], 5)?;

        let mut archive = tar::Archive::new(Cursor::new(data));
        let mut reader = SyntheticArchiveReader::new(&mut archive, CODE_OBJECT)?;
        assert_eq!(reader.read_member("requirements")?, None);
        assert_eq!(
            reader.read_member("entitlements")?,
            Some(b"<plist/>".to_vec())
        );
        assert_eq!(reader.read_member("info-plist")?, None);

        let mut payload = vec![];
        reader.payload()?.read_to_end(&mut payload)?;
        assert_eq!(payload, b"macho");

        Ok(())
    }

    #[test]
    fn writer_rejects_bad_members() {
        let mut writer = SyntheticArchiveWriter::new(vec![], DISK_IMAGE);
        assert!(matches!(
            writer.append_member("bogus", b""),
            Err(TransformError::UnexpectedMember(_))
        ));
        assert!(matches!(
            writer.append_member("contents.dmg", b""),
            Err(TransformError::NotAuxiliary(_))
        ));
        assert!(writer.append_member("requirements", b"").is_ok());
        assert!(matches!(
            writer.append_member("udifheader.bin", b""),
            Err(TransformError::MemberOutOfOrder { .. })
        ));
    }

    #[test]
    fn short_payload_is_rejected() {
        let writer = SyntheticArchiveWriter::new(vec![], ZIP);
        assert!(matches!(
            writer.finish_with_payload(&mut &b"abc"[..], 10),
            Err(TransformError::ShortMember {
                expected: 10,
                found: 3,
                ..
            })
        ));
    }

    #[test]
    fn unexpected_member_is_rejected() -> TransformResult<()> {
        let mut builder = tar::Builder::new(vec![]);
        append_exact(&mut builder, "surprise", &mut &b"x"[..], 1)?;
        let data = builder.into_inner()?;

        let mut archive = tar::Archive::new(Cursor::new(data));
        let mut reader = SyntheticArchiveReader::new(&mut archive, ZIP)?;
        assert!(matches!(
            reader.read_auxiliary(),
            Err(TransformError::UnexpectedMember(name)) if name == "surprise"
        ));

        Ok(())
    }

    #[test]
    fn member_after_payload_is_rejected() -> TransformResult<()> {
        let mut builder = tar::Builder::new(vec![]);
        append_exact(&mut builder, "zipdir.bin", &mut &b"dir"[..], 3)?;
        append_exact(&mut builder, "contents.zip", &mut &b"zip"[..], 3)?;
        append_exact(&mut builder, "zipdir.bin", &mut &b"dir"[..], 3)?;
        let data = builder.into_inner()?;

        let mut archive = tar::Archive::new(Cursor::new(data));
        let mut reader = SyntheticArchiveReader::new(&mut archive, ZIP)?;
        assert_eq!(reader.read_member("zipdir.bin")?, Some(b"dir".to_vec()));

        let mut payload = vec![];
        let err = reader
            .payload()?
            .read_to_end(&mut payload)
            .expect_err("trailing member should fail");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert_eq!(payload, b"zip");

        Ok(())
    }
}
