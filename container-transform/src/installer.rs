// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Compound document installers.

Installer packages are compound documents: a tree of storages holding
streams. Their signature lives in the root level `\u{5}DigitalSignature`
stream. An optional `\u{5}MsiDigitalSignatureEx` stream holds a digest over
the metadata of every entry, which extended signatures cover as well.

The signable content is every stream other than the signature slots, visited
in digest order: the children of a storage sorted by the UTF-16LE bytes of
their names, followed by the class id of the storage itself. We send that
content as a tar archive with one member per stream and one per storage
class id, preceded by the metadata digest when one is requested.
*/

use {
    crate::{
        archive::append_exact, ContainerTransform, ContentKind, TransformError, TransformResult,
    },
    binary_patch::{copy_storage, ArtifactStorage},
    cfb::{CompoundFile, Entry},
    digest::DynDigest,
    log::{debug, warn},
    std::{
        io::{Read, Seek, Write},
        path::{Path, PathBuf},
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// Root level stream holding the signature.
pub const SIGNATURE_STREAM: &str = "\u{5}DigitalSignature";

/// Root level stream holding the metadata digest of extended signatures.
pub const EXTENDED_SIGNATURE_STREAM: &str = "\u{5}MsiDigitalSignatureEx";

/// Archive member carrying the metadata digest.
pub const PREHASH_MEMBER: &str = "msi-prehash.bin";

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// Digest algorithm for extended signature metadata.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetadataDigest {
    Sha256,
    Sha384,
    Sha512,
}

impl MetadataDigest {
    fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            Self::Sha256 => Box::new(sha2::Sha256::default()),
            Self::Sha384 => Box::new(sha2::Sha384::default()),
            Self::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }
}

#[derive(Clone, Debug)]
enum Member {
    Stream { path: PathBuf, size: u64 },
    StorageClass { path: PathBuf, clsid: [u8; 16] },
}

impl Member {
    fn name(&self) -> String {
        match self {
            Self::Stream { path, .. } => format!("stream/{}", hex_path(path)),
            Self::StorageClass { path, .. } => format!("storage/{}", hex_path(path)),
        }
    }
}

fn hex_path(path: &Path) -> String {
    hex::encode(path.to_string_lossy().as_bytes())
}

fn utf16le(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

fn filetime(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => FILETIME_UNIX_EPOCH + since.as_nanos() as u64 / 100,
        Err(e) => FILETIME_UNIX_EPOCH.saturating_sub(e.duration().as_nanos() as u64 / 100),
    }
}

fn is_signature_slot(name: &str) -> bool {
    name == SIGNATURE_STREAM || name == EXTENDED_SIGNATURE_STREAM
}

/// Children of a storage in digest order, minus root level signature slots.
fn sorted_children<F: Read + Seek>(
    document: &CompoundFile<F>,
    storage: &Path,
    is_root: bool,
) -> std::io::Result<Vec<Entry>> {
    let mut children = document
        .read_storage(storage)?
        .filter(|entry| !(is_root && is_signature_slot(entry.name())))
        .collect::<Vec<_>>();
    children.sort_by_key(|entry| utf16le(entry.name()));

    Ok(children)
}

fn collect_members<F: Read + Seek>(
    document: &CompoundFile<F>,
    storage: &Entry,
    members: &mut Vec<Member>,
) -> std::io::Result<()> {
    for child in sorted_children(document, storage.path(), storage.is_root())? {
        if child.is_stream() {
            members.push(Member::Stream {
                path: child.path().to_path_buf(),
                size: child.len(),
            });
        } else {
            collect_members(document, &child, members)?;
        }
    }

    members.push(Member::StorageClass {
        path: storage.path().to_path_buf(),
        clsid: storage.clsid().to_bytes_le(),
    });

    Ok(())
}

fn prehash_entry(entry: &Entry, hasher: &mut dyn DynDigest) {
    if !entry.is_root() {
        hasher.update(&utf16le(entry.name()));
    }

    if entry.is_stream() {
        hasher.update(&(entry.len() as u32).to_le_bytes());
    } else {
        hasher.update(&entry.clsid().to_bytes_le());
    }

    hasher.update(&entry.state_bits().to_le_bytes());

    if !entry.is_stream() {
        hasher.update(&filetime(entry.created()).to_le_bytes());
        hasher.update(&filetime(entry.modified()).to_le_bytes());
    }
}

fn prehash_storage<F: Read + Seek>(
    document: &CompoundFile<F>,
    storage: &Entry,
    hasher: &mut dyn DynDigest,
) -> std::io::Result<()> {
    prehash_entry(storage, hasher);

    for child in sorted_children(document, storage.path(), storage.is_root())? {
        if child.is_stream() {
            prehash_entry(&child, hasher);
        } else {
            prehash_storage(document, &child, hasher)?;
        }
    }

    Ok(())
}

/// Write a signature into a compound document.
///
/// The extended signature stream is written when a metadata digest is
/// given and removed otherwise.
fn insert_signature(
    storage: &mut dyn ArtifactStorage,
    signature: &[u8],
    prehash: Option<&[u8]>,
) -> TransformResult<()> {
    storage.rewind()?;
    let mut document = CompoundFile::open(storage).map_err(TransformError::CompoundDocument)?;

    let root = Path::new("/");

    let mut stream = document.create_stream(root.join(SIGNATURE_STREAM))?;
    stream.write_all(signature)?;
    stream.flush()?;
    drop(stream);

    let extended = root.join(EXTENDED_SIGNATURE_STREAM);
    match prehash {
        Some(prehash) => {
            let mut stream = document.create_stream(&extended)?;
            stream.write_all(prehash)?;
            stream.flush()?;
        }
        None => {
            if document.is_stream(&extended) {
                document.remove_stream(&extended)?;
            }
        }
    }

    document.flush()?;

    debug!("inserted {} byte installer signature", signature.len());

    Ok(())
}

fn read_signature(content: &ContentKind, response: &mut dyn Read) -> TransformResult<Vec<u8>> {
    if content == &ContentKind::BinaryPatch {
        warn!("treating binary patch response as an installer signature");
    }

    let mut signature = vec![];
    response.read_to_end(&mut signature)?;

    Ok(signature)
}

/// Decomposes a compound document installer into its signable streams.
///
/// The response is the signature blob, which is written into the signature
/// stream of a copy of the source.
pub struct InstallerTransform<'a, S: ArtifactStorage + ?Sized> {
    source: &'a mut S,
    members: Vec<Member>,
    prehash: Option<Vec<u8>>,
}

impl<'a, S: ArtifactStorage + ?Sized> InstallerTransform<'a, S> {
    /// Construct an instance.
    ///
    /// With a `metadata_digest`, the metadata digest for an extended
    /// signature is computed up front, sent ahead of the streams and written
    /// to the extended signature stream during reintegration.
    pub fn new(
        source: &'a mut S,
        metadata_digest: Option<MetadataDigest>,
    ) -> TransformResult<Self> {
        source.rewind()?;
        let document = CompoundFile::open(&mut *source).map_err(TransformError::CompoundDocument)?;
        let root = document.root_entry();

        let mut members = vec![];
        collect_members(&document, &root, &mut members)?;

        let prehash = if let Some(digest) = metadata_digest {
            let mut hasher = digest.hasher();
            prehash_storage(&document, &root, hasher.as_mut())?;
            Some(hasher.finalize().to_vec())
        } else {
            None
        };
        drop(document);

        debug!(
            "compound document has {} signable members",
            members
                .iter()
                .filter(|m| matches!(m, Member::Stream { .. }))
                .count()
        );

        Ok(Self {
            source,
            members,
            prehash,
        })
    }

    /// The extended signature metadata digest, if requested.
    pub fn prehash(&self) -> Option<&[u8]> {
        self.prehash.as_deref()
    }

    /// Names of the archive members carrying streams and storage class ids.
    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name()).collect()
    }
}

impl<'a, S: ArtifactStorage + ?Sized> ContainerTransform for InstallerTransform<'a, S> {
    fn write_payload(&mut self, sink: &mut dyn Write) -> TransformResult<()> {
        self.source.rewind()?;
        let mut document =
            CompoundFile::open(&mut *self.source).map_err(TransformError::CompoundDocument)?;
        let mut builder = tar::Builder::new(sink);

        if let Some(prehash) = &self.prehash {
            append_exact(
                &mut builder,
                PREHASH_MEMBER,
                &mut &prehash[..],
                prehash.len() as u64,
            )?;
        }

        for member in &self.members {
            match member {
                Member::Stream { path, size } => {
                    let mut stream = document.open_stream(path)?;
                    append_exact(&mut builder, &member.name(), &mut stream, *size)?;
                }
                Member::StorageClass { clsid, .. } => {
                    append_exact(&mut builder, &member.name(), &mut &clsid[..], 16)?;
                }
            }
        }

        builder.into_inner()?;

        Ok(())
    }

    fn reintegrate(
        &mut self,
        dest: &mut dyn ArtifactStorage,
        content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()> {
        let signature = read_signature(content, response)?;

        copy_storage(&mut *self.source, dest)?;
        insert_signature(dest, &signature, self.prehash.as_deref())
    }

    fn reintegrate_in_place(
        &mut self,
        content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()> {
        let signature = read_signature(content, response)?;

        insert_signature(&mut self.source, &signature, self.prehash.as_deref())
    }
}

#[cfg(test)]
mod test {
    use {super::*, std::io::Cursor};

    fn write_stream<F: Read + Write + Seek>(
        document: &mut CompoundFile<F>,
        path: &str,
        data: &[u8],
    ) -> std::io::Result<()> {
        let mut stream = document.create_stream(path)?;
        stream.write_all(data)?;
        stream.flush()
    }

    fn installer() -> std::io::Result<Vec<u8>> {
        let mut document = CompoundFile::create(Cursor::new(vec![]))?;
        write_stream(&mut document, "/\u{4840}Table", b"table data")?;
        write_stream(&mut document, "/SummaryInformation", b"summary")?;
        document.create_storage("/Binary")?;
        write_stream(&mut document, "/Binary/icon", &[0x89; 3000])?;
        write_stream(&mut document, "/\u{5}DigitalSignature", b"stale signature")?;
        write_stream(&mut document, "/\u{5}MsiDigitalSignatureEx", b"stale prehash")?;
        document.flush()?;

        Ok(document.into_inner().into_inner())
    }

    fn read_stream(data: Vec<u8>, path: &str) -> std::io::Result<Option<Vec<u8>>> {
        let mut document = CompoundFile::open(Cursor::new(data))?;
        if !document.is_stream(path) {
            return Ok(None);
        }

        let mut content = vec![];
        document.open_stream(path)?.read_to_end(&mut content)?;

        Ok(Some(content))
    }

    #[test]
    fn members_in_digest_order() -> TransformResult<()> {
        let mut source = Cursor::new(installer()?);
        let mut transform = InstallerTransform::new(&mut source, None)?;

        let expected = [
            Member::Stream {
                path: "/\u{4840}Table".into(),
                size: 10,
            },
            Member::Stream {
                path: "/Binary/icon".into(),
                size: 3000,
            },
            Member::StorageClass {
                path: "/Binary".into(),
                clsid: [0; 16],
            },
            Member::Stream {
                path: "/SummaryInformation".into(),
                size: 7,
            },
            Member::StorageClass {
                path: "/".into(),
                clsid: [0; 16],
            },
        ]
        .iter()
        .map(|m| m.name())
        .collect::<Vec<_>>();
        assert_eq!(transform.member_names(), expected);

        let mut payload = vec![];
        transform.write_payload(&mut payload)?;

        let mut archive = tar::Archive::new(Cursor::new(payload));
        let mut seen = vec![];
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = String::from_utf8_lossy(&entry.path_bytes()).to_string();
            let mut data = vec![];
            entry.read_to_end(&mut data)?;

            if name == expected[1] {
                assert_eq!(data, vec![0x89; 3000]);
            }
            seen.push(name);
        }
        assert_eq!(seen, expected);

        Ok(())
    }

    #[test]
    fn prehash_member_leads() -> TransformResult<()> {
        let mut source = Cursor::new(installer()?);
        let mut transform = InstallerTransform::new(&mut source, Some(MetadataDigest::Sha256))?;
        assert_eq!(transform.prehash().map(|p| p.len()), Some(32));

        let mut payload = vec![];
        transform.write_payload(&mut payload)?;

        let mut archive = tar::Archive::new(Cursor::new(payload));
        let mut entries = archive.entries()?;
        let mut first = entries.next().expect("archive has members")?;
        assert_eq!(&*first.path_bytes(), PREHASH_MEMBER.as_bytes());

        let mut data = vec![];
        first.read_to_end(&mut data)?;
        assert_eq!(Some(data.as_slice()), transform.prehash());

        Ok(())
    }

    #[test]
    fn prehash_is_deterministic() -> TransformResult<()> {
        let data = installer()?;

        let a = InstallerTransform::new(&mut Cursor::new(data.clone()), Some(MetadataDigest::Sha384))?
            .prehash()
            .map(|p| p.to_vec());
        let b = InstallerTransform::new(&mut Cursor::new(data), Some(MetadataDigest::Sha384))?
            .prehash()
            .map(|p| p.to_vec());

        assert_eq!(a.as_ref().map(|p| p.len()), Some(48));
        assert_eq!(a, b);

        Ok(())
    }

    #[test]
    fn reintegrate_inserts_signature() -> TransformResult<()> {
        let original = installer()?;
        let mut source = Cursor::new(original.clone());
        let mut transform = InstallerTransform::new(&mut source, None)?;

        let mut dest = Cursor::new(vec![]);
        transform.reintegrate(
            &mut dest,
            &ContentKind::Other("application/pkcs7-signature".into()),
            &mut &b"new signature"[..],
        )?;
        let signed = dest.into_inner();

        assert_eq!(
            read_stream(signed.clone(), "/\u{5}DigitalSignature")?,
            Some(b"new signature".to_vec())
        );
        assert_eq!(
            read_stream(signed.clone(), "/\u{5}MsiDigitalSignatureEx")?,
            None
        );
        for path in ["/\u{4840}Table", "/SummaryInformation", "/Binary/icon"] {
            assert_eq!(
                read_stream(signed.clone(), path)?,
                read_stream(original.clone(), path)?
            );
        }

        // The source is untouched.
        assert_eq!(source.into_inner(), original);

        Ok(())
    }

    #[test]
    fn reintegrate_in_place_with_extended_signature() -> TransformResult<()> {
        let mut source = Cursor::new(installer()?);
        let mut transform = InstallerTransform::new(&mut source, Some(MetadataDigest::Sha256))?;
        let prehash = transform.prehash().map(|p| p.to_vec());

        transform.reintegrate_in_place(
            &ContentKind::Other("application/pkcs7-signature".into()),
            &mut &b"sig"[..],
        )?;

        let signed = source.into_inner();
        assert_eq!(
            read_stream(signed.clone(), "/\u{5}DigitalSignature")?,
            Some(b"sig".to_vec())
        );
        assert_eq!(
            read_stream(signed, "/\u{5}MsiDigitalSignatureEx")?,
            prehash
        );

        Ok(())
    }

    #[test]
    fn not_a_compound_document() {
        let mut source = Cursor::new(b"MZ this is not an installer".to_vec());
        assert!(matches!(
            InstallerTransform::new(&mut source, None),
            Err(TransformError::CompoundDocument(_))
        ));
    }

    #[test]
    fn filetime_conversion() {
        assert_eq!(filetime(UNIX_EPOCH), FILETIME_UNIX_EPOCH);
        assert_eq!(
            filetime(UNIX_EPOCH + std::time::Duration::from_secs(1)),
            FILETIME_UNIX_EPOCH + 10_000_000
        );
        assert_eq!(
            filetime(UNIX_EPOCH - std::time::Duration::from_secs(11_644_473_600)),
            0
        );
    }
}
