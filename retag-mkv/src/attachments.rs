//! Matroska attachment model and serialisation.
//!
//! Attachment payloads can be large, so a parsed attachment references its
//! data as a window into the input file instead of holding the bytes.
//! Before an in-place patch overwrites the source region the windows are
//! pulled into memory via [`AttachmentMaker::buffer`].

use crate::ebml;
use crate::ids;

use retag_core::error::{Error, Result};
use retag_core::io::copy_range;
use retag_core::notify::NotificationList;
use retag_core::progress::Progress;
use retag_core::tree::{NodeId, Tree};

use std::io::{Read, Seek, SeekFrom, Write};

const CONTEXT: &str = "parsing \"AttachedFile\"-element";

/// Payload of an attachment.
#[derive(Debug, Clone)]
pub enum AttachmentData {
    /// Payload held in memory (new attachments, or buffered ones).
    Buffered(Vec<u8>),
    /// Payload still residing in the input file.
    FileWindow {
        /// Absolute offset of the payload in the input stream.
        offset: u64,
        /// Payload size in bytes.
        size: u64,
    },
}

impl AttachmentData {
    /// Payload size in bytes.
    pub fn len(&self) -> u64 {
        match self {
            AttachmentData::Buffered(data) => data.len() as u64,
            AttachmentData::FileWindow { size, .. } => *size,
        }
    }

    /// Returns whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An attached file.
#[derive(Debug, Clone)]
pub struct MatroskaAttachment {
    /// Unique attachment identifier.
    pub uid: u64,
    /// File name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// Optional description.
    pub description: Option<String>,
    /// Payload.
    pub data: AttachmentData,
    /// Excluded from writing when set.
    pub ignored: bool,
}

impl MatroskaAttachment {
    /// Creates an empty attachment with the given UID.
    pub fn new(uid: u64) -> Self {
        Self {
            uid,
            name: String::new(),
            mime_type: String::new(),
            description: None,
            data: AttachmentData::Buffered(Vec::new()),
            ignored: false,
        }
    }

    /// Parses an "AttachedFile" element.
    ///
    /// Fails with `NoDataFound` when neither a file name nor payload data
    /// is present; the caller drops the entry in that case.
    pub fn parse<R: Read + Seek + ?Sized>(
        tree: &mut Tree<ebml::EbmlFormat>,
        node: NodeId,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<Self> {
        tree.parse(node, io)?;
        let mut attachment = MatroskaAttachment::new(0);
        let mut has_data = false;
        let mut child = tree.first_child(node);
        while let Some(c) = child {
            tree.parse(c, io)?;
            match tree.node(c).id() {
                ids::FILE_NAME => {
                    let data = tree.read_data(c, io)?;
                    attachment.name = ebml::parse_string(&data)?;
                }
                ids::FILE_MEDIA_TYPE => {
                    let data = tree.read_data(c, io)?;
                    attachment.mime_type = ebml::parse_string(&data)?;
                }
                ids::FILE_DESCRIPTION => {
                    let data = tree.read_data(c, io)?;
                    attachment.description = Some(ebml::parse_string(&data)?);
                }
                ids::FILE_UID => {
                    let data = tree.read_data(c, io)?;
                    attachment.uid = ebml::parse_uint(&data)?;
                }
                ids::FILE_DATA => {
                    let n = tree.node(c);
                    attachment.data = AttachmentData::FileWindow {
                        offset: n.data_offset(),
                        size: n.data_size(),
                    };
                    has_data = true;
                }
                ids::VOID | ids::CRC32 => {}
                other => notifications.warning(
                    CONTEXT,
                    format!(
                        "\"AttachedFile\"-element contains unknown child 0x{:X}; it will be ignored",
                        other
                    ),
                ),
            }
            child = tree.next_sibling(c);
        }
        if attachment.name.is_empty() && !has_data {
            return Err(Error::NoDataFound);
        }
        Ok(attachment)
    }
}

/// Precomputed serialisation of one attachment.
#[derive(Debug, Clone)]
pub struct AttachmentMaker {
    attachment: MatroskaAttachment,
    data_size: u64,
    total_size: u64,
}

impl AttachmentMaker {
    /// Prepares the serialisation of `attachment`.
    pub fn new(attachment: MatroskaAttachment) -> Self {
        let mut data_size = 0;
        if !attachment.name.is_empty() || !attachment.data.is_empty() {
            data_size += ebml::binary_element_size(ids::FILE_NAME, attachment.name.len() as u64);
            data_size +=
                ebml::binary_element_size(ids::FILE_MEDIA_TYPE, attachment.mime_type.len() as u64);
            if let Some(description) = &attachment.description {
                data_size +=
                    ebml::binary_element_size(ids::FILE_DESCRIPTION, description.len() as u64);
            }
            data_size += ebml::uint_element_size(ids::FILE_UID, attachment.uid);
            data_size += ebml::binary_element_size(ids::FILE_DATA, attachment.data.len());
        }
        let total_size = 2 + u64::from(ebml::size_denotation_length(data_size)) + data_size;
        Self {
            attachment,
            data_size,
            total_size,
        }
    }

    /// Encoded size of the "AttachedFile" element including its header.
    ///
    /// A size of 3 bytes means the attachment is empty; the planner skips it.
    pub fn required_size(&self) -> u64 {
        self.total_size
    }

    /// Pulls a file-window payload into memory.
    ///
    /// Must be called before an in-place patch may overwrite the source
    /// region of the input file.
    pub fn buffer<R: Read + Seek + ?Sized>(&mut self, io: &mut R) -> Result<()> {
        if let AttachmentData::FileWindow { offset, size } = self.attachment.data {
            io.seek(SeekFrom::Start(offset))?;
            let mut data = vec![0u8; size as usize];
            io.read_exact(&mut data).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::TruncatedData(format!("attachment data at {} is truncated", offset))
                } else {
                    Error::Io(e)
                }
            })?;
            self.attachment.data = AttachmentData::Buffered(data);
        }
        Ok(())
    }

    /// Emits the "AttachedFile" element.
    ///
    /// `input` is the stream holding file-window payloads (unused for
    /// buffered data).
    pub fn make<W, R>(&self, out: &mut W, input: &mut R, progress: &Progress) -> Result<()>
    where
        W: Write + ?Sized,
        R: Read + Seek + ?Sized,
    {
        if self.data_size == 0 {
            return Ok(());
        }
        ebml::write_id(out, ids::ATTACHED_FILE)?;
        ebml::write_size(out, self.data_size)?;
        ebml::make_string(out, ids::FILE_NAME, &self.attachment.name)?;
        ebml::make_string(out, ids::FILE_MEDIA_TYPE, &self.attachment.mime_type)?;
        if let Some(description) = &self.attachment.description {
            ebml::make_string(out, ids::FILE_DESCRIPTION, description)?;
        }
        ebml::make_uint(out, ids::FILE_UID, self.attachment.uid)?;
        ebml::write_id(out, ids::FILE_DATA)?;
        ebml::write_size(out, self.attachment.data.len())?;
        match &self.attachment.data {
            AttachmentData::Buffered(data) => out.write_all(data).map_err(Error::Io)?,
            AttachmentData::FileWindow { offset, size } => {
                input.seek(SeekFrom::Start(*offset))?;
                copy_range(input, out, *size, progress)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retag_core::tree::Tree;
    use std::io::Cursor;

    fn sample_attachment() -> MatroskaAttachment {
        MatroskaAttachment {
            uid: 0xDEADBEEF,
            name: "cover.png".into(),
            mime_type: "image/png".into(),
            description: Some("front cover".into()),
            data: AttachmentData::Buffered(vec![0x89, 0x50, 0x4E, 0x47]),
            ignored: false,
        }
    }

    #[test]
    fn test_maker_size_matches_output() {
        let maker = AttachmentMaker::new(sample_attachment());
        let mut out = Vec::new();
        let mut unused = Cursor::new(Vec::new());
        maker.make(&mut out, &mut unused, &Progress::default()).unwrap();
        assert_eq!(out.len() as u64, maker.required_size());
    }

    #[test]
    fn test_empty_attachment_is_minimal() {
        let maker = AttachmentMaker::new(MatroskaAttachment::new(1));
        assert_eq!(maker.required_size(), 3);
        let mut out = Vec::new();
        let mut unused = Cursor::new(Vec::new());
        maker.make(&mut out, &mut unused, &Progress::default()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_parse_roundtrip() {
        let maker = AttachmentMaker::new(sample_attachment());
        let mut data = Vec::new();
        let mut unused = Cursor::new(Vec::new());
        maker.make(&mut data, &mut unused, &Progress::default()).unwrap();

        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<ebml::EbmlFormat> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        let mut notifications = NotificationList::new();
        let parsed =
            MatroskaAttachment::parse(&mut tree, root, &mut io, &mut notifications).unwrap();

        assert_eq!(parsed.uid, 0xDEADBEEF);
        assert_eq!(parsed.name, "cover.png");
        assert_eq!(parsed.mime_type, "image/png");
        assert_eq!(parsed.description.as_deref(), Some("front cover"));
        // Parsed payloads stay in the file until buffered.
        assert!(matches!(parsed.data, AttachmentData::FileWindow { size: 4, .. }));

        // Buffering pulls the window into memory and re-encoding is stable.
        let mut remade = AttachmentMaker::new(parsed);
        remade.buffer(&mut io).unwrap();
        let mut out = Vec::new();
        remade.make(&mut out, &mut unused, &Progress::default()).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_attachment_without_name_or_data_is_no_data() {
        let mut data = Vec::new();
        ebml::write_id(&mut data, ids::ATTACHED_FILE).unwrap();
        ebml::write_size(&mut data, 0).unwrap();

        let mut io = Cursor::new(data.clone());
        let mut tree: Tree<ebml::EbmlFormat> = Tree::new(0, data.len() as u64);
        let root = tree.root();
        let mut notifications = NotificationList::new();
        let result = MatroskaAttachment::parse(&mut tree, root, &mut io, &mut notifications);
        assert!(matches!(result, Err(Error::NoDataFound)));
    }
}
