//! Generic lazy element tree for length-prefixed container formats.
//!
//! Both supported families (EBML elements, MP4 atoms) are arboreal: an
//! element is an identifier, a size denotation and a data region that may
//! hold child elements. [`Tree`] parses headers lazily: a node's children
//! and its next sibling come into existence the first time the node itself
//! is parsed, and each node's header is parsed at most once.
//!
//! Nodes live in an arena and reference each other through [`NodeId`]
//! indices: the arena exclusively owns every node, `first_child` and
//! `next_sibling` are owning edges in the sense that they are reachable
//! only through their parent, and `parent` is a non-owning back index.
//! A child can therefore never outlive its parent.

use crate::error::{Error, Result};
use crate::io::copy_range;
use crate::notify::NotificationList;
use crate::progress::Progress;

use std::io::{Read, Seek, SeekFrom, Write};

/// Index of a node within its [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Header fields produced by an [`ElementFormat`].
#[derive(Debug, Clone, Copy)]
pub struct RawHeader<Id> {
    /// Element identifier.
    pub id: Id,
    /// Encoded length of the identifier in bytes.
    pub id_length: u32,
    /// Encoded length of the size denotation in bytes.
    pub size_length: u32,
    /// Size of the data region in bytes.
    pub data_size: u64,
}

/// Decoder for one concrete container format.
///
/// The tree layer is format-agnostic; everything specific to EBML or the
/// MP4 box format lives behind this trait.
pub trait ElementFormat {
    /// Identifier type of the format.
    type Id: Copy + Eq + std::fmt::Debug;

    /// Maximum supported identifier length in bytes.
    const MAX_ID_LENGTH: u32;
    /// Maximum supported size-denotation length in bytes.
    const MAX_SIZE_LENGTH: u32;

    /// Reads the element header at `start_offset`.
    ///
    /// `max_size` is the clamp imposed by the parent; implementations must
    /// not read past it and should raise `TruncatedData` when the header
    /// itself does not fit.
    fn read_header<R: Read + Seek + ?Sized>(
        io: &mut R,
        start_offset: u64,
        max_size: u64,
    ) -> Result<RawHeader<Self::Id>>;

    /// Returns whether the element can contain child elements.
    fn is_parent(node: &Node<Self::Id>) -> bool;

    /// Returns whether the element is padding.
    fn is_padding(node: &Node<Self::Id>) -> bool;

    /// Offset of the first child relative to the element start.
    fn first_child_offset(node: &Node<Self::Id>) -> u64;

    /// Printable representation of an identifier.
    fn id_to_string(id: Self::Id) -> String;
}

/// One element of the tree.
#[derive(Debug)]
pub struct Node<Id> {
    id: Id,
    start_offset: u64,
    id_length: u32,
    size_length: u32,
    data_size: u64,
    max_total_size: u64,
    parsed: bool,
    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    next_sibling: Option<NodeId>,
}

impl<Id: Copy> Node<Id> {
    /// Element identifier. Meaningful only after the node was parsed.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Absolute start offset in the stream.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Encoded identifier length in bytes.
    pub fn id_length(&self) -> u32 {
        self.id_length
    }

    /// Encoded size-denotation length in bytes.
    pub fn size_length(&self) -> u32 {
        self.size_length
    }

    /// Identifier length plus size-denotation length.
    pub fn header_size(&self) -> u32 {
        self.id_length + self.size_length
    }

    /// Size of the data region in bytes.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Absolute offset of the data region.
    pub fn data_offset(&self) -> u64 {
        self.start_offset + u64::from(self.header_size())
    }

    /// Header size plus data size.
    pub fn total_size(&self) -> u64 {
        u64::from(self.header_size()) + self.data_size
    }

    /// Absolute offset one past the element.
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.total_size()
    }

    /// Clamp imposed by the parent (or the stream length for roots).
    pub fn max_total_size(&self) -> u64 {
        self.max_total_size
    }

    /// Whether the header has been parsed.
    pub fn is_parsed(&self) -> bool {
        self.parsed
    }
}

/// Arena-backed lazy element tree.
#[derive(Debug)]
pub struct Tree<F: ElementFormat> {
    nodes: Vec<Node<F::Id>>,
    root: NodeId,
}

impl<F: ElementFormat> Tree<F>
where
    F::Id: Default,
{
    /// Creates a tree whose root element starts at `start_offset` and may
    /// span at most `max_size` bytes.
    pub fn new(start_offset: u64, max_size: u64) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        tree.root = tree.alloc(start_offset, max_size, None);
        tree
    }

    /// Discards all nodes and re-creates the root stub.
    ///
    /// Used after the underlying stream has been swapped (for example from
    /// the backup file to the rewritten output).
    pub fn reset(&mut self, start_offset: u64, max_size: u64) {
        self.nodes.clear();
        self.root = self.alloc(start_offset, max_size, None);
    }

    fn alloc(&mut self, start_offset: u64, max_size: u64, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id: F::Id::default(),
            start_offset,
            id_length: 0,
            size_length: 0,
            data_size: 0,
            max_total_size: max_size,
            parsed: false,
            parent,
            first_child: None,
            next_sibling: None,
        });
        id
    }

    /// The root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Allocates a node that is not linked into the tree.
    ///
    /// Used to inspect an element at an arbitrary offset (for example one
    /// denoted by a seek index) without attaching it as anyone's child.
    /// The node is reachable only through the returned id.
    pub fn alloc_detached(&mut self, start_offset: u64, max_size: u64) -> NodeId {
        self.alloc(start_offset, max_size, None)
    }

    /// Borrows a node.
    pub fn node(&self, id: NodeId) -> &Node<F::Id> {
        &self.nodes[id.0]
    }

    /// Parent of `node`; `None` for top-level elements.
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].parent
    }

    /// First child of `node`. Requires the node to be parsed.
    pub fn first_child(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].first_child
    }

    /// Next sibling of `node`. Requires the node to be parsed.
    pub fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].next_sibling
    }

    /// Parses the header of `node`; idempotent.
    ///
    /// On the first successful parse the node's child and sibling stubs are
    /// created (lazily, unparsed). Raises `InvalidData` when the decoded
    /// total size exceeds the clamp imposed by the parent.
    pub fn parse<R: Read + Seek + ?Sized>(&mut self, node: NodeId, io: &mut R) -> Result<()> {
        if self.nodes[node.0].parsed {
            return Ok(());
        }
        let (start, max) = {
            let n = &self.nodes[node.0];
            (n.start_offset, n.max_total_size)
        };
        let header = F::read_header(io, start, max)?;
        if header.id_length > F::MAX_ID_LENGTH {
            return Err(Error::InvalidData(format!(
                "identifier length {} exceeds maximum of {} bytes",
                header.id_length,
                F::MAX_ID_LENGTH
            )));
        }
        if header.size_length > F::MAX_SIZE_LENGTH {
            return Err(Error::InvalidData(format!(
                "size denotation length {} exceeds maximum of {} bytes",
                header.size_length,
                F::MAX_SIZE_LENGTH
            )));
        }
        let header_size = u64::from(header.id_length + header.size_length);
        let total_size = header_size + header.data_size;
        if total_size > max {
            return Err(Error::InvalidData(format!(
                "element at {} spans {} bytes but only {} bytes are available",
                start, total_size, max
            )));
        }

        let parent = {
            let n = &mut self.nodes[node.0];
            n.id = header.id;
            n.id_length = header.id_length;
            n.size_length = header.size_length;
            n.data_size = header.data_size;
            n.parsed = true;
            n.parent
        };

        if F::is_parent(&self.nodes[node.0]) {
            let child_offset = F::first_child_offset(&self.nodes[node.0]);
            if child_offset < total_size {
                let child = self.alloc(start + child_offset, total_size - child_offset, Some(node));
                self.nodes[node.0].first_child = Some(child);
            }
        }
        if total_size < max {
            let sibling = self.alloc(start + total_size, max - total_size, parent);
            self.nodes[node.0].next_sibling = Some(sibling);
        }
        Ok(())
    }

    /// Clears the node's parsed state, children and siblings, then parses
    /// again from the stream.
    pub fn reparse<R: Read + Seek + ?Sized>(&mut self, node: NodeId, io: &mut R) -> Result<()> {
        {
            let n = &mut self.nodes[node.0];
            n.id = F::Id::default();
            n.id_length = 0;
            n.size_length = 0;
            n.data_size = 0;
            n.parsed = false;
            n.first_child = None;
            n.next_sibling = None;
        }
        self.parse(node, io)
    }

    /// Returns the first child with the given identifier, parsing children
    /// on demand.
    pub fn child_by_id<R: Read + Seek + ?Sized>(
        &mut self,
        node: NodeId,
        id: F::Id,
        io: &mut R,
    ) -> Result<Option<NodeId>> {
        self.parse(node, io)?;
        let mut child = self.nodes[node.0].first_child;
        while let Some(c) = child {
            self.parse(c, io)?;
            if self.nodes[c.0].id == id {
                return Ok(Some(c));
            }
            child = self.nodes[c.0].next_sibling;
        }
        Ok(None)
    }

    /// Returns the first sibling with the given identifier.
    ///
    /// When `include_self` is set the search starts at `node` itself,
    /// otherwise at its next sibling.
    pub fn sibling_by_id<R: Read + Seek + ?Sized>(
        &mut self,
        node: NodeId,
        id: F::Id,
        include_self: bool,
        io: &mut R,
    ) -> Result<Option<NodeId>> {
        self.parse(node, io)?;
        let mut current = if include_self {
            Some(node)
        } else {
            self.nodes[node.0].next_sibling
        };
        while let Some(c) = current {
            self.parse(c, io)?;
            if self.nodes[c.0].id == id {
                return Ok(Some(c));
            }
            current = self.nodes[c.0].next_sibling;
        }
        Ok(None)
    }

    /// Resolves a path of identifiers starting at `node`.
    ///
    /// The first path component must match `node` (or one of its siblings);
    /// each further component descends one level.
    pub fn subelement_by_path<R: Read + Seek + ?Sized>(
        &mut self,
        node: NodeId,
        path: &[F::Id],
        io: &mut R,
    ) -> Result<Option<NodeId>> {
        let mut current = Some(node);
        let mut depth = 0;
        while let Some(c) = current {
            if depth >= path.len() {
                return Ok(None);
            }
            self.parse(c, io)?;
            if self.nodes[c.0].id == path[depth] {
                if depth + 1 == path.len() {
                    return Ok(Some(c));
                }
                current = self.nodes[c.0].first_child;
                depth += 1;
            } else {
                current = self.nodes[c.0].next_sibling;
            }
        }
        Ok(None)
    }

    /// Reads the data region of `node` into a vector.
    pub fn read_data<R: Read + Seek + ?Sized>(
        &mut self,
        node: NodeId,
        io: &mut R,
    ) -> Result<Vec<u8>> {
        self.parse(node, io)?;
        let n = &self.nodes[node.0];
        let (offset, size) = (n.data_offset(), n.data_size);
        io.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; size as usize];
        io.read_exact(&mut data).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::TruncatedData(format!("element data at {} is truncated", offset))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(data)
    }

    /// Copies the element header to `out`.
    pub fn copy_header<R, W>(
        &mut self,
        node: NodeId,
        io: &mut R,
        out: &mut W,
        progress: &Progress,
    ) -> Result<()>
    where
        R: Read + Seek + ?Sized,
        W: Write + ?Sized,
    {
        self.parse(node, io)?;
        let n = &self.nodes[node.0];
        let (start, len) = (n.start_offset, u64::from(n.header_size()));
        self.copy_internal(io, out, start, len, progress)
    }

    /// Copies the element without its children to `out`.
    pub fn copy_without_children<R, W>(
        &mut self,
        node: NodeId,
        io: &mut R,
        out: &mut W,
        progress: &Progress,
    ) -> Result<()>
    where
        R: Read + Seek + ?Sized,
        W: Write + ?Sized,
    {
        self.parse(node, io)?;
        let n = &self.nodes[node.0];
        let len = if F::is_parent(n) {
            F::first_child_offset(n)
        } else {
            n.total_size()
        };
        let start = n.start_offset;
        self.copy_internal(io, out, start, len, progress)
    }

    /// Copies the entire element, children included, to `out`.
    pub fn copy_entirely<R, W>(
        &mut self,
        node: NodeId,
        io: &mut R,
        out: &mut W,
        progress: &Progress,
    ) -> Result<()>
    where
        R: Read + Seek + ?Sized,
        W: Write + ?Sized,
    {
        self.parse(node, io)?;
        let n = &self.nodes[node.0];
        let (start, len) = (n.start_offset, n.total_size());
        self.copy_internal(io, out, start, len, progress)
    }

    fn copy_internal<R, W>(
        &self,
        io: &mut R,
        out: &mut W,
        start: u64,
        len: u64,
        progress: &Progress,
    ) -> Result<()>
    where
        R: Read + Seek + ?Sized,
        W: Write + ?Sized,
    {
        io.seek(SeekFrom::Start(start))?;
        copy_range(io, out, len, progress)
    }

    /// Parses this element and every subsequent element, collecting
    /// notifications and summing padding along the starting spine.
    ///
    /// Children are validated recursively but their padding is not counted;
    /// only padding elements on the sibling chain of `node` contribute to
    /// `padding_size`. A parse failure is recorded as a critical
    /// notification and propagated.
    pub fn validate_structure<R: Read + Seek + ?Sized>(
        &mut self,
        node: NodeId,
        io: &mut R,
        notifications: &mut NotificationList,
        padding_size: &mut u64,
    ) -> Result<()> {
        const CONTEXT: &str = "validating element structure";
        // (node, whether padding is counted at this level)
        let mut stack = vec![(node, true)];
        while let Some((current, count_padding)) = stack.pop() {
            if let Err(err) = self.parse(current, io) {
                let n = &self.nodes[current.0];
                notifications.critical(
                    CONTEXT,
                    format!("unable to parse element at {}: {}", n.start_offset, err),
                );
                return Err(err);
            }
            let n = &self.nodes[current.0];
            if let Some(sibling) = n.next_sibling {
                stack.push((sibling, count_padding));
            }
            if let Some(child) = n.first_child {
                stack.push((child, false));
            } else if count_padding && F::is_padding(n) {
                *padding_size += n.total_size();
            }
        }
        Ok(())
    }

    /// Printable identifier of `node`.
    pub fn id_to_string(&self, node: NodeId) -> String {
        F::id_to_string(self.nodes[node.0].id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Toy format for exercising the tree: 1-byte ID, 1-byte size.
    /// IDs >= 0x80 are parents, ID 0x7F is padding.
    struct ToyFormat;

    impl ElementFormat for ToyFormat {
        type Id = u8;
        const MAX_ID_LENGTH: u32 = 1;
        const MAX_SIZE_LENGTH: u32 = 1;

        fn read_header<R: Read + Seek + ?Sized>(
            io: &mut R,
            start_offset: u64,
            max_size: u64,
        ) -> Result<RawHeader<u8>> {
            if max_size < 2 {
                return Err(Error::TruncatedData("toy header needs 2 bytes".into()));
            }
            io.seek(SeekFrom::Start(start_offset))?;
            let mut header = [0u8; 2];
            io.read_exact(&mut header)?;
            Ok(RawHeader {
                id: header[0],
                id_length: 1,
                size_length: 1,
                data_size: u64::from(header[1]),
            })
        }

        fn is_parent(node: &Node<u8>) -> bool {
            node.id() >= 0x80
        }

        fn is_padding(node: &Node<u8>) -> bool {
            node.id() == 0x7F
        }

        fn first_child_offset(node: &Node<u8>) -> u64 {
            u64::from(node.header_size())
        }

        fn id_to_string(id: u8) -> String {
            format!("0x{:02X}", id)
        }
    }

    /// parent(0x80) { leaf(0x01, 2 bytes) leaf(0x02, 1 byte) } padding(0x7F, 3 bytes)
    fn sample_stream() -> Cursor<Vec<u8>> {
        Cursor::new(vec![
            0x80, 7, // parent, 7 bytes of data
            0x01, 2, 0xAA, 0xBB, // leaf with 2 data bytes
            0x02, 1, 0xCC, // leaf with 1 data byte
            0x7F, 3, 0x00, 0x00, 0x00, // padding
        ])
    }

    #[test]
    fn test_parse_is_idempotent() {
        let mut io = sample_stream();
        let len = io.get_ref().len() as u64;
        let mut tree: Tree<ToyFormat> = Tree::new(0, len);
        let root = tree.root();

        tree.parse(root, &mut io).unwrap();
        let snapshot = (
            tree.node(root).id(),
            tree.node(root).data_size(),
            tree.first_child(root),
            tree.next_sibling(root),
        );
        tree.parse(root, &mut io).unwrap();
        assert_eq!(
            snapshot,
            (
                tree.node(root).id(),
                tree.node(root).data_size(),
                tree.first_child(root),
                tree.next_sibling(root),
            )
        );
    }

    #[test]
    fn test_tree_consistency() {
        let mut io = sample_stream();
        let len = io.get_ref().len() as u64;
        let mut tree: Tree<ToyFormat> = Tree::new(0, len);
        let root = tree.root();
        tree.parse(root, &mut io).unwrap();

        let child = tree.first_child(root).unwrap();
        tree.parse(child, &mut io).unwrap();
        assert!(tree.node(child).start_offset() >= tree.node(root).data_offset());
        assert!(tree.node(child).end_offset() <= tree.node(root).end_offset());

        let second = tree.next_sibling(child).unwrap();
        tree.parse(second, &mut io).unwrap();
        assert_eq!(tree.node(second).id(), 0x02);
        assert_eq!(tree.node(second).start_offset(), 6);
        // No third child: the second leaf ends exactly at the parent's end.
        assert!(tree.next_sibling(second).is_none());
    }

    #[test]
    fn test_child_and_sibling_lookup() {
        let mut io = sample_stream();
        let len = io.get_ref().len() as u64;
        let mut tree: Tree<ToyFormat> = Tree::new(0, len);
        let root = tree.root();

        let leaf = tree.child_by_id(root, 0x02, &mut io).unwrap().unwrap();
        assert_eq!(tree.node(leaf).data_size(), 1);
        assert!(tree.child_by_id(root, 0x42, &mut io).unwrap().is_none());

        let padding = tree.sibling_by_id(root, 0x7F, false, &mut io).unwrap().unwrap();
        assert_eq!(tree.node(padding).total_size(), 5);
        let this = tree.sibling_by_id(root, 0x80, true, &mut io).unwrap().unwrap();
        assert_eq!(this, root);
    }

    #[test]
    fn test_subelement_by_path() {
        let mut io = sample_stream();
        let len = io.get_ref().len() as u64;
        let mut tree: Tree<ToyFormat> = Tree::new(0, len);
        let root = tree.root();

        let leaf = tree
            .subelement_by_path(root, &[0x80, 0x01], &mut io)
            .unwrap()
            .unwrap();
        assert_eq!(tree.node(leaf).start_offset(), 2);
        assert!(tree
            .subelement_by_path(root, &[0x80, 0x42], &mut io)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_oversized_element_rejected() {
        // Parent claims 200 bytes of data but only 5 bytes exist.
        let mut io = Cursor::new(vec![0x80, 200, 0, 0, 0]);
        let mut tree: Tree<ToyFormat> = Tree::new(0, 5);
        let root = tree.root();
        let err = tree.parse(root, &mut io).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[test]
    fn test_read_data() {
        let mut io = sample_stream();
        let len = io.get_ref().len() as u64;
        let mut tree: Tree<ToyFormat> = Tree::new(0, len);
        let root = tree.root();
        let leaf = tree.child_by_id(root, 0x01, &mut io).unwrap().unwrap();
        assert_eq!(tree.read_data(leaf, &mut io).unwrap(), vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_copy_entirely() {
        let mut io = sample_stream();
        let len = io.get_ref().len() as u64;
        let mut tree: Tree<ToyFormat> = Tree::new(0, len);
        let root = tree.root();
        let mut out = Vec::new();
        tree.copy_entirely(root, &mut io, &mut out, &Progress::default())
            .unwrap();
        assert_eq!(out, &io.get_ref()[..9]);
    }

    #[test]
    fn test_validate_structure_counts_padding() {
        let mut io = sample_stream();
        let len = io.get_ref().len() as u64;
        let mut tree: Tree<ToyFormat> = Tree::new(0, len);
        let root = tree.root();

        let mut notifications = NotificationList::new();
        let mut padding = 0;
        tree.validate_structure(root, &mut io, &mut notifications, &mut padding)
            .unwrap();
        assert!(notifications.is_empty());
        // Only the top-level padding element counts.
        assert_eq!(padding, 5);
    }

    #[test]
    fn test_reset_and_reparse() {
        let mut io = sample_stream();
        let len = io.get_ref().len() as u64;
        let mut tree: Tree<ToyFormat> = Tree::new(0, len);
        let root = tree.root();
        tree.parse(root, &mut io).unwrap();
        assert!(tree.first_child(root).is_some());

        tree.reparse(root, &mut io).unwrap();
        assert_eq!(tree.node(root).id(), 0x80);

        tree.reset(0, len);
        let root = tree.root();
        assert!(!tree.node(root).is_parsed());
    }
}
