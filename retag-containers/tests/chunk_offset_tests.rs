//! End-to-end chunk-offset relocation over a synthetic MP4 layout.

use retag_containers::{atom_ids, Mp4Format, Mp4Track, OggIterator, PageFlags};
use retag_core::notify::NotificationList;
use retag_core::tree::Tree;

use std::io::Cursor;

fn atom(tag: &[u8; 4], content: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&((content.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(tag);
    out.extend_from_slice(content);
    out
}

fn stco(offsets: &[u32]) -> Vec<u8> {
    let mut content = vec![0, 0, 0, 0];
    content.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
    for &offset in offsets {
        content.extend_from_slice(&offset.to_be_bytes());
    }
    atom(b"stco", &content)
}

/// `ftyp`, a `moov` with one track whose chunk offsets point into the
/// `mdat`, and the `mdat` itself.
fn build_mp4(chunk_offsets: &[u32], mdat_payload: &[u8]) -> Vec<u8> {
    let stbl = atom(b"stbl", &stco(chunk_offsets));
    let minf = atom(b"minf", &stbl);
    let mdia = atom(b"mdia", &minf);
    let trak = atom(b"trak", &mdia);
    let moov = atom(b"moov", &trak);

    let mut file = atom(b"ftyp", b"isom\x00\x00\x02\x00");
    file.extend_from_slice(&moov);
    file.extend_from_slice(&atom(b"mdat", mdat_payload));
    file
}

#[test]
fn relocated_mdat_shifts_every_chunk_offset() {
    let data = build_mp4(&[0x1000, 0x2000, 0x3000], &[0u8; 64]);
    let mdat_offset = (data.len() - 64 - 8) as u64;

    let mut io = Cursor::new(data.clone());
    let mut tree: Tree<Mp4Format> = Tree::new(0, data.len() as u64);
    let root = tree.root();
    let mut notifications = NotificationList::new();

    let moov = tree
        .sibling_by_id(root, atom_ids::MOOV, true, &mut io)
        .unwrap()
        .unwrap();
    let trak = tree
        .child_by_id(moov, atom_ids::TRAK, &mut io)
        .unwrap()
        .unwrap();
    let track = Mp4Track::parse(&mut tree, trak, &mut io, &mut notifications).unwrap();
    assert_eq!(track.chunk_count(), 3);
    assert!(!notifications.has_critical());

    // Pretend the mdat moved 0x400 bytes towards the end of the file.
    let mut output = Cursor::new(data.clone());
    track
        .update_chunk_offsets(
            &tree,
            &mut io,
            &mut output,
            &[mdat_offset],
            &[mdat_offset + 0x400],
        )
        .unwrap();

    let mut patched = Cursor::new(output.into_inner());
    let offsets = track.read_chunk_offsets(&tree, &mut patched).unwrap();
    assert_eq!(offsets, vec![0x1400, 0x2400, 0x3400]);
}

#[test]
fn offsets_below_the_mdat_stay_put() {
    // The first "offset" points before the mdat (into the moov); only
    // entries strictly above the old mdat offset are shifted.
    let data = build_mp4(&[0x10, 0x2000], &[0u8; 16]);
    let mut io = Cursor::new(data.clone());
    let mut tree: Tree<Mp4Format> = Tree::new(0, data.len() as u64);
    let root = tree.root();
    let mut notifications = NotificationList::new();

    let moov = tree
        .sibling_by_id(root, atom_ids::MOOV, true, &mut io)
        .unwrap()
        .unwrap();
    let trak = tree
        .child_by_id(moov, atom_ids::TRAK, &mut io)
        .unwrap()
        .unwrap();
    let track = Mp4Track::parse(&mut tree, trak, &mut io, &mut notifications).unwrap();

    let mut output = Cursor::new(data.clone());
    track
        .update_chunk_offsets(&tree, &mut io, &mut output, &[0x1000], &[0x1800])
        .unwrap();

    let mut patched = Cursor::new(output.into_inner());
    let offsets = track.read_chunk_offsets(&tree, &mut patched).unwrap();
    assert_eq!(offsets, vec![0x10, 0x2800]);
}

#[test]
fn ogg_iterator_reads_a_logical_stream_out_of_interleaved_pages() {
    fn page(serial: u32, sequence: u32, segments: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"OggS");
        out.push(0);
        out.push(PageFlags::empty().bits());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&serial.to_le_bytes());
        out.extend_from_slice(&sequence.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(segments.len() as u8);
        for segment in segments {
            out.push(segment.len() as u8);
        }
        for segment in segments {
            out.extend_from_slice(segment);
        }
        out
    }

    let mut data = page(0xA, 0, &[b"vorbis-"]);
    data.extend_from_slice(&page(0xB, 0, &[b"video-0"]));
    data.extend_from_slice(&page(0xA, 1, &[b"header"]));

    let len = data.len() as u64;
    let mut stream = Cursor::new(data);
    let mut iterator = OggIterator::new(&mut stream, 0, len);
    iterator.set_filter(Some(0xA));
    iterator.reset().unwrap();

    let mut buffer = vec![0u8; 13];
    iterator.read(&mut buffer).unwrap();
    assert_eq!(&buffer, b"vorbis-header");
}
