//! Binary encode/decode for the stream format.
//!
//! All integers are little-endian. Strings and byte arrays are
//! length-prefixed with a `u32`. Every variable-length unit in a frame
//! carries its own length and the aux and packet sections each end with a
//! zero-length terminator, so a frame can be decoded without any outside
//! context.
//!
//! # Frame layout
//!
//! ```text
//! [u32 level] [f64 elapsed]
//! [u32 n] { [str package] [str package_to_load] } * n
//! { [u32 len > 0] [u64 persistent_id] [len bytes] } *   [u32 0]
//! { [u32 len > 0] [len bytes] [u32 crc32] } *           [u32 0]
//! ```

use std::collections::BTreeSet;
use std::io::{Read, Write};

use rewind_core::{
    ClassId, ClassSchema, FieldCodec, FieldDescriptor, FieldId, LevelIndex, PersistentId,
    Transform,
};

use crate::error::ReplayError;
use crate::types::*;
use crate::{FORMAT_VERSION, MAGIC, MAX_PACKET_BYTES};

// ── Primitive writers ───────────────────────────────────────────

/// Write a single byte.
pub fn write_u8(w: &mut dyn Write, v: u8) -> Result<(), ReplayError> {
    w.write_all(&[v])?;
    Ok(())
}

/// Write a little-endian u16.
pub fn write_u16_le(w: &mut dyn Write, v: u16) -> Result<(), ReplayError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Write a little-endian u32.
pub fn write_u32_le(w: &mut dyn Write, v: u32) -> Result<(), ReplayError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Write a little-endian u64.
pub fn write_u64_le(w: &mut dyn Write, v: u64) -> Result<(), ReplayError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Write a little-endian f64.
pub fn write_f64_le(w: &mut dyn Write, v: f64) -> Result<(), ReplayError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Write a length-prefixed UTF-8 string (u32 length + bytes).
pub fn write_length_prefixed_str(w: &mut dyn Write, s: &str) -> Result<(), ReplayError> {
    write_length_prefixed_bytes(w, s.as_bytes())
}

/// Write a length-prefixed byte array (u32 length + bytes).
pub fn write_length_prefixed_bytes(w: &mut dyn Write, b: &[u8]) -> Result<(), ReplayError> {
    write_u32_le(w, b.len() as u32)?;
    w.write_all(b)?;
    Ok(())
}

fn write_transform(w: &mut dyn Write, t: &Transform) -> Result<(), ReplayError> {
    for v in t.location.iter().chain(t.rotation.iter()) {
        write_f64_le(w, *v)?;
    }
    Ok(())
}

// ── Primitive readers ───────────────────────────────────────────

/// Read a single byte.
pub fn read_u8(r: &mut dyn Read) -> Result<u8, ReplayError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Read a little-endian u16.
pub fn read_u16_le(r: &mut dyn Read) -> Result<u16, ReplayError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

/// Read a little-endian u32.
pub fn read_u32_le(r: &mut dyn Read) -> Result<u32, ReplayError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a little-endian u64.
pub fn read_u64_le(r: &mut dyn Read) -> Result<u64, ReplayError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a little-endian f64.
pub fn read_f64_le(r: &mut dyn Read) -> Result<f64, ReplayError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Read exactly `len` bytes without trusting `len` for preallocation.
fn read_exact_vec(r: &mut dyn Read, len: usize) -> Result<Vec<u8>, ReplayError> {
    let mut buf = Vec::new();
    (&mut *r).take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(ReplayError::FrameCorrupt {
            detail: format!("expected {len} bytes, found {}", buf.len()),
        });
    }
    Ok(buf)
}

/// Read a length-prefixed byte array.
pub fn read_length_prefixed_bytes(r: &mut dyn Read) -> Result<Vec<u8>, ReplayError> {
    let len = read_u32_le(r)? as usize;
    read_exact_vec(r, len)
}

/// Read a length-prefixed UTF-8 string.
pub fn read_length_prefixed_str(r: &mut dyn Read) -> Result<String, ReplayError> {
    let buf = read_length_prefixed_bytes(r)?;
    String::from_utf8(buf).map_err(|e| ReplayError::FrameCorrupt {
        detail: format!("invalid UTF-8 string: {e}"),
    })
}

fn read_transform(r: &mut dyn Read) -> Result<Transform, ReplayError> {
    let mut t = Transform::default();
    for v in t.location.iter_mut().chain(t.rotation.iter_mut()) {
        *v = read_f64_le(r)?;
    }
    Ok(t)
}

fn expect_consumed(rest: &[u8], what: &str) -> Result<(), ReplayError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(ReplayError::FrameCorrupt {
            detail: format!("{} trailing bytes after {what}", rest.len()),
        })
    }
}

// ── Header encode/decode ────────────────────────────────────────

/// Encode the stream header.
pub fn encode_header(header: &StreamHeader) -> Result<Vec<u8>, ReplayError> {
    let mut out = Vec::new();
    let w: &mut dyn Write = &mut out;
    w.write_all(&MAGIC)?;
    write_u8(w, FORMAT_VERSION)?;
    write_u32_le(w, header.schema_version)?;
    write_u32_le(w, header.levels.len() as u32)?;
    for level in &header.levels {
        write_length_prefixed_str(w, &level.name)?;
        write_u64_le(w, level.start_ms)?;
    }
    write_length_prefixed_bytes(w, &header.blob)?;
    Ok(out)
}

/// Decode and validate the stream header.
pub fn decode_header(bytes: &[u8]) -> Result<StreamHeader, ReplayError> {
    let mut rest = bytes;
    let header = read_header_from(&mut rest).map_err(|e| e.truncated("header"))?;
    expect_consumed(rest, "header")?;
    Ok(header)
}

fn read_header_from(r: &mut dyn Read) -> Result<StreamHeader, ReplayError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(ReplayError::InvalidMagic);
    }
    let version = read_u8(r)?;
    if version != FORMAT_VERSION {
        return Err(ReplayError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }
    let schema_version = read_u32_le(r)?;
    let count = read_u32_le(r)?;
    let mut levels = Vec::new();
    for _ in 0..count {
        levels.push(LevelEntry {
            name: read_length_prefixed_str(r)?,
            start_ms: read_u64_le(r)?,
        });
    }
    let blob = read_length_prefixed_bytes(r)?;
    Ok(StreamHeader {
        schema_version,
        levels,
        blob,
    })
}

// ── Frame encode/decode ─────────────────────────────────────────

/// Encode a frame.
///
/// Fails with [`ReplayError::PacketTooLarge`] if a packet exceeds
/// [`MAX_PACKET_BYTES`]; empty packets and empty aux blocks are rejected
/// as corrupt because a zero length is the section terminator.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ReplayError> {
    let mut out = Vec::new();
    write_frame_into(&mut out, frame)?;
    Ok(out)
}

fn write_frame_into(w: &mut dyn Write, frame: &Frame) -> Result<(), ReplayError> {
    write_u32_le(w, frame.level.0)?;
    write_f64_le(w, frame.elapsed)?;

    write_u32_le(w, frame.streaming_levels.len() as u32)?;
    for level in &frame.streaming_levels {
        write_length_prefixed_str(w, &level.package)?;
        write_length_prefixed_str(w, &level.package_to_load)?;
    }

    for block in &frame.aux {
        if block.data.is_empty() {
            return Err(ReplayError::FrameCorrupt {
                detail: format!("empty aux block for {}", block.id),
            });
        }
        write_u32_le(w, block.data.len() as u32)?;
        write_u64_le(w, block.id.0)?;
        w.write_all(&block.data)?;
    }
    write_u32_le(w, 0)?;

    for packet in &frame.packets {
        if packet.is_empty() {
            return Err(ReplayError::FrameCorrupt {
                detail: "empty packet".into(),
            });
        }
        if packet.len() > MAX_PACKET_BYTES {
            return Err(ReplayError::PacketTooLarge {
                len: packet.len(),
                max: MAX_PACKET_BYTES,
            });
        }
        write_u32_le(w, packet.len() as u32)?;
        w.write_all(packet)?;
        write_u32_le(w, crc32fast::hash(packet))?;
    }
    write_u32_le(w, 0)?;
    Ok(())
}

/// Decode a frame produced by [`encode_frame`].
///
/// Any truncation, oversized packet, checksum mismatch, or trailing byte
/// is reported as [`ReplayError::FrameCorrupt`].
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, ReplayError> {
    let mut rest = bytes;
    let frame = read_frame_from(&mut rest).map_err(|e| e.truncated("frame"))?;
    expect_consumed(rest, "frame")?;
    Ok(frame)
}

fn read_frame_from(r: &mut dyn Read) -> Result<Frame, ReplayError> {
    let level = LevelIndex(read_u32_le(r)?);
    let elapsed = read_f64_le(r)?;
    if !elapsed.is_finite() || elapsed < 0.0 {
        return Err(ReplayError::FrameCorrupt {
            detail: format!("invalid frame time {elapsed}"),
        });
    }

    let count = read_u32_le(r)?;
    let mut streaming_levels = Vec::new();
    for _ in 0..count {
        streaming_levels.push(StreamingLevel {
            package: read_length_prefixed_str(r)?,
            package_to_load: read_length_prefixed_str(r)?,
        });
    }

    let mut aux = Vec::new();
    loop {
        let len = read_u32_le(r)? as usize;
        if len == 0 {
            break;
        }
        let id = PersistentId(read_u64_le(r)?);
        aux.push(AuxBlock {
            id,
            data: read_exact_vec(r, len)?,
        });
    }

    let mut packets = Vec::new();
    loop {
        let len = read_u32_le(r)? as usize;
        if len == 0 {
            break;
        }
        if len > MAX_PACKET_BYTES {
            return Err(ReplayError::FrameCorrupt {
                detail: format!("packet length {len} exceeds {MAX_PACKET_BYTES}"),
            });
        }
        let data = read_exact_vec(r, len)?;
        let crc = read_u32_le(r)?;
        if crc32fast::hash(&data) != crc {
            return Err(ReplayError::FrameCorrupt {
                detail: format!("packet {} checksum mismatch", packets.len()),
            });
        }
        packets.push(data);
    }

    Ok(Frame {
        level,
        elapsed,
        streaming_levels,
        aux,
        packets,
    })
}

// ── Packet encode/decode ────────────────────────────────────────

const PACKET_SPAWN: u8 = 1;
const PACKET_BIND: u8 = 2;
const PACKET_UPDATE: u8 = 3;
const PACKET_DESTROY: u8 = 4;

/// Encode an object packet.
pub fn encode_packet(packet: &ObjectPacket) -> Result<Vec<u8>, ReplayError> {
    let mut out = Vec::new();
    let w: &mut dyn Write = &mut out;
    match packet {
        ObjectPacket::Spawn {
            id,
            owner,
            class,
            transform,
            state,
        } => {
            write_u8(w, PACKET_SPAWN)?;
            write_u64_le(w, id.0)?;
            write_u64_le(w, PersistentId::to_wire(*owner))?;
            write_u32_le(w, class.0)?;
            write_transform(w, transform)?;
            write_length_prefixed_bytes(w, state)?;
        }
        ObjectPacket::Bind {
            id,
            owner,
            class,
            pathname,
            state,
        } => {
            write_u8(w, PACKET_BIND)?;
            write_u64_le(w, id.0)?;
            write_u64_le(w, PersistentId::to_wire(*owner))?;
            write_u32_le(w, class.0)?;
            write_length_prefixed_str(w, pathname)?;
            write_length_prefixed_bytes(w, state)?;
        }
        ObjectPacket::Update { id, delta } => {
            write_u8(w, PACKET_UPDATE)?;
            write_u64_le(w, id.0)?;
            write_length_prefixed_bytes(w, delta)?;
        }
        ObjectPacket::Destroy { id } => {
            write_u8(w, PACKET_DESTROY)?;
            write_u64_le(w, id.0)?;
        }
    }
    Ok(out)
}

/// Decode an object packet.
pub fn decode_packet(bytes: &[u8]) -> Result<ObjectPacket, ReplayError> {
    let mut rest = bytes;
    let packet = read_packet_from(&mut rest).map_err(|e| e.truncated("packet"))?;
    expect_consumed(rest, "packet")?;
    Ok(packet)
}

fn read_packet_from(r: &mut dyn Read) -> Result<ObjectPacket, ReplayError> {
    let tag = read_u8(r)?;
    let id = PersistentId(read_u64_le(r)?);
    Ok(match tag {
        PACKET_SPAWN => ObjectPacket::Spawn {
            id,
            owner: PersistentId::from_wire(read_u64_le(r)?),
            class: ClassId(read_u32_le(r)?),
            transform: read_transform(r)?,
            state: read_length_prefixed_bytes(r)?,
        },
        PACKET_BIND => ObjectPacket::Bind {
            id,
            owner: PersistentId::from_wire(read_u64_le(r)?),
            class: ClassId(read_u32_le(r)?),
            pathname: read_length_prefixed_str(r)?,
            state: read_length_prefixed_bytes(r)?,
        },
        PACKET_UPDATE => ObjectPacket::Update {
            id,
            delta: read_length_prefixed_bytes(r)?,
        },
        PACKET_DESTROY => ObjectPacket::Destroy { id },
        other => {
            return Err(ReplayError::FrameCorrupt {
                detail: format!("unknown packet tag {other}"),
            })
        }
    })
}

// ── Checkpoint encode/decode ────────────────────────────────────

/// Encode a checkpoint. Handles in identity records are not written.
pub fn encode_checkpoint(cp: &Checkpoint) -> Result<Vec<u8>, ReplayError> {
    let mut out = Vec::new();
    let w: &mut dyn Write = &mut out;
    write_u32_le(w, cp.level.0)?;

    write_u32_le(w, cp.deleted.len() as u32)?;
    for id in &cp.deleted {
        write_u64_le(w, id.0)?;
    }

    write_u32_le(w, cp.identity.len() as u32)?;
    for rec in &cp.identity {
        write_u64_le(w, rec.id.0)?;
        write_u64_le(w, PersistentId::to_wire(rec.owner))?;
        write_u32_le(w, rec.class.0)?;
        match &rec.pathname {
            Some(path) => {
                write_u8(w, 1)?;
                write_length_prefixed_str(w, path)?;
            }
            None => write_u8(w, 0)?,
        }
        write_u32_le(w, rec.schema_checksum)?;
        write_u8(w, rec.flags.to_bits())?;
    }

    write_u32_le(w, cp.schemas.len() as u32)?;
    for schema in &cp.schemas {
        write_u32_le(w, schema.class.0)?;
        write_length_prefixed_str(w, &schema.name)?;
        write_u16_le(w, schema.fields.len() as u16)?;
        for field in &schema.fields {
            write_u16_le(w, field.id.0)?;
            write_length_prefixed_str(w, &field.name)?;
            write_u8(w, field.codec.tag())?;
        }
    }

    let frame = encode_frame(&cp.frame)?;
    write_length_prefixed_bytes(w, &frame)?;
    Ok(out)
}

/// Decode a checkpoint produced by [`encode_checkpoint`].
pub fn decode_checkpoint(bytes: &[u8]) -> Result<Checkpoint, ReplayError> {
    let mut rest = bytes;
    let cp = read_checkpoint_from(&mut rest).map_err(|e| e.truncated("checkpoint"))?;
    expect_consumed(rest, "checkpoint")?;
    Ok(cp)
}

fn read_checkpoint_from(r: &mut dyn Read) -> Result<Checkpoint, ReplayError> {
    let level = LevelIndex(read_u32_le(r)?);

    let mut deleted = BTreeSet::new();
    for _ in 0..read_u32_le(r)? {
        deleted.insert(PersistentId(read_u64_le(r)?));
    }

    let mut identity = Vec::new();
    for _ in 0..read_u32_le(r)? {
        let id = PersistentId(read_u64_le(r)?);
        let owner = PersistentId::from_wire(read_u64_le(r)?);
        let class = ClassId(read_u32_le(r)?);
        let pathname = match read_u8(r)? {
            0 => None,
            1 => Some(read_length_prefixed_str(r)?),
            flag => {
                return Err(ReplayError::FrameCorrupt {
                    detail: format!("invalid pathname presence flag: {flag}"),
                })
            }
        };
        identity.push(IdentityRecord {
            id,
            owner,
            class,
            pathname,
            schema_checksum: read_u32_le(r)?,
            flags: IdentityFlags::from_bits(read_u8(r)?),
            handle: None,
        });
    }

    let mut schemas = Vec::new();
    for _ in 0..read_u32_le(r)? {
        let mut schema = ClassSchema::new(ClassId(read_u32_le(r)?), read_length_prefixed_str(r)?);
        for _ in 0..read_u16_le(r)? {
            let id = FieldId(read_u16_le(r)?);
            let name = read_length_prefixed_str(r)?;
            let tag = read_u8(r)?;
            let codec = FieldCodec::from_tag(tag).ok_or_else(|| ReplayError::FrameCorrupt {
                detail: format!("unknown field codec tag {tag}"),
            })?;
            schema.fields.push(FieldDescriptor { id, name, codec });
        }
        schemas.push(schema);
    }

    let frame = decode_frame(&read_length_prefixed_bytes(r)?)?;
    Ok(Checkpoint {
        level,
        deleted,
        identity,
        schemas,
        frame,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_frame() -> Frame {
        Frame {
            level: LevelIndex(2),
            elapsed: 12.25,
            streaming_levels: vec![StreamingLevel {
                package: "Arena_Lighting".into(),
                package_to_load: "Arena_Lighting_Night".into(),
            }],
            aux: vec![AuxBlock {
                id: PersistentId::dynamic(4),
                data: vec![9, 8, 7],
            }],
            packets: vec![vec![1, 2, 3, 4], vec![5]],
        }
    }

    #[test]
    fn frame_round_trip() {
        let frame = sample_frame();
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn idle_frame_is_valid() {
        let frame = Frame::idle(LevelIndex(0), 0.5);
        let bytes = encode_frame(&frame).unwrap();
        // level + time + level count + two terminators
        assert_eq!(bytes.len(), 4 + 8 + 4 + 4 + 4);
        let back = decode_frame(&bytes).unwrap();
        assert!(back.is_idle());
        assert_eq!(back.elapsed, 0.5);
    }

    #[test]
    fn flipped_packet_byte_fails_checksum() {
        let frame = sample_frame();
        let mut bytes = encode_frame(&frame).unwrap();
        // The first packet payload sits right before its crc; find it.
        let needle = [1u8, 2, 3, 4];
        let pos = bytes.windows(4).position(|w| w == needle).unwrap();
        bytes[pos + 1] ^= 0xff;
        let err = decode_frame(&bytes).unwrap_err();
        assert!(matches!(err, ReplayError::FrameCorrupt { ref detail } if detail.contains("checksum")));
    }

    #[test]
    fn truncated_frame_is_corrupt() {
        let bytes = encode_frame(&sample_frame()).unwrap();
        for cut in [0, 3, 11, bytes.len() - 1] {
            let err = decode_frame(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, ReplayError::FrameCorrupt { .. }), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn trailing_bytes_are_corrupt() {
        let mut bytes = encode_frame(&sample_frame()).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_frame(&bytes),
            Err(ReplayError::FrameCorrupt { .. })
        ));
    }

    #[test]
    fn oversized_and_empty_packets_are_rejected_on_encode() {
        let mut frame = Frame::idle(LevelIndex(0), 1.0);
        frame.packets.push(vec![0; MAX_PACKET_BYTES + 1]);
        assert!(matches!(
            encode_frame(&frame),
            Err(ReplayError::PacketTooLarge { .. })
        ));
        frame.packets = vec![Vec::new()];
        assert!(matches!(
            encode_frame(&frame),
            Err(ReplayError::FrameCorrupt { .. })
        ));
    }

    #[test]
    fn header_round_trip_and_magic_check() {
        let header = StreamHeader {
            schema_version: 0xdead_beef,
            levels: vec![
                LevelEntry {
                    name: "Arena".into(),
                    start_ms: 0,
                },
                LevelEntry {
                    name: "Harbor".into(),
                    start_ms: 31_500,
                },
            ],
            blob: b"match=42".to_vec(),
        };
        let bytes = encode_header(&header).unwrap();
        assert_eq!(decode_header(&bytes).unwrap(), header);

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(decode_header(&bad), Err(ReplayError::InvalidMagic)));

        let mut future = bytes;
        future[4] = FORMAT_VERSION + 1;
        assert!(matches!(
            decode_header(&future),
            Err(ReplayError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn packet_round_trip_all_variants() {
        let packets = vec![
            ObjectPacket::Spawn {
                id: PersistentId::dynamic(1),
                owner: Some(PersistentId::stable("Arena.Spawner")),
                class: ClassId(2),
                transform: Transform {
                    location: [1.0, 2.0, 3.0],
                    rotation: [0.0, 90.0, 0.0],
                },
                state: vec![1, 0, 0, 0],
            },
            ObjectPacket::Bind {
                id: PersistentId::stable("Arena.Door_1"),
                owner: None,
                class: ClassId(1),
                pathname: "Arena.Door_1".into(),
                state: vec![0, 0],
            },
            ObjectPacket::Update {
                id: PersistentId::dynamic(1),
                delta: vec![1, 0, 1, 0, 5, 0, 0, 0, 0, 0, 0, 0],
            },
            ObjectPacket::Destroy {
                id: PersistentId::dynamic(1),
            },
        ];
        for p in packets {
            let bytes = encode_packet(&p).unwrap();
            assert_eq!(decode_packet(&bytes).unwrap(), p);
        }
        assert!(matches!(
            decode_packet(&[99, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(ReplayError::FrameCorrupt { .. })
        ));
    }

    #[test]
    fn checkpoint_round_trip() {
        let door = ClassSchema::new(ClassId(1), "Door").with_field("open", FieldCodec::Bool);
        let cp = Checkpoint {
            level: LevelIndex(1),
            deleted: [PersistentId::stable("Arena.Crate_7")].into_iter().collect(),
            identity: vec![IdentityRecord {
                id: PersistentId::stable("Arena.Door_1"),
                owner: None,
                class: ClassId(1),
                pathname: Some("Arena.Door_1".into()),
                schema_checksum: door.checksum(),
                flags: IdentityFlags {
                    no_load: false,
                    ignore_if_missing: true,
                },
                handle: None,
            }],
            schemas: vec![door],
            frame: sample_frame(),
        };
        let bytes = encode_checkpoint(&cp).unwrap();
        assert_eq!(decode_checkpoint(&bytes).unwrap(), cp);
        assert!(matches!(
            decode_checkpoint(&bytes[..bytes.len() - 2]),
            Err(ReplayError::FrameCorrupt { .. })
        ));
    }

    fn arb_frame() -> impl Strategy<Value = Frame> {
        (
            0u32..4,
            0.0f64..1e6,
            prop::collection::vec(("[a-z_]{0,12}", "[a-z_]{0,12}"), 0..3),
            prop::collection::vec((any::<u64>(), prop::collection::vec(any::<u8>(), 1..32)), 0..4),
            prop::collection::vec(prop::collection::vec(any::<u8>(), 1..256), 0..8),
        )
            .prop_map(|(level, elapsed, levels, aux, packets)| Frame {
                level: LevelIndex(level),
                elapsed,
                streaming_levels: levels
                    .into_iter()
                    .map(|(package, package_to_load)| StreamingLevel {
                        package,
                        package_to_load,
                    })
                    .collect(),
                aux: aux
                    .into_iter()
                    .map(|(id, data)| AuxBlock {
                        id: PersistentId(id),
                        data,
                    })
                    .collect(),
                packets,
            })
    }

    proptest! {
        #[test]
        fn any_frame_sequence_round_trips(frames in prop::collection::vec(arb_frame(), 0..6)) {
            for frame in &frames {
                let bytes = encode_frame(frame).unwrap();
                prop_assert_eq!(&decode_frame(&bytes).unwrap(), frame);
                // Byte-for-byte reconstructible.
                prop_assert_eq!(encode_frame(&decode_frame(&bytes).unwrap()).unwrap(), bytes);
            }
        }
    }
}
