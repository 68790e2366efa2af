//! Event pipe wire format and the reassembling reader.
//!
//! Every event starts with a fixed-size [`PipeMsg`]; `gep` and `memcmp`
//! headers are followed by a contiguous body frame. The reader only
//! guarantees atomic delivery of well-typed, length-correct frames; it never
//! interprets semantic fields.

use crate::util::{read_bytes, read_frame};
use ctwm_core::Label;
use iota::iota;
use std::io::{ErrorKind, Read};

pub const MSG_COND: u16 = 0;
pub const MSG_GEP: u16 = 1;
pub const MSG_MEMCMP: u16 = 2;
pub const MSG_FSIZE: u16 = 3;
pub const MSG_MEMERR: u16 = 4;

iota! {
    pub const F_ADD_CONS: u16 = 1 << (iota); // conjoin into the path predicate
    , F_LOOP_EXIT
    , F_LOOP_LATCH
}
/// Loop-iteration bits of a `cond` message.
pub const LOOP_FLAG_MASK: u16 = 0xF0;

iota! {
    pub const F_MEMERR_UAF: u16 = 1 << (iota);
    , F_MEMERR_OLB
    , F_MEMERR_OUB
    , F_MEMERR_UBI
    , F_MEMERR_NULL
    , F_MEMERR_FREE
}
/// The run reached the configured target site.
pub const F_TARGET_HIT: u16 = 0x8000;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeMsg {
    pub msg_type: u16,
    pub flags: u16,
    pub instance_id: u32,
    pub addr: u64,
    pub context: u32,
    pub id: u32,
    pub label: Label,
    pub result: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GepMsg {
    pub ptr_label: Label,
    pub index_label: Label,
    pub ptr: u64,
    pub index: i64,
    pub num_elems: u64,
    pub elem_size: u64,
    pub current_offset: i64,
}

/// One fully reassembled event.
#[derive(Debug)]
pub enum Event {
    Cond(PipeMsg),
    Gep(PipeMsg, GepMsg),
    Memcmp(PipeMsg, Vec<u8>),
    Fsize(PipeMsg),
    MemErr(PipeMsg),
}

pub fn msg_type_str(msg_type: u16) -> &'static str {
    match msg_type {
        MSG_COND => "cond",
        MSG_GEP => "gep",
        MSG_MEMCMP => "memcmp",
        MSG_FSIZE => "fsize",
        MSG_MEMERR => "memerr",
        _ => "unknown",
    }
}

/// Symbolic rendering of the flag bits of a message.
pub fn flags_str(msg: &PipeMsg) -> String {
    let mut parts = Vec::new();
    match msg.msg_type {
        MSG_COND => {
            if msg.flags & F_ADD_CONS != 0 {
                parts.push("add_cons".to_string());
            }
            if msg.flags & F_LOOP_EXIT != 0 {
                parts.push("loop_exit".to_string());
            }
            if msg.flags & F_LOOP_LATCH != 0 {
                parts.push("loop_latch".to_string());
            }
            if msg.flags & LOOP_FLAG_MASK != 0 {
                parts.push(format!("loop_bits={:#x}", msg.flags & LOOP_FLAG_MASK));
            }
        }
        MSG_MEMERR => {
            if msg.flags & F_MEMERR_UAF != 0 {
                parts.push("uaf".to_string());
            }
            if msg.flags & F_MEMERR_OLB != 0 {
                parts.push("olb".to_string());
            }
            if msg.flags & F_MEMERR_OUB != 0 {
                parts.push("oub".to_string());
            }
            if msg.flags & F_MEMERR_UBI != 0 {
                parts.push("ubi".to_string());
            }
            if msg.flags & F_MEMERR_NULL != 0 {
                parts.push("null".to_string());
            }
            if msg.flags & F_MEMERR_FREE != 0 {
                parts.push("double_free".to_string());
            }
            if msg.flags & F_TARGET_HIT != 0 {
                parts.push("target_hit".to_string());
            }
        }
        _ => {}
    }
    if parts.is_empty() {
        format!("{:#x}", msg.flags)
    } else {
        parts.join("|")
    }
}

pub fn describe(msg: &PipeMsg) -> String {
    format!(
        "pipe_msg {{ type={}({}), flags={}, instance={}, addr={:#x}, ctx={}, id={}, label={}, result={} }}",
        msg_type_str(msg.msg_type),
        msg.msg_type,
        flags_str(msg),
        msg.instance_id,
        msg.addr,
        msg.context,
        msg.id,
        msg.label,
        msg.result,
    )
}

/// Blocking, length-typed reader over the child-to-driver pipe.
pub struct EventReader<R> {
    inner: R,
}

impl<R: Read> EventReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next fully reassembled event, or `None` once the child has closed its
    /// write end. Protocol violations (short follow-on frame, label
    /// mismatch) are logged and skipped; the stream continues at the next
    /// header.
    pub fn next_event(&mut self) -> Result<Option<Event>, std::io::Error> {
        loop {
            let msg: PipeMsg = match read_frame(&mut self.inner) {
                Ok(Some(m)) => m,
                Ok(None) => return Ok(None),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    log::warn!("truncated event header");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            match msg.msg_type {
                MSG_COND => return Ok(Some(Event::Cond(msg))),
                MSG_GEP => {
                    let gep: GepMsg = match read_frame(&mut self.inner) {
                        Ok(Some(g)) => g,
                        Ok(None) => {
                            log::warn!("missing gep body for label {}", msg.label);
                            return Ok(None);
                        }
                        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                            log::warn!("short gep body for label {}", msg.label);
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    if gep.index_label != msg.label {
                        log::warn!(
                            "gep label mismatch: header {} vs body {}",
                            msg.label,
                            gep.index_label
                        );
                        continue;
                    }
                    return Ok(Some(Event::Gep(msg, gep)));
                }
                MSG_MEMCMP => {
                    // flags == 0 means both operands are symbolic, no content
                    if msg.flags == 0 {
                        continue;
                    }
                    let body =
                        match read_bytes(&mut self.inner, 4 + msg.result as usize) {
                            Ok(b) => b,
                            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                                log::warn!("short memcmp body for label {}", msg.label);
                                continue;
                            }
                            Err(e) => return Err(e),
                        };
                    let label = u32::from_ne_bytes(body[..4].try_into().unwrap());
                    if label != msg.label {
                        log::warn!(
                            "memcmp label mismatch: header {} vs body {}",
                            msg.label,
                            label
                        );
                        continue;
                    }
                    return Ok(Some(Event::Memcmp(msg, body[4..].to_vec())));
                }
                MSG_FSIZE => return Ok(Some(Event::Fsize(msg))),
                MSG_MEMERR => return Ok(Some(Event::MemErr(msg))),
                other => {
                    log::warn!("unknown event type {}", other);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::write_frame;

    fn cond_msg(label: Label, result: u64) -> PipeMsg {
        PipeMsg {
            msg_type: MSG_COND,
            label,
            result,
            ..Default::default()
        }
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(std::mem::size_of::<PipeMsg>(), 40);
        assert_eq!(std::mem::size_of::<GepMsg>(), 48);
    }

    #[test]
    fn reads_cond_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &cond_msg(5, 0)).unwrap();
        write_frame(&mut buf, &cond_msg(6, 1)).unwrap();

        let mut reader = EventReader::new(&buf[..]);
        match reader.next_event().unwrap().unwrap() {
            Event::Cond(m) => assert_eq!((m.label, m.result), (5, 0)),
            other => panic!("unexpected event {:?}", other),
        }
        match reader.next_event().unwrap().unwrap() {
            Event::Cond(m) => assert_eq!((m.label, m.result), (6, 1)),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(reader.next_event().unwrap().is_none());
    }

    #[test]
    fn gep_body_must_match_header_label() {
        let mut buf = Vec::new();
        let header = PipeMsg {
            msg_type: MSG_GEP,
            label: 7,
            ..Default::default()
        };
        let body = GepMsg {
            index_label: 9, // mismatch, event must be skipped
            ..Default::default()
        };
        write_frame(&mut buf, &header).unwrap();
        write_frame(&mut buf, &body).unwrap();
        write_frame(&mut buf, &cond_msg(1, 1)).unwrap();

        let mut reader = EventReader::new(&buf[..]);
        match reader.next_event().unwrap().unwrap() {
            Event::Cond(m) => assert_eq!(m.label, 1),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn gep_body_delivered_when_consistent() {
        let mut buf = Vec::new();
        let header = PipeMsg {
            msg_type: MSG_GEP,
            label: 7,
            ..Default::default()
        };
        let body = GepMsg {
            index_label: 7,
            index: 3,
            num_elems: 10,
            elem_size: 4,
            ..Default::default()
        };
        write_frame(&mut buf, &header).unwrap();
        write_frame(&mut buf, &body).unwrap();

        let mut reader = EventReader::new(&buf[..]);
        match reader.next_event().unwrap().unwrap() {
            Event::Gep(m, g) => {
                assert_eq!(m.label, 7);
                assert_eq!(g.num_elems, 10);
                assert_eq!(g.elem_size, 4);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn memcmp_content_length_follows_result() {
        let mut buf = Vec::new();
        let header = PipeMsg {
            msg_type: MSG_MEMCMP,
            flags: 1,
            label: 11,
            result: 4,
            ..Default::default()
        };
        write_frame(&mut buf, &header).unwrap();
        buf.extend_from_slice(&11u32.to_ne_bytes());
        buf.extend_from_slice(b"HTTP");

        let mut reader = EventReader::new(&buf[..]);
        match reader.next_event().unwrap().unwrap() {
            Event::Memcmp(m, content) => {
                assert_eq!(m.label, 11);
                assert_eq!(content, b"HTTP");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn memcmp_mismatched_label_skipped() {
        let mut buf = Vec::new();
        let header = PipeMsg {
            msg_type: MSG_MEMCMP,
            flags: 1,
            label: 11,
            result: 2,
            ..Default::default()
        };
        write_frame(&mut buf, &header).unwrap();
        buf.extend_from_slice(&12u32.to_ne_bytes());
        buf.extend_from_slice(b"no");

        let mut reader = EventReader::new(&buf[..]);
        assert!(reader.next_event().unwrap().is_none());
    }

    #[test]
    fn symbolic_memcmp_without_content_skipped() {
        let mut buf = Vec::new();
        let header = PipeMsg {
            msg_type: MSG_MEMCMP,
            flags: 0,
            label: 11,
            result: 4,
            ..Default::default()
        };
        write_frame(&mut buf, &header).unwrap();
        write_frame(&mut buf, &cond_msg(2, 0)).unwrap();

        let mut reader = EventReader::new(&buf[..]);
        match reader.next_event().unwrap().unwrap() {
            Event::Cond(m) => assert_eq!(m.label, 2),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn short_follow_on_frame_recovers_at_eof() {
        let mut buf = Vec::new();
        let header = PipeMsg {
            msg_type: MSG_GEP,
            label: 7,
            ..Default::default()
        };
        write_frame(&mut buf, &header).unwrap();
        buf.extend_from_slice(&[0u8; 10]); // truncated GepMsg

        let mut reader = EventReader::new(&buf[..]);
        assert!(reader.next_event().unwrap().is_none());
    }

    #[test]
    fn flag_rendering() {
        let msg = PipeMsg {
            msg_type: MSG_COND,
            flags: F_ADD_CONS | F_LOOP_EXIT,
            ..Default::default()
        };
        assert_eq!(flags_str(&msg), "add_cons|loop_exit");

        let msg = PipeMsg {
            msg_type: MSG_MEMERR,
            flags: F_MEMERR_OUB | F_TARGET_HIT,
            ..Default::default()
        };
        assert_eq!(flags_str(&msg), "oub|target_hit");
    }
}
