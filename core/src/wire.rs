//! The `wire` module implements the fabric's binary protocols: the long
//! steering header shared by clients, servers and the coordinator, the
//! compact in-header variant for small entries, and the control-plane
//! messages. All multi-byte integers are big-endian on the wire.

pub type Keyhash = u32;
pub type NodeId = u8;
pub type Load = u16;
pub type Version = u32;

/// Keyhashes keep 31 bits so external tooling with signed integers never
/// sees a negative fingerprint.
pub const KEYHASH_MASK: Keyhash = 0x7FFF_FFFF;

/// Sentinel version of an entry that has never been written.
pub const BASE_VERSION: Version = 1;

/// Long steering header, coordinator-routed.
pub const IDENT_REPLICATED: u16 = 0x4750;
/// Long steering header, statically partitioned (no coordinator steering).
pub const IDENT_STATIC: u16 = 0x1573;
/// Compact fixed-slot header serving small entries from the coordinator.
pub const IDENT_INLINE: u16 = 0x5039;
/// Control-plane messages.
pub const IDENT_CONTROL: u16 = 0xDEAC;

pub const OP_GET: u8 = 0x0;
pub const OP_PUT: u8 = 0x1;
pub const OP_DEL: u8 = 0x2;
pub const OP_REP_R: u8 = 0x3;
pub const OP_REP_W: u8 = 0x4;
pub const OP_RC_REQ: u8 = 0x5;
pub const OP_RC_ACK: u8 = 0x6;
pub const OP_PUT_FWD: u8 = 0x7;
pub const OP_DEC: u8 = 0xF;

/// identifier(2) op(1) keyhash(4) client_id(1) server_id(1) load(2)
/// version(4) bitmap(2)
pub const PACKET_BASE_SIZE: usize = 17;
pub const REQUEST_BASE_SIZE: usize = PACKET_BASE_SIZE + 4 + 4 + 1 + 2;
pub const REPLY_BASE_SIZE: usize = PACKET_BASE_SIZE + 4 + 4 + 1 + 1 + 2;
pub const RC_REQ_BASE_SIZE: usize = PACKET_BASE_SIZE + 2 + 2;
pub const RC_ACK_BASE_SIZE: usize = PACKET_BASE_SIZE;

/// 31-bit DJBX33A fingerprint of a key. Not collision resistant; two keys
/// hashing identically share fabric state.
pub fn compute_keyhash(key: &str) -> Keyhash {
    let mut hash: u64 = 5381;
    for c in key.as_bytes() {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(u64::from(*c));
    }
    (hash as Keyhash) & KEYHASH_MASK
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Get,
    Put,
    Del,
    PutFwd,
}

impl OpKind {
    fn from_inner(v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(OpKind::Get),
            1 => Ok(OpKind::Put),
            2 => Ok(OpKind::Del),
            3 => Ok(OpKind::PutFwd),
            other => Err(CodecError::UnknownOp(other)),
        }
    }

    fn inner(self) -> u8 {
        match self {
            OpKind::Get => 0,
            OpKind::Put => 1,
            OpKind::Del => 2,
            OpKind::PutFwd => 3,
        }
    }

    pub fn is_write(self) -> bool {
        !matches!(self, OpKind::Get)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpResult {
    Ok,
    NotFound,
}

impl OpResult {
    fn from_wire(v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(OpResult::Ok),
            1 => Ok(OpResult::NotFound),
            other => Err(CodecError::UnknownOp(other)),
        }
    }

    fn wire(self) -> u8 {
        match self {
            OpResult::Ok => 0,
            OpResult::NotFound => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvOperation {
    pub op: OpKind,
    pub keyhash: Keyhash,
    pub ver: Version,
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvRequest {
    pub client_id: NodeId,
    pub server_id: NodeId,
    pub req_id: u32,
    pub req_time: u32,
    pub op: KvOperation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvReply {
    pub client_id: NodeId,
    pub server_id: NodeId,
    pub keyhash: Keyhash,
    pub load: Load,
    pub ver: Version,
    pub req_id: u32,
    pub req_time: u32,
    pub op: OpKind,
    pub result: OpResult,
    pub key: String,
    pub value: Vec<u8>,
}

/// Seed push from a home server to its rack peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RcRequest {
    pub keyhash: Keyhash,
    pub ver: Version,
    pub key: String,
    pub value: Vec<u8>,
}

/// Replica acknowledgment, sent to the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RcAck {
    pub keyhash: Keyhash,
    pub ver: Version,
    pub server_id: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvMessage {
    Request(KvRequest),
    Reply(KvReply),
    RcRequest(RcRequest),
    RcAck(RcAck),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecError {
    Truncated,
    BadIdentifier,
    UnknownOp(u8),
    KeyTooLong,
    ValueTooLong,
    BadKey,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "buffer truncated"),
            CodecError::BadIdentifier => write!(f, "identifier mismatch"),
            CodecError::UnknownOp(op) => write!(f, "unknown op {op:#x}"),
            CodecError::KeyTooLong => write!(f, "key too long"),
            CodecError::ValueTooLong => write!(f, "value too long"),
            CodecError::BadKey => write!(f, "key is not valid utf-8"),
        }
    }
}

impl std::error::Error for CodecError {}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn with_capacity(n: usize) -> Self {
        Writer {
            buf: Vec::with_capacity(n),
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

fn len16(buf: &[u8], kind: CodecError) -> Result<u16, CodecError> {
    u16::try_from(buf.len()).map_err(|_| kind)
}

fn key_len16(key: &str) -> Result<u16, CodecError> {
    len16(key.as_bytes(), CodecError::KeyTooLong)
}

fn replica_bit(server_id: NodeId) -> u16 {
    if usize::from(server_id) < 16 {
        1 << server_id
    } else {
        0
    }
}

fn key_from_bytes(bytes: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::BadKey)
}

/// Polymorphic encode/decode capability, selected once per bound socket.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, msg: &KvMessage) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, buf: &[u8]) -> Result<KvMessage, CodecError>;
}

/// The long-header codec. `replicated` selects the coordinator-routed
/// identifier; otherwise requests carry the statically-partitioned one.
pub struct SteerCodec {
    replicated: bool,
}

impl SteerCodec {
    pub fn new(replicated: bool) -> Self {
        SteerCodec { replicated }
    }

    fn identifier(&self) -> u16 {
        if self.replicated {
            IDENT_REPLICATED
        } else {
            IDENT_STATIC
        }
    }

    fn encode_header(
        &self,
        w: &mut Writer,
        op: u8,
        keyhash: Keyhash,
        client_id: NodeId,
        server_id: NodeId,
        load: Load,
        ver: Version,
        bitmap: u16,
    ) {
        w.u16(self.identifier());
        w.u8(op);
        w.u32(keyhash);
        w.u8(client_id);
        w.u8(server_id);
        w.u16(load);
        w.u32(ver);
        w.u16(bitmap);
    }
}

impl MessageCodec for SteerCodec {
    fn encode(&self, msg: &KvMessage) -> Result<Vec<u8>, CodecError> {
        match msg {
            KvMessage::Request(req) => {
                let key_len = key_len16(&req.op.key)?;
                let value_len = len16(&req.op.value, CodecError::ValueTooLong)?;
                let mut size = REQUEST_BASE_SIZE + req.op.key.len();
                let has_value = matches!(req.op.op, OpKind::Put | OpKind::PutFwd);
                if has_value {
                    size += 2 + req.op.value.len();
                }
                let mut w = Writer::with_capacity(size);
                let op = match req.op.op {
                    OpKind::Get => OP_GET,
                    OpKind::Put => OP_PUT,
                    OpKind::Del => OP_DEL,
                    OpKind::PutFwd => OP_PUT_FWD,
                };
                let keyhash = compute_keyhash(&req.op.key);
                self.encode_header(
                    &mut w,
                    op,
                    keyhash,
                    req.client_id,
                    req.server_id,
                    0,
                    req.op.ver,
                    0,
                );
                w.u32(req.req_id);
                w.u32(req.req_time);
                w.u8(req.op.op.inner());
                w.u16(key_len);
                w.bytes(req.op.key.as_bytes());
                if has_value {
                    w.u16(value_len);
                    w.bytes(&req.op.value);
                }
                Ok(w.buf)
            }
            KvMessage::Reply(rep) => {
                let value_len = len16(&rep.value, CodecError::ValueTooLong)?;
                let mut w = Writer::with_capacity(REPLY_BASE_SIZE + rep.value.len());
                let op = match rep.op {
                    OpKind::Get => OP_REP_R,
                    OpKind::Put | OpKind::Del => OP_REP_W,
                    OpKind::PutFwd => return Err(CodecError::UnknownOp(OP_PUT_FWD)),
                };
                self.encode_header(
                    &mut w,
                    op,
                    rep.keyhash,
                    rep.client_id,
                    rep.server_id,
                    rep.load,
                    rep.ver,
                    replica_bit(rep.server_id),
                );
                w.u32(rep.req_id);
                w.u32(rep.req_time);
                w.u8(rep.op.inner());
                w.u8(rep.result.wire());
                w.u16(value_len);
                w.bytes(&rep.value);
                Ok(w.buf)
            }
            KvMessage::RcRequest(rc) => {
                let key_len = key_len16(&rc.key)?;
                let value_len = len16(&rc.value, CodecError::ValueTooLong)?;
                let mut w = Writer::with_capacity(
                    RC_REQ_BASE_SIZE + rc.key.len() + rc.value.len(),
                );
                self.encode_header(&mut w, OP_RC_REQ, rc.keyhash, 0, 0, 0, rc.ver, 0);
                w.u16(key_len);
                w.bytes(rc.key.as_bytes());
                w.u16(value_len);
                w.bytes(&rc.value);
                Ok(w.buf)
            }
            KvMessage::RcAck(ack) => {
                let mut w = Writer::with_capacity(RC_ACK_BASE_SIZE);
                self.encode_header(
                    &mut w,
                    OP_RC_ACK,
                    ack.keyhash,
                    0,
                    ack.server_id,
                    0,
                    ack.ver,
                    replica_bit(ack.server_id),
                );
                Ok(w.buf)
            }
        }
    }

    fn decode(&self, buf: &[u8]) -> Result<KvMessage, CodecError> {
        if buf.len() < PACKET_BASE_SIZE {
            return Err(CodecError::Truncated);
        }
        let mut r = Reader::new(buf);
        if r.u16()? != self.identifier() {
            return Err(CodecError::BadIdentifier);
        }
        let op = r.u8()?;
        let keyhash = r.u32()?;
        let client_id = r.u8()?;
        let server_id = r.u8()?;
        let load = r.u16()?;
        let ver = r.u32()?;
        r.skip(2)?; // bitmap
        match op {
            OP_GET | OP_PUT | OP_DEL | OP_PUT_FWD => {
                if buf.len() < REQUEST_BASE_SIZE {
                    return Err(CodecError::Truncated);
                }
                let req_id = r.u32()?;
                let req_time = r.u32()?;
                let inner = OpKind::from_inner(r.u8()?)?;
                let key_len = r.u16()? as usize;
                let key = key_from_bytes(r.bytes(key_len)?)?;
                let value = if op == OP_PUT || op == OP_PUT_FWD {
                    let value_len = r.u16()? as usize;
                    r.bytes(value_len)?.to_vec()
                } else {
                    Vec::new()
                };
                Ok(KvMessage::Request(KvRequest {
                    client_id,
                    server_id,
                    req_id,
                    req_time,
                    op: KvOperation {
                        op: inner,
                        keyhash,
                        ver,
                        key,
                        value,
                    },
                }))
            }
            OP_REP_R | OP_REP_W => {
                if buf.len() < REPLY_BASE_SIZE {
                    return Err(CodecError::Truncated);
                }
                let req_id = r.u32()?;
                let req_time = r.u32()?;
                let inner = OpKind::from_inner(r.u8()?)?;
                let result = OpResult::from_wire(r.u8()?)?;
                let value_len = r.u16()? as usize;
                let value = r.bytes(value_len)?.to_vec();
                Ok(KvMessage::Reply(KvReply {
                    client_id,
                    server_id,
                    keyhash,
                    load,
                    ver,
                    req_id,
                    req_time,
                    op: inner,
                    result,
                    key: String::new(),
                    value,
                }))
            }
            OP_RC_REQ => {
                if buf.len() < RC_REQ_BASE_SIZE {
                    return Err(CodecError::Truncated);
                }
                let key_len = r.u16()? as usize;
                let key = key_from_bytes(r.bytes(key_len)?)?;
                let value_len = r.u16()? as usize;
                let value = r.bytes(value_len)?.to_vec();
                Ok(KvMessage::RcRequest(RcRequest {
                    keyhash,
                    ver,
                    key,
                    value,
                }))
            }
            OP_RC_ACK => Ok(KvMessage::RcAck(RcAck {
                keyhash,
                ver,
                server_id,
            })),
            other => Err(CodecError::UnknownOp(other)),
        }
    }
}

/// Compact fixed-slot codec: the key and a cached value ride in the header
/// so small entries can be answered without touching a server.
pub struct InlineCodec {}

pub const INLINE_KEY_SIZE: usize = 6;
pub const INLINE_VALUE_SIZE: usize = 4;

const INLINE_OP_READ: u8 = 0x1;
const INLINE_OP_WRITE: u8 = 0x2;
const INLINE_OP_REP_R: u8 = 0x3;
const INLINE_OP_REP_W: u8 = 0x4;
const INLINE_OP_CACHE_HIT: u8 = 0x5;

/// identifier(2) op(1) key(6) value(4)
pub const INLINE_BASE_SIZE: usize = 3 + INLINE_KEY_SIZE + INLINE_VALUE_SIZE;
pub const INLINE_REQUEST_BASE_SIZE: usize = INLINE_BASE_SIZE + 4 + 4 + 4 + 1 + 2;
pub const INLINE_REPLY_BASE_SIZE: usize = INLINE_BASE_SIZE + 4 + 4 + 4 + 1 + 1 + 2;

impl InlineCodec {
    pub fn new() -> Self {
        InlineCodec {}
    }

    fn encode_key_slot(w: &mut Writer, key: &str) -> Result<(), CodecError> {
        if key.len() > INLINE_KEY_SIZE {
            return Err(CodecError::KeyTooLong);
        }
        let mut slot = [0u8; INLINE_KEY_SIZE];
        slot[..key.len()].copy_from_slice(key.as_bytes());
        w.bytes(&slot);
        Ok(())
    }

    fn encode_value_slot(w: &mut Writer, value: &[u8]) {
        let mut slot = [0u8; INLINE_VALUE_SIZE];
        let n = value.len().min(INLINE_VALUE_SIZE);
        slot[..n].copy_from_slice(&value[..n]);
        w.bytes(&slot);
    }
}

impl Default for InlineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec for InlineCodec {
    fn encode(&self, msg: &KvMessage) -> Result<Vec<u8>, CodecError> {
        match msg {
            KvMessage::Request(req) => {
                let key_len = key_len16(&req.op.key)?;
                let value_len = len16(&req.op.value, CodecError::ValueTooLong)?;
                let mut w = Writer::with_capacity(
                    INLINE_REQUEST_BASE_SIZE + req.op.key.len() + req.op.value.len(),
                );
                w.u16(IDENT_INLINE);
                let op = match req.op.op {
                    OpKind::Get => INLINE_OP_READ,
                    OpKind::Put | OpKind::Del => INLINE_OP_WRITE,
                    OpKind::PutFwd => return Err(CodecError::UnknownOp(OP_PUT_FWD)),
                };
                w.u8(op);
                Self::encode_key_slot(&mut w, &req.op.key)?;
                w.bytes(&[0u8; INLINE_VALUE_SIZE]);
                w.u32(u32::from(req.client_id));
                w.u32(req.req_id);
                w.u32(req.req_time);
                w.u8(req.op.op.inner());
                w.u16(key_len);
                w.bytes(req.op.key.as_bytes());
                if req.op.op == OpKind::Put {
                    w.u16(value_len);
                    w.bytes(&req.op.value);
                }
                Ok(w.buf)
            }
            KvMessage::Reply(rep) => {
                let value_len = len16(&rep.value, CodecError::ValueTooLong)?;
                let mut w =
                    Writer::with_capacity(INLINE_REPLY_BASE_SIZE + rep.value.len());
                w.u16(IDENT_INLINE);
                let op = match rep.op {
                    OpKind::Get => INLINE_OP_REP_R,
                    OpKind::Put | OpKind::Del => INLINE_OP_REP_W,
                    OpKind::PutFwd => return Err(CodecError::UnknownOp(OP_PUT_FWD)),
                };
                w.u8(op);
                Self::encode_key_slot(&mut w, &rep.key)?;
                Self::encode_value_slot(&mut w, &rep.value);
                w.u32(u32::from(rep.client_id));
                w.u32(rep.req_id);
                w.u32(rep.req_time);
                w.u8(rep.op.inner());
                w.u8(rep.result.wire());
                w.u16(value_len);
                w.bytes(&rep.value);
                Ok(w.buf)
            }
            KvMessage::RcRequest(_) | KvMessage::RcAck(_) => {
                Err(CodecError::UnknownOp(OP_RC_REQ))
            }
        }
    }

    fn decode(&self, buf: &[u8]) -> Result<KvMessage, CodecError> {
        if buf.len() < INLINE_BASE_SIZE {
            return Err(CodecError::Truncated);
        }
        let mut r = Reader::new(buf);
        if r.u16()? != IDENT_INLINE {
            return Err(CodecError::BadIdentifier);
        }
        let op = r.u8()?;
        r.skip(INLINE_KEY_SIZE)?;
        let cached_value = r.bytes(INLINE_VALUE_SIZE)?.to_vec();
        match op {
            INLINE_OP_READ | INLINE_OP_WRITE => {
                if buf.len() < INLINE_REQUEST_BASE_SIZE {
                    return Err(CodecError::Truncated);
                }
                let client_id = r.u32()? as NodeId;
                let req_id = r.u32()?;
                let req_time = r.u32()?;
                let inner = OpKind::from_inner(r.u8()?)?;
                let key_len = r.u16()? as usize;
                let key = key_from_bytes(r.bytes(key_len)?)?;
                let value = if inner == OpKind::Put {
                    let value_len = r.u16()? as usize;
                    r.bytes(value_len)?.to_vec()
                } else {
                    Vec::new()
                };
                let keyhash = compute_keyhash(&key);
                Ok(KvMessage::Request(KvRequest {
                    client_id,
                    server_id: 0,
                    req_id,
                    req_time,
                    op: KvOperation {
                        op: inner,
                        keyhash,
                        ver: BASE_VERSION,
                        key,
                        value,
                    },
                }))
            }
            INLINE_OP_REP_R | INLINE_OP_REP_W => {
                if buf.len() < INLINE_REPLY_BASE_SIZE {
                    return Err(CodecError::Truncated);
                }
                let client_id = r.u32()? as NodeId;
                let req_id = r.u32()?;
                let req_time = r.u32()?;
                let inner = OpKind::from_inner(r.u8()?)?;
                let result = OpResult::from_wire(r.u8()?)?;
                let value_len = r.u16()? as usize;
                let value = r.bytes(value_len)?.to_vec();
                Ok(KvMessage::Reply(KvReply {
                    client_id,
                    server_id: 0,
                    keyhash: 0,
                    load: 0,
                    ver: BASE_VERSION,
                    req_id,
                    req_time,
                    op: inner,
                    result,
                    key: String::new(),
                    value,
                }))
            }
            INLINE_OP_CACHE_HIT => {
                if buf.len() < INLINE_REQUEST_BASE_SIZE {
                    return Err(CodecError::Truncated);
                }
                let client_id = r.u32()? as NodeId;
                let req_id = r.u32()?;
                let req_time = r.u32()?;
                let inner = OpKind::from_inner(r.u8()?)?;
                Ok(KvMessage::Reply(KvReply {
                    client_id,
                    server_id: 0,
                    keyhash: 0,
                    load: 0,
                    ver: BASE_VERSION,
                    req_id,
                    req_time,
                    op: inner,
                    result: OpResult::Ok,
                    key: String::new(),
                    value: cached_value,
                }))
            }
            other => Err(CodecError::UnknownOp(other)),
        }
    }
}

/// Control-plane messages (identifier 0xDEAC).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyLoadReport {
    pub keyhash: Keyhash,
    pub load: Load,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    ResetRequest { num_nodes: u16, num_rkeys: u16 },
    ResetReply { ack: Ack },
    HotKeyReport { reports: Vec<KeyLoadReport> },
    Replication { keyhash: Keyhash, key: String },
}

const CTRL_TYPE_RESET_REQ: u8 = 0;
const CTRL_TYPE_RESET_REPLY: u8 = 1;
const CTRL_TYPE_HK_REPORT: u8 = 2;
const CTRL_TYPE_REPLICATION: u8 = 3;

pub const CTRL_BASE_SIZE: usize = 3;
pub const CTRL_RESET_REQ_SIZE: usize = CTRL_BASE_SIZE + 4;
pub const CTRL_RESET_REPLY_SIZE: usize = CTRL_BASE_SIZE + 1;
pub const CTRL_HK_REPORT_BASE_SIZE: usize = CTRL_BASE_SIZE + 2;
pub const CTRL_REPLICATION_BASE_SIZE: usize = CTRL_BASE_SIZE + 4 + 2;

#[derive(Default)]
pub struct ControlCodec {}

impl ControlCodec {
    pub fn new() -> Self {
        ControlCodec {}
    }

    pub fn encode(&self, msg: &ControlMessage) -> Result<Vec<u8>, CodecError> {
        let mut w = Writer::default();
        w.u16(IDENT_CONTROL);
        match msg {
            ControlMessage::ResetRequest {
                num_nodes,
                num_rkeys,
            } => {
                w.u8(CTRL_TYPE_RESET_REQ);
                w.u16(*num_nodes);
                w.u16(*num_rkeys);
            }
            ControlMessage::ResetReply { ack } => {
                w.u8(CTRL_TYPE_RESET_REPLY);
                w.u8(match ack {
                    Ack::Ok => 0,
                    Ack::Failed => 1,
                });
            }
            ControlMessage::HotKeyReport { reports } => {
                w.u8(CTRL_TYPE_HK_REPORT);
                let nkeys =
                    u16::try_from(reports.len()).map_err(|_| CodecError::ValueTooLong)?;
                w.u16(nkeys);
                for report in reports {
                    w.u32(report.keyhash);
                    w.u16(report.load);
                }
            }
            ControlMessage::Replication { keyhash, key } => {
                w.u8(CTRL_TYPE_REPLICATION);
                w.u32(*keyhash);
                w.u16(key_len16(key)?);
                w.bytes(key.as_bytes());
            }
        }
        Ok(w.buf)
    }

    pub fn decode(&self, buf: &[u8]) -> Result<ControlMessage, CodecError> {
        if buf.len() < CTRL_BASE_SIZE {
            return Err(CodecError::Truncated);
        }
        let mut r = Reader::new(buf);
        if r.u16()? != IDENT_CONTROL {
            return Err(CodecError::BadIdentifier);
        }
        match r.u8()? {
            CTRL_TYPE_RESET_REQ => Ok(ControlMessage::ResetRequest {
                num_nodes: r.u16()?,
                num_rkeys: r.u16()?,
            }),
            CTRL_TYPE_RESET_REPLY => {
                let ack = match r.u8()? {
                    0 => Ack::Ok,
                    1 => Ack::Failed,
                    other => return Err(CodecError::UnknownOp(other)),
                };
                Ok(ControlMessage::ResetReply { ack })
            }
            CTRL_TYPE_HK_REPORT => {
                let nkeys = r.u16()?;
                let mut reports = Vec::with_capacity(usize::from(nkeys));
                for _ in 0..nkeys {
                    reports.push(KeyLoadReport {
                        keyhash: r.u32()?,
                        load: r.u16()?,
                    });
                }
                Ok(ControlMessage::HotKeyReport { reports })
            }
            CTRL_TYPE_REPLICATION => {
                let keyhash = r.u32()?;
                let key_len = r.u16()? as usize;
                let key = key_from_bytes(r.bytes(key_len)?)?;
                Ok(ControlMessage::Replication { keyhash, key })
            }
            other => Err(CodecError::UnknownOp(other)),
        }
    }
}
