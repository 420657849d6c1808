//! KV protocol constants and the packet model.

/// Fixed header size for every frame.
pub const HEADER_SIZE: usize = 24;

/// Default cap on a whole frame (header + body). Larger frames are a
/// protocol fault, not a bigger allocation.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 20 * 1024 * 1024;

// ── Magic bytes ──────────────────────────────────────────────────────────

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;
/// Framed variants carry framing extras at the head of the body.
pub const MAGIC_FRAMED_REQUEST: u8 = 0x18;
pub const MAGIC_FRAMED_RESPONSE: u8 = 0x19;

/// Direction + framing variant of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
    FramedRequest,
    FramedResponse,
}

impl Magic {
    pub fn from_byte(b: u8) -> Option<Magic> {
        match b {
            MAGIC_REQUEST => Some(Magic::Request),
            MAGIC_RESPONSE => Some(Magic::Response),
            MAGIC_FRAMED_REQUEST => Some(Magic::FramedRequest),
            MAGIC_FRAMED_RESPONSE => Some(Magic::FramedResponse),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Magic::Request => MAGIC_REQUEST,
            Magic::Response => MAGIC_RESPONSE,
            Magic::FramedRequest => MAGIC_FRAMED_REQUEST,
            Magic::FramedResponse => MAGIC_FRAMED_RESPONSE,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, Magic::Response | Magic::FramedResponse)
    }

    pub fn is_framed(self) -> bool {
        matches!(self, Magic::FramedRequest | Magic::FramedResponse)
    }
}

// ── Opcodes ──────────────────────────────────────────────────────────────

pub const OP_GET: u8 = 0x00;
pub const OP_SET: u8 = 0x01;
pub const OP_ADD: u8 = 0x02;
pub const OP_REPLACE: u8 = 0x03;
pub const OP_DELETE: u8 = 0x04;
pub const OP_INCREMENT: u8 = 0x05;
pub const OP_DECREMENT: u8 = 0x06;
pub const OP_NOOP: u8 = 0x0a;
pub const OP_APPEND: u8 = 0x0e;
pub const OP_PREPEND: u8 = 0x0f;
pub const OP_TOUCH: u8 = 0x1c;
pub const OP_GET_AND_TOUCH: u8 = 0x1d;
pub const OP_HELLO: u8 = 0x1f;
pub const OP_SASL_LIST_MECHS: u8 = 0x20;
pub const OP_SASL_AUTH: u8 = 0x21;
pub const OP_SASL_STEP: u8 = 0x22;
pub const OP_GET_REPLICA: u8 = 0x83;
pub const OP_SELECT_BUCKET: u8 = 0x89;
pub const OP_OBSERVE: u8 = 0x92;
pub const OP_GET_CLUSTER_CONFIG: u8 = 0xb5;
pub const OP_GET_ERROR_MAP: u8 = 0xfe;

// ── Status codes (response header, interpreted by the dispatcher) ────────

pub const STATUS_SUCCESS: u16 = 0x0000;
pub const STATUS_KEY_ENOENT: u16 = 0x0001;
pub const STATUS_KEY_EEXISTS: u16 = 0x0002;
pub const STATUS_E2BIG: u16 = 0x0003;
pub const STATUS_EINVAL: u16 = 0x0004;
pub const STATUS_NOT_STORED: u16 = 0x0005;
pub const STATUS_DELTA_BADVAL: u16 = 0x0006;
pub const STATUS_NOT_MY_VBUCKET: u16 = 0x0007;
pub const STATUS_NO_BUCKET: u16 = 0x0008;
pub const STATUS_LOCKED: u16 = 0x0009;
pub const STATUS_AUTH_STALE: u16 = 0x001f;
pub const STATUS_AUTH_ERROR: u16 = 0x0020;
pub const STATUS_AUTH_CONTINUE: u16 = 0x0021;
pub const STATUS_ERANGE: u16 = 0x0022;
pub const STATUS_ROLLBACK: u16 = 0x0023;
pub const STATUS_ACCESS_ERROR: u16 = 0x0024;
pub const STATUS_UNKNOWN_COMMAND: u16 = 0x0081;
pub const STATUS_NO_MEMORY: u16 = 0x0082;
pub const STATUS_NOT_SUPPORTED: u16 = 0x0083;
pub const STATUS_EINTERNAL: u16 = 0x0084;
pub const STATUS_EBUSY: u16 = 0x0085;
pub const STATUS_ETMPFAIL: u16 = 0x0086;

// ── HELLO feature codes ──────────────────────────────────────────────────

pub const FEAT_DATATYPE: u16 = 0x01;
pub const FEAT_TLS: u16 = 0x02;
pub const FEAT_MUTATION_SEQNO: u16 = 0x04;
pub const FEAT_XATTR: u16 = 0x06;
pub const FEAT_XERROR: u16 = 0x07;
pub const FEAT_SELECT_BUCKET: u16 = 0x08;
pub const FEAT_SNAPPY: u16 = 0x0a;
pub const FEAT_JSON: u16 = 0x0b;
pub const FEAT_CLUSTERMAP_NOTIFICATION: u16 = 0x0d;
pub const FEAT_UNORDERED_EXECUTION: u16 = 0x0e;
pub const FEAT_TRACING: u16 = 0x0f;

// ── Datatype bits ────────────────────────────────────────────────────────

pub const DATATYPE_RAW: u8 = 0x00;
pub const DATATYPE_JSON: u8 = 0x01;
pub const DATATYPE_SNAPPY: u8 = 0x02;
pub const DATATYPE_XATTR: u8 = 0x04;

// ── Packet model ─────────────────────────────────────────────────────────

/// One KV frame, request or response.
///
/// `status_or_partition` holds the partition id on requests and the status
/// code on responses; the codec does not interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub opcode: u8,
    pub datatype: u8,
    pub status_or_partition: u16,
    pub opaque: u32,
    pub cas: u64,
    /// Only meaningful on framed magics; empty otherwise.
    pub framing_extras: Vec<u8>,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Packet {
    /// A plain request skeleton; callers fill key/extras/value as the
    /// opcode requires.
    pub fn request(opcode: u8, partition: u16) -> Packet {
        Packet {
            magic: Magic::Request,
            opcode,
            datatype: DATATYPE_RAW,
            status_or_partition: partition,
            opaque: 0,
            cas: 0,
            framing_extras: Vec::new(),
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    /// A plain response skeleton (used by tests and fake servers).
    pub fn response(opcode: u8, status: u16, opaque: u32) -> Packet {
        Packet {
            magic: Magic::Response,
            opcode,
            datatype: DATATYPE_RAW,
            status_or_partition: status,
            opaque,
            cas: 0,
            framing_extras: Vec::new(),
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status_or_partition
    }

    pub fn total_body_len(&self) -> usize {
        self.framing_extras.len() + self.extras.len() + self.key.len() + self.value.len()
    }
}

/// Human-readable status name for logs.
pub fn status_name(status: u16) -> &'static str {
    match status {
        STATUS_SUCCESS => "success",
        STATUS_KEY_ENOENT => "key_not_found",
        STATUS_KEY_EEXISTS => "key_exists",
        STATUS_E2BIG => "too_big",
        STATUS_EINVAL => "invalid_arguments",
        STATUS_NOT_STORED => "not_stored",
        STATUS_DELTA_BADVAL => "delta_badval",
        STATUS_NOT_MY_VBUCKET => "not_my_vbucket",
        STATUS_NO_BUCKET => "no_bucket",
        STATUS_LOCKED => "locked",
        STATUS_AUTH_STALE => "auth_stale",
        STATUS_AUTH_ERROR => "auth_error",
        STATUS_AUTH_CONTINUE => "auth_continue",
        STATUS_ERANGE => "range_error",
        STATUS_ROLLBACK => "rollback",
        STATUS_ACCESS_ERROR => "access_error",
        STATUS_UNKNOWN_COMMAND => "unknown_command",
        STATUS_NO_MEMORY => "no_memory",
        STATUS_NOT_SUPPORTED => "not_supported",
        STATUS_EINTERNAL => "internal_error",
        STATUS_EBUSY => "busy",
        STATUS_ETMPFAIL => "temporary_failure",
        _ => "unknown",
    }
}
