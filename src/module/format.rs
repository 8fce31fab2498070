//! Binary layout of a compiled template module.
//!
//! A module is one flat, relocatable byte blob: a fixed header, a table of
//! sub-program descriptors, an opcode array, and a trailing data segment
//! holding the literal text and identifier names the opcodes reference by
//! address. Reference fields (`data_ref`, each program's `opcode_ref`, and
//! the operand of data-referencing opcodes) are stored relative to the
//! header's `self_addr` base, so a blob can be rebased without walking any
//! pointers at render time.
//!
//! Fields are host-endian: a blob never travels between machines, only
//! between processes and restarts on the same host.

use std::time::{SystemTime, UNIX_EPOCH};

use bytemuck::{Pod, Zeroable};
use xxhash_rust::xxh64::xxh64;

use crate::error::CacheError;

/// Fixed magic at the start of every module blob ("TMPLMOD1").
pub const MODULE_MAGIC: u64 = u64::from_ne_bytes(*b"TMPLMOD1");

/// Build-version tag stamped into every module this crate produces.
pub const MODULE_VERSION: u32 = 1;

/// Byte length of [`ModuleHeader`].
pub const HEADER_LEN: usize = std::mem::size_of::<ModuleHeader>();

/// Byte length of one [`ProgramDesc`] table entry.
pub const PROG_DESC_LEN: usize = std::mem::size_of::<ProgramDesc>();

/// Byte length of one [`Opcode`].
pub const OPCODE_LEN: usize = std::mem::size_of::<Opcode>();

pub(crate) const HASH_FIELD_OFFSET: usize = 8;
pub(crate) const HASHED_SPAN_START: usize = 16;
pub(crate) const VERSION_OFFSET: usize = 16;
pub(crate) const SELF_ADDR_OFFSET: usize = 24;
pub(crate) const SIZE_OFFSET: usize = 32;
pub(crate) const TIMESTAMP_OFFSET: usize = 40;
pub(crate) const DATA_REF_OFFSET: usize = 56;

/// Terminate the current program.
pub const OP_HALT: u32 = 0;
/// Emit a literal from the data segment. Operand references the literal.
pub const OP_TEXT: u32 = 1;
/// Look up a variable by name and emit it escaped. Operand references the name.
pub const OP_VAR: u32 = 2;
/// Look up a variable by name and emit it verbatim. Operand references the name.
pub const OP_VAR_RAW: u32 = 3;
/// Unconditional jump. `arg` is the target opcode index.
pub const OP_JUMP: u32 = 4;
/// Jump when the current section value is empty. `arg` is the target index.
pub const OP_JUMP_IF_EMPTY: u32 = 5;
/// Invoke a sub-program. `arg` is the program id.
pub const OP_CALL: u32 = 6;

/// Whether an opcode's operand references the data segment (and therefore
/// participates in relocation).
pub fn op_references_data(op: u32) -> bool {
    matches!(op, OP_TEXT | OP_VAR | OP_VAR_RAW)
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Fixed module header. Everything after the `hash` field is covered by the
/// content hash (computed over the base-0 normalized image, see
/// [`crate::module::reloc::generate_hash`]).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ModuleHeader {
    pub magic: u64,
    pub hash: u64,
    pub version: u32,
    pub flags: u32,
    /// Base address the reference fields were last computed against.
    pub self_addr: u64,
    /// Total blob length in bytes.
    pub size: u64,
    /// Creation time, unix seconds.
    pub timestamp: u64,
    pub program_count: u32,
    pub opcode_count: u32,
    /// Reference to the start of the data segment.
    pub data_ref: u64,
}

/// One sub-program descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ProgramDesc {
    pub id: u32,
    pub opcode_count: u32,
    /// Reference to the program's first opcode.
    pub opcode_ref: u64,
}

/// One bytecode instruction.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Opcode {
    pub op: u32,
    pub arg: u32,
    /// Data-segment reference for data-referencing ops, immediate otherwise.
    pub operand: u64,
}

pub(crate) fn read_u64(bytes: &[u8], off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[off..off + 8]);
    u64::from_ne_bytes(buf)
}

pub(crate) fn write_u64(bytes: &mut [u8], off: usize, value: u64) {
    bytes[off..off + 8].copy_from_slice(&value.to_ne_bytes());
}

/// Resolve a reference field into a blob offset, relative to `self_addr`.
/// Works identically on patched and normalized modules.
fn resolve(reference: u64, self_addr: u64, blob_len: usize) -> Result<usize, CacheError> {
    let off = reference.wrapping_sub(self_addr);
    if off > blob_len as u64 {
        return Err(CacheError::Malformed("reference outside blob"));
    }
    Ok(off as usize)
}

/// A borrowed, bounds-checked view over a module blob.
///
/// [`ModuleView::new`] validates the entire reachable structure up front, so
/// the accessors can index without re-checking.
#[derive(Clone, Copy)]
pub struct ModuleView<'a> {
    bytes: &'a [u8],
    header: ModuleHeader,
}

impl<'a> ModuleView<'a> {
    /// Validate `bytes` as a module blob and build a view over it.
    pub fn new(bytes: &'a [u8]) -> Result<Self, CacheError> {
        if bytes.len() < HEADER_LEN {
            return Err(CacheError::Malformed("blob shorter than header"));
        }
        let header: ModuleHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);
        if header.magic != MODULE_MAGIC {
            return Err(CacheError::Malformed("bad magic"));
        }
        if header.size as usize != bytes.len() {
            return Err(CacheError::Malformed("size field disagrees with blob length"));
        }

        let prog_len = (header.program_count as usize)
            .checked_mul(PROG_DESC_LEN)
            .ok_or(CacheError::Malformed("program table overflow"))?;
        let prog_end = HEADER_LEN
            .checked_add(prog_len)
            .ok_or(CacheError::Malformed("program table overflow"))?;
        let op_len = (header.opcode_count as usize)
            .checked_mul(OPCODE_LEN)
            .ok_or(CacheError::Malformed("opcode array overflow"))?;
        let op_end = prog_end
            .checked_add(op_len)
            .ok_or(CacheError::Malformed("opcode array overflow"))?;
        if op_end > bytes.len() {
            return Err(CacheError::Malformed("tables exceed blob length"));
        }

        let data_start = resolve(header.data_ref, header.self_addr, bytes.len())?;
        if data_start != op_end {
            return Err(CacheError::Malformed("data segment reference out of place"));
        }

        let view = Self { bytes, header };
        for desc in view.programs() {
            let off = resolve(desc.opcode_ref, header.self_addr, bytes.len())?;
            let count = desc.opcode_count as usize;
            if off < prog_end
                || off > op_end
                || (off - prog_end) % OPCODE_LEN != 0
                || off + count * OPCODE_LEN > op_end
            {
                return Err(CacheError::Malformed("program opcodes out of range"));
            }
        }
        for opcode in view.opcodes() {
            if op_references_data(opcode.op) {
                let off = resolve(opcode.operand, header.self_addr, bytes.len())?;
                if off < op_end || off + 4 > bytes.len() {
                    return Err(CacheError::Malformed("data reference out of range"));
                }
                let len = view.data_len_at(off);
                if off + 4 + len > bytes.len() {
                    return Err(CacheError::Malformed("data item exceeds blob"));
                }
            }
        }

        Ok(view)
    }

    /// Build a view without re-validating. Only for blobs this crate already
    /// validated (construction, post-relocation access).
    pub(crate) fn new_unchecked(bytes: &'a [u8]) -> Self {
        let header: ModuleHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);
        Self { bytes, header }
    }

    pub fn header(&self) -> &ModuleHeader {
        &self.header
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn data_len_at(&self, off: usize) -> usize {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.bytes[off..off + 4]);
        u32::from_ne_bytes(buf) as usize
    }

    /// The program table.
    pub fn programs(&self) -> impl Iterator<Item = ProgramDesc> + 'a {
        let bytes = self.bytes;
        (0..self.header.program_count as usize).map(move |i| {
            let off = HEADER_LEN + i * PROG_DESC_LEN;
            bytemuck::pod_read_unaligned(&bytes[off..off + PROG_DESC_LEN])
        })
    }

    /// The full opcode array.
    pub fn opcodes(&self) -> impl Iterator<Item = Opcode> + 'a {
        let bytes = self.bytes;
        let base = HEADER_LEN + self.header.program_count as usize * PROG_DESC_LEN;
        (0..self.header.opcode_count as usize).map(move |i| {
            let off = base + i * OPCODE_LEN;
            bytemuck::pod_read_unaligned(&bytes[off..off + OPCODE_LEN])
        })
    }

    /// The opcode run belonging to one program descriptor.
    pub fn opcodes_of(&self, desc: &ProgramDesc) -> impl Iterator<Item = Opcode> + 'a {
        let bytes = self.bytes;
        let base = desc.opcode_ref.wrapping_sub(self.header.self_addr) as usize;
        (0..desc.opcode_count as usize).map(move |i| {
            let off = base + i * OPCODE_LEN;
            bytemuck::pod_read_unaligned(&bytes[off..off + OPCODE_LEN])
        })
    }

    /// Resolve a data-segment reference into its payload bytes.
    pub fn data_at(&self, reference: u64) -> &'a [u8] {
        let off = reference.wrapping_sub(self.header.self_addr) as usize;
        let len = self.data_len_at(off);
        &self.bytes[off + 4..off + 4 + len]
    }
}

/// An owned module blob, validated at construction.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    bytes: Vec<u8>,
}

impl CompiledModule {
    /// Take ownership of a serialized blob, validating its structure.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CacheError> {
        ModuleView::new(&bytes)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn view(&self) -> ModuleView<'_> {
        ModuleView::new_unchecked(&self.bytes)
    }

    pub fn header(&self) -> ModuleHeader {
        *self.view().header()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

struct PendingOp {
    op: u32,
    arg: u32,
    data: Option<Vec<u8>>,
}

struct PendingProgram {
    id: u32,
    ops: Vec<PendingOp>,
}

/// Assembles module blobs. This is the serializer-side producer: the
/// compiler emits programs and opcodes through it and receives a normalized,
/// hashed [`CompiledModule`].
pub struct ModuleBuilder {
    flags: u32,
    timestamp: u64,
    programs: Vec<PendingProgram>,
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self {
            flags: 0,
            timestamp: unix_now(),
            programs: Vec::new(),
        }
    }

    /// Set the compiler-flags bitfield.
    pub fn flags(&mut self, flags: u32) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Override the creation timestamp (unix seconds).
    pub fn timestamp(&mut self, unix_secs: u64) -> &mut Self {
        self.timestamp = unix_secs;
        self
    }

    /// Start a new sub-program. Subsequent opcode calls append to it.
    pub fn begin_program(&mut self, id: u32) -> &mut Self {
        self.programs.push(PendingProgram {
            id,
            ops: Vec::new(),
        });
        self
    }

    fn push(&mut self, op: u32, arg: u32, data: Option<Vec<u8>>) -> &mut Self {
        if self.programs.is_empty() {
            self.begin_program(0);
        }
        // begin_program above guarantees a tail element
        if let Some(prog) = self.programs.last_mut() {
            prog.ops.push(PendingOp { op, arg, data });
        }
        self
    }

    pub fn text(&mut self, literal: &str) -> &mut Self {
        self.push(OP_TEXT, 0, Some(literal.as_bytes().to_vec()))
    }

    pub fn var(&mut self, name: &str) -> &mut Self {
        self.push(OP_VAR, 0, Some(name.as_bytes().to_vec()))
    }

    pub fn var_raw(&mut self, name: &str) -> &mut Self {
        self.push(OP_VAR_RAW, 0, Some(name.as_bytes().to_vec()))
    }

    pub fn jump(&mut self, target: u32) -> &mut Self {
        self.push(OP_JUMP, target, None)
    }

    pub fn jump_if_empty(&mut self, target: u32) -> &mut Self {
        self.push(OP_JUMP_IF_EMPTY, target, None)
    }

    pub fn call(&mut self, program_id: u32) -> &mut Self {
        self.push(OP_CALL, program_id, None)
    }

    pub fn halt(&mut self) -> &mut Self {
        self.push(OP_HALT, 0, None)
    }

    /// Assemble the blob in normalized (base 0) form and stamp its content
    /// hash.
    pub fn finish(self) -> CompiledModule {
        let program_count = self.programs.len();
        let opcode_count: usize = self.programs.iter().map(|p| p.ops.len()).sum();

        let opcode_base = HEADER_LEN + program_count * PROG_DESC_LEN;
        let data_base = opcode_base + opcode_count * OPCODE_LEN;

        let mut descs = Vec::with_capacity(program_count);
        let mut opcodes = Vec::with_capacity(opcode_count);
        let mut data_seg = Vec::new();

        let mut op_cursor = 0usize;
        for prog in &self.programs {
            descs.push(ProgramDesc {
                id: prog.id,
                opcode_count: prog.ops.len() as u32,
                opcode_ref: (opcode_base + op_cursor * OPCODE_LEN) as u64,
            });
            for pending in &prog.ops {
                let operand = match &pending.data {
                    Some(payload) => {
                        let item_off = data_base + data_seg.len();
                        data_seg.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
                        data_seg.extend_from_slice(payload);
                        item_off as u64
                    }
                    None => 0,
                };
                opcodes.push(Opcode {
                    op: pending.op,
                    arg: pending.arg,
                    operand,
                });
                op_cursor += 1;
            }
        }

        let size = data_base + data_seg.len();
        let header = ModuleHeader {
            magic: MODULE_MAGIC,
            hash: 0,
            version: MODULE_VERSION,
            flags: self.flags,
            self_addr: 0,
            size: size as u64,
            timestamp: self.timestamp,
            program_count: program_count as u32,
            opcode_count: opcode_count as u32,
            data_ref: data_base as u64,
        };

        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        for desc in &descs {
            bytes.extend_from_slice(bytemuck::bytes_of(desc));
        }
        for opcode in &opcodes {
            bytes.extend_from_slice(bytemuck::bytes_of(opcode));
        }
        bytes.extend_from_slice(&data_seg);

        let hash = xxh64(&bytes[HASHED_SPAN_START..], 0);
        write_u64(&mut bytes, HASH_FIELD_OFFSET, hash);

        CompiledModule { bytes }
    }
}
