//! Module relocation: rebasing internal references between address spaces.
//!
//! Every backend that moves a blob across a process or durability boundary
//! normalizes it on the way out (references relative to a fixed base,
//! usually 0) and patches it on the way back in (references valid at the
//! blob's current location), before anything beyond the header is touched.
//! Both directions are the same rebase walk over the module's reference
//! fields; the content hash is defined over the base-0 image so it is
//! invariant under relocation.

use tracing::warn;
use xxhash_rust::xxh64::xxh64;

use crate::error::CacheError;
use crate::module::format::{
    op_references_data, read_u64, write_u64, CompiledModule, ModuleView, DATA_REF_OFFSET,
    HASHED_SPAN_START, HASH_FIELD_OFFSET, HEADER_LEN, MODULE_VERSION, OPCODE_LEN, PROG_DESC_LEN,
    SELF_ADDR_OFFSET,
};

/// Byte offsets of every reference field in a validated blob: the header's
/// `data_ref`, each program's `opcode_ref`, and the operand of every
/// data-referencing opcode.
fn reference_offsets(view: &ModuleView<'_>) -> Vec<usize> {
    let program_count = view.header().program_count as usize;
    let opcode_count = view.header().opcode_count as usize;

    let mut offsets = Vec::with_capacity(1 + program_count + opcode_count);
    offsets.push(DATA_REF_OFFSET);

    for i in 0..program_count {
        offsets.push(HEADER_LEN + i * PROG_DESC_LEN + 8);
    }

    let op_base = HEADER_LEN + program_count * PROG_DESC_LEN;
    for (i, opcode) in view.opcodes().enumerate() {
        if op_references_data(opcode.op) {
            offsets.push(op_base + i * OPCODE_LEN + 8);
        }
    }

    offsets
}

fn rebase_bytes(bytes: &mut [u8], new_base: u64) -> Result<(), CacheError> {
    let view = ModuleView::new(bytes)?;
    let self_addr = view.header().self_addr;
    let offsets = reference_offsets(&view);

    for off in offsets {
        let reference = read_u64(bytes, off);
        write_u64(
            bytes,
            off,
            reference.wrapping_sub(self_addr).wrapping_add(new_base),
        );
    }
    write_u64(bytes, SELF_ADDR_OFFSET, new_base);
    Ok(())
}

/// Rewrite every internal reference relative to `base` and record `base` as
/// the blob's self-address.
pub fn normalize_bytes(bytes: &mut [u8], base: u64) -> Result<(), CacheError> {
    rebase_bytes(bytes, base)
}

/// The inverse of [`normalize_bytes`]: rebase every internal reference to
/// the blob's current location in memory.
pub fn patch_bytes(bytes: &mut [u8]) -> Result<(), CacheError> {
    let base = bytes.as_ptr() as u64;
    rebase_bytes(bytes, base)
}

/// [`normalize_bytes`] over an owned module.
pub fn normalize(module: &mut CompiledModule, base: u64) -> Result<(), CacheError> {
    normalize_bytes(module.bytes_mut(), base)
}

/// [`patch_bytes`] over an owned module.
pub fn patch(module: &mut CompiledModule) -> Result<(), CacheError> {
    patch_bytes(module.bytes_mut())
}

/// Compute the content hash over the blob's base-0 normalized image and
/// store it in the header. Returns the stored hash.
pub fn generate_hash_bytes(bytes: &mut [u8]) -> Result<u64, CacheError> {
    let hash = normalized_hash(bytes)?;
    write_u64(bytes, HASH_FIELD_OFFSET, hash);
    Ok(hash)
}

/// [`generate_hash_bytes`] over an owned module.
pub fn generate_hash(module: &mut CompiledModule) -> Result<u64, CacheError> {
    generate_hash_bytes(module.bytes_mut())
}

fn normalized_hash(bytes: &[u8]) -> Result<u64, CacheError> {
    ModuleView::new(bytes)?;
    let mut scratch = bytes.to_vec();
    rebase_bytes(&mut scratch, 0)?;
    Ok(xxh64(&scratch[HASHED_SPAN_START..], 0))
}

/// Recompute the content hash and compare it and the build-version tag.
///
/// Strict mode turns any mismatch into a hard error; lenient mode returns
/// `Ok(false)` so the caller can treat the blob as an ordinary miss.
pub fn verify(bytes: &[u8], strict: bool) -> Result<bool, CacheError> {
    let view = ModuleView::new(bytes)?;
    let stored = view.header().hash;
    let computed = normalized_hash(bytes)?;

    if stored != computed {
        if strict {
            return Err(CacheError::HashMismatch { stored, computed });
        }
        warn!(
            stored = format_args!("{stored:#018x}"),
            computed = format_args!("{computed:#018x}"),
            "Module content hash mismatch"
        );
        return Ok(false);
    }

    let version = view.header().version;
    if version != MODULE_VERSION {
        if strict {
            return Err(CacheError::VersionMismatch {
                stored: version,
                expected: MODULE_VERSION,
            });
        }
        warn!(version, expected = MODULE_VERSION, "Module version mismatch");
        return Ok(false);
    }

    Ok(true)
}

/// Structural equality over the reachable content of two blobs: header
/// metadata, program table, opcode streams, and every referenced data item.
/// Reference fields themselves are compared by what they resolve to, so two
/// copies of one module compare equal regardless of where each is based.
pub fn same_content(a: &[u8], b: &[u8]) -> Result<bool, CacheError> {
    let va = ModuleView::new(a)?;
    let vb = ModuleView::new(b)?;

    let (ha, hb) = (va.header(), vb.header());
    if ha.version != hb.version
        || ha.flags != hb.flags
        || ha.timestamp != hb.timestamp
        || ha.program_count != hb.program_count
        || ha.opcode_count != hb.opcode_count
    {
        return Ok(false);
    }

    for (pa, pb) in va.programs().zip(vb.programs()) {
        if pa.id != pb.id || pa.opcode_count != pb.opcode_count {
            return Ok(false);
        }
        for (oa, ob) in va.opcodes_of(&pa).zip(vb.opcodes_of(&pb)) {
            if oa.op != ob.op || oa.arg != ob.arg {
                return Ok(false);
            }
            if op_references_data(oa.op) {
                if va.data_at(oa.operand) != vb.data_at(ob.operand) {
                    return Ok(false);
                }
            } else if oa.operand != ob.operand {
                return Ok(false);
            }
        }
    }

    Ok(true)
}
