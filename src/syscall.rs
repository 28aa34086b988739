//! Syscall-style entry points over the global runtime.
//!
//! Arguments arrive as raw integers and byte slices; failures map onto
//! `axerrno` codes.

use axerrno::{AxResult, ax_err, ax_err_type};

use crate::context::AttachmentKey;
use crate::registry::ProbeId;
use crate::runtime::{self, ProbeRuntime};

/// Raw attachment class numbers accepted by [`sys_register_probe`].
pub const PLACE_SYSCALL: u32 = 0;
pub const PLACE_KPROBE: u32 = 1;
pub const PLACE_UPROBE: u32 = 2;

fn runtime() -> AxResult<&'static ProbeRuntime> {
    runtime::global().ok_or_else(|| ax_err_type!(BadState, "probe runtime not initialized"))
}

/// Build an attachment key from its raw `(place, target)` encoding.
pub fn decode_key(place: u32, target: u64) -> AxResult<AttachmentKey> {
    match place {
        PLACE_SYSCALL => u32::try_from(target)
            .map(AttachmentKey::Syscall)
            .map_err(|_| ax_err_type!(InvalidInput, "syscall number out of range")),
        PLACE_KPROBE => Ok(AttachmentKey::Kprobe(target)),
        PLACE_UPROBE => Ok(AttachmentKey::Uprobe(target)),
        _ => ax_err!(InvalidInput, "unknown attachment place"),
    }
}

/// Verify `bytecode` and attach it at `(place, target)`.
///
/// Returns the new probe id.
pub fn sys_register_probe(place: u32, target: u64, bytecode: &[u8]) -> AxResult<usize> {
    let rt = runtime()?;
    let key = decode_key(place, target)?;
    match rt.load(bytecode, key) {
        Ok(id) => Ok(id.as_u32() as usize),
        Err(e) => {
            debug!("sys_register_probe: {}", e);
            ax_err!(InvalidInput, "probe rejected by verifier")
        }
    }
}

/// Detach probe `id`.
pub fn sys_unregister_probe(id: usize) -> AxResult {
    let rt = runtime()?;
    let id = u32::try_from(id).map_err(|_| ax_err_type!(InvalidInput, "probe id out of range"))?;
    if rt.detach(ProbeId::from_u32(id)) {
        Ok(())
    } else {
        ax_err!(NotFound, "no such probe")
    }
}
