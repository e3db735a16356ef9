//! Best-effort batch decoding for debugging.
//!
//! Only command headers are interpreted: enough to walk a batch and name the
//! commands in it. Anything unrecognised is reported as such and skipped by
//! its length field.

use crate::winsys::WinSys;
use crate::winsys::bo::BufferObject;

const MI_NOOP: u32 = 0x00;
const MI_BATCH_BUFFER_END: u32 = 0x0a;
const MI_STORE_DATA_IMM: u32 = 0x20;
const MI_LOAD_REGISTER_IMM: u32 = 0x22;
const MI_BATCH_BUFFER_START: u32 = 0x31;

const CLIENT_MI: u32 = 0;
const CLIENT_2D: u32 = 2;
const CLIENT_3D: u32 = 3;

/// One command found in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCommand {
    /// Byte offset of the header within the batch.
    pub offset: usize,
    pub header: u32,
    pub name: &'static str,
    /// Length in dwords, header included.
    pub len: usize,
}

fn mi_command(header: u32) -> (&'static str, usize) {
    let opcode = (header >> 23) & 0x3f;
    match opcode {
        MI_NOOP => ("MI_NOOP", 1),
        MI_BATCH_BUFFER_END => ("MI_BATCH_BUFFER_END", 1),
        MI_STORE_DATA_IMM => ("MI_STORE_DATA_IMM", (header & 0x3f) as usize + 2),
        MI_LOAD_REGISTER_IMM => ("MI_LOAD_REGISTER_IMM", (header & 0xff) as usize + 2),
        MI_BATCH_BUFFER_START => ("MI_BATCH_BUFFER_START", (header & 0xff) as usize + 2),
        // Opcodes below 0x10 are single-dword commands.
        op if op < 0x10 => ("MI (unknown)", 1),
        _ => ("MI (unknown)", (header & 0x3f) as usize + 2),
    }
}

fn blt_command(header: u32) -> (&'static str, usize) {
    let name = match (header >> 22) & 0x7f {
        0x01 => "XY_SETUP_BLT",
        0x50 => "XY_COLOR_BLT",
        0x53 => "XY_SRC_COPY_BLT",
        _ => "2D (unknown)",
    };
    (name, (header & 0xff) as usize + 2)
}

fn gfx_command(header: u32) -> (&'static str, usize) {
    let subtype = (header >> 27) & 0x3;
    let opcode = (header >> 24) & 0x7;
    let subopcode = (header >> 16) & 0xff;

    match (subtype, opcode, subopcode) {
        // Non-pipelined single-dword state.
        (1, 1, 0x04) => ("PIPELINE_SELECT", 1),
        (0, 1, 0x01) => ("STATE_BASE_ADDRESS", (header & 0xff) as usize + 2),
        (3, 2, 0x00) => ("PIPE_CONTROL", (header & 0xff) as usize + 2),
        (3, 3, 0x00) => ("3DPRIMITIVE", (header & 0xff) as usize + 2),
        (3, 0, _) => ("3DSTATE", (header & 0xff) as usize + 2),
        (2, _, _) => ("MEDIA", (header & 0xffff) as usize + 2),
        _ => ("3D (unknown)", (header & 0xff) as usize + 2),
    }
}

/// Walks `dwords` command by command, stopping at the batch end or at a
/// command that runs past the data.
#[must_use]
pub fn decode_batch(dwords: &[u32]) -> Vec<DecodedCommand> {
    let mut commands = Vec::new();
    let mut pos = 0;

    while let Some(&header) = dwords.get(pos) {
        let (name, len) = match header >> 29 {
            CLIENT_MI => mi_command(header),
            CLIENT_2D => blt_command(header),
            CLIENT_3D => gfx_command(header),
            _ => ("unknown client", 1),
        };
        if pos + len > dwords.len() {
            break;
        }

        commands.push(DecodedCommand {
            offset: pos * 4,
            header,
            name,
            len,
        });
        if header >> 29 == CLIENT_MI && (header >> 23) & 0x3f == MI_BATCH_BUFFER_END {
            break;
        }
        pos += len;
    }
    commands
}

impl WinSys {
    /// Decodes the first `used` bytes of `bo` and logs every command.
    ///
    /// Failures to read the batch yield an empty list; decoding never
    /// affects the buffer or the submission path.
    pub fn decode_bo(&self, bo: &BufferObject, used: usize) -> Vec<DecodedCommand> {
        let len = used.min(usize::try_from(bo.size()).unwrap_or(usize::MAX)) & !3;
        let mut bytes = vec![0u8; len];
        if let Err(e) = bo.read_range(0, &mut bytes) {
            log::debug!("bo '{}': cannot read batch for decoding: {e}", bo.name());
            return Vec::new();
        }

        let dwords: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let commands = decode_batch(&dwords);

        log::info!("batch '{}' ({len} bytes):", bo.name());
        for cmd in &commands {
            log::info!(
                "  0x{:05x}: 0x{:08x} {} ({} dwords)",
                cmd.offset,
                cmd.header,
                cmd.name,
                cmd.len
            );
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn mi(opcode: u32, len_field: u32) -> u32 {
        (opcode << 23) | len_field
    }

    #[test]
    fn test_walks_mi_commands() {
        let batch = [
            mi(MI_NOOP, 0),
            mi(MI_LOAD_REGISTER_IMM, 1),
            0x2358,
            0,
            mi(MI_STORE_DATA_IMM, 2),
            0x1000,
            0,
            0xdead,
            mi(MI_BATCH_BUFFER_END, 0),
            mi(MI_NOOP, 0),
        ];
        let cmds = decode_batch(&batch);
        let names: Vec<_> = cmds.iter().map(|c| c.name).collect();

        assert_eq!(
            names,
            [
                "MI_NOOP",
                "MI_LOAD_REGISTER_IMM",
                "MI_STORE_DATA_IMM",
                "MI_BATCH_BUFFER_END"
            ]
        );
        assert_eq!(cmds[2].offset, 16);
        assert_eq!(cmds[2].len, 4);
    }

    #[test]
    fn test_truncated_command_stops_decoding() {
        let batch = [mi(MI_LOAD_REGISTER_IMM, 5), 0];
        assert!(decode_batch(&batch).is_empty());
    }

    #[test]
    fn test_names_blitter_and_render_commands() {
        let color_blt = (2 << 29) | (0x50 << 22) | 4;
        let pipe_control = 0x7a00_0002;
        let mut batch = vec![color_blt, 0, 0, 0, 0, 0];
        batch.extend([pipe_control, 0, 0, 0]);

        let cmds = decode_batch(&batch);
        assert_eq!(cmds[0].name, "XY_COLOR_BLT");
        assert_eq!(cmds[0].len, 6);
        assert_eq!(cmds[1].name, "PIPE_CONTROL");
        assert_eq!(cmds[1].offset, 24);
    }
}
