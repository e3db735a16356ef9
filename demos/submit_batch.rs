use intel_winsys::{ExecFlags, RelocFlags, Ring, WaitStatus, WinSys, WinsysConfig, WinsysResult};

// MI_STORE_DATA_IMM with a 64-bit address, then MI_BATCH_BUFFER_END.
const MI_STORE_DATA_IMM: u32 = (0x20 << 23) | 2;
const MI_BATCH_BUFFER_END: u32 = 0x0a << 23;
const MAGIC: u32 = 0xc0ff_ee00;

fn main() -> WinsysResult<()> {
    env_logger::init();

    let ws = WinSys::open_render_node(WinsysConfig::from_env())?;
    println!("[+] Device 0x{:04x} opened", ws.info().devid);

    let target = ws.alloc_bo("store target", 4096, true)?;
    let batch = ws.alloc_bo("batch", 4096, true)?;

    // The address dword pair sits right after the header.
    let presumed = batch.add_reloc(4, &target, 0, RelocFlags::WRITE | RelocFlags::GGTT)?;
    let mut dwords = vec![MI_STORE_DATA_IMM];
    dwords.push(presumed as u32);
    dwords.push((presumed >> 32) as u32);
    dwords.push(MAGIC);
    dwords.push(MI_BATCH_BUFFER_END);
    dwords.push(0);

    let bytes: Vec<u8> = dwords.iter().flat_map(|d| d.to_le_bytes()).collect();
    batch.write_range(0, &bytes)?;

    if !ws.can_submit(&[&batch]) {
        eprintln!("[-] Working set does not fit in the aperture");
        return Ok(());
    }

    println!("[+] Submitting {} bytes on the render ring...", bytes.len());
    ws.submit(Ring::Render, &batch, bytes.len(), ExecFlags::empty())?;

    match target.wait_checked(1_000_000_000)? {
        WaitStatus::Idle => {
            let mut word = [0u8; 4];
            target.read_range(0, &mut word)?;
            let value = u32::from_le_bytes(word);
            println!(
                "[+] Target @ 0x{:x} reads 0x{:08x} ({})",
                target.presumed_offset(),
                value,
                if value == MAGIC { "ok" } else { "MISMATCH" }
            );
        }
        WaitStatus::Busy => eprintln!("[-] Batch still running after 1s"),
    }

    Ok(())
}
