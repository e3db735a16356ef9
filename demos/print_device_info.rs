use intel_winsys::{WinSys, WinsysConfig};
use std::process::ExitCode;

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

fn main() -> ExitCode {
    env_logger::init();

    println!("============================================================");
    println!("                Intel GPU Window System Info                ");
    println!("============================================================");

    println!("[+] Opening render node...");
    let ws = match WinSys::open_render_node(WinsysConfig::from_env()) {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("[-] Failed to initialize: {}", e);
            eprintln!("    (Ensure the i915 kernel module is loaded and you have permissions)");
            return ExitCode::FAILURE;
        }
    };

    let info = ws.info();
    println!("    Device ID:         0x{:04x}", info.devid);
    println!(
        "    Aperture:          {} MiB total, {} MiB mappable",
        info.aperture_total >> 20,
        info.aperture_mappable >> 20
    );
    println!("    LLC:               {}", yes_no(info.has_llc));
    println!("    Address swizzling: {}", yes_no(info.has_address_swizzling));
    println!("    Logical context:   {}", yes_no(info.has_logical_context));
    println!("    Aliasing PPGTT:    {}", yes_no(info.has_ppgtt));
    println!("    Timestamp reg:     {}", yes_no(info.has_timestamp));
    println!("    GEN7 SOL reset:    {}", yes_no(info.has_gen7_sol_reset));

    if info.has_timestamp {
        match ws.read_reg(intel_winsys::winsys::probe::TIMESTAMP_REG) {
            Ok(ts) => println!("    Timestamp:         {}", ts),
            Err(e) => eprintln!("[-] Timestamp read failed: {}", e),
        }
    }

    match ws.reset_stats() {
        Ok(stats) => println!(
            "    Resets:            {} (active lost {}, pending lost {})",
            stats.reset_count, stats.active_lost, stats.pending_lost
        ),
        Err(e) => println!("    Resets:            unavailable ({})", e),
    }

    let config = ws.config();
    println!("\n[+] Configuration");
    println!("    Batch size:        {} bytes", config.batch_size);
    println!("    Max relocations:   {}", config.max_relocs());
    println!("    Buffer reuse:      {}", yes_no(config.bo_reuse));
    println!("    Cache expiry:      {:?}", config.cache_expiry);

    ExitCode::SUCCESS
}
