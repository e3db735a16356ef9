use intel_winsys::{HandleType, Tiling, WinSys, WinsysConfig, WinsysResult};

const WIDTH: u64 = 256;
const HEIGHT: u64 = 128;
const CPP: u64 = 4;

fn main() -> WinsysResult<()> {
    env_logger::init();

    // Two independent opens stand in for two processes.
    let producer = WinSys::open_render_node(WinsysConfig::from_env())?;
    let consumer = WinSys::open_render_node(WinsysConfig::from_env())?;

    let pitch = WIDTH * CPP;
    let bo = producer.alloc_bo("shared surface", pitch * HEIGHT, false)?;
    bo.set_tiling(Tiling::X, pitch)?;
    bo.write_range(0, b"hello from the producer")?;
    println!(
        "[+] Allocated '{}': {} bytes, {:?} tiled, pitch {}",
        bo.name(),
        bo.size(),
        bo.tiling(),
        bo.pitch()
    );

    for kind in [HandleType::Shared, HandleType::Fd] {
        let exported = producer.export_handle(&bo, kind, bo.tiling(), pitch, HEIGHT)?;
        println!("\n[+] Exported as {:?}: {:?}", kind, exported.handle);

        let imported = consumer.import_handle("imported surface", &exported)?;
        let mut text = [0u8; 23];
        imported.bo.read_range(0, &mut text)?;
        println!(
            "    Imported {} bytes, {:?} tiled ({:?}), pitch {}",
            imported.bo.size(),
            imported.tiling,
            imported.swizzle,
            imported.pitch
        );
        println!("    Contents: {:?}", String::from_utf8_lossy(&text));
    }

    Ok(())
}
