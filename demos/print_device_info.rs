use pcidma_rs::{BarKind, Context, PdaResult};

fn main() -> PdaResult<()> {
    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0000:03:00.0".to_string());

    println!("--- uio_pci_dma Context ---");
    let ctx = Context::from_env()?;
    match ctx.adapter_version() {
        Some(version) => println!("Adapter version: {version}"),
        None => println!("Adapter version: (not checked)"),
    }

    let mut device = match ctx.device_by_name(&name) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("Error opening {name} (is it bound to uio_pci_dma?): {e}");
            return Err(e);
        }
    };

    println!("\n--- Device {} ---", device.address());
    println!("NUMA node: {}", device.numa_node());
    match device.max_payload_size() {
        Ok(mps) => println!("Max payload size: {mps} bytes"),
        Err(e) => println!("Max payload size: unavailable ({e})"),
    }
    match device.max_read_request_size() {
        Ok(mrrs) => println!("Max read request size: {mrrs} bytes"),
        Err(e) => println!("Max read request size: unavailable ({e})"),
    }

    println!("\n--- BARs ---");
    for number in 0..6u8 {
        let kind = device.bar_kind(number)?;
        if !matches!(kind, BarKind::Mem32 | BarKind::Mem64) {
            println!("  bar{number}: {kind:?}");
            continue;
        }
        match device.get_bar(number) {
            Ok(bar) => println!(
                "  bar{number}: {kind:?} | phys {:#014x} | {} KiB",
                bar.physical_address(),
                bar.size() / 1024
            ),
            Err(e) => println!("  bar{number}: {kind:?} | not mappable: {e}"),
        }
    }

    println!("\n--- DMA Buffers ---");
    let ids = device.buffer_ids()?;
    if ids.is_empty() {
        println!("  - No buffers held by the adapter.");
    }
    for id in ids {
        println!("  - buffer {id}");
    }

    device.close(true)
}
