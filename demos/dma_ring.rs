use pcidma_rs::{Context, PdaResult};

const RING_PAGES: usize = 16;

fn main() -> PdaResult<()> {
    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0000:03:00.0".to_string());

    let ctx = Context::from_env()?;
    let mut device = ctx.device_by_name(&name)?;
    let page = pcidma_rs::utils::page_size();

    let buffer = device.allocate_buffer(None, RING_PAGES * page)?;
    println!("Allocated buffer {} ({} bytes)", buffer.index(), buffer.len());

    match buffer.wrap_map() {
        Ok(()) => println!(
            "Ring views at {:p} and {:p}",
            buffer.map(),
            buffer.map_two().unwrap_or(std::ptr::null_mut())
        ),
        Err(e) => println!("No ring view ({e}), using {:p}", buffer.map()),
    }

    let sg = buffer.sg_list()?;
    println!("\n--- Scatter/Gather List ({} entries) ---", sg.len());
    for node in sg.iter() {
        println!(
            "  bus {:#014x} | user {:#014x} | {:>8} bytes",
            node.device_address, node.user_ptr, node.length
        );
    }

    let index = buffer.index();
    device.delete_buffer(index, false)
}
