#[macro_use]
extern crate log;

use anyhow::Result;
use clap::Parser;

use lamlet_soft::*;

pub fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let params = match args.geometry {
        GeometryChoice::Column => LamletParams::small(),
        GeometryChoice::Square => LamletParams::square(),
    };
    let demo = match args.command {
        Some(Commands::Demo(demo)) => demo,
        None => DemoArgs { vl: 8, ew: 32, stride: 16 },
    };

    let mut lamlet = Lamlet::new(&params, args.max_cycles)?;
    let ordering = Ordering::new(WordOrder::Standard, demo.ew);
    let eb = demo.ew / 8;
    let span = (demo.vl as i64 - 1) * demo.stride + eb as i64;
    let pages = (span as usize).div_ceil(params.page_bytes).max(1);
    let src_base = 0u64;
    let dst_base = (pages * params.page_bytes) as u64;
    lamlet.allocate_memory(src_base, pages * params.page_bytes, MemoryType::Vpu, Some(ordering));
    lamlet.allocate_memory(dst_base, pages * params.page_bytes, MemoryType::Vpu, Some(ordering));

    let ew_mask = if demo.ew >= 64 { u64::MAX } else { (1u64 << demo.ew) - 1 };
    for i in 0..demo.vl {
        let value = 0x1111_1111u64.wrapping_mul(i as u64 + 1) & ew_mask;
        let offset = src_base + (i as i64 * demo.stride) as u64;
        lamlet.set_memory(offset, &value.to_le_bytes()[..eb])?;
    }

    let load = lamlet.vload_strided(0, src_base, demo.stride, ordering, demo.vl, 0, None)?;
    info!("strided load: success={}", load.success);
    let store = lamlet.vstore_strided(0, dst_base, demo.stride, ordering, demo.vl, 0, None)?;
    info!("strided store: success={}", store.success);

    let mut ok = true;
    for i in 0..demo.vl {
        let src = lamlet.get_memory(src_base + (i as i64 * demo.stride) as u64, eb)?;
        let dst = lamlet.get_memory(dst_base + (i as i64 * demo.stride) as u64, eb)?;
        if src != dst {
            warn!("element {i}: source {src:02x?} != destination {dst:02x?}");
            ok = false;
        }
    }

    println!(
        "round trip {} after {} cycles ({} messages sent, {} received)",
        if ok { "matched" } else { "MISMATCHED" },
        lamlet.clock.cycle,
        lamlet.monitor.messages_sent,
        lamlet.monitor.messages_received,
    );
    if let Some(path) = args.trace {
        lamlet.monitor.export_trace(&path)?;
        info!("trace written to {path}");
    }
    anyhow::ensure!(ok, "round trip mismatch");
    Ok(())
}
