use jitpool::{JitAllocator, JitAllocatorOptions};

fn main() {
    let mut opts = JitAllocatorOptions::default();
    opts.use_dual_mapping = true;
    let allocator = JitAllocator::new(opts);

    let (rx, rw) = allocator.alloc(128).unwrap();
    println!("rx = {:p}, rw = {:p}", rx, rw);

    unsafe {
        rw.write(0x42);
        assert_eq!(rx.read(), 0x42);
    }

    allocator.shrink(rx, 64).unwrap();
    let (_, _, size) = allocator.query(rx).unwrap();
    println!("shrunk to {} bytes", size);

    let (rx2, rw2) = allocator.alloc(4096).unwrap();
    println!("rx = {:p}, rw = {:p}", rx2, rw2);

    let stats = allocator.statistics();
    println!(
        "blocks = {}, allocations = {}, used = {}/{} bytes ({:.1}%)",
        stats.block_count,
        stats.allocation_count,
        stats.used_size,
        stats.reserved_size,
        stats.used_size_as_percent()
    );

    allocator.release(rx).unwrap();
    allocator.release(rx2).unwrap();
}
