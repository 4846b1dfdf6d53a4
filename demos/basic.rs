use std::ptr::NonNull;

use mapalloc::MapAlloc;

fn log_alloc(addr: NonNull<u8>, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    pretty_env_logger::init();

    let allocator = MapAlloc::new();

    let addr1 = allocator.allocate(8).expect("allocation failed");
    log_alloc(addr1, 8);

    let addr2 = allocator.zero_allocate(8, 1).expect("allocation failed");
    log_alloc(addr2, 8);

    let addr3 = allocator.allocate(16).expect("allocation failed");
    log_alloc(addr3, 16);

    unsafe {
        allocator.print_memory().unwrap();

        let addr3 = allocator
            .resize(addr3.as_ptr(), 8000)
            .expect("resize failed")
            .expect("resize to a non zero size returns a block");
        log_alloc(addr3, 8000);

        allocator.deallocate(addr1.as_ptr());
        allocator.deallocate(addr2.as_ptr());
        allocator.print_memory().unwrap();

        allocator.deallocate(addr3.as_ptr());
    }

    println!("{:?}", allocator.usage());
}
