//! This example is designed to test the implementation of
//! the trait `GlobalAlloc` on our allocator. See [`MapAlloc`] to
//! see the actual trait implementation.
//!
//! Run it with `RUST_LOG=mapalloc=trace` to follow every request.

use mapalloc::MapAlloc;
use std::thread;

#[global_allocator]
static ALLOCATOR: MapAlloc = MapAlloc::new();

fn main() {
    pretty_env_logger::init();

    // Box example
    let val_box = Box::new(22);
    println!("Box Value: {}, At: {:p}", val_box, val_box);

    // Vec example
    let mut v = Vec::new();
    for i in 0..5 {
        v.push(i * 10);
        println!("Added {}; Capacity: {}; At: {:p}",
            v[i], v.capacity(), v.as_ptr());
    }

    // String example
    let msg = String::from("Heap Testing");
    println!("\nString '{}' - At: {:p}", msg, msg.as_ptr());

    let p1 = Box::new(2.22);
    let addr_p1 = format!("{:p}", p1);
    println!("P1 Allocated at: {}", addr_p1);

    drop(p1);
    println!("P1 Deallocated");

    let p2 = Box::new(2.22);
    let addr_p2 = format!("{:p}", p2);
    println!("P2 at: {}", addr_p2);

    // Over-aligned example
    #[repr(align(4096))]
    struct Page([u8; 4096]);

    let page = Box::new(Page([7; 4096]));
    println!("Page aligned box at {:p} ({} bytes)", page, page.0.len());

    // Thread example test
    let t1 = thread::spawn(|| {
        let _ = Box::new(222);
    });

    let t2 = thread::spawn(|| {
        let _ = Box::new(222);
    });

    t1.join().unwrap();
    t2.join().unwrap();

    let usage = ALLOCATOR.usage();
    println!(
        "{} regions mapped ({} bytes), {} blocks in use",
        usage.regions, usage.mapped_bytes, usage.live_blocks
    );
}
