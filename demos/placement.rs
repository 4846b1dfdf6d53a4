//! Shows where each placement policy puts the same request, given three
//! free blocks of different sizes.

use mapalloc::{Config, MapAlloc, Placement};

fn main() {
    pretty_env_logger::init();

    for placement in [Placement::FirstFit, Placement::BestFit, Placement::WorstFit] {
        let allocator = MapAlloc::with_config(Config::new().with_placement(placement));

        let holes = [1024, 64, 512].map(|size| {
            let hole = allocator.allocate(size).unwrap();
            // Keeps the hole from being the last block in use of its region.
            allocator.allocate(16).unwrap();
            hole
        });
        for hole in holes {
            unsafe { allocator.deallocate(hole.as_ptr()) };
        }

        let ptr = allocator.allocate(40).unwrap();
        let chosen = holes.iter().position(|hole| *hole == ptr);

        println!("== {placement}: 40 bytes went to {ptr:p} (hole {chosen:?})");
        unsafe { allocator.print_memory().unwrap() };
    }
}
