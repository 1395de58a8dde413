use std::sync::Arc;
use std::thread;

use syncmap_rs::SyncMap;

fn main() {
    env_logger::init();

    println!("Creating SyncMap...");
    let map = Arc::new(SyncMap::new());

    println!("Storing values from 4 threads...");
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..4 {
                    map.store(t * 10 + i, format!("thread {} item {}", t, i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let (actual, loaded) = map.load_or_store(0, "late".to_string());
    println!("load_or_store(0) -> {:?} (loaded: {})", actual, loaded);

    map.delete(&11);
    println!("Testing range...");
    map.range(|k, v| {
        println!("  {} -> {}", k, v);
        true
    });

    println!("Done! {} entries", map.len());
}
