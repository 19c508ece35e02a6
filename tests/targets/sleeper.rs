//! Test target: sleeps forever so a test can attach and inject into it.

use std::thread;
use std::time::Duration;

fn main() {
    loop {
        thread::sleep(Duration::from_millis(50));
    }
}
